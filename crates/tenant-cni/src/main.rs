//! tenantcni
//!
//! CNI plugin binary. `cni_plugin::Cni::load` decodes the invocation and the
//! network configuration; the result, or a CNI error reply, goes to stdout.
//! Logs go to a file because stdout belongs to the runtime.

use cni_plugin::reply::reply;
use cni_plugin::Cni;
use net_backend::NetlinkBackend;
use semver::Version;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tenant_cni::reply::{error_reply, success_reply, version_reply};
use tenant_cni::{CniError, Invocation, Plugin, PluginSettings, ResolvePolicy};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "/var/log/tenantcni.log";

#[derive(Debug, Clone, Copy)]
enum Command {
    Add,
    Del,
    Check,
}

fn init_logging(settings: &PluginSettings) {
    let filter = EnvFilter::try_from_env("TENANTCNI_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let path: PathBuf = std::env::var("TENANTCNI_LOG_FILE")
        .ok()
        .map(Into::into)
        .or_else(|| settings.log_file.clone())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.into());

    // stdout is reserved for the reply; stderr reaches the runtime's logs.
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(false);
    let installed = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => builder.with_writer(Mutex::new(file)).try_init(),
        Err(e) => {
            eprintln!("tenantcni: cannot open log file {}: {e}, logging to stderr", path.display());
            builder.with_writer(std::io::stderr).try_init()
        }
    };
    if let Err(e) = installed {
        eprintln!("tenantcni: cannot install log subscriber: {e}");
    }
}

async fn run(command: Command, invocation: &Invocation, settings: &PluginSettings, cni_version: &Version) -> Result<Option<cni_plugin::reply::SuccessReply>, CniError> {
    let backend = NetlinkBackend::connect()?;
    let mut resolve = ResolvePolicy::default();
    if let Some(attempts) = settings.resolve_attempts {
        resolve.attempts = attempts;
    }
    let plugin = Plugin::new(settings.store_config(), &backend)
        .with_resolve_policy(resolve)
        .with_mtu(settings.mtu);

    match command {
        Command::Add => {
            let attachment = plugin.add(invocation).await?;
            Ok(Some(success_reply(cni_version, &attachment)?))
        }
        Command::Del => {
            plugin.del(invocation).await?;
            Ok(None)
        }
        Command::Check => {
            plugin.check(invocation).await?;
            Ok(None)
        }
    }
}

fn execute(command: Command, invocation: &Invocation, settings: &PluginSettings, cni_version: &Version) -> Result<Option<cni_plugin::reply::SuccessReply>, CniError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(command, invocation, settings, cni_version))
}

fn main() {
    let cni_args = std::env::var("CNI_ARGS").ok();
    let cni_args = cni_args.as_deref();
    let (command, invocation, config) = match Cni::load() {
        Cni::Version(version) => reply(version_reply(version)),
        Cni::Add { container_id, ifname, netns, config, .. } => (
            Command::Add,
            Invocation::new(container_id, Some(&netns), ifname, cni_args),
            config,
        ),
        Cni::Del { container_id, ifname, netns, config, .. } => (
            Command::Del,
            Invocation::new(container_id, netns.as_deref(), ifname, cni_args),
            config,
        ),
        Cni::Check { container_id, ifname, netns, config, .. } => (
            Command::Check,
            Invocation::new(container_id, Some(&netns), ifname, cni_args),
            config,
        ),
    };
    let cni_version = config.cni_version.clone();

    let settings = match PluginSettings::from_config(&config) {
        Ok(settings) => settings,
        Err(e) => {
            init_logging(&PluginSettings::default());
            error!("Invalid network configuration: {}", e);
            reply(error_reply(cni_version, &e))
        }
    };
    init_logging(&settings);
    info!("{:?} container {} netns {}", command, invocation.container_id, invocation.netns);

    match execute(command, &invocation, &settings, &cni_version) {
        Ok(Some(result)) => reply(result),
        // DEL and CHECK reply with nothing but a zero exit status.
        Ok(None) => {}
        Err(e) => {
            error!("{:?} failed: {}", command, e);
            reply(error_reply(cni_version, &e))
        }
    }
}
