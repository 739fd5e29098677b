//! Network namespace entry
//!
//! A netlink socket talks to the namespace of the thread that opened it, and
//! `setns` moves the calling thread for good. Work inside a pod namespace
//! therefore runs on a dedicated thread with its own runtime and connection.

use crate::error::BackendError;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use rtnetlink::Handle;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::Path;
use tracing::debug;

/// Opens the namespace file at `netns`.
pub(crate) fn open_netns(netns: &Path) -> Result<OwnedFd, BackendError> {
    nix::fcntl::open(netns, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()).map_err(|e| {
        BackendError::Namespace {
            netns: netns.display().to_string(),
            reason: format!("open failed: {e}"),
        }
    })
}

/// Runs `exec` with a netlink handle bound to the namespace at `netns`.
pub(crate) async fn in_netns<Exec, Fut, Out>(netns: &Path, exec: Exec) -> Result<Out, BackendError>
where
    Exec: FnOnce(Handle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Out, BackendError>>,
    Out: Send + 'static,
{
    let path = netns.to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("netns-worker".to_string())
        .spawn(move || {
            // The caller may have stopped waiting.
            let _ = tx.send(run_in_netns(&path, exec));
        })?;

    rx.await.map_err(|e| BackendError::Namespace {
        netns: netns.display().to_string(),
        reason: format!("worker exited without a result: {e}"),
    })?
}

fn run_in_netns<Exec, Fut, Out>(netns: &Path, exec: Exec) -> Result<Out, BackendError>
where
    Exec: FnOnce(Handle) -> Fut,
    Fut: Future<Output = Result<Out, BackendError>>,
{
    let fd = open_netns(netns)?;
    nix::sched::setns(&fd, CloneFlags::CLONE_NEWNET).map_err(|e| BackendError::Namespace {
        netns: netns.display().to_string(),
        reason: format!("setns failed: {e}"),
    })?;
    debug!("Entered network namespace {}", netns.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(async move {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        exec(handle).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_namespace_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("cni-gone");

        let err = in_netns(&missing, |_handle| async { Ok(()) }).await.unwrap_err();

        match err {
            BackendError::Namespace { netns, reason } => {
                assert_eq!(netns, missing.display().to_string());
                assert!(reason.starts_with("open failed"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
