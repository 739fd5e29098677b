//! Prints the Tenant CRD manifest as YAML.

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&crds::Tenant::crd())?);
    Ok(())
}
