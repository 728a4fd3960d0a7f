use arlon::types::{Cluster, Profile};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Cluster::crd())?);
    print!("{}", serde_yaml::to_string(&Profile::crd())?);
    Ok(())
}
