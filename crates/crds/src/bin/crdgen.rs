//! Prints the CustomResourceDefinitions as a multi-document YAML stream.

use crds::{BGPAdvertisement, BGPPeer, IPAddressPool};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        IPAddressPool::crd(),
        BGPAdvertisement::crd(),
        BGPPeer::crd(),
    ];
    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
