//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster. Output is written to stdout as a multi-document yaml
//! stream, e.g. `cargo run --example crd > crds.yaml`.

use anyhow::{Context, Result};
use fleet_core::crd::{FleetListener, Runner, RunnerFleet, RunnerSet};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds = vec![
        ("RunnerFleet", RunnerFleet::crd()),
        ("RunnerSet", RunnerSet::crd()),
        ("Runner", Runner::crd()),
        ("FleetListener", FleetListener::crd()),
    ];
    for (kind, crd) in crds {
        let yaml = serde_yaml::to_string(&crd).with_context(|| format!("error serializing {} CRD to yaml", kind))?;
        println!("{}", yaml.trim_end());
    }
    Ok(())
}
