//! RunnerSet CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::RunnerSpec;

pub type RunnerSet = RunnerSetCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the RunnerSet resource.
///
/// A RunnerSet is one generation of a RunnerFleet. Its replica count is driven by the fleet's
/// listener, and each replica is an ephemeral Runner built from the embedded runner spec.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "RunnerSetCRD",
    status = "RunnerSetStatus",
    group = "fleet.rs",
    version = "v1alpha1",
    kind = "RunnerSet",
    namespaced,
    derive = "PartialEq",
    shortname = "runnerset",
    printcolumn = r#"{"name":"Desired Replicas","type":"number","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current Replicas","type":"number","jsonPath":".status.currentReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetSpec {
    /// The desired number of live runners.
    #[serde(default)]
    pub replicas: i32,
    /// The spec applied to each runner of this set.
    pub runner: RunnerSpec,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetStatus {
    /// The number of live runners observed after the last reconciliation.
    #[serde(default)]
    pub current_replicas: i32,
}

impl RunnerSet {
    /// The current replica count reported in status.
    pub fn current_replicas(&self) -> i32 {
        self.status.as_ref().map(|status| status.current_replicas).unwrap_or(0)
    }
}
