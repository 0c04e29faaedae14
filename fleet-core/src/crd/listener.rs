//! FleetListener CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type FleetListener = FleetListenerCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the FleetListener resource.
///
/// A FleetListener lives in the operator's namespace. It describes the long-lived pod which
/// polls the Actions service for job demand and patches the replica count of its RunnerSet.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "FleetListenerCRD",
    group = "fleet.rs",
    version = "v1alpha1",
    kind = "FleetListener",
    namespaced,
    derive = "PartialEq",
    shortname = "listener",
    printcolumn = r#"{"name":"Fleet Namespace","type":"string","jsonPath":".spec.fleetNamespace"}"#,
    printcolumn = r#"{"name":"Fleet","type":"string","jsonPath":".spec.fleetName"}"#,
    printcolumn = r#"{"name":"Runner Set","type":"string","jsonPath":".spec.runnerSetName"}"#,
    printcolumn = r#"{"name":"Scale Set Id","type":"number","jsonPath":".spec.scaleSetId"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetListenerSpec {
    pub github_config_url: String,
    /// The name of the credentials secret, living in the fleet's namespace.
    pub github_config_secret: String,
    pub scale_set_id: i64,
    /// The namespace of the owning RunnerFleet.
    pub fleet_namespace: String,
    /// The name of the owning RunnerFleet.
    pub fleet_name: String,
    /// The name of the RunnerSet which this listener scales.
    pub runner_set_name: String,
    pub min_runners: i32,
    pub max_runners: i32,
    /// The image of the listener pod.
    pub image: String,
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}
