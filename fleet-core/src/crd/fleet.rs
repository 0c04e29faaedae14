//! RunnerFleet CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{RequiredMetadata, ANNOTATION_SCALE_SET_ID};
use crate::error::{AppError, Result};
use crate::hash::compute_hash;

pub type RunnerFleet = RunnerFleetCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the RunnerFleet resource.
///
/// A RunnerFleet declares an autoscaled pool of ephemeral runners, registered with the Actions
/// service as a single runner scale set. The operator derives one RunnerSet generation and one
/// FleetListener from it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "RunnerFleetCRD",
    status = "RunnerFleetStatus",
    group = "fleet.rs",
    version = "v1alpha1",
    kind = "RunnerFleet",
    namespaced,
    derive = "PartialEq",
    shortname = "fleet",
    printcolumn = r#"{"name":"Minimum Runners","type":"number","jsonPath":".spec.minRunners"}"#,
    printcolumn = r#"{"name":"Maximum Runners","type":"number","jsonPath":".spec.maxRunners"}"#,
    printcolumn = r#"{"name":"Current Runners","type":"number","jsonPath":".status.currentRunners"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerFleetSpec {
    /// The URL of the repository, organization or enterprise which runners register with.
    pub github_config_url: String,
    /// The name of the secret holding the Actions credentials.
    pub github_config_secret: String,
    /// The runner group to register the scale set in. Uses the default group when omitted.
    #[serde(default)]
    pub runner_group: Option<String>,
    /// The minimum number of runners which the listener keeps around.
    #[serde(default)]
    pub min_runners: Option<i32>,
    /// The maximum number of runners which the listener will scale to.
    #[serde(default)]
    pub max_runners: Option<i32>,
    /// Force an exact image to be used for the listener pod.
    ///
    /// Normally this should not be set, and the operator's configured image is used.
    #[serde(default)]
    pub listener_image: Option<String>,
    /// The pod template used for each runner.
    pub template: PodTemplateSpec,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerFleetStatus {
    /// The number of live runners in the current generation.
    #[serde(default)]
    pub current_runners: i32,
}

/// The fleet fields which a runner set generation is derived from.
#[derive(Serialize)]
struct RunnerSetFields<'a> {
    scale_set_id: i64,
    github_config_url: &'a str,
    github_config_secret: &'a str,
    runner_group: Option<&'a str>,
    template: &'a PodTemplateSpec,
}

/// The fleet fields which a listener is derived from.
#[derive(Serialize)]
struct ListenerFields<'a> {
    scale_set_id: i64,
    github_config_url: &'a str,
    github_config_secret: &'a str,
    runner_group: Option<&'a str>,
    min_runners: Option<i32>,
    max_runners: Option<i32>,
    listener_image: Option<&'a str>,
}

impl RunnerFleet {
    /// Hash of the fields which, when changed, require a new runner set generation.
    ///
    /// Covers the registered scale set ID, so fails if the fleet is not registered.
    pub fn runner_set_spec_hash(&self) -> Result<String> {
        compute_hash(&RunnerSetFields {
            scale_set_id: self.scale_set_id()?,
            github_config_url: &self.spec.github_config_url,
            github_config_secret: &self.spec.github_config_secret,
            runner_group: self.spec.runner_group.as_deref(),
            template: &self.spec.template,
        })
    }

    /// Hash of the fields which, when changed, require the listener to be replaced.
    ///
    /// Covers the registered scale set ID, so fails if the fleet is not registered.
    pub fn listener_spec_hash(&self) -> Result<String> {
        compute_hash(&ListenerFields {
            scale_set_id: self.scale_set_id()?,
            github_config_url: &self.spec.github_config_url,
            github_config_secret: &self.spec.github_config_secret,
            runner_group: self.spec.runner_group.as_deref(),
            min_runners: self.spec.min_runners,
            max_runners: self.spec.max_runners,
            listener_image: self.spec.listener_image.as_deref(),
        })
    }

    /// The registered scale set ID of this fleet.
    ///
    /// Fails if the annotation is missing or is not a valid integer.
    pub fn scale_set_id(&self) -> Result<i64> {
        let raw = self
            .annotation(ANNOTATION_SCALE_SET_ID)
            .ok_or_else(|| AppError::Validation(format!("runner fleet {} has no {} annotation", self.name(), ANNOTATION_SCALE_SET_ID)))?;
        raw.parse::<i64>()
            .map_err(|err| AppError::Validation(format!("invalid {} annotation {:?} on runner fleet {}: {}", ANNOTATION_SCALE_SET_ID, raw, self.name(), err)))
    }

    /// The registered scale set ID of this fleet, only if it is present and positive.
    pub fn registered_scale_set_id(&self) -> Option<i64> {
        self.scale_set_id().ok().filter(|id| *id > 0)
    }

    /// The effective minimum number of runners.
    pub fn min_runners(&self) -> i32 {
        self.spec.min_runners.unwrap_or(0).max(0)
    }

    /// The effective maximum number of runners.
    pub fn max_runners(&self) -> i32 {
        self.spec.max_runners.unwrap_or(i32::MAX)
    }
}
