//! Runner CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::fmt;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type Runner = RunnerCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Runner resource.
///
/// A Runner is a single-use worker. It is registered with the Actions service just in time,
/// executes at most one job, and is then deleted.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    root = "RunnerCRD",
    status = "RunnerStatus",
    group = "fleet.rs",
    version = "v1alpha1",
    kind = "Runner",
    namespaced,
    derive = "PartialEq",
    shortname = "runner",
    printcolumn = r#"{"name":"Runner Id","type":"number","jsonPath":".status.runnerId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Job Request","type":"number","jsonPath":".status.jobRequestId"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    /// The scale set which this runner registers into.
    pub scale_set_id: i64,
    /// The URL of the repository, organization or enterprise which this runner registers with.
    pub github_config_url: String,
    /// The name of the secret holding the Actions credentials.
    pub github_config_secret: String,
    /// The pod template used for this runner's pod.
    pub template: PodTemplateSpec,
}

/// The lifecycle phase of a runner.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum RunnerPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Default for RunnerPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl RunnerPhase {
    /// Map a pod phase onto a runner phase. Unknown phases map to `None`.
    pub fn from_pod_phase(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    #[serde(default)]
    pub phase: Option<RunnerPhase>,
    #[serde(default)]
    pub ready: bool,
    /// The ID assigned by the Actions service on registration. Zero until registered.
    #[serde(default)]
    pub runner_id: i64,
    #[serde(default)]
    pub runner_name: Option<String>,
    /// The job currently assigned to this runner. Zero when idle.
    #[serde(default)]
    pub job_request_id: i64,
    /// The encoded just-in-time configuration handed to the runner pod.
    #[serde(default)]
    pub runner_jit_config: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Runner {
    pub fn phase(&self) -> RunnerPhase {
        self.status.as_ref().and_then(|status| status.phase).unwrap_or_default()
    }

    pub fn runner_id(&self) -> i64 {
        self.status.as_ref().map(|status| status.runner_id).unwrap_or(0)
    }

    pub fn job_request_id(&self) -> i64 {
        self.status.as_ref().map(|status| status.job_request_id).unwrap_or(0)
    }

    pub fn jit_config(&self) -> Option<&str> {
        self.status.as_ref().and_then(|status| status.runner_jit_config.as_deref())
    }

    /// Check if this runner has been assigned a job.
    pub fn is_busy(&self) -> bool {
        self.job_request_id() != 0
    }

    /// Check if this runner has finished its one job.
    pub fn is_finished(&self) -> bool {
        self.phase() == RunnerPhase::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == RunnerPhase::Failed
    }
}
