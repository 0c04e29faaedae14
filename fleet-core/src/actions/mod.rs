//! Actions service abstractions.
//!
//! The operator talks to the Actions service for scale set registration and for minting
//! just-in-time runner configs. All calls go through the `ActionsService` trait, instances of
//! which are handed out by a `MultiClient` keyed on endpoint, namespace and credentials.

mod auth;
mod client;
mod multi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use auth::{
    ActionsAuth, AppCredentials, Credentials, SECRET_KEY_GITHUB_APP_ID, SECRET_KEY_GITHUB_APP_INSTALLATION_ID, SECRET_KEY_GITHUB_APP_PRIVATE_KEY,
    SECRET_KEY_GITHUB_TOKEN,
};
pub use client::{ActionsClient, AdminSession, SessionSlot};
pub use multi::{ActionsMultiClient, ClientFactory, ClientKey, HttpClientFactory, MultiClient};

/// The label type assigned to the labels of scale sets created by the operator.
pub const LABEL_TYPE_SYSTEM: &str = "System";
/// The name of the runner group used when a fleet does not name one.
pub const DEFAULT_RUNNER_GROUP: &str = "Default";
/// The ID of the default runner group.
pub const DEFAULT_RUNNER_GROUP_ID: i64 = 1;

/// A runner scale set, as registered with the Actions service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSet {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub runner_group_id: i64,
    #[serde(default)]
    pub runner_group_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub runner_setting: RunnerSetting,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Label {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetting {
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub disable_update: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerGroup {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Settings sent when minting a just-in-time runner config.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JitRunnerSetting {
    pub name: String,
    pub work_folder: String,
}

/// A just-in-time runner config minted by the Actions service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct JitRunnerConfig {
    #[serde(rename = "encodedJITConfig")]
    pub encoded_jit_config: String,
    pub runner: RunnerReference,
}

/// A registered runner.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReference {
    pub id: i64,
    pub name: String,
}

/// Operations offered by the Actions service.
#[async_trait]
pub trait ActionsService: Send + Sync {
    /// Look up a scale set by name within the given runner group. `None` if it does not exist.
    async fn get_runner_scale_set(&self, runner_group_id: i64, name: &str) -> Result<Option<RunnerScaleSet>>;

    /// Register a new scale set.
    async fn create_runner_scale_set(&self, scale_set: &RunnerScaleSet) -> Result<RunnerScaleSet>;

    /// Look up a runner group by name.
    async fn get_runner_group_by_name(&self, name: &str) -> Result<RunnerGroup>;

    /// Mint a just-in-time config registering a new runner into the given scale set.
    async fn generate_jit_runner_config(&self, setting: &JitRunnerSetting, scale_set_id: i64) -> Result<JitRunnerConfig>;

    /// Remove a registered runner. Removing an unknown runner succeeds.
    async fn remove_runner(&self, runner_id: i64) -> Result<()>;
}
