//! Runtime configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,

    /// The Kubernetes namespace of the operator, where all listeners live.
    pub namespace: String,

    /// The default image used for listener pods.
    pub listener_image: String,
    /// Image pull secrets attached to listener pods, as a comma separated list.
    #[serde(default, deserialize_with = "Config::parse_list")]
    pub listener_image_pull_secrets: Vec<String>,

    /// The user agent sent to the Actions service.
    #[serde(default = "Config::default_user_agent")]
    pub user_agent: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_user_agent() -> String {
        format!("fleet-operator/{}", env!("CARGO_PKG_VERSION"))
    }

    /// Parse a comma separated list, dropping empty items.
    fn parse_list<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<String>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        Ok(raw.split(',').map(str::trim).filter(|item| !item.is_empty()).map(String::from).collect())
    }
}

#[cfg(test)]
impl Config {
    /// Create a config instance for use in tests.
    pub fn new_test() -> Self {
        Self {
            rust_log: "debug".into(),
            namespace: "fleet-system".into(),
            listener_image: "ghcr.io/fleet/listener:latest".into(),
            listener_image_pull_secrets: vec!["registry-creds".into()],
            user_agent: Self::default_user_agent(),
        }
    }
}
