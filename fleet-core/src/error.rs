//! Fleet error abstractions.

use thiserror::Error;

/// Convenience result type used throughout the fleet crates.
pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was malformed, contradictory or missing.
    #[error("validation error: {0}")]
    Validation(String),
    /// A configuration value, such as an endpoint URL, could not be used.
    #[error("configuration error: {0}")]
    Config(String),
    /// A required resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// An error from the K8s API.
    #[error("k8s api error: {0}")]
    Kube(#[from] kube::Error),
    /// The Actions service responded with a non-success status.
    #[error("actions service returned status {status}: {message}")]
    Actions { status: u16, message: String },
    /// An HTTP transport error while talking to the Actions service.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// An error signing an app credential JWT.
    #[error("error signing app jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    /// An error (de)serializing an object.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// An external call did not complete in time.
    #[error("timeout while {0}")]
    Timeout(String),
}

impl AppError {
    /// Check if this error indicates that the target object does not exist.
    ///
    /// Cleanup paths treat this as success, required lookups never see it as they work with
    /// `Option`s instead.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Self::Actions { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Check if this error is the result of bad input, which will not resolve by retrying.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Config(_))
    }
}
