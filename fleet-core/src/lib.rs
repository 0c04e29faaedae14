pub mod actions;
pub mod crd;
pub mod error;
pub mod hash;

pub use error::{AppError, Result};

/// Comma-separated list of canonical label selectors which match the
/// Fleet Operator's labelling scheme.
pub const FLEET_OPERATOR_LABEL_SELECTORS: &str = "app=fleet,fleet.rs/controlled-by=fleet-operator";
