//! Actions credentials.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;

use k8s_openapi::ByteString;

use crate::error::{AppError, Result};

/// Secret key holding a personal access token.
pub const SECRET_KEY_GITHUB_TOKEN: &str = "github_token";
/// Secret key holding an app ID.
pub const SECRET_KEY_GITHUB_APP_ID: &str = "github_app_id";
/// Secret key holding an app installation ID.
pub const SECRET_KEY_GITHUB_APP_INSTALLATION_ID: &str = "github_app_installation_id";
/// Secret key holding an app's PEM encoded private key.
pub const SECRET_KEY_GITHUB_APP_PRIVATE_KEY: &str = "github_app_private_key";

/// App installation credentials.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AppCredentials {
    pub app_id: i64,
    pub installation_id: i64,
    pub private_key: String,
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Credentials used to authenticate with the Actions service. Exactly one kind is present.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    /// A personal access token.
    Token(String),
    /// App installation credentials.
    App(AppCredentials),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::App(app) => f.debug_tuple("App").field(app).finish(),
        }
    }
}

impl Credentials {
    /// Build credentials from the data of a credentials secret.
    ///
    /// A non-empty `github_token` selects token auth. App auth requires all three app keys to be
    /// non-empty. Providing both, or neither, is an error.
    pub fn from_secret_data(data: &BTreeMap<String, ByteString>) -> Result<Self> {
        if data.is_empty() {
            return Err(AppError::Validation("credentials secret must provide either a token or app credentials".into()));
        }
        let get = |key: &str| -> Result<Option<String>> {
            match data.get(key) {
                Some(value) if !value.0.is_empty() => String::from_utf8(value.0.clone())
                    .map(Some)
                    .map_err(|_| AppError::Validation(format!("credentials secret key {} is not valid utf-8", key))),
                _ => Ok(None),
            }
        };

        let token = get(SECRET_KEY_GITHUB_TOKEN)?;
        let app_id = get(SECRET_KEY_GITHUB_APP_ID)?;
        let installation_id = get(SECRET_KEY_GITHUB_APP_INSTALLATION_ID)?;
        let private_key = get(SECRET_KEY_GITHUB_APP_PRIVATE_KEY)?;

        let app = match (app_id, installation_id, private_key) {
            (Some(app_id), Some(installation_id), Some(private_key)) => Some(AppCredentials {
                app_id: parse_id(SECRET_KEY_GITHUB_APP_ID, &app_id)?,
                installation_id: parse_id(SECRET_KEY_GITHUB_APP_INSTALLATION_ID, &installation_id)?,
                private_key,
            }),
            _ => None,
        };
        Credentials::try_from(ActionsAuth { token, app })
    }
}

fn parse_id(key: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|err| AppError::Validation(format!("credentials secret key {} must be an integer: {}", key, err)))
}

/// Raw credentials input, where either kind may or may not be present.
#[derive(Clone, Debug, Default)]
pub struct ActionsAuth {
    pub token: Option<String>,
    pub app: Option<AppCredentials>,
}

impl ActionsAuth {
    pub fn token(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), app: None }
    }

    pub fn app(app: AppCredentials) -> Self {
        Self { token: None, app: Some(app) }
    }
}

impl From<Credentials> for ActionsAuth {
    fn from(credentials: Credentials) -> Self {
        match credentials {
            Credentials::Token(token) => Self::token(token),
            Credentials::App(app) => Self::app(app),
        }
    }
}

impl TryFrom<ActionsAuth> for Credentials {
    type Error = AppError;

    fn try_from(auth: ActionsAuth) -> Result<Self> {
        let token = auth.token.filter(|token| !token.is_empty());
        match (token, auth.app) {
            (Some(_), Some(_)) => Err(AppError::Validation("cannot use both token and app credentials".into())),
            (Some(token), None) => Ok(Self::Token(token)),
            (None, Some(app)) => Ok(Self::App(app)),
            (None, None) => Err(AppError::Validation("either a token or app credentials must be provided".into())),
        }
    }
}
