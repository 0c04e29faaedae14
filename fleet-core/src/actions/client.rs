//! HTTP client for the Actions service.
//!
//! Calls are made with an admin session obtained by exchanging a registration token, which is
//! itself obtained with the client's credentials. Sessions are cached in a `SessionSlot` owned
//! by the multiplexer entry which this client belongs to, so that refreshes of one client are
//! serialized without blocking any other client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::actions::{ActionsService, AppCredentials, Credentials, JitRunnerConfig, JitRunnerSetting, RunnerGroup, RunnerScaleSet};
use crate::error::{AppError, Result};

const API_VERSION: &str = "6.0-preview";
const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long an admin session is used before it is refreshed.
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
/// App JWTs may live at most 10 minutes.
const APP_JWT_TTL_SECS: i64 = 9 * 60;

/// A slot holding the cached admin session of a client.
pub type SessionSlot = Arc<Mutex<Option<AdminSession>>>;

/// An admin session with the Actions service.
#[derive(Clone)]
pub struct AdminSession {
    url: String,
    token: String,
    expires_at: Instant,
}

impl AdminSession {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// The scope named by a configure URL.
#[derive(Clone, Debug, PartialEq)]
enum ConfigScope {
    Enterprise(String),
    Organization(String),
    Repository(String, String),
}

/// A parsed configure URL.
#[derive(Clone, Debug)]
struct ConfigUrl {
    url: Url,
    scope: ConfigScope,
    hosted: bool,
}

impl ConfigUrl {
    fn parse(url: &Url) -> Result<Self> {
        let segments: Vec<&str> = url.path_segments().map(|segments| segments.filter(|s| !s.is_empty()).collect()).unwrap_or_default();
        let scope = match segments.as_slice() {
            ["enterprises", enterprise] => ConfigScope::Enterprise(enterprise.to_string()),
            [org] => ConfigScope::Organization(org.to_string()),
            [owner, repo] => ConfigScope::Repository(owner.to_string(), repo.to_string()),
            _ => return Err(AppError::Config(format!("{} is not a repository, organization or enterprise url", url))),
        };
        let host = url.host_str().unwrap_or_default();
        let hosted = matches!(host, "github.com" | "www.github.com" | "github.localhost") || host.ends_with(".ghe.com");
        Ok(Self { url: url.clone(), scope, hosted })
    }

    /// The base URL of the REST API serving this configure URL.
    fn api_url(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port().map(|port| format!(":{}", port)).unwrap_or_default();
        if self.hosted {
            format!("{}://api.{}{}", self.url.scheme(), host.trim_start_matches("www."), port)
        } else {
            format!("{}://{}{}/api/v3", self.url.scheme(), host, port)
        }
    }

    fn registration_token_url(&self) -> String {
        let path = match &self.scope {
            ConfigScope::Enterprise(enterprise) => format!("enterprises/{}", enterprise),
            ConfigScope::Organization(org) => format!("orgs/{}", org),
            ConfigScope::Repository(owner, repo) => format!("repos/{}/{}", owner, repo),
        };
        format!("{}/{}/actions/runners/registration-token", self.api_url(), path)
    }
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
struct RegistrationRequest<'a> {
    url: &'a str,
    runner_event: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    url: String,
    token: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    #[serde(default)]
    count: i64,
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

/// A client of the Actions service bound to one configure URL and one set of credentials.
pub struct ActionsClient {
    http: reqwest::Client,
    config: ConfigUrl,
    credentials: Credentials,
    session: SessionSlot,
}

impl ActionsClient {
    /// Create a new instance.
    pub fn new(config_url: &Url, credentials: Credentials, user_agent: &str, session: SessionSlot) -> Result<Self> {
        let config = ConfigUrl::parse(config_url)?;
        let http = reqwest::Client::builder().user_agent(user_agent).timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http, config, credentials, session })
    }

    /// Get the current admin session, refreshing it if needed.
    async fn admin_session(&self) -> Result<AdminSession> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref().filter(|session| !session.is_expired()) {
            return Ok(session.clone());
        }
        tracing::debug!(url = %self.config.url, "refreshing actions admin session");
        let registration_token = self.registration_token().await?;
        let session = self.register(&registration_token).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn access_token(&self) -> Result<String> {
        match &self.credentials {
            Credentials::Token(token) => Ok(token.clone()),
            Credentials::App(app) => self.installation_token(app).await,
        }
    }

    async fn installation_token(&self, app: &AppCredentials) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims { iat: now - 60, exp: now + APP_JWT_TTL_SECS, iss: app.app_id.to_string() };
        let key = EncodingKey::from_rsa_pem(app.private_key.as_bytes())?;
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let url = format!("{}/app/installations/{}/access_tokens", self.config.api_url(), app.installation_id);
        let resp = self.http.post(url).bearer_auth(jwt).header(ACCEPT, GITHUB_ACCEPT).send().await?;
        let token: TokenResponse = decode(resp).await?;
        Ok(token.token)
    }

    async fn registration_token(&self) -> Result<String> {
        let access_token = self.access_token().await?;
        let resp = self
            .http
            .post(self.config.registration_token_url())
            .bearer_auth(access_token)
            .header(ACCEPT, GITHUB_ACCEPT)
            .send()
            .await?;
        let token: TokenResponse = decode(resp).await?;
        Ok(token.token)
    }

    async fn register(&self, registration_token: &str) -> Result<AdminSession> {
        let url = format!("{}/actions/runner-registration", self.config.api_url());
        let body = RegistrationRequest { url: self.config.url.as_str(), runner_event: "register" };
        let resp = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("RemoteAuth {}", registration_token))
            .json(&body)
            .send()
            .await?;
        let session: SessionResponse = decode(resp).await?;
        Ok(AdminSession {
            url: session.url.trim_end_matches('/').to_string(),
            token: session.token,
            expires_at: Instant::now() + SESSION_TTL,
        })
    }
}

#[async_trait]
impl ActionsService for ActionsClient {
    async fn get_runner_scale_set(&self, runner_group_id: i64, name: &str) -> Result<Option<RunnerScaleSet>> {
        let session = self.admin_session().await?;
        let group_id = runner_group_id.to_string();
        let resp = self
            .http
            .get(format!("{}/_apis/runtime/runnerscalesets", session.url))
            .bearer_auth(&session.token)
            .query(&[("runnerGroupId", group_id.as_str()), ("name", name), ("api-version", API_VERSION)])
            .send()
            .await?;
        let list: ListResponse<RunnerScaleSet> = decode(resp).await?;
        match list.count {
            0 => Ok(None),
            1 => Ok(list.value.into_iter().next()),
            count => Err(AppError::Validation(format!("found {} runner scale sets named {}", count, name))),
        }
    }

    async fn create_runner_scale_set(&self, scale_set: &RunnerScaleSet) -> Result<RunnerScaleSet> {
        let session = self.admin_session().await?;
        let resp = self
            .http
            .post(format!("{}/_apis/runtime/runnerscalesets", session.url))
            .bearer_auth(&session.token)
            .query(&[("api-version", API_VERSION)])
            .json(scale_set)
            .send()
            .await?;
        decode(resp).await
    }

    async fn get_runner_group_by_name(&self, name: &str) -> Result<RunnerGroup> {
        let session = self.admin_session().await?;
        let resp = self
            .http
            .get(format!("{}/_apis/runtime/runnergroups/", session.url))
            .bearer_auth(&session.token)
            .query(&[("groupName", name), ("api-version", API_VERSION)])
            .send()
            .await?;
        let list: ListResponse<RunnerGroup> = decode(resp).await?;
        match list.count {
            0 => Err(AppError::NotFound(format!("runner group {}", name))),
            1 => list.value.into_iter().next().ok_or_else(|| AppError::NotFound(format!("runner group {}", name))),
            count => Err(AppError::Validation(format!("found {} runner groups named {}", count, name))),
        }
    }

    async fn generate_jit_runner_config(&self, setting: &JitRunnerSetting, scale_set_id: i64) -> Result<JitRunnerConfig> {
        let session = self.admin_session().await?;
        let resp = self
            .http
            .post(format!("{}/_apis/runtime/runnerscalesets/{}/generatejitconfig", session.url, scale_set_id))
            .bearer_auth(&session.token)
            .query(&[("api-version", API_VERSION)])
            .json(setting)
            .send()
            .await?;
        decode(resp).await
    }

    async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        let session = self.admin_session().await?;
        let resp = self
            .http
            .delete(format!("{}/_apis/distributedtask/pools/0/agents/{}", session.url, runner_id))
            .bearer_auth(&session.token)
            .query(&[("api-version", API_VERSION)])
            .send()
            .await?;
        match check_status(resp).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

/// Map a non-success response onto an error.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(AppError::Actions { status: status.as_u16(), message })
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let resp = check_status(resp).await?;
    Ok(resp.json::<T>().await?)
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(url: &str) -> ConfigUrl {
        let url = Url::parse(url).unwrap();
        ConfigUrl::parse(&url).unwrap()
    }

    #[test]
    fn config_url_scopes_are_parsed() {
        let repo = config("https://github.com/owner/repo");
        assert_eq!(repo.scope, ConfigScope::Repository("owner".into(), "repo".into()));
        assert_eq!(repo.registration_token_url(), "https://api.github.com/repos/owner/repo/actions/runners/registration-token");

        let org = config("https://github.com/org/");
        assert_eq!(org.scope, ConfigScope::Organization("org".into()));
        assert_eq!(org.registration_token_url(), "https://api.github.com/orgs/org/actions/runners/registration-token");

        let enterprise = config("https://ghes.example.com/enterprises/acme");
        assert_eq!(enterprise.scope, ConfigScope::Enterprise("acme".into()));
        assert_eq!(
            enterprise.registration_token_url(),
            "https://ghes.example.com/api/v3/enterprises/acme/actions/runners/registration-token"
        );
    }

    #[test]
    fn config_url_without_scope_is_rejected() {
        for raw in ["https://github.com", "https://github.com/a/b/c"] {
            let url = Url::parse(raw).unwrap();
            let err = ConfigUrl::parse(&url).unwrap_err();
            assert!(matches!(err, AppError::Config(_)), "expected config error for {}, got {:?}", raw, err);
        }
    }
}
