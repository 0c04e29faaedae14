//! Actions client multiplexer.
//!
//! Reconcilers never construct Actions clients themselves. They ask the multiplexer for a client
//! matching an endpoint, a namespace and a set of credentials, and receive a shared instance.
//! Equal keys always yield the same instance for the lifetime of the multiplexer.

use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use tokio::sync::Mutex;
use url::Url;

use crate::actions::{ActionsAuth, ActionsClient, ActionsService, Credentials, SessionSlot};
use crate::error::{AppError, Result};

/// A source of shared Actions clients.
#[async_trait]
pub trait MultiClient: Send + Sync {
    /// Get the client for the given endpoint, namespace and credentials.
    async fn client_for(&self, endpoint: &str, namespace: &str, auth: ActionsAuth) -> Result<Arc<dyn ActionsService>>;

    /// Get the client for the given endpoint and namespace, with credentials taken from the data
    /// of a credentials secret.
    async fn client_from_secret(&self, endpoint: &str, namespace: &str, data: &BTreeMap<String, ByteString>) -> Result<Arc<dyn ActionsService>> {
        let credentials = Credentials::from_secret_data(data)?;
        self.client_for(endpoint, namespace, credentials.into()).await
    }
}

/// The identity of a cached client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// The normalized endpoint URL.
    pub endpoint: String,
    pub namespace: String,
    pub credentials: Credentials,
}

/// A builder of new Actions clients.
pub trait ClientFactory: Send + Sync {
    /// Build a client for the given endpoint and credentials.
    ///
    /// The given session slot is owned by the cache entry and outlives the client's callers.
    fn build(&self, endpoint: &Url, credentials: &Credentials, session: SessionSlot) -> Result<Arc<dyn ActionsService>>;
}

/// A factory of HTTP backed Actions clients.
pub struct HttpClientFactory {
    user_agent: String,
}

impl HttpClientFactory {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self { user_agent: user_agent.into() }
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, endpoint: &Url, credentials: &Credentials, session: SessionSlot) -> Result<Arc<dyn ActionsService>> {
        let client = ActionsClient::new(endpoint, credentials.clone(), &self.user_agent, session)?;
        Ok(Arc::new(client))
    }
}

/// A cache entry.
struct CachedClient {
    client: Arc<dyn ActionsService>,
    /// Held for the lifetime of the entry, as the client's refresh lock.
    _session: SessionSlot,
}

/// A multiplexer of shared Actions clients.
///
/// The whole map is locked while a lookup or construction is in progress, so concurrent
/// requests for the same key never construct two clients. Construction does no I/O.
pub struct ActionsMultiClient {
    clients: Mutex<HashMap<ClientKey, CachedClient>>,
    factory: Box<dyn ClientFactory>,
}

impl ActionsMultiClient {
    /// Create a new instance building HTTP clients which identify with the given user agent.
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self::with_factory(HttpClientFactory::new(user_agent))
    }

    /// Create a new instance using the given client factory.
    pub fn with_factory(factory: impl ClientFactory + 'static) -> Self {
        Self { clients: Mutex::new(HashMap::new()), factory: Box::new(factory) }
    }

    /// The number of cached clients.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MultiClient for ActionsMultiClient {
    #[tracing::instrument(level = "debug", skip(self, auth))]
    async fn client_for(&self, endpoint: &str, namespace: &str, auth: ActionsAuth) -> Result<Arc<dyn ActionsService>> {
        let url = Url::parse(endpoint).map_err(|err| AppError::Config(format!("invalid configure url {:?}: {}", endpoint, err)))?;
        let credentials = Credentials::try_from(auth)?;
        let key = ClientKey { endpoint: url.to_string(), namespace: namespace.to_string(), credentials };

        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(&key) {
            tracing::debug!("using cached actions client");
            return Ok(cached.client.clone());
        }

        let session = SessionSlot::default();
        let client = self.factory.build(&url, &key.credentials, session.clone())?;
        clients.insert(key, CachedClient { client: client.clone(), _session: session });
        tracing::info!(endpoint = %url, namespace, "created new actions client");
        Ok(client)
    }
}
