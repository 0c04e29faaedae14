//! The object store seam used by all reconcilers.
//!
//! Reconcilers read and write K8s objects only through `ObjectStore`. In production this is the
//! `KubeStore`, in tests it is an in-memory store.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;

use fleet_core::crd::RequiredMetadata;
use fleet_core::{AppError, Result};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A namespaced object which the operator reads or writes.
pub trait Object: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<K> Object for K where K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Access to the objects of the cluster.
///
/// Every call is a single request. Nothing retries, and dropping the returned future cancels
/// the request.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch the target object, `None` if it does not exist.
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List all objects of a kind in the given namespace.
    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>>;

    /// Create the given object. Objects may use `generateName` in place of a name.
    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete the target object, returning `false` if it did not exist.
    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Apply a JSON merge patch to the target object.
    async fn patch<K: Object>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K>;

    /// Apply a JSON merge patch to the status sub-resource of the target object.
    async fn patch_status<K: Object>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K>;
}

/// An object store backed by the K8s API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Await the given API call, bounded by the API timeout.
async fn bounded<T>(action: impl FnOnce() -> String, fut: impl Future<Output = std::result::Result<T, kube::Error>>) -> Result<T> {
    match timeout(API_TIMEOUT, fut).await {
        Ok(res) => Ok(res?),
        Err(_elapsed) => Err(AppError::Timeout(action())),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api = self.api::<K>(namespace);
        bounded(|| format!("fetching {} {}/{}", K::kind(&()), namespace, name), api.get_opt(name)).await
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>> {
        let api = self.api::<K>(namespace);
        let params = ListParams::default();
        let list = bounded(|| format!("listing {} in {}", K::kind(&()), namespace), api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.as_deref().or(obj.meta().generate_name.as_deref()).unwrap_or_default();
        tracing::info!(kind = %K::kind(&()), namespace, name, "creating object");
        let api = self.api::<K>(namespace);
        let params = PostParams::default();
        bounded(|| format!("creating {} {}/{}", K::kind(&()), namespace, name), api.create(&params, obj)).await
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<bool> {
        tracing::info!(kind = %K::kind(&()), namespace, name, "deleting object");
        let api = self.api::<K>(namespace);
        let params = DeleteParams::background();
        let res = bounded(|| format!("deleting {} {}/{}", K::kind(&()), namespace, name), api.delete(name, &params)).await;
        match res {
            Ok(_val) => Ok(true),
            Err(AppError::Kube(kube::Error::Api(api_err))) if api_err.code == http::StatusCode::NOT_FOUND => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn patch<K: Object>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K> {
        tracing::debug!(kind = %K::kind(&()), namespace, name, "patching object");
        let api = self.api::<K>(namespace);
        let params = PatchParams::default();
        bounded(|| format!("patching {} {}/{}", K::kind(&()), namespace, name), api.patch(name, &params, &Patch::Merge(patch))).await
    }

    async fn patch_status<K: Object>(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K> {
        tracing::debug!(kind = %K::kind(&()), namespace, name, "patching object status");
        let api = self.api::<K>(namespace);
        let params = PatchParams::default();
        bounded(
            || format!("patching status of {} {}/{}", K::kind(&()), namespace, name),
            api.patch_status(name, &params, &Patch::Merge(patch)),
        )
        .await
    }
}

/// Objects of one kind grouped by their controlling owner.
///
/// Built from a fresh list on every reconcile, this is the only way reconcilers navigate from
/// an owner to the objects it owns.
pub struct OwnerIndex<K> {
    objects: Vec<K>,
}

impl<K: Resource> OwnerIndex<K> {
    /// Build an index from the given list.
    pub fn new(objects: Vec<K>) -> Self {
        Self { objects }
    }

    /// All objects controlled by the given owner, sorted by creation time descending. Ties are
    /// broken by name so that ordering is stable.
    pub fn owned_by<O: Resource>(&self, owner: &O) -> Vec<&K> {
        let owner_uid = match owner.meta().uid.as_deref() {
            Some(uid) => uid,
            None => return vec![],
        };
        let mut owned: Vec<&K> = self
            .objects
            .iter()
            .filter(|obj| {
                obj.meta()
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|oref| oref.uid == owner_uid && oref.controller.unwrap_or(false))
            })
            .collect();
        owned.sort_by(|a, b| {
            let (a_ts, b_ts) = (a.meta().creation_timestamp.as_ref().map(|ts| ts.0), b.meta().creation_timestamp.as_ref().map(|ts| ts.0));
            b_ts.cmp(&a_ts).then_with(|| b.name().cmp(a.name()))
        });
        owned
    }
}

/// Build a merge patch setting the finalizers of the given object.
pub fn finalizers_patch(finalizers: Vec<String>) -> serde_json::Value {
    serde_json::json!({ "metadata": { "finalizers": finalizers } })
}

/// The finalizers of the given object with the target finalizer added.
pub fn with_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Vec<String> {
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// The finalizers of the given object with the target finalizer removed.
pub fn without_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Vec<String> {
    obj.meta().finalizers.iter().flatten().filter(|f| f.as_str() != finalizer).cloned().collect()
}

/// Add the finalizer to the given object, if absent. Returns `true` if a patch was issued.
pub async fn ensure_finalizer<K: Object, S: ObjectStore>(store: &S, obj: &K, finalizer: &str) -> Result<bool> {
    if obj.has_finalizer(finalizer) {
        return Ok(false);
    }
    tracing::debug!(name = obj.name(), finalizer, "adding finalizer");
    store
        .patch::<K>(obj.namespace(), obj.name(), &finalizers_patch(with_finalizer(obj, finalizer)))
        .await?;
    Ok(true)
}

/// Remove the finalizer from the given object, if present. A not-found is treated as success.
pub async fn remove_finalizer<K: Object, S: ObjectStore>(store: &S, obj: &K, finalizer: &str) -> Result<()> {
    if !obj.has_finalizer(finalizer) {
        return Ok(());
    }
    tracing::debug!(name = obj.name(), finalizer, "removing finalizer");
    match store
        .patch::<K>(obj.namespace(), obj.name(), &finalizers_patch(without_finalizer(obj, finalizer)))
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}
