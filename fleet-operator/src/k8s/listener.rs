//! FleetListener reconciliation.
//!
//! Materializes the listener pod and its supporting objects: a service account, a mirror of
//! the fleet's config secret, and a role with its binding in the fleet's namespace. The role
//! and binding can not be owned by the listener across namespaces, so teardown deletes them
//! explicitly.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::Action;
use serde_json::json;

use crate::k8s::builder;
use crate::k8s::store::{ensure_finalizer, remove_finalizer, ObjectStore};
use crate::k8s::Context;
use fleet_core::crd::{
    FleetListener, RequiredMetadata, FINALIZER_LISTENER, LABEL_ROLE_REF_HASH, LABEL_ROLE_RULES_HASH, LABEL_ROLE_SUBJECTS_HASH, LABEL_SECRET_DATA_HASH,
};
use fleet_core::{AppError, Result};

/// The interval at which a converged listener is re-checked, picking up config secret changes.
const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Reconcile the given FleetListener.
#[tracing::instrument(level = "debug", skip(listener, ctx), fields(namespace = listener.namespace(), name = listener.name()))]
pub async fn reconcile<S: ObjectStore>(listener: Arc<FleetListener>, ctx: Arc<Context<S>>) -> Result<Action> {
    if listener.is_deleting() {
        return reconcile_deletion(&listener, &ctx.store).await;
    }
    let store = &ctx.store;
    if ensure_finalizer(store, listener.as_ref(), FINALIZER_LISTENER).await? {
        return Ok(Action::await_change());
    }

    let (namespace, name) = (listener.namespace(), listener.name());
    if store.get::<ServiceAccount>(namespace, name).await?.is_none() {
        tracing::debug!("creating listener service account");
        store.create(namespace, &builder::new_listener_service_account(&listener)).await?;
    }

    let mirror = match reconcile_secret_mirror(&listener, store).await? {
        Some(mirror) => mirror,
        None => return Ok(Action::await_change()),
    };
    reconcile_role(&listener, store).await?;
    if !reconcile_role_binding(&listener, store).await? {
        return Ok(Action::await_change());
    }
    reconcile_pod(&listener, &mirror, store).await?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Ensure the secret mirror exists and matches the config secret.
///
/// On drift, the mirror is patched and the pod is deleted so that it restarts with the new
/// credentials. Returns `None` in that case.
async fn reconcile_secret_mirror<S: ObjectStore>(listener: &FleetListener, store: &S) -> Result<Option<Secret>> {
    let spec = &listener.spec;
    let config_secret = store
        .get::<Secret>(&spec.fleet_namespace, &spec.github_config_secret)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("config secret {}/{}", spec.fleet_namespace, spec.github_config_secret)))?;
    let desired = builder::new_listener_secret_mirror(listener, &config_secret)?;
    let desired_hash = desired.label(LABEL_SECRET_DATA_HASH).unwrap_or_default();

    let mirror = match store.get::<Secret>(listener.namespace(), listener.name()).await? {
        Some(mirror) => mirror,
        None => {
            tracing::debug!("creating listener secret mirror");
            return store.create(listener.namespace(), &desired).await.map(Some);
        }
    };
    if mirror.label(LABEL_SECRET_DATA_HASH) == Some(desired_hash) {
        return Ok(Some(mirror));
    }

    tracing::info!("config secret changed, updating listener secret mirror");
    let desired_data = desired.data.clone().unwrap_or_default();
    let mut data = serde_json::Map::new();
    for key in mirror.data.iter().flatten().map(|(key, _)| key) {
        if !desired_data.contains_key(key) {
            data.insert(key.clone(), serde_json::Value::Null);
        }
    }
    for (key, value) in desired_data {
        data.insert(key, serde_json::to_value(value)?);
    }
    let patch = json!({
        "metadata": { "labels": { LABEL_SECRET_DATA_HASH: desired_hash } },
        "data": data,
    });
    store.patch::<Secret>(listener.namespace(), listener.name(), &patch).await?;
    store.delete::<Pod>(listener.namespace(), listener.name()).await?;
    Ok(None)
}

/// Ensure the listener role exists with the desired rules, patching them in place on drift.
async fn reconcile_role<S: ObjectStore>(listener: &FleetListener, store: &S) -> Result<()> {
    let desired = builder::new_listener_role(listener)?;
    let namespace = listener.spec.fleet_namespace.as_str();
    match store.get::<Role>(namespace, listener.name()).await? {
        None => {
            tracing::debug!("creating listener role");
            store.create(namespace, &desired).await?;
        }
        Some(role) if role.label(LABEL_ROLE_RULES_HASH) != desired.label(LABEL_ROLE_RULES_HASH) => {
            tracing::info!("listener role rules drifted, patching");
            let patch = json!({
                "metadata": { "labels": { LABEL_ROLE_RULES_HASH: desired.label(LABEL_ROLE_RULES_HASH) } },
                "rules": desired.rules,
            });
            store.patch::<Role>(namespace, listener.name(), &patch).await?;
        }
        Some(_) => (),
    }
    Ok(())
}

/// Ensure the listener role binding exists and is current.
///
/// The role ref of a binding is immutable, so a drifted binding is deleted and recreated on a
/// later pass. Returns `false` in that case.
async fn reconcile_role_binding<S: ObjectStore>(listener: &FleetListener, store: &S) -> Result<bool> {
    let desired = builder::new_listener_role_binding(listener)?;
    let namespace = listener.spec.fleet_namespace.as_str();
    let binding = match store.get::<RoleBinding>(namespace, listener.name()).await? {
        Some(binding) => binding,
        None => {
            tracing::debug!("creating listener role binding");
            store.create(namespace, &desired).await?;
            return Ok(true);
        }
    };
    let drifted = [LABEL_ROLE_REF_HASH, LABEL_ROLE_SUBJECTS_HASH]
        .iter()
        .any(|label| binding.label(label) != desired.label(label));
    if drifted {
        tracing::info!("listener role binding drifted, deleting");
        store.delete::<RoleBinding>(namespace, listener.name()).await?;
        return Ok(false);
    }
    Ok(true)
}

/// Ensure the listener pod is running. A pod which reached a terminal phase is deleted, and
/// recreated on a later pass.
async fn reconcile_pod<S: ObjectStore>(listener: &FleetListener, mirror: &Secret, store: &S) -> Result<()> {
    let pod = match store.get::<Pod>(listener.namespace(), listener.name()).await? {
        Some(pod) => pod,
        None => {
            tracing::info!("creating listener pod");
            store.create(listener.namespace(), &builder::new_listener_pod(listener, mirror)).await?;
            return Ok(());
        }
    };
    if pod.is_deleting() {
        return Ok(());
    }
    let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
    if matches!(phase, Some("Succeeded") | Some("Failed")) {
        tracing::info!(phase = phase.unwrap_or_default(), "listener pod terminated, deleting");
        store.delete::<Pod>(listener.namespace(), listener.name()).await?;
    }
    Ok(())
}

async fn reconcile_deletion<S: ObjectStore>(listener: &FleetListener, store: &S) -> Result<Action> {
    if !listener.has_finalizer(FINALIZER_LISTENER) {
        return Ok(Action::await_change());
    }
    let (namespace, name) = (listener.namespace(), listener.name());

    if let Some(pod) = store.get::<Pod>(namespace, name).await? {
        if !pod.is_deleting() {
            tracing::info!("deleting listener pod");
            store.delete::<Pod>(namespace, name).await?;
        }
        return Ok(Action::await_change());
    }

    store.delete::<Secret>(namespace, name).await?;
    store.delete::<RoleBinding>(&listener.spec.fleet_namespace, name).await?;
    store.delete::<Role>(&listener.spec.fleet_namespace, name).await?;
    store.delete::<ServiceAccount>(namespace, name).await?;

    tracing::info!("listener teardown complete, removing finalizer");
    remove_finalizer(store, listener, FINALIZER_LISTENER).await?;
    Ok(Action::await_change())
}
