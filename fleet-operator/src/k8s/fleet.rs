//! RunnerFleet reconciliation.
//!
//! A fleet moves through the following states on successive passes:
//!
//! - `Deleting`: the listener is drained, then all runner sets, then the finalizer is removed.
//! Each step waits for the previous one to be fully gone, not merely marked for deletion.
//! - `Initializing`: the finalizer is added.
//! - `Unregistered`: the scale set is registered with the Actions service and its ID is
//! recorded as an annotation.
//! - `Converging`: the runner set generation, the listener and the status are brought in line
//! with the fleet's spec.
//!
//! Every pass which mutates the fleet itself stops there. The resulting watch event triggers the
//! next pass.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use serde_json::json;

use crate::k8s::builder;
use crate::k8s::store::{ensure_finalizer, remove_finalizer, ObjectStore, OwnerIndex};
use crate::k8s::Context;
use fleet_core::actions::{Label, RunnerScaleSet, RunnerSetting, DEFAULT_RUNNER_GROUP_ID, LABEL_TYPE_SYSTEM};
use fleet_core::crd::{
    FleetListener, RequiredMetadata, RunnerFleet, RunnerSet, ANNOTATION_RUNNER_GROUP_ID, ANNOTATION_SCALE_SET_ID, FINALIZER_FLEET, LABEL_LISTENER_SPEC_HASH,
    LABEL_RUNNER_SPEC_HASH,
};
use fleet_core::{AppError, Result};

/// Reconcile the given RunnerFleet.
#[tracing::instrument(level = "debug", skip(fleet, ctx), fields(namespace = fleet.namespace(), name = fleet.name()))]
pub async fn reconcile<S: ObjectStore>(fleet: Arc<RunnerFleet>, ctx: Arc<Context<S>>) -> Result<Action> {
    if fleet.is_deleting() {
        return reconcile_deletion(&fleet, &ctx).await;
    }

    if ensure_finalizer(&ctx.store, fleet.as_ref(), FINALIZER_FLEET).await? {
        return Ok(Action::await_change());
    }

    if fleet.registered_scale_set_id().is_none() {
        register_scale_set(&fleet, &ctx).await?;
        return Ok(Action::await_change());
    }

    // The config secret is required for everything downstream.
    get_config_secret(&fleet, &ctx.store).await?;

    let runner_set = match reconcile_runner_sets(&fleet, &ctx.store).await? {
        Some(runner_set) => runner_set,
        None => return Ok(Action::await_change()),
    };
    reconcile_listener(&fleet, &runner_set, &ctx).await?;
    sync_status(&fleet, &runner_set, &ctx.store).await?;
    Ok(Action::await_change())
}

//////////////////////////////////////////////////////////////////////////////
// Teardown //////////////////////////////////////////////////////////////////

async fn reconcile_deletion<S: ObjectStore>(fleet: &RunnerFleet, ctx: &Context<S>) -> Result<Action> {
    if !fleet.has_finalizer(FINALIZER_FLEET) {
        return Ok(Action::await_change());
    }
    tracing::debug!("tearing down runner fleet");

    if !cleanup_listener(fleet, ctx).await? {
        tracing::debug!("waiting for listener to be deleted");
        return Ok(Action::await_change());
    }
    if !cleanup_runner_sets(fleet, &ctx.store).await? {
        tracing::debug!("waiting for runner sets to be deleted");
        return Ok(Action::await_change());
    }

    tracing::info!("runner fleet teardown complete, removing finalizer");
    remove_finalizer(&ctx.store, fleet, FINALIZER_FLEET).await?;
    Ok(Action::await_change())
}

/// Delete the listener of the fleet. Returns `true` only once the listener is gone.
async fn cleanup_listener<S: ObjectStore>(fleet: &RunnerFleet, ctx: &Context<S>) -> Result<bool> {
    let name = builder::listener_name(fleet);
    let listener: Option<FleetListener> = ctx.store.get(&ctx.config.namespace, &name).await?;
    match listener {
        None => Ok(true),
        Some(listener) => {
            if !listener.is_deleting() {
                tracing::info!(listener = %name, "deleting listener");
                ctx.store.delete::<FleetListener>(&ctx.config.namespace, &name).await?;
            }
            Ok(false)
        }
    }
}

/// Delete all runner sets of the fleet. Returns `true` only once none remain.
async fn cleanup_runner_sets<S: ObjectStore>(fleet: &RunnerFleet, store: &S) -> Result<bool> {
    let index = OwnerIndex::new(store.list::<RunnerSet>(fleet.namespace()).await?);
    let owned = index.owned_by(fleet);
    if owned.is_empty() {
        return Ok(true);
    }
    for runner_set in owned.into_iter().filter(|set| !set.is_deleting()) {
        tracing::info!(runner_set = runner_set.name(), "deleting runner set");
        store.delete::<RunnerSet>(fleet.namespace(), runner_set.name()).await?;
    }
    Ok(false)
}

//////////////////////////////////////////////////////////////////////////////
// Registration //////////////////////////////////////////////////////////////

async fn get_config_secret<S: ObjectStore>(fleet: &RunnerFleet, store: &S) -> Result<Secret> {
    store
        .get::<Secret>(fleet.namespace(), &fleet.spec.github_config_secret)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("config secret {}/{}", fleet.namespace(), fleet.spec.github_config_secret)))
}

/// Register the fleet's scale set, reusing an existing registration of the same name, and
/// record its identity on the fleet.
async fn register_scale_set<S: ObjectStore>(fleet: &RunnerFleet, ctx: &Context<S>) -> Result<()> {
    let secret = get_config_secret(fleet, &ctx.store).await?;
    let client = ctx
        .actions
        .client_from_secret(&fleet.spec.github_config_url, fleet.namespace(), &secret.data.unwrap_or_default())
        .await?;

    let runner_group_id = match fleet.spec.runner_group.as_deref().filter(|group| !group.is_empty()) {
        Some(group) => client.get_runner_group_by_name(group).await?.id,
        None => DEFAULT_RUNNER_GROUP_ID,
    };
    let scale_set = match client.get_runner_scale_set(runner_group_id, fleet.name()).await? {
        Some(scale_set) => scale_set,
        None => {
            tracing::info!(runner_group_id, "creating runner scale set");
            let scale_set = RunnerScaleSet {
                name: fleet.name().into(),
                runner_group_id,
                labels: vec![Label { name: fleet.name().into(), kind: LABEL_TYPE_SYSTEM.into() }],
                runner_setting: RunnerSetting { ephemeral: true, disable_update: true },
                ..Default::default()
            };
            client.create_runner_scale_set(&scale_set).await?
        }
    };

    tracing::info!(scale_set_id = scale_set.id, "recording runner scale set on fleet");
    let patch = json!({
        "metadata": {
            "annotations": {
                ANNOTATION_SCALE_SET_ID: scale_set.id.to_string(),
                ANNOTATION_RUNNER_GROUP_ID: scale_set.runner_group_id.to_string(),
            }
        }
    });
    ctx.store.patch::<RunnerFleet>(fleet.namespace(), fleet.name(), &patch).await?;
    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// Runner Set Generations ////////////////////////////////////////////////////

/// Ensure the latest runner set generation matches the fleet's spec, and delete all older
/// generations.
///
/// Returns the current generation, or `None` if a new one was just created.
async fn reconcile_runner_sets<S: ObjectStore>(fleet: &RunnerFleet, store: &S) -> Result<Option<RunnerSet>> {
    let desired_hash = fleet.runner_set_spec_hash()?;
    let index = OwnerIndex::new(store.list::<RunnerSet>(fleet.namespace()).await?);
    let owned = index.owned_by(fleet);

    let latest = match owned.first() {
        Some(latest) if latest.label(LABEL_RUNNER_SPEC_HASH) == Some(desired_hash.as_str()) => *latest,
        latest => {
            tracing::info!(
                previous = latest.map(|set| set.name()).unwrap_or_default(),
                "runner set spec changed, creating new generation"
            );
            let runner_set = builder::new_runner_set(fleet)?;
            store.create(fleet.namespace(), &runner_set).await?;
            return Ok(None);
        }
    };

    for old in owned.iter().skip(1).filter(|set| !set.is_deleting()) {
        tracing::info!(runner_set = old.name(), "deleting superseded runner set");
        store.delete::<RunnerSet>(fleet.namespace(), old.name()).await?;
    }
    Ok(Some(latest.clone()))
}

//////////////////////////////////////////////////////////////////////////////
// Listener //////////////////////////////////////////////////////////////////

/// Ensure the fleet has a listener matching its spec and scaling its current generation.
///
/// A drifted listener is deleted, its replacement is created on a later pass once it is gone.
async fn reconcile_listener<S: ObjectStore>(fleet: &RunnerFleet, runner_set: &RunnerSet, ctx: &Context<S>) -> Result<()> {
    let namespace = ctx.config.namespace.as_str();
    let name = builder::listener_name(fleet);
    let listener: Option<FleetListener> = ctx.store.get(namespace, &name).await?;

    let listener = match listener {
        Some(listener) => listener,
        None => {
            tracing::info!(listener = %name, runner_set = runner_set.name(), "creating listener");
            let listener = builder::new_listener(fleet, runner_set, &ctx.config)?;
            ctx.store.create(namespace, &listener).await?;
            return Ok(());
        }
    };
    if listener.is_deleting() {
        return Ok(());
    }

    let desired_hash = fleet.listener_spec_hash()?;
    let hash_drifted = listener.label(LABEL_LISTENER_SPEC_HASH) != Some(desired_hash.as_str());
    let set_changed = listener.spec.runner_set_name != runner_set.name();
    if hash_drifted || set_changed {
        tracing::info!(listener = %name, hash_drifted, set_changed, "listener is out of date, deleting");
        ctx.store.delete::<FleetListener>(namespace, &name).await?;
    }
    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// Status ////////////////////////////////////////////////////////////////////

async fn sync_status<S: ObjectStore>(fleet: &RunnerFleet, runner_set: &RunnerSet, store: &S) -> Result<()> {
    let current = runner_set.current_replicas();
    if fleet.status.as_ref().map(|status| status.current_runners) == Some(current) {
        return Ok(());
    }
    tracing::debug!(current_runners = current, "updating runner fleet status");
    let patch = json!({ "status": { "currentRunners": current } });
    store.patch_status::<RunnerFleet>(fleet.namespace(), fleet.name(), &patch).await?;
    Ok(())
}
