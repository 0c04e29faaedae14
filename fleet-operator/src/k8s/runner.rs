//! Runner reconciliation.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::controller::Action;
use serde_json::json;

use crate::k8s::builder;
use crate::k8s::store::{ensure_finalizer, remove_finalizer, ObjectStore};
use crate::k8s::Context;
use fleet_core::actions::{ActionsService, JitRunnerSetting};
use fleet_core::crd::{RequiredMetadata, Runner, RunnerPhase, FINALIZER_RUNNER};
use fleet_core::{AppError, Result};

/// The work folder of runners, relative to the runner's install dir.
const RUNNER_WORK_FOLDER: &str = "_work";

/// Reconcile the given Runner.
#[tracing::instrument(level = "debug", skip(runner, ctx), fields(namespace = runner.namespace(), name = runner.name()))]
pub async fn reconcile<S: ObjectStore>(runner: Arc<Runner>, ctx: Arc<Context<S>>) -> Result<Action> {
    if runner.is_deleting() {
        return reconcile_deletion(&runner, &ctx).await;
    }
    if ensure_finalizer(&ctx.store, runner.as_ref(), FINALIZER_RUNNER).await? {
        return Ok(Action::await_change());
    }
    // Terminal runners are reclaimed by their runner set.
    if runner.is_finished() || runner.is_failed() {
        return Ok(Action::await_change());
    }

    if runner.jit_config().is_none() {
        register_runner(&runner, &ctx).await?;
        return Ok(Action::await_change());
    }

    let secret = match ctx.store.get::<Secret>(runner.namespace(), runner.name()).await? {
        Some(secret) => secret,
        None => {
            tracing::debug!("creating runner JIT secret");
            ctx.store.create(runner.namespace(), &builder::new_runner_jit_secret(&runner)?).await?
        }
    };

    match ctx.store.get::<Pod>(runner.namespace(), runner.name()).await? {
        None if runner.phase() == RunnerPhase::Pending => {
            tracing::info!("creating runner pod");
            ctx.store.create(runner.namespace(), &builder::new_runner_pod(&runner, &secret)?).await?;
        }
        // The JIT config is single use, so a runner whose pod vanished can not be restarted.
        None => {
            tracing::info!(phase = %runner.phase(), "runner pod disappeared, marking runner failed");
            let patch = json!({ "status": { "phase": RunnerPhase::Failed, "ready": false, "message": "runner pod was deleted" } });
            ctx.store.patch_status::<Runner>(runner.namespace(), runner.name(), &patch).await?;
        }
        Some(pod) => sync_phase(&runner, &pod, &ctx.store).await?,
    }
    Ok(Action::await_change())
}

/// Mint a JIT config for the runner and record it in the runner's status.
async fn register_runner<S: ObjectStore>(runner: &Runner, ctx: &Context<S>) -> Result<()> {
    let client = actions_client(runner, ctx).await?;
    let setting = JitRunnerSetting { name: runner.name().into(), work_folder: RUNNER_WORK_FOLDER.into() };
    let jit = client.generate_jit_runner_config(&setting, runner.spec.scale_set_id).await?;

    tracing::info!(runner_id = jit.runner.id, "runner registered");
    let patch = json!({
        "status": {
            "phase": RunnerPhase::Pending,
            "runnerId": jit.runner.id,
            "runnerName": jit.runner.name,
            "runnerJitConfig": jit.encoded_jit_config,
        }
    });
    ctx.store.patch_status::<Runner>(runner.namespace(), runner.name(), &patch).await?;
    Ok(())
}

/// Mirror the pod's phase into the runner's status.
async fn sync_phase<S: ObjectStore>(runner: &Runner, pod: &Pod, store: &S) -> Result<()> {
    let phase = match pod.status.as_ref().and_then(|status| status.phase.as_deref()).and_then(RunnerPhase::from_pod_phase) {
        Some(phase) => phase,
        None => return Ok(()),
    };
    let ready = phase == RunnerPhase::Running;
    let current = runner.status.as_ref();
    if current.and_then(|status| status.phase) == Some(phase) && current.map(|status| status.ready) == Some(ready) {
        return Ok(());
    }
    tracing::debug!(%phase, "updating runner phase");
    let patch = json!({ "status": { "phase": phase, "ready": ready } });
    store.patch_status::<Runner>(runner.namespace(), runner.name(), &patch).await?;
    Ok(())
}

async fn reconcile_deletion<S: ObjectStore>(runner: &Runner, ctx: &Context<S>) -> Result<Action> {
    if !runner.has_finalizer(FINALIZER_RUNNER) {
        return Ok(Action::await_change());
    }

    // The pod must be gone before the runner is deregistered.
    if let Some(pod) = ctx.store.get::<Pod>(runner.namespace(), runner.name()).await? {
        if !pod.is_deleting() {
            tracing::info!("deleting runner pod");
            ctx.store.delete::<Pod>(runner.namespace(), runner.name()).await?;
        }
        return Ok(Action::await_change());
    }

    if runner.runner_id() != 0 && !runner.is_finished() {
        deregister_runner(runner, ctx).await?;
    }
    ctx.store.delete::<Secret>(runner.namespace(), runner.name()).await?;

    tracing::info!("runner teardown complete, removing finalizer");
    remove_finalizer(&ctx.store, runner, FINALIZER_RUNNER).await?;
    Ok(Action::await_change())
}

/// Remove the runner's registration from the Actions service.
///
/// If the config secret is gone, nothing can be deregistered and the registration is left for
/// the service to expire.
async fn deregister_runner<S: ObjectStore>(runner: &Runner, ctx: &Context<S>) -> Result<()> {
    let client = match actions_client(runner, ctx).await {
        Ok(client) => client,
        Err(err) if err.is_not_found() => {
            tracing::warn!(error = %err, "config secret missing, skipping runner deregistration");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    tracing::info!(runner_id = runner.runner_id(), "removing runner registration");
    client.remove_runner(runner.runner_id()).await
}

async fn actions_client<S: ObjectStore>(runner: &Runner, ctx: &Context<S>) -> Result<Arc<dyn ActionsService>> {
    let secret = ctx
        .store
        .get::<Secret>(runner.namespace(), &runner.spec.github_config_secret)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("config secret {}/{}", runner.namespace(), runner.spec.github_config_secret)))?;
    ctx.actions
        .client_from_secret(&runner.spec.github_config_url, runner.namespace(), &secret.data.unwrap_or_default())
        .await
}
