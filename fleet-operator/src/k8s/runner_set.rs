//! RunnerSet reconciliation.
//!
//! A runner set converges its population of runners on the desired replica count. Runners which
//! are busy with a job, or which failed, are never removed by a scale down. They are only
//! removed once their state changes, or when the runner set itself is deleted.

use std::sync::Arc;

use kube::runtime::controller::Action;
use serde_json::json;

use crate::k8s::builder;
use crate::k8s::store::{ensure_finalizer, remove_finalizer, ObjectStore, OwnerIndex};
use crate::k8s::Context;
use fleet_core::crd::{RequiredMetadata, Runner, RunnerPhase, RunnerSet, FINALIZER_RUNNER_SET};
use fleet_core::Result;

/// Reconcile the given RunnerSet.
#[tracing::instrument(level = "debug", skip(runner_set, ctx), fields(namespace = runner_set.namespace(), name = runner_set.name()))]
pub async fn reconcile<S: ObjectStore>(runner_set: Arc<RunnerSet>, ctx: Arc<Context<S>>) -> Result<Action> {
    let store = &ctx.store;
    let index = OwnerIndex::new(store.list::<Runner>(runner_set.namespace()).await?);
    let owned = index.owned_by(runner_set.as_ref());

    if runner_set.is_deleting() {
        if !runner_set.has_finalizer(FINALIZER_RUNNER_SET) {
            return Ok(Action::await_change());
        }
        if owned.is_empty() {
            tracing::info!("all runners deleted, removing finalizer");
            remove_finalizer(store, runner_set.as_ref(), FINALIZER_RUNNER_SET).await?;
            return Ok(Action::await_change());
        }
        for runner in owned.into_iter().filter(|runner| !runner.is_deleting()) {
            tracing::info!(runner = runner.name(), "deleting runner of deleted runner set");
            store.delete::<Runner>(runner_set.namespace(), runner.name()).await?;
        }
        return Ok(Action::await_change());
    }

    if ensure_finalizer(store, runner_set.as_ref(), FINALIZER_RUNNER_SET).await? {
        return Ok(Action::await_change());
    }

    // Finished runners are reclaimed regardless of the replica count.
    let mut live = Vec::with_capacity(owned.len());
    for runner in owned {
        if runner.is_deleting() {
            continue;
        }
        if runner.is_finished() {
            tracing::info!(runner = runner.name(), "deleting finished runner");
            store.delete::<Runner>(runner_set.namespace(), runner.name()).await?;
            continue;
        }
        live.push(runner);
    }

    let desired = runner_set.spec.replicas.max(0) as usize;
    let mut live_count = live.len();
    if live_count < desired {
        let deficit = desired - live_count;
        tracing::info!(deficit, desired, "scaling up runner set");
        for _ in 0..deficit {
            store.create(runner_set.namespace(), &builder::new_runner(&runner_set)).await?;
        }
        live_count = desired;
    } else if live_count > desired {
        let surplus = live_count - desired;
        let candidates = scale_down_candidates(&live);
        if candidates.len() < surplus {
            tracing::debug!(surplus, candidates = candidates.len(), "not enough idle runners to fully scale down");
        }
        for runner in candidates.into_iter().take(surplus) {
            tracing::info!(runner = runner.name(), "deleting idle runner on scale down");
            store.delete::<Runner>(runner_set.namespace(), runner.name()).await?;
            live_count -= 1;
        }
    }

    let live_count = live_count as i32;
    if runner_set.status.as_ref().map(|status| status.current_replicas) != Some(live_count) {
        let patch = json!({ "status": { "currentReplicas": live_count } });
        store.patch_status::<RunnerSet>(runner_set.namespace(), runner_set.name(), &patch).await?;
    }
    Ok(Action::await_change())
}

/// The runners which may be removed on scale down, in order of preference.
///
/// Busy and failed runners are never candidates. Runners which have not yet registered with
/// the Actions service come first, then the most recently created.
fn scale_down_candidates<'a>(live: &[&'a Runner]) -> Vec<&'a Runner> {
    let mut candidates: Vec<&Runner> = live.iter().copied().filter(|runner| !runner.is_busy() && !runner.is_failed()).collect();
    // Stable sort, so the newest first order of the owner index is kept within each group.
    candidates.sort_by_key(|runner| runner.runner_id() != 0 || runner.phase() != RunnerPhase::Pending);
    candidates
}
