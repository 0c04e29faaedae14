//! Kubernetes controllers.
//!
//! One `kube::runtime::Controller` is run per fleet kind. Each reconciles a single object
//! identity at a time, while different identities are reconciled concurrently by the runtime.
//! Reconcilers are level-triggered: they observe the current state, take the next idempotent
//! step towards the desired state, and leave retries to the runtime's requeue.

mod builder;
mod fleet;
#[cfg(test)]
mod fixtures;
mod listener;
#[cfg(test)]
mod listener_test;
mod runner;
mod runner_set;
mod store;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{Action, Controller as RuntimeController};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
pub use crate::k8s::store::{KubeStore, ObjectStore};
use fleet_core::actions::MultiClient;
use fleet_core::crd::{FleetListener, RequiredMetadata, Runner, RunnerFleet, RunnerSet};
use fleet_core::{AppError, FLEET_OPERATOR_LABEL_SELECTORS};

/// The requeue delay after a failed reconcile.
const ERROR_REQUEUE: Duration = Duration::from_secs(10);
/// The requeue delay after a reconcile failed on bad input, which needs a user edit to resolve.
const VALIDATION_ERROR_REQUEUE: Duration = Duration::from_secs(5 * 60);

/// State shared by all reconcilers.
pub struct Context<S> {
    /// Access to cluster objects.
    pub store: S,
    /// The source of Actions service clients.
    pub actions: Arc<dyn MultiClient>,
    /// Runtime config.
    pub config: Arc<Config>,
}

impl<S: ObjectStore> Context<S> {
    /// Create a new instance.
    pub fn new(store: S, actions: Arc<dyn MultiClient>, config: Arc<Config>) -> Self {
        Self { store, actions, config }
    }
}

/// The error policy shared by all controllers.
fn error_policy<K: RequiredMetadata, S>(obj: Arc<K>, err: &AppError, _ctx: Arc<Context<S>>) -> Action {
    tracing::error!(error = %err, namespace = obj.namespace(), name = obj.name(), "error during reconciliation");
    if err.is_validation() {
        Action::requeue(VALIDATION_ERROR_REQUEUE)
    } else {
        Action::requeue(ERROR_REQUEUE)
    }
}

/// Kubernetes controller for reconciling fleet CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The shared reconciler state.
    ctx: Arc<Context<KubeStore>>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, actions: Arc<dyn MultiClient>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let ctx = Arc::new(Context::new(KubeStore::new(client.clone()), actions, config.clone()));
        Self { client, config, ctx, shutdown_tx }
    }

    /// Spawn one task per controller kind.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let fleets = RuntimeController::new(Api::<RunnerFleet>::all(self.client.clone()), watcher::Config::default())
            .owns(Api::<RunnerSet>::all(self.client.clone()), watcher::Config::default())
            .watches(
                Api::<FleetListener>::namespaced(self.client.clone(), &self.config.namespace),
                watcher::Config::default(),
                |listener: FleetListener| Some(ObjectRef::<RunnerFleet>::new(&listener.spec.fleet_name).within(&listener.spec.fleet_namespace)),
            )
            .run(fleet::reconcile, error_policy, self.ctx.clone());

        let runner_sets = RuntimeController::new(Api::<RunnerSet>::all(self.client.clone()), watcher::Config::default())
            .owns(Api::<Runner>::all(self.client.clone()), watcher::Config::default())
            .run(runner_set::reconcile, error_policy, self.ctx.clone());

        // Only objects carrying the canonical labels are watched.
        let owned = || watcher::Config::default().labels(FLEET_OPERATOR_LABEL_SELECTORS);

        let runners = RuntimeController::new(Api::<Runner>::all(self.client.clone()), watcher::Config::default())
            .owns(Api::<Pod>::all(self.client.clone()), owned())
            .owns(Api::<Secret>::all(self.client.clone()), owned())
            .run(runner::reconcile, error_policy, self.ctx.clone());

        let listeners = RuntimeController::new(
            Api::<FleetListener>::namespaced(self.client.clone(), &self.config.namespace),
            watcher::Config::default(),
        )
        .owns(Api::<Pod>::namespaced(self.client.clone(), &self.config.namespace), owned())
        .owns(Api::<Secret>::namespaced(self.client.clone(), &self.config.namespace), owned())
        .owns(Api::<ServiceAccount>::namespaced(self.client.clone(), &self.config.namespace), owned())
        .run(listener::reconcile, error_policy, self.ctx.clone());

        tracing::info!("k8s controllers initialized");
        vec![
            self.spawn_controller("RunnerFleet", fleets),
            self.spawn_controller("RunnerSet", runner_sets),
            self.spawn_controller("Runner", runners),
            self.spawn_controller("FleetListener", listeners),
        ]
    }

    /// Drive the given controller stream until it ends or shutdown is signalled.
    ///
    /// Shutdown drops the stream, which cancels any in-flight reconciles.
    fn spawn_controller<St, T, E>(&self, kind: &'static str, stream: St) -> JoinHandle<()>
    where
        St: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Debug + Send,
        E: Debug + Send,
    {
        let mut shutdown_rx = BroadcastStream::new(self.shutdown_tx.subscribe());
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    res = stream.next() => match res {
                        Some(Ok(obj)) => tracing::debug!(kind, ?obj, "reconciled"),
                        Some(Err(err)) => tracing::debug!(kind, error = ?err, "reconciliation failed"),
                        None => {
                            tracing::error!(kind, "controller stream ended unexpectedly");
                            let _ = shutdown_tx.send(());
                            break;
                        }
                    },
                    _ = shutdown_rx.next() => break,
                }
            }
            tracing::debug!(kind, "controller shutdown");
        })
    }
}
