//! Fleet CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod fleet;
mod listener;
mod runner;
mod runner_set;

use kube::Resource;

pub use fleet::{RunnerFleet, RunnerFleetSpec, RunnerFleetStatus};
pub use listener::{FleetListener, FleetListenerSpec};
pub use runner::{Runner, RunnerPhase, RunnerSpec, RunnerStatus};
pub use runner_set::{RunnerSet, RunnerSetSpec, RunnerSetStatus};

/// The API group of all fleet CRDs.
pub const GROUP: &str = "fleet.rs";

/// Annotation holding the Actions scale set ID registered for a RunnerFleet.
pub const ANNOTATION_SCALE_SET_ID: &str = "fleet.rs/runner-scale-set-id";
/// Annotation holding the Actions runner group ID which a RunnerFleet's scale set belongs to.
pub const ANNOTATION_RUNNER_GROUP_ID: &str = "fleet.rs/runner-group-id";

/// Label holding the hash of the RunnerFleet fields which a RunnerSet was derived from.
pub const LABEL_RUNNER_SPEC_HASH: &str = "fleet.rs/runner-spec-hash";
/// Label holding the hash of the RunnerFleet fields which a FleetListener was derived from.
pub const LABEL_LISTENER_SPEC_HASH: &str = "fleet.rs/listener-spec-hash";
/// Label holding the hash of a runner pod's source template.
pub const LABEL_POD_TEMPLATE_HASH: &str = "fleet.rs/pod-template-hash";
/// Label holding the hash of a mirrored secret's data.
pub const LABEL_SECRET_DATA_HASH: &str = "fleet.rs/secret-data-hash";
/// Label holding the hash of a listener role's rules.
pub const LABEL_ROLE_RULES_HASH: &str = "fleet.rs/role-rules-hash";
/// Label holding the hash of a listener role binding's role ref.
pub const LABEL_ROLE_REF_HASH: &str = "fleet.rs/role-ref-hash";
/// Label holding the hash of a listener role binding's subjects.
pub const LABEL_ROLE_SUBJECTS_HASH: &str = "fleet.rs/role-subjects-hash";
/// Label holding the name of the RunnerFleet which an object belongs to.
pub const LABEL_FLEET_NAME: &str = "fleet.rs/fleet-name";
/// Label holding the namespace of the RunnerFleet which an object belongs to.
pub const LABEL_FLEET_NAMESPACE: &str = "fleet.rs/fleet-namespace";
/// Label marking a pod as an ephemeral runner.
pub const LABEL_EPHEMERAL_RUNNER: &str = "fleet.rs/ephemeral-runner";

/// Finalizer guarding RunnerFleet teardown.
pub const FINALIZER_FLEET: &str = "fleet.rs/runnerfleet-finalizer";
/// Finalizer guarding RunnerSet teardown.
pub const FINALIZER_RUNNER_SET: &str = "fleet.rs/runnerset-finalizer";
/// Finalizer guarding Runner teardown.
pub const FINALIZER_RUNNER: &str = "fleet.rs/runner-finalizer";
/// Finalizer guarding FleetListener teardown.
pub const FINALIZER_LISTENER: &str = "fleet.rs/listener-finalizer";

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// Check if this object has been marked for deletion.
    fn is_deleting(&self) -> bool;

    /// Check if this object carries the given finalizer.
    fn has_finalizer(&self, finalizer: &str) -> bool;

    /// Get the value of the given label, if present.
    fn label(&self, key: &str) -> Option<&str>;

    /// Get the value of the given annotation, if present.
    fn annotation(&self, key: &str) -> Option<&str>;
}

impl<K: Resource> RequiredMetadata for K {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta().finalizers.iter().flatten().any(|f| f == finalizer)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.meta().labels.as_ref().and_then(|labels| labels.get(key)).map(String::as_str)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().annotations.as_ref().and_then(|annotations| annotations.get(key)).map(String::as_str)
    }
}
