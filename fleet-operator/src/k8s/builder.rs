//! Builders of the object graph derived from a RunnerFleet.
//!
//! Everything here is a pure function of its inputs. Names are deterministic, and every object
//! which is checked for drift carries a content hash label.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, LocalObjectReference, Pod, PodSpec, Secret, SecretKeySelector, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use maplit::btreemap;
use serde::Serialize;

use crate::config::Config;
use fleet_core::actions::{SECRET_KEY_GITHUB_APP_ID, SECRET_KEY_GITHUB_APP_INSTALLATION_ID, SECRET_KEY_GITHUB_APP_PRIVATE_KEY, SECRET_KEY_GITHUB_TOKEN};
use fleet_core::crd::{
    FleetListener, FleetListenerSpec, RequiredMetadata, Runner, RunnerFleet, RunnerSet, RunnerSetSpec, RunnerSpec, GROUP, LABEL_EPHEMERAL_RUNNER,
    LABEL_FLEET_NAME, LABEL_FLEET_NAMESPACE, LABEL_LISTENER_SPEC_HASH, LABEL_POD_TEMPLATE_HASH, LABEL_ROLE_REF_HASH, LABEL_ROLE_RULES_HASH,
    LABEL_ROLE_SUBJECTS_HASH, LABEL_RUNNER_SPEC_HASH, LABEL_SECRET_DATA_HASH,
};
use fleet_core::hash::{compute_hash, short_hash};
use fleet_core::{AppError, Result};

/// The pod container name of the listener.
pub const CONTAINER_NAME_LISTENER: &str = "listener";
/// The pod container name which receives a runner's JIT config.
///
/// NOTE WELL: runner pod templates must use this name for the runner container.
pub const CONTAINER_NAME_RUNNER: &str = "runner";
/// The entrypoint of the listener image.
const LISTENER_COMMAND: &str = "/fleet-listener";
/// The key of a runner's JIT secret holding the encoded JIT config.
pub const SECRET_KEY_JIT_CONFIG: &str = "jitToken";

pub const ENV_CONFIGURE_URL: &str = "GITHUB_CONFIGURE_URL";
pub const ENV_RUNNER_SET_NAMESPACE: &str = "RUNNER_SET_NAMESPACE";
pub const ENV_RUNNER_SET_NAME: &str = "RUNNER_SET_NAME";
pub const ENV_MIN_RUNNERS: &str = "MIN_RUNNERS";
pub const ENV_MAX_RUNNERS: &str = "MAX_RUNNERS";
pub const ENV_SCALE_SET_ID: &str = "RUNNER_SCALE_SET_ID";
/// The env var through which the runner container receives its JIT config.
pub const ENV_RUNNER_JIT_CONFIG: &str = "ACTIONS_RUNNER_INPUT_JITCONFIG";

/// Credential secret keys and the listener env vars they are exposed as.
const LISTENER_SECRET_ENV: [(&str, &str); 4] = [
    (SECRET_KEY_GITHUB_TOKEN, "GITHUB_TOKEN"),
    (SECRET_KEY_GITHUB_APP_ID, "GITHUB_APP_ID"),
    (SECRET_KEY_GITHUB_APP_INSTALLATION_ID, "GITHUB_APP_INSTALLATION_ID"),
    (SECRET_KEY_GITHUB_APP_PRIVATE_KEY, "GITHUB_APP_PRIVATE_KEY"),
];

/// Set the cannonical labels on an object controlled by the fleet operator.
pub fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "fleet".into());
    labels.insert("fleet.rs/controlled-by".into(), "fleet-operator".into());
}

/// Set the labels identifying the fleet which an object belongs to.
fn set_fleet_labels(labels: &mut BTreeMap<String, String>, fleet_namespace: &str, fleet_name: &str) {
    labels.insert(LABEL_FLEET_NAMESPACE.into(), fleet_namespace.into());
    labels.insert(LABEL_FLEET_NAME.into(), fleet_name.into());
}

/// The owner reference making the given object the controller of another.
fn controller_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>> {
    owner.controller_owner_ref(&()).map(|oref| vec![oref])
}

//////////////////////////////////////////////////////////////////////////////
// Runner Sets ///////////////////////////////////////////////////////////////

/// Build a new RunnerSet generation for the given fleet.
///
/// Fails only if the fleet's scale set annotation is missing or malformed.
pub fn new_runner_set(fleet: &RunnerFleet) -> Result<RunnerSet> {
    let scale_set_id = fleet.scale_set_id()?;
    let spec_hash = fleet.runner_set_spec_hash()?;

    let mut labels = BTreeMap::new();
    set_cannonical_labels(&mut labels);
    set_fleet_labels(&mut labels, fleet.namespace(), fleet.name());
    labels.insert(LABEL_RUNNER_SPEC_HASH.into(), spec_hash);

    let mut set = RunnerSet::new(
        "",
        RunnerSetSpec {
            replicas: 0,
            runner: RunnerSpec {
                scale_set_id,
                github_config_url: fleet.spec.github_config_url.clone(),
                github_config_secret: fleet.spec.github_config_secret.clone(),
                template: fleet.spec.template.clone(),
            },
        },
    );
    set.metadata = ObjectMeta {
        generate_name: Some(format!("{}-", fleet.name())),
        namespace: Some(fleet.namespace().into()),
        labels: Some(labels),
        owner_references: controller_ref(fleet),
        ..Default::default()
    };
    Ok(set)
}

//////////////////////////////////////////////////////////////////////////////
// Listeners /////////////////////////////////////////////////////////////////

/// The name of the listener of the given fleet, which is also the name of all of its
/// supporting objects.
pub fn listener_name(fleet: &RunnerFleet) -> String {
    format!("{}-{}-listener", fleet.name(), short_hash(fleet.namespace()))
}

/// Build the listener for the given fleet, scaling the given runner set.
pub fn new_listener(fleet: &RunnerFleet, runner_set: &RunnerSet, config: &Config) -> Result<FleetListener> {
    let scale_set_id = fleet.scale_set_id()?;
    let spec_hash = fleet.listener_spec_hash()?;

    let mut labels = BTreeMap::new();
    set_cannonical_labels(&mut labels);
    set_fleet_labels(&mut labels, fleet.namespace(), fleet.name());
    labels.insert(LABEL_LISTENER_SPEC_HASH.into(), spec_hash);

    let image = fleet.spec.listener_image.clone().unwrap_or_else(|| config.listener_image.clone());
    let name = listener_name(fleet);
    let mut listener = FleetListener::new(
        &name,
        FleetListenerSpec {
            github_config_url: fleet.spec.github_config_url.clone(),
            github_config_secret: fleet.spec.github_config_secret.clone(),
            scale_set_id,
            fleet_namespace: fleet.namespace().into(),
            fleet_name: fleet.name().into(),
            runner_set_name: runner_set.name().into(),
            min_runners: fleet.min_runners(),
            max_runners: fleet.max_runners(),
            image,
            image_pull_secrets: config
                .listener_image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: Some(name.clone()) })
                .collect(),
        },
    );
    listener.metadata.namespace = Some(config.namespace.clone());
    listener.metadata.labels = Some(labels);
    Ok(listener)
}

/// Build the service account of the given listener.
pub fn new_listener_service_account(listener: &FleetListener) -> ServiceAccount {
    let mut sa = ServiceAccount::default();
    sa.metadata = listener_child_meta(listener, listener.namespace());
    sa.metadata.owner_references = controller_ref(listener);
    sa
}

/// Build the mirror of the given config secret, colocated with the listener.
pub fn new_listener_secret_mirror(listener: &FleetListener, config_secret: &Secret) -> Result<Secret> {
    let data = config_secret.data.clone().unwrap_or_default();
    let mut secret = Secret::default();
    secret.metadata = listener_child_meta(listener, listener.namespace());
    secret.metadata.owner_references = controller_ref(listener);
    secret
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(LABEL_SECRET_DATA_HASH.into(), compute_hash(&data)?);
    secret.data = Some(data);
    Ok(secret)
}

/// The RBAC rules granted to a listener: patching its runner set, and patching runners along
/// with their status.
fn listener_rules(listener: &FleetListener) -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec![GROUP.into()]),
            resources: Some(vec!["runnersets".into()]),
            resource_names: Some(vec![listener.spec.runner_set_name.clone()]),
            verbs: vec!["patch".into()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![GROUP.into()]),
            resources: Some(vec!["runners".into(), "runners/status".into()]),
            verbs: vec!["patch".into()],
            ..Default::default()
        },
    ]
}

/// Build the role of the given listener. The role lives in the fleet's namespace.
pub fn new_listener_role(listener: &FleetListener) -> Result<Role> {
    let rules = listener_rules(listener);
    let mut role = Role::default();
    role.metadata = listener_child_meta(listener, &listener.spec.fleet_namespace);
    role.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(LABEL_ROLE_RULES_HASH.into(), compute_hash(&rules)?);
    role.rules = Some(rules);
    Ok(role)
}

/// Build the role binding of the given listener's service account to its role.
pub fn new_listener_role_binding(listener: &FleetListener) -> Result<RoleBinding> {
    let role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".into(),
        kind: "Role".into(),
        name: listener.name().into(),
    };
    let subjects = vec![Subject {
        kind: "ServiceAccount".into(),
        name: listener.name().into(),
        namespace: Some(listener.namespace().into()),
        ..Default::default()
    }];
    let mut binding = RoleBinding::default();
    binding.metadata = listener_child_meta(listener, &listener.spec.fleet_namespace);
    let labels = binding.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(LABEL_ROLE_REF_HASH.into(), compute_hash(&role_ref)?);
    labels.insert(LABEL_ROLE_SUBJECTS_HASH.into(), compute_hash(&subjects)?);
    binding.role_ref = role_ref;
    binding.subjects = Some(subjects);
    Ok(binding)
}

/// Build the listener pod.
///
/// Each credential key present in the secret mirror is exposed as an env var. Keys absent from
/// the mirror are skipped.
pub fn new_listener_pod(listener: &FleetListener, secret_mirror: &Secret) -> Pod {
    let spec = &listener.spec;
    let mut env = vec![
        env_var(ENV_CONFIGURE_URL, &spec.github_config_url),
        env_var(ENV_RUNNER_SET_NAMESPACE, &spec.fleet_namespace),
        env_var(ENV_RUNNER_SET_NAME, &spec.runner_set_name),
        env_var(ENV_MAX_RUNNERS, &spec.max_runners.to_string()),
        env_var(ENV_MIN_RUNNERS, &spec.min_runners.to_string()),
        env_var(ENV_SCALE_SET_ID, &spec.scale_set_id.to_string()),
    ];
    let data = secret_mirror.data.as_ref();
    for (key, var) in LISTENER_SECRET_ENV {
        if data.map(|data| data.contains_key(key)).unwrap_or(false) {
            env.push(secret_env_var(var, secret_mirror.name(), key));
        }
    }

    let mut pod = Pod::default();
    pod.metadata = listener_child_meta(listener, listener.namespace());
    pod.metadata.owner_references = controller_ref(listener);
    pod.spec = Some(PodSpec {
        service_account_name: Some(listener.name().into()),
        restart_policy: Some("Never".into()),
        image_pull_secrets: Some(spec.image_pull_secrets.clone()).filter(|secrets| !secrets.is_empty()),
        containers: vec![Container {
            name: CONTAINER_NAME_LISTENER.into(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some("IfNotPresent".into()),
            command: Some(vec![LISTENER_COMMAND.into()]),
            env: Some(env),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod
}

/// Metadata shared by all objects supporting a listener.
fn listener_child_meta(listener: &FleetListener, namespace: &str) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    set_cannonical_labels(&mut labels);
    set_fleet_labels(&mut labels, &listener.spec.fleet_namespace, &listener.spec.fleet_name);
    ObjectMeta {
        name: Some(listener.name().into()),
        namespace: Some(namespace.into()),
        labels: Some(labels),
        ..Default::default()
    }
}

//////////////////////////////////////////////////////////////////////////////
// Runners ///////////////////////////////////////////////////////////////////

/// Build a new runner for the given runner set.
pub fn new_runner(runner_set: &RunnerSet) -> Runner {
    let mut labels: BTreeMap<String, String> = runner_set.meta().labels.clone().unwrap_or_default();
    labels.remove(LABEL_RUNNER_SPEC_HASH);
    set_cannonical_labels(&mut labels);

    let mut runner = Runner::new("", runner_set.spec.runner.clone());
    runner.metadata = ObjectMeta {
        generate_name: Some(format!("{}-runner-", runner_set.name())),
        namespace: Some(runner_set.namespace().into()),
        labels: Some(labels),
        owner_references: controller_ref(runner_set),
        ..Default::default()
    };
    runner
}

/// Build the single-key secret holding the runner's JIT config.
pub fn new_runner_jit_secret(runner: &Runner) -> Result<Secret> {
    let jit_config = runner
        .jit_config()
        .ok_or_else(|| AppError::Validation(format!("runner {} has no JIT config", runner.name())))?;
    let mut labels = runner.meta().labels.clone().unwrap_or_default();
    set_cannonical_labels(&mut labels);

    let mut secret = Secret::default();
    secret.metadata = ObjectMeta {
        name: Some(runner.name().into()),
        namespace: Some(runner.namespace().into()),
        labels: Some(labels),
        owner_references: controller_ref(runner),
        ..Default::default()
    };
    secret.data = Some(btreemap! {
        SECRET_KEY_JIT_CONFIG.into() => ByteString(jit_config.as_bytes().to_vec()),
    });
    Ok(secret)
}

/// The inputs of a runner pod's template hash.
#[derive(Serialize)]
struct RunnerPodHashInput<'a> {
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
    spec: &'a RunnerSpec,
    jit_config: Option<&'a str>,
}

/// Build the pod of the given runner, wired to its JIT secret.
///
/// Labels and annotations of the pod template are overlaid on those of the runner, so the
/// template wins on conflict.
pub fn new_runner_pod(runner: &Runner, jit_secret: &Secret) -> Result<Pod> {
    let template = &runner.spec.template;
    let template_meta = template.metadata.clone().unwrap_or_default();

    let mut labels = runner.meta().labels.clone().unwrap_or_default();
    labels.extend(template_meta.labels.unwrap_or_default());
    labels.remove(LABEL_POD_TEMPLATE_HASH);
    let mut annotations = runner.meta().annotations.clone().unwrap_or_default();
    annotations.extend(template_meta.annotations.unwrap_or_default());

    let hash = compute_hash(&RunnerPodHashInput {
        labels: &labels,
        annotations: &annotations,
        spec: &runner.spec,
        jit_config: runner.jit_config(),
    })?;
    labels.insert(LABEL_POD_TEMPLATE_HASH.into(), hash);
    labels.insert(LABEL_EPHEMERAL_RUNNER.into(), "true".into());
    set_cannonical_labels(&mut labels);

    let mut spec = template.spec.clone().unwrap_or_default();
    spec.restart_policy = Some("Never".into());
    for container in spec.containers.iter_mut().filter(|c| c.name == CONTAINER_NAME_RUNNER) {
        container
            .env
            .get_or_insert_with(Default::default)
            .push(secret_env_var(ENV_RUNNER_JIT_CONFIG, jit_secret.name(), SECRET_KEY_JIT_CONFIG));
    }

    let mut pod = Pod::default();
    pod.metadata = ObjectMeta {
        name: Some(runner.name().into()),
        namespace: Some(runner.namespace().into()),
        labels: Some(labels),
        annotations: Some(annotations).filter(|annotations| !annotations.is_empty()),
        owner_references: controller_ref(runner),
        ..Default::default()
    };
    pod.spec = Some(spec);
    Ok(pod)
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env_var(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret_name.into()),
                key: key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
