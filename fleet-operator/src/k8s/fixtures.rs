//! Test fixtures: an in-memory object store, a fake Actions service, and object constructors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::TimeZone;
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use serde_json::Value;
use url::Url;

use crate::config::Config;
use crate::k8s::store::{Object, ObjectStore};
use crate::k8s::Context;
use fleet_core::actions::{
    ActionsMultiClient, ActionsService, ClientFactory, Credentials, JitRunnerConfig, JitRunnerSetting, RunnerGroup, RunnerReference, RunnerScaleSet,
    SessionSlot, SECRET_KEY_GITHUB_TOKEN,
};
use fleet_core::crd::{RunnerFleet, RunnerFleetSpec, ANNOTATION_SCALE_SET_ID};
use fleet_core::{AppError, Result};

/// The namespace used for fleets in tests.
pub const NS: &str = "ci";
/// The name of the config secret used in tests.
pub const CONFIG_SECRET: &str = "github-creds";
/// The configure URL used in tests.
pub const CONFIG_URL: &str = "https://github.com/acme/widgets";

/// Epoch seconds of the first creation timestamp handed out by the memory store.
const BASE_TIMESTAMP: i64 = 1_700_000_000;

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    serial: i64,
    mutations: usize,
}

/// An in-memory object store.
///
/// Objects are stored as JSON, keyed by kind, namespace and name. Creation assigns a uid, a
/// resource version and strictly increasing creation timestamps, and resolves `generateName`.
/// Deletion of an object carrying finalizers only marks it for deletion, it is removed once a
/// patch clears its finalizers.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key<K: Object>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> AppError {
    AppError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"].as_array().map(|finalizers| !finalizers.is_empty()).unwrap_or(false)
}

fn is_deleting(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

fn timestamp(serial: i64) -> Time {
    Time(chrono::Utc.timestamp_opt(BASE_TIMESTAMP + serial, 0).unwrap())
}

impl MemoryStore {
    /// The number of mutating calls made so far.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Insert the given object directly, as if it was created by a third party.
    pub fn insert<K: Object>(&self, obj: K) -> K {
        let namespace = obj.meta().namespace.clone().unwrap_or_else(|| NS.into());
        self.create_now(&namespace, &obj).unwrap()
    }

    /// Fetch an object, for assertions.
    pub fn get_now<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state.objects.get(&key::<K>(namespace, name)).map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// List objects of a kind, for assertions.
    pub fn list_now<K: Object>(&self, namespace: &str) -> Vec<K> {
        let state = self.state.lock().unwrap();
        let kind = K::kind(&()).to_string();
        state
            .objects
            .iter()
            .filter(|((obj_kind, obj_ns, _), _)| obj_kind == &kind && obj_ns == namespace)
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect()
    }

    /// Apply a merge patch to an object directly, as if by a third party.
    pub fn update<K: Object>(&self, namespace: &str, name: &str, patch: Value) -> K {
        self.patch_now(namespace, name, &patch).unwrap()
    }

    fn create_now<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        state.serial += 1;
        let serial = state.serial;

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        let name = match (meta.name.clone(), meta.generate_name.as_ref()) {
            (Some(name), _) if !name.is_empty() => name,
            (_, Some(prefix)) => format!("{}{:05}", prefix, serial),
            _ => return Err(AppError::Validation("object has neither a name nor a generate name".into())),
        };
        let key = key::<K>(namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} {} already exists", key.0, name)));
        }
        meta.name = Some(name);
        meta.namespace = Some(namespace.into());
        meta.uid = Some(format!("uid-{}", serial));
        meta.resource_version = Some(serial.to_string());
        meta.creation_timestamp = Some(timestamp(serial));
        meta.deletion_timestamp = None;

        state.objects.insert(key, serde_json::to_value(&obj)?);
        state.mutations += 1;
        Ok(obj)
    }

    fn patch_now<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        state.serial += 1;
        let serial = state.serial;
        let key = key::<K>(namespace, name);
        let value = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound", format!("{} {} not found", key.0, name)))?;
        json_patch::merge(value, patch);
        value["metadata"]["resourceVersion"] = Value::String(serial.to_string());
        let obj: K = serde_json::from_value(value.clone())?;
        if is_deleting(value) && !has_finalizers(value) {
            state.objects.remove(&key);
        }
        state.mutations += 1;
        Ok(obj)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.get_now(namespace, name))
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>> {
        Ok(self.list_now(namespace))
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.create_now(namespace, obj)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.serial += 1;
        let serial = state.serial;
        let key = key::<K>(namespace, name);
        let value = match state.objects.get_mut(&key) {
            Some(value) => value,
            None => return Ok(false),
        };
        if has_finalizers(value) {
            if !is_deleting(value) {
                value["metadata"]["deletionTimestamp"] = serde_json::to_value(timestamp(serial))?;
                state.mutations += 1;
            }
        } else {
            state.objects.remove(&key);
            state.mutations += 1;
        }
        Ok(true)
    }

    async fn patch<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        self.patch_now(namespace, name, patch)
    }

    async fn patch_status<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        let status = serde_json::json!({ "status": patch["status"] });
        self.patch_now(namespace, name, &status)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Actions Service Fakes /////////////////////////////////////////////////////

/// A fake Actions service recording the calls made to it.
#[derive(Default)]
pub struct FakeActions {
    pub scale_sets: Mutex<Vec<RunnerScaleSet>>,
    pub groups: Mutex<Vec<RunnerGroup>>,
    pub calls: Mutex<Vec<String>>,
    pub removed_runners: Mutex<Vec<i64>>,
    next_id: AtomicI64,
}

impl FakeActions {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 100
    }

    /// The calls made so far, by name.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionsService for FakeActions {
    async fn get_runner_scale_set(&self, runner_group_id: i64, name: &str) -> Result<Option<RunnerScaleSet>> {
        self.record(format!("get_runner_scale_set:{}:{}", runner_group_id, name));
        let scale_sets = self.scale_sets.lock().unwrap();
        Ok(scale_sets.iter().find(|set| set.name == name && set.runner_group_id == runner_group_id).cloned())
    }

    async fn create_runner_scale_set(&self, scale_set: &RunnerScaleSet) -> Result<RunnerScaleSet> {
        self.record(format!("create_runner_scale_set:{}", scale_set.name));
        let mut created = scale_set.clone();
        created.id = self.next_id();
        self.scale_sets.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn get_runner_group_by_name(&self, name: &str) -> Result<RunnerGroup> {
        self.record(format!("get_runner_group_by_name:{}", name));
        let groups = self.groups.lock().unwrap();
        groups
            .iter()
            .find(|group| group.name == name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("runner group {}", name)))
    }

    async fn generate_jit_runner_config(&self, setting: &JitRunnerSetting, scale_set_id: i64) -> Result<JitRunnerConfig> {
        self.record(format!("generate_jit_runner_config:{}:{}", scale_set_id, setting.name));
        let id = self.next_id();
        Ok(JitRunnerConfig {
            encoded_jit_config: format!("jit-{}", id),
            runner: RunnerReference { id, name: setting.name.clone() },
        })
    }

    async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        self.record(format!("remove_runner:{}", runner_id));
        self.removed_runners.lock().unwrap().push(runner_id);
        Ok(())
    }
}

/// A client factory handing out the same fake service for every key.
struct FakeFactory(Arc<FakeActions>);

impl ClientFactory for FakeFactory {
    fn build(&self, _: &Url, _: &Credentials, _: SessionSlot) -> Result<Arc<dyn ActionsService>> {
        Ok(self.0.clone())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Contexts & Objects ////////////////////////////////////////////////////////

/// A reconciler context over a memory store and a fake Actions service.
pub struct Harness {
    pub ctx: Arc<Context<MemoryStore>>,
    pub actions: Arc<FakeActions>,
}

impl Harness {
    pub fn new() -> Self {
        let actions = Arc::new(FakeActions::default());
        let multi = Arc::new(ActionsMultiClient::with_factory(FakeFactory(actions.clone())));
        let ctx = Arc::new(Context::new(MemoryStore::default(), multi, Arc::new(Config::new_test())));
        Self { ctx, actions }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.ctx.store
    }
}

/// Build a token based config secret.
pub fn config_secret(namespace: &str, name: &str, token: &str) -> Secret {
    let mut secret = Secret::default();
    secret.metadata = ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        ..Default::default()
    };
    secret.data = Some(BTreeMap::from([(SECRET_KEY_GITHUB_TOKEN.to_string(), ByteString(token.as_bytes().to_vec()))]));
    secret
}

/// Build a runner pod template with a single runner container.
pub fn runner_template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(BTreeMap::from([("team".to_string(), "platform".to_string())])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "runner".into(),
                image: Some(image.into()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

/// Build a fleet, not yet registered with the Actions service.
pub fn fleet(name: &str) -> RunnerFleet {
    let mut fleet = RunnerFleet::new(
        name,
        RunnerFleetSpec {
            github_config_url: CONFIG_URL.into(),
            github_config_secret: CONFIG_SECRET.into(),
            runner_group: None,
            min_runners: Some(1),
            max_runners: Some(10),
            listener_image: None,
            template: runner_template("runner:v1"),
        },
    );
    fleet.metadata.namespace = Some(NS.into());
    fleet
}

/// Build a fleet which already carries a scale set annotation.
pub fn registered_fleet(name: &str, scale_set_id: i64) -> RunnerFleet {
    let mut fleet = fleet(name);
    fleet
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_SCALE_SET_ID.into(), scale_set_id.to_string());
    fleet
}
