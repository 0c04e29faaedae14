use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use fleet_core::crd::{FleetListener, RequiredMetadata, FINALIZER_LISTENER, LABEL_ROLE_REF_HASH, LABEL_ROLE_RULES_HASH, LABEL_SECRET_DATA_HASH};
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::Action;
use serde_json::json;

use crate::k8s::builder;
use crate::k8s::fixtures::{config_secret, registered_fleet, Harness, CONFIG_SECRET, NS};
use crate::k8s::listener::reconcile;
use crate::k8s::ObjectStore;

const LISTENER_NS: &str = "fleet-system";

/// Create a listener for a registered fleet, returning its name.
fn setup() -> Result<(Harness, String)> {
    let h = Harness::new();
    h.store().insert(config_secret(NS, CONFIG_SECRET, "ghp_test"));
    let fleet = h.store().insert(registered_fleet("linux", 100));
    let set = h.store().insert(builder::new_runner_set(&fleet)?);
    let listener = h.store().insert(builder::new_listener(&fleet, &set, &h.ctx.config)?);
    Ok((h, listener.name().to_string()))
}

async fn reconcile_listener(h: &Harness, name: &str) -> Result<Action> {
    let listener: FleetListener = h.store().get_now(LISTENER_NS, name).context("listener missing")?;
    Ok(reconcile(Arc::new(listener), h.ctx.clone()).await?)
}

async fn start(h: &Harness, name: &str) -> Result<()> {
    reconcile_listener(h, name).await?;
    reconcile_listener(h, name).await?;
    Ok(())
}

fn env_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.env.iter().flatten())
        .map(|var| var.name.clone())
        .collect()
}

#[tokio::test]
async fn materializes_listener_objects() -> Result<()> {
    let (h, name) = setup()?;

    reconcile_listener(&h, &name).await?;
    let listener: FleetListener = h.store().get_now(LISTENER_NS, &name).context("listener missing")?;
    assert!(listener.has_finalizer(FINALIZER_LISTENER), "expected first pass to add the finalizer");

    let action = reconcile_listener(&h, &name).await?;
    assert_eq!(action, Action::requeue(Duration::from_secs(300)), "expected converged listener to resync periodically");

    assert!(h.store().get_now::<ServiceAccount>(LISTENER_NS, &name).is_some(), "service account missing");
    let mirror: Secret = h.store().get_now(LISTENER_NS, &name).context("secret mirror missing")?;
    let source: Secret = h.store().get_now(NS, CONFIG_SECRET).context("config secret missing")?;
    assert_eq!(mirror.data, source.data, "expected mirror to copy the config secret's data");
    assert!(mirror.label(LABEL_SECRET_DATA_HASH).is_some());

    let role: Role = h.store().get_now(NS, &name).context("role missing in fleet namespace")?;
    let rules = role.rules.context("role has no rules")?;
    assert_eq!(rules[0].resource_names, Some(vec![listener.spec.runner_set_name.clone()]));
    let binding: RoleBinding = h.store().get_now(NS, &name).context("role binding missing in fleet namespace")?;
    let subject = binding.subjects.as_ref().and_then(|subjects| subjects.first()).context("binding has no subject")?;
    assert_eq!(subject.namespace.as_deref(), Some(LISTENER_NS));

    let pod: Pod = h.store().get_now(LISTENER_NS, &name).context("listener pod missing")?;
    let env = env_names(&pod);
    assert!(env.contains(&"GITHUB_TOKEN".to_string()), "expected token env var, got {:?}", env);
    assert!(!env.contains(&"GITHUB_APP_ID".to_string()), "expected no app env vars, got {:?}", env);

    let before = h.store().mutations();
    reconcile_listener(&h, &name).await?;
    assert_eq!(h.store().mutations(), before, "expected a converged listener to issue no mutations");
    Ok(())
}

#[tokio::test]
async fn missing_config_secret_is_not_found() -> Result<()> {
    let (h, name) = setup()?;
    h.store().delete::<Secret>(NS, CONFIG_SECRET).await?;

    reconcile_listener(&h, &name).await?;
    let listener: FleetListener = h.store().get_now(LISTENER_NS, &name).context("listener missing")?;
    let err = reconcile(Arc::new(listener), h.ctx.clone()).await.expect_err("expected reconcile to fail");
    assert!(err.is_not_found(), "expected a not found error, got {:?}", err);
    assert!(h.store().get_now::<Pod>(LISTENER_NS, &name).is_none(), "expected no pod without credentials");
    Ok(())
}

#[tokio::test]
async fn config_secret_change_updates_mirror_and_restarts_pod() -> Result<()> {
    let (h, name) = setup()?;
    start(&h, &name).await?;
    let pod_before: Pod = h.store().get_now(LISTENER_NS, &name).context("listener pod missing")?;
    let mirror_before: Secret = h.store().get_now(LISTENER_NS, &name).context("secret mirror missing")?;

    // Swap token credentials for app credentials.
    h.store().update::<Secret>(
        NS,
        CONFIG_SECRET,
        json!({"data": {"github_token": null, "github_app_id": "MTIz", "github_app_installation_id": "NDU2", "github_app_private_key": "a2V5"}}),
    );
    reconcile_listener(&h, &name).await?;

    let mirror: Secret = h.store().get_now(LISTENER_NS, &name).context("secret mirror missing")?;
    let source: Secret = h.store().get_now(NS, CONFIG_SECRET).context("config secret missing")?;
    assert_eq!(mirror.data, source.data, "expected mirror to follow the config secret");
    assert_ne!(mirror.label(LABEL_SECRET_DATA_HASH), mirror_before.label(LABEL_SECRET_DATA_HASH));
    assert!(h.store().get_now::<Pod>(LISTENER_NS, &name).is_none(), "expected pod to be deleted");

    reconcile_listener(&h, &name).await?;
    let pod: Pod = h.store().get_now(LISTENER_NS, &name).context("listener pod missing")?;
    assert_ne!(pod.metadata.uid, pod_before.metadata.uid);
    let env = env_names(&pod);
    for var in ["GITHUB_APP_ID", "GITHUB_APP_INSTALLATION_ID", "GITHUB_APP_PRIVATE_KEY"] {
        assert!(env.contains(&var.to_string()), "expected {} env var, got {:?}", var, env);
    }
    assert!(!env.contains(&"GITHUB_TOKEN".to_string()), "expected token env var to be dropped, got {:?}", env);
    Ok(())
}

#[tokio::test]
async fn drifted_role_is_patched_in_place() -> Result<()> {
    let (h, name) = setup()?;
    start(&h, &name).await?;
    let role_before: Role = h.store().get_now(NS, &name).context("role missing")?;

    h.store().update::<Role>(
        NS,
        &name,
        json!({"metadata": {"labels": {LABEL_ROLE_RULES_HASH: "stale"}}, "rules": [{"apiGroups": [""], "resources": ["pods"], "verbs": ["*"]}]}),
    );
    reconcile_listener(&h, &name).await?;

    let role: Role = h.store().get_now(NS, &name).context("role missing")?;
    assert_eq!(role.metadata.uid, role_before.metadata.uid, "expected role to be patched, not recreated");
    assert_eq!(role.rules, role_before.rules);
    assert_eq!(role.label(LABEL_ROLE_RULES_HASH), role_before.label(LABEL_ROLE_RULES_HASH));
    Ok(())
}

#[tokio::test]
async fn drifted_role_binding_is_recreated() -> Result<()> {
    let (h, name) = setup()?;
    start(&h, &name).await?;
    let binding_before: RoleBinding = h.store().get_now(NS, &name).context("role binding missing")?;

    h.store().update::<RoleBinding>(NS, &name, json!({"metadata": {"labels": {LABEL_ROLE_REF_HASH: "stale"}}}));
    reconcile_listener(&h, &name).await?;
    assert!(h.store().get_now::<RoleBinding>(NS, &name).is_none(), "expected drifted binding to be deleted");

    reconcile_listener(&h, &name).await?;
    let binding: RoleBinding = h.store().get_now(NS, &name).context("role binding missing")?;
    assert_ne!(binding.metadata.uid, binding_before.metadata.uid);
    assert_eq!(binding.label(LABEL_ROLE_REF_HASH), binding_before.label(LABEL_ROLE_REF_HASH));
    Ok(())
}

#[tokio::test]
async fn terminated_pod_is_replaced() -> Result<()> {
    let (h, name) = setup()?;
    start(&h, &name).await?;
    let pod_before: Pod = h.store().get_now(LISTENER_NS, &name).context("listener pod missing")?;

    h.store().update::<Pod>(LISTENER_NS, &name, json!({"status": {"phase": "Failed"}}));
    reconcile_listener(&h, &name).await?;
    assert!(h.store().get_now::<Pod>(LISTENER_NS, &name).is_none(), "expected terminated pod to be deleted");

    reconcile_listener(&h, &name).await?;
    let pod: Pod = h.store().get_now(LISTENER_NS, &name).context("listener pod missing")?;
    assert_ne!(pod.metadata.uid, pod_before.metadata.uid);
    Ok(())
}

#[tokio::test]
async fn deletion_removes_pod_first_then_supporting_objects() -> Result<()> {
    let (h, name) = setup()?;
    start(&h, &name).await?;
    h.store().update::<Pod>(LISTENER_NS, &name, json!({"metadata": {"finalizers": ["test/hold"]}}));

    h.store().delete::<FleetListener>(LISTENER_NS, &name).await?;
    reconcile_listener(&h, &name).await?;
    let pod: Pod = h.store().get_now(LISTENER_NS, &name).context("listener pod missing")?;
    assert!(pod.is_deleting(), "expected pod to be marked for deletion");
    assert!(h.store().get_now::<Role>(NS, &name).is_some(), "expected role to outlive the pod");

    h.store().update::<Pod>(LISTENER_NS, &name, json!({"metadata": {"finalizers": []}}));
    reconcile_listener(&h, &name).await?;
    assert!(h.store().get_now::<Secret>(LISTENER_NS, &name).is_none(), "secret mirror remains");
    assert!(h.store().get_now::<ServiceAccount>(LISTENER_NS, &name).is_none(), "service account remains");
    assert!(h.store().get_now::<Role>(NS, &name).is_none(), "role remains");
    assert!(h.store().get_now::<RoleBinding>(NS, &name).is_none(), "role binding remains");
    assert!(h.store().get_now::<FleetListener>(LISTENER_NS, &name).is_none(), "listener remains");
    assert!(h.store().get_now::<Secret>(NS, CONFIG_SECRET).is_some(), "expected config secret to be untouched");
    Ok(())
}
