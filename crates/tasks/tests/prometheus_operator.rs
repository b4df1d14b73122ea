#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::core::DynamicObject;

use cmo_client::ClusterClient;
use cmo_core::{FailureKind, NamespaceSet, PROMETHEUS_RULES_WEBHOOK};
use cmo_manifests::{Config, Factory, SpecFactory};
use cmo_tasks::PrometheusOperatorTask;

const NS: &str = "openshift-monitoring";

/// In-memory cluster: records every call and keeps applied objects keyed by
/// `Kind ns/name`, counting writes that actually changed something.
#[derive(Default)]
struct FakeCluster {
    calls: Mutex<Vec<String>>,
    objects: Mutex<BTreeMap<String, serde_json::Value>>,
    webhooks: Mutex<Vec<String>>,
    changes: Mutex<usize>,
    namespaces: Vec<String>,
    fail_on: Option<&'static str>,
}

impl FakeCluster {
    fn with_namespaces(ns: &[&str]) -> Self {
        Self { namespaces: ns.iter().map(|s| s.to_string()).collect(), ..Default::default() }
    }

    fn failing(mut self, call: &'static str) -> Self {
        self.fail_on = Some(call);
        self
    }

    fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }
    fn changes(&self) -> usize { *self.changes.lock().unwrap() }
    fn object(&self, key: &str) -> Option<serde_json::Value> { self.objects.lock().unwrap().get(key).cloned() }

    fn record(&self, call: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.fail_on == Some(call) {
            return Err(anyhow!("injected failure in {}", call));
        }
        Ok(())
    }

    fn store<T: serde::Serialize>(&self, call: &'static str, kind: &str, meta: &kube::core::ObjectMeta, obj: &T) -> Result<()> {
        self.record(call)?;
        let key = format!("{} {}/{}", kind, meta.namespace.as_deref().unwrap_or(""), meta.name.as_deref().unwrap_or(""));
        let val = serde_json::to_value(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.get(&key) != Some(&val) {
            objects.insert(key, val);
            *self.changes.lock().unwrap() += 1;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn delete_validating_webhook_configuration(&self, name: &str) -> Result<()> {
        self.record("delete_validating_webhook_configuration")?;
        let mut hooks = self.webhooks.lock().unwrap();
        if let Some(pos) = hooks.iter().position(|h| h == name) {
            hooks.remove(pos);
            *self.changes.lock().unwrap() += 1;
        }
        Ok(())
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()> {
        self.store("apply_service_account", "ServiceAccount", &sa.metadata, sa)
    }

    async fn apply_cluster_role(&self, cr: &ClusterRole) -> Result<()> {
        self.store("apply_cluster_role", "ClusterRole", &cr.metadata, cr)
    }

    async fn apply_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<()> {
        self.store("apply_cluster_role_binding", "ClusterRoleBinding", &crb.metadata, crb)
    }

    async fn apply_service(&self, svc: &Service) -> Result<()> {
        self.store("apply_service", "Service", &svc.metadata, svc)
    }

    async fn apply_deployment(&self, d: &Deployment) -> Result<()> {
        self.store("apply_deployment", "Deployment", &d.metadata, d)
    }

    async fn apply_service_monitor(&self, sm: &DynamicObject) -> Result<()> {
        self.store("apply_service_monitor", "ServiceMonitor", &sm.metadata, sm)
    }

    async fn namespaces_to_monitor(&self) -> Result<NamespaceSet> {
        self.record("namespaces_to_monitor")?;
        Ok(self.namespaces.clone().into())
    }

    async fn wait_for_monitoring_crds_ready(&self) -> Result<()> {
        self.record("wait_for_monitoring_crds_ready")
    }
}

/// Real factory with failure injection and a record of deployment inputs.
struct ScriptedFactory {
    inner: Factory,
    fail_on: Option<&'static str>,
    deployment_inputs: Mutex<Vec<NamespaceSet>>,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self { inner: Factory::new(NS, Config::default()), fail_on: None, deployment_inputs: Mutex::new(Vec::new()) }
    }

    fn failing(mut self, build: &'static str) -> Self {
        self.fail_on = Some(build);
        self
    }

    fn check(&self, build: &'static str) -> Result<()> {
        if self.fail_on == Some(build) {
            return Err(anyhow!("template {} is broken", build));
        }
        Ok(())
    }
}

impl SpecFactory for ScriptedFactory {
    fn service_account(&self) -> Result<ServiceAccount> {
        self.check("service_account")?;
        self.inner.service_account()
    }

    fn cluster_role(&self) -> Result<ClusterRole> {
        self.check("cluster_role")?;
        self.inner.cluster_role()
    }

    fn cluster_role_binding(&self) -> Result<ClusterRoleBinding> {
        self.check("cluster_role_binding")?;
        self.inner.cluster_role_binding()
    }

    fn service(&self) -> Result<Service> {
        self.check("service")?;
        self.inner.service()
    }

    fn deployment(&self, namespaces: &NamespaceSet) -> Result<Deployment> {
        self.deployment_inputs.lock().unwrap().push(namespaces.clone());
        self.check("deployment")?;
        self.inner.deployment(namespaces)
    }

    fn service_monitor(&self) -> Result<DynamicObject> {
        self.check("service_monitor")?;
        self.inner.service_monitor()
    }
}

fn task(cluster: &Arc<FakeCluster>, factory: &Arc<ScriptedFactory>) -> PrometheusOperatorTask<FakeCluster, ScriptedFactory> {
    PrometheusOperatorTask::new(cluster.clone(), factory.clone())
}

const FULL_SEQUENCE: [&str; 9] = [
    "delete_validating_webhook_configuration",
    "apply_service_account",
    "apply_cluster_role",
    "apply_cluster_role_binding",
    "apply_service",
    "namespaces_to_monitor",
    "apply_deployment",
    "wait_for_monitoring_crds_ready",
    "apply_service_monitor",
];

fn operator_args(d: &serde_json::Value) -> Vec<String> {
    let containers = d["spec"]["template"]["spec"]["containers"].as_array().cloned().unwrap_or_default();
    let c = containers.iter().find(|c| c["name"] == "prometheus-operator").expect("operator container");
    serde_json::from_value(c["args"].clone()).unwrap_or_default()
}

#[tokio::test]
async fn full_pass_calls_collaborators_in_plan_order() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]));
    let factory = Arc::new(ScriptedFactory::new());
    task(&cluster, &factory).run().await.expect("run succeeds");
    assert_eq!(cluster.calls(), FULL_SEQUENCE);
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a", "ns-b"]));
    cluster.webhooks.lock().unwrap().push(PROMETHEUS_RULES_WEBHOOK.name.to_string());
    let factory = Arc::new(ScriptedFactory::new());
    let t = task(&cluster, &factory);

    t.run().await.expect("first run");
    let after_first = cluster.changes();
    // six objects applied plus the webhook removal
    assert_eq!(after_first, 7);
    assert!(cluster.webhooks.lock().unwrap().is_empty());

    t.run().await.expect("second run");
    assert_eq!(cluster.changes(), after_first);
}

#[tokio::test]
async fn absent_legacy_webhook_is_not_an_error() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]));
    let factory = Arc::new(ScriptedFactory::new());
    task(&cluster, &factory).run().await.expect("run succeeds without webhook present");
    assert_eq!(cluster.calls()[1], "apply_service_account");
}

#[tokio::test]
async fn legacy_delete_failure_is_labelled() {
    let cluster = Arc::new(FakeCluster::default().failing("delete_validating_webhook_configuration"));
    let factory = Arc::new(ScriptedFactory::new());
    let err = task(&cluster, &factory).run().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Delete);
    assert_eq!(err.label(), "reconciling Prometheus Operator ValidatingWebhookConfiguration failed");
    assert_eq!(cluster.calls(), ["delete_validating_webhook_configuration"]);
}

#[tokio::test]
async fn cluster_role_apply_failure_stops_the_run() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]).failing("apply_cluster_role"));
    let factory = Arc::new(ScriptedFactory::new());
    let err = task(&cluster, &factory).run().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Apply);
    assert_eq!(err.label(), "reconciling Prometheus Operator ClusterRole failed");
    assert!(format!("{:#}", err.cause()).contains("injected failure in apply_cluster_role"));
    assert_eq!(cluster.calls(), FULL_SEQUENCE[..3]);
}

#[tokio::test]
async fn build_failure_uses_a_different_label_than_apply_failure() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]));
    let factory = Arc::new(ScriptedFactory::new().failing("cluster_role"));
    let err = task(&cluster, &factory).run().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::SpecBuild);
    assert_eq!(err.label(), "initializing Prometheus Operator ClusterRole failed");
    assert!(!cluster.calls().iter().any(|c| c == "apply_cluster_role"));
}

#[tokio::test]
async fn namespace_listing_failure_aborts_before_deployment() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]).failing("namespaces_to_monitor"));
    let factory = Arc::new(ScriptedFactory::new());
    let err = task(&cluster, &factory).run().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Facts);
    assert_eq!(err.label(), "listing namespaces to monitor failed");
    assert!(factory.deployment_inputs.lock().unwrap().is_empty());
    assert_eq!(cluster.calls().last().map(String::as_str), Some("namespaces_to_monitor"));
}

#[tokio::test]
async fn deployment_is_built_from_listed_namespaces() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a", "ns-b"]));
    let factory = Arc::new(ScriptedFactory::new());
    task(&cluster, &factory).run().await.expect("run succeeds");

    let inputs = factory.deployment_inputs.lock().unwrap().clone();
    let expected: NamespaceSet = ["ns-a", "ns-b"].into_iter().collect();
    assert_eq!(inputs, vec![expected.clone()]);

    let applied = cluster.object(&format!("Deployment {}/prometheus-operator", NS)).expect("deployment applied");
    let built = serde_json::to_value(factory.inner.deployment(&expected).unwrap()).unwrap();
    assert_eq!(applied, built);
    assert!(operator_args(&applied).contains(&"--namespaces=ns-a,ns-b".to_string()));
}

#[tokio::test]
async fn empty_namespace_set_still_completes() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&[]));
    let factory = Arc::new(ScriptedFactory::new());
    task(&cluster, &factory).run().await.expect("degenerate but valid");

    assert_eq!(cluster.calls(), FULL_SEQUENCE);
    let applied = cluster.object(&format!("Deployment {}/prometheus-operator", NS)).expect("deployment applied");
    assert!(operator_args(&applied).contains(&"--namespaces=".to_string()));
    assert!(cluster.object(&format!("ServiceMonitor {}/prometheus-operator", NS)).is_some());
}

#[tokio::test]
async fn service_monitor_never_applied_when_crds_not_ready() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]).failing("wait_for_monitoring_crds_ready"));
    let factory = Arc::new(ScriptedFactory::new());
    let err = task(&cluster, &factory).run().await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Readiness);
    assert_eq!(err.label(), "waiting for Prometheus CRDs to become available failed");
    assert!(!cluster.calls().iter().any(|c| c == "apply_service_monitor"));
    // the deployment was already applied before the gate
    assert!(cluster.object(&format!("Deployment {}/prometheus-operator", NS)).is_some());
}

#[tokio::test]
async fn rerun_after_readiness_failure_replays_from_the_top() {
    let failing = Arc::new(FakeCluster::with_namespaces(&["ns-a"]).failing("wait_for_monitoring_crds_ready"));
    let factory = Arc::new(ScriptedFactory::new());
    let t = task(&failing, &factory);
    assert!(t.run().await.is_err());
    assert!(t.run().await.is_err());
    let calls = failing.calls();
    assert_eq!(calls.len(), 16);
    assert_eq!(calls[8], "delete_validating_webhook_configuration");
    // the second pass re-applies identical objects
    assert_eq!(failing.changes(), 5);
}

#[tokio::test]
async fn service_monitor_build_failure_happens_after_gate() {
    let cluster = Arc::new(FakeCluster::with_namespaces(&["ns-a"]));
    let factory = Arc::new(ScriptedFactory::new().failing("service_monitor"));
    let err = task(&cluster, &factory).run().await.unwrap_err();
    assert_eq!(err.label(), "initializing Prometheus Operator ServiceMonitor failed");
    assert_eq!(cluster.calls().last().map(String::as_str), Some("wait_for_monitoring_crds_ready"));
}

#[tokio::test]
async fn task_works_behind_trait_objects() {
    let cluster: Arc<dyn ClusterClient> = Arc::new(FakeCluster::with_namespaces(&["ns-a"]));
    let factory: Arc<dyn SpecFactory> = Arc::new(Factory::new(NS, Config::default()));
    let t = PrometheusOperatorTask::new(cluster, factory);
    assert_eq!(t.plan().len(), 9);
    t.run().await.expect("run succeeds");
}
