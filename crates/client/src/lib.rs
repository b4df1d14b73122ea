//! Cluster client used by reconciliation tasks.
//!
//! Every mutation is safe to repeat: applies are server-side apply with a fixed
//! field manager, deletes treat "not found" as success.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::{
    admissionregistration::v1::ValidatingWebhookConfiguration,
    apps::v1::Deployment,
    core::v1::{Namespace, Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::wait::{await_condition, conditions},
    Client, Resource, ResourceExt,
};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use cmo_core::NamespaceSet;

pub const FIELD_MANAGER: &str = "cluster-monitoring-operator";

/// CRDs installed by the Prometheus Operator; objects of these kinds can only be
/// created once all of them are established.
pub const MONITORING_CRDS: &[&str] = &[
    "prometheuses.monitoring.coreos.com",
    "alertmanagers.monitoring.coreos.com",
    "servicemonitors.monitoring.coreos.com",
    "podmonitors.monitoring.coreos.com",
    "probes.monitoring.coreos.com",
    "prometheusrules.monitoring.coreos.com",
    "thanosrulers.monitoring.coreos.com",
];

/// Cluster operations a reconciliation task sequences.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Delete if present; absence is success.
    async fn delete_validating_webhook_configuration(&self, name: &str) -> Result<()>;

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()>;
    async fn apply_cluster_role(&self, cr: &ClusterRole) -> Result<()>;
    async fn apply_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<()>;
    async fn apply_service(&self, svc: &Service) -> Result<()>;
    async fn apply_deployment(&self, d: &Deployment) -> Result<()>;
    async fn apply_service_monitor(&self, sm: &DynamicObject) -> Result<()>;

    /// Namespaces the Prometheus Operator has to watch.
    async fn namespaces_to_monitor(&self) -> Result<NamespaceSet>;

    /// Block until the monitoring CRDs are served, or fail after an internal bound.
    async fn wait_for_monitoring_crds_ready(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Label selector for `namespaces_to_monitor`.
    pub namespace_selector: String,
    pub crd_ready_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self { namespace_selector: "openshift.io/cluster-monitoring=true".into(), crd_ready_timeout: Duration::from_secs(300) }
    }
}

/// `ClusterClient` backed by kube-rs.
pub struct KubeClient {
    client: Client,
    settings: ClientSettings,
}

impl KubeClient {
    pub fn new(client: Client, settings: ClientSettings) -> Self { Self { client, settings } }

    /// Client for the current kubeconfig context or in-cluster service account.
    pub async fn try_default(settings: ClientSettings) -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self::new(client, settings))
    }

    pub fn settings(&self) -> &ClientSettings { &self.settings }

    async fn apply_namespaced<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    {
        let name = obj.name_any();
        let ns = obj.namespace().ok_or_else(|| anyhow!("{} {} has no namespace", K::kind(&()), name))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &ns);
        server_side_apply(&api, &K::kind(&()), &name, obj).await
    }

    async fn apply_cluster<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    {
        let name = obj.name_any();
        let api: Api<K> = Api::all(self.client.clone());
        server_side_apply(&api, &K::kind(&()), &name, obj).await
    }
}

async fn server_side_apply<K, P>(api: &Api<K>, kind: &str, name: &str, obj: &P) -> Result<()>
where
    K: Clone + Debug + DeserializeOwned,
    P: Serialize + Debug,
{
    let t0 = Instant::now();
    counter!("cmo_client_apply_total", 1u64);
    let pp = PatchParams::apply(FIELD_MANAGER).force();
    match api.patch(name, &pp, &Patch::Apply(obj)).await {
        Ok(_) => {
            histogram!("cmo_client_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            debug!(kind, name, "applied");
            Ok(())
        }
        Err(e) => {
            counter!("cmo_client_apply_errors_total", 1u64);
            Err(anyhow::Error::new(e).context(format!("server-side apply of {} {} failed", kind, name)))
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn service_monitor_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor"))
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn delete_validating_webhook_configuration(&self, name: &str) -> Result<()> {
        counter!("cmo_client_delete_total", 1u64);
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(name, "deleted ValidatingWebhookConfiguration");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(name, "ValidatingWebhookConfiguration already absent");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("deleting ValidatingWebhookConfiguration {}", name))),
        }
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()> { self.apply_namespaced(sa).await }
    async fn apply_cluster_role(&self, cr: &ClusterRole) -> Result<()> { self.apply_cluster(cr).await }
    async fn apply_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<()> { self.apply_cluster(crb).await }
    async fn apply_service(&self, svc: &Service) -> Result<()> { self.apply_namespaced(svc).await }
    async fn apply_deployment(&self, d: &Deployment) -> Result<()> { self.apply_namespaced(d).await }

    async fn apply_service_monitor(&self, sm: &DynamicObject) -> Result<()> {
        let name = sm.name_any();
        let ns = sm.namespace().ok_or_else(|| anyhow!("ServiceMonitor {} has no namespace", name))?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &ns, &service_monitor_resource());
        server_side_apply(&api, "ServiceMonitor", &name, sm).await
    }

    async fn namespaces_to_monitor(&self) -> Result<NamespaceSet> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&self.settings.namespace_selector);
        let list = api
            .list(&lp)
            .await
            .with_context(|| format!("listing namespaces with selector {}", self.settings.namespace_selector))?;
        let mut names: Vec<String> = list.items.iter().map(|n| n.name_any()).collect();
        names.sort();
        debug!(count = names.len(), selector = %self.settings.namespace_selector, "namespaces to monitor");
        Ok(names.into())
    }

    async fn wait_for_monitoring_crds_ready(&self) -> Result<()> {
        let t0 = Instant::now();
        let deadline = t0 + self.settings.crd_ready_timeout;
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        for crd in MONITORING_CRDS {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, await_condition(api.clone(), crd, conditions::is_crd_established())).await {
                Ok(Ok(_)) => debug!(crd, "CRD established"),
                Ok(Err(e)) => return Err(anyhow::Error::new(e).context(format!("watching CRD {}", crd))),
                Err(_) => {
                    return Err(anyhow!(
                        "timed out after {:?} waiting for CRD {} to be established",
                        self.settings.crd_ready_timeout,
                        crd
                    ))
                }
            }
        }
        histogram!("cmo_client_crd_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(crds = MONITORING_CRDS.len(), "monitoring CRDs established");
        Ok(())
    }
}
