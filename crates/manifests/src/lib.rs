//! Desired-state factory: turns embedded manifest templates plus operator
//! configuration into ready-to-apply objects.
//!
//! Building is pure: no cluster access, same inputs give the same objects.
//! Errors mean a broken template or an unusable configuration.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding},
};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use cmo_core::NamespaceSet;

pub mod config;

pub use config::{Config, Images, PrometheusOperatorConfig};

pub const OPERATOR_CONTAINER: &str = "prometheus-operator";
pub const RBAC_PROXY_CONTAINER: &str = "kube-rbac-proxy";

/// Builds the desired objects of the Prometheus Operator component.
pub trait SpecFactory: Send + Sync {
    fn service_account(&self) -> Result<ServiceAccount>;
    fn cluster_role(&self) -> Result<ClusterRole>;
    fn cluster_role_binding(&self) -> Result<ClusterRoleBinding>;
    fn service(&self) -> Result<Service>;
    /// Deployment watching exactly `namespaces` (possibly none).
    fn deployment(&self, namespaces: &NamespaceSet) -> Result<Deployment>;
    /// Dynamic because the kind is only served once the monitoring CRDs exist.
    fn service_monitor(&self) -> Result<DynamicObject>;
}

/// Raw YAML templates, one per object.
#[derive(Debug, Clone, Copy)]
pub struct Assets {
    pub service_account: &'static str,
    pub cluster_role: &'static str,
    pub cluster_role_binding: &'static str,
    pub service: &'static str,
    pub deployment: &'static str,
    pub service_monitor: &'static str,
}

impl Default for Assets {
    fn default() -> Self {
        Self {
            service_account: include_str!("../assets/prometheus-operator/service-account.yaml"),
            cluster_role: include_str!("../assets/prometheus-operator/cluster-role.yaml"),
            cluster_role_binding: include_str!("../assets/prometheus-operator/cluster-role-binding.yaml"),
            service: include_str!("../assets/prometheus-operator/service.yaml"),
            deployment: include_str!("../assets/prometheus-operator/deployment.yaml"),
            service_monitor: include_str!("../assets/prometheus-operator/service-monitor.yaml"),
        }
    }
}

pub struct Factory {
    namespace: String,
    config: Config,
    assets: Assets,
}

impl Factory {
    pub fn new(namespace: impl Into<String>, config: Config) -> Self {
        Self::with_assets(namespace, config, Assets::default())
    }

    pub fn with_assets(namespace: impl Into<String>, config: Config, assets: Assets) -> Self {
        Self { namespace: namespace.into(), config, assets }
    }

    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn config(&self) -> &Config { &self.config }
}

fn parse_asset<T: DeserializeOwned>(name: &str, raw: &str) -> Result<T> {
    let val: serde_yaml::Value = serde_yaml::from_str(raw).with_context(|| format!("parsing {} template", name))?;
    let json = serde_json::to_value(val).with_context(|| format!("converting {} template to JSON", name))?;
    serde_json::from_value(json).with_context(|| format!("decoding {} template", name))
}

fn require_image<'a>(what: &str, image: &'a str) -> Result<&'a str> {
    if image.trim().is_empty() {
        return Err(anyhow!("{} image is not configured", what));
    }
    Ok(image)
}

/// Replace the argument starting with `prefix`, or append it.
fn set_arg(args: &mut Vec<String>, prefix: &str, value: &str) {
    let arg = format!("{}{}", prefix, value);
    match args.iter_mut().find(|a| a.starts_with(prefix)) {
        Some(existing) => *existing = arg,
        None => args.push(arg),
    }
}

impl SpecFactory for Factory {
    fn service_account(&self) -> Result<ServiceAccount> {
        let mut sa: ServiceAccount = parse_asset("ServiceAccount", self.assets.service_account)?;
        sa.metadata.namespace = Some(self.namespace.clone());
        Ok(sa)
    }

    fn cluster_role(&self) -> Result<ClusterRole> {
        parse_asset("ClusterRole", self.assets.cluster_role)
    }

    fn cluster_role_binding(&self) -> Result<ClusterRoleBinding> {
        let mut crb: ClusterRoleBinding = parse_asset("ClusterRoleBinding", self.assets.cluster_role_binding)?;
        for subject in crb.subjects.iter_mut().flatten() {
            if subject.kind == "ServiceAccount" {
                subject.namespace = Some(self.namespace.clone());
            }
        }
        Ok(crb)
    }

    fn service(&self) -> Result<Service> {
        let mut svc: Service = parse_asset("Service", self.assets.service)?;
        svc.metadata.namespace = Some(self.namespace.clone());
        Ok(svc)
    }

    fn deployment(&self, namespaces: &NamespaceSet) -> Result<Deployment> {
        let images = &self.config.images;
        let po = &self.config.prometheus_operator;
        let operator_image = require_image("prometheus-operator", &images.prometheus_operator)?;
        let reloader_image = require_image("prometheus-config-reloader", &images.prometheus_config_reloader)?;
        let proxy_image = require_image("kube-rbac-proxy", &images.kube_rbac_proxy)?;

        let mut d: Deployment = parse_asset("Deployment", self.assets.deployment)?;
        d.metadata.namespace = Some(self.namespace.clone());
        let pod = d
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .ok_or_else(|| anyhow!("Deployment template has no pod spec"))?;

        if !po.node_selector.is_empty() {
            pod.node_selector = Some(po.node_selector.clone());
        }
        if !po.tolerations.is_empty() {
            pod.tolerations = Some(po.tolerations.clone());
        }

        let mut found_operator = false;
        for c in pod.containers.iter_mut() {
            match c.name.as_str() {
                OPERATOR_CONTAINER => {
                    found_operator = true;
                    c.image = Some(operator_image.to_string());
                    let args = c.args.get_or_insert_with(Vec::new);
                    if let Some(level) = po.log_level.as_deref().filter(|l| !l.is_empty()) {
                        set_arg(args, "--log-level=", level);
                    }
                    set_arg(args, "--prometheus-config-reloader=", reloader_image);
                    set_arg(args, "--namespaces=", &namespaces.joined(","));
                }
                RBAC_PROXY_CONTAINER => c.image = Some(proxy_image.to_string()),
                _ => {}
            }
        }
        if !found_operator {
            return Err(anyhow!("Deployment template has no {} container", OPERATOR_CONTAINER));
        }
        debug!(namespaces = namespaces.len(), "built prometheus-operator deployment");
        Ok(d)
    }

    fn service_monitor(&self) -> Result<DynamicObject> {
        let mut sm: DynamicObject = parse_asset("ServiceMonitor", self.assets.service_monitor)?;
        match sm.types.as_ref() {
            Some(t) if t.kind == "ServiceMonitor" && t.api_version == "monitoring.coreos.com/v1" => {}
            other => return Err(anyhow!("ServiceMonitor template has unexpected type {:?}", other)),
        }
        sm.metadata.namespace = Some(self.namespace.clone());
        let server_name = format!("prometheus-operator.{}.svc", self.namespace);
        let spec = sm
            .data
            .get_mut("spec")
            .and_then(|s| s.as_object_mut())
            .ok_or_else(|| anyhow!("ServiceMonitor template has no spec"))?;
        spec.insert("namespaceSelector".into(), json!({ "matchNames": [self.namespace] }));
        if let Some(endpoints) = spec.get_mut("endpoints").and_then(|e| e.as_array_mut()) {
            for ep in endpoints.iter_mut() {
                if let Some(tls) = ep.get_mut("tlsConfig").and_then(|t| t.as_object_mut()) {
                    tls.insert("serverName".into(), json!(server_name));
                }
            }
        }
        Ok(sm)
    }
}
