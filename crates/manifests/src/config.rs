//! Operator configuration: container images, Prometheus Operator placement and
//! cluster-facing knobs used by the client.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Toleration;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_NAMESPACE_SELECTOR: &str = "openshift.io/cluster-monitoring=true";
pub const DEFAULT_CRD_READY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub images: Images,
    pub prometheus_operator: PrometheusOperatorConfig,
    /// Label selector picking the namespaces the operator must watch.
    pub namespace_selector: String,
    /// Upper bound for the monitoring CRDs to become established.
    pub crd_ready_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            images: Images::default(),
            prometheus_operator: PrometheusOperatorConfig::default(),
            namespace_selector: DEFAULT_NAMESPACE_SELECTOR.to_string(),
            crd_ready_timeout_secs: DEFAULT_CRD_READY_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Images {
    pub prometheus_operator: String,
    pub prometheus_config_reloader: String,
    pub kube_rbac_proxy: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            prometheus_operator: "quay.io/prometheus-operator/prometheus-operator:v0.42.1".into(),
            prometheus_config_reloader: "quay.io/prometheus-operator/prometheus-config-reloader:v0.42.1".into(),
            kube_rbac_proxy: "quay.io/brancz/kube-rbac-proxy:v0.8.0".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusOperatorConfig {
    pub log_level: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("parsing operator config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg = Self::from_yaml(&raw).with_context(|| format!("loading config {}", path.display()))?;
        debug!(path = %path.display(), "operator config loaded");
        Ok(cfg)
    }

    /// Image overrides from CMO_IMAGE_* environment variables.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|k| std::env::var(k).ok());
        self
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CMO_IMAGE_PROMETHEUS_OPERATOR") { self.images.prometheus_operator = v; }
        if let Some(v) = var("CMO_IMAGE_PROMETHEUS_CONFIG_RELOADER") { self.images.prometheus_config_reloader = v; }
        if let Some(v) = var("CMO_IMAGE_KUBE_RBAC_PROXY") { self.images.kube_rbac_proxy = v; }
    }
}
