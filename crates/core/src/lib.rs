//! Core types shared by the factory, the cluster client and the reconciliation tasks.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Object kinds a task builds from templates and applies to the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Service,
    Deployment,
    ServiceMonitor,
}

impl ManagedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagedKind::ServiceAccount => "ServiceAccount",
            ManagedKind::ClusterRole => "ClusterRole",
            ManagedKind::ClusterRoleBinding => "ClusterRoleBinding",
            ManagedKind::Service => "Service",
            ManagedKind::Deployment => "Deployment",
            ManagedKind::ServiceMonitor => "ServiceMonitor",
        }
    }

    pub fn namespaced(self) -> bool {
        !matches!(self, ManagedKind::ClusterRole | ManagedKind::ClusterRoleBinding)
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Identity of a single desired object: (kind, namespace, name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: ManagedKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ManagedKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Kinds of deprecated objects a task knows how to remove.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LegacyKind {
    ValidatingWebhookConfiguration,
}

impl LegacyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LegacyKind::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
        }
    }
}

/// A deprecated cluster object that must be removed if present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyObject {
    pub kind: LegacyKind,
    pub name: &'static str,
    /// Version boundary that retired the object.
    pub deprecated_in: &'static str,
}

/// Admission webhook for PrometheusRule validation shipped up to 4.5 and dropped in 4.6.
/// It is removed on every run so that downgrades never leave it behind.
pub const PROMETHEUS_RULES_WEBHOOK: LegacyObject = LegacyObject {
    kind: LegacyKind::ValidatingWebhookConfiguration,
    name: "prometheusrules.openshift.io",
    deprecated_in: "4.6",
};

impl fmt::Display for LegacyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (deprecated in {})", self.kind.as_str(), self.name, self.deprecated_in)
    }
}

/// Ordered set of namespace names to monitor, computed from live cluster state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceSet(Vec<String>);

impl NamespaceSet {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn iter(&self) -> impl Iterator<Item = &str> { self.0.iter().map(|s| s.as_str()) }
    pub fn joined(&self, sep: &str) -> String { self.0.join(sep) }
    pub fn as_slice(&self) -> &[String] { &self.0 }
}

impl From<Vec<String>> for NamespaceSet {
    fn from(v: Vec<String>) -> Self { Self(v) }
}

impl<S: Into<String>> FromIterator<S> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self { Self(iter.into_iter().map(Into::into).collect()) }
}

/// Which kind of collaborator call a failed step was making.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    /// Removing a legacy object failed for a reason other than absence.
    Delete,
    /// The factory could not construct a desired object.
    SpecBuild,
    /// The cluster rejected or failed to persist a create-or-update.
    Apply,
    /// Enumerating the namespaces to monitor failed.
    Facts,
    /// The custom API types never became available.
    Readiness,
}

/// Failure of a reconciliation run, labelled with the step that failed.
#[derive(Debug, thiserror::Error)]
#[error("{label}")]
pub struct ReconcileError {
    label: &'static str,
    kind: FailureKind,
    #[source]
    source: anyhow::Error,
}

impl ReconcileError {
    pub fn new(label: &'static str, kind: FailureKind, source: anyhow::Error) -> Self {
        Self { label, kind, source }
    }

    pub fn label(&self) -> &'static str { self.label }
    pub fn kind(&self) -> FailureKind { self.kind }
    pub fn cause(&self) -> &anyhow::Error { &self.source }
}

pub type ReconcileResult<T = ()> = Result<T, ReconcileError>;
