//! Prometheus Operator: legacy cleanup, RBAC, service, deployment, then the
//! self-monitoring ServiceMonitor once the CRDs it relies on are served.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use kube::core::ObjectMeta;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use cmo_client::ClusterClient;
use cmo_core::{
    FailureKind, LegacyKind, LegacyObject, ManagedKind, NamespaceSet, ObjectRef, ReconcileError, ReconcileResult,
    PROMETHEUS_RULES_WEBHOOK,
};
use cmo_manifests::SpecFactory;

const TASK: &str = "prometheus-operator";

/// One unit of work in a task's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Delete a deprecated object if it exists.
    DeleteLegacy(LegacyObject),
    /// Build the desired object from the factory, then create-or-update it.
    Apply(ManagedKind),
    /// Read the namespaces to monitor; consumed by `Apply(Deployment)`.
    GatherNamespaces,
    /// Block until the monitoring CRDs are established.
    AwaitCrds,
}

/// Execution order. The webhook delete runs unconditionally on every pass:
/// it must be gone after both upgrades and downgrades across 4.6.
pub const PLAN: [Step; 9] = [
    Step::DeleteLegacy(PROMETHEUS_RULES_WEBHOOK),
    Step::Apply(ManagedKind::ServiceAccount),
    Step::Apply(ManagedKind::ClusterRole),
    Step::Apply(ManagedKind::ClusterRoleBinding),
    Step::Apply(ManagedKind::Service),
    Step::GatherNamespaces,
    Step::Apply(ManagedKind::Deployment),
    Step::AwaitCrds,
    Step::Apply(ManagedKind::ServiceMonitor),
];

impl Step {
    /// Every label a failure of this step can carry. `Apply` steps have two:
    /// building the object, then reconciling it against the cluster.
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            Step::DeleteLegacy(legacy) => match legacy.kind {
                LegacyKind::ValidatingWebhookConfiguration => {
                    &["reconciling Prometheus Operator ValidatingWebhookConfiguration failed"]
                }
            },
            Step::Apply(kind) => match kind {
                ManagedKind::ServiceAccount => &[
                    "initializing Prometheus Operator ServiceAccount failed",
                    "reconciling Prometheus Operator ServiceAccount failed",
                ],
                ManagedKind::ClusterRole => &[
                    "initializing Prometheus Operator ClusterRole failed",
                    "reconciling Prometheus Operator ClusterRole failed",
                ],
                ManagedKind::ClusterRoleBinding => &[
                    "initializing Prometheus Operator ClusterRoleBinding failed",
                    "reconciling Prometheus Operator ClusterRoleBinding failed",
                ],
                ManagedKind::Service => &[
                    "initializing Prometheus Operator Service failed",
                    "reconciling Prometheus Operator Service failed",
                ],
                ManagedKind::Deployment => &[
                    "initializing Prometheus Operator Deployment failed",
                    "reconciling Prometheus Operator Deployment failed",
                ],
                ManagedKind::ServiceMonitor => &[
                    "initializing Prometheus Operator ServiceMonitor failed",
                    "reconciling Prometheus Operator ServiceMonitor failed",
                ],
            },
            Step::GatherNamespaces => &["listing namespaces to monitor failed"],
            Step::AwaitCrds => &["waiting for Prometheus CRDs to become available failed"],
        }
    }

    /// Label for a failure of `kind` in this step.
    pub fn label(&self, kind: FailureKind) -> &'static str {
        let labels = self.labels();
        match (self, kind) {
            (Step::Apply(_), FailureKind::SpecBuild) => labels[0],
            (Step::Apply(_), _) => labels[1],
            _ => labels[0],
        }
    }

    fn fail(&self, kind: FailureKind, source: anyhow::Error) -> ReconcileError {
        ReconcileError::new(self.label(kind), kind, source)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::DeleteLegacy(legacy) => write!(f, "delete {}", legacy),
            Step::Apply(kind) => write!(f, "apply {}", kind),
            Step::GatherNamespaces => f.write_str("gather namespaces to monitor"),
            Step::AwaitCrds => f.write_str("await monitoring CRDs"),
        }
    }
}

/// Reconciles the Prometheus Operator deployment and its supporting objects.
pub struct PrometheusOperatorTask<C: ?Sized, F: ?Sized> {
    client: Arc<C>,
    factory: Arc<F>,
}

impl<C, F> PrometheusOperatorTask<C, F>
where
    C: ClusterClient + ?Sized,
    F: SpecFactory + ?Sized,
{
    pub fn new(client: Arc<C>, factory: Arc<F>) -> Self { Self { client, factory } }

    pub fn plan(&self) -> &'static [Step] { &PLAN }

    /// Run the plan once, stopping at the first failing step.
    pub async fn run(&self) -> ReconcileResult {
        let t0 = Instant::now();
        counter!("cmo_reconcile_runs_total", 1u64);
        info!(task = TASK, steps = PLAN.len(), "reconciling");
        let mut namespaces: Option<NamespaceSet> = None;
        for step in PLAN.iter() {
            debug!(task = TASK, step = %step, "step starting");
            if let Err(e) = self.run_step(step, &mut namespaces).await {
                counter!("cmo_reconcile_failures_total", 1u64);
                warn!(task = TASK, step = %step, label = e.label(), error = %format!("{:#}", e.cause()), "reconcile aborted");
                return Err(e);
            }
        }
        histogram!("cmo_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(task = TASK, elapsed_ms = t0.elapsed().as_millis() as u64, "reconciled");
        Ok(())
    }

    async fn run_step(&self, step: &Step, namespaces: &mut Option<NamespaceSet>) -> ReconcileResult {
        match *step {
            Step::DeleteLegacy(legacy) => match legacy.kind {
                LegacyKind::ValidatingWebhookConfiguration => self
                    .client
                    .delete_validating_webhook_configuration(legacy.name)
                    .await
                    .map_err(|e| step.fail(FailureKind::Delete, e)),
            },
            Step::Apply(kind) => self.build_and_apply(step, kind, namespaces.as_ref()).await,
            Step::GatherNamespaces => {
                let ns = self.client.namespaces_to_monitor().await.map_err(|e| step.fail(FailureKind::Facts, e))?;
                if ns.is_empty() {
                    warn!(task = TASK, "no namespaces to monitor");
                }
                *namespaces = Some(ns);
                Ok(())
            }
            Step::AwaitCrds => {
                self.client.wait_for_monitoring_crds_ready().await.map_err(|e| step.fail(FailureKind::Readiness, e))
            }
        }
    }

    async fn build_and_apply(&self, step: &Step, kind: ManagedKind, namespaces: Option<&NamespaceSet>) -> ReconcileResult {
        let build = |e| step.fail(FailureKind::SpecBuild, e);
        let apply = |e| step.fail(FailureKind::Apply, e);
        let (c, f) = (&*self.client, &*self.factory);
        match kind {
            ManagedKind::ServiceAccount => {
                let sa = f.service_account().map_err(build)?;
                log_apply(kind, &sa.metadata);
                c.apply_service_account(&sa).await.map_err(apply)
            }
            ManagedKind::ClusterRole => {
                let cr = f.cluster_role().map_err(build)?;
                log_apply(kind, &cr.metadata);
                c.apply_cluster_role(&cr).await.map_err(apply)
            }
            ManagedKind::ClusterRoleBinding => {
                let crb = f.cluster_role_binding().map_err(build)?;
                log_apply(kind, &crb.metadata);
                c.apply_cluster_role_binding(&crb).await.map_err(apply)
            }
            ManagedKind::Service => {
                let svc = f.service().map_err(build)?;
                log_apply(kind, &svc.metadata);
                c.apply_service(&svc).await.map_err(apply)
            }
            ManagedKind::Deployment => {
                let ns = namespaces.ok_or_else(|| build(anyhow!("namespaces to monitor were not gathered")))?;
                let d = f.deployment(ns).map_err(build)?;
                log_apply(kind, &d.metadata);
                c.apply_deployment(&d).await.map_err(apply)
            }
            ManagedKind::ServiceMonitor => {
                let sm = f.service_monitor().map_err(build)?;
                log_apply(kind, &sm.metadata);
                c.apply_service_monitor(&sm).await.map_err(apply)
            }
        }
    }
}

fn log_apply(kind: ManagedKind, meta: &ObjectMeta) {
    let obj = ObjectRef::new(kind, meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());
    debug!(task = TASK, object = %obj, "applying");
}
