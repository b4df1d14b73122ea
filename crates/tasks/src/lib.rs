//! Reconciliation tasks.
//!
//! A task drives one component of the monitoring stack to its desired state in a
//! single pass. Its steps are declared as data (`PLAN`) and executed strictly in
//! order; the first failure aborts the pass with the step's label attached.
//! Every step is idempotent, so callers retry by running the task again.

#![forbid(unsafe_code)]

pub mod prometheus_operator;

pub use prometheus_operator::{PrometheusOperatorTask, Step, PLAN};
