use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use cmo_client::{ClientSettings, KubeClient};
use cmo_core::NamespaceSet;
use cmo_manifests::{Config, Factory, SpecFactory};
use cmo_tasks::{PrometheusOperatorTask, PLAN};

#[derive(Parser, Debug)]
#[command(name = "cmoctl", version, about = "Monitoring stack reconciliation")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace the monitoring stack is deployed into
    #[arg(long = "namespace", env = "CMO_NAMESPACE", global = true, default_value = "openshift-monitoring")]
    namespace: String,

    /// Operator config file (YAML)
    #[arg(long = "config", env = "CMO_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass of the Prometheus Operator task
    Reconcile,
    /// Print the desired objects without contacting the cluster
    Render {
        /// Comma-separated namespaces for the Deployment (default: none)
        #[arg(long = "namespaces", default_value = "")]
        namespaces: String,
    },
    /// Print the ordered steps and their failure labels
    Plan,
}

fn init_tracing() {
    let env = std::env::var("CMO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CMO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CMO_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let cfg = match path {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    Ok(cfg.apply_env())
}

fn parse_namespaces(s: &str) -> NamespaceSet {
    s.split(',').map(str::trim).filter(|n| !n.is_empty()).collect()
}

fn render(factory: &Factory, namespaces: &NamespaceSet) -> Result<Vec<serde_json::Value>> {
    Ok(vec![
        serde_json::to_value(factory.service_account()?)?,
        serde_json::to_value(factory.cluster_role()?)?,
        serde_json::to_value(factory.cluster_role_binding()?)?,
        serde_json::to_value(factory.service()?)?,
        serde_json::to_value(factory.deployment(namespaces)?)?,
        serde_json::to_value(factory.service_monitor()?)?,
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Plan => match cli.output {
            Output::Human => {
                for (i, step) in PLAN.iter().enumerate() {
                    println!("{:>2}. {}", i + 1, step);
                    for label in step.labels() {
                        println!("      on failure: {}", label);
                    }
                }
            }
            Output::Json => {
                let steps: Vec<_> = PLAN
                    .iter()
                    .map(|s| serde_json::json!({ "step": s.to_string(), "labels": s.labels() }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&steps)?);
            }
        },
        Commands::Render { namespaces } => {
            let factory = Factory::new(cli.namespace.clone(), cfg);
            let objs = render(&factory, &parse_namespaces(&namespaces)).context("rendering desired objects")?;
            match cli.output {
                Output::Human => {
                    for o in objs {
                        println!("---\n{}", serde_yaml::to_string(&o)?.trim_end());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&objs)?),
            }
        }
        Commands::Reconcile => {
            let settings = ClientSettings {
                namespace_selector: cfg.namespace_selector.clone(),
                crd_ready_timeout: Duration::from_secs(cfg.crd_ready_timeout_secs),
            };
            let client = Arc::new(KubeClient::try_default(settings).await?);
            let factory = Arc::new(Factory::new(cli.namespace.clone(), cfg));
            info!(namespace = %cli.namespace, "reconcile invoked");
            let task = PrometheusOperatorTask::new(client, factory);
            match task.run().await {
                Ok(()) => match cli.output {
                    Output::Human => println!("prometheus-operator reconciled"),
                    Output::Json => println!("{}", serde_json::json!({ "ok": true })),
                },
                Err(e) => {
                    error!(label = e.label(), error = %format!("{:#}", e.cause()), "reconcile failed");
                    match cli.output {
                        Output::Human => eprintln!("{}: {:#}", e, e.cause()),
                        Output::Json => println!(
                            "{}",
                            serde_json::json!({ "ok": false, "label": e.label(), "kind": e.kind(), "error": format!("{:#}", e.cause()) })
                        ),
                    }
                    std::process::exit(1);
                }
            }
        }
    }
    Ok(())
}
