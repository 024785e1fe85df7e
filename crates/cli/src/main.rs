use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use capsule_core::{Capsule, CapsuleStatus, OperatorConfig, OwnedResource, Scheme};
use capsule_kubehub::{start_capsule_watcher, KubeStore, ObjectStore};
use capsule_pipeline::{Pipeline, RunOptions, RunOutcome};
use capsule_steps::default_pipeline;
use clap::{Parser, Subcommand, ValueEnum};
use kube::{Api, Client, ResourceExt};
use metrics::{counter, describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use rustc_hash::FxHashMap;
use tokio::signal;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "capsulectl", version, about = "Reconcile Capsules into Kubernetes objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (default: current context; `run` watches all namespaces when unset)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Operator config file (YAML); falls back to CAPSULE_CONFIG
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log line format
    #[arg(long = "log-format", value_enum, global = true, env = "CAPSULE_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    /// One JSON object per line, with the capsule span fields attached
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once for a Capsule and print its owned resources
    Reconcile { name: String },
    /// Compute what a reconcile would do and print the objects as YAML
    DryRun { name: String },
    /// Print the status last published on a Capsule
    Status { name: String },
    /// Delete every object the Capsule owns, leaving the Capsule itself
    Delete { name: String },
    /// Watch Capsules and reconcile every event
    Run,
}

fn init_tracing(format: LogFormat) {
    let env = std::env::var("CAPSULE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match format {
        LogFormat::Text => fmt.init(),
        LogFormat::Json => fmt.json().with_current_span(true).with_span_list(false).init(),
    }
}

/// Run latency buckets, in milliseconds.
const RUN_LATENCY_BUCKETS_MS: &[f64] = &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];

fn describe_metrics() {
    describe_counter!("capsule_events_total", "Capsule watch events received");
    describe_counter!("capsule_events_coalesced_total", "Capsule events folded into a run already in progress");
    describe_counter!("pipeline_runs_total", "Pipeline runs started, by op (reconcile or delete)");
    describe_counter!("pipeline_run_ok", "Pipeline runs that finished successfully");
    describe_counter!("pipeline_run_err", "Pipeline runs that failed, by error kind");
    describe_counter!("pipeline_conflict_retries_total", "Attempts restarted after an owned object changed mid-run");
    describe_counter!("pipeline_objects_total", "Objects committed, by resulting state");
    describe_counter!("store_requests_total", "Backing store requests, by verb");
    describe_histogram!("pipeline_run_latency_ms", Unit::Milliseconds, "Wall time of one pipeline run");
}

fn init_metrics() {
    let Ok(addr) = std::env::var("CAPSULE_METRICS_ADDR") else {
        return;
    };
    let Ok(sock) = addr.parse::<std::net::SocketAddr>() else {
        warn!(addr = %addr, "invalid CAPSULE_METRICS_ADDR; expected host:port");
        return;
    };
    let builder = match PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full("pipeline_run_latency_ms".to_string()), RUN_LATENCY_BUCKETS_MS)
    {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "invalid latency buckets");
            PrometheusBuilder::new()
        }
    };
    match builder.with_http_listener(sock).install() {
        Ok(()) => {
            describe_metrics();
            info!(addr = %addr, "Prometheus metrics exporter listening");
        }
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    init_metrics();

    let config = Arc::new(OperatorConfig::load(cli.config.as_deref())?);
    let store = Arc::new(KubeStore::try_default().await?);
    let client = store.client();
    let pipeline = Arc::new(default_pipeline(
        store.clone() as Arc<dyn ObjectStore>,
        Arc::new(Scheme::builtin()),
        config.clone(),
    )?);
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());

    match cli.command {
        Commands::Reconcile { name } => {
            info!(ns = %ns, name = %name, "reconcile invoked");
            let capsule = fetch(&client, &ns, &name).await?;
            let outcome = pipeline.run(capsule).await?;
            print_status(outcome.capsule.status.as_ref(), cli.output)?;
        }
        Commands::DryRun { name } => {
            info!(ns = %ns, name = %name, "dry-run invoked");
            let capsule = fetch(&client, &ns, &name).await?;
            let outcome = pipeline.run_with(capsule, RunOptions { dry_run: true }).await?;
            print_objects(&outcome, cli.output)?;
        }
        Commands::Delete { name } => {
            info!(ns = %ns, name = %name, "delete invoked");
            let capsule = fetch(&client, &ns, &name).await?;
            let outcome = pipeline.delete_capsule(capsule, RunOptions::default()).await?;
            print_objects(&outcome, cli.output)?;
        }
        Commands::Status { name } => {
            let capsule = fetch(&client, &ns, &name).await?;
            print_status(capsule.status.as_ref(), cli.output)?;
        }
        Commands::Run => run_loop(client, cli.namespace, pipeline, config.workers).await?,
    }
    Ok(())
}

async fn fetch(client: &Client, ns: &str, name: &str) -> Result<Capsule> {
    Api::<Capsule>::namespaced(client.clone(), ns)
        .get(name)
        .await
        .with_context(|| format!("fetching capsule {ns}/{name}"))
}

/// Capsules with a run in progress, each with the newest event that
/// arrived while it ran.
#[derive(Default)]
struct InFlight {
    runs: Mutex<FxHashMap<String, Option<Capsule>>>,
}

impl InFlight {
    /// Hands `capsule` back when no run for `id` is in progress. Otherwise it
    /// replaces any queued follow-up and `None` is returned.
    fn admit(&self, id: &str, capsule: Capsule) -> Option<Capsule> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match runs.get_mut(id) {
            Some(queued) => {
                *queued = Some(capsule);
                None
            }
            None => {
                runs.insert(id.to_string(), None);
                Some(capsule)
            }
        }
    }

    /// The follow-up for `id`, if one queued up. `id` is released otherwise.
    fn next(&self, id: &str) -> Option<Capsule> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match runs.get_mut(id).and_then(Option::take) {
            Some(capsule) => Some(capsule),
            None => {
                runs.remove(id);
                None
            }
        }
    }
}

fn capsule_id(capsule: &Capsule) -> String {
    format!("{}/{}", capsule.namespace().unwrap_or_default(), capsule.name_any())
}

/// Reconciles Capsule events, at most `workers` at a time and never two for
/// the same Capsule. Events for a Capsule that is being reconciled collapse
/// into one follow-up run with the newest version.
async fn run_loop(client: Client, namespace: Option<String>, pipeline: Arc<Pipeline>, workers: usize) -> Result<()> {
    info!(ns = ?namespace, workers, "watch loop starting");
    let (tx, mut rx) = mpsc::channel::<Capsule>(1024);
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = start_capsule_watcher(client, namespace.as_deref(), tx).await {
            error!(error = ?e, "capsule watcher failed");
        }
    });

    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let in_flight = Arc::new(InFlight::default());
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(capsule) = maybe else {
                    warn!("watch channel closed; exiting run loop");
                    break;
                };
                counter!("capsule_events_total", 1u64);
                let id = capsule_id(&capsule);
                let Some(capsule) = in_flight.admit(&id, capsule) else {
                    debug!(capsule = %id, "run in progress, event queued");
                    counter!("capsule_events_coalesced_total", 1u64);
                    continue;
                };
                let permit = permits.clone().acquire_owned().await?;
                let pipeline = pipeline.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let mut next = Some(capsule);
                    while let Some(capsule) = next {
                        if let Err(e) = pipeline.run(capsule).await {
                            warn!(capsule = %id, error = %e, "reconcile failed");
                        }
                        next = in_flight.next(&id);
                    }
                });
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down run loop");
                break;
            }
        }
    }

    watcher_handle.abort();
    // Let in-flight runs finish before exiting.
    let _drain = permits.acquire_many(u32::try_from(workers.max(1)).unwrap_or(u32::MAX)).await?;
    warn!("run loop ended (graceful shutdown)");
    Ok(())
}

fn print_status(status: Option<&CapsuleStatus>, output: Output) -> Result<()> {
    let Some(status) = status else {
        println!("no status published");
        return Ok(());
    };
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(status)?),
        Output::Human => {
            println!("observed generation: {}", status.observed_generation);
            println!("{:<48} {:<14} MESSAGE", "OBJECT", "STATE");
            for r in &status.owned_resources {
                println!("{:<48} {:<14} {}", render_owned(r), r.state, r.message.as_deref().unwrap_or(""));
            }
            for u in &status.used_resources {
                let name = u.r#ref.as_ref().map(|r| format!("{}/{}", r.kind, r.name)).unwrap_or_default();
                println!("uses {:<43} {:<14} {}", name, u.state, u.message.as_deref().unwrap_or(""));
            }
            for e in &status.errors {
                eprintln!("error: {e}");
            }
        }
    }
    Ok(())
}

fn render_owned(r: &OwnedResource) -> String {
    match &r.r#ref {
        Some(t) => match t.api_group.as_deref() {
            Some(g) if !g.is_empty() => format!("{g}/{}/{}", t.kind, t.name),
            _ => format!("{}/{}", t.kind, t.name),
        },
        None => "-".to_string(),
    }
}

fn print_objects(outcome: &RunOutcome, output: Output) -> Result<()> {
    match output {
        Output::Json => {
            let rows: Vec<_> = outcome
                .output_objects
                .iter()
                .map(|o| serde_json::json!({ "key": o.key.to_string(), "state": o.state.as_str(), "object": o.object }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Output::Human => {
            for o in &outcome.output_objects {
                println!("---");
                println!("# {} {}", o.state.as_str(), o.key);
                if let Some(obj) = &o.object {
                    print!("{}", serde_yaml::to_string(obj)?);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::CapsuleSpec;

    fn capsule(ns: &str, name: &str, generation: i64) -> Capsule {
        let mut c = Capsule::new(name, CapsuleSpec::default());
        c.metadata.namespace = Some(ns.into());
        c.metadata.generation = Some(generation);
        c
    }

    #[test]
    fn second_event_waits_for_the_running_one() {
        let in_flight = InFlight::default();
        assert!(in_flight.admit("prod/web", capsule("prod", "web", 1)).is_some());
        assert!(in_flight.admit("prod/web", capsule("prod", "web", 2)).is_none());
        assert!(in_flight.admit("prod/web", capsule("prod", "web", 3)).is_none());
        // Other capsules are not held back.
        assert!(in_flight.admit("prod/api", capsule("prod", "api", 1)).is_some());

        let follow_up = in_flight.next("prod/web").unwrap();
        assert_eq!(follow_up.metadata.generation, Some(3));
        assert!(in_flight.admit("prod/web", capsule("prod", "web", 4)).is_none());
        assert_eq!(in_flight.next("prod/web").unwrap().metadata.generation, Some(4));
        assert!(in_flight.next("prod/web").is_none());

        assert!(in_flight.admit("prod/web", capsule("prod", "web", 5)).is_some());
    }

    #[test]
    fn id_is_namespace_and_name() {
        assert_eq!(capsule_id(&capsule("prod", "web", 1)), "prod/web");
    }

    #[test]
    fn log_format_flag() {
        let cli = Cli::try_parse_from(["capsulectl", "--log-format", "json", "status", "web"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let cli = Cli::try_parse_from(["capsulectl", "delete", "web"]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { ref name } if name == "web"));
    }
}
