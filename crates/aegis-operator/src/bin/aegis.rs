//! The `aegis` command-line front end

use aegis_agents::AgentPipeline;
use aegis_cluster::{ClusterOps, DiagnosticCollector, KubeCluster, MockCluster, PodFixture};
use aegis_common::{
    Config, Incident, PipelineState, Priority, ResourceRef, Severity, TriggerSignal,
};
use aegis_llm::{HttpLlmClient, LlmBackend};
use aegis_operator::approval::render_proposal;
use aegis_operator::{
    EventWatcher, FixExecutor, IncidentProcessor, RollbackWatcher, StaticApprover,
};
use aegis_queue::IncidentQueue;
use aegis_security::SecurityPipeline;
use aegis_shadow::{ShadowManager, SHADOW_LABEL};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "aegis",
    version,
    about = "Autonomous incident detection and remediation for Kubernetes workloads"
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-memory mock cluster (offline demo mode).
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze one resource and render the proposed remediation.
    Analyze {
        /// Target as kind/name, e.g. pod/demo-api-7fbd.
        target: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        /// Write the full pipeline state as JSON.
        #[arg(long)]
        export: Option<PathBuf>,
        /// Verify in a shadow environment and apply without prompting.
        #[arg(long)]
        auto_fix: bool,
    },
    /// Read-only incident queries.
    #[command(subcommand)]
    Incident(IncidentCommand),
    /// Direct shadow-environment access.
    #[command(subcommand)]
    Shadow(ShadowCommand),
    /// Configuration inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Run the watcher and processor daemon.
    Operate,
}

#[derive(Subcommand)]
enum IncidentCommand {
    /// List faults currently detectable in the watched namespaces.
    List,
    /// Show one detection by correlation key.
    Show { correlation_key: String },
}

#[derive(Subcommand)]
enum ShadowCommand {
    /// Create a shadow environment for a workload.
    Create {
        /// Source as kind/name, e.g. deployment/demo-api.
        target: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
    },
    /// List shadow namespaces in the cluster.
    List,
    /// Delete a shadow namespace.
    Delete { namespace: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Dump the resolved configuration.
    Show {
        /// Print secret values instead of masking them.
        #[arg(long)]
        reveal: bool,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return Ok(1);
            }
        },
        None => Config::default(),
    };
    config = config.overlay_env();
    if cli.mock {
        config.cluster.diagnostic_mock = true;
    }
    let config = Arc::new(config);

    if let Some(listen) = &config.operator.metrics_listen {
        let addr: std::net::SocketAddr = listen
            .parse()
            .with_context(|| format!("bad metrics listen address '{}'", listen))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install metrics exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    match cli.command {
        Command::Analyze {
            target,
            namespace,
            export,
            auto_fix,
        } => analyze(&cli_cluster(cli.mock, &config).await?, &config, &target, &namespace, export, auto_fix).await,
        Command::Incident(cmd) => {
            incident_command(&cli_cluster(cli.mock, &config).await?, &config, cmd).await
        }
        Command::Shadow(cmd) => {
            shadow_command(&cli_cluster(cli.mock, &config).await?, &config, cmd).await
        }
        Command::Config(ConfigCommand::Show { reveal }) => {
            let shown = if reveal {
                (*config).clone()
            } else {
                config.masked()
            };
            println!("{}", toml::to_string_pretty(&shown)?);
            Ok(0)
        }
        Command::Operate => operate(&cli_cluster(cli.mock, &config).await?, &config).await,
    }
}

/// Demo fixtures for the mock cluster: a crash-looping OOM workload in
/// production plus a healthy one in the default namespace.
fn seed_mock(cluster: &MockCluster) {
    cluster.add_deployment("production", "demo-api", "demo-api:1.2.2", 3);
    let mut crashing = PodFixture::running("demo-api-7fbd");
    crashing.ready = false;
    crashing.restart_count = 7;
    crashing.waiting_reason = Some("CrashLoopBackOff".to_string());
    crashing.oom_killed = true;
    cluster.add_pod("production", crashing);
    cluster.push_logs(
        "production",
        &[
            "level=info msg=\"serving\"",
            "signal: killed (OOM)",
            "level=error msg=\"allocation failed\"",
        ],
    );
    cluster.add_deployment("default", "web", "nginx:1.27", 2);
}

async fn cli_cluster(mock: bool, config: &Config) -> anyhow::Result<Arc<dyn ClusterOps>> {
    if mock {
        let cluster = Arc::new(MockCluster::new());
        seed_mock(&cluster);
        Ok(cluster)
    } else {
        let cluster = KubeCluster::connect(&config.cluster)
            .await
            .context("cluster connection failed")?;
        Ok(Arc::new(cluster))
    }
}

fn build_pipeline(
    cluster: Arc<dyn ClusterOps>,
    config: &Config,
) -> anyhow::Result<Arc<AgentPipeline>> {
    let backend: Arc<dyn LlmBackend> = Arc::new(HttpLlmClient::new(config.llm.clone())?);
    let collector = Arc::new(DiagnosticCollector::new(
        cluster,
        &config.cluster,
        config.llm.model.clone(),
    ));
    Ok(Arc::new(AgentPipeline::new(backend, collector, config)))
}

fn manual_incident(resource: ResourceRef) -> Incident {
    Incident::new(
        resource,
        Priority::P2,
        Severity::Medium,
        TriggerSignal::PhaseTransition {
            phase: "manual-analysis".to_string(),
        },
    )
}

fn render_state(incident: &Incident, state: &PipelineState) -> String {
    let mut out = render_proposal(incident, state);
    if let Some(rca) = &state.rca_result {
        out.push_str("\nanalysis steps:\n");
        for step in &rca.analysis_steps {
            out.push_str(&format!("  - {}\n", step));
        }
    }
    if let Some(plan) = &state.verification_plan {
        out.push_str(&format!(
            "\nverification: {} for {}s, checks: {}\n",
            plan.verification_type,
            plan.duration_seconds,
            plan.security_checks.join(", ")
        ));
    }
    if let Some(error) = &state.error {
        out.push_str(&format!("\npipeline error: {}\n", error));
    }
    out
}

async fn analyze(
    cluster: &Arc<dyn ClusterOps>,
    config: &Arc<Config>,
    target: &str,
    namespace: &str,
    export: Option<PathBuf>,
    auto_fix: bool,
) -> anyhow::Result<i32> {
    let resource = match ResourceRef::parse(target, namespace) {
        Ok(resource) => resource,
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(1);
        }
    };

    let pipeline = build_pipeline(cluster.clone(), config)?;
    let incident = manual_incident(resource);

    let (status, state) = if auto_fix {
        let queue = Arc::new(IncidentQueue::new(&config.queue));
        let security = Arc::new(SecurityPipeline::from_config(
            &config.security,
            &config.shadow,
            cluster.clone(),
        ));
        let shadow = Arc::new(ShadowManager::new(
            cluster.clone(),
            security,
            config.shadow.clone(),
        ));
        let executor = Arc::new(FixExecutor::new(cluster.clone()));
        let rollback = Arc::new(RollbackWatcher::new(
            cluster.clone(),
            executor.clone(),
            config.rollback.clone(),
        ));
        let processor = IncidentProcessor::new(
            queue.clone(),
            pipeline,
            shadow,
            executor,
            rollback,
            Arc::new(StaticApprover::approving()),
            config.clone(),
        );
        queue.enqueue(incident.clone()).await.ok();
        let outcome = processor
            .process_one(incident.clone(), CancellationToken::new())
            .await;
        (Some(outcome.status), outcome.state)
    } else {
        let state = pipeline.run(&incident, &CancellationToken::new()).await;
        (None, state)
    };

    println!("{}", render_state(&incident, &state));
    if let Some(status) = status {
        println!("final status: {:?}", status);
    }
    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&state)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        println!("state exported to {}", path.display());
    }

    Ok(if state.error.is_some() { 2 } else { 0 })
}

async fn incident_command(
    cluster: &Arc<dyn ClusterOps>,
    config: &Arc<Config>,
    command: IncidentCommand,
) -> anyhow::Result<i32> {
    let queue = Arc::new(IncidentQueue::new(&config.queue));
    let watcher = EventWatcher::new(cluster.clone(), queue.clone(), config);
    watcher.scan_once().await;
    let incidents = queue.list().await;

    match command {
        IncidentCommand::List => {
            if incidents.is_empty() {
                println!("no active faults detected");
                return Ok(0);
            }
            for incident in incidents {
                println!(
                    "{}  {}  {}  {}  x{}",
                    incident.priority,
                    incident.correlation_key,
                    incident.resource,
                    incident.trigger,
                    incident.occurrences
                );
            }
        }
        IncidentCommand::Show { correlation_key } => {
            let Some(incident) = incidents
                .iter()
                .find(|i| i.correlation_key == correlation_key)
            else {
                eprintln!("no detection with correlation key {}", correlation_key);
                return Ok(1);
            };
            println!("{}", serde_json::to_string_pretty(incident)?);
        }
    }
    Ok(0)
}

async fn shadow_command(
    cluster: &Arc<dyn ClusterOps>,
    config: &Arc<Config>,
    command: ShadowCommand,
) -> anyhow::Result<i32> {
    let security = Arc::new(SecurityPipeline::from_config(
        &config.security,
        &config.shadow,
        cluster.clone(),
    ));
    let manager = ShadowManager::new(cluster.clone(), security, config.shadow.clone());

    match command {
        ShadowCommand::Create { target, namespace } => {
            let resource = match ResourceRef::parse(&target, &namespace) {
                Ok(resource) => resource,
                Err(e) => {
                    eprintln!("error: {}", e);
                    return Ok(1);
                }
            };
            let env = manager
                .create(&resource.namespace, &resource.name, resource.kind)
                .await?;
            println!("{}", serde_json::to_string_pretty(&env)?);
            Ok(if env.error.is_some() { 2 } else { 0 })
        }
        ShadowCommand::List => {
            let selector = format!("{}=true", SHADOW_LABEL);
            let namespaces = cluster.list_namespaces(Some(&selector)).await?;
            if namespaces.is_empty() {
                println!("no shadow namespaces");
            }
            for namespace in namespaces {
                println!("{}", namespace);
            }
            Ok(0)
        }
        ShadowCommand::Delete { namespace } => {
            cluster.delete_namespace(&namespace).await?;
            println!("deleted {}", namespace);
            Ok(0)
        }
    }
}

async fn operate(cluster: &Arc<dyn ClusterOps>, config: &Arc<Config>) -> anyhow::Result<i32> {
    let queue = Arc::new(IncidentQueue::new(&config.queue));
    let pipeline = build_pipeline(cluster.clone(), config)?;
    let security = Arc::new(SecurityPipeline::from_config(
        &config.security,
        &config.shadow,
        cluster.clone(),
    ));
    let shadow = Arc::new(ShadowManager::new(
        cluster.clone(),
        security,
        config.shadow.clone(),
    ));
    let executor = Arc::new(FixExecutor::new(cluster.clone()));
    let rollback = Arc::new(RollbackWatcher::new(
        cluster.clone(),
        executor.clone(),
        config.rollback.clone(),
    ));
    let approver = Arc::new(aegis_operator::TerminalApprover::new(Duration::from_secs(
        config.operator.approval_timeout_seconds,
    )));
    let processor = Arc::new(IncidentProcessor::new(
        queue.clone(),
        pipeline,
        shadow,
        executor,
        rollback,
        approver,
        config.clone(),
    ));
    let watcher = EventWatcher::new(cluster.clone(), queue.clone(), config);

    let cancel = CancellationToken::new();
    let watcher_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };
    let processor_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel).await })
    };

    info!("aegis operator running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested");
    cancel.cancel();
    // Cleanup grace for in-flight work.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = watcher_task.await;
        let _ = processor_task.await;
    })
    .await;
    Ok(0)
}
