//! modswapd: the modswap daemon.
//!
//! Runs one deployment through the full pipeline against an in-process
//! simulated fleet and prints the final `DeploymentResult` as JSON.
//!
//! # Usage
//!
//! ```text
//! modswapd deploy --module payments --version 2.1.0 --env production --nodes 10
//! modswapd deploy --module payments --version 2.1.0 --env qa --fail-node node-03
//! modswapd config > modswap.toml
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modswap_fleet::{
    Environment, Fleet, ModuleDeploymentRequest, NodeRef, SimulatedNode, StrategyKind,
};
use modswap_metrics::{ClusterMetricsSnapshot, InMemoryMetricsSource};
use modswap_pipeline::{
    ApprovalDecision, ApprovalGate, ApprovalTicket, AutoApprovalGate, ChannelApprovalGate, DecisionStore,
    DeploymentPipeline, PipelineConfig,
};

#[derive(Parser)]
#[command(name = "modswapd", about = "modswap deployment daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a module version to a simulated fleet.
    Deploy {
        /// Pipeline configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Module to deploy.
        #[arg(long)]
        module: String,

        /// Target version (semver).
        #[arg(long)]
        version: String,

        /// Target environment: dev, qa, staging or production.
        #[arg(long, default_value = "dev")]
        env: Environment,

        /// Force a strategy instead of the environment's default.
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Number of simulated nodes.
        #[arg(long, default_value = "5")]
        nodes: usize,

        /// Version every node starts with.
        #[arg(long, default_value = "1.0.0")]
        installed: String,

        /// Make this node refuse the deploy. Repeatable.
        #[arg(long = "fail-node")]
        fail_nodes: Vec<String>,

        /// Simulated per-call node latency in milliseconds.
        #[arg(long, default_value = "50")]
        latency_ms: u64,

        /// Approve staging and production deployments without asking.
        /// Otherwise environments outside `approval.auto_approve` prompt on
        /// stdin until `approval.timeout`.
        #[arg(long)]
        approve: bool,
    },

    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Deploy {
            config,
            module,
            version,
            env,
            strategy,
            nodes,
            installed,
            fail_nodes,
            latency_ms,
            approve,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::from_file(&path)?,
                None => PipelineConfig::default(),
            };
            let fleet = simulated_fleet(env, nodes, &module, &installed, &fail_nodes, latency_ms)?;
            let mut request = ModuleDeploymentRequest::new(&module, &version, env);
            if let Some(kind) = strategy {
                request = request.with_strategy(kind);
            }
            run_deploy(config, fleet, request, approve).await
        }
        Command::Config => {
            print!("{}", PipelineConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,modswap=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn simulated_fleet(
    environment: Environment,
    count: usize,
    module: &str,
    installed: &str,
    fail_nodes: &[String],
    latency_ms: u64,
) -> anyhow::Result<Fleet> {
    let mut nodes: Vec<NodeRef> = Vec::with_capacity(count);
    for i in 1..=count {
        let id = format!("node-{i:02}");
        let mut node = SimulatedNode::new(&id)
            .with_version(module, installed)
            .with_latency(Duration::from_millis(latency_ms));
        if fail_nodes.contains(&id) {
            node = node.failing_deploy("injected failure");
        }
        nodes.push(Arc::new(node));
    }
    for id in fail_nodes {
        if !nodes.iter().any(|n| n.id() == id) {
            warn!(node = %id, "--fail-node names a node outside the fleet");
        }
    }
    Ok(Fleet::new("simulated", environment, nodes)?)
}

async fn run_deploy(
    config: PipelineConfig,
    fleet: Fleet,
    request: ModuleDeploymentRequest,
    approve: bool,
) -> anyhow::Result<()> {
    info!(
        module = %request.module_name,
        version = %request.target_version,
        environment = %request.environment,
        "modswapd starting"
    );

    // ── Pipeline ───────────────────────────────────────────────

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(InMemoryMetricsSource::uniform(ClusterMetricsSnapshot::new(
        35.0, 45.0, 80.0, 0.5,
    )));

    let decisions = Arc::new(DecisionStore::new(
        config.approval.decision_capacity,
        config.decision_retention()?,
    ));
    let eviction = decisions
        .clone()
        .spawn_eviction(Duration::from_secs(60), shutdown.clone());
    let gate: Arc<dyn ApprovalGate> = if approve {
        Arc::new(AutoApprovalGate::approve_all().with_store(decisions))
    } else {
        let (ticket_tx, ticket_rx) = mpsc::channel(16);
        let gate = Arc::new(
            ChannelApprovalGate::new(config.approval_timeout()?)
                .with_auto_approve(config.approval.auto_approve.iter().copied())
                .with_store(decisions)
                .with_notifications(ticket_tx),
        );
        tokio::spawn(prompt_operator(gate.clone(), ticket_rx));
        gate as Arc<dyn ApprovalGate>
    };

    let pipeline = DeploymentPipeline::from_config(&config, metrics)?
        .with_approval_gate(gate)
        .with_shutdown(shutdown.clone());
    pipeline.register_fleet(fleet).await;

    // ── Signals and progress ───────────────────────────────────

    let cancel = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling deployment");
            cancel.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "progress"),
                Err(e) => warn!(error = %e, "unprintable progress event"),
            }
        }
    });

    // ── Run ────────────────────────────────────────────────────

    let result = pipeline
        .execute_deployment_with_progress(request, progress_tx)
        .await?;
    let _ = printer.await;
    shutdown.cancel();
    let _ = eviction.await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success() {
        anyhow::bail!(
            "deployment {} finished as {:?}",
            result.deployment_id(),
            result.status()
        );
    }
    info!(deployment = %result.deployment_id(), "modswapd finished");
    Ok(())
}

/// Ask on stdin for each approval ticket. `y` approves, anything else
/// rejects. A closed stdin leaves the ticket to time out.
async fn prompt_operator(gate: Arc<ChannelApprovalGate>, mut tickets: mpsc::Receiver<ApprovalTicket>) {
    // Blocking reads live on their own thread so a pending prompt never
    // holds up runtime shutdown.
    let (line_tx, mut lines) = mpsc::channel::<String>(1);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    while let Some(ticket) = tickets.recv().await {
        eprint!(
            "approve {} {} -> {} (deployment {})? [y/N] ",
            ticket.environment, ticket.module_name, ticket.target_version, ticket.deployment_id
        );
        let Some(answer) = lines.recv().await else {
            warn!("stdin closed, approval will time out");
            return;
        };
        let decision = if answer.trim().eq_ignore_ascii_case("y") {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected {
                reason: "rejected by operator".to_string(),
            }
        };
        if !gate.decide(ticket.deployment_id, decision).await {
            warn!(deployment = %ticket.deployment_id, "approval answer arrived after the request ended");
        }
    }
}
