use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use llmctl::config::ProjectConfig;
use llmctl::credentials::{SecretCipher, StoreCredentialResolver};
use llmctl::dispatch::KubernetesDispatcher;
use llmctl::flowchart::{Flowchart, FlowchartGraph};
use llmctl::realtime::{InProcessBroker, OutboxPublisher};
use llmctl::run::{OrchestratorConfig, RunOrchestrator, TriggerKind};
use llmctl::settings::SettingsProvider;
use llmctl::store::Store;

#[derive(Parser)]
#[command(name = "llmctl")]
#[command(version, about = "Agent workflow orchestrator - node execution and Kubernetes dispatch")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "LLMCTL_LOG_JSON")]
    pub log_json: bool,

    /// Also write logs to a daily-rolling file in this directory.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// SQLite database path.
    #[arg(long, global = true, env = "LLMCTL_DB", default_value = "llmctl.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a flowchart definition file
    Validate {
        /// Path to the flowchart JSON
        flowchart: PathBuf,
    },
    /// Run a flowchart to completion against the configured cluster
    Run {
        /// Path to the flowchart JSON
        flowchart: PathBuf,
        /// Root directory for per-run workspaces
        #[arg(long, default_value = "workspaces")]
        workspaces: PathBuf,
        /// Treat the trigger as autorun (includes instruction priorities)
        #[arg(long)]
        autorun: bool,
    },
    /// Show the effective executor settings
    Settings,
    /// Apply artifact retention controls
    PruneArtifacts,
}

/// Cipher stand-in until a vault backend is wired: blobs are stored as
/// UTF-8 plaintext by the admin path of this binary.
struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, String> {
        String::from_utf8(ciphertext.to_vec()).map_err(|e| e.to_string())
    }
}

fn init_tracing(
    verbose: bool,
    json: bool,
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "llmctl=debug,info" } else { "info" })
    });
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "llmctl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

fn load_flowchart(path: &PathBuf) -> Result<Flowchart> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flowchart at {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse flowchart at {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_json, cli.log_dir.as_deref());

    match &cli.command {
        Commands::Validate { flowchart } => {
            let chart = load_flowchart(flowchart)?;
            let graph = FlowchartGraph::compile(&chart)
                .with_context(|| format!("Flowchart '{}' is invalid", chart.id))?;
            println!(
                "Flowchart '{}' is valid: {} nodes, {} edges",
                chart.id,
                graph.node_count(),
                graph.edges().len()
            );
        }
        Commands::Run {
            flowchart,
            workspaces,
            autorun,
        } => {
            let chart = load_flowchart(flowchart)?;
            let project = ProjectConfig::load_or_default(
                &std::env::current_dir().context("Failed to get current directory")?,
            )?;
            let store = Arc::new(Store::new(&cli.db).context("Failed to open store")?);
            let settings = Arc::new(SettingsProvider::load(&store)?);
            let broker = Arc::new(InProcessBroker::default());
            let publisher = Arc::new(OutboxPublisher::new(Arc::clone(&store), broker));
            let credentials = Arc::new(StoreCredentialResolver::new(
                Arc::clone(&store),
                Arc::new(PassthroughCipher),
            ));
            let dispatcher = Arc::new(
                KubernetesDispatcher::connect(settings.snapshot())
                    .await
                    .context("Failed to connect to Kubernetes")?,
            );
            // CLI flag wins over the config file for the workspace root.
            let mut orchestrator_config =
                OrchestratorConfig::new(workspaces.clone(), project.instruction_source());
            orchestrator_config.max_dispatch_concurrency =
                project.orchestrator.max_dispatch_concurrency;
            let orchestrator = RunOrchestrator::new(
                store,
                dispatcher,
                publisher,
                settings,
                credentials,
                orchestrator_config,
            );

            let trigger = if *autorun {
                TriggerKind::Autorun
            } else {
                TriggerKind::Manual
            };
            let run = orchestrator.create_run(&chart, trigger, "cli")?;
            println!("Created run {}", run.run_id);
            let status = orchestrator.run_until_terminal(&run.run_id).await?;
            println!("Run {} finished: {}", run.run_id, status);
            if status != llmctl::run::RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Settings => {
            let store = Store::new(&cli.db).context("Failed to open store")?;
            let settings = store
                .load_executor_settings()?
                .unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::PruneArtifacts => {
            let store = Store::new(&cli.db).context("Failed to open store")?;
            let pruned = store.prune_artifacts(chrono::Utc::now())?;
            println!("Pruned {pruned} artifacts");
        }
    }

    Ok(())
}
