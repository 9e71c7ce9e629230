mod facts_cmds;
mod run_log;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use saga_config::AppConfig;
use saga_llm::{
    Embedder, Generator, HashingEmbedder, OllamaClient, OpenRouterClient, Provider, RetryPolicy,
    Retrying,
};
use saga_memory::KnowledgeStore;
use saga_runtime::{
    AgentCoordinator, Pipeline, PipelineConfig, PipelineEvent, RoleRegistry, RunReport, Services,
    TaskScheduler,
};

#[derive(Debug, Parser)]
#[command(
    name = "saga",
    version,
    about = "Book-length generation with long-range continuity checking"
)]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    /// Embed with the built-in hashing embedder instead of the Ollama
    /// embeddings endpoint.
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full plan → design → write → validate pipeline.
    Run {
        /// Override `project.target_units`.
        #[arg(long)]
        units: Option<u32>,
        /// Print the validated text of every unit when the run ends.
        #[arg(long)]
        print: bool,
        /// Archive a fact log left by an earlier run and start from an
        /// empty store.
        #[arg(long)]
        fresh: bool,
    },
    /// Print the task graph without calling any model.
    Plan {
        #[arg(long)]
        units: Option<u32>,
    },
    /// Query the persisted fact log.
    Facts {
        #[command(subcommand)]
        command: FactsCommands,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum FactsCommands {
    /// Similarity search over active facts.
    Search {
        query: String,
        /// character | plot | world | timeline | other
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Show one fact, including superseded ones.
    Audit { id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration after env overrides.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { units, print, fresh } => {
            if let Some(units) = units {
                config.project.target_units = units;
            }
            config.validate()?;
            let report = run_pipeline(&config, cli.offline, print, fresh).await?;
            if !report.is_success() {
                bail!("run did not complete; see the unit status above");
            }
        }
        Commands::Plan { units } => {
            if let Some(units) = units {
                config.project.target_units = units;
            }
            config.validate()?;
            print_plan(&config)?;
        }
        Commands::Facts { command } => {
            let store = open_store(&config, build_embedder(&config, cli.offline)?).await?;
            match command {
                FactsCommands::Search { query, kind, top_k } => {
                    facts_cmds::run_facts_search(&store, &query, kind.as_deref(), top_k).await?;
                }
                FactsCommands::Audit { id } => {
                    facts_cmds::run_facts_audit(&store, &id).await?;
                }
            }
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn retry_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.llm.retry_attempts,
        Duration::from_millis(config.llm.retry_backoff_ms),
    )
}

fn build_generator(config: &AppConfig) -> Result<Arc<dyn Generator>> {
    let llm = &config.llm;
    let timeout = Duration::from_secs(llm.request_timeout_secs);
    match Provider::from_label(&llm.provider) {
        Some(Provider::Ollama) => {
            let client = OllamaClient::new(&llm.ollama_base_url, &llm.ollama_model)
                .with_max_tokens(llm.max_tokens)
                .with_timeout(timeout);
            Ok(Arc::new(Retrying::new(client, retry_policy(config))))
        }
        Some(Provider::OpenRouter) => {
            let client =
                OpenRouterClient::from_env(&llm.openrouter_model)?.with_max_tokens(llm.max_tokens);
            Ok(Arc::new(Retrying::new(client, retry_policy(config))))
        }
        None => bail!("unknown llm.provider '{}' (expected ollama or openrouter)", llm.provider),
    }
}

fn build_embedder(config: &AppConfig, offline: bool) -> Result<Arc<dyn Embedder>> {
    if offline {
        let dimension = match config.memory.embedding_dim {
            0 => 256,
            dim => dim,
        };
        info!(dimension, "using offline hashing embedder");
        return Ok(Arc::new(HashingEmbedder::new(dimension)));
    }
    let llm = &config.llm;
    let client = OllamaClient::new(&llm.ollama_base_url, &llm.ollama_model)
        .with_embedding_model(&llm.embedding_model)
        .with_timeout(Duration::from_secs(llm.request_timeout_secs));
    Ok(Arc::new(Retrying::new(client, retry_policy(config))))
}

async fn open_store(config: &AppConfig, embedder: Arc<dyn Embedder>) -> Result<Arc<KnowledgeStore>> {
    let dimension = (config.memory.embedding_dim > 0).then_some(config.memory.embedding_dim);
    let path = config.memory.event_log_path.trim();
    if path.is_empty() {
        return Ok(Arc::new(KnowledgeStore::new(embedder, dimension)));
    }
    let store = KnowledgeStore::open(Path::new(path), embedder, dimension)
        .await
        .with_context(|| format!("opening fact log {path}"))?;
    Ok(Arc::new(store))
}

async fn run_pipeline(
    config: &AppConfig,
    offline: bool,
    print: bool,
    fresh: bool,
) -> Result<RunReport> {
    let log_path = config.memory.event_log_path.trim();
    if !log_path.is_empty() {
        if let Some(backup) = run_log::prepare_run_log(Path::new(log_path), fresh).await? {
            println!("archived previous fact log to {}", backup.display());
        }
    }
    let generator = build_generator(config)?;
    let store = open_store(config, build_embedder(config, offline)?).await?;
    let services = Arc::new(Services::new(config, generator, store));
    let coordinator = Arc::new(AgentCoordinator::new(
        services.clone(),
        RoleRegistry::standard(),
    ));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut pipeline =
        Pipeline::new(PipelineConfig::from_config(config), coordinator)?.with_events(events_tx);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                shutdown.cancel();
            }
        });
    }
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    println!(
        "saga run: \"{}\" ({} units, model {})",
        config.project.title,
        config.project.target_units,
        config.active_model()
    );
    let report = pipeline.run(shutdown).await?;
    drop(pipeline);
    let _ = printer.await;

    print_report(&report);
    if print {
        for (unit, text) in services.ledger.canonical().await {
            println!("\n── unit {unit} ──────────────────────────────────────────\n{text}");
        }
    }
    Ok(report)
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::TaskStarted {
            task_id,
            kind,
            unit_index,
        } => match unit_index {
            Some(unit) => println!("  start  {task_id} {kind}({unit})"),
            None => println!("  start  {task_id} {kind}"),
        },
        PipelineEvent::TaskFinished(message) => {
            let status = match &message.error {
                Some(error) => format!(
                    "failed ({})",
                    error["code"].as_str().unwrap_or("error")
                ),
                None => "done".to_string(),
            };
            println!("  {status:<6} {} {}", message.task_id, message.kind);
        }
        PipelineEvent::Finding(finding) => println!(
            "  [{}] unit {}: \"{}\" vs {} {}",
            finding.severity.label(),
            finding.unit_index,
            finding.assertion,
            finding.fact_id,
            finding.explanation
        ),
        PipelineEvent::RepairScheduled {
            failed,
            repair,
            failures,
        } => println!("  repair {repair} replaces {failed} (failure {failures})"),
        PipelineEvent::RetriesExhausted { task_id, failures } => {
            println!("  gave up on {task_id} after {failures} failure(s)")
        }
        PipelineEvent::Deadlock(report) => println!("  deadlock: {report}"),
        PipelineEvent::Cancelled => println!("  cancelled"),
    }
}

fn print_report(report: &RunReport) {
    println!("\nunit status");
    for (unit, status) in &report.units {
        println!("- unit {unit}: {status}");
    }
    println!(
        "tasks: {} done, {} failed, {} pending ({:.0}% complete), {} repair(s), {} finding(s)",
        report.progress.done,
        report.progress.failed,
        report.progress.pending + report.progress.ready,
        report.progress.percent_complete,
        report.repairs,
        report.findings.len()
    );
    if let Some(deadlock) = &report.deadlock {
        println!("deadlock: {deadlock}");
    }
}

fn print_plan(config: &AppConfig) -> Result<()> {
    let mut scheduler = TaskScheduler::new(&config.scheduler);
    scheduler.expand(
        config.project.target_units,
        config.scheduler.fanout_per_unit,
    )?;
    println!(
        "{} tasks for {} unit(s)",
        scheduler.len(),
        config.project.target_units
    );
    for task in scheduler.tasks() {
        let deps = task
            .depends_on
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("{:<8} {:<20} [{}] <- {{{deps}}}", task.id.to_string(), task.describe(), task.status);
    }
    Ok(())
}
