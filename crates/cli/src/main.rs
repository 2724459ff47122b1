mod adapters;
mod config;
mod server;

use adapters::{HttpChunkIndex, HttpEmbedder, HttpWebSearch};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::DeskConfig;
use desk_backends::{
    spawn_prober, BackendRegistry, HttpGenerationClient, InstanceCapabilities, ModelInstance,
};
use desk_orchestrator::{spawn_sweeper, MemoryCache, Orchestrator};
use desk_protocol::{AnswerEvent, Query, QueryHints};
use desk_retrieval::WebSearch;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "desk", version, about = "Confidence-scored support answer orchestrator")]
struct Cli {
    /// Path to the TOML config file (falls back to DESK_CONFIG, then ./desk.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question and print the streamed result.
    Ask {
        question: String,
        #[arg(long, default_value = "cli")]
        session: String,
        /// Fan the question across multiple model instances and vote.
        #[arg(long)]
        consensus: bool,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Serve the answer and health endpoints over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
    /// Parse the config and print the effective settings.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = DeskConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Command::Ask {
            question,
            session,
            consensus,
            model,
            temperature,
        } => {
            let runtime = build_runtime(&cfg)?;
            let query = Query {
                text: question,
                session_id: session,
                hints: QueryHints {
                    model,
                    temperature,
                    use_consensus: consensus,
                },
            };
            ask(&runtime.orchestrator, query).await
        }
        Command::Serve { addr } => {
            let runtime = build_runtime(&cfg)?;
            server::serve(runtime.orchestrator.clone(), &addr).await
        }
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

struct Runtime {
    orchestrator: Arc<Orchestrator>,
    // Keeps the prober/sweeper alive for the process lifetime.
    _shutdown: watch::Sender<bool>,
}

fn build_runtime(cfg: &DeskConfig) -> Result<Runtime> {
    if cfg.backends.is_empty() {
        bail!("No generation backends configured; add at least one [[backends]] entry");
    }
    let index_url = cfg
        .services
        .index_url
        .as_deref()
        .context("services.index_url is required")?;
    let embed_url = cfg
        .services
        .embed_url
        .as_deref()
        .context("services.embed_url is required")?;

    let per_call = Duration::from_millis(cfg.orchestrator.timeouts.per_call_ms);
    let source_timeout = Duration::from_millis(cfg.orchestrator.fusion.source_timeout_ms);

    let index = Arc::new(HttpChunkIndex::new(index_url, source_timeout)?);
    let embedder = Arc::new(HttpEmbedder::new(embed_url, source_timeout)?);
    let web: Option<Arc<dyn WebSearch>> = match cfg.services.web_search_url.as_deref() {
        Some(url) => Some(Arc::new(HttpWebSearch::new(url, source_timeout)?)),
        None => None,
    };

    let instances: Vec<Arc<ModelInstance>> = cfg
        .backends
        .iter()
        .map(|entry| {
            Arc::new(ModelInstance::new(
                entry.id.clone(),
                entry.base_url.clone(),
                InstanceCapabilities {
                    models: entry.models.clone(),
                    max_context_tokens: entry.max_context_tokens,
                    tiers: entry.tiers.clone(),
                },
            ))
        })
        .collect();

    let registry = Arc::new(BackendRegistry::new(
        instances,
        cfg.orchestrator.balancer.clone(),
    ));
    let backend = Arc::new(HttpGenerationClient::new(per_call)?);
    let cache = Arc::new(MemoryCache::new(cfg.orchestrator.cache.capacity));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_prober(registry.clone(), backend.clone(), shutdown_rx.clone());
    spawn_sweeper(
        cache.clone(),
        Duration::from_secs(cfg.orchestrator.cache.sweep_interval_secs.max(1)),
        shutdown_rx,
    );

    let orchestrator = Orchestrator::new(
        cfg.orchestrator.clone(),
        index,
        embedder,
        backend,
        registry,
        web,
        cache,
    );

    Ok(Runtime {
        orchestrator,
        _shutdown: shutdown_tx,
    })
}

async fn ask(orchestrator: &Arc<Orchestrator>, query: Query) -> Result<()> {
    use std::io::Write;

    let mut rx = orchestrator.answer(query);
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            AnswerEvent::Notice { message } => eprintln!("note: {message}"),
            AnswerEvent::Token { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            AnswerEvent::Citations { .. } | AnswerEvent::Confidence { .. } => {}
            AnswerEvent::Done { answer } => {
                writeln!(stdout)?;
                if !answer.citations.is_empty() {
                    writeln!(stdout, "\nSources:")?;
                    for (i, citation) in answer.citations.iter().enumerate() {
                        writeln!(stdout, "  [{}] {} ({})", i + 1, citation.doc_id, citation.chunk_id)?;
                    }
                }
                writeln!(stdout, "\nConfidence: {:.2}", answer.confidence.composite)?;
            }
        }
    }
    Ok(())
}
