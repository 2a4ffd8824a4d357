//! CLI command definitions for evalforge.
//!
//! Three commands cover the lifecycle of a preset: `validate` reports every
//! configuration violation, `expand` prints the generation tasks a preset
//! would produce, and `run` executes it end to end.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    resolve, ContentKind, ContentLibrary, DirectoryLibrary, OrchestratorSettings, PipelineConfig,
    Preset,
};
use crate::events::EventServer;
use crate::metrics::init_metrics;
use crate::pipeline::{expand, Run, RunStatus, TaskStatus};
use crate::run::RunManager;

/// Default content library directory.
const DEFAULT_LIBRARY_DIR: &str = "./library";

/// Multi-model generation, judging and combination pipeline runner.
#[derive(Parser)]
#[command(name = "evalforge")]
#[command(about = "Generate, evaluate, rank and combine documents across models")]
#[command(version)]
#[command(
    long_about = "evalforge expands a preset into generation tasks, runs them against the configured models, \
scores and ranks the candidates with judge models, and merges the best ones.\n\n\
Example usage:\n  evalforge run --preset presets/release-notes.yaml --library ./library --output report.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Check a preset against the content library and list every violation.
    Validate(PresetArgs),

    /// Print the generation tasks a preset expands into.
    Expand(ExpandArgs),

    /// Execute a preset and write the final run report.
    Run(RunArgs),
}

/// Preset and content library location shared by every command.
#[derive(Parser, Debug, Clone)]
pub struct PresetArgs {
    /// Preset file (YAML or JSON).
    #[arg(short, long)]
    pub preset: PathBuf,

    /// Content library root with instructions/, criteria/ and documents/.
    #[arg(short = 'L', long, default_value = DEFAULT_LIBRARY_DIR)]
    pub library: PathBuf,
}

/// Arguments for `evalforge expand`.
#[derive(Parser, Debug)]
pub struct ExpandArgs {
    #[command(flatten)]
    pub preset: PresetArgs,

    /// Pretty-print the task list.
    #[arg(long)]
    pub pretty: bool,
}

/// Arguments for `evalforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub preset: PresetArgs,

    /// Write the final run report (JSON) to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Stream run events to stdout as JSON lines while the run executes.
    #[arg(long)]
    pub events: bool,

    /// Serve the event stream over TCP on this address (e.g. 127.0.0.1:7070).
    #[arg(long)]
    pub listen: Option<String>,

    /// Provider base URL (overrides EVALFORGE_BASE_URL).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Provider API key (can also be set via EVALFORGE_API_KEY or OPENAI_API_KEY).
    #[arg(long, env = "EVALFORGE_API_KEY")]
    pub api_key: Option<String>,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI args and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate(args) => run_validate_command(args),
        Commands::Expand(args) => run_expand_command(args),
        Commands::Run(args) => run_pipeline_command(args).await,
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load_config(args: &PresetArgs) -> anyhow::Result<(PipelineConfig, DirectoryLibrary)> {
    let preset = Preset::load(&args.preset)
        .with_context(|| format!("Failed to load preset {}", args.preset.display()))?;
    let library = DirectoryLibrary::open(&args.library);
    if library.is_empty() {
        warn!(library = %args.library.display(), "Content library is empty");
    }
    let config = resolve(&preset, &library)?;
    Ok((config, library))
}

fn load_documents(
    config: &PipelineConfig,
    library: &dyn ContentLibrary,
) -> anyhow::Result<HashMap<String, String>> {
    config
        .documents
        .iter()
        .map(|id| {
            library
                .resolve(ContentKind::Document, id)
                .map(|text| (id.clone(), text))
                .with_context(|| format!("Document '{}' disappeared from the library", id))
        })
        .collect()
}

fn write_json<T: Serialize>(value: &T, output: Option<&Path>, pretty: bool) -> anyhow::Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote run report");
        }
        None => println!("{}", text),
    }
    Ok(())
}

// ============================================================================
// validate / expand
// ============================================================================

fn run_validate_command(args: PresetArgs) -> anyhow::Result<()> {
    let preset = Preset::load(&args.preset)
        .with_context(|| format!("Failed to load preset {}", args.preset.display()))?;
    let library = DirectoryLibrary::open(&args.library);

    match resolve(&preset, &library) {
        Ok(config) => {
            println!(
                "Preset '{}' is valid: {} document(s), {} generator(s), {} generation task(s)",
                config.name,
                config.documents.len(),
                config.generators.len(),
                config.generation_task_count()
            );
            Ok(())
        }
        Err(err) => {
            println!("Preset '{}' is invalid:", preset.name);
            for violation in &err.violations {
                println!("  - {}", violation);
            }
            Err(err.into())
        }
    }
}

fn run_expand_command(args: ExpandArgs) -> anyhow::Result<()> {
    let (config, _) = load_config(&args.preset)?;
    let tasks = expand(&config);
    info!(config = %config.name, tasks = tasks.len(), "Expanded preset");
    write_json(&tasks, None, args.pretty)
}

// ============================================================================
// run
// ============================================================================

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let (config, library) = load_config(&args.preset)?;
    let documents = load_documents(&config, &library)?;

    let mut settings = OrchestratorSettings::from_env()?;
    if let Some(url) = args.base_url {
        settings = settings.with_provider_base_url(url);
    }
    if let Some(key) = args.api_key {
        settings = settings.with_api_key(key);
    }
    settings.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to register metrics");
    }

    let manager = Arc::new(RunManager::from_settings(&settings)?);
    let shutdown = CancellationToken::new();

    if let Some(addr) = &args.listen {
        let server = EventServer::bind(addr, manager.clone())
            .await
            .with_context(|| format!("Failed to bind event server on {}", addr))?;
        info!(addr = %server.local_addr()?, "Event server listening");
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(cancel).await {
                warn!(error = %e, "Event server stopped");
            }
        });
    }

    let run_id = manager.submit(config, documents)?;
    info!(run_id = %run_id, "Run started");

    let printer = if args.events {
        let mut stream = manager.subscribe(&run_id).await?;
        Some(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                }
            }
        }))
    } else {
        None
    };

    let run = tokio::select! {
        run = manager.wait(&run_id) => run?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, cancelling run");
            manager.cancel(&run_id).await?;
            manager.wait(&run_id).await?
        }
    };

    if let Some(printer) = printer {
        let _ = printer.await;
    }
    shutdown.cancel();

    print_summary(&run);
    write_json(&run, args.output.as_deref(), true)?;

    if run.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed: no document produced any output", run.id);
    }
    Ok(())
}

fn print_summary(run: &Run) {
    eprintln!("Run {} finished: {}", run.id, run.status);
    eprintln!(
        "  tasks: {} completed, {} error, {} cancelled",
        run.count_tasks(TaskStatus::Completed),
        run.count_tasks(TaskStatus::Error),
        run.count_tasks(TaskStatus::Cancelled)
    );
    eprintln!(
        "  generated: {}, evaluations: {}, comparisons: {}, combined: {}",
        run.generated_docs.len(),
        run.eval_results.len(),
        run.pairwise_results.len(),
        run.combined_docs.len()
    );
    for doc in &run.documents {
        let best = doc.ranking.first().map(String::as_str).unwrap_or("-");
        match &doc.error {
            Some(error) => eprintln!("  {} [{:?}]: {}", doc.document_id, doc.status, error),
            None => eprintln!("  {} [{:?}]: best {}", doc.document_id, doc.status, best),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "evalforge",
            "--log-level",
            "debug",
            "run",
            "--preset",
            "p.yaml",
            "--library",
            "lib",
            "--events",
            "--listen",
            "127.0.0.1:0",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.preset.preset, PathBuf::from("p.yaml"));
                assert_eq!(args.preset.library, PathBuf::from("lib"));
                assert!(args.events);
                assert_eq!(args.listen.as_deref(), Some("127.0.0.1:0"));
                assert!(args.output.is_none());
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_expand_reads_directory_library() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("library");
        fs::create_dir_all(lib.join("documents")).unwrap();
        fs::create_dir_all(lib.join("instructions")).unwrap();
        fs::write(lib.join("documents/intro.md"), "Hello world").unwrap();
        fs::write(lib.join("instructions/eval.md"), "Score it").unwrap();
        let preset = dir.path().join("preset.yaml");
        fs::write(
            &preset,
            "name: demo\n\
             documents: [intro]\n\
             generators:\n  - name: writer\n    models: [\"openai:gpt-4o\", \"openai:gpt-4o-mini\"]\n\
             iterations: 2\n",
        )
        .unwrap();

        let (config, library) = load_config(&PresetArgs {
            preset,
            library: lib,
        })
        .unwrap();
        assert_eq!(expand(&config).len(), 4);
        let docs = load_documents(&config, &library).unwrap();
        assert_eq!(docs["intro"], "Hello world");
    }
}
