//! hashdex command line: export shared chunks and run indexing sessions.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use hashdex_core::{
    builtin_kinds, ChunkExporter, Completion, FileOrigin, FsFileSource, IndexResult, IndexerConfig,
    ProgressScope, ProjectIndex,
};

#[derive(Parser)]
#[command(name = "hashdex")]
#[command(about = "Incremental content-addressed file indexing")]
#[command(version)]
struct Cli {
    /// JSON config file; HASHDEX_* variables still override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a shareable chunk from one or more directories
    Export {
        /// Directory to include (repeatable)
        #[arg(long = "root", required = true)]
        roots: Vec<PathBuf>,

        /// Archive to write
        #[arg(long)]
        out: PathBuf,

        /// Chunk name (default: archive file stem)
        #[arg(long)]
        name: Option<String>,
    },

    /// Run one indexing session over a project
    Index {
        /// Project root (repeatable)
        #[arg(long = "root", required = true)]
        roots: Vec<PathBuf>,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Directory of shared chunk archives
        #[arg(long)]
        chunks_dir: Option<PathBuf>,

        /// Ignore shared chunks even when a chunks directory is configured
        #[arg(long)]
        no_shared: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HASHDEX_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hashdex: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> IndexResult<()> {
    let mut config = match &cli.config {
        Some(path) => IndexerConfig::from_file(path)?,
        None => IndexerConfig::from_env(),
    };
    match cli.command {
        Commands::Export { roots, out, name } => {
            let exporter = ChunkExporter::new(builtin_kinds(), config);
            let outcome = exporter.export(&roots, &out, name.as_deref(), &ProgressScope::new())?;
            print_outcome(outcome)
        }
        Commands::Index {
            roots,
            data_dir,
            chunks_dir,
            no_shared,
        } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if chunks_dir.is_some() {
                config.shared_chunks_dir = chunks_dir;
            }
            if no_shared {
                config.shared_indexes_enabled = false;
            }
            let excludes = config.exclude_patterns.clone();
            let project = ProjectIndex::open(config, builtin_kinds())?;
            let source = roots.iter().fold(
                FsFileSource::new(Arc::clone(project.database()), excludes),
                |source, root| source.with_root(root, FileOrigin::Local),
            );
            let outcome = project.run_session(&source, &ProgressScope::new())?;
            project.record_roots(&roots)?;
            print_outcome(outcome)
        }
    }
}

fn print_outcome<T: Serialize>(outcome: Completion<T>) -> IndexResult<()> {
    match outcome {
        Completion::Finished(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        Completion::Cancelled => println!("{{\"cancelled\": true}}"),
    }
    Ok(())
}
