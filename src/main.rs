use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stagewright::io::RunSummary;
use stagewright::{
    default_catalogue, write_deliverables, JsonFileStore, Orchestrator, PipelineConfig,
    PipelineStore, ProjectContext, ProjectRecord, StageCatalogue,
};

#[derive(Parser)]
#[command(name = "stagewright")]
#[command(author, version, about = "Schema-checked multi-stage planning pipeline", long_about = None)]
struct Cli {
    /// Directory holding project and stage result documents
    #[arg(long, global = true, default_value = ".stagewright")]
    store: PathBuf,

    /// Stage catalogue JSON file (defaults to the built-in catalogue)
    #[arg(long, global = true)]
    catalogue: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project from a description
    Init {
        /// Project identifier
        #[arg(short, long)]
        project: String,

        /// Free-text project description
        #[arg(short, long)]
        description: String,

        /// Auxiliary input (research snippets, notes); repeatable
        #[arg(long)]
        aux: Vec<String>,
    },

    /// Run the full pipeline for a project
    Run {
        /// Project identifier
        #[arg(short, long)]
        project: String,

        /// Generation backend: anthropic[:model], openai[:model] or scripted:<file>
        #[arg(short, long, default_value = "anthropic")]
        backend: String,

        /// Directory for the plan and summary deliverables
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Generation attempts per stage
        #[arg(long, default_value = "3")]
        attempts: u32,

        /// Timeout per backend call in seconds
        #[arg(long, default_value = "120")]
        timeout_secs: u64,

        /// Sampling temperature for regular stage calls
        #[arg(long, default_value = "0.7")]
        temperature: f64,
    },

    /// Show the status of a project and its stages
    Status {
        /// Project identifier
        #[arg(short, long)]
        project: String,
    },

    /// List the stages of the catalogue
    Catalogue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let catalogue = load_catalogue(cli.catalogue.as_deref())?;

    match cli.command {
        Commands::Init {
            project,
            description,
            aux,
        } => init_project(&cli.store, project, description, aux).await,
        Commands::Run {
            project,
            backend,
            out,
            attempts,
            timeout_secs,
            temperature,
        } => {
            let config = PipelineConfig::default()
                .with_max_attempts(attempts)
                .with_request_timeout(Duration::from_secs(timeout_secs))
                .with_temperature(temperature);
            run_pipeline(&cli.store, catalogue, config, &project, &backend, out).await
        }
        Commands::Status { project } => show_status(&cli.store, &catalogue, &project).await,
        Commands::Catalogue => {
            list_catalogue(&catalogue);
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_catalogue(path: Option<&Path>) -> Result<StageCatalogue> {
    match path {
        Some(path) => {
            info!("Loading catalogue from {:?}", path);
            StageCatalogue::from_file(path)
        }
        None => default_catalogue().context("Built-in catalogue is invalid"),
    }
}

fn open_store(dir: &Path) -> Result<JsonFileStore> {
    JsonFileStore::open(dir).with_context(|| format!("Failed to open store: {:?}", dir))
}

async fn init_project(
    store_dir: &Path,
    project: String,
    description: String,
    auxiliary: Vec<String>,
) -> Result<()> {
    let store = open_store(store_dir)?;
    if store.project(&project).await?.is_some() {
        bail!("Project {} already exists", project);
    }

    let record = ProjectRecord::new(
        project.clone(),
        ProjectContext {
            description,
            auxiliary,
        },
    );
    store.insert_project(&record).await?;
    info!("Created project {} in {:?}", project, store_dir);
    Ok(())
}

async fn run_pipeline(
    store_dir: &Path,
    catalogue: StageCatalogue,
    config: PipelineConfig,
    project: &str,
    backend: &str,
    out: Option<PathBuf>,
) -> Result<()> {
    let store = open_store(store_dir)?;
    let orchestrator = Orchestrator::new(Arc::new(store), catalogue, config);

    let report = match orchestrator.run(project, backend).await {
        Ok(report) => report,
        Err(err) => {
            if let Some(errors) = err.validation_errors() {
                for issue in errors {
                    error!("  {}", issue);
                }
            }
            return Err(err).with_context(|| format!("Pipeline run for {} failed", project));
        }
    };

    let summary = RunSummary::new(&report, orchestrator.catalogue());
    println!("{}", summary.format());

    if let Some(dir) = out {
        for path in write_deliverables(&report, orchestrator.catalogue(), &dir)? {
            info!("Wrote {:?}", path);
        }
    }
    Ok(())
}

async fn show_status(store_dir: &Path, catalogue: &StageCatalogue, project: &str) -> Result<()> {
    let store = open_store(store_dir)?;
    let Some(record) = store.project(project).await? else {
        bail!("Project {} not found", project);
    };
    let results = store.results_for_project(project).await?;

    println!("Project {}", record.id);
    println!("==================");
    println!("Status: {:?}", record.status);
    println!("Updated: {}", record.updated_at.to_rfc3339());
    println!();

    for stage in &catalogue.stages {
        match results.iter().find(|r| r.stage_type == stage.stage_type) {
            Some(result) => {
                println!(
                    "{:<12} {:?} (attempts: {}, backend: {})",
                    stage.stage_type,
                    result.status,
                    result.attempts,
                    result.backend.as_deref().unwrap_or("-")
                );
                if let Some(error) = &result.error {
                    println!("  error: {}", error);
                }
            }
            None => println!("{:<12} Pending", stage.stage_type),
        }
    }
    Ok(())
}

fn list_catalogue(catalogue: &StageCatalogue) {
    println!("Stages");
    println!("------");
    for (i, stage) in catalogue.stages.iter().enumerate() {
        println!(
            "{}. {:<12} {:?}  {}",
            i + 1,
            stage.stage_type,
            stage.role,
            stage.description
        );
    }
}
