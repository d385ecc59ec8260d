use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use scrapeflow::config::{ConfigProvider, ExecutionKind, FileConfigProvider, JobId};
use scrapeflow::error::ConfigError;
use scrapeflow::{
    init_logging, run_with_retry, Database, FsObjectStore, ObjectStore, Orchestrator,
    ProcessInvoker, ScheduleHost, ScrapeflowError,
};

/// How often the schedule host picks up trigger edits from the config file.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "scrapeflow", version, about = "Scheduled scraping orchestration")]
struct Cli {
    /// Configuration file (YAML or JSON).
    #[arg(env = "SCRAPEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Run the manual jobs once, print the summary and exit.
    #[arg(long, alias = "run-manual")]
    once: bool,

    /// Restrict a one-shot run to a single job id.
    #[arg(long, value_name = "ID", requires = "once")]
    job: Option<String>,
}

impl Cli {
    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".scrapeflow").join("config.yaml")))
    }

    fn job_id(&self) -> Option<JobId> {
        self.job.as_deref().map(JobId::new)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("scrapeflow: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ScrapeflowError> {
    let cli = Cli::parse();
    let config_path = cli
        .config_path()
        .ok_or_else(|| ConfigError::Missing("config path".to_string()))?;

    let provider = Arc::new(FileConfigProvider::open(&config_path)?);
    let config = provider.current();

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("scrapeflow: logging disabled: {}", e);
    }
    info!(
        "Starting scrapeflow v{} with {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let db_path = config
        .database_path()
        .ok_or_else(|| ConfigError::Missing("database_path".to_string()))?;
    let db = Database::open(&db_path)?;

    let store = config.storage.root.as_ref().map(|root| {
        info!("Object store at {} (bucket {})", root, config.storage.bucket);
        Arc::new(FsObjectStore::new(root, &config.storage.bucket)) as Arc<dyn ObjectStore>
    });

    let orchestrator = Arc::new(Orchestrator::new(
        provider,
        db,
        Arc::new(ProcessInvoker::new()),
        store,
    ));

    if cli.once {
        let worker = Arc::clone(&orchestrator);
        let job = cli.job_id();
        let summary = tokio::task::spawn_blocking(move || {
            run_with_retry(&worker, ExecutionKind::Manual, job.as_ref())
        })
        .await
        .map_err(|e| scrapeflow::WorkerError::TaskFailed(e.to_string()))??;

        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Failed to render run summary: {}", e),
        }
        shutdown(orchestrator);
        return Ok(());
    }

    let mut host = ScheduleHost::start(Arc::clone(&orchestrator)).await?;

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| ConfigError::Validation {
        message: format!("failed to install signal handler: {}", e),
    })?;

    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
    refresh.tick().await;
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!("Shutdown requested");
                break;
            }
            _ = refresh.tick() => {
                match host.refresh().await {
                    Ok(count) => log::debug!("Schedule refreshed, {} trigger(s)", count),
                    Err(e) => warn!("Keeping previous schedule: {}", e),
                }
            }
        }
    }

    drop(orchestrator);
    let orchestrator = host.shutdown().await?;
    shutdown(orchestrator);
    Ok(())
}

fn shutdown(orchestrator: Arc<Orchestrator>) {
    match Arc::try_unwrap(orchestrator) {
        Ok(orchestrator) => orchestrator.shutdown(),
        Err(orchestrator) => {
            warn!("Runs still in progress; stopping workers without draining");
            orchestrator.pool().shutdown();
        }
    }
    info!("scrapeflow stopped");
}
