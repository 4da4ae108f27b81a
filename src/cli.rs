use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    connect_channel, connect_pool, format_duration, migrate, ArchiveWorker, ArtifactStorage,
    ChromeCapturer, ChromeSessionPool, Config, JobDispatcher, LinkId, LinkStore, Metrics,
    PgLinkStore, WorkerPool, WorkerPoolOptions, ARCHIVE_QUEUE,
};

#[derive(Parser, Debug)]
#[command(name = "link-archiver")]
#[command(about = "Archive job dispatcher and worker for saved links")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Database holding link records")]
    pub database_url: Option<String>,

    #[arg(long, help = "Broker connection string (postgres:// or memory://)")]
    pub broker_url: Option<String>,

    #[arg(long, help = "Number of concurrent archive routines")]
    pub workers: Option<usize>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume archive jobs until interrupted
    Worker,

    /// Request preservation of one or more links
    Enqueue {
        #[arg(required = true, help = "Link ids")]
        link_ids: Vec<String>,
    },

    /// Capture one link right away, without the queue
    Archive {
        #[arg(help = "Link id")]
        link_id: i64,
    },

    /// Show backend mode, queue counts and due links
    Status,

    /// Apply database migrations
    Migrate,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Fold command-line flags over the loaded configuration.
pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(url) = &args.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(url) = &args.broker_url {
        config.broker_url = Some(url.clone());
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
}

/// Separate command-line link ids into accepted ids and rejected raw values.
pub fn split_link_ids(raw: &[String]) -> (Vec<LinkId>, Vec<&str>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for value in raw {
        match LinkId::parse(value) {
            Some(id) => valid.push(id),
            None => invalid.push(value.as_str()),
        }
    }
    (valid, invalid)
}

pub struct CliRunner {
    pub config: Config,
    pub metrics: Arc<Metrics>,
}

impl CliRunner {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Worker => self.run_worker(shutdown).await,
            Commands::Enqueue { link_ids } => self.run_enqueue(link_ids).await,
            Commands::Archive { link_id } => self.run_archive(link_id).await,
            Commands::Status => self.show_status().await,
            Commands::Migrate => self.run_migrate().await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    async fn open_store(&self) -> anyhow::Result<Arc<dyn LinkStore>> {
        let url = self
            .config
            .database_url
            .as_deref()
            .context("DATABASE_URL is not set")?;
        let store = PgLinkStore::connect(url)
            .await
            .context("cannot open the link database")?;
        Ok(Arc::new(store))
    }

    fn build_worker(
        &self,
        store: Arc<dyn LinkStore>,
    ) -> (Arc<ChromeSessionPool>, ArchiveWorker<ChromeSessionPool, ChromeCapturer>) {
        let sessions = Arc::new(ChromeSessionPool::new(self.config.clone()));
        let worker = ArchiveWorker::new(
            store,
            sessions.clone(),
            Arc::new(ChromeCapturer::new(&self.config)),
            ArtifactStorage::new(&self.config.storage_dir),
            self.config.capture.clone(),
            self.metrics.clone(),
        );
        (sessions, worker)
    }

    pub async fn run_worker(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let broker_url = match self.config.broker_url.as_deref() {
            Some(url) if self.config.broker_configured() => url,
            _ => {
                info!("Archive queue disabled. Set ARCHIVE_BROKER_URL to enable the archive worker.");
                return Ok(());
            }
        };

        let store = self.open_store().await?;
        let channel = connect_channel(broker_url, &self.config)
            .await
            .context("cannot connect to the broker")?;
        let (sessions, worker) = self.build_worker(store);

        let pool = WorkerPool::start(
            Arc::new(worker),
            channel,
            WorkerPoolOptions::from_config(&self.config),
        );

        let _ = shutdown.recv().await;
        info!("Stopping archive workers...");
        let stats = pool.get_worker_stats();
        pool.shutdown().await;
        sessions.shutdown().await;

        let session_stats = sessions.stats();
        info!(
            "Sessions: {} launched, {} released, {} launch failures",
            session_stats.launched, session_stats.released, session_stats.launch_failures
        );

        for stat in stats {
            info!(
                "Routine {}: {} processed, {} discarded, {} errors",
                stat.id, stat.processed_count, stat.discarded_count, stat.error_count
            );
        }
        Ok(())
    }

    pub async fn run_enqueue(&self, link_ids: Vec<String>) -> anyhow::Result<()> {
        let store = self.open_store().await?;
        let dispatcher = JobDispatcher::from_config(&self.config, store, self.metrics.clone())
            .await
            .context("cannot set up the archive backend")?;

        let (valid, invalid) = split_link_ids(&link_ids);
        for raw in invalid {
            warn!("Skipping invalid link id '{}'", raw);
        }
        for id in &valid {
            dispatcher.enqueue_archive_job(id.get()).await;
        }

        println!(
            "Dispatched {} archive request(s) via the {} backend",
            valid.len(),
            dispatcher.backend_kind()
        );
        Ok(())
    }

    pub async fn run_archive(&self, link_id: i64) -> anyhow::Result<()> {
        let Some(id) = LinkId::new(link_id) else {
            bail!("invalid link id {link_id}");
        };

        let store = self.open_store().await?;
        let Some(link) = store.find_link(id).await? else {
            bail!("link {id} not found");
        };

        let (sessions, worker) = self.build_worker(store);
        let result = worker.archive_link(&link).await;
        sessions.shutdown().await;
        let report = result?;

        println!(
            "Link {} preserved in {} ({})",
            id,
            format_duration(report.duration),
            if report.is_complete() { "complete" } else { "partial" }
        );
        if !report.persisted {
            println!("  link was deleted before its artifacts were saved");
        }
        for kind in &report.captured {
            println!("  captured: {kind}");
        }
        for (kind, reason) in &report.failed {
            println!("  failed:   {kind} ({reason})");
        }
        for kind in &report.skipped {
            println!("  skipped:  {kind}");
        }
        Ok(())
    }

    pub async fn show_status(&self) -> anyhow::Result<()> {
        println!("Archive Status");
        println!("==============");

        match self.config.broker_url.as_deref() {
            Some(url) if self.config.broker_configured() => {
                println!("Backend: queue");
                let channel = connect_channel(url, &self.config)
                    .await
                    .context("cannot connect to the broker")?;
                let counts = channel.counts(ARCHIVE_QUEUE).await?;
                println!("  Waiting:   {}", counts.waiting);
                println!("  Delayed:   {}", counts.delayed);
                println!("  Active:    {}", counts.active);
                println!("  Failed:    {}", counts.failed);
                println!("  Completed: {}", counts.completed);
            }
            _ => println!("Backend: polling (no broker configured)"),
        }

        if self.config.database_url.is_some() {
            let store = self.open_store().await?;
            println!("Links due for preservation: {}", store.count_due().await?);
        }
        Ok(())
    }

    pub async fn run_migrate(&self) -> anyhow::Result<()> {
        let url = self
            .config
            .database_url
            .as_deref()
            .context("DATABASE_URL is not set")?;
        migrate(&connect_pool(url).await?).await?;

        if let Some(broker) = self.config.broker_url.as_deref() {
            let is_postgres = broker.starts_with("postgres://") || broker.starts_with("postgresql://");
            if is_postgres && broker != url {
                migrate(&connect_pool(broker).await?).await?;
            }
        }

        println!("Migrations applied");
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::from_file(&config_path)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!(
            "  Backend: {}",
            if config.broker_configured() { "queue" } else { "polling" }
        );
        println!("  Workers: {}", config.workers);
        println!("  Session pool size: {}", config.session_pool_size);
        println!("  Capture timeout: {:?}", config.capture_timeout);
        println!("  Storage dir: {}", config.storage_dir.display());
        println!(
            "  Job options: {} attempts, {:?}",
            config.job_options.attempts, config.job_options.backoff
        );

        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install log subscriber: {e}"))?;

    Ok(())
}
