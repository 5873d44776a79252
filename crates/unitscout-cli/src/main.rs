use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use unitscout_core::{CrawlScheduler, CrawlerConfig, JobQueue, JobState};
use unitscout_db::{CrawlJobRepository, Database, DatabaseConfig};

#[derive(Parser)]
#[command(
    name = "unitscout",
    version,
    about = "Durable crawl queue for university unit catalogues"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run crawl worker slots until Ctrl-C
    Worker {
        /// Execution slots (and browser sessions) in this process
        #[arg(short, long, env = "UNITSCOUT_CONCURRENCY")]
        concurrency: Option<usize>,

        /// JSON file of per-university site profiles
        #[arg(short, long, env = "UNITSCOUT_SITES", default_value = "sites.json")]
        sites: PathBuf,
    },

    /// Queue a discovery job per university
    Discover {
        /// University id (repeatable)
        #[arg(short, long = "university", required = true)]
        universities: Vec<String>,
    },

    /// Queue scrape jobs for known unit codes
    Enqueue {
        #[arg(short, long)]
        university: String,

        /// Comma-separated unit codes
        #[arg(short, long, value_delimiter = ',', required_unless_present = "codes_file")]
        codes: Vec<String>,

        /// File with one unit code per line
        #[arg(long)]
        codes_file: Option<PathBuf>,

        /// Defer every job by this many seconds
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// Show queue depth per state
    Stats {
        /// Print as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List jobs, newest first
    Jobs {
        /// Filter by state (waiting, delayed, active, completed, failed)
        #[arg(short, long)]
        state: Option<JobState>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one job as JSON
    Show {
        /// Job id, e.g. scrape-U1-COMP1001
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("unitscout=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CrawlerConfig::from_env().context("Invalid crawler configuration")?;
    let repo = connect_db().await?;

    match cli.command {
        Commands::Worker { concurrency, sites } => {
            let mut config = config;
            if let Some(n) = concurrency {
                config.worker = config.worker.with_concurrency(n);
                config.pool = config.pool.with_max(config.worker.concurrency);
            }
            cmd_worker(repo, config, &sites).await?;
        }
        Commands::Discover { universities } => {
            let scheduler = scheduler(repo, &config);
            for university in &universities {
                let created = scheduler.submit_discovery(university).await?;
                let verdict = if created { "queued" } else { "already pending" };
                println!("discovery-{university}: {verdict}");
            }
        }
        Commands::Enqueue {
            university,
            codes,
            codes_file,
            delay_secs,
        } => {
            let mut codes = codes;
            if let Some(path) = codes_file {
                codes.extend(read_codes(&path)?);
            }
            let delay = delay_secs.map(Duration::from_secs);
            let summary = scheduler(repo, &config)
                .submit_scrape_batch(&university, &codes, delay)
                .await?;
            println!(
                "{university}: {} requested, {} enqueued in {} chunk(s)",
                summary.requested, summary.enqueued, summary.chunks
            );
        }
        Commands::Stats { json } => {
            let counts = repo.counts().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                for state in JobState::ALL {
                    println!("{:<10} {}", state.as_str(), counts.get(state));
                }
                println!(
                    "{:<10} {} / {}",
                    "pending",
                    counts.pending(),
                    config.fanout.max_queue_size
                );
            }
        }
        Commands::Jobs { state, limit } => cmd_jobs(&repo, state, limit).await?,
        Commands::Show { id } => {
            let job = repo
                .get_job(&id)
                .await?
                .with_context(|| format!("No job with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<CrawlJobRepository> {
    let db_config = DatabaseConfig::from_env()?;
    let db = Database::connect(&db_config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db.crawl_repo())
}

fn scheduler(
    repo: CrawlJobRepository,
    config: &CrawlerConfig,
) -> CrawlScheduler<CrawlJobRepository> {
    CrawlScheduler::new(repo, config.fanout.clone())
        .with_discovery_attempts(config.discovery_attempts)
}

fn read_codes(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read codes file: {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

async fn cmd_jobs(repo: &CrawlJobRepository, state: Option<JobState>, limit: usize) -> Result<()> {
    let jobs = repo.list_jobs(state, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &jobs {
        let run_at = job
            .run_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".into());
        let error = job
            .last_error
            .as_deref()
            .map(|e| e.chars().take(60).collect::<String>())
            .unwrap_or_default();
        println!(
            "{:<40} {:<9} {:<9} {}/{} {:<23} {}",
            job.id,
            job.kind.as_str(),
            job.state.as_str(),
            job.attempts_made,
            job.max_attempts,
            run_at,
            error
        );
    }
    println!("\nTotal: {} jobs", jobs.len());
    Ok(())
}

#[cfg(feature = "browser")]
async fn cmd_worker(repo: CrawlJobRepository, config: CrawlerConfig, sites: &Path) -> Result<()> {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use unitscout_client::{
        BrowserDiscoverer, BrowserScraper, ChromiumLauncher, HashLoggingSink, SiteRegistry,
    };
    use unitscout_core::{
        BrowserPool, FanoutPipeline, ThrottleController, TracingWorkerReporter, WorkerService,
    };

    let sites = Arc::new(SiteRegistry::load(sites)?);
    let throttle = Arc::new(ThrottleController::new(config.throttle.clone()));

    tracing::info!(
        worker_id = %config.worker.worker_id,
        concurrency = config.worker.concurrency,
        pool_min = config.pool.min,
        sites = sites.len(),
        "Starting worker"
    );

    let worker = WorkerService::new(
        repo.clone(),
        BrowserPool::new(ChromiumLauncher::new(), config.pool.clone()),
        BrowserDiscoverer::new(Arc::clone(&sites)),
        BrowserScraper::new(sites, HashLoggingSink),
        throttle,
        FanoutPipeline::new(repo, config.fanout.clone()),
        config.worker.clone(),
    );

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    worker.run(cancel_token, &TracingWorkerReporter).await?;
    Ok(())
}

#[cfg(not(feature = "browser"))]
async fn cmd_worker(
    _repo: CrawlJobRepository,
    _config: CrawlerConfig,
    _sites: &Path,
) -> Result<()> {
    anyhow::bail!(
        "unitscout was built without the `browser` feature; rebuild with --features browser"
    )
}

#[cfg(feature = "browser")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    tracing::info!("Shutdown signal received, draining");
}
