use std::sync::Arc;
use std::time::Duration;

use actlog_adapters::{GithubAdapter, GithubClient, HookTarget, RepoTarget};
use actlog_storage::postgres::{connect, migrate};
use actlog_storage::{EventStore, HttpFetcher, PgEventStore, PgQueue};
use actlog_sync::{
    load_source_registry, BackfillFetcher, BackfillOptions, BackfillSelection, BatchConfig,
    BatchPipeline, DeliveryReconciler, RecoveryConfig, RecoveryScheduler, SyncConfig,
};
use actlog_web::AppState;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "actlog")]
#[command(about = "Provider activity ingestion: webhooks, recovery and backfill")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook receiver with the flush loop and recovery scheduler.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Run one delivery reconciliation pass now.
    Recover,
    /// Import historical pull requests, reviews and issues for one repository.
    Backfill(BackfillArgs),
}

#[derive(Debug, Args)]
struct BackfillArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    repo: String,
    /// Comma-separated: pull_requests, reviews, issues.
    #[arg(long, default_value = "pull_requests,reviews")]
    types: BackfillSelection,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    per_page: Option<u32>,
    /// Environment variable holding the API token.
    #[arg(long, default_value = "GITHUB_TOKEN")]
    token_env: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ACTLOG_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Migrate => {
            let pool = connect(&config.database_url, DB_ACQUIRE_TIMEOUT).await?;
            migrate(&pool).await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Recover => {
            let store = pg_store(&config).await?;
            let registry = load_source_registry(&config.sources_file).await?;
            let reconciler = reconciler(&config, store, registry.hook_targets())?;
            let stats = reconciler.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Backfill(args) => backfill(&config, args).await,
    }
}

async fn pg_store(config: &SyncConfig) -> Result<Arc<dyn EventStore>> {
    let pool = connect(&config.database_url, DB_ACQUIRE_TIMEOUT).await?;
    Ok(Arc::new(PgEventStore::new(pool)))
}

fn github_client(config: &SyncConfig) -> Result<Arc<GithubClient>> {
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    Ok(Arc::new(GithubClient::new(http, config.github_api.clone())))
}

fn reconciler(
    config: &SyncConfig,
    store: Arc<dyn EventStore>,
    hooks: Vec<HookTarget>,
) -> Result<DeliveryReconciler> {
    Ok(DeliveryReconciler::new(
        github_client(config)?,
        store,
        Arc::new(GithubAdapter),
        hooks,
        RecoveryConfig {
            interval: config.recovery_interval(),
            page_size: config.page_size,
        },
    ))
}

async fn backfill(config: &SyncConfig, args: BackfillArgs) -> Result<()> {
    let store = pg_store(config).await?;
    let fetcher = BackfillFetcher::new(github_client(config)?, store);
    let options = BackfillOptions {
        target: RepoTarget {
            owner: args.owner,
            repo: args.repo,
            token: std::env::var(&args.token_env).ok().filter(|t| !t.is_empty()),
        },
        selection: args.types,
        per_page: args.per_page.unwrap_or(config.page_size).max(1),
        dry_run: args.dry_run,
    };
    let summary = fetcher
        .run(&options)
        .await
        .with_context(|| format!("backfilling {}", options.target.full_name()))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve(config: &SyncConfig) -> Result<()> {
    let pool = connect(&config.database_url, DB_ACQUIRE_TIMEOUT).await?;
    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
    let mut state = AppState::new(store.clone(), Arc::new(GithubAdapter))
        .with_secret(config.webhook_secret.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut flush_loop = None;
    if config.batch_enabled {
        let pipeline = Arc::new(BatchPipeline::new(
            store.clone(),
            Arc::new(PgQueue::new(pool)),
            BatchConfig {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval(),
                stream: config.queue_stream.clone(),
            },
        ));
        flush_loop = Some(tokio::spawn(Arc::clone(&pipeline).run(shutdown_rx)));
        state = state.with_pipeline(pipeline);
        info!(batch_size = config.batch_size, "batch mode enabled");
    }

    let mut scheduler = None;
    if config.recovery_enabled {
        let registry = load_source_registry(&config.sources_file).await?;
        let reconciler = reconciler(config, store, registry.hook_targets())?;
        scheduler =
            Some(RecoveryScheduler::start(Arc::new(reconciler), config.recovery_interval()).await?);
    }

    actlog_web::serve(state, config.web_port, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "installing ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    })
    .await?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = flush_loop {
        handle.await.context("joining flush loop")?;
    }
    if let Some(scheduler) = scheduler {
        scheduler.stop().await?;
    }
    Ok(())
}
