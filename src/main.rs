use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use vwsyncd::clock::SystemClock;
use vwsyncd::config::AppConfig;
use vwsyncd::context::AppContext;
use vwsyncd::core::archive::ArchiveService;
use vwsyncd::core::cleanup::CleanupService;
use vwsyncd::core::models::{S3Config, TargetConfig, WebDavConfig};
use vwsyncd::core::retry::RetryPolicy;
use vwsyncd::core::{Scheduler, Syncer};
use vwsyncd::{db, logging};

#[derive(Parser)]
#[command(name = "vwsyncd")]
#[command(about = "Vaultwarden backup and replication daemon", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Daemon,
    /// Run one sync cycle, for all enabled targets or a single one
    Sync {
        #[arg(long)]
        target: Option<i64>,
    },
    /// Restore a backup archive into a directory
    Restore {
        #[arg(long)]
        target: i64,
        #[arg(long)]
        file: String,
        #[arg(long)]
        dest: PathBuf,
    },
    /// Probe every enabled target
    Health,
    /// Prune sync jobs older than the retention window
    Cleanup,
    /// List configured targets
    Targets,
    /// Register a WebDAV target
    AddWebdav {
        name: String,
        url: String,
        username: String,
        password: String,
    },
    /// Register an S3-compatible target
    AddS3 {
        name: String,
        bucket: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config).context("Failed to load configuration")?;
    logging::init(&config.logging);

    let db = db::open(&config.database.dsn)
        .await
        .context("Failed to open ledger database")?;
    let ctx = AppContext::new(config, db);

    match cli.command {
        Commands::Daemon => run_daemon(ctx).await.context("Daemon failed")?,
        Commands::Sync { target } => run_sync(ctx, target).await.context("Sync failed")?,
        Commands::Restore { target, file, dest } => {
            build_syncer(&ctx)
                .restore(target, &file, &dest, &CancellationToken::new())
                .await
                .context("Restore failed")?;
        }
        Commands::Health => run_health(ctx).await.context("Health check failed")?,
        Commands::Cleanup => {
            let cleanup = build_cleanup(&ctx);
            let deleted = cleanup
                .run(&CancellationToken::new())
                .await
                .context("Cleanup failed")?;
            println!("deleted {deleted} job records");
        }
        Commands::Targets => run_list_targets(ctx).await?,
        Commands::AddWebdav {
            name,
            url,
            username,
            password,
        } => {
            let config = TargetConfig::Webdav(WebDavConfig {
                url,
                username,
                password,
            });
            let id = db::targets::create(&ctx.db, name, config, chrono::Utc::now())
                .await
                .context("Failed to create target")?;
            println!("created target {id}");
        }
        Commands::AddS3 {
            name,
            bucket,
            region,
            access_key_id,
            secret_access_key,
            endpoint,
        } => {
            let config = TargetConfig::S3(S3Config {
                endpoint,
                access_key_id,
                secret_access_key,
                region,
                bucket,
            });
            let id = db::targets::create(&ctx.db, name, config, chrono::Utc::now())
                .await
                .context("Failed to create target")?;
            println!("created target {id}");
        }
    }

    Ok(())
}

fn build_syncer(ctx: &AppContext) -> Syncer {
    let sync = &ctx.config.sync;
    let archive = ArchiveService::new(
        ctx.config.vaultwarden.data_path.clone(),
        sync.compression_level,
        sync.archive_password().map(str::to_string),
    );
    let policy = RetryPolicy {
        max_attempts: sync.max_retries,
        base_delay: Duration::from_secs(sync.retry_delay_seconds),
    };
    Syncer::new(ctx.db.clone(), archive, policy, sync.concurrency)
        .with_notifier(ctx.notifier.clone())
}

fn build_cleanup(ctx: &AppContext) -> CleanupService {
    CleanupService::new(
        ctx.db.clone(),
        ctx.config.sync.history_retention_days,
        Arc::new(SystemClock),
    )
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    let scheduler = Scheduler::new(
        ctx.db.clone(),
        build_syncer(&ctx),
        build_cleanup(&ctx),
        &ctx.config,
    );

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown).await;
    info!("daemon running, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    shutdown.cancel();
    scheduler.stop().await;
    Ok(())
}

async fn run_sync(ctx: AppContext, target: Option<i64>) -> Result<()> {
    let syncer = build_syncer(&ctx);
    let cancel = CancellationToken::new();

    match target {
        Some(id) => syncer.sync_one(id, &cancel).await?,
        None => {
            let targets = db::targets::list_enabled(&ctx.db).await?;
            anyhow::ensure!(!targets.is_empty(), "no enabled targets configured");
            let ids: Vec<i64> = targets.iter().map(|t| t.id).collect();
            syncer.sync_many(&ids, &cancel).await?;
        }
    }
    Ok(())
}

async fn run_health(ctx: AppContext) -> Result<()> {
    let syncer = build_syncer(&ctx);
    let results = syncer.health_check_all(&CancellationToken::new()).await?;

    if results.is_empty() {
        println!("no enabled targets");
        return Ok(());
    }

    let mut names: Vec<_> = results.keys().cloned().collect();
    names.sort();
    let mut failed = false;
    for name in names {
        match &results[&name] {
            None => println!("{name}: ok"),
            Some(error) => {
                failed = true;
                println!("{name}: {error}");
            }
        }
    }
    anyhow::ensure!(!failed, "one or more targets are unhealthy");
    Ok(())
}

async fn run_list_targets(ctx: AppContext) -> Result<()> {
    let targets = db::targets::list(&ctx.db).await?;
    if targets.is_empty() {
        println!("no targets configured");
        return Ok(());
    }
    for target in targets {
        let state = if target.enabled { "enabled" } else { "disabled" };
        println!("{}\t{}\t{}\t{}", target.id, target.name, target.kind, state);
    }
    Ok(())
}
