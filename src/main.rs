use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hncrawler::config::{Config, CONCURRENCY, CRAWL_INTERVAL, MAX_ATTEMPTS, PAGES, STALL_TIMEOUT};
use hncrawler::http_client::HttpBrowser;
use hncrawler::processor::{JobProcessor, ProcessorSettings};
use hncrawler::rate_limiter::RateLimiter;
use hncrawler::scheduler::{CrawlQueue, Scheduler};
use hncrawler::server::{self, AppState};
use hncrawler::status::StatusHandle;
use hncrawler::store::ItemStore;
use hncrawler::ui::{self, Dashboard};
use hncrawler::writer::SnapshotWriter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config)?;
    tracing::info!(port = config.port, tui = config.tui, listing_url = %config.listing_url, "starting hncrawler");

    if let Some(parent) = config.store_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = ItemStore::open(&config.store_path)
        .with_context(|| format!("Failed to open store at {}", config.store_path.display()))?;
    tracing::info!("creating index");
    store.ensure_unique_index().context("Failed to build unique index")?;
    tracing::info!(items = store.count()?, "store ready");

    let status = StatusHandle::new();
    let queue = Arc::new(CrawlQueue::new("hackernews", STALL_TIMEOUT));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server_state = AppState {
        status: status.clone(),
        queue: queue.stats(),
        store: store.clone(),
    };
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve(addr, server_state).await {
            tracing::error!(%addr, error = %e, "status server failed");
        }
    });

    let browser = HttpBrowser::new(RateLimiter::new()).context("Failed to build HTTP client")?;
    let processor = Arc::new(JobProcessor::new(
        browser,
        store,
        SnapshotWriter::new(&config.data_dir),
        status.clone(),
        ProcessorSettings::from_config(&config),
    ));

    let scheduler = Scheduler::new(
        queue.clone(),
        Scheduler::targets(&config.listing_url, PAGES).context("Invalid LISTING_URL")?,
        CRAWL_INTERVAL,
        MAX_ATTEMPTS,
    );
    scheduler.install_stall_policy();
    let scheduler_task = tokio::spawn(scheduler.run());

    let worker = queue.process(CONCURRENCY, move |job| {
        let processor = processor.clone();
        async move { processor.process(job).await }
    });

    let dashboard = async {
        if config.tui {
            ui::run_ui(Dashboard::new(status.clone(), queue.stats())).await
        } else {
            std::future::pending().await
        }
    };

    tokio::select! {
        result = worker => result.context("Queue processing failed")?,
        result = dashboard => result.context("Dashboard failed")?,
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
    }

    tracing::info!("shutting down");
    queue.close();
    scheduler_task.abort();
    server_task.abort();
    Ok(())
}

/// Logs go to stdout, or to `<data_dir>/crawler.log` while the dashboard owns
/// the terminal.
fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hncrawler=debug".into());

    let file_layer = if config.tui {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
        let path = config.data_dir.join("crawler.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };
    let stdout_layer = (!config.tui).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    Ok(())
}
