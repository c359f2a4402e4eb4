use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, SELECTOR_TIMEOUT, SETTLE_DELAY};
use crate::http_client::{Browser, Capabilities, FetchError, PageSession, SessionOptions};
use crate::parser::{self, ExtractError};
use crate::queue::JobHandle;
use crate::record::{CrawlJob, Record};
use crate::status::StatusHandle;
use crate::store::{InsertOutcome, ItemStore};
use crate::writer::{SnapshotError, SnapshotWriter};

/// Structural marker that must be present before the page is captured.
pub const RESULTS_SELECTOR: &str = "table";

/// Lowercased phrases of the listing's "too many requests" denial page.
const DENIAL_PATTERNS: &[&str] = &["not able to serve your"];

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("blocked")]
    Blocked,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("no page number in {0}")]
    PageNumber(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("invalid stage transition {from:?} -> {to:?}")]
    InvalidTransition { from: Stage, to: Stage },
}

impl JobError {
    /// Short classification used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Blocked => "blocked",
            JobError::Fetch(_) => "fetch",
            JobError::Extract(_) => "extract",
            JobError::PageNumber(_) => "page_number",
            JobError::Snapshot(_) => "snapshot",
            JobError::InvalidTransition { .. } => "transition",
        }
    }
}

/// Pipeline stages of one job. Entering a stage reports its progress value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Starting,
    SessionReady,
    Configured,
    TableVisible,
    ContentCaptured,
    BlockedDetected,
    Extracted,
    Persisted,
}

impl Stage {
    pub fn progress(self) -> u8 {
        match self {
            Stage::Starting => 10,
            Stage::SessionReady => 20,
            Stage::Configured => 30,
            Stage::TableVisible => 50,
            Stage::ContentCaptured => 70,
            Stage::Extracted => 80,
            Stage::BlockedDetected | Stage::Persisted => 100,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::BlockedDetected | Stage::Persisted)
    }

    pub fn can_advance_to(self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::Starting, Stage::SessionReady)
                | (Stage::SessionReady, Stage::Configured)
                | (Stage::Configured, Stage::TableVisible)
                | (Stage::TableVisible, Stage::ContentCaptured)
                | (Stage::ContentCaptured, Stage::BlockedDetected)
                | (Stage::ContentCaptured, Stage::Extracted)
                | (Stage::Extracted, Stage::Persisted)
        )
    }
}

struct StageTracker<'a, P> {
    job: &'a JobHandle<P>,
    current: Stage,
}

impl<'a, P> StageTracker<'a, P> {
    fn start(job: &'a JobHandle<P>) -> Self {
        job.progress(Stage::Starting.progress());
        Self {
            job,
            current: Stage::Starting,
        }
    }

    fn advance(&mut self, next: Stage) -> Result<(), JobError> {
        if !self.current.can_advance_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.job.progress(next.progress());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub settle_delay: Duration,
    pub selector_timeout: Duration,
    pub capabilities: Capabilities,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            selector_timeout: SELECTOR_TIMEOUT,
            capabilities: Capabilities {
                proxy: config.proxy_url.clone(),
                blocker: true,
                images: true,
                stylesheets: true,
                javascript: true,
            },
        }
    }
}

/// Outcome counts of writing one page's records to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub inserted: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct JobProcessor<B> {
    browser: B,
    store: ItemStore,
    snapshots: SnapshotWriter,
    status: StatusHandle,
    settings: ProcessorSettings,
}

impl<B: Browser> JobProcessor<B> {
    pub fn new(
        browser: B,
        store: ItemStore,
        snapshots: SnapshotWriter,
        status: StatusHandle,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            browser,
            store,
            snapshots,
            status,
            settings,
        }
    }

    /// Runs one crawl job to a terminal stage. Every error is returned to the
    /// queue, which decides whether the job is retried.
    pub async fn process(&self, job: JobHandle<CrawlJob>) -> Result<Vec<Record>, JobError> {
        info!(
            job_id = job.id(),
            url = %job.data().url,
            attempt = job.attempts_made() + 1,
            "processing"
        );

        let result = self.run(&job).await;
        if let Err(e) = &result {
            warn!(
                job_id = job.id(),
                url = %job.data().url,
                kind = e.kind(),
                error = %e,
                "job failed"
            );
        }
        result
    }

    async fn run(&self, job: &JobHandle<CrawlJob>) -> Result<Vec<Record>, JobError> {
        let url = job.data().url.as_str();
        let mut stage = StageTracker::start(job);

        let mut session = self
            .browser
            .open_session(url, SessionOptions { reuse: false })
            .await?;
        tokio::time::sleep(self.settings.settle_delay).await;
        stage.advance(Stage::SessionReady)?;

        session.configure(&self.settings.capabilities).await?;
        stage.advance(Stage::Configured)?;

        session
            .wait_for_selector(RESULTS_SELECTOR, self.settings.selector_timeout)
            .await?;
        stage.advance(Stage::TableVisible)?;

        let content = session.content().await?;
        stage.advance(Stage::ContentCaptured)?;

        if is_blocked(&content) {
            close_session(session, url).await;
            stage.advance(Stage::BlockedDetected)?;
            return Err(JobError::Blocked);
        }

        let extracted = parser::extract_listing(&content);
        close_session(session, url).await;
        let extracted = extracted?;
        stage.advance(Stage::Extracted)?;

        let page = job
            .data()
            .page_number()
            .ok_or_else(|| JobError::PageNumber(url.to_string()))?;
        let scraped_at = Utc::now();
        let records = extracted.into_records(page, scraped_at);
        info!(job_id = job.id(), url, page, records = records.len(), "success");

        let snapshot = self.snapshots.write_snapshot(url, &records).await?;
        info!(page, path = %snapshot.display(), "snapshot written");

        self.status.update(|state| {
            state.set_page(page, records.clone());
            state.push_log(format!(
                "scraped content on page {page}\t @ {}",
                scraped_at.to_rfc3339()
            ));
        });

        let summary = self.persist(&records).await;
        info!(
            page,
            inserted = summary.inserted,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "page persisted"
        );

        stage.advance(Stage::Persisted)?;
        Ok(records)
    }

    /// Inserts run on the blocking pool. A lost blocking task counts every
    /// record as a storage failure.
    async fn persist(&self, records: &[Record]) -> PersistSummary {
        let store = self.store.clone();
        let batch = records.to_vec();
        match tokio::task::spawn_blocking(move || persist_blocking(&store, &batch)).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(records = records.len(), error = %e, "storage failure");
                PersistSummary {
                    failed: records.len(),
                    ..PersistSummary::default()
                }
            }
        }
    }
}

/// Duplicates are the steady state on a rescrape and are logged as
/// "unchanged"; storage failures are logged separately and do not stop the
/// remaining records.
fn persist_blocking(store: &ItemStore, records: &[Record]) -> PersistSummary {
    let mut summary = PersistSummary::default();
    for record in records {
        match store.insert_if_new(record) {
            Ok(InsertOutcome::Inserted) => {
                summary.inserted += 1;
                info!(id = %record.id, title = %record.title, link = %record.link, "inserted");
            }
            Ok(InsertOutcome::DuplicateKey) => {
                summary.unchanged += 1;
                info!(id = %record.id, title = %record.title, link = %record.link, "unchanged");
            }
            Err(e) => {
                summary.failed += 1;
                warn!(id = %record.id, title = %record.title, error = %e, "storage failure");
            }
        }
    }
    summary
}

pub fn is_blocked(content: &str) -> bool {
    let lower = content.to_lowercase();
    DENIAL_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

async fn close_session<S: PageSession>(session: S, url: &str) {
    if let Err(e) = session.close().await {
        warn!(url, error = %e, "failed to close session");
    }
}
