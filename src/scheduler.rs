use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use url::Url;

use crate::queue::{JobId, JobOptions, JobQueue, QueueError, StallAction};
use crate::record::{CrawlJob, Record};

pub type CrawlQueue = JobQueue<CrawlJob, Vec<Record>>;

/// Enqueues one job per listing page now and again on every interval tick.
pub struct Scheduler {
    queue: Arc<CrawlQueue>,
    targets: Vec<String>,
    interval: Duration,
    attempts: u32,
}

impl Scheduler {
    pub fn new(queue: Arc<CrawlQueue>, targets: Vec<String>, interval: Duration, attempts: u32) -> Self {
        Self {
            queue,
            targets,
            interval,
            attempts,
        }
    }

    /// `p=1` through `p=pages` of the listing. Other query parameters are
    /// kept and an existing `p` is replaced.
    pub fn targets(listing_url: &str, pages: u32) -> Result<Vec<String>, url::ParseError> {
        let base = Url::parse(listing_url)?;
        let kept: Vec<(String, String)> = base
            .query_pairs()
            .filter(|(key, _)| key != "p")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Ok((1..=pages)
            .map(|page| {
                let mut url = base.clone();
                url.query_pairs_mut()
                    .clear()
                    .extend_pairs(&kept)
                    .append_pair("p", &page.to_string());
                url.to_string()
            })
            .collect())
    }

    /// Stalled crawl jobs are dropped; the next generation covers their page.
    pub fn install_stall_policy(&self) {
        self.queue.on_stalled(|job| {
            warn!(job_id = job.id, url = %job.data.url, progress = job.progress, "discard stalled job");
            StallAction::Discard
        });
    }

    pub fn enqueue_batch(&self) -> Result<Vec<JobId>, QueueError> {
        let options = JobOptions {
            attempts: self.attempts,
        };
        self.targets
            .iter()
            .map(|url| self.queue.add(CrawlJob::new(url.clone()), options))
            .collect()
    }

    /// Runs until the queue is closed.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            info!(queue = %self.queue.name(), jobs = self.targets.len(), "running");
            if let Err(e) = self.enqueue_batch() {
                info!(error = %e, "scheduler stopped");
                return;
            }
        }
    }
}
