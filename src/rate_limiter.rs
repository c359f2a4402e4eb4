use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

pub const MIN_DELAY: Duration = Duration::from_secs(1);

/// Per-host politeness gate shared by every page session.
///
/// Each caller reserves the next free slot for its host while holding the
/// lock and sleeps after releasing it, so concurrent callers for one host are
/// spaced `min_delay` apart instead of all waking at once.
pub struct RateLimiter {
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
    min_delay: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_delay(MIN_DELAY)
    }

    pub fn with_delay(min_delay: Duration) -> Self {
        Self {
            next_slot: Arc::new(Mutex::new(HashMap::new())),
            min_delay,
        }
    }

    pub async fn wait_if_needed(&self, url: &str) {
        let Some(host) = Self::extract_host(url) else {
            return;
        };

        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match slots.get(&host) {
                Some(reserved) if *reserved > now => *reserved,
                _ => now,
            };
            slots.insert(host, slot + self.min_delay);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }

    fn extract_host(url: &str) -> Option<String> {
        Url::parse(url).ok().and_then(|u| u.host_str().map(|s| s.to_string()))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            next_slot: self.next_slot.clone(),
            min_delay: self.min_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_requests_to_same_host() {
        let limiter = RateLimiter::with_delay(Duration::from_secs(1));
        let start = Instant::now();

        let a = limiter.clone();
        let b = limiter.clone();
        let c = limiter.clone();
        let (ta, tb, tc) = tokio::join!(
            async move {
                a.wait_if_needed("https://news.ycombinator.com/news?p=1").await;
                start.elapsed()
            },
            async move {
                b.wait_if_needed("https://news.ycombinator.com/news?p=2").await;
                start.elapsed()
            },
            async move {
                c.wait_if_needed("https://news.ycombinator.com/news?p=3").await;
                start.elapsed()
            },
        );

        let mut waits = vec![ta, tb, tc];
        waits.sort();
        assert_eq!(waits[0], Duration::ZERO);
        assert_eq!(waits[1], Duration::from_secs(1));
        assert_eq!(waits[2], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn hosts_are_independent() {
        let limiter = RateLimiter::with_delay(Duration::from_secs(5));
        let start = Instant::now();

        limiter.wait_if_needed("https://a.example/").await;
        limiter.wait_if_needed("https://b.example/").await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.wait_if_needed("https://a.example/again").await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unparsable_url_passes_through() {
        let limiter = RateLimiter::new();
        limiter.wait_if_needed("not a url").await;
        limiter.wait_if_needed("not a url").await;
    }
}
