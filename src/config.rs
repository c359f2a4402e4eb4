use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Simultaneous jobs drawn from the queue.
pub const CONCURRENCY: usize = 4;
/// Listing pages enqueued per crawl cycle (`?p=1` ..= `?p=PAGES`).
pub const PAGES: u32 = 10;
pub const CRAWL_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const MAX_ATTEMPTS: u32 = 3;
/// A job that reports no progress for this long is considered stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after navigation so client-side rendering can settle.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound on waiting for the results table. Kept below `STALL_TIMEOUT`.
pub const SELECTOR_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_STORE_PATH: &str = "data/hackernews.db";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_LISTING_URL: &str = "https://news.ycombinator.com/news";
const DEFAULT_PORT: u16 = 5000;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub store_path: PathBuf,
    pub data_dir: PathBuf,
    pub port: u16,
    pub listing_url: String,
    pub proxy_url: Option<String>,
    pub tui: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = ["PORT", "HTTP_PORT"]
            .into_iter()
            .find_map(|key| lookup(key).and_then(|raw| parse_port(&raw)))
            .unwrap_or(DEFAULT_PORT);

        let tui = match lookup("CRAWLER_TUI") {
            Some(raw) => parse_flag(&raw)
                .with_context(|| format!("CRAWLER_TUI must be a boolean, got {raw:?}"))?,
            None => false,
        };

        let listing_url = lookup("LISTING_URL").unwrap_or_else(|| DEFAULT_LISTING_URL.to_string());
        url::Url::parse(&listing_url).context("LISTING_URL must be an absolute URL")?;

        Ok(Self {
            store_path: lookup("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            data_dir: lookup("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            port,
            listing_url,
            proxy_url: lookup("PROXY_URL").filter(|p| !p.trim().is_empty()),
            tui,
        })
    }
}

/// Unparsable or zero ports are treated as unset so the next source applies.
fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse().ok().filter(|port| *port != 0)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.store_path, PathBuf::from("data/hackernews.db"));
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.listing_url, "https://news.ycombinator.com/news");
        assert!(config.proxy_url.is_none());
        assert!(!config.tui);
    }

    #[test]
    fn port_falls_back_to_http_port() {
        let config = config_from(&[("HTTP_PORT", "8081")]).unwrap();
        assert_eq!(config.port, 8081);

        let config = config_from(&[("PORT", "9000"), ("HTTP_PORT", "8081")]).unwrap();
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn unusable_port_falls_through() {
        let config = config_from(&[("PORT", "abc"), ("HTTP_PORT", "8081")]).unwrap();
        assert_eq!(config.port, 8081);

        let config = config_from(&[("PORT", "0"), ("HTTP_PORT", "8081")]).unwrap();
        assert_eq!(config.port, 8081);

        let config = config_from(&[("PORT", "70000"), ("HTTP_PORT", "")]).unwrap();
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn empty_proxy_is_ignored() {
        let config = config_from(&[("PROXY_URL", "  ")]).unwrap();
        assert!(config.proxy_url.is_none());
    }

    #[test]
    fn tui_flag_parsing() {
        assert!(config_from(&[("CRAWLER_TUI", "1")]).unwrap().tui);
        assert!(!config_from(&[("CRAWLER_TUI", "off")]).unwrap().tui);
        assert!(config_from(&[("CRAWLER_TUI", "maybe")]).is_err());
    }
}
