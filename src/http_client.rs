use async_trait::async_trait;
use reqwest::{Client, Proxy};
use std::time::Duration;
use url::Url;

use crate::parser::{self, ExtractError};
use crate::rate_limiter::RateLimiter;

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; hncrawler/0.1)";

/// Hosts refused outright when a session has the content blocker enabled.
const BLOCKED_HOSTS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "google-analytics.com",
    "googletagmanager.com",
    "adservice.google.com",
    "scorecardresearch.com",
    "quantserve.com",
];

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    HttpError(u16),
    #[error("Invalid content type: {0}")]
    InvalidContentType(String),
    #[error("Response too large: {0} bytes")]
    TooLarge(u64),
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Request to {0} refused by the content blocker")]
    BlockedRequest(String),
    #[error("Invalid proxy {0}")]
    Proxy(String),
    #[error("Timed out after {timeout:?} waiting for {selector:?}")]
    SelectorTimeout { selector: String, timeout: Duration },
    #[error(transparent)]
    Selector(#[from] ExtractError),
    #[error("No document loaded")]
    NotLoaded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Share the engine's pooled client instead of building a fresh one.
    pub reuse: bool,
}

/// Capability set applied to a session before it is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub proxy: Option<String>,
    pub blocker: bool,
    pub images: bool,
    pub stylesheets: bool,
    pub javascript: bool,
}

/// Page-automation engine: hands out sessions bound to one target URL.
#[async_trait]
pub trait Browser: Send + Sync {
    type Session: PageSession;

    async fn open_session(&self, url: &str, options: SessionOptions) -> Result<Self::Session, FetchError>;
}

#[async_trait]
pub trait PageSession: Send {
    async fn configure(&mut self, capabilities: &Capabilities) -> Result<(), FetchError>;

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), FetchError>;

    async fn content(&self) -> Result<String, FetchError>;

    async fn close(self) -> Result<(), FetchError>;
}

/// Document-level engine over `reqwest`. Nothing is rendered, so the
/// image/stylesheet/script capabilities are accepted and recorded only.
pub struct HttpBrowser {
    client: Client,
    rate_limiter: RateLimiter,
    poll_interval: Duration,
}

impl HttpBrowser {
    pub fn new(rate_limiter: RateLimiter) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(None)?,
            rate_limiter,
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    type Session = HttpSession;

    async fn open_session(&self, url: &str, options: SessionOptions) -> Result<HttpSession, FetchError> {
        let target = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let client = if options.reuse {
            self.client.clone()
        } else {
            build_client(None)?
        };

        let mut session = HttpSession {
            url: target,
            client,
            rate_limiter: self.rate_limiter.clone(),
            poll_interval: self.poll_interval,
            capabilities: Capabilities::default(),
            document: None,
        };
        session.navigate().await?;
        Ok(session)
    }
}

pub struct HttpSession {
    url: Url,
    client: Client,
    rate_limiter: RateLimiter,
    poll_interval: Duration,
    capabilities: Capabilities,
    document: Option<String>,
}

impl HttpSession {
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn navigate(&mut self) -> Result<(), FetchError> {
        if self.capabilities.blocker && is_blocked_host(&self.url) {
            return Err(FetchError::BlockedRequest(self.url.to_string()));
        }

        self.rate_limiter.wait_if_needed(self.url.as_str()).await;
        let body = fetch(&self.client, self.url.as_str()).await?;
        self.document = Some(body);
        Ok(())
    }

    /// Reloads until `selector` is present; the caller bounds the wait.
    async fn poll_for(&mut self, selector: &str) -> Result<(), FetchError> {
        loop {
            if self.has_selector(selector)? {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
            self.navigate().await?;
        }
    }

    fn has_selector(&self, selector: &str) -> Result<bool, FetchError> {
        match &self.document {
            Some(document) => Ok(parser::contains_selector(document, selector)?),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PageSession for HttpSession {
    async fn configure(&mut self, capabilities: &Capabilities) -> Result<(), FetchError> {
        self.client = build_client(capabilities.proxy.as_deref())?;
        self.capabilities = capabilities.clone();
        // Reload so the document is served through the configured client.
        self.navigate().await
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<(), FetchError> {
        match tokio::time::timeout(timeout, self.poll_for(selector)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::SelectorTimeout {
                selector: selector.to_string(),
                timeout,
            }),
        }
    }

    async fn content(&self) -> Result<String, FetchError> {
        self.document.clone().ok_or(FetchError::NotLoaded)
    }

    async fn close(self) -> Result<(), FetchError> {
        tracing::debug!(url = %self.url, "session closed");
        Ok(())
    }
}

fn build_client(proxy: Option<&str>) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(10);

    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy).map_err(|_| FetchError::Proxy(proxy.to_string()))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

fn is_blocked_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    BLOCKED_HOSTS
        .iter()
        .any(|blocked| host == *blocked || host.ends_with(&format!(".{blocked}")))
}

async fn fetch(client: &Client, url: &str) -> Result<String, FetchError> {
    let response = client.get(url).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpError(status.as_u16()));
    }

    if let Some(content_type) = response.headers().get("content-type") {
        let content_type_str = content_type.to_str().unwrap_or("");
        if !content_type_str.contains("text/html") {
            return Err(FetchError::InvalidContentType(content_type_str.to_string()));
        }
    }

    if let Some(content_length) = response.content_length()
        && content_length > MAX_RESPONSE_SIZE as u64
    {
        return Err(FetchError::TooLarge(content_length));
    }

    let body = response.text().await?;
    if body.len() > MAX_RESPONSE_SIZE {
        return Err(FetchError::TooLarge(body.len() as u64));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::Html;
    use axum::routing::get;
    use axum::Router;

    const FIXTURE: &str = include_str!("../tests/fixtures/news_page.html");

    async fn serve_pages() -> String {
        let app = Router::new()
            .route("/news", get(|| async { Html(FIXTURE) }))
            .route("/loading", get(|| async { Html("<html><body><p>loading</p></body></html>") }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/feed.json", get(|| async { axum::Json(vec![1, 2, 3]) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn browser() -> HttpBrowser {
        HttpBrowser::new(RateLimiter::with_delay(Duration::ZERO))
            .unwrap()
            .with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let base = serve_pages().await;
        let browser = browser();

        let mut session = browser
            .open_session(&format!("{base}/news?p=1"), SessionOptions { reuse: false })
            .await
            .unwrap();
        let capabilities = Capabilities {
            blocker: true,
            images: true,
            stylesheets: true,
            javascript: true,
            ..Capabilities::default()
        };
        session.configure(&capabilities).await.unwrap();
        assert_eq!(session.capabilities(), &capabilities);

        session
            .wait_for_selector("table", Duration::from_secs(2))
            .await
            .unwrap();
        let content = session.content().await.unwrap();
        assert!(content.contains("athing"));

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn selector_wait_is_bounded() {
        let base = serve_pages().await;
        let mut session = browser()
            .open_session(&format!("{base}/loading"), SessionOptions::default())
            .await
            .unwrap();

        let err = session
            .wait_for_selector("table", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SelectorTimeout { .. }));
    }

    #[tokio::test]
    async fn rejects_error_status_and_non_html() {
        let base = serve_pages().await;
        let browser = browser();

        let err = browser
            .open_session(&format!("{base}/missing"), SessionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::HttpError(404)));

        let err = browser
            .open_session(&format!("{base}/feed.json"), SessionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::InvalidContentType(_)));
    }

    #[tokio::test]
    async fn invalid_proxy_is_reported() {
        let base = serve_pages().await;
        let mut session = browser()
            .open_session(&format!("{base}/news"), SessionOptions::default())
            .await
            .unwrap();

        let err = session
            .configure(&Capabilities {
                proxy: Some("http://proxy.example:notaport".to_string()),
                ..Capabilities::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Proxy(_)));
    }

    #[test]
    fn blocker_matches_tracker_subdomains() {
        assert!(is_blocked_host(&Url::parse("https://stats.g.doubleclick.net/x").unwrap()));
        assert!(is_blocked_host(&Url::parse("https://googletagmanager.com/gtm.js").unwrap()));
        assert!(!is_blocked_host(&Url::parse("https://news.ycombinator.com/news").unwrap()));
        assert!(!is_blocked_host(&Url::parse("https://notdoubleclick.net/").unwrap()));
    }
}
