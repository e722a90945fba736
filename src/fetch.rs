//! Network access.
//!
//! A [`Fetcher`] performs exactly one request and reports what came back;
//! it knows nothing about backoff or admission. Callers lease the domain
//! from the resilience engine first and classify the response afterwards.
//!
//! - [`HttpFetcher`]: one long-lived `reqwest` client shaped per request
//!   by a [`RequestProfile`]
//! - `ChromiumFetcher` (feature `browser`): renders JavaScript-gated pages

use crate::errors::FetchError;
use crate::resilience::RequestProfile;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// What a single request returned.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
    /// URL after redirects.
    pub final_url: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, profile: &RequestProfile) -> Result<FetchedPage, FetchError>;
}

/// Plain HTTP fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client, timeout })
    }
}

fn profile_headers(profile: &RequestProfile) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in &profile.headers {
        if let (Ok(k), Ok(v)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) {
            headers.insert(k, v);
        }
    }
    if let Ok(ua) = HeaderValue::from_str(&profile.user_agent) {
        headers.insert(USER_AGENT, ua);
    }
    if let Some(referer) = profile.referer.as_deref() {
        if let Ok(referer) = HeaderValue::from_str(referer) {
            headers.insert(REFERER, referer);
        }
    }
    headers
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch(&self, url: &str, profile: &RequestProfile) -> Result<FetchedPage, FetchError> {
        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .headers(profile_headers(profile))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        let elapsed = t0.elapsed();
        debug!(status, bytes = body.len(), elapsed_ms = elapsed.as_millis() as u64, "Fetched");
        Ok(FetchedPage {
            status,
            body,
            final_url,
            elapsed,
        })
    }
}

impl HttpFetcher {
    fn map_error(&self, e: reqwest::Error) -> FetchError {
        match FetchError::from(e) {
            FetchError::Timeout(_) => FetchError::Timeout(self.timeout),
            other => other,
        }
    }
}

#[cfg(feature = "browser")]
pub use browser::ChromiumFetcher;

#[cfg(feature = "browser")]
mod browser {
    //! Headless Chromium rendering for JavaScript-gated pages.

    use super::{FetchedPage, Fetcher};
    use crate::errors::FetchError;
    use crate::resilience::RequestProfile;
    use async_trait::async_trait;
    use chromiumoxide::{Browser, BrowserConfig};
    use futures::StreamExt;
    use std::time::{Duration, Instant};
    use tokio::sync::OnceCell;
    use tracing::{info, instrument};

    /// Renders pages in one shared browser, launched on first use.
    pub struct ChromiumFetcher {
        browser: OnceCell<Browser>,
        timeout: Duration,
    }

    impl ChromiumFetcher {
        pub fn new(timeout: Duration) -> Self {
            Self {
                browser: OnceCell::new(),
                timeout,
            }
        }

        async fn browser(&self) -> Result<&Browser, FetchError> {
            self.browser
                .get_or_try_init(|| async {
                    let config = BrowserConfig::builder()
                        .no_sandbox()
                        .request_timeout(self.timeout)
                        .arg("--disable-gpu")
                        .arg("--disable-dev-shm-usage")
                        .build()
                        .map_err(|e| FetchError::Browser(e.to_string()))?;
                    let (browser, mut handler) = Browser::launch(config)
                        .await
                        .map_err(|e| FetchError::Browser(e.to_string()))?;
                    tokio::spawn(async move {
                        while let Some(event) = handler.next().await {
                            if event.is_err() {
                                break;
                            }
                        }
                    });
                    info!("Launched headless browser");
                    Ok(browser)
                })
                .await
        }
    }

    #[async_trait]
    impl Fetcher for ChromiumFetcher {
        #[instrument(level = "debug", skip_all, fields(%url))]
        async fn fetch(&self, url: &str, profile: &RequestProfile) -> Result<FetchedPage, FetchError> {
            let t0 = Instant::now();
            let render = async {
                let browser = self.browser().await?;
                let page = browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| FetchError::Browser(e.to_string()))?;
                page.set_user_agent(profile.user_agent.as_str())
                    .await
                    .map_err(|e| FetchError::Browser(e.to_string()))?;
                page.goto(url)
                    .await
                    .map_err(|e| FetchError::Browser(e.to_string()))?;
                let body = page
                    .content()
                    .await
                    .map_err(|e| FetchError::Browser(e.to_string()))?;
                let final_url = page
                    .url()
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| url.to_string());
                let _ = page.close().await;
                Ok::<_, FetchError>((body, final_url))
            };
            let (body, final_url) = tokio::time::timeout(self.timeout, render)
                .await
                .map_err(|_| FetchError::Timeout(self.timeout))??;
            // The DevTools navigation API does not surface the status code;
            // the classifier still inspects the rendered body for challenges.
            Ok(FetchedPage {
                status: 200,
                body,
                final_url,
                elapsed: t0.elapsed(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::fingerprint::RefererKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile() -> RequestProfile {
        RequestProfile {
            user_agent: "Mozilla/5.0 (test)".into(),
            headers: vec![("Accept-Language".into(), "en-GB,en;q=0.9".into())],
            referer: Some("https://www.google.com/".into()),
            referer_kind: RefererKind::SearchEngine,
            user_agent_index: 0,
        }
    }

    #[tokio::test]
    async fn test_http_fetcher_sends_profile_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/story"))
            .and(header("user-agent", "Mozilla/5.0 (test)"))
            .and(header("referer", "https://www.google.com/"))
            .and(header("accept-language", "en-GB,en;q=0.9"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let page = fetcher
            .fetch(&format!("{}/story", server.uri()), &profile())
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_http_fetcher_reports_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let page = fetcher
            .fetch(&format!("{}/missing", server.uri()), &profile())
            .await
            .unwrap();
        assert_eq!(page.status, 404);
    }

    #[tokio::test]
    async fn test_http_fetcher_times_out_as_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_millis(200)).unwrap();
        let err = fetcher
            .fetch(&format!("{}/slow", server.uri()), &profile())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(d) if d == Duration::from_millis(200)));
    }
}
