use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use scrapeflow_core::config::BrowserConfig;
use scrapeflow_core::error::{Result, ScrapeError};
use scrapeflow_core::traits::Fetcher;
use scrapeflow_core::types::{ContentKind, RawContent};

/// Fetches `http://` and `https://` locators with a plain HTTP client.
///
/// No browser is driven: `browser.headless` is ignored, `timeout_secs` and
/// `user_agent` apply to every request.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ScrapeError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn classify_request_error(locator: &str, e: reqwest::Error) -> ScrapeError {
    if e.is_builder() {
        ScrapeError::UnreachableSource(format!("{}: {}", locator, e))
    } else {
        ScrapeError::transient("fetch", format!("{}: {}", locator, e))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        browser: &'a BrowserConfig,
    ) -> BoxFuture<'a, Result<RawContent>> {
        Box::pin(async move {
            let url = reqwest::Url::parse(locator)
                .map_err(|e| ScrapeError::UnreachableSource(format!("{}: {}", locator, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ScrapeError::UnreachableSource(format!(
                    "{}: unsupported scheme '{}'",
                    locator,
                    url.scheme()
                )));
            }

            debug!(url = %url, "Fetching URL");

            let resp = self
                .client
                .get(url.clone())
                .timeout(Duration::from_secs(browser.timeout_secs))
                .header(reqwest::header::USER_AGENT, browser.user_agent.as_str())
                .send()
                .await
                .map_err(|e| classify_request_error(locator, e))?;

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ScrapeError::transient(
                    "fetch",
                    format!("{}: HTTP {}", locator, status.as_u16()),
                ));
            }
            if !status.is_success() {
                return Err(ScrapeError::UnreachableSource(format!(
                    "{}: HTTP {} {}",
                    locator,
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let mut kind = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ContentKind::from_content_type)
                .unwrap_or(ContentKind::Unknown);
            if kind == ContentKind::Unknown {
                kind = url
                    .path()
                    .rsplit_once('.')
                    .map(|(_, ext)| ContentKind::from_extension(ext))
                    .unwrap_or(ContentKind::Unknown);
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| ScrapeError::transient("fetch", format!("{}: {}", locator, e)))?;

            Ok(RawContent::new(locator, kind, body.to_vec()))
        })
    }
}

/// Reads local files; accepts plain paths and `file://` locators.
#[derive(Debug, Default, Clone)]
pub struct FileFetcher;

impl Fetcher for FileFetcher {
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        _browser: &'a BrowserConfig,
    ) -> BoxFuture<'a, Result<RawContent>> {
        Box::pin(async move {
            let path = PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator));
            debug!(path = %path.display(), "Reading local source");

            let body = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound
                | std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::InvalidInput => {
                    ScrapeError::UnreachableSource(format!("{}: {}", path.display(), e))
                }
                _ => ScrapeError::transient("fetch", format!("{}: {}", path.display(), e)),
            })?;

            let kind = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(ContentKind::from_extension)
                .unwrap_or(ContentKind::Unknown);

            Ok(RawContent::new(locator, kind, body))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Http,
    File,
    Inline,
}

fn route(locator: &str) -> Route {
    let trimmed = locator.trim_start();
    if trimmed.starts_with('<') {
        Route::Inline
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Route::Http
    } else {
        Route::File
    }
}

/// Dispatches a locator to the HTTP or file fetcher, and treats locators
/// that start with `<` as inline HTML documents.
pub struct RoutingFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl RoutingFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new()?,
            file: FileFetcher,
        })
    }
}

impl Fetcher for RoutingFetcher {
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        browser: &'a BrowserConfig,
    ) -> BoxFuture<'a, Result<RawContent>> {
        match route(locator) {
            Route::Http => self.http.fetch(locator, browser),
            Route::File => self.file.fetch(locator, browser),
            Route::Inline => Box::pin(async move {
                Ok(RawContent::new("inline", ContentKind::Html, locator.as_bytes().to_vec()))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_route() {
        assert_eq!(route("https://example.com"), Route::Http);
        assert_eq!(route("http://example.com/a.html"), Route::Http);
        assert_eq!(route("  <html><body>hi</body></html>"), Route::Inline);
        assert_eq!(route("./pages/index.html"), Route::File);
        assert_eq!(route("file:///tmp/page.html"), Route::File);
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_and_classifies() {
        let mut tmp = tempfile::Builder::new().suffix(".html").tempfile().unwrap();
        tmp.write_all(b"<p>hello</p>").unwrap();
        let locator = tmp.path().display().to_string();

        let raw = FileFetcher
            .fetch(&locator, &BrowserConfig::default())
            .await
            .unwrap();
        assert_eq!(raw.kind, ContentKind::Html);
        assert_eq!(raw.text(), "<p>hello</p>");
    }

    #[tokio::test]
    async fn test_missing_file_is_unreachable() {
        let err = FileFetcher
            .fetch("/definitely/not/here.html", &BrowserConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::UnreachableSource(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_inline_html() {
        let fetcher = RoutingFetcher::new().unwrap();
        let raw = fetcher
            .fetch("<html><body>inline</body></html>", &BrowserConfig::default())
            .await
            .unwrap();
        assert_eq!(raw.kind, ContentKind::Html);
        assert!(raw.text().contains("inline"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_unreachable() {
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch("http://", &BrowserConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::UnreachableSource(_)));
    }
}
