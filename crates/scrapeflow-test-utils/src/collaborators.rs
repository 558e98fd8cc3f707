use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;

use scrapeflow_core::config::{BrowserConfig, ParseConfig};
use scrapeflow_core::error::{Result, ScrapeError};
use scrapeflow_core::traits::{ContentParser, Fetcher, ImageDescriber, LlmClient, RateLimiter};
use scrapeflow_core::types::*;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// One scripted fetch attempt.
#[derive(Debug, Clone)]
pub enum FetchStep {
    Content(RawContent),
    Transient(String),
    Unreachable(String),
}

/// Fetcher serving registered pages, with optional per-locator scripts that
/// are consumed before the page is served.
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: HashMap<String, RawContent>,
    scripts: Mutex<HashMap<String, VecDeque<FetchStep>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, locator: &str, kind: ContentKind, body: &str) -> Self {
        self.pages.insert(
            locator.to_string(),
            RawContent::new(locator, kind, body.as_bytes().to_vec()),
        );
        self
    }

    pub fn with_html(self, locator: &str, html: &str) -> Self {
        self.with_page(locator, ContentKind::Html, html)
    }

    pub fn with_text(self, locator: &str, text: &str) -> Self {
        self.with_page(locator, ContentKind::Text, text)
    }

    /// Fail `count` times with a transient error before serving the page.
    pub fn with_transient_failures(self, locator: &str, count: usize) -> Self {
        {
            let mut scripts = lock(&self.scripts);
            let queue = scripts.entry(locator.to_string()).or_default();
            for i in 0..count {
                queue.push_back(FetchStep::Transient(format!("connection reset #{}", i + 1)));
            }
        }
        self
    }

    pub fn with_step(self, locator: &str, step: FetchStep) -> Self {
        lock(&self.scripts)
            .entry(locator.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, locator: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == locator).count()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        _browser: &'a BrowserConfig,
    ) -> BoxFuture<'a, Result<RawContent>> {
        Box::pin(async move {
            lock(&self.calls).push(locator.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let step = lock(&self.scripts)
                .get_mut(locator)
                .and_then(|queue| queue.pop_front());
            match step {
                Some(FetchStep::Content(raw)) => Ok(raw),
                Some(FetchStep::Transient(msg)) => Err(ScrapeError::transient("fetch", msg)),
                Some(FetchStep::Unreachable(msg)) => Err(ScrapeError::UnreachableSource(msg)),
                None => self
                    .pages
                    .get(locator)
                    .cloned()
                    .ok_or_else(|| ScrapeError::UnreachableSource(locator.to_string())),
            }
        })
    }
}

/// Parser returning the body text unchanged; URLs are never harvested.
#[derive(Debug, Default, Clone)]
pub struct PlainParser {
    warning: Option<String>,
}

impl PlainParser {
    /// A parser that reports every document as only partially extracted.
    pub fn partial(warning: impl Into<String>) -> Self {
        Self {
            warning: Some(warning.into()),
        }
    }
}

impl ContentParser for PlainParser {
    fn parse(&self, raw: &RawContent, _options: &ParseConfig) -> Result<NormalizedContent> {
        if !raw.kind.is_textual() {
            return Err(ScrapeError::Parse(format!("cannot parse {}", raw.kind.as_str())));
        }
        Ok(NormalizedContent {
            text: raw.text(),
            links: vec![],
            images: vec![],
            warnings: self.warning.iter().cloned().collect(),
        })
    }
}

/// One scripted completion.
#[derive(Debug, Clone)]
pub enum LlmStep {
    Reply(String),
    Transient,
    Fatal(String),
}

/// LLM answering from a queue of steps, then from a fallback reply.
pub struct ScriptedLlm {
    steps: Mutex<VecDeque<LlmStep>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(steps: Vec<LlmStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: None,
            requests: Mutex::new(vec![]),
        }
    }

    /// Always answer with `reply`.
    pub fn replying(reply: impl Into<String>) -> Self {
        Self::new(vec![]).with_fallback(reply)
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            lock(&self.requests).push(request);
            let step = lock(&self.steps).pop_front();
            match step {
                Some(LlmStep::Reply(text)) => Ok(text),
                Some(LlmStep::Transient) => {
                    Err(ScrapeError::LlmRequest("HTTP 503 Service Unavailable".into()))
                }
                Some(LlmStep::Fatal(msg)) => Err(ScrapeError::LlmRequest(msg)),
                None => self
                    .fallback
                    .clone()
                    .ok_or_else(|| ScrapeError::LlmRequest("HTTP 400 script exhausted".into())),
            }
        })
    }
}

/// LLM that extracts `name $price` lines from the context into
/// `{"products": [{"name", "price"}]}`.
pub struct ProductLlm {
    line: Regex,
    fenced: bool,
    calls: Mutex<usize>,
}

impl ProductLlm {
    pub fn new() -> Self {
        Self {
            line: Regex::new(r"(?m)^(.+?)\s+\$(\d+(?:\.\d+)?)\s*$").expect("valid regex"),
            fenced: false,
            calls: Mutex::new(0),
        }
    }

    /// Wrap answers in a markdown code fence, as chatty models do.
    pub fn fenced(mut self) -> Self {
        self.fenced = true;
        self
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.calls)
    }
}

impl Default for ProductLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for ProductLlm {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            *lock(&self.calls) += 1;
            let products: Vec<serde_json::Value> = self
                .line
                .captures_iter(&request.context)
                .filter_map(|cap| {
                    let price: f64 = cap[2].parse().ok()?;
                    Some(serde_json::json!({ "name": cap[1].trim(), "price": price }))
                })
                .collect();
            let body = serde_json::json!({ "products": products }).to_string();
            if self.fenced {
                Ok(format!("Here you go:\n```json\n{}\n```", body))
            } else {
                Ok(body)
            }
        })
    }
}

/// Image describer with per-URL failure scripts.
#[derive(Default)]
pub struct ScriptedDescriber {
    empty: Vec<String>,
    transient: Mutex<HashMap<String, usize>>,
    fatal: Vec<String>,
    calls: Mutex<usize>,
}

impl ScriptedDescriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an empty description for `url`.
    pub fn with_empty(mut self, url: &str) -> Self {
        self.empty.push(url.to_string());
        self
    }

    /// Fail `count` times with a transient error for `url`.
    pub fn with_transient(self, url: &str, count: usize) -> Self {
        lock(&self.transient).insert(url.to_string(), count);
        self
    }

    pub fn with_fatal(mut self, url: &str) -> Self {
        self.fatal.push(url.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.calls)
    }
}

impl ImageDescriber for ScriptedDescriber {
    fn describe<'a>(&'a self, image: &'a ImageInput) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            *lock(&self.calls) += 1;
            let key = match image {
                ImageInput::Url(url) => url.clone(),
                ImageInput::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            };
            {
                let mut transient = lock(&self.transient);
                if let Some(remaining) = transient.get_mut(&key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(ScrapeError::transient("image_to_text", "model overloaded"));
                    }
                }
            }
            if self.fatal.contains(&key) {
                return Err(ScrapeError::ImageToText(format!("unsupported image {}", key)));
            }
            if self.empty.contains(&key) {
                return Ok(String::new());
            }
            Ok(format!("a picture of {}", key))
        })
    }
}

/// Limiter denying the first `deny` admissions, then granting everything.
pub struct ScriptedLimiter {
    deny: Mutex<usize>,
    retry_after: Duration,
    admits: Mutex<Vec<u32>>,
}

impl ScriptedLimiter {
    pub fn deny_first(deny: usize, retry_after: Duration) -> Self {
        Self {
            deny: Mutex::new(deny),
            retry_after,
            admits: Mutex::new(vec![]),
        }
    }

    pub fn grant_all() -> Self {
        Self::deny_first(0, Duration::ZERO)
    }

    /// Costs of every admission request, granted or not.
    pub fn admits(&self) -> Vec<u32> {
        lock(&self.admits).clone()
    }
}

impl RateLimiter for ScriptedLimiter {
    fn admit(&self, cost: u32) -> Admission {
        lock(&self.admits).push(cost);
        let mut deny = lock(&self.deny);
        if *deny > 0 {
            *deny -= 1;
            Admission::Denied {
                retry_after: self.retry_after,
            }
        } else {
            Admission::Granted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{expected_products, PRODUCT_PAGE};

    #[tokio::test]
    async fn test_scripted_fetcher_consumes_script_then_serves_page() {
        let fetcher = ScriptedFetcher::new()
            .with_html("a", "<p>a</p>")
            .with_transient_failures("a", 1);
        let browser = BrowserConfig::default();

        assert!(fetcher.fetch("a", &browser).await.unwrap_err().is_transient());
        assert_eq!(fetcher.fetch("a", &browser).await.unwrap().text(), "<p>a</p>");
        assert!(matches!(
            fetcher.fetch("b", &browser).await.unwrap_err(),
            ScrapeError::UnreachableSource(_)
        ));
        assert_eq!(fetcher.call_count("a"), 2);
    }

    #[tokio::test]
    async fn test_product_llm_reads_lines() {
        let llm = ProductLlm::new();
        let reply = llm
            .complete(CompletionRequest {
                prompt: "extract name and price".into(),
                context: "Acme\nWidget $9.99\nGadget Pro $24.50\nThingamajig $3.00\n".into(),
                schema: None,
                model: Default::default(),
            })
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value, expected_products());
        assert!(PRODUCT_PAGE.contains("Gadget Pro"));
    }
}
