use futures::future::BoxFuture;

use crate::config::{BrowserConfig, ParseConfig};
use crate::error::Result;
use crate::types::*;

/// Fetch collaborator: turns a source locator into raw content.
///
/// Implementations report network blips as `ScrapeError::Transient` and
/// locators that can never resolve as `ScrapeError::UnreachableSource`.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        locator: &'a str,
        browser: &'a BrowserConfig,
    ) -> BoxFuture<'a, Result<RawContent>>;
}

/// Parse collaborator: normalizes raw content into text plus harvested URLs.
pub trait ContentParser: Send + Sync + 'static {
    fn parse(&self, raw: &RawContent, options: &ParseConfig) -> Result<NormalizedContent>;
}

/// LLM collaborator: one completion per request, raw model text back.
///
/// Implementations must honor `request.schema` when it is set.
pub trait LlmClient: Send + Sync + 'static {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;
}

/// Image-to-text collaborator.
pub trait ImageDescriber: Send + Sync + 'static {
    fn describe<'a>(&'a self, image: &'a ImageInput) -> BoxFuture<'a, Result<String>>;
}

/// Rate limiter / token accounting gate.
///
/// Shared process-wide; implementations serialize access internally.
pub trait RateLimiter: Send + Sync + 'static {
    fn admit(&self, cost: u32) -> Admission;
}

/// Robots-check collaborator consulted before fetching remote sources.
pub trait RobotsPolicy: Send + Sync + 'static {
    fn allowed<'a>(&'a self, locator: &'a str, user_agent: &'a str) -> BoxFuture<'a, bool>;
}
