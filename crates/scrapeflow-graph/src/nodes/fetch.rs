use tracing::{debug, info};

use scrapeflow_core::error::{Result, ScrapeError};

use super::{require, NodeContext};
use crate::graph::node::{FetchNode, Node, NodeRun};
use crate::graph::state::{StateContainer, StateDelta, StateValue};

fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

pub(super) async fn run(
    node: &Node,
    params: &FetchNode,
    inputs: &[String],
    state: &StateContainer,
    ctx: &NodeContext<'_>,
) -> Result<NodeRun> {
    let key = inputs.first().map(String::as_str).unwrap_or("source");
    let locator = state
        .get_str(key)
        .ok_or_else(|| ScrapeError::UnreachableSource(format!("'{}' is not a text locator", key)))?;
    let fetcher = require(&ctx.collaborators.fetcher, "fetcher")?;

    if params.respect_robots && is_remote(locator) {
        if let Some(ref robots) = ctx.collaborators.robots {
            if !robots.allowed(locator, &ctx.config.browser.user_agent).await {
                return Err(ScrapeError::Disallowed(locator.to_string()));
            }
        }
    }

    ctx.acquire(1).await;
    debug!(node = %node.name, locator, "Fetching source");
    let raw = fetcher.fetch(locator, &ctx.config.browser).await?;

    let size = raw.body.len();
    let doc = if raw.kind.is_textual() {
        StateValue::Text(raw.text())
    } else {
        StateValue::Blob(raw.body)
    };
    let delta = StateDelta::new()
        .with(node.output(0), doc)
        .with(node.output(1), raw.kind.as_str());

    info!(node = %node.name, locator, kind = raw.kind.as_str(), bytes = size, "Fetched source");

    if size == 0 {
        Ok(NodeRun::soft(delta, format!("{} returned an empty document", locator)))
    } else {
        Ok(NodeRun::success(delta))
    }
}
