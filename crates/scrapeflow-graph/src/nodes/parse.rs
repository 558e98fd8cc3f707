use tracing::{debug, warn};

use scrapeflow_core::config::ParseConfig;
use scrapeflow_core::error::{Result, ScrapeError};
use scrapeflow_core::types::{ContentKind, RawContent};

use super::{optional, require, NodeContext};
use crate::chunk::{effective_chunk_size, split_text_into_chunks};
use crate::graph::node::{Node, NodeRun, ParseNode};
use crate::graph::state::{StateContainer, StateDelta, StateValue};

pub(super) fn run(
    node: &Node,
    params: &ParseNode,
    inputs: &[String],
    state: &StateContainer,
    ctx: &NodeContext<'_>,
) -> Result<NodeRun> {
    let parser = require(&ctx.collaborators.parser, "parser")?;
    let key = inputs.first().map(String::as_str).unwrap_or("doc");
    let body = match state.get(key) {
        Some(StateValue::Blob(bytes)) => bytes.clone(),
        Some(StateValue::Error(marker)) => {
            return Err(ScrapeError::Parse(format!(
                "'{}' holds an error from {}: {}",
                key, marker.origin, marker.message
            )))
        }
        Some(value) => value.to_text().into_bytes(),
        None => return Err(ScrapeError::Parse(format!("'{}' is missing", key))),
    };

    let locator = optional(node, state, 0)
        .and_then(StateValue::as_str)
        .unwrap_or("inline");
    let kind = optional(node, state, 1)
        .and_then(StateValue::as_str)
        .and_then(|k| k.parse().ok())
        .unwrap_or(ContentKind::Unknown);

    let options = ParseConfig {
        chunk_size: params.chunk_size.unwrap_or(ctx.config.parse.chunk_size),
        parse_html: params.parse_html.unwrap_or(ctx.config.parse.parse_html),
        parse_urls: params.parse_urls.unwrap_or(ctx.config.parse.parse_urls),
    };

    let raw = RawContent::new(locator, kind, body);
    let parsed = parser.parse(&raw, &options)?;

    let html_converted = options.parse_html && kind == ContentKind::Html;
    let budget = effective_chunk_size(options.chunk_size, html_converted);
    let chunks = split_text_into_chunks(&parsed.text, budget);

    debug!(
        node = %node.name,
        chunks = chunks.len(),
        links = parsed.links.len(),
        images = parsed.images.len(),
        budget,
        "Parsed document"
    );

    let empty = chunks.is_empty();
    let delta = StateDelta::new()
        .with(node.output(0), chunks)
        .with(node.output(1), parsed.links)
        .with(node.output(2), parsed.images);

    if !parsed.warnings.is_empty() {
        let message = parsed.warnings.join("; ");
        warn!(node = %node.name, warnings = %message, "Partial extraction");
        return Ok(NodeRun::soft(delta, message));
    }
    if empty {
        return Ok(NodeRun::soft(delta, format!("no text extracted from {}", locator)));
    }
    Ok(NodeRun::success(delta))
}
