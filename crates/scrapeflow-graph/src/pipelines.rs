//! Prebuilt pipelines.

use scrapeflow_core::config::AppConfig;
use scrapeflow_core::error::GraphError;

use crate::graph::edge::Edge;
use crate::graph::node::{Node, NodeKind, ParseNode, RetryPolicy};
use crate::graph::topology::{Graph, GraphBuilder};

/// Attach the configured retry policy to a node that calls a collaborator.
fn retrying(node: Node, config: &AppConfig) -> Node {
    if config.retry.max_retries > 0 {
        node.with_retry(RetryPolicy::from(&config.retry))
    } else {
        node
    }
}

fn fetch_node(config: &AppConfig) -> Node {
    retrying(Node::fetch("fetch"), config)
}

fn generate_answer_node(config: &AppConfig) -> Node {
    retrying(Node::generate_answer("generate_answer"), config)
}

fn smart_builder(config: &AppConfig) -> GraphBuilder {
    Graph::builder()
        .node(fetch_node(config))
        .node(Node::parse("parse"))
        .node(generate_answer_node(config))
        .edge(Edge::always("fetch", "parse"))
        .edge(Edge::always("parse", "generate_answer"))
        .initial_keys(["source", "user_prompt"])
}

/// fetch → parse. No model involved.
pub fn fetch_parse(config: &AppConfig) -> Result<Graph, GraphError> {
    Graph::builder()
        .node(fetch_node(config))
        .node(Node::parse("parse"))
        .edge(Edge::always("fetch", "parse"))
        .initial_keys(["source"])
        .build()
}

/// fetch → parse → generate_answer.
pub fn smart_scraper(config: &AppConfig) -> Result<Graph, GraphError> {
    smart_builder(config).build()
}

/// fetch → parse (with URL harvesting) → image_to_text → generate_answer.
pub fn omni_scraper(config: &AppConfig) -> Result<Graph, GraphError> {
    let parse = Node::new(
        "parse",
        NodeKind::Parse(ParseNode {
            parse_urls: Some(true),
            ..ParseNode::default()
        }),
    );
    Graph::builder()
        .node(fetch_node(config))
        .node(parse)
        .node(retrying(Node::image_to_text("image_to_text"), config))
        .node(generate_answer_node(config))
        .edge(Edge::always("fetch", "parse"))
        .edge(Edge::always("parse", "image_to_text"))
        .edge(Edge::always("image_to_text", "generate_answer"))
        .initial_keys(["source", "user_prompt"])
        .build()
}

/// The smart scraper per source, merged across sources.
pub fn multi_scraper(config: &AppConfig) -> Result<Graph, GraphError> {
    smart_builder(config).merge(Node::merge("merge")).build()
}

/// The smart scraper behind a branch that skips straight to `done` when
/// the state already holds an `answer`.
pub fn cached_answer_scraper(config: &AppConfig) -> Result<Graph, GraphError> {
    Graph::builder()
        .node(Node::conditional("check_cache"))
        .node(fetch_node(config))
        .node(Node::parse("parse"))
        .node(generate_answer_node(config))
        .node(Node::conditional("done"))
        .edge(Edge::present("check_cache", "done", "answer"))
        .edge(Edge::absent("check_cache", "fetch", "answer"))
        .edge(Edge::always("fetch", "parse"))
        .edge(Edge::always("parse", "generate_answer"))
        .edge(Edge::always("generate_answer", "done"))
        .entry("check_cache")
        .initial_keys(["source", "user_prompt"])
        .build()
}
