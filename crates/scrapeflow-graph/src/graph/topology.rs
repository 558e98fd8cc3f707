use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use scrapeflow_core::error::{GraphError, Result, ScrapeError};

use super::edge::{parse_condition, Edge, EdgeCondition};
use super::node::{Node, NodeKind};
use super::state::StateContainer;

/// Traversal counts of bounded loop edges, keyed by edge index.
pub type LoopCounts = HashMap<usize, u32>;

/// Validated, immutable pipeline topology.
///
/// Built only through [`GraphBuilder`]; share it with `Arc<Graph>`.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// node name -> indices into `edges`, in declared order.
    outgoing: HashMap<String, Vec<usize>>,
    entry: String,
    initial_keys: BTreeSet<String>,
    merge: Option<Node>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Per-source nodes in declared order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn initial_keys(&self) -> impl Iterator<Item = &str> {
        self.initial_keys.iter().map(String::as_str)
    }

    /// The batch-level merge node, if configured.
    pub fn merge_node(&self) -> Option<&Node> {
        self.merge.as_ref()
    }

    /// Outgoing edges of `node`, in declared order.
    pub fn outgoing(&self, node: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Pick the next node after `current`: the target of the first
    /// outgoing edge whose predicate holds. Bounded loop edges that have
    /// used up their iterations are skipped. `None` means terminal.
    pub fn resolve(
        &self,
        current: &str,
        state: &StateContainer,
        loops: &mut LoopCounts,
    ) -> Option<&str> {
        let indices = self.outgoing.get(current)?;
        for &i in indices {
            let edge = &self.edges[i];
            if let Some(max) = edge.max_iterations {
                if loops.get(&i).copied().unwrap_or(0) >= max {
                    continue;
                }
            }
            if edge.matches(state) {
                if edge.is_bounded_loop() {
                    *loops.entry(i).or_insert(0) += 1;
                }
                return Some(&edge.to);
            }
        }
        None
    }

    /// Serializable description of this graph.
    pub fn to_definition(&self) -> GraphDefinition {
        GraphDefinition {
            entry: Some(self.entry.clone()),
            initial_keys: self.initial_keys.iter().cloned().collect(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            merge: self.merge.clone(),
        }
    }
}

/// Declarative graph description, e.g. loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Defaults to the first node.
    #[serde(default)]
    pub entry: Option<String>,
    /// Keys the caller seeds into every state container.
    #[serde(default)]
    pub initial_keys: Vec<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub merge: Option<Node>,
}

impl GraphDefinition {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ScrapeError::Config(e.to_string()))
    }

    /// Validate and build the graph.
    pub fn build(self) -> std::result::Result<Graph, GraphError> {
        let mut builder = GraphBuilder::new().initial_keys(self.initial_keys);
        if let Some(entry) = self.entry {
            builder = builder.entry(entry);
        }
        for node in self.nodes {
            builder = builder.node(node);
        }
        for edge in self.edges {
            builder = builder.edge(edge);
        }
        if let Some(merge) = self.merge {
            builder = builder.merge(merge);
        }
        builder.build()
    }
}

/// Collects nodes and edges, then validates them into a [`Graph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    initial_keys: Vec<String>,
    merge: Option<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Set the entry node. Defaults to the first node added.
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn initial_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Set the batch-level merge node.
    pub fn merge(mut self, node: Node) -> Self {
        self.merge = Some(node);
        self
    }

    /// Validate the topology.
    ///
    /// Checks, in order: non-empty, unique names, entry exists, edge
    /// endpoints and conditions, merge placement, entry has no incoming
    /// edges except bounded loops, reachability, no unbounded cycles, and
    /// input satisfiability.
    pub fn build(self) -> std::result::Result<Graph, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }
        if let Some(ref merge) = self.merge {
            if index.contains_key(&merge.name) {
                return Err(GraphError::DuplicateNode(merge.name.clone()));
            }
        }

        let entry = match self.entry {
            Some(entry) => entry,
            None => self.nodes[0].name.clone(),
        };
        if !index.contains_key(&entry) {
            return Err(GraphError::MissingEntry(entry));
        }

        for edge in &self.edges {
            check_edge(edge, &index, self.merge.as_ref())?;
        }

        check_merge_placement(&self.nodes, self.merge.as_ref())?;

        if let Some(edge) = self
            .edges
            .iter()
            .find(|e| e.to == entry && !e.is_bounded_loop())
        {
            return Err(GraphError::EntryHasIncoming {
                entry,
                from: edge.from.clone(),
            });
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            outgoing.entry(edge.from.clone()).or_default().push(i);
        }

        check_reachability(&self.nodes, &self.edges, &entry)?;
        check_cycles(&self.nodes, &self.edges)?;

        let initial_keys: BTreeSet<String> = self.initial_keys.into_iter().collect();
        check_inputs(&self.nodes, &self.edges, &index, &entry, &initial_keys)?;
        if let Some(ref merge) = self.merge {
            let batch_keys: BTreeSet<String> = initial_keys
                .iter()
                .cloned()
                .chain(["results".to_string()])
                .collect();
            if !merge.inputs.is_satisfied_by(&|k| batch_keys.contains(k)) {
                return Err(GraphError::UnsatisfiedInput {
                    node: merge.name.clone(),
                    requirement: merge.inputs.to_string(),
                });
            }
        }

        debug!(
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            entry = %entry,
            "Graph validated"
        );

        Ok(Graph {
            nodes: self.nodes,
            index,
            edges: self.edges,
            outgoing,
            entry,
            initial_keys,
            merge: self.merge,
        })
    }
}

fn check_edge(
    edge: &Edge,
    index: &HashMap<String, usize>,
    merge: Option<&Node>,
) -> std::result::Result<(), GraphError> {
    for endpoint in [&edge.from, &edge.to] {
        if merge.is_some_and(|m| &m.name == endpoint) {
            return Err(GraphError::MisplacedMerge {
                node: endpoint.clone(),
                reason: "the batch merge node cannot be an edge endpoint".into(),
            });
        }
        if !index.contains_key(endpoint) {
            return Err(GraphError::UnknownEndpoint {
                from: edge.from.clone(),
                to: edge.to.clone(),
                missing: endpoint.clone(),
            });
        }
    }

    let invalid = |expr: &str| GraphError::InvalidCondition {
        from: edge.from.clone(),
        to: edge.to.clone(),
        expr: expr.to_string(),
    };
    match &edge.condition {
        EdgeCondition::Conditional { expr } if parse_condition(expr).is_none() => {
            return Err(invalid(expr));
        }
        EdgeCondition::Present { key } | EdgeCondition::Absent { key } if key.trim().is_empty() => {
            return Err(invalid(key));
        }
        _ => {}
    }

    if edge.max_iterations == Some(0) {
        return Err(GraphError::ZeroIterationLoop {
            from: edge.from.clone(),
            to: edge.to.clone(),
        });
    }
    Ok(())
}

fn check_merge_placement(
    nodes: &[Node],
    merge: Option<&Node>,
) -> std::result::Result<(), GraphError> {
    if let Some(node) = nodes.iter().find(|n| matches!(n.kind, NodeKind::Merge(_))) {
        return Err(GraphError::MisplacedMerge {
            node: node.name.clone(),
            reason: "merge nodes run once per batch and cannot be part of the per-source topology"
                .into(),
        });
    }
    if let Some(merge) = merge {
        if !matches!(merge.kind, NodeKind::Merge(_)) {
            return Err(GraphError::MisplacedMerge {
                node: merge.name.clone(),
                reason: format!("expected a merge node, found {}", merge.kind.as_str()),
            });
        }
    }
    Ok(())
}

/// BFS from entry over every edge.
fn check_reachability(
    nodes: &[Node],
    edges: &[Edge],
    entry: &str,
) -> std::result::Result<(), GraphError> {
    let mut seen: HashSet<&str> = HashSet::from([entry]);
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);
    while let Some(current) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.from == current) {
            if seen.insert(&edge.to) {
                queue.push_back(&edge.to);
            }
        }
    }

    let unreachable: Vec<String> = nodes
        .iter()
        .filter(|n| !seen.contains(n.name.as_str()))
        .map(|n| n.name.clone())
        .collect();
    if unreachable.is_empty() {
        Ok(())
    } else {
        Err(GraphError::Unreachable(unreachable))
    }
}

/// DFS cycle detection ignoring bounded loop edges.
fn check_cycles(nodes: &[Node], edges: &[Edge]) -> std::result::Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        edges: &'a [Edge],
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::InProgress);
        path.push(node);
        for edge in edges.iter().filter(|e| e.from == node && !e.is_bounded_loop()) {
            match marks.get(edge.to.as_str()).copied().unwrap_or(Mark::Unvisited) {
                Mark::InProgress => {
                    let start = path.iter().position(|n| *n == edge.to).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(edge.to.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(&edge.to, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for node in nodes {
        if marks.get(node.name.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
            let mut path = Vec::new();
            if let Some(cycle) = visit(&node.name, edges, &mut marks, &mut path) {
                return Err(GraphError::UnboundedCycle(cycle));
            }
        }
    }
    Ok(())
}

/// Propagate the keys available on some path from entry to a fixpoint,
/// then check every node's requirement against what reaches it.
///
/// A requirement must hold on the first visit, so keys flow over plain
/// edges first. Loop edges only feed nodes no plain path reaches.
fn check_inputs(
    nodes: &[Node],
    edges: &[Edge],
    index: &HashMap<String, usize>,
    entry: &str,
    initial_keys: &BTreeSet<String>,
) -> std::result::Result<(), GraphError> {
    let mut available: Vec<Option<BTreeSet<String>>> = vec![None; nodes.len()];
    available[index[entry]] = Some(initial_keys.clone());

    propagate(nodes, edges, index, &mut available, |edge, _| !edge.is_bounded_loop());
    let first_visit: Vec<bool> = available.iter().map(Option::is_some).collect();
    propagate(nodes, edges, index, &mut available, |edge, to| {
        !edge.is_bounded_loop() || !first_visit[to]
    });

    for (i, node) in nodes.iter().enumerate() {
        let keys = available[i].clone().unwrap_or_default();
        if !node.inputs.is_satisfied_by(&|k| keys.contains(k)) {
            return Err(GraphError::UnsatisfiedInput {
                node: node.name.clone(),
                requirement: node.inputs.to_string(),
            });
        }
    }
    Ok(())
}

fn propagate(
    nodes: &[Node],
    edges: &[Edge],
    index: &HashMap<String, usize>,
    available: &mut [Option<BTreeSet<String>>],
    follow: impl Fn(&Edge, usize) -> bool,
) {
    let mut changed = true;
    while changed {
        changed = false;
        for edge in edges {
            let (from, to) = (index[&edge.from], index[&edge.to]);
            if !follow(edge, to) {
                continue;
            }
            let Some(upstream) = available[from].as_ref() else {
                continue;
            };
            let mut incoming = upstream.clone();
            incoming.extend(nodes[from].outputs.iter().cloned());
            match available[to] {
                Some(ref mut target) => {
                    let before = target.len();
                    target.extend(incoming);
                    changed |= target.len() != before;
                }
                None => {
                    available[to] = Some(incoming);
                    changed = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> GraphBuilder {
        Graph::builder()
            .initial_keys(["source", "user_prompt"])
            .node(Node::fetch("fetch"))
            .node(Node::parse("parse"))
            .node(Node::generate_answer("generate_answer"))
            .edge(Edge::always("fetch", "parse"))
            .edge(Edge::always("parse", "generate_answer"))
    }

    #[test]
    fn test_graph_construction() {
        let graph = linear().build().unwrap();
        assert_eq!(graph.entry(), "fetch");
        assert_eq!(graph.nodes().len(), 3);
        assert_eq!(graph.edges().len(), 2);
        assert!(graph.node("parse").is_some());
        assert!(graph.merge_node().is_none());
        assert_eq!(graph.outgoing("parse").count(), 1);
    }

    #[test]
    fn test_empty_graph_rejected() {
        assert_eq!(Graph::builder().build().unwrap_err(), GraphError::Empty);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = linear().node(Node::parse("parse")).build().unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode("parse".into()));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let err = linear().entry("start").build().unwrap_err();
        assert_eq!(err, GraphError::MissingEntry("start".into()));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let err = linear()
            .edge(Edge::always("generate_answer", "publish"))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownEndpoint { ref missing, .. } if missing == "publish"));
    }

    #[test]
    fn test_invalid_condition_rejected() {
        let err = linear()
            .edge(Edge::conditional("generate_answer", "parse", "answer is good").bounded(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidCondition { .. }));
    }

    #[test]
    fn test_zero_iteration_loop_rejected() {
        let err = linear()
            .edge(Edge::on_failure("generate_answer", "parse").bounded(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::ZeroIterationLoop { .. }));
    }

    #[test]
    fn test_entry_with_incoming_edge_rejected() {
        let err = linear()
            .edge(Edge::always("generate_answer", "fetch"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::EntryHasIncoming {
                entry: "fetch".into(),
                from: "generate_answer".into()
            }
        );
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let err = linear().node(Node::image_to_text("orphan")).build().unwrap_err();
        assert_eq!(err, GraphError::Unreachable(vec!["orphan".into()]));
    }

    #[test]
    fn test_unbounded_cycle_rejected() {
        let err = linear()
            .edge(Edge::on_failure("generate_answer", "parse"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnboundedCycle(vec![
                "parse".into(),
                "generate_answer".into(),
                "parse".into()
            ])
        );
    }

    #[test]
    fn test_bounded_loop_accepted() {
        let graph = linear()
            .edge(Edge::on_failure("generate_answer", "parse").bounded(2))
            .build()
            .unwrap();
        assert_eq!(graph.outgoing("generate_answer").count(), 1);
    }

    #[test]
    fn test_key_produced_only_after_loop_rejected() {
        // parsed_doc exists on the second visit of gate, never the first
        let err = Graph::builder()
            .initial_keys(["source"])
            .node(Node::fetch("fetch"))
            .node(Node::conditional("gate").with_inputs("parsed_doc").unwrap())
            .node(Node::parse("parse"))
            .edge(Edge::always("fetch", "gate"))
            .edge(Edge::always("gate", "parse"))
            .edge(Edge::always("parse", "gate").bounded(1))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::UnsatisfiedInput {
                node: "gate".into(),
                requirement: "parsed_doc".into(),
            }
        );
    }

    #[test]
    fn test_node_behind_loop_edge_sees_upstream_keys() {
        let graph = linear()
            .node(Node::conditional("review").with_inputs("answer & parsed_doc").unwrap())
            .edge(Edge::on_failure("generate_answer", "review").bounded(1))
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_missing_producer_rejected() {
        // Nothing upstream of generate_answer produces a document
        let err = Graph::builder()
            .initial_keys(["user_prompt"])
            .node(Node::generate_answer("generate_answer"))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnsatisfiedInput { ref node, .. } if node == "generate_answer"
        ));
    }

    #[test]
    fn test_input_satisfied_on_one_branch() {
        // doc reaches generate_answer through the fetch branch only
        let graph = Graph::builder()
            .initial_keys(["source", "user_prompt"])
            .node(Node::conditional("start"))
            .node(Node::fetch("fetch"))
            .node(Node::generate_answer("generate_answer"))
            .edge(Edge::absent("start", "fetch", "doc"))
            .edge(Edge::always("start", "generate_answer"))
            .edge(Edge::always("fetch", "generate_answer"))
            .build();
        assert!(graph.is_ok());
    }

    #[test]
    fn test_merge_in_topology_rejected() {
        let err = linear()
            .node(Node::merge("merge"))
            .edge(Edge::always("generate_answer", "merge"))
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::MisplacedMerge { ref node, .. } if node == "merge"));
    }

    #[test]
    fn test_merge_slot_requires_merge_kind() {
        let err = linear().merge(Node::parse("merge")).build().unwrap_err();
        assert!(matches!(err, GraphError::MisplacedMerge { .. }));

        let graph = linear().merge(Node::merge("merge")).build().unwrap();
        assert_eq!(graph.merge_node().map(|n| n.name.as_str()), Some("merge"));
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let graph = Graph::builder()
            .node(Node::conditional("start"))
            .node(Node::conditional("a"))
            .node(Node::conditional("b"))
            .edge(Edge::always("start", "a"))
            .edge(Edge::always("start", "b"))
            .build()
            .unwrap();
        let mut loops = LoopCounts::new();
        assert_eq!(graph.resolve("start", &StateContainer::new(), &mut loops), Some("a"));
        assert_eq!(graph.resolve("a", &StateContainer::new(), &mut loops), None);
    }

    #[test]
    fn test_resolve_skips_exhausted_loop() {
        let graph = Graph::builder()
            .node(Node::conditional("start"))
            .node(Node::conditional("work"))
            .node(Node::conditional("done"))
            .edge(Edge::always("start", "work"))
            .edge(Edge::always("work", "work").bounded(2))
            .edge(Edge::always("work", "done"))
            .build()
            .unwrap();
        let state = StateContainer::new();
        let mut loops = LoopCounts::new();
        assert_eq!(graph.resolve("work", &state, &mut loops), Some("work"));
        assert_eq!(graph.resolve("work", &state, &mut loops), Some("work"));
        assert_eq!(graph.resolve("work", &state, &mut loops), Some("done"));
    }

    #[test]
    fn test_definition_from_toml() {
        let def = GraphDefinition::from_toml(
            r#"
initial_keys = ["source", "user_prompt"]

[[nodes]]
name = "fetch"
inputs = "source"
outputs = ["doc", "content_kind"]
kind = { kind = "fetch" }
retry = { max_retries = 2 }

[[nodes]]
name = "parse"
inputs = "doc"
outputs = ["parsed_doc", "link_urls", "img_urls"]
kind = { kind = "parse", chunk_size = 2048 }

[[edges]]
from = "fetch"
to = "parse"
condition = { type = "on_success" }
"#,
        )
        .unwrap();
        let graph = def.build().unwrap();
        assert_eq!(graph.entry(), "fetch");
        assert_eq!(graph.node("fetch").and_then(|n| n.retry).map(|r| r.max_retries), Some(2));

        let round_trip = graph.to_definition().build().unwrap();
        assert_eq!(round_trip.edges(), graph.edges());
    }
}
