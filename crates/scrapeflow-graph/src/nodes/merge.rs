use serde_json::map::Entry;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use scrapeflow_core::config::MergeStrategy;
use scrapeflow_core::error::Result;
use scrapeflow_core::types::CompletionRequest;

use super::{optional, NodeContext};
use crate::graph::node::{MergeNode, Node, NodeRun};
use crate::graph::state::{StateContainer, StateDelta, StateValue};
use crate::output_validator::OutputValidator;

const MERGE_PROMPT: &str = "You are given, as context, the answers extracted from several \
scraped sources. Merge them into a single answer to the user question. Remove duplicates, keep \
every distinct item and respond with JSON only.";

/// Merge per-source result records deterministically.
///
/// Each record is `{source, status, state, output_key?, answer?, error?}`,
/// where `answer` holds the terminal output. Array fields of
/// object answers are concatenated in record order, other fields keep the
/// first non-null value. Non-object answers are collected under `answers`.
/// Records carrying an `error` are listed under `failures`, which is always
/// present.
pub fn concatenate_answers(results: &[Value], max_results: usize) -> Value {
    let mut merged = Map::new();
    let mut others = Vec::new();
    let mut failures = Vec::new();

    for result in results {
        let source = result.get("source").cloned().unwrap_or(Value::Null);
        if let Some(error) = result.get("error") {
            failures.push(json!({ "source": source, "error": error }));
            continue;
        }
        match result.get("answer") {
            Some(Value::Object(fields)) => {
                for (key, value) in fields {
                    match merged.entry(key.clone()) {
                        Entry::Vacant(slot) => {
                            slot.insert(value.clone());
                        }
                        Entry::Occupied(mut slot) => match (slot.get_mut(), value) {
                            (Value::Array(existing), Value::Array(items)) => {
                                existing.extend(items.iter().cloned())
                            }
                            (existing, value) if existing.is_null() => *existing = value.clone(),
                            _ => {}
                        },
                    }
                }
            }
            None | Some(Value::Null) => {}
            Some(other) => others.push(json!({ "source": source, "answer": other })),
        }
    }

    if max_results > 0 {
        for value in merged.values_mut() {
            if let Value::Array(items) = value {
                items.truncate(max_results);
            }
        }
    }
    if !others.is_empty() {
        merged.insert("answers".into(), Value::Array(others));
    }
    merged.insert("failures".into(), Value::Array(failures));
    Value::Object(merged)
}

fn failures_of(results: &[Value]) -> Vec<Value> {
    results
        .iter()
        .filter_map(|r| {
            r.get("error")
                .map(|e| json!({ "source": r.get("source").cloned().unwrap_or(Value::Null), "error": e }))
        })
        .collect()
}

async fn llm_merge(
    node: &Node,
    results: &[Value],
    state: &StateContainer,
    ctx: &NodeContext<'_>,
) -> Result<std::result::Result<Value, Vec<String>>> {
    let Some(ref llm) = ctx.collaborators.llm else {
        return Ok(Err(vec!["no llm collaborator configured".to_string()]));
    };
    let question = optional(node, state, 0)
        .map(StateValue::to_text)
        .unwrap_or_default();
    let answers: Vec<&Value> = results
        .iter()
        .filter(|r| r.get("error").is_none())
        .filter_map(|r| r.get("answer"))
        .collect();
    let context = serde_json::to_string_pretty(&answers)?;
    let prompt = format!("{}\nUser question: {}", MERGE_PROMPT, question);

    ctx.acquire(1).await;
    let reply = llm
        .complete(CompletionRequest {
            prompt,
            context,
            schema: ctx.config.schema.clone(),
            model: ctx.config.llm.clone(),
        })
        .await?;
    Ok(OutputValidator::new(ctx.config.schema.clone()).parse(&reply))
}

/// Consolidate the batch results. Never fatal: the LLM strategy falls back
/// to concatenation with a soft failure.
pub(super) async fn run(
    node: &Node,
    params: &MergeNode,
    inputs: &[String],
    state: &StateContainer,
    ctx: &NodeContext<'_>,
) -> NodeRun {
    let key = inputs.first().map(String::as_str).unwrap_or("results");
    let results: Vec<Value> = state
        .get_list(key)
        .map(|items| items.iter().map(StateValue::to_json).collect())
        .unwrap_or_default();
    let max = ctx.config.max_results;
    let out = node.output(0);

    let strategy = params.strategy.unwrap_or(ctx.config.merge);
    if strategy == MergeStrategy::Concatenate {
        let merged = concatenate_answers(&results, max);
        info!(node = %node.name, sources = results.len(), "Merged answers");
        return NodeRun::success(StateDelta::new().with(out, merged));
    }

    let reason = match llm_merge(node, &results, state, ctx).await {
        Ok(Ok(mut merged)) => {
            if let Value::Object(ref mut map) = merged {
                if max > 0 {
                    for value in map.values_mut() {
                        if let Value::Array(items) = value {
                            items.truncate(max);
                        }
                    }
                }
                map.insert("failures".into(), Value::Array(failures_of(&results)));
            }
            info!(node = %node.name, sources = results.len(), "Merged answers with llm");
            return NodeRun::success(StateDelta::new().with(out, merged));
        }
        Ok(Err(issues)) => issues.join("; "),
        Err(e) => e.to_string(),
    };

    warn!(node = %node.name, reason = %reason, "LLM merge failed, concatenating");
    let merged = concatenate_answers(&results, max);
    NodeRun::soft(
        StateDelta::new().with(out, merged),
        format!("llm merge failed, concatenated instead: {}", reason),
    )
}
