use tracing::{debug, warn};

use scrapeflow_core::error::Result;
use scrapeflow_core::types::ImageInput;

use super::{require, NodeContext};
use crate::graph::node::{ImageToTextNode, Node, NodeRun};
use crate::graph::state::{StateContainer, StateDelta, StateValue};

fn image_inputs(value: Option<&StateValue>) -> Vec<ImageInput> {
    match value {
        Some(StateValue::List(items)) => items
            .iter()
            .filter_map(|item| match item {
                StateValue::Text(url) if !url.trim().is_empty() => Some(ImageInput::Url(url.clone())),
                StateValue::Blob(bytes) => Some(ImageInput::Bytes(bytes.clone())),
                _ => None,
            })
            .collect(),
        Some(StateValue::Text(url)) if !url.trim().is_empty() => vec![ImageInput::Url(url.clone())],
        Some(StateValue::Blob(bytes)) => vec![ImageInput::Bytes(bytes.clone())],
        _ => vec![],
    }
}

pub(super) async fn run(
    node: &Node,
    params: &ImageToTextNode,
    inputs: &[String],
    state: &StateContainer,
    ctx: &NodeContext<'_>,
) -> Result<NodeRun> {
    let describer = require(&ctx.collaborators.describer, "image describer")?;
    let key = inputs.first().map(String::as_str).unwrap_or("img_urls");

    let limit = params.max_images.unwrap_or(ctx.config.max_images);
    let mut images = image_inputs(state.get(key));
    images.truncate(limit);

    let mut descriptions = Vec::with_capacity(images.len());
    let mut blank = 0;
    for image in &images {
        ctx.acquire(1).await;
        let text = describer.describe(image).await?;
        if text.trim().is_empty() {
            blank += 1;
        } else {
            descriptions.push(text);
        }
    }
    debug!(node = %node.name, images = images.len(), described = descriptions.len(), "Described images");

    let delta = StateDelta::new().with(node.output(0), descriptions);
    if blank > 0 {
        warn!(node = %node.name, blank, "Images without description");
        return Ok(NodeRun::soft(
            delta,
            format!("{} of {} images returned no description", blank, images.len()),
        ));
    }
    Ok(NodeRun::success(delta))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use scrapeflow_core::config::AppConfig;
    use scrapeflow_test_utils::{ScriptedDescriber, ScriptedLimiter};

    use super::*;
    use crate::graph::node::{NodeKind, NodeOutcome};
    use crate::nodes::{run_node, Collaborators};

    fn urls(n: usize) -> StateContainer {
        let list: Vec<String> = (0..n).map(|i| format!("https://shop.test/{}.png", i)).collect();
        StateContainer::from_pairs([("img_urls", StateValue::from(list))])
    }

    async fn describe_with(collaborators: Collaborators, node: Node, state: &StateContainer) -> NodeRun {
        let config = AppConfig::default();
        let ctx = NodeContext {
            config: &config,
            collaborators: &collaborators,
        };
        run_node(&node, &["img_urls".to_string()], state, &ctx).await
    }

    #[tokio::test]
    async fn test_descriptions_capped_at_max_images() {
        let describer = Arc::new(ScriptedDescriber::new());
        let limiter = Arc::new(ScriptedLimiter::grant_all());
        let collaborators = Collaborators::new()
            .with_describer(describer.clone())
            .with_limiter(limiter.clone());
        let node = Node::new(
            "image_to_text",
            NodeKind::ImageToText(ImageToTextNode { max_images: Some(2) }),
        );

        let run = describe_with(collaborators, node, &urls(4)).await;
        assert_eq!(run.outcome, NodeOutcome::Success);
        let described = run.delta.get("img_desc").and_then(StateValue::as_list).unwrap();
        assert_eq!(described.len(), 2);
        assert_eq!(described[0].to_text(), "a picture of https://shop.test/0.png");
        assert_eq!(describer.call_count(), 2);
        assert_eq!(limiter.admits(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_blank_description_is_soft_failure() {
        let describer = ScriptedDescriber::new().with_empty("https://shop.test/1.png");
        let collaborators = Collaborators::new().with_describer(Arc::new(describer));
        let run = describe_with(collaborators, Node::image_to_text("image_to_text"), &urls(2)).await;
        assert!(matches!(run.outcome, NodeOutcome::SoftFailure(_)));
        assert_eq!(run.delta.get("img_desc").and_then(StateValue::as_list).map(<[_]>::len), Some(1));
    }

    #[tokio::test]
    async fn test_describer_errors_classified() {
        let describer = ScriptedDescriber::new().with_transient("https://shop.test/0.png", 1);
        let collaborators = Collaborators::new().with_describer(Arc::new(describer));
        let run = describe_with(collaborators, Node::image_to_text("image_to_text"), &urls(1)).await;
        assert!(matches!(run.outcome, NodeOutcome::Retryable(_)));

        let describer = ScriptedDescriber::new().with_fatal("https://shop.test/0.png");
        let collaborators = Collaborators::new().with_describer(Arc::new(describer));
        let run = describe_with(collaborators, Node::image_to_text("image_to_text"), &urls(1)).await;
        assert!(matches!(run.outcome, NodeOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_no_images_writes_empty_list() {
        let collaborators = Collaborators::new().with_describer(Arc::new(ScriptedDescriber::new()));
        let run = describe_with(collaborators, Node::image_to_text("image_to_text"), &urls(0)).await;
        assert_eq!(run.outcome, NodeOutcome::Success);
        assert_eq!(run.delta.get("img_desc"), Some(&StateValue::List(vec![])));
    }
}
