use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use scrapeflow_core::config::LlmConfig;
use scrapeflow_core::error::Result;
use scrapeflow_core::traits::LlmClient;
use scrapeflow_core::types::CompletionRequest;

/// Validates structured answers against the target schema.
///
/// Understands the JSON-schema subset extraction schemas use: `type`
/// (single or list), `required`, `properties`, `items`, `enum` and local
/// `$ref`s into `$defs` / `definitions`.
pub struct OutputValidator {
    /// Optional JSON schema for validation.
    pub schema: Option<Value>,
    /// Maximum allowed raw output length (characters).
    pub max_length: usize,
}

/// Result of output validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// Output is valid.
    Valid,
    /// Output has issues.
    Invalid { issues: Vec<String> },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl OutputValidator {
    pub fn new(schema: Option<Value>) -> Self {
        Self {
            schema,
            max_length: 1_000_000,
        }
    }

    /// Parse raw model output and validate it.
    ///
    /// Heuristic repair runs first; returns the parsed value or the list
    /// of issues found.
    pub fn parse(&self, output: &str) -> std::result::Result<Value, Vec<String>> {
        if output.len() > self.max_length {
            return Err(vec![format!(
                "Output exceeds max length: {} > {}",
                output.len(),
                self.max_length
            )]);
        }
        let repaired = OutputCleaner::heuristic_repair(output);
        let value: Value = serde_json::from_str(&repaired)
            .map_err(|e| vec![format!("Output is not valid JSON: {}", e)])?;
        match self.validate(&value) {
            ValidationResult::Valid => Ok(value),
            ValidationResult::Invalid { issues } => Err(issues),
        }
    }

    /// Validate an already parsed value.
    pub fn validate(&self, value: &Value) -> ValidationResult {
        let mut issues = Vec::new();
        if let Some(ref schema) = self.schema {
            check_value(value, schema, schema, "$", &mut issues);
        }
        if issues.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { issues }
        }
    }
}

fn resolve_ref<'a>(schema: &'a Value, root: &'a Value) -> Option<&'a Value> {
    let Some(reference) = schema.get("$ref").and_then(Value::as_str) else {
        return Some(schema);
    };
    let name = reference
        .strip_prefix("#/$defs/")
        .or_else(|| reference.strip_prefix("#/definitions/"))?;
    root.get("$defs")
        .or_else(|| root.get("definitions"))
        .and_then(|defs| defs.get(name))
}

fn type_matches(value: &Value, ty: &str) -> bool {
    match ty {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_value(value: &Value, schema: &Value, root: &Value, path: &str, issues: &mut Vec<String>) {
    let Some(schema) = resolve_ref(schema, root) else {
        issues.push(format!("{}: unresolvable $ref", path));
        return;
    };

    let allowed: Vec<&str> = match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => vec![],
    };
    if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(value, t)) {
        issues.push(format!(
            "{}: expected {}, got {}",
            path,
            allowed.join(" or "),
            type_name(value)
        ));
        return;
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            issues.push(format!("{}: value not in enum", path));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    issues.push(format!("{}: missing required key '{}'", path, key));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, prop_schema) in props {
                if let Some(child) = obj.get(key) {
                    // Optional fields may be null
                    if child.is_null() && !is_required(schema, key) {
                        continue;
                    }
                    check_value(child, prop_schema, root, &format!("{}.{}", path, key), issues);
                }
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check_value(item, item_schema, root, &format!("{}[{}]", path, i), issues);
        }
    }
}

fn is_required(schema: &Value, key: &str) -> bool {
    schema
        .get("required")
        .and_then(Value::as_array)
        .is_some_and(|r| r.iter().any(|k| k.as_str() == Some(key)))
}

/// Cleans and repairs malformed output.
pub struct OutputCleaner {
    llm: Arc<dyn LlmClient>,
    model: LlmConfig,
}

impl OutputCleaner {
    /// Create a cleaner with LLM repair capability.
    pub fn new(llm: Arc<dyn LlmClient>, model: LlmConfig) -> Self {
        Self { llm, model }
    }

    /// Apply heuristic repairs to output.
    /// - Strips markdown code fences
    /// - Cuts the outermost JSON value out of surrounding prose
    /// - Balances JSON braces
    pub fn heuristic_repair(output: &str) -> String {
        let result = strip_code_fences(output);
        let result = match extract_json_value(&result) {
            Some(json) => json.to_string(),
            None => result.trim().to_string(),
        };

        if result.starts_with('{') || result.starts_with('[') {
            balance_braces(&result)
        } else {
            result
        }
    }

    /// Ask the LLM to fix malformed output. Exactly one completion.
    pub async fn llm_repair(
        &self,
        output: &str,
        issues: &[String],
        schema: Option<&Value>,
    ) -> Result<String> {
        let issues_text = issues.join("\n- ");
        let prompt = format!(
            r#"The following output has issues that need to be fixed:

Issues:
- {}

Fix the output to resolve these issues. Return ONLY the corrected JSON, nothing else."#,
            issues_text
        );

        debug!(issues = issues.len(), "Running LLM output repair");

        let repaired = self
            .llm
            .complete(CompletionRequest {
                prompt,
                context: output.to_string(),
                schema: schema.cloned(),
                model: self.model.clone(),
            })
            .await?;

        if repaired.trim().is_empty() {
            warn!("LLM repair returned empty response");
            Ok(output.to_string())
        } else {
            Ok(Self::heuristic_repair(&repaired))
        }
    }
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Slice from the first `{` or `[` to its matching closer, or to the end
/// of the text if it never closes.
fn extract_json_value(text: &str) -> Option<&str> {
    let start = text.find(&['{', '['][..])?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    Some(text[start..].trim_end())
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = open.pop() {
        result.push(closer);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrapeflow_test_utils::{product_schema, ScriptedLlm};
    use serde_json::json;

    #[test]
    fn test_heuristic_repair_markdown() {
        let input = r#"```json
{"key": "value", "count": 42}
```"#;
        let result = OutputCleaner::heuristic_repair(input);
        assert_eq!(result, r#"{"key": "value", "count": 42}"#);
    }

    #[test]
    fn test_heuristic_repair_extracts_from_prose() {
        let input = r#"Sure! Here is the data: {"products": [{"name": "Widget"}]} Hope that helps."#;
        let result = OutputCleaner::heuristic_repair(input);
        assert_eq!(result, r#"{"products": [{"name": "Widget"}]}"#);
    }

    #[test]
    fn test_json_brace_balancing() {
        let input = r#"{"key": "value", "nested": {"inner": [true"#;
        let result = OutputCleaner::heuristic_repair(input);
        assert!(result.ends_with("]}}"));
        assert!(serde_json::from_str::<Value>(&result).is_ok());
    }

    #[test]
    fn test_brace_balancing_with_strings() {
        // Braces inside strings should not count
        let input = r#"{"msg": "use { and }", "open": true"#;
        let result = balance_braces(input);
        assert!(result.ends_with('}'));
        assert!(serde_json::from_str::<Value>(&result).is_ok());
    }

    #[test]
    fn test_non_json_unchanged() {
        let input = "Hello, this is plain text output.";
        assert_eq!(OutputCleaner::heuristic_repair(input), input);
    }

    #[test]
    fn test_strip_code_fences_nested_backticks() {
        let input = "```json\n{\"code\": \"use `backticks`\"}\n```";
        let result = strip_code_fences(input);
        assert!(result.contains("backticks"));
    }

    #[test]
    fn test_validator_accepts_matching_value() {
        let validator = OutputValidator::new(Some(product_schema()));
        let value = json!({ "products": [{ "name": "Widget", "price": 9.99 }] });
        assert!(validator.validate(&value).is_valid());
    }

    #[test]
    fn test_validator_reports_issues_with_paths() {
        let validator = OutputValidator::new(Some(product_schema()));
        let value = json!({ "products": [{ "name": "Widget", "price": "cheap" }, { "price": 1 }] });
        match validator.validate(&value) {
            ValidationResult::Invalid { issues } => {
                assert_eq!(issues.len(), 2);
                assert!(issues[0].contains("$.products[0].price"));
                assert!(issues[1].contains("missing required key 'name'"));
            }
            ValidationResult::Valid => panic!("Expected invalid"),
        }
    }

    #[test]
    fn test_validator_follows_refs() {
        let schema = json!({
            "$defs": { "Item": { "type": "object", "required": ["id"], "properties": { "id": { "type": "integer" } } } },
            "type": "object",
            "properties": { "items": { "type": "array", "items": { "$ref": "#/$defs/Item" } } }
        });
        let validator = OutputValidator::new(Some(schema));
        assert!(validator.validate(&json!({ "items": [{ "id": 1 }] })).is_valid());
        assert!(!validator.validate(&json!({ "items": [{ "id": 1.5 }] })).is_valid());
    }

    #[test]
    fn test_parse_without_schema_needs_only_json() {
        let validator = OutputValidator::new(None);
        assert_eq!(validator.parse("```\n[1, 2]\n```").unwrap(), json!([1, 2]));
        let issues = validator.parse("no json here").unwrap_err();
        assert!(issues[0].contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_llm_repair_single_completion() {
        let llm = Arc::new(ScriptedLlm::replying("```json\n{\"fixed\": true}\n```"));
        let cleaner = OutputCleaner::new(llm.clone(), LlmConfig::default());
        let repaired = cleaner
            .llm_repair("{fixed: yes", &["Output is not valid JSON".into()], None)
            .await
            .unwrap();
        assert_eq!(repaired, r#"{"fixed": true}"#);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(llm.requests()[0].context, "{fixed: yes");
    }
}
