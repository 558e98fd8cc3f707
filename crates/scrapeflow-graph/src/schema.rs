use serde_json::{Map, Value};

/// Flatten a JSON schema into the compact shape used in prompts.
///
/// Scalar fields become `{"type", "description"}`, arrays become a
/// one-element list describing their items, and `$ref`s into `$defs` are
/// inlined. Schemas without `properties` are returned unchanged.
pub fn transform_schema(schema: &Value) -> Value {
    match schema.get("properties").and_then(Value::as_object) {
        Some(props) => process_properties(props, schema),
        None => schema.clone(),
    }
}

fn definition<'a>(reference: &str, root: &'a Value) -> Option<&'a Value> {
    let name = reference.rsplit('/').next()?;
    root.get("$defs")
        .or_else(|| root.get("definitions"))
        .and_then(|defs| defs.get(name))
}

fn nested(value: &Value, root: &Value) -> Option<Value> {
    let target = match value.get("$ref").and_then(Value::as_str) {
        Some(reference) => definition(reference, root)?,
        None => value,
    };
    target
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| process_properties(props, root))
}

fn process_properties(properties: &Map<String, Value>, root: &Value) -> Value {
    let mut result = Map::new();
    for (key, value) in properties {
        let ty = value.get("type").and_then(Value::as_str);
        let transformed = if ty == Some("array") {
            let items = value.get("items").cloned().unwrap_or(Value::Null);
            let item = nested(&items, root).unwrap_or_else(|| {
                items
                    .get("type")
                    .cloned()
                    .unwrap_or_else(|| Value::String("any".into()))
            });
            Value::Array(vec![item])
        } else if let Some(obj) = nested(value, root) {
            obj
        } else if let Some(ty) = ty {
            serde_json::json!({
                "type": ty,
                "description": value.get("description").and_then(Value::as_str).unwrap_or(""),
            })
        } else {
            continue;
        };
        result.insert(key.clone(), transformed);
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrapeflow_test_utils::product_schema;
    use serde_json::json;

    #[test]
    fn test_flattens_defs_and_arrays() {
        let schema = json!({
            "$defs": {
                "Product": {
                    "properties": {
                        "name": { "type": "string", "description": "Product name" },
                        "price": { "type": "number" }
                    }
                },
                "Shop": {
                    "properties": { "title": { "type": "string", "description": "Shop title" } }
                }
            },
            "properties": {
                "products": { "type": "array", "items": { "$ref": "#/$defs/Product" } },
                "tags": { "type": "array", "items": { "type": "string" } },
                "shop": { "$ref": "#/$defs/Shop" }
            }
        });

        assert_eq!(
            transform_schema(&schema),
            json!({
                "products": [{
                    "name": { "type": "string", "description": "Product name" },
                    "price": { "type": "number", "description": "" }
                }],
                "tags": ["string"],
                "shop": { "title": { "type": "string", "description": "Shop title" } }
            })
        );
    }

    #[test]
    fn test_inline_item_objects() {
        assert_eq!(
            transform_schema(&product_schema()),
            json!({
                "products": [{
                    "name": { "type": "string", "description": "Product name" },
                    "price": { "type": "number", "description": "Price in dollars" }
                }]
            })
        );
    }

    #[test]
    fn test_schema_without_properties_is_kept() {
        let schema = json!({ "type": "array", "items": { "type": "string" } });
        assert_eq!(transform_schema(&schema), schema);
    }
}
