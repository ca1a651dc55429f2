//! Assembles the OpenAPI document for the per-check result routes. Each
//! check contributes the JSON schema of its result `data` payload.

use serde_json::{
    json,
    Map,
    Value,
};
use sparrow_commons::CheckKind;

use crate::error::ApiError;

/// Render the full OpenAPI document as YAML.
pub fn build_document() -> Result<String, ApiError> {
    let mut paths = Map::new();
    let mut definitions = Map::new();

    paths.insert(
        "/".to_string(),
        json!({
            "get": {
                "summary": "Liveness",
                "responses": {"200": {"description": "The agent is running"}},
            }
        }),
    );
    paths.insert(
        "/healthz".to_string(),
        json!({
            "get": {
                "summary": "Readiness from the agent's self-check",
                "responses": {
                    "200": {"description": "Every probed route answered 200"},
                    "503": {"description": "At least one probed route failed"},
                },
            }
        }),
    );
    paths.insert(
        "/metrics".to_string(),
        json!({
            "get": {
                "summary": "Prometheus exposition of all check metrics",
                "responses": {"200": {"description": "Metrics in text exposition format"}},
            }
        }),
    );

    for kind in CheckKind::ALL {
        let root = sparrow_checks::data_schema(kind);
        for (name, definition) in root.definitions {
            definitions.insert(name, serde_json::to_value(definition)?);
        }
        let data_schema = serde_json::to_value(&root.schema)?;

        paths.insert(
            format!("/v1/metrics/{kind}"),
            json!({
                "get": {
                    "summary": format!("Latest {kind} check result"),
                    "responses": {
                        "200": {
                            "description": "The most recent result for this check",
                            "content": {
                                "application/json": {
                                    "schema": {
                                        "type": "object",
                                        "properties": {
                                            "data": data_schema,
                                            "timestamp": {
                                                "type": "string",
                                                "format": "date-time",
                                            },
                                        },
                                        "required": ["data", "timestamp"],
                                    }
                                }
                            },
                        },
                        "404": {
                            "description": "Check not configured or no result yet",
                        },
                    },
                }
            }),
        );
    }

    let document = json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Sparrow metrics API",
            "description": "Per-check measurement feed of a sparrow agent",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": Value::Object(paths),
        "definitions": Value::Object(definitions),
    });

    Ok(serde_yaml::to_string(&document)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_renders_and_parses() {
        let doc = build_document().unwrap();
        let value: Value = serde_yaml::from_str(&doc).unwrap();

        assert_eq!(value["openapi"], "3.0.3");
        assert!(value["paths"]["/healthz"]["get"].is_object());
        for kind in CheckKind::ALL {
            let path = format!("/v1/metrics/{kind}");
            let get = &value["paths"][&path]["get"];
            assert!(!get.is_null(), "missing path for {kind}");
            let schema =
                &get["responses"]["200"]["content"]["application/json"]["schema"];
            assert!(schema["properties"]["data"].is_object());
            assert!(schema["properties"]["timestamp"].is_object());
        }
    }

    #[test]
    fn test_document_carries_shared_definitions() {
        let doc = build_document().unwrap();
        let value: Value = serde_yaml::from_str(&doc).unwrap();
        // The health payload references its status enum through definitions.
        assert!(value["definitions"].is_object());
    }
}
