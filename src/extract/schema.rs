use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{Value, json};

use super::catalog::AREA_ENUM;
use crate::models::{API2_FIELDS, API3_FIELDS, BOUNDARY_FIELDS};

/// Outcome of checking a canonical payload against the payload schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl SchemaReport {
    pub fn summary(&self) -> Option<String> {
        (!self.valid).then(|| self.errors.join("; "))
    }
}

fn text_form(fields: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|field| (field.to_string(), json!({ "type": "string" })))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false
    })
}

/// JSON Schema for the canonical payload.
pub fn payload_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "subject": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "code": { "type": "string" },
                    "area": { "type": "string", "enum": AREA_ENUM },
                    "hours": { "type": "integer", "minimum": 0 }
                },
                "additionalProperties": false
            },
            "technical_competencies": {
                "type": "array",
                "maxItems": 5,
                "items": {
                    "type": "object",
                    "required": ["number", "description"],
                    "properties": {
                        "number": { "type": "integer", "minimum": 1, "maximum": 5 },
                        "description": { "type": "string", "minLength": 1 }
                    }
                }
            },
            "subject_units": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["number"],
                    "properties": {
                        "number": { "type": "integer", "minimum": 1, "maximum": 4 },
                        "expected_learning": { "type": "string" },
                        "unit_hours": { "type": "integer", "minimum": 0 },
                        "activities_description": { "type": "string" },
                        "evaluation_evidence": { "type": "string" }
                    }
                }
            },
            "company_boundary_condition": text_form(&BOUNDARY_FIELDS),
            "api_type_2_completion": text_form(&API2_FIELDS),
            "api_type_3_completion": text_form(&API3_FIELDS)
        }
    })
}

/// Validates `payload`; violations are reported, never raised.
pub fn validate_payload(payload: &Value) -> SchemaReport {
    let schema = payload_schema();
    let compiled = match JSONSchema::compile(&schema) {
        Ok(compiled) => compiled,
        Err(err) => {
            return SchemaReport {
                valid: false,
                errors: vec![format!("schema compilation failed: {err}")],
            };
        }
    };

    let errors: Vec<String> = match compiled.validate(payload) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect(),
    };

    SchemaReport {
        valid: errors.is_empty(),
        errors,
    }
}
