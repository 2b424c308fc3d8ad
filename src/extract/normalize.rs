use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::models::{SubjectUnit, TechnicalCompetency};

const COMPETENCY_KEYS: [&str; 8] = [
    "technical_competencies",
    "SubjectTechnicalCompetency",
    "technicalCompetencies",
    "TechnicalCompetencies",
    "competencias_tecnicas",
    "competenciasTecnicas",
    "competencias",
    "technical_competency",
];
const UNIT_KEYS: [&str; 4] = ["subject_units", "SubjectUnit", "subjectUnits", "units"];
const SUB_FORM_KEYS: [&str; 3] = [
    "company_boundary_condition",
    "api_type_2_completion",
    "api_type_3_completion",
];
const MAX_COMPETENCIES: usize = 5;
const MAX_NESTED_UNITS: usize = 4;
const SHORT_ITEM_CHARS: usize = 80;

/// Identity block as declared by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubjectBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<i64>,
}

/// Model output after key translation and value coercion.
///
/// Sub-forms stay as maps so unexpected keys remain visible to the schema
/// check; every value in them is already coerced to text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CanonicalPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectBlock>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub technical_competencies: Vec<TechnicalCompetency>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subject_units: Vec<SubjectUnit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_boundary_condition: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_type_2_completion: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_type_3_completion: Option<Map<String, Value>>,
}

impl CanonicalPayload {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    pub fn subject_mut(&mut self) -> &mut SubjectBlock {
        self.subject.get_or_insert_with(SubjectBlock::default)
    }

    /// Copies the blocks missing here from `other`.
    pub fn fill_missing_from(&mut self, other: CanonicalPayload) {
        if self.technical_competencies.is_empty() {
            self.technical_competencies = other.technical_competencies;
        }
        if sub_form_missing(&self.company_boundary_condition) {
            self.company_boundary_condition = other.company_boundary_condition;
        }
        if sub_form_missing(&self.api_type_2_completion) {
            self.api_type_2_completion = other.api_type_2_completion;
        }
        if sub_form_missing(&self.api_type_3_completion) {
            self.api_type_3_completion = other.api_type_3_completion;
        }
    }

    /// Sections a light call can still supply.
    pub fn missing_sections(&self) -> bool {
        self.technical_competencies.is_empty()
            || sub_form_missing(&self.company_boundary_condition)
            || (sub_form_missing(&self.api_type_2_completion)
                && sub_form_missing(&self.api_type_3_completion))
    }
}

pub fn sub_form_missing(form: &Option<Map<String, Value>>) -> bool {
    match form {
        Some(map) => map
            .values()
            .all(|value| value.as_str().is_none_or(|text| text.trim().is_empty())),
        None => true,
    }
}

/// Typed view of a sub-form map, keeping only the known `fields`.
pub fn typed_sub_form<T>(form: &Map<String, Value>, fields: &[&str]) -> T
where
    T: DeserializeOwned + Default,
{
    let known: Map<String, Value> = form
        .iter()
        .filter(|(key, _)| fields.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), Value::String(coerce_to_text(value))))
        .collect();
    serde_json::from_value(Value::Object(known)).unwrap_or_default()
}

/// Translates a raw model object into the canonical payload.
pub fn normalize_payload(raw: &Map<String, Value>) -> CanonicalPayload {
    let mut payload = CanonicalPayload::default();

    if let Some(Value::Object(subject)) = raw.get("subject") {
        payload.subject = Some(SubjectBlock {
            name: non_empty(subject.get("name").map(coerce_to_text)),
            code: non_empty(subject.get("code").map(coerce_to_text)),
            area: non_empty(subject.get("area").map(coerce_to_text)),
            hours: subject.get("hours").and_then(parse_int),
        });
    }

    if let Some(items) = COMPETENCY_KEYS
        .iter()
        .find_map(|key| raw.get(*key).and_then(Value::as_array))
    {
        payload.technical_competencies = normalize_competencies(items);
    }

    payload.subject_units = UNIT_KEYS
        .iter()
        .find_map(|key| match raw.get(*key) {
            Some(Value::Array(items)) => Some(normalize_units(items)),
            Some(Value::Object(nested)) => nested
                .get("units")
                .and_then(Value::as_array)
                .map(|items| flatten_nested_units(items)),
            _ => None,
        })
        .unwrap_or_default();

    for key in SUB_FORM_KEYS {
        let Some(Value::Object(form)) = raw.get(key) else {
            continue;
        };
        let coerced: Map<String, Value> = form
            .iter()
            .map(|(field, value)| (field.clone(), Value::String(coerce_to_text(value))))
            .collect();
        match key {
            "company_boundary_condition" => payload.company_boundary_condition = Some(coerced),
            "api_type_2_completion" => payload.api_type_2_completion = Some(coerced),
            _ => payload.api_type_3_completion = Some(coerced),
        }
    }

    payload
}

fn normalize_competencies(items: &[Value]) -> Vec<TechnicalCompetency> {
    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let position = idx as i64 + 1;
        let (number, description) = match item {
            Value::Object(obj) => {
                let number = obj.get("number").and_then(parse_int).unwrap_or(position);
                let description = obj
                    .get("description")
                    .or_else(|| obj.get("desc"))
                    .map(coerce_to_text)
                    .unwrap_or_default();
                (number, description)
            }
            other => (position, coerce_to_text(other)),
        };
        if description.is_empty() {
            continue;
        }
        out.push(TechnicalCompetency {
            number: clamp_i32(number),
            description,
        });
        if out.len() >= MAX_COMPETENCIES {
            break;
        }
    }
    out
}

fn normalize_units(items: &[Value]) -> Vec<SubjectUnit> {
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let obj = item.as_object()?;
            let number = obj
                .get("number")
                .and_then(parse_int)
                .unwrap_or(idx as i64 + 1);
            Some(SubjectUnit {
                number: clamp_i32(number),
                expected_learning: non_empty(obj.get("expected_learning").map(coerce_to_text)),
                unit_hours: obj.get("unit_hours").and_then(parse_int).map(clamp_i32),
                activities_description: non_empty(
                    obj.get("activities_description").map(coerce_to_text),
                ),
                evaluation_evidence: non_empty(obj.get("evaluation_evidence").map(coerce_to_text)),
            })
        })
        .collect()
}

fn flatten_nested_units(items: &[Value]) -> Vec<SubjectUnit> {
    items
        .iter()
        .filter_map(Value::as_object)
        .take(MAX_NESTED_UNITS)
        .enumerate()
        .map(|(idx, obj)| SubjectUnit {
            number: idx as i32 + 1,
            expected_learning: non_empty(obj.get("name").map(coerce_to_text)),
            unit_hours: obj.get("hours").and_then(parse_int).map(clamp_i32),
            ..SubjectUnit::default()
        })
        .collect()
}

/// Flattens any JSON value into display text.
pub fn coerce_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(coerce_to_text)
                .filter(|part| !part.is_empty())
                .collect();
            let short = parts
                .iter()
                .all(|part| part.chars().count() <= SHORT_ITEM_CHARS);
            if short {
                parts.join(" / ")
            } else {
                parts.join("\n")
            }
        }
        Value::Object(obj) => {
            if let Some(Value::String(description)) = obj.get("description") {
                let description = description.trim();
                if !description.is_empty() {
                    return description.to_string();
                }
            }
            obj.iter()
                .filter_map(|(key, value)| {
                    let text = coerce_to_text(value);
                    (!text.is_empty()).then(|| format!("{key}: {text}"))
                })
                .collect::<Vec<_>>()
                .join("; ")
        }
    }
}

/// Integer from a JSON number or a numeric string.
pub fn parse_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|text| !text.trim().is_empty())
}
