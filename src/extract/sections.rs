use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::catalog::{AREA_ENUM, SUBJECT_NAME_POOL};
use crate::llm::{LlmError, LlmProvider, ModelRequest, TextModel};

const PREVIEW_CHARS: usize = 2_000;

const SYSTEM_PROMPT: &str = "Eres un extractor académico. Responde en español formal y técnico. \
Devuelve SOLO JSON válido con claves en snake_case, sin texto fuera del JSON. \
Si una pieza no existe en el descriptor usa cadena vacía. \
El campo 'area' debe pertenecer al listado provisto. Genera entre 1 y 5 competencias técnicas concisas.";

const GUIDE: &str = "Los ejemplos de tono provienen de otro descriptor; básate solo en el texto entregado. \
La asignatura aún no tiene empresa asociada: describe la empresa con la que se podría trabajar.\n\
Formato frecuente de nombre y código: 'Nombre (CODIGO)'. Sinónimos: Código/Sigla, Asignatura/Ramo/Módulo. No inventes códigos.\n\
API 2: problema real de una empresa local para el que los estudiantes proponen soluciones.\n\
API 3: práctica breve (12 a 16 horas) dentro de la empresa, con tutor de la empresa.\n\
Unidades: número 1..4 en orden; expected_learning breve ('Diagnostica ... considerando ...'); \
unit_hours suma horas presenciales y virtuales; activities_description puede traer numeración; \
evaluation_evidence sale de la tabla 'Sistema de Evaluación' (columnas UA, Evidencia, Criterios 1.1.1, Situación de Evaluación).";

const BOUNDARY_SHAPE: &str = "- company_boundary_condition: objeto {company_type_description, company_requirements_for_level_2_3, project_minimum_elements}";
const API2_SHAPE: &str = "- api_type_2_completion: objeto {project_goal_students, deliverables_at_end, company_expected_participation, other_activities}";
const API3_SHAPE: &str = "- api_type_3_completion: objeto {project_goal_students, deliverables_at_end, expected_student_role, other_activities, master_guide_expected_support}";
const COMPETENCY_SHAPE: &str = "- technical_competencies: arreglo de objetos {number: entero 1..5, description: texto}";
const SUBJECT_SHAPE: &str = "- subject: objeto {name, code, area, hours: entero}";
const UNITS_SHAPE: &str = "- subject_units: arreglo de objetos {number: entero 1..4, expected_learning, unit_hours?, activities_description?, evaluation_evidence?}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Identity already known: only the generated sections are requested.
    LightSections,
    Full,
}

impl ExtractionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMode::LightSections => "light_sections",
            ExtractionMode::Full => "full",
        }
    }
}

/// Blocks a light call should ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionNeeds {
    pub boundary: bool,
    pub api2: bool,
    pub api3: bool,
    pub competencies: bool,
}

impl SectionNeeds {
    pub fn all() -> Self {
        Self {
            boundary: true,
            api2: true,
            api3: true,
            competencies: true,
        }
    }
}

/// Diagnostic record of one model call, stored under `meta.ai.usage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub model: String,
    pub provider: LlmProvider,
    pub mode: ExtractionMode,
    pub prompt_tokens: Option<u64>,
    pub eval_tokens: Option<u64>,
    pub elapsed_ms: u64,
    pub preview: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SectionReply {
    pub payload: Map<String, Value>,
    pub usage: UsageReport,
}

/// The model server asked us to back off.
#[derive(Debug, Clone)]
pub struct RateLimited {
    pub retry_after: Option<Duration>,
    pub usage: UsageReport,
}

#[derive(Clone)]
pub struct SectionExtractor {
    model: Arc<dyn TextModel>,
}

impl SectionExtractor {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }

    pub fn provider(&self) -> LlmProvider {
        self.model.provider()
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Every block, identity included.
    pub async fn full(&self, text: &str) -> Result<SectionReply, RateLimited> {
        self.run(ExtractionMode::Full, full_prompt(text)).await
    }

    /// Only the generated blocks named in `needs`.
    pub async fn light(&self, text: &str, needs: SectionNeeds) -> Result<SectionReply, RateLimited> {
        self.run(ExtractionMode::LightSections, light_prompt(text, needs))
            .await
    }

    async fn run(&self, mode: ExtractionMode, prompt: String) -> Result<SectionReply, RateLimited> {
        let request = ModelRequest::new(SYSTEM_PROMPT, prompt);
        let mut usage = UsageReport {
            model: self.model.model_name().to_string(),
            provider: self.model.provider(),
            mode,
            prompt_tokens: None,
            eval_tokens: None,
            elapsed_ms: 0,
            preview: None,
            error: None,
        };

        match self.model.generate(&request).await {
            Ok(generation) => {
                usage.prompt_tokens = generation.prompt_tokens;
                usage.eval_tokens = generation.eval_tokens;
                usage.elapsed_ms = generation.elapsed.as_millis() as u64;
                usage.preview = Some(generation.text.chars().take(PREVIEW_CHARS).collect());
                info!(
                    prompt_tokens = ?usage.prompt_tokens,
                    eval_tokens = ?usage.eval_tokens,
                    elapsed_ms = usage.elapsed_ms,
                    model = %usage.model,
                    mode = mode.as_str(),
                    "model usage"
                );
                Ok(SectionReply {
                    payload: parse_model_json(&generation.text),
                    usage,
                })
            }
            Err(LlmError::RateLimited { retry_after }) => {
                usage.error = Some(LlmError::RateLimited { retry_after }.to_string());
                Err(RateLimited { retry_after, usage })
            }
            Err(LlmError::Disabled) => {
                usage.error = Some(LlmError::Disabled.to_string());
                Ok(SectionReply {
                    payload: Map::new(),
                    usage,
                })
            }
            Err(err) => {
                warn!(?err, mode = mode.as_str(), "model call failed");
                usage.error = Some(err.to_string());
                Ok(SectionReply {
                    payload: Map::new(),
                    usage,
                })
            }
        }
    }
}

/// Best-effort JSON object from a model reply; empty when nothing parses.
pub fn parse_model_json(text: &str) -> Map<String, Value> {
    let stripped = strip_fences(text.trim());
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&stripped) {
        return map;
    }

    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) {
        if end > start {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&stripped[start..=end]) {
                return map;
            }
        }
    }

    Map::new()
}

fn strip_fences(text: &str) -> String {
    if !text.starts_with("```") {
        return text.to_string();
    }
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.first().is_some_and(|line| line.trim_start().starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|line| line.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

fn reference_lists() -> String {
    let areas = AREA_ENUM.join(", ");
    let names: Vec<&str> = SUBJECT_NAME_POOL.iter().map(|(name, _)| *name).collect();
    format!(
        "Áreas permitidas: {areas}.\nNombres de asignaturas de referencia: {}.",
        names.join("; ")
    )
}

fn full_prompt(text: &str) -> String {
    let keys = [
        SUBJECT_SHAPE,
        COMPETENCY_SHAPE,
        BOUNDARY_SHAPE,
        API2_SHAPE,
        API3_SHAPE,
        UNITS_SHAPE,
    ]
    .join("\n");
    format!(
        "Texto del descriptor (completo):\n{text}\n\n{GUIDE}\n{}\n\n\
         Devuelve SOLO un objeto JSON con estas claves:\n{keys}",
        reference_lists()
    )
}

fn light_prompt(text: &str, needs: SectionNeeds) -> String {
    let mut keys = Vec::new();
    if needs.competencies {
        keys.push(COMPETENCY_SHAPE);
    }
    if needs.boundary {
        keys.push(BOUNDARY_SHAPE);
    }
    if needs.api2 {
        keys.push(API2_SHAPE);
    }
    if needs.api3 {
        keys.push(API3_SHAPE);
    }
    format!(
        "Texto del descriptor (completo):\n{text}\n\n{GUIDE}\n\n\
         Redacta un párrafo breve por campo. Devuelve SOLO un objeto JSON con estas claves:\n{}",
        keys.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;

    #[test]
    fn parses_fenced_and_wrapped_json() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(parse_model_json(fenced)["a"], 1);

        let wrapped = "Aquí está: {\"b\": {\"c\": 2}} fin";
        assert_eq!(parse_model_json(wrapped)["b"]["c"], 2);

        assert!(parse_model_json("sin json").is_empty());
        assert!(parse_model_json("[1, 2]").is_empty());
    }

    #[test]
    fn light_prompt_lists_only_needed_blocks() {
        let needs = SectionNeeds {
            boundary: false,
            api2: true,
            api3: false,
            competencies: true,
        };
        let prompt = light_prompt("texto", needs);
        assert!(prompt.contains("api_type_2_completion"));
        assert!(prompt.contains("technical_competencies"));
        assert!(!prompt.contains("company_boundary_condition"));
        assert!(!prompt.contains("subject_units"));
    }

    #[tokio::test]
    async fn usage_report_records_counts_and_preview() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "{\"technical_competencies\": []}".to_string()
        )]));
        let extractor = SectionExtractor::new(model.clone());
        let reply = extractor.light("texto", SectionNeeds::all()).await.unwrap();

        assert!(reply.payload.contains_key("technical_competencies"));
        assert_eq!(reply.usage.mode, ExtractionMode::LightSections);
        assert_eq!(reply.usage.prompt_tokens, Some(10));
        assert!(reply.usage.error.is_none());
        assert!(model.prompts()[0].starts_with(SYSTEM_PROMPT));
    }

    #[tokio::test]
    async fn failures_become_empty_payloads_and_rate_limits_surface() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::Timeout(Duration::from_secs(60))),
            Err(LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }),
        ]));
        let extractor = SectionExtractor::new(model);

        let reply = extractor.full("texto").await.unwrap();
        assert!(reply.payload.is_empty());
        assert!(reply.usage.error.unwrap().contains("timed out"));

        let limited = extractor.full("texto").await.unwrap_err();
        assert_eq!(limited.retry_after, Some(Duration::from_secs(30)));
    }
}
