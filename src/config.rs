use std::{env, time::Duration};

use tracing::warn;

use crate::{extract::catalog::AREA_ENUM, llm::LlmProvider};

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "phi3:mini";
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_MAX_TEXT_CHARS: usize = 200_000;
const DEFAULT_FIRST_PAGES_CHARS: usize = 60_000;
const DEFAULT_RATE_LIMIT_RETRY_SECONDS: u64 = 60;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_WORKER_POLL_SECONDS: u64 = 5;

/// Immutable runtime configuration shared by every pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub llm: LlmSettings,
    pub defaults: SubjectDefaults,
    pub worker: WorkerSettings,
    pub schema_version: String,
    pub delete_on_skip: bool,
    pub uppercase_codes: bool,
    pub titlecase_names: bool,
    pub max_text_chars: usize,
    pub first_pages_chars: usize,
    pub rate_limit_retry: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub num_ctx: Option<u32>,
    pub num_predict: Option<i32>,
    pub keep_alive: Option<String>,
}

/// Values used when a descriptor does not say otherwise.
#[derive(Debug, Clone)]
pub struct SubjectDefaults {
    pub section: String,
    pub period: String,
    pub campus: String,
    pub api_type: i16,
    pub hours: i32,
    pub semester: String,
    pub area: String,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| -> Option<String> {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let provider = match optional("AI_PROVIDER") {
            Some(raw) => LlmProvider::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown AI_PROVIDER, falling back to ollama");
                LlmProvider::Ollama
            }),
            None => LlmProvider::Ollama,
        };

        let llm = LlmSettings {
            provider,
            base_url: text("OLLAMA_BASE_URL", DEFAULT_OLLAMA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: text("OLLAMA_MODEL", DEFAULT_OLLAMA_MODEL),
            temperature: parse_or("LLM_TEMPERATURE", optional("LLM_TEMPERATURE"), 0.0),
            timeout: Duration::from_secs(parse_or(
                "LLM_TIMEOUT_SECONDS",
                optional("LLM_TIMEOUT_SECONDS"),
                DEFAULT_TIMEOUT_SECONDS,
            )),
            num_ctx: optional("OLLAMA_NUM_CTX").and_then(|raw| parse_optional("OLLAMA_NUM_CTX", &raw)),
            num_predict: optional("OLLAMA_NUM_PREDICT")
                .and_then(|raw| parse_optional("OLLAMA_NUM_PREDICT", &raw)),
            keep_alive: optional("OLLAMA_KEEP_ALIVE"),
        };

        let configured_area = text("DEFAULT_AREA_IF_UNSURE", AREA_ENUM[0]);
        let area = if AREA_ENUM.contains(&configured_area.as_str()) {
            configured_area
        } else {
            warn!(value = %configured_area, "DEFAULT_AREA_IF_UNSURE is not a known area");
            AREA_ENUM[0].to_string()
        };

        let api_type: i16 = parse_or(
            "DEFAULT_SUBJECT_API_TYPE",
            optional("DEFAULT_SUBJECT_API_TYPE"),
            1,
        );

        let defaults = SubjectDefaults {
            section: text("DEFAULT_SUBJECT_SECTION", "1"),
            period: optional("DEFAULT_SUBJECT_PERIOD").unwrap_or_default(),
            campus: text("DEFAULT_SUBJECT_CAMPUS", "chillan"),
            api_type: if (1..=3).contains(&api_type) { api_type } else { 1 },
            hours: parse_or("DEFAULT_SUBJECT_HOURS", optional("DEFAULT_SUBJECT_HOURS"), 0),
            semester: text("DEFAULT_SEMESTER_LEVEL_NAME", "Primero"),
            area,
        };

        let worker = WorkerSettings {
            concurrency: parse_or(
                "WORKER_CONCURRENCY",
                optional("WORKER_CONCURRENCY"),
                DEFAULT_WORKER_CONCURRENCY,
            )
            .max(1),
            poll_interval: Duration::from_secs(
                parse_or(
                    "WORKER_POLL_SECONDS",
                    optional("WORKER_POLL_SECONDS"),
                    DEFAULT_WORKER_POLL_SECONDS,
                )
                .max(1),
            ),
        };

        Self {
            llm,
            defaults,
            worker,
            schema_version: text("AI_SCHEMA_VERSION", "v1"),
            delete_on_skip: flag(optional("DESCRIPTORS_DELETE_ON_SKIP"), true),
            uppercase_codes: flag(optional("SUBJECT_CODE_UPPERCASE"), true),
            titlecase_names: flag(optional("SUBJECT_NAME_TITLECASE"), true),
            max_text_chars: parse_or(
                "DESCRIPTOR_MAX_TEXT_CHARS",
                optional("DESCRIPTOR_MAX_TEXT_CHARS"),
                DEFAULT_MAX_TEXT_CHARS,
            ),
            first_pages_chars: parse_or(
                "DESCRIPTOR_FIRST_PAGES_CHARS",
                optional("DESCRIPTOR_FIRST_PAGES_CHARS"),
                DEFAULT_FIRST_PAGES_CHARS,
            ),
            rate_limit_retry: Duration::from_secs(parse_or(
                "RATE_LIMIT_RETRY_SECONDS",
                optional("RATE_LIMIT_RETRY_SECONDS"),
                DEFAULT_RATE_LIMIT_RETRY_SECONDS,
            )),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(value) => parse_optional(key, &value).unwrap_or(default),
        None => default,
    }
}

fn parse_optional<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparsable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.base_url, "http://localhost:11434");
        assert_eq!(config.llm.model, "phi3:mini");
        assert_eq!(config.llm.timeout, Duration::from_secs(60));
        assert_eq!(config.defaults.section, "1");
        assert_eq!(config.defaults.period, "");
        assert_eq!(config.defaults.campus, "chillan");
        assert_eq!(config.defaults.area, "Administracion");
        assert!(config.delete_on_skip);
        assert!(config.uppercase_codes);
        assert_eq!(config.max_text_chars, 200_000);
        assert_eq!(config.rate_limit_retry, Duration::from_secs(60));
    }

    #[test]
    fn overrides_and_invalid_values() {
        let config = config_from(&[
            ("AI_PROVIDER", "none"),
            ("OLLAMA_BASE_URL", "http://ollama:11434/"),
            ("OLLAMA_NUM_CTX", "8192"),
            ("WORKER_CONCURRENCY", "abc"),
            ("DESCRIPTORS_DELETE_ON_SKIP", "no"),
            ("DEFAULT_AREA_IF_UNSURE", "Astronomia"),
            ("DEFAULT_SUBJECT_API_TYPE", "7"),
        ]);
        assert_eq!(config.llm.provider, LlmProvider::Disabled);
        assert_eq!(config.llm.base_url, "http://ollama:11434");
        assert_eq!(config.llm.num_ctx, Some(8192));
        assert_eq!(config.worker.concurrency, 4);
        assert!(!config.delete_on_skip);
        assert_eq!(config.defaults.area, AREA_ENUM[0]);
        assert_eq!(config.defaults.api_type, 1);
    }
}
