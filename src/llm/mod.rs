use std::{fmt, time::Duration, time::Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmSettings;

/// Enumerates the supported model backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Ollama,
    /// Every call returns an empty payload without touching the network.
    Disabled,
}

impl LlmProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(LlmProvider::Ollama),
            "none" | "disabled" | "off" => Some(LlmProvider::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::Disabled => write!(f, "none"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model calls are disabled")]
    Disabled,

    #[error("cannot reach Ollama at {0}")]
    Connection(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by the model server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Ollama returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("failed to parse Ollama response: {0}")]
    ResponseParsing(String),
}

/// One completion request. `system` and `prompt` are sent as a single prompt.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub prompt: String,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
        }
    }

    fn combined(&self) -> String {
        if self.system.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}\n\n{}", self.system, self.prompt)
        }
    }
}

/// Raw model output plus the counters the server reported.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: Option<u64>,
    pub eval_tokens: Option<u64>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait TextModel: Send + Sync {
    fn provider(&self) -> LlmProvider;

    fn model_name(&self) -> &str;

    async fn generate(&self, request: &ModelRequest) -> Result<Generation, LlmError>;
}

/// Ollama `/api/generate` client.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    settings: LlmSettings,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'static str,
    stream: bool,
    options: GenerateOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| LlmError::Http(err.to_string()))?;
        Ok(Self { http, settings })
    }

    fn base_url(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    fn body<'a>(&'a self, prompt: &'a str) -> GenerateBody<'a> {
        GenerateBody {
            model: &self.settings.model,
            prompt,
            format: "json",
            stream: false,
            options: GenerateOptions {
                temperature: self.settings.temperature,
                num_ctx: self.settings.num_ctx,
                num_predict: self.settings.num_predict,
            },
            keep_alive: self.settings.keep_alive.as_deref(),
        }
    }
}

#[async_trait]
impl TextModel for LlmClient {
    fn provider(&self) -> LlmProvider {
        self.settings.provider
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, request: &ModelRequest) -> Result<Generation, LlmError> {
        if self.settings.provider == LlmProvider::Disabled {
            return Err(LlmError::Disabled);
        }

        let url = format!("{}/api/generate", self.base_url());
        let prompt = request.combined();
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .json(&self.body(&prompt))
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    LlmError::Connection(self.base_url().to_string())
                } else if err.is_timeout() {
                    LlmError::Timeout(self.settings.timeout)
                } else {
                    LlmError::Http(err.to_string())
                }
            })?;

        let status = response.status();
        if is_rate_limit(status, response.headers().contains_key(RETRY_AFTER)) {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let reply: GenerateReply = response.json().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(self.settings.timeout)
            } else {
                LlmError::ResponseParsing(err.to_string())
            }
        })?;

        Ok(Generation {
            text: reply.response,
            prompt_tokens: reply.prompt_eval_count,
            eval_tokens: reply.eval_count,
            elapsed: started.elapsed(),
        })
    }
}

fn is_rate_limit(status: StatusCode, has_retry_after: bool) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::SERVICE_UNAVAILABLE && has_retry_after)
}

/// Delay-seconds form of `Retry-After`; HTTP dates are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::VecDeque,
        sync::{Mutex, MutexGuard},
    };

    use super::*;

    /// Replays queued replies in order; an exhausted script answers `{}`.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> MutexGuard<'_, Vec<String>> {
            self.prompts.lock().unwrap()
        }

        pub fn calls(&self) -> usize {
            self.prompts().len()
        }
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        fn provider(&self) -> LlmProvider {
            LlmProvider::Ollama
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: &ModelRequest) -> Result<Generation, LlmError> {
            self.prompts.lock().unwrap().push(request.combined());
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("{}".to_string())).map(|text| Generation {
                text,
                prompt_tokens: Some(10),
                eval_tokens: Some(5),
                elapsed: Duration::from_millis(1),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider: LlmProvider, base_url: &str) -> LlmSettings {
        LlmSettings {
            provider,
            base_url: base_url.to_string(),
            model: "phi3:mini".to_string(),
            temperature: 0.0,
            timeout: Duration::from_secs(2),
            num_ctx: Some(8192),
            num_predict: None,
            keep_alive: Some("15m".to_string()),
        }
    }

    #[test]
    fn provider_parsing() {
        assert_eq!(LlmProvider::parse(" Ollama "), Some(LlmProvider::Ollama));
        assert_eq!(LlmProvider::parse("none"), Some(LlmProvider::Disabled));
        assert_eq!(LlmProvider::parse("openai"), None);
        assert_eq!(LlmProvider::Disabled.to_string(), "none");
    }

    #[test]
    fn request_body_shape() {
        let client = LlmClient::new(settings(LlmProvider::Ollama, "http://localhost:11434/")).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");

        let body = serde_json::to_value(client.body("hola")).unwrap();
        assert_eq!(body["format"], "json");
        assert_eq!(body["stream"], false);
        assert_eq!(body["keep_alive"], "15m");
        assert_eq!(body["options"]["num_ctx"], 8192);
        assert!(body["options"].get("num_predict").is_none());
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limit(StatusCode::TOO_MANY_REQUESTS, false));
        assert!(is_rate_limit(StatusCode::SERVICE_UNAVAILABLE, true));
        assert!(!is_rate_limit(StatusCode::SERVICE_UNAVAILABLE, false));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn disabled_provider_never_calls_out() {
        let client = LlmClient::new(settings(LlmProvider::Disabled, "http://127.0.0.1:9")).unwrap();
        let err = client
            .generate(&ModelRequest::new("sys", "user"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Disabled));
    }

    #[test]
    fn system_and_prompt_are_joined() {
        assert_eq!(ModelRequest::new("a", "b").combined(), "a\n\nb");
        assert_eq!(ModelRequest::new("", "b").combined(), "b");
    }
}
