use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::ClassifierSection;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Decide whether the tender notice concerns Microsoft software \
licensing or subscriptions. Return JSON only with keys: save (boolean), message, products, \
agreement_type, license_counts, values {net, gross, currency}, duration. Use null for missing \
values; currency defaults to PLN.";

const DEFAULT_CURRENCY: &str = "PLN";

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("classification service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("classification service returned no content")]
    Empty,
    #[error("classification verdict is not a JSON object: {0}")]
    Malformed(String),
    #[error("api key variable {0} is not set")]
    MissingApiKey(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractValues {
    pub net: Option<f64>,
    pub gross: Option<f64>,
    pub currency: String,
}

/// Verdict for one notice. Keys the service returns beyond the known ones
/// are kept in `extra` and written back out when serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "save")]
    pub qualifies: bool,
    pub message: Option<String>,
    pub products: Vec<String>,
    pub agreement_type: Option<String>,
    pub license_counts: BTreeMap<String, Value>,
    pub values: ContractValues,
    pub duration: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Classification {
    /// Reads a verdict leniently: wrong or missing types fall back to empty
    /// values instead of failing.
    pub fn from_value(value: Value) -> Result<Self, ClassifierError> {
        let Value::Object(mut object) = value else {
            return Err(ClassifierError::Malformed(value.to_string()));
        };
        let qualifies = object
            .remove("save")
            .map(|value| value.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let message = take_string(&mut object, "message");
        let products = match object.remove("products") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            _ => Vec::new(),
        };
        let agreement_type = take_string(&mut object, "agreement_type");
        let license_counts = match object.remove("license_counts") {
            Some(Value::Object(counts)) => counts.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        let values = match object.remove("values") {
            Some(Value::Object(values)) => ContractValues {
                net: values.get("net").and_then(Value::as_f64),
                gross: values.get("gross").and_then(Value::as_f64),
                currency: values
                    .get("currency")
                    .and_then(Value::as_str)
                    .filter(|currency| !currency.trim().is_empty())
                    .unwrap_or(DEFAULT_CURRENCY)
                    .to_string(),
            },
            _ => ContractValues {
                currency: DEFAULT_CURRENCY.into(),
                ..ContractValues::default()
            },
        };
        let duration = take_string(&mut object, "duration");
        Ok(Self {
            qualifies,
            message,
            products,
            agreement_type,
            license_counts,
            values,
            duration,
            extra: object,
        })
    }

    /// The verdict as stored: known fields with defaults applied plus every
    /// extra key.
    pub fn to_record(&self) -> Result<Value, ClassifierError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(text)) => Some(text),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("valid regex")
    })
}

/// Parses the assistant's reply, tolerating a Markdown code fence around the
/// JSON.
pub fn parse_verdict(content: &str) -> Result<Classification, ClassifierError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ClassifierError::Empty);
    }
    let body = code_fence()
        .captures(trimmed)
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str())
        .unwrap_or(trimmed);
    let value: Value = serde_json::from_str(body)?;
    Classification::from_value(value)
}

/// Cuts `text` to at most `max_chars` characters, never inside a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifies with the configured system prompt.
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;

    /// Classifies under an explicit system prompt.
    async fn classify_with(
        &self,
        system_prompt: &str,
        text: &str,
    ) -> Result<Classification, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    system_prompt: String,
    max_input_chars: usize,
}

impl OpenAiClassifier {
    pub fn from_config(config: &ClassifierSection) -> Result<Self, ClassifierError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ClassifierError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config, api_key)
    }

    pub fn new(
        config: &ClassifierSection,
        api_key: impl Into<String>,
    ) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        let system_prompt = if config.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            config.system_prompt.clone()
        };
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt,
            max_input_chars: config.max_input_chars,
        })
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        self.classify_with(&self.system_prompt, text).await
    }

    async fn classify_with(
        &self,
        system_prompt: &str,
        text: &str,
    ) -> Result<Classification, ClassifierError> {
        let content = truncate_chars(text, self.max_input_chars);
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content,
                },
            ],
        };
        debug!(model = %self.model, chars = content.chars().count(), "classifying notice");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply = response.json::<ChatResponse>().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(ClassifierError::Empty)?;
        parse_verdict(&content)
    }
}
