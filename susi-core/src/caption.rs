//! Caption generation from image metadata.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::contract::{CaptionGenerator, Metadata};
use crate::error::{truncate, PipelineError};

/// Trim and collapse runs of whitespace into single spaces.
pub fn clean_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Caption used when generation fails: the title, else `default`.
pub fn fallback_caption(metadata: &Metadata, default: &str) -> String {
    metadata
        .get("title")
        .map(|t| clean_value(t))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Caption from a fixed template such as `"{title}: {comment}"`.
#[derive(Debug, Clone)]
pub struct TemplateCaption {
    template: String,
    placeholder: Regex,
}

impl TemplateCaption {
    pub fn new(template: impl Into<String>) -> Result<Self, PipelineError> {
        let placeholder = Regex::new(r"\{(\w+)\}")
            .map_err(|e| PipelineError::config(format!("caption placeholder pattern: {e}")))?;
        Ok(Self {
            template: template.into(),
            placeholder,
        })
    }

    /// Fill `{key}` placeholders from `metadata`; unknown keys become empty.
    ///
    /// Text between two placeholders only appears when both sides have a
    /// value, so `"{title}: {comment}"` without a comment renders as the bare
    /// title. Values themselves are never trimmed of punctuation. When every
    /// placeholder is empty the caption is empty.
    pub fn render(&self, metadata: &Metadata) -> String {
        let mut separators = Vec::new();
        let mut values = Vec::new();
        let mut last = 0;
        for caps in self.placeholder.captures_iter(&self.template) {
            let Some(whole) = caps.get(0) else { continue };
            separators.push(&self.template[last..whole.start()]);
            values.push(
                metadata
                    .get(&caps[1])
                    .map(|v| clean_value(v))
                    .unwrap_or_default(),
            );
            last = whole.end();
        }
        let trailing = &self.template[last..];
        if values.is_empty() {
            return self.template.trim().to_string();
        }
        if values.iter().all(|v| v.is_empty()) {
            return String::new();
        }

        // separators[0] leads the template; separators[i] sits before values[i].
        let mut out = separators[0].to_string();
        let mut emitted: Option<usize> = None;
        for (i, value) in values.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            if let Some(prev) = emitted {
                // Joined by the text that followed the previous kept value.
                out.push_str(separators[prev + 1]);
            }
            out.push_str(value);
            emitted = Some(i);
        }
        out.push_str(trailing);
        out.trim().to_string()
    }
}

#[async_trait]
impl CaptionGenerator for TemplateCaption {
    async fn generate(&self, metadata: &Metadata) -> Result<String, PipelineError> {
        Ok(self.render(metadata))
    }
}

/// Settings for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenAiSettings {
    /// Full chat completions URL, e.g. `http://localhost:1234/v1/chat/completions`.
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "GenAiSettings::default_model")]
    pub model: String,
    #[serde(default = "GenAiSettings::default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "GenAiSettings::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "GenAiSettings::default_temperature")]
    pub temperature: f32,
}

impl GenAiSettings {
    fn default_model() -> String {
        "deepseek/deepseek-r1-0528-qwen3-8b".to_string()
    }

    fn default_system_prompt() -> String {
        "You write Instagram captions for photos. Reply with the caption text only, \
         no explanations, at most a few short sentences and a handful of hashtags."
            .to_string()
    }

    fn default_max_tokens() -> u32 {
        900
    }

    fn default_temperature() -> f32 {
        0.8
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Caption written by a language model.
pub struct GenAiCaption {
    http: reqwest::Client,
    settings: GenAiSettings,
}

impl GenAiCaption {
    pub fn new(http: reqwest::Client, settings: GenAiSettings) -> Self {
        Self { http, settings }
    }
}

/// One line per non-empty metadata entry, then the instruction.
fn user_prompt(metadata: &Metadata) -> String {
    let mut prompt = String::new();
    for (key, value) in metadata {
        let value = clean_value(value);
        if value.is_empty() {
            continue;
        }
        let mut label = key.replace('_', " ");
        if let Some(first) = label.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        prompt.push_str(&format!("{label}: {value}\n"));
    }
    prompt.push_str("\nWrite an Instagram caption for this photo.");
    prompt
}

/// Drop a leading `<think>...</think>` reasoning block if the model emitted one.
pub fn strip_reasoning(content: &str) -> &str {
    match content.split_once("</think>") {
        Some((_, after)) => after.trim(),
        None => content.trim(),
    }
}

#[async_trait]
impl CaptionGenerator for GenAiCaption {
    async fn generate(&self, metadata: &Metadata) -> Result<String, PipelineError> {
        let prompt = user_prompt(metadata);
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.settings.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut req = self.http.post(&self.settings.endpoint).json(&request);
        if let Some(key) = &self.settings.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(status.as_u16(), &body));
        }

        let reply: ChatResponse = response.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let caption = strip_reasoning(&content);
        if caption.is_empty() {
            warn!(raw = truncate(&content, 200), "Model returned no usable caption");
            return Err(PipelineError::platform("empty", "model returned no caption"));
        }
        debug!(chars = caption.len(), "Generated caption");
        Ok(caption.to_string())
    }
}
