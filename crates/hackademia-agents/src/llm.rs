use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// A chat-completion collaborator. Requests carry no client-side timeout:
/// local models are allowed to take as long as they need.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

// ── Gemini (hosted) ──────────────────────────────────────────────────────

/// Calls the Gemini `generateContent` API for classification, fix proposals
/// and question generation.
pub struct GeminiModel {
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl GeminiModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatModel for GeminiModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("GEMINI_API_KEY is not configured"));
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(model = %self.model, %status, "gemini returned non-200: {text}");
            return Err(anyhow!("gemini error {status}: {text}"));
        }
        let parsed: Value = resp.json().await?;
        let text = parsed["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow!("gemini response had no text candidate"))?;
        info!(model = %self.model, output_len = text.len(), "gemini response received");
        Ok(text.to_string())
    }
}

// ── Local code model (OpenAI-compatible, LM Studio style) ────────────────

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Calls a locally hosted code model through an OpenAI-compatible
/// `/chat/completions` endpoint (LM Studio default port).
pub struct LocalCodeModel {
    pub base_url: String,
    pub model: String,
    client: reqwest::Client,
}

impl LocalCodeModel {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChatModel for LocalCodeModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: prompt.to_string(),
            }],
            temperature: 0.3,
            max_tokens: 1500,
            stream: false,
        };

        let resp = self.client.post(&url).json(&request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(model = %self.model, %status, "code model returned non-200: {text}");
            return Err(anyhow!("code model error {status}: {text}"));
        }
        let parsed: ChatResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("code model response had no choices"))?;
        info!(model = %self.model, output_len = content.len(), "code model response received");
        Ok(content)
    }
}

// ── Response post-processing ─────────────────────────────────────────────

/// Strip a leading code fence (with or without a language tag). Returns the
/// raw input when no fence is present or the extraction would be degenerate.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(fence_start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after = &trimmed[fence_start + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let inner = match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    };
    if inner.is_empty() {
        return trimmed.to_string();
    }
    inner.to_string()
}

/// Extract a JSON object from an LLM response: prefer a ```json fence that
/// parses, then fall back to balanced-brace scanning from the first `{`.
pub fn extract_json(raw: &str) -> Option<Value> {
    let fenced = strip_code_fences(raw);
    if let Ok(v) = serde_json::from_str::<Value>(&fenced) {
        if v.is_object() {
            return Some(v);
        }
    }

    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &raw[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
