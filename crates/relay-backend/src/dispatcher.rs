//! Round-robin dispatcher to one or more OpenAI-compatible chat
//! endpoints. No health awareness; on any transport or decode failure
//! the unary call returns `None` and never raises, matching the
//! echo-fallback contract the engine depends on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct ChatRequestPayload<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    #[serde(default)]
    message: ChatCompletionMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: ChatChoiceDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChoiceDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

pub struct BackendDispatcher {
    endpoints: Vec<String>,
    index: AtomicUsize,
    client: reqwest::Client,
    model_id: String,
}

impl BackendDispatcher {
    pub fn new(endpoints: Vec<String>, model_id: impl Into<String>) -> Self {
        Self {
            endpoints,
            index: AtomicUsize::new(0),
            client: reqwest::Client::new(),
            model_id: model_id.into(),
        }
    }

    pub fn has_backends(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Round robin across calls; returns the endpoint at `index mod N`
    /// then advances the index modulo `N`.
    pub fn next_endpoint(&self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        let n = self.endpoints.len();
        let i = self.index.fetch_add(1, Ordering::Relaxed) % n;
        Some(self.endpoints[i].as_str())
    }

    /// `None` on no endpoints, any transport/decode failure, or an
    /// empty `choices` array. Never raises.
    pub async fn chat(&self, prompt: &str) -> Option<String> {
        let endpoint = self.next_endpoint()?;
        let url = format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'));
        let payload = ChatRequestPayload {
            model: &self.model_id,
            messages: vec![ChatRequestMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await
            .ok()?;
        let parsed: ChatCompletionResponse = response.json().await.ok()?;
        let first = parsed.choices.into_iter().next()?;
        let content = first.message.content.trim().to_string();
        Some(content)
    }

    /// Lazy finite sequence of chunk records. If the upstream ignores
    /// the `stream: true` flag and replies with `application/json`,
    /// synthesize exactly one chunk from the unary reply. Otherwise
    /// treat the body as SSE, skipping malformed `data:` lines.
    ///
    /// Takes `self` and `prompt` by owned value (rather than by
    /// reference) so the returned stream is `'static` and can be
    /// handed directly to an HTTP framework's streaming response body,
    /// which must outlive the handler that constructed it.
    pub fn chat_stream(
        self: std::sync::Arc<Self>,
        prompt: String,
        request_id: String,
        model_id: String,
    ) -> impl futures_util::Stream<Item = ChatChunk> + 'static {
        async_stream::stream! {
            let Some(endpoint) = self.next_endpoint().map(str::to_string) else { return };
            let url = format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'));
            let payload = ChatRequestPayload {
                model: &model_id,
                messages: vec![ChatRequestMessage { role: "user", content: &prompt }],
                stream: true,
            };

            let response = match self.client.post(&url).json(&payload).timeout(UPSTREAM_TIMEOUT).send().await {
                Ok(r) => r,
                Err(_) => return,
            };

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();

            if content_type.contains("application/json") {
                if let Ok(parsed) = response.json::<ChatCompletionResponse>().await {
                    if let Some(choice) = parsed.choices.into_iter().next() {
                        let content = choice.message.content.trim().to_string();
                        yield ChatChunk {
                            id: request_id,
                            object: "chat.completion.chunk".to_string(),
                            model: model_id,
                            choices: vec![ChatChunkChoice {
                                index: 0,
                                delta: ChatChoiceDelta { role: Some("assistant".to_string()), content: Some(content) },
                                finish_reason: Some("stop".to_string()),
                            }],
                        };
                    }
                }
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let Ok(bytes) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" { return; }
                    let Ok(mut value) = serde_json::from_str::<Value>(data) else { continue };
                    if let Value::Object(ref mut obj) = value {
                        obj.insert("id".to_string(), Value::String(request_id.clone()));
                        let needs_model = obj.get("model").map(|m| m.is_null() || m == &Value::String(String::new())).unwrap_or(true);
                        if needs_model {
                            obj.insert("model".to_string(), Value::String(model_id.clone()));
                        }
                    }
                    if let Ok(parsed) = serde_json::from_value::<ChatChunk>(value) {
                        yield parsed;
                    }
                }
            }
        }
    }
}
