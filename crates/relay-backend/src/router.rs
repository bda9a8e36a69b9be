//! Supplemental, optional multi-backend router: a config-driven
//! capability set `{generate(prompt, stream?)}` picked by a `type` tag
//! rather than runtime class discovery (see `SPEC_FULL.md` §11 and the
//! "Polymorphism over backends" design note). This sits alongside the
//! primary round-robin `BackendDispatcher`; it does not change the
//! Request Engine's per-item processing.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt as _;
use relay_common::config::RouterConfig;
use serde_json::{json, Value};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Modal,
    Vllm,
}

impl BackendKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "modal" => Some(Self::Modal),
            "vllm" => Some(Self::Vllm),
            _ => None,
        }
    }
}

/// A single named backend entry: a URL plus the capability tag that
/// selects its wire dialect. All three kinds currently speak the same
/// `/v1/chat/completions` dialect; the tag exists so deployments can
/// route by model id without the router doing runtime type discovery.
pub struct NamedBackend {
    pub kind: BackendKind,
    base_url: String,
    client: reqwest::Client,
}

impl NamedBackend {
    fn new(kind: BackendKind, url: &str) -> Self {
        Self {
            kind,
            base_url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn generate(&self, prompt: &str) -> Option<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = json!({
            "model": "default",
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        text_from_response(&body)
    }

    pub fn generate_stream<'a>(
        &'a self,
        prompt: &'a str,
    ) -> impl futures_util::Stream<Item = String> + 'a {
        async_stream::stream! {
            let url = format!("{}/v1/chat/completions", self.base_url);
            let payload = json!({
                "model": "default",
                "messages": [{"role": "user", "content": prompt}],
                "stream": true,
            });
            let response = match self.client.post(&url).json(&payload).timeout(DEFAULT_TIMEOUT).send().await {
                Ok(r) => r,
                Err(_) => return,
            };
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
                    let Ok(obj) = serde_json::from_str::<Value>(data) else { continue };
                    let Some(choices) = obj.get("choices").and_then(Value::as_array) else { continue };
                    for choice in choices {
                        let content = choice
                            .get("delta")
                            .and_then(|d| d.get("content"))
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .trim();
                        if !content.is_empty() {
                            yield content.to_string();
                        }
                    }
                }
            }
        }
    }
}

fn text_from_response(obj: &Value) -> Option<String> {
    if let Some(content) = obj.get("content").and_then(Value::as_str) {
        return Some(content.trim().to_string());
    }
    for choice in obj.get("choices").and_then(Value::as_array)? {
        let msg = choice
            .get("message")
            .or_else(|| choice.get("delta"))
            .unwrap_or(&Value::Null);
        let text = msg
            .get("content")
            .or_else(|| msg.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    None
}

pub struct Router {
    backends: HashMap<String, NamedBackend>,
    default_key: Option<String>,
}

impl Router {
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut backends = HashMap::new();
        for (name, entry) in &config.backends {
            let Some(kind) = BackendKind::parse(&entry.kind) else { continue };
            if entry.url.trim().is_empty() {
                continue;
            }
            backends.insert(name.clone(), NamedBackend::new(kind, &entry.url));
        }
        let mut default_key = config.default_backend.clone().filter(|k| !k.is_empty());
        if let Some(key) = &default_key {
            if !backends.contains_key(key) {
                default_key = backends.keys().next().cloned();
            }
        } else {
            default_key = backends.keys().next().cloned();
        }
        Self {
            backends,
            default_key,
        }
    }

    pub fn has_backends(&self) -> bool {
        !self.backends.is_empty()
    }

    pub fn get_backend(&self, model: Option<&str>) -> Option<&NamedBackend> {
        if self.backends.is_empty() {
            return None;
        }
        if let Some(model) = model {
            if let Some(backend) = self.backends.get(model) {
                return Some(backend);
            }
        }
        self.default_key.as_ref().and_then(|k| self.backends.get(k))
    }
}
