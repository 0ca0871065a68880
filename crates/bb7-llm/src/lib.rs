//! HTTP+SSE transport to the LLM provider. Every blocking I/O call here
//! carries a 30s timeout except the streaming chat request, which is
//! open-ended and relies on caller-signalled cancellation instead (checked
//! once per SSE line, the same per-iteration-poll texture the rest of the
//! backend uses for cancellable loops).

use bb7_core::Usage;
use bb7_errors::{BbError, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SIMPLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub api_key: String,
    pub allow_training: bool,
    pub allow_data_retention: bool,
    pub explicit_cache_key: Option<String>,
}

impl TransportConfig {
    pub fn from_config(cfg: &bb7_core::Config) -> Self {
        TransportConfig {
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            allow_training: cfg.allow_training,
            allow_data_retention: cfg.allow_data_retention,
            explicit_cache_key: cfg.explicit_cache_key.clone(),
        }
    }
}

pub struct LlmClient {
    cfg: TransportConfig,
    simple_http: Client,
    stream_http: Client,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_message: String,
    pub reasoning_effort: Option<String>,
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallEvent {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Thinking(String),
    ToolCall(ToolCallEvent),
    /// Terminal event: either the stream ran to completion (`[DONE]` or EOF)
    /// or the caller cancelled it. `usage` is populated only on the former.
    Done { usage: Option<Usage> },
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl LlmClient {
    pub fn new(cfg: TransportConfig) -> Result<Self> {
        let simple_http = Client::builder()
            .timeout(SIMPLE_TIMEOUT)
            .build()
            .map_err(|e| BbError::transport(format!("could not build http client: {e}")))?;
        let stream_http = Client::builder()
            .build()
            .map_err(|e| BbError::transport(format!("could not build streaming http client: {e}")))?;
        Ok(LlmClient {
            cfg,
            simple_http,
            stream_http,
        })
    }

    fn provider_prefs(&self) -> Option<Value> {
        if self.cfg.allow_training && self.cfg.allow_data_retention {
            return None;
        }
        Some(json!({
            "allow_training": self.cfg.allow_training,
            "allow_data_retention": self.cfg.allow_data_retention,
        }))
    }

    fn build_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "stream": stream,
            "messages": [
                {"role": "system", "content": req.system_prompt},
                {"role": "user", "content": req.user_message},
            ],
        });
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        if let Some(effort) = &req.reasoning_effort {
            body["reasoning"] = json!({"effort": effort});
        }
        if let Some(prefs) = self.provider_prefs() {
            body["provider"] = prefs;
        }
        if let Some(key) = &self.cfg.explicit_cache_key {
            body["cache_key"] = json!(key);
        }
        body
    }

    /// Open a streaming chat completion, invoking `on_event` for each
    /// content/thinking/tool_call delta and exactly one terminal `Done`.
    /// `cancel` is polled once per SSE line; when set, the loop stops and
    /// `Done { usage: None }` is emitted with whatever was already seen.
    pub fn chat_stream(
        &self,
        req: &ChatRequest,
        cancel: &AtomicBool,
        mut on_event: impl FnMut(StreamEvent),
    ) -> Result<()> {
        let payload = self.build_payload(req, true);
        let url = format!("{}/chat/completions", self.cfg.base_url);
        let response = self
            .stream_http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&payload)
            .send()
            .map_err(|e| BbError::transport(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(BbError::transport(format!("provider returned {status}: {body}")));
        }

        let mut tool_calls: BTreeMap<u64, PendingToolCall> = BTreeMap::new();
        let mut usage: Option<Usage> = None;
        let reader = std::io::BufReader::new(response);

        for line in reader.lines() {
            if cancel.load(Ordering::Relaxed) {
                on_event(StreamEvent::Done { usage: None });
                return Ok(());
            }
            let line = line.map_err(|e| BbError::transport(format!("stream read error: {e}")))?;
            let trimmed = line.trim();
            if !trimmed.starts_with("data:") {
                continue;
            }
            let chunk = trimmed.trim_start_matches("data:").trim();
            if chunk.is_empty() {
                continue;
            }
            if chunk == "[DONE]" {
                emit_completed_tool_calls(&mut tool_calls, &mut on_event);
                on_event(StreamEvent::Done { usage });
                return Ok(());
            }
            let value: Value = match serde_json::from_str(chunk) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(err) = value.get("error") {
                return Err(BbError::transport(format!("provider stream error: {err}")));
            }
            if let Some(u) = value.get("usage") {
                usage = parse_usage(u);
            }
            let Some(choice) = value.get("choices").and_then(Value::as_array).and_then(|a| a.first()) else {
                continue;
            };
            let Some(delta) = choice.get("delta") else { continue };
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    on_event(StreamEvent::Content(content.to_string()));
                }
            }
            if let Some(reasoning) = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(Value::as_str)
            {
                if !reasoning.is_empty() {
                    on_event(StreamEvent::Thinking(reasoning.to_string()));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                merge_tool_call_fragments(calls, &mut tool_calls);
            }
        }

        // Stream ended without an explicit [DONE] frame.
        emit_completed_tool_calls(&mut tool_calls, &mut on_event);
        on_event(StreamEvent::Done { usage });
        Ok(())
    }

    /// `simple-chat`: a single non-streaming completion, used for title
    /// generation.
    pub fn simple_chat(&self, model: &str, system_prompt: &str, user_message: &str) -> Result<String> {
        let req = ChatRequest {
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            user_message: user_message.to_string(),
            reasoning_effort: None,
            tools: Vec::new(),
        };
        let payload = self.build_payload(&req, false);
        let url = format!("{}/chat/completions", self.cfg.base_url);
        let response = self
            .simple_http
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&payload)
            .send()
            .map_err(|e| BbError::transport(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(BbError::transport(format!("provider returned {status}: {body}")));
        }
        let body: Value = response
            .json()
            .map_err(|e| BbError::transport(format!("could not parse response: {e}")))?;
        body.get("choices")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BbError::transport("response had no message content"))
    }

    pub fn get_balance(&self) -> Result<Balance> {
        let url = format!("{}/credits", self.cfg.base_url);
        let response = self
            .simple_http
            .get(&url)
            .bearer_auth(&self.cfg.api_key)
            .send()
            .map_err(|e| BbError::transport(format!("request failed: {e}")))?;
        response
            .json()
            .map_err(|e| BbError::transport(format!("could not parse balance: {e}")))
    }

    pub fn get_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.cfg.base_url);
        let response = self
            .simple_http
            .get(&url)
            .bearer_auth(&self.cfg.api_key)
            .send()
            .map_err(|e| BbError::transport(format!("request failed: {e}")))?;
        let body: Value = response
            .json()
            .map_err(|e| BbError::transport(format!("could not parse models: {e}")))?;
        let list = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(list
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

fn merge_tool_call_fragments(calls: &[Value], out: &mut BTreeMap<u64, PendingToolCall>) {
    for call in calls {
        let Some(index) = call.get("index").and_then(Value::as_u64) else {
            continue;
        };
        let entry = out.entry(index).or_default();
        if let Some(id) = call.get("id").and_then(Value::as_str) {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = call.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                entry.arguments.push_str(args);
            }
        }
    }
}

fn emit_completed_tool_calls(
    pending: &mut BTreeMap<u64, PendingToolCall>,
    on_event: &mut impl FnMut(StreamEvent),
) {
    for (index, call) in std::mem::take(pending) {
        if call.name.trim().is_empty() {
            continue;
        }
        on_event(StreamEvent::ToolCall(ToolCallEvent {
            id: call.id.unwrap_or_else(|| format!("call_{index}")),
            name: call.name,
            arguments: call.arguments,
        }));
    }
}

fn parse_usage(value: &Value) -> Option<Usage> {
    Some(Usage {
        prompt: value.get("prompt_tokens").and_then(Value::as_u64)?,
        completion: value.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        cached: value
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64),
        cost: value.get("cost").and_then(Value::as_f64),
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Balance {
    #[serde(default)]
    pub total_credits: f64,
    #[serde(default)]
    pub total_usage: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub pricing: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_tool_call_fragments_across_chunks() {
        let mut pending = BTreeMap::new();
        merge_tool_call_fragments(
            &[json!({"index": 0, "id": "call_1", "function": {"name": "edit_file", "arguments": "{\"path\":\"a."}})],
            &mut pending,
        );
        merge_tool_call_fragments(
            &[json!({"index": 0, "function": {"arguments": "rs\"}"}})],
            &mut pending,
        );
        assert_eq!(pending[&0].arguments, "{\"path\":\"a.rs\"}");
        assert_eq!(pending[&0].name, "edit_file");
    }

    #[test]
    fn emits_one_event_per_completed_call_and_drops_empty_names() {
        let mut pending = BTreeMap::new();
        pending.insert(0, PendingToolCall { id: Some("x".into()), name: "write_file".into(), arguments: "{}".into() });
        pending.insert(1, PendingToolCall::default());
        let mut events = Vec::new();
        emit_completed_tool_calls(&mut pending, &mut |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::ToolCall(c) if c.name == "write_file"));
    }

    #[test]
    fn usage_parses_cached_and_cost_when_present() {
        let v = json!({"prompt_tokens": 100, "completion_tokens": 20, "cost": 0.01, "prompt_tokens_details": {"cached_tokens": 40}});
        let usage = parse_usage(&v).unwrap();
        assert_eq!(usage.prompt, 100);
        assert_eq!(usage.cached, Some(40));
        assert_eq!(usage.cost, Some(0.01));
    }
}
