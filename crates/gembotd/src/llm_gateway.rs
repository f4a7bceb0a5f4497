use std::fs::{OpenOptions, create_dir_all};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gembot_core::config::AppConfig;
use gembot_core::types::{Role, Turn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{now_ts_u64, truncate_for_log};

#[derive(Debug, Error)]
pub(crate) enum LlmError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("response blocked: {0}")]
    Blocked(String),
    #[error("decode response failed: {0}")]
    Decode(String),
}

/// The external multimodal model. One call, no retries.
#[async_trait]
pub(crate) trait LlmBackend: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, LlmError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) role: Option<String>,
    #[serde(default)]
    pub(crate) parts: Vec<Part>,
}

impl Content {
    pub(crate) fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some(Role::User.as_str().to_string()),
            parts,
        }
    }

    pub(crate) fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    pub(crate) fn from_turn(turn: &Turn) -> Self {
        Self {
            role: Some(turn.role.as_str().to_string()),
            parts: turn.parts.iter().map(|p| Part::text(p.text.clone())).collect(),
        }
    }

    // The generateContent API carries function responses in a user-role turn.
    pub(crate) fn tool_responses(responses: Vec<FunctionResponse>) -> Self {
        Self::user(
            responses
                .into_iter()
                .map(|r| Part {
                    function_response: Some(r),
                    ..Part::default()
                })
                .collect(),
        )
    }

    /// Visible text of this content, thought parts excluded.
    pub(crate) fn text(&self) -> String {
        let mut merged = String::new();
        for part in &self.parts {
            if part.thought == Some(true) {
                continue;
            }
            if let Some(t) = &part.text {
                merged.push_str(t);
            }
        }
        merged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) thought_signature: Option<String>,
}

impl Part {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub(crate) fn inline(mime_type: impl Into<String>, data_b64: impl Into<String>) -> Self {
        Self {
            inline_data: Some(Blob {
                mime_type: mime_type.into(),
                data: data_b64.into(),
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Blob {
    pub(crate) mime_type: String,
    pub(crate) data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FunctionCall {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FunctionResponse {
    pub(crate) name: String,
    pub(crate) response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct FunctionDeclaration {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tool {
    Functions(Vec<FunctionDeclaration>),
    GoogleSearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolMode {
    Auto,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct GenerateConfig {
    pub(crate) system_instruction: Option<String>,
    pub(crate) tools: Vec<Tool>,
    pub(crate) tool_mode: Option<ToolMode>,
    pub(crate) response_format: ResponseFormat,
    pub(crate) temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GenerateRequest {
    /// Short tag used only for logging.
    pub(crate) purpose: &'static str,
    pub(crate) model: String,
    pub(crate) contents: Vec<Content>,
    pub(crate) config: GenerateConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Citation {
    pub(crate) title: String,
    pub(crate) uri: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct GenerateResponse {
    pub(crate) text: Option<String>,
    pub(crate) function_calls: Vec<FunctionCall>,
    /// Candidate 0 content, replayed verbatim in the next round.
    pub(crate) model_content: Option<Content>,
    pub(crate) citations: Vec<Citation>,
}

impl GenerateResponse {
    pub(crate) fn from_model_content(content: Content) -> Self {
        let text = Some(content.text()).filter(|t| !t.is_empty());
        let function_calls = content
            .parts
            .iter()
            .filter_map(|p| p.function_call.clone())
            .collect();
        Self {
            text,
            function_calls,
            model_content: Some(content),
            citations: Vec::new(),
        }
    }

    pub(crate) fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

pub(crate) fn build_request_body(req: &GenerateRequest) -> Value {
    let mut body = json!({ "contents": req.contents });
    let cfg = &req.config;
    if let Some(system) = cfg.system_instruction.as_deref().filter(|s| !s.trim().is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if !cfg.tools.is_empty() {
        let tools = cfg
            .tools
            .iter()
            .map(|tool| match tool {
                Tool::Functions(decls) => json!({ "functionDeclarations": decls }),
                Tool::GoogleSearch => json!({ "googleSearch": {} }),
            })
            .collect::<Vec<_>>();
        body["tools"] = Value::Array(tools);
    }
    if let Some(mode) = cfg.tool_mode {
        let mode = match mode {
            ToolMode::Auto => "AUTO",
            ToolMode::None => "NONE",
        };
        body["toolConfig"] = json!({ "functionCallingConfig": { "mode": mode } });
    }
    let mut generation = serde_json::Map::new();
    if let Some(t) = cfg.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if cfg.response_format == ResponseFormat::Json {
        generation.insert("responseMimeType".to_string(), json!("application/json"));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

pub(crate) fn parse_response_body(value: &Value) -> Result<GenerateResponse, LlmError> {
    if let Some(block_reason) = value
        .get("promptFeedback")
        .and_then(|v| v.get("blockReason"))
        .and_then(|v| v.as_str())
    {
        return Err(LlmError::Blocked(format!("blockReason={block_reason}")));
    }

    let candidate = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| LlmError::Decode("missing candidates[0]".to_string()))?;

    if let Some(finish_reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        match finish_reason {
            "MAX_TOKENS" => {
                warn!("gemini response truncated: finishReason=MAX_TOKENS");
            }
            "SAFETY" | "RECITATION" => {
                return Err(LlmError::Blocked(format!("finishReason={finish_reason}")));
            }
            _ => {}
        }
    }

    let content = match candidate.get("content") {
        Some(raw) => serde_json::from_value::<Content>(raw.clone())
            .map_err(|err| LlmError::Decode(format!("candidates[0].content: {err}")))?,
        None => Content::default(),
    };
    let mut out = GenerateResponse::from_model_content(content);
    out.citations = parse_citations(candidate);
    Ok(out)
}

fn parse_citations(candidate: &Value) -> Vec<Citation> {
    let Some(chunks) = candidate
        .get("groundingMetadata")
        .and_then(|m| m.get("groundingChunks"))
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };
    chunks
        .iter()
        .filter_map(|chunk| {
            let web = chunk.get("web")?;
            let uri = web.get("uri").and_then(|v| v.as_str())?.trim().to_string();
            if uri.is_empty() {
                return None;
            }
            let title = web
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or(&uri)
                .trim()
                .to_string();
            Some(Citation { title, uri })
        })
        .collect()
}

pub(crate) struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    semaphore: Arc<Semaphore>,
    model_io_log: Option<PathBuf>,
}

impl GeminiClient {
    pub(crate) fn from_config(config: &AppConfig, workspace_root: &Path) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.llm.timeout_seconds.max(5)))
            .build()?;
        let model_io_log = config
            .logging
            .model_io_log
            .then(|| workspace_root.join(&config.logging.dir).join("model_io.log"));
        Ok(Self {
            client,
            base_url: config.llm.endpoint_base(),
            api_key: config.llm.api_key.trim().to_string(),
            semaphore: Arc::new(Semaphore::new(config.llm.max_concurrency.max(1))),
            model_io_log,
        })
    }

    async fn call(&self, req: &GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| LlmError::Transport(format!("semaphore closed: {err}")))?;

        let url = format!("{}/models/{}:generateContent", self.base_url, req.model);
        let body = build_request_body(req);
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Transport(format!("timeout: {err}"))
                } else {
                    LlmError::Transport(err.to_string())
                }
            })?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|err| LlmError::Transport(format!("read response failed: {err}")))?;
        if !status.is_success() {
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: truncate_for_log(&body_text),
            });
        }
        let value: Value = serde_json::from_str(&body_text)
            .map_err(|err| LlmError::Decode(format!("invalid json: {err}")))?;
        parse_response_body(&value)
    }

    fn append_model_io_log(
        &self,
        req: &GenerateRequest,
        status: &str,
        response: Option<&str>,
        error: Option<&str>,
    ) {
        let Some(file_path) = &self.model_io_log else {
            return;
        };
        if let Some(dir) = file_path.parent() {
            if let Err(err) = create_dir_all(dir) {
                warn!("create model io logs dir failed: {err}");
                return;
            }
        }
        let mut file = match OpenOptions::new().create(true).append(true).open(file_path) {
            Ok(f) => f,
            Err(err) => {
                warn!("open model io log file failed: {err}");
                return;
            }
        };
        let line = json!({
            "ts": now_ts_u64(),
            "purpose": req.purpose,
            "model": req.model,
            "status": status,
            "request": truncate_for_log(&request_preview(req)),
            "response": response.map(truncate_for_log),
            "error": error.map(truncate_for_log),
        })
        .to_string();
        if let Err(err) = writeln!(file, "{line}") {
            warn!("write model io log failed: {err}");
        }
    }
}

#[async_trait]
impl LlmBackend for GeminiClient {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        info!(
            "[LLM_CALL] stage=request purpose={} model={} contents={} request={}",
            req.purpose,
            req.model,
            req.contents.len(),
            truncate_for_log(&request_preview(&req))
        );
        match self.call(&req).await {
            Ok(resp) => {
                info!(
                    "[LLM_CALL] stage=response purpose={} model={} function_calls={} citations={} response={}",
                    req.purpose,
                    req.model,
                    resp.function_calls.len(),
                    resp.citations.len(),
                    truncate_for_log(resp.text_or_empty())
                );
                self.append_model_io_log(&req, "ok", Some(resp.text_or_empty()), None);
                Ok(resp)
            }
            Err(err) => {
                let err_text = err.to_string();
                warn!(
                    "[LLM_CALL] stage=error purpose={} model={} error={}",
                    req.purpose,
                    req.model,
                    truncate_for_log(&err_text)
                );
                self.append_model_io_log(&req, "failed", None, Some(&err_text));
                Err(err)
            }
        }
    }
}

/// Text of the last content in the request, inline data summarized.
fn request_preview(req: &GenerateRequest) -> String {
    let Some(last) = req.contents.last() else {
        return String::new();
    };
    last.parts
        .iter()
        .map(|p| {
            if let Some(t) = &p.text {
                t.clone()
            } else if let Some(blob) = &p.inline_data {
                format!("<inline {} {}b64>", blob.mime_type, blob.data.len())
            } else if let Some(fc) = &p.function_call {
                format!("<function_call {}>", fc.name)
            } else if let Some(fr) = &p.function_response {
                format!("<function_response {}>", fr.name)
            } else {
                String::new()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays queued responses in order and records every request.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<GenerateResponse, LlmError>>>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(responses: Vec<Result<GenerateResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn requests(&self) -> Vec<GenerateRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn purposes(&self) -> Vec<&'static str> {
            self.requests().iter().map(|r| r.purpose).collect()
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, LlmError> {
            self.requests.lock().unwrap().push(req);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(LlmError::Transport("no scripted response left".to_string()))
                })
        }
    }

    pub(crate) fn text_response(text: &str) -> Result<GenerateResponse, LlmError> {
        Ok(GenerateResponse::from_model_content(Content {
            role: Some("model".to_string()),
            parts: vec![Part::text(text)],
        }))
    }

    pub(crate) fn function_call_response(
        name: &str,
        args: Value,
    ) -> Result<GenerateResponse, LlmError> {
        Ok(GenerateResponse::from_model_content(Content {
            role: Some("model".to_string()),
            parts: vec![Part {
                function_call: Some(FunctionCall {
                    name: name.to_string(),
                    args,
                }),
                ..Part::default()
            }],
        }))
    }

    pub(crate) fn transport_error() -> Result<GenerateResponse, LlmError> {
        Err(LlmError::Transport("connection reset".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> GenerateRequest {
        GenerateRequest {
            purpose: "test",
            model: "gemini-2.5-flash".to_string(),
            contents: vec![Content::user_text("hi")],
            config: GenerateConfig {
                system_instruction: Some("be nice".to_string()),
                tools: vec![Tool::GoogleSearch],
                tool_mode: Some(ToolMode::None),
                response_format: ResponseFormat::Json,
                temperature: Some(0.0),
            },
        }
    }

    #[test]
    fn request_body_uses_wire_field_names() {
        let body = build_request_body(&sample_request());
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be nice");
        assert!(body["tools"][0]["googleSearch"].is_object());
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "NONE");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
    }

    #[test]
    fn request_body_omits_empty_sections() {
        let mut req = sample_request();
        req.config = GenerateConfig::default();
        let body = build_request_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("toolConfig").is_none());
        assert!(body.get("generationConfig").is_none());
        assert!(body.get("systemInstruction").is_none());
    }

    #[test]
    fn parses_function_calls_and_keeps_signature() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "thinking", "thought": true},
                        {"functionCall": {"name": "segment_image", "args": {"user_prompt": "cat"}},
                         "thoughtSignature": "sig"}
                    ]
                },
                "finishReason": "STOP"
            }]
        });
        let resp = parse_response_body(&raw).unwrap();
        assert_eq!(resp.text, None);
        assert_eq!(resp.function_calls.len(), 1);
        assert_eq!(resp.function_calls[0].args["user_prompt"], "cat");
        let replay = serde_json::to_value(resp.model_content.unwrap()).unwrap();
        assert_eq!(replay["parts"][1]["thoughtSignature"], "sig");
    }

    #[test]
    fn parses_citations_from_grounding_chunks() {
        let raw = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "sunny"}]},
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://a.example", "title": "A"}},
                    {"web": {"uri": ""}},
                    {"retrievedContext": {}}
                ]}
            }]
        });
        let resp = parse_response_body(&raw).unwrap();
        assert_eq!(resp.text.as_deref(), Some("sunny"));
        assert_eq!(
            resp.citations,
            vec![Citation {
                title: "A".to_string(),
                uri: "https://a.example".to_string()
            }]
        );
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let raw = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert!(matches!(parse_response_body(&raw), Err(LlmError::Blocked(_))));
        let raw = json!({"candidates": [{"finishReason": "SAFETY"}]});
        assert!(matches!(parse_response_body(&raw), Err(LlmError::Blocked(_))));
        let raw = json!({"candidates": []});
        assert!(matches!(parse_response_body(&raw), Err(LlmError::Decode(_))));
    }
}
