use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use gembot_core::types::{Intent, Role, SegmentOutcome};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::llm_gateway::{
    Citation, Content, FunctionCall, FunctionDeclaration, FunctionResponse, GenerateConfig,
    GenerateRequest, GenerateResponse, LlmBackend, LlmError, Part, Tool, ToolMode,
};
use crate::segment_tool::SegmentationTool;

pub(crate) const SEGMENT_TOOL_NAME: &str = "segment_image";

/// What one executor produced for the current exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StrategyOutput {
    pub(crate) text: String,
    pub(crate) files: Vec<PathBuf>,
}

impl StrategyOutput {
    fn from_response(resp: GenerateResponse) -> Self {
        Self {
            text: resp.text.unwrap_or_default(),
            files: Vec::new(),
        }
    }
}

/// Inputs shared by every executor.
#[derive(Debug, Clone)]
pub(crate) struct Exchange<'a> {
    /// Trusted id of the chat this exchange belongs to.
    pub(crate) contact_id: &'a str,
    /// History followed by the current user turn.
    pub(crate) contents: Vec<Content>,
    pub(crate) system_instruction: String,
}

enum ToolRound {
    AwaitingToolDecision,
    ExecutingTools(GenerateResponse),
    AwaitingFinalAnswer {
        decision: Content,
        responses: Vec<FunctionResponse>,
        outcomes: Vec<SegmentOutcome>,
    },
    Done(StrategyOutput),
}

pub(crate) struct StrategyExecutor {
    backend: Arc<dyn LlmBackend>,
    tool: Arc<dyn SegmentationTool>,
    model: String,
    google_search: bool,
}

impl StrategyExecutor {
    pub(crate) fn new(
        backend: Arc<dyn LlmBackend>,
        tool: Arc<dyn SegmentationTool>,
        model: impl Into<String>,
        google_search: bool,
    ) -> Self {
        Self {
            backend,
            tool,
            model: model.into(),
            google_search,
        }
    }

    pub(crate) async fn execute(
        &self,
        intent: Intent,
        exchange: &Exchange<'_>,
    ) -> Result<StrategyOutput, LlmError> {
        match intent {
            Intent::GeneralConversation => self.general(exchange).await,
            Intent::FunctionCall => {
                self.function_call(exchange, exchange.contents.clone()).await
            }
            Intent::Grounding | Intent::Hybrid if !self.google_search => {
                info!("google search disabled, {} handled as general conversation", intent);
                self.general(exchange).await
            }
            Intent::Grounding => self.grounding(exchange).await,
            Intent::Hybrid => self.hybrid(exchange).await,
        }
    }

    async fn general(&self, exchange: &Exchange<'_>) -> Result<StrategyOutput, LlmError> {
        let resp = self
            .backend
            .generate(self.request(
                "general_conversation",
                exchange.contents.clone(),
                exchange,
                Vec::new(),
                None,
            ))
            .await?;
        Ok(StrategyOutput::from_response(resp))
    }

    // Search only; no function declarations, so the model cannot call local tools.
    async fn grounding(&self, exchange: &Exchange<'_>) -> Result<StrategyOutput, LlmError> {
        let resp = self
            .backend
            .generate(self.request(
                "grounding",
                exchange.contents.clone(),
                exchange,
                vec![Tool::GoogleSearch],
                None,
            ))
            .await?;
        let citations = resp.citations.clone();
        let mut out = StrategyOutput::from_response(resp);
        out.text = append_citations(&out.text, &citations);
        Ok(out)
    }

    async fn hybrid(&self, exchange: &Exchange<'_>) -> Result<StrategyOutput, LlmError> {
        let background = self.grounding(exchange).await?;
        info!(
            "hybrid background ready contact={} chars={}",
            exchange.contact_id,
            background.text.chars().count()
        );
        let contents = with_background(exchange.contents.clone(), &background.text);
        self.function_call(exchange, contents).await
    }

    async fn function_call(
        &self,
        exchange: &Exchange<'_>,
        contents: Vec<Content>,
    ) -> Result<StrategyOutput, LlmError> {
        let tools = vec![Tool::Functions(vec![segment_declaration()])];
        let mut state = ToolRound::AwaitingToolDecision;
        loop {
            state = match state {
                ToolRound::AwaitingToolDecision => {
                    let resp = self
                        .backend
                        .generate(self.request(
                            "function_call",
                            contents.clone(),
                            exchange,
                            tools.clone(),
                            Some(ToolMode::Auto),
                        ))
                        .await?;
                    if resp.function_calls.is_empty() {
                        ToolRound::Done(StrategyOutput::from_response(resp))
                    } else {
                        ToolRound::ExecutingTools(resp)
                    }
                }
                ToolRound::ExecutingTools(resp) => {
                    let mut responses = Vec::new();
                    let mut outcomes = Vec::new();
                    for call in &resp.function_calls {
                        if let Some(outcome) = self.invoke_tool(exchange.contact_id, call).await {
                            responses.push(FunctionResponse {
                                name: call.name.clone(),
                                response: serde_json::to_value(&outcome).unwrap_or(Value::Null),
                            });
                            outcomes.push(outcome);
                        }
                    }
                    match resp.model_content.clone() {
                        Some(decision) if !responses.is_empty() => ToolRound::AwaitingFinalAnswer {
                            decision,
                            responses,
                            outcomes,
                        },
                        _ => {
                            warn!(
                                "tool call produced no result, using first response contact={}",
                                exchange.contact_id
                            );
                            ToolRound::Done(StrategyOutput::from_response(resp))
                        }
                    }
                }
                ToolRound::AwaitingFinalAnswer {
                    mut decision,
                    responses,
                    outcomes,
                } => {
                    if decision.role.is_none() {
                        decision.role = Some(Role::Model.as_str().to_string());
                    }
                    let mut round_two = contents.clone();
                    round_two.push(decision);
                    round_two.push(Content::tool_responses(responses));
                    let resp = self
                        .backend
                        .generate(self.request(
                            "function_call_final",
                            round_two,
                            exchange,
                            tools.clone(),
                            Some(ToolMode::None),
                        ))
                        .await?;
                    let mut out = StrategyOutput::from_response(resp);
                    if out.text.trim().is_empty() {
                        out.text = outcomes
                            .iter()
                            .map(|o| o.message.as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                    }
                    out.files = outcomes.into_iter().flat_map(|o| o.generated_files).collect();
                    ToolRound::Done(out)
                }
                ToolRound::Done(out) => return Ok(out),
            };
        }
    }

    /// Runs one requested tool against the trusted contact id. `None` for tools we don't know.
    async fn invoke_tool(&self, contact_id: &str, call: &FunctionCall) -> Option<SegmentOutcome> {
        if call.name != SEGMENT_TOOL_NAME {
            warn!("model requested unknown tool name={}", call.name);
            return None;
        }
        let requested_chat = str_arg(&call.args, "chat_name");
        if !requested_chat.is_empty() && requested_chat != contact_id {
            warn!(
                "tool call chat_name ignored requested={} contact={}",
                requested_chat, contact_id
            );
        }
        let instruction = str_arg(&call.args, "user_prompt");
        info!("tool call name={} contact={} prompt={}", call.name, contact_id, instruction);
        Some(self.tool.segment(contact_id, instruction).await)
    }

    fn request(
        &self,
        purpose: &'static str,
        contents: Vec<Content>,
        exchange: &Exchange<'_>,
        tools: Vec<Tool>,
        tool_mode: Option<ToolMode>,
    ) -> GenerateRequest {
        GenerateRequest {
            purpose,
            model: self.model.clone(),
            contents,
            config: GenerateConfig {
                system_instruction: Some(exchange.system_instruction.clone()),
                tools,
                tool_mode,
                ..GenerateConfig::default()
            },
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("").trim()
}

pub(crate) fn segment_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: SEGMENT_TOOL_NAME.to_string(),
        description: "当用户想从图片中提取、抠出或分割某个物体时使用此工具。它会根据描述把物体从用户最近发送的图片中抠出来，生成透明背景的 PNG 文件。".to_string(),
        parameters: json!({
            "type": "OBJECT",
            "properties": {
                "chat_name": {
                    "type": "STRING",
                    "description": "当前聊天的名称"
                },
                "user_prompt": {
                    "type": "STRING",
                    "description": "需要抠出的物体描述，例如：把猫抠出来"
                }
            },
            "required": ["chat_name", "user_prompt"]
        }),
    }
}

fn append_citations(text: &str, citations: &[Citation]) -> String {
    let mut seen = HashSet::new();
    let unique: Vec<&Citation> = citations
        .iter()
        .filter(|c| seen.insert(c.uri.as_str()))
        .collect();
    if unique.is_empty() {
        return text.to_string();
    }
    let mut out = text.trim_end().to_string();
    out.push_str("\n\n参考来源：");
    for (i, c) in unique.iter().enumerate() {
        out.push_str(&format!("\n{}. {} - {}", i + 1, c.title, c.uri));
    }
    out
}

/// Adds search results to the current user turn so the tool round can use them.
fn with_background(mut contents: Vec<Content>, background: &str) -> Vec<Content> {
    if background.trim().is_empty() {
        return contents;
    }
    let note = Part::text(format!("\n\n[联网搜索得到的背景信息]\n{}", background.trim()));
    match contents.last_mut() {
        Some(last) if last.role.as_deref() == Some(Role::User.as_str()) => last.parts.push(note),
        _ => contents.push(Content::user(vec![note])),
    }
    contents
}
