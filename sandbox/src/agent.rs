use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, SandboxError};
use crate::registry::{ToolDefinition, ToolOutput, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable full-stack developer AI agent. \
Use the available tools (filesystem, database, terminal) to resolve the user's request. \
When changing code, read the file first and only then modify it. \
When asked about the database, inspect the schema first.";
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::text(Role::Tool, content)
        }
    }

    pub fn requested_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as sent by the model.
    #[serde(default)]
    pub arguments: String,
}

/// A language model that can answer or ask for tool calls.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
}

impl LlmConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Chat completions client for OpenAI-compatible endpoints.
pub struct OpenAiChatModel {
    http: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiChatModel {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| SandboxError::Network(err.to_string()))?;
        Ok(Self { http, config })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatMessage,
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: 0.0,
            tools: tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        };
        let mut req = self.http.post(url).json(&request);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|err| SandboxError::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            return Err(SandboxError::AgentFailed(format!(
                "llm request failed with status {status}: {body}"
            )));
        }
        let payload = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| {
                SandboxError::AgentFailed(format!("invalid llm response payload: {err}"))
            })?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| SandboxError::AgentFailed("llm returned no choices".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl AgentConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub response: String,
    pub tool_calls: Vec<ToolOutput>,
}

/// Called with every tool result as soon as the tool returns.
pub type ToolObserver = Arc<dyn Fn(&ToolOutput) + Send + Sync>;

/// Drives the model/tool loop for a single chat request.
#[derive(Clone)]
pub struct ChatAgent {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
    observer: Option<ToolObserver>,
}

impl ChatAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            registry,
            config,
            observer: None,
        }
    }

    /// Reports each tool call, including calls of a request that later fails.
    pub fn with_tool_observer(mut self, observer: ToolObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[instrument(skip_all, fields(history = history.len()))]
    pub async fn respond(&self, history: Vec<ChatMessage>, message: &str) -> Result<AgentReply> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        messages.extend(history);
        messages.push(ChatMessage::user(message));

        let tools = self.registry.definitions();
        let mut executed = Vec::new();

        for iteration in 0..self.config.max_iterations {
            let reply = self.model.complete(&messages, &tools).await?;
            let calls = reply.requested_calls().to_vec();
            if calls.is_empty() {
                info!(iteration, tool_calls = executed.len(), "agent finished");
                return Ok(AgentReply {
                    response: reply.content.unwrap_or_default(),
                    tool_calls: executed,
                });
            }
            debug!(iteration, requested = calls.len(), "model requested tools");
            messages.push(reply);
            for call in calls {
                let output = self.dispatch(&call).await;
                messages.push(ChatMessage::tool(call.id, output.content.clone()));
                if let Some(observer) = &self.observer {
                    observer(&output);
                }
                executed.push(output);
            }
        }

        warn!(limit = self.config.max_iterations, "agent hit iteration limit");
        Err(SandboxError::AgentFailed(format!(
            "no final answer after {} iterations",
            self.config.max_iterations
        )))
    }

    async fn dispatch(&self, call: &ToolCall) -> ToolOutput {
        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        match arguments {
            Ok(arguments) => self.registry.invoke(&call.function.name, arguments).await,
            Err(err) => ToolOutput {
                tool: call.function.name.clone(),
                content: format!(
                    "Error: invalid arguments for {}: {err}",
                    call.function.name
                ),
                is_error: true,
            },
        }
    }
}
