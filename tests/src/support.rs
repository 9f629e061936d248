use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sandbox::agent::{FunctionCall, ToolCall};
use sandbox::run::DEFAULT_MAX_OUTPUT_BYTES;
use sandbox::{
    ChatMessage, ChatModel, DataAccess, FsConfig, ProjectRoot, Role, RunConfig, SandboxError,
    SandboxFs, SandboxRun, ToolDefinition, ToolRegistry, Toolbox,
};
use serde_json::Value;
use tempfile::{tempdir, TempDir};

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

/// Builds the full tool set over `root` with no database attached.
pub fn toolbox_for(root: &Path, timeout: Option<Duration>) -> Result<Arc<Toolbox>> {
    let root = ProjectRoot::new(root)?;
    let fs = SandboxFs::new(FsConfig::new(root.clone()));
    let run = SandboxRun::new(RunConfig::new(root, timeout, DEFAULT_MAX_OUTPUT_BYTES)?);
    Ok(Arc::new(Toolbox::new(fs, run, DataAccess::disabled())))
}

pub fn registry_for(root: &Path) -> Result<Arc<ToolRegistry>> {
    let toolbox = toolbox_for(root, Some(Duration::from_secs(10)))?;
    Ok(Arc::new(ToolRegistry::new(toolbox)))
}

/// A model that replays canned replies and records every prompt it saw.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ChatMessage>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> sandbox::Result<ChatMessage> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .ok_or_else(|| SandboxError::AgentFailed("script exhausted".to_string()))
    }
}

pub fn tool_request(calls: Vec<(&str, &str, Value)>) -> ChatMessage {
    let calls = calls
        .into_iter()
        .map(|(id, name, arguments)| ToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        })
        .collect();
    ChatMessage {
        role: Role::Assistant,
        content: None,
        tool_calls: Some(calls),
        tool_call_id: None,
    }
}
