//! Sandboxed tool gateway for the chat agent.
//!
//! Every tool is confined to a single project root: filesystem access goes
//! through [`ProjectRoot::resolve`], commands run with the root as working
//! directory, and the optional database is injected once at startup. Tool
//! failures come back to the agent as text, never as errors.

pub mod agent;
pub mod db;
pub mod errors;
pub mod fs;
pub mod path;
pub mod registry;
pub mod run;

pub use agent::{
    AgentConfig, AgentReply, ChatAgent, ChatMessage, ChatModel, LlmConfig, OpenAiChatModel, Role,
    ToolObserver,
};
pub use db::{DataAccess, Database, DatabaseConfig};
pub use errors::{Result, SandboxError};
pub use fs::{FsConfig, IgnoreSet, SandboxFs};
pub use path::{ProjectRoot, TARGET_ROOT_ENV};
pub use registry::{Tool, ToolDefinition, ToolOutput, ToolRegistry, Toolbox};
pub use run::{RunConfig, RunOutput, SandboxRun};
