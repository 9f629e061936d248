use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::db::DataAccess;
use crate::errors::{Result, SandboxError};
use crate::fs::SandboxFs;
use crate::run::SandboxRun;

/// Everything the tools operate on, built once at startup and shared.
#[derive(Clone, Debug)]
pub struct Toolbox {
    fs: SandboxFs,
    run: SandboxRun,
    data: DataAccess,
}

impl Toolbox {
    pub fn new(fs: SandboxFs, run: SandboxRun, data: DataAccess) -> Self {
        Self { fs, run, data }
    }

    pub fn fs(&self) -> &SandboxFs {
        &self.fs
    }

    pub fn run(&self) -> &SandboxRun {
        &self.run
    }

    pub fn data(&self) -> &DataAccess {
        &self.data
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String>;
}

pub struct Tool {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    error_prefix: &'static str,
    handler: Arc<dyn ToolHandler>,
}

impl Tool {
    fn new(
        name: &'static str,
        description: &'static str,
        parameters: Value,
        error_prefix: &'static str,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name,
            description,
            parameters,
            error_prefix,
            handler: Arc::new(handler),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.parameters.clone(),
        }
    }

    fn describe_error(&self, err: &SandboxError) -> String {
        match err {
            SandboxError::Configuration(_) => format!("Error: {err}"),
            _ => format!("{}: {err}", self.error_prefix),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub tool: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn error(tool: &str, content: String) -> Self {
        Self {
            tool: tool.to_string(),
            content,
            is_error: true,
        }
    }
}

/// The fixed, ordered set of tools handed to the agent runtime.
pub struct ToolRegistry {
    toolbox: Arc<Toolbox>,
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new(toolbox: Arc<Toolbox>) -> Self {
        Self {
            toolbox,
            tools: builtin_tools(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|tool| tool.name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(Tool::definition).collect()
    }

    /// Runs a tool and flattens every failure into its text result.
    ///
    /// The handler runs on its own task, so it completes even if the caller
    /// stops waiting.
    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "unknown tool requested");
            let err = SandboxError::UnknownTool(name.to_string());
            return ToolOutput::error(name, format!("Error: {err}"));
        };
        info!(tool = name, "tool invoked");
        debug!(tool = name, %arguments, "tool arguments");

        let handler = Arc::clone(&tool.handler);
        let toolbox = Arc::clone(&self.toolbox);
        let outcome = tokio::spawn(async move { handler.call(toolbox, arguments).await }).await;

        match outcome {
            Ok(Ok(content)) => {
                info!(tool = name, bytes = content.len(), "tool succeeded");
                ToolOutput {
                    tool: name.to_string(),
                    content,
                    is_error: false,
                }
            }
            Ok(Err(err)) => {
                warn!(tool = name, %err, "tool failed");
                ToolOutput::error(name, tool.describe_error(&err))
            }
            Err(join) => {
                warn!(tool = name, %join, "tool task aborted");
                ToolOutput::error(name, format!("{}: tool task aborted", tool.error_prefix))
            }
        }
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    // Models sometimes send `null` for tools without parameters.
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|err| SandboxError::InvalidArguments(format!("invalid arguments: {err}")))
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| SandboxError::Io(std::io::Error::other(err.to_string())))?
}

fn builtin_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            "read_file",
            "Reads the content of a file in the project. The path must be relative to the project root.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "File path relative to the project root" }
                },
                "required": ["file_path"]
            }),
            "Error reading file",
            ReadFile,
        ),
        Tool::new(
            "write_file",
            "Creates or overwrites a file. Use this when writing code.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "File path relative to the project root" },
                    "content": { "type": "string", "description": "Full file content to write" }
                },
                "required": ["file_path", "content"]
            }),
            "Error writing file",
            WriteFile,
        ),
        Tool::new(
            "list_files",
            "Lists the files in a directory. With recursive=true the whole subtree is listed, \
             skipping large folders such as node_modules and .git.",
            json!({
                "type": "object",
                "properties": {
                    "directory_path": { "type": "string", "description": "Directory relative to the project root", "default": "." },
                    "recursive": { "type": "boolean", "description": "Include subdirectories", "default": false }
                }
            }),
            "Error listing files",
            ListFiles,
        ),
        Tool::new(
            "find_files_by_name",
            "Finds files anywhere in the project whose name matches a pattern \
             (e.g. '*.tsx', '*Chat*', '*.css'). Useful to locate UI files or specific logic.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Shell-style file name pattern" }
                },
                "required": ["pattern"]
            }),
            "Error finding files",
            FindFilesByName,
        ),
        Tool::new(
            "run_test",
            "Runs a test command such as `npm test` or `pytest` from the project root.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to run" }
                },
                "required": ["command"]
            }),
            "Error running test",
            RunTest,
        ),
        Tool::new(
            "get_db_schema",
            "Returns the database tables and their column definitions.",
            json!({ "type": "object", "properties": {} }),
            "Error getting schema",
            GetDbSchema,
        ),
        Tool::new(
            "run_sql_query",
            "Runs a SQL query and returns the rows. Prefer SELECT statements.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "SQL to execute" }
                },
                "required": ["query"]
            }),
            "SQL Error",
            RunSqlQuery,
        ),
    ]
}

#[derive(Deserialize)]
struct FilePathArgs {
    file_path: String,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    file_path: String,
    content: String,
}

#[derive(Deserialize)]
struct ListFilesArgs {
    #[serde(default = "current_dir")]
    directory_path: String,
    #[serde(default)]
    recursive: bool,
}

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Deserialize)]
struct PatternArgs {
    pattern: String,
}

#[derive(Deserialize)]
struct CommandArgs {
    command: String,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

#[derive(Deserialize)]
struct NoArgs {}

struct ReadFile;
struct WriteFile;
struct ListFiles;
struct FindFilesByName;
struct RunTest;
struct GetDbSchema;
struct RunSqlQuery;

#[async_trait]
impl ToolHandler for ReadFile {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let args: FilePathArgs = parse_args(arguments)?;
        blocking(move || toolbox.fs().read_file(&args.file_path)).await
    }
}

#[async_trait]
impl ToolHandler for WriteFile {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let args: WriteFileArgs = parse_args(arguments)?;
        blocking(move || toolbox.fs().write_file(&args.file_path, &args.content)).await
    }
}

#[async_trait]
impl ToolHandler for ListFiles {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let args: ListFilesArgs = parse_args(arguments)?;
        blocking(move || toolbox.fs().list_files(&args.directory_path, args.recursive)).await
    }
}

#[async_trait]
impl ToolHandler for FindFilesByName {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let args: PatternArgs = parse_args(arguments)?;
        blocking(move || toolbox.fs().find_files_by_name(&args.pattern)).await
    }
}

#[async_trait]
impl ToolHandler for RunTest {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let args: CommandArgs = parse_args(arguments)?;
        toolbox.run().run_test(&args.command).await
    }
}

#[async_trait]
impl ToolHandler for GetDbSchema {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let NoArgs {} = parse_args(arguments)?;
        toolbox.data().get_db_schema().await
    }
}

#[async_trait]
impl ToolHandler for RunSqlQuery {
    async fn call(&self, toolbox: Arc<Toolbox>, arguments: Value) -> Result<String> {
        let args: QueryArgs = parse_args(arguments)?;
        toolbox.data().run_sql_query(&args.query).await
    }
}
