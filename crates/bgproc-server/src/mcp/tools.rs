//! MCP tool surface: schemas for `tools/list` and dispatch for `tools/call`.
//!
//! Session conditions (not found, not running, driver failures) come back
//! as tool results with `isError: true`. Only malformed calls (unknown
//! tool, arguments of the wrong shape) are protocol errors.

use crate::service::{KillOutcome, SessionService};
use bgproc_core::messages::{RpcError, ToolCallParams, ToolSpec};
use bgproc_core::{ProcError, ToolResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const PROCESS_LIST: &str = "process_list";
pub const PROCESS_STATUS: &str = "process_status";
pub const PROCESS_LOG: &str = "process_log";
pub const PROCESS_KILL: &str = "process_kill";
pub const PROCESS_SEND_KEYS: &str = "process_send_keys";
pub const PROCESS_PASTE: &str = "process_paste";
pub const PROCESS_START: &str = "process_start";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogArgs {
    session_id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendKeysArgs {
    session_id: String,
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasteArgs {
    session_id: String,
    text: String,
    #[serde(default = "default_true")]
    bracketed: bool,
}

#[derive(Debug, Deserialize)]
struct StartArgs {
    command: String,
}

fn default_true() -> bool {
    true
}

/// Routes `tools/call` requests to the session service.
#[derive(Clone)]
pub struct ToolRouter {
    service: Arc<SessionService>,
}

impl ToolRouter {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }

    /// All tools as MCP tool specs.
    pub fn list_tools(&self) -> Vec<ToolSpec> {
        let session_id = json!({
            "type": "string",
            "description": "The session ID",
        });

        vec![
            tool(
                PROCESS_LIST,
                "List all running background process sessions",
                json!({ "type": "object", "properties": {} }),
            ),
            tool(
                PROCESS_STATUS,
                "Get detailed status of a specific process session",
                json!({
                    "type": "object",
                    "properties": { "sessionId": session_id },
                    "required": ["sessionId"],
                }),
            ),
            tool(
                PROCESS_LOG,
                "Get the output log from a process session",
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": session_id,
                        "limit": {
                            "type": "integer",
                            "description": "Maximum number of log entries",
                            "default": self.service.settings().default_limit,
                        },
                        "offset": {
                            "type": "integer",
                            "description": "Offset for pagination",
                            "default": 0,
                        },
                    },
                    "required": ["sessionId"],
                }),
            ),
            tool(
                PROCESS_KILL,
                "Terminate (kill) a running process session",
                json!({
                    "type": "object",
                    "properties": { "sessionId": session_id },
                    "required": ["sessionId"],
                }),
            ),
            tool(
                PROCESS_SEND_KEYS,
                "Send keystrokes to a running process session",
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": session_id,
                        "keys": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Array of key tokens to send (e.g. \"ls\", \"Enter\", \"C-c\")",
                        },
                    },
                    "required": ["sessionId", "keys"],
                }),
            ),
            tool(
                PROCESS_PASTE,
                "Paste text into a running process session",
                json!({
                    "type": "object",
                    "properties": {
                        "sessionId": session_id,
                        "text": { "type": "string", "description": "Text to paste" },
                        "bracketed": {
                            "type": "boolean",
                            "description": "Use bracketed paste mode",
                            "default": true,
                        },
                    },
                    "required": ["sessionId", "text"],
                }),
            ),
            tool(
                PROCESS_START,
                "Start a command as a new background process session",
                json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "Command line to run" },
                    },
                    "required": ["command"],
                }),
            ),
        ]
    }

    /// Call a tool with the given arguments.
    pub async fn call(&self, params: ToolCallParams) -> Result<ToolResult, RpcError> {
        debug!(tool = %params.name, "tool call");
        let service = &self.service;
        let arguments = params.arguments;

        let result = match params.name.as_str() {
            PROCESS_LIST => ToolResult::json(&service.list().await),
            PROCESS_STATUS => {
                let args: SessionArgs = parse_args(PROCESS_STATUS, arguments)?;
                match service.status(&args.session_id).await {
                    Ok(record) => ToolResult::json(&record),
                    Err(e) => failure(e),
                }
            }
            PROCESS_LOG => {
                let args: LogArgs = parse_args(PROCESS_LOG, arguments)?;
                let page = service
                    .fetch_log(&args.session_id, args.limit, args.offset)
                    .await;
                ToolResult::json(&page)
            }
            PROCESS_KILL => {
                let args: SessionArgs = parse_args(PROCESS_KILL, arguments)?;
                let id = &args.session_id;
                match service.kill(id).await {
                    Ok(KillOutcome::Terminated) => {
                        ToolResult::text(format!("Session '{id}' terminated successfully"))
                    }
                    Ok(KillOutcome::AlreadyEnded(status)) => {
                        ToolResult::text(format!("Session '{id}' is already {status}"))
                    }
                    Ok(KillOutcome::TerminateFailed(e)) => ToolResult::error(format!(
                        "Session '{id}' marked stopped, but terminating its process failed: {e}"
                    )),
                    Err(e) => failure(e),
                }
            }
            PROCESS_SEND_KEYS => {
                let args: SendKeysArgs = parse_args(PROCESS_SEND_KEYS, arguments)?;
                let id = &args.session_id;
                match service.send_keys(id, &args.keys).await {
                    Ok(()) => ToolResult::text(format!(
                        "Keys sent to session '{id}': {}",
                        args.keys.join(", ")
                    )),
                    Err(e) if e.is_driver_failure() => {
                        ToolResult::error(format!("Failed to send keys to session '{id}': {e}"))
                    }
                    Err(e) => failure(e),
                }
            }
            PROCESS_PASTE => {
                let args: PasteArgs = parse_args(PROCESS_PASTE, arguments)?;
                let id = &args.session_id;
                match service.paste(id, &args.text, args.bracketed).await {
                    Ok(()) => ToolResult::text(format!(
                        "Text pasted to session '{id}' (bracketed: {})",
                        args.bracketed
                    )),
                    Err(e) if e.is_driver_failure() => {
                        ToolResult::error(format!("Failed to paste into session '{id}': {e}"))
                    }
                    Err(e) => failure(e),
                }
            }
            PROCESS_START => {
                let args: StartArgs = parse_args(PROCESS_START, arguments)?;
                match service.spawn(&args.command).await {
                    Ok(record) => ToolResult::json(&record),
                    Err(e) => failure(e),
                }
            }
            other => {
                return Err(RpcError::invalid_params(format!("unknown tool: {other}")));
            }
        };

        Ok(result)
    }

    /// Number of registered tools.
    pub fn count(&self) -> usize {
        self.list_tools().len()
    }
}

fn tool(name: &str, description: &str, input_schema: Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, RpcError> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|e| RpcError::invalid_params(format!("invalid arguments for {tool}: {e}")))
}

fn failure(e: ProcError) -> ToolResult {
    ToolResult::error(e.to_string())
}
