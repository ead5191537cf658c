//! Executor that runs an agent CLI as a subprocess and reads its
//! `stream-json` NDJSON output.

use std::process::Stdio;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::executor::{
    AgentExecutor, AgentMessage, AgentStream, ContentBlock, ExecutionRequest, Usage,
};
use crate::config::ExecutorConfig;
use crate::error::ExecutorError;

/// What a single output line means.
#[derive(Debug, PartialEq)]
enum Line {
    Message(AgentMessage),
    /// Final `result` line reporting success.
    Done,
    /// Final `result` line reporting failure.
    Failed(String),
    /// System and unknown lines.
    Ignored,
}

/// Spawns the configured agent binary once per task.
pub struct ProcessExecutor {
    config: ExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let options = &request.options;
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.extra_args)
            .arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(model) = options.model.as_ref().or(self.config.default_model.as_ref()) {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_turns) = options.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        if !options.mcp_servers.is_empty() {
            cmd.arg("--mcp-config")
                .arg(json!({ "mcpServers": options.mcp_servers }).to_string());
        }
        if let Some(key) = &options.api_key {
            cmd.env("ANTHROPIC_API_KEY", key.expose_secret());
        }
        if let Some(dir) = &options.working_directory {
            cmd.current_dir(dir);
        }

        cmd.env("RUNNER_TASK_ID", request.task_id.to_string())
            .env("RUNNER_REPOSITORY", &request.repository)
            .env("RUNNER_WORKER_ADDRESS", &request.worker_address);
        if let Some(branch) = &request.branch {
            cmd.env("RUNNER_BRANCH", branch);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentExecutor for ProcessExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<AgentStream, ExecutorError> {
        let mut child = self
            .command(&request)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed {
                reason: format!("{}: {e}", self.config.command),
            })?;

        info!(
            task_id = %request.task_id,
            command = %self.config.command,
            pid = ?child.id(),
            "Agent process started"
        );

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump(child_output(&mut child)?, child, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

struct ChildOutput {
    stdout: tokio::process::ChildStdout,
    stderr: tokio::task::JoinHandle<String>,
}

fn child_output(child: &mut Child) -> Result<ChildOutput, ExecutorError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::SpawnFailed {
            reason: "failed to capture stdout".to_string(),
        })?;

    let stderr = child.stderr.take();
    let stderr = tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("agent stderr: {line}");
                if !collected.is_empty() {
                    collected.push('\n');
                }
                collected.push_str(&line);
            }
        }
        collected
    });

    Ok(ChildOutput { stdout, stderr })
}

/// Forward parsed lines until EOF, a final `result`, or the consumer going
/// away. Dropping `child` on return kills the process if still running.
async fn pump(
    output: ChildOutput,
    mut child: Child,
    tx: mpsc::Sender<Result<AgentMessage, ExecutorError>>,
) {
    let mut lines = BufReader::new(output.stdout).lines();
    let mut finished = false;

    loop {
        let line = tokio::select! {
            _ = tx.closed() => {
                debug!("Agent stream dropped, stopping process");
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(ExecutorError::Io(e))).await;
                return;
            }
        };

        match parse_line(&line) {
            Line::Message(message) => {
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Line::Done => finished = true,
            Line::Failed(message) => {
                let _ = tx.send(Err(ExecutorError::Failed { message })).await;
                return;
            }
            Line::Ignored => {}
        }
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            let _ = tx.send(Err(ExecutorError::Io(e))).await;
            return;
        }
    };
    let stderr = output.stderr.await.unwrap_or_default();

    if !status.success() {
        warn!(code = ?status.code(), "Agent process exited with failure");
        let _ = tx
            .send(Err(ExecutorError::Exited {
                code: status.code(),
                stderr,
            }))
            .await;
    } else if !finished {
        debug!("Agent process exited without a result line");
    }
}

/// Parse one NDJSON line. Malformed lines are logged and ignored.
fn parse_line(line: &str) -> Line {
    let line = line.trim();
    if line.is_empty() {
        return Line::Ignored;
    }

    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Skipping non-JSON agent output line");
            return Line::Ignored;
        }
    };

    match raw.get("type").and_then(Value::as_str) {
        Some("assistant") | Some("user") => {
            let msg = raw.get("message").unwrap_or(&raw);
            let blocks = parse_blocks(msg.get("content"));
            let usage = msg
                .get("usage")
                .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());
            if blocks.is_empty() && usage.is_none() {
                return Line::Ignored;
            }
            Line::Message(AgentMessage { blocks, usage })
        }
        Some("result") => {
            let is_error = raw.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let subtype = raw.get("subtype").and_then(Value::as_str).unwrap_or("");
            if is_error || subtype.starts_with("error") {
                let message = raw
                    .get("result")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(subtype);
                Line::Failed(message.to_string())
            } else {
                Line::Done
            }
        }
        _ => Line::Ignored,
    }
}

fn parse_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(items)) => items.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type")?.as_str()? {
        "text" => Some(ContentBlock::Text {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: block.get("id")?.as_str()?.to_string(),
            name: block.get("name")?.as_str()?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
            content: tool_result_text(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        _ => None,
    }
}

/// Tool results carry either a string or a list of text parts.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
