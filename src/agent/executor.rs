//! Executor seam: the opaque agent that turns a prompt into content blocks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ExecutorError;
use crate::tasks::TaskId;

/// One block of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Token usage reported with a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One agent turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentMessage {
    pub blocks: Vec<ContentBlock>,
    pub usage: Option<Usage>,
}

impl AgentMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::Text { text: text.into() }],
            usage: None,
        }
    }
}

pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentMessage, ExecutorError>> + Send>>;

/// Per-session settings carried from `configure` and `query` options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub api_key: Option<Arc<SecretString>>,
    pub mcp_servers: HashMap<String, Value>,
    pub working_directory: Option<PathBuf>,
}

/// Everything the executor needs for one run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub session_id: Option<String>,
    pub prompt: String,
    pub repository: String,
    pub branch: Option<String>,
    pub worker_address: String,
    pub options: ExecutionOptions,
}

/// Runs the agent. Dropping the returned stream must stop the run.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<AgentStream, ExecutorError>;
}

/// Replays a fixed list of messages. Handy for tests and for running the
/// server without an agent installed.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    messages: Vec<AgentMessage>,
    delay: Duration,
    start_error: Option<String>,
    stream_error: Option<String>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new(messages: Vec<AgentMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// `execute` itself fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            start_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Wait `delay` before each message.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// End the stream with an error after the scripted messages.
    pub fn with_stream_error(mut self, message: impl Into<String>) -> Self {
        self.stream_error = Some(message.into());
        self
    }

    /// Prompts received so far, in call order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    pub async fn calls(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<AgentStream, ExecutorError> {
        self.prompts.lock().await.push(request.prompt);
        if let Some(message) = &self.start_error {
            return Err(ExecutorError::Failed {
                message: message.clone(),
            });
        }

        let mut items: Vec<Result<AgentMessage, ExecutorError>> =
            self.messages.iter().cloned().map(Ok).collect();
        if let Some(message) = &self.stream_error {
            items.push(Err(ExecutorError::Failed {
                message: message.clone(),
            }));
        }

        let delay = self.delay;
        let stream = futures::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}
