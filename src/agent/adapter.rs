//! Execution adapter: runs the executor for one task and turns its output
//! into protocol events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::classify;
use super::executor::{AgentExecutor, AgentMessage, ContentBlock, ExecutionRequest};
use crate::error::ExecutorError;
use crate::session::{
    ProgressStage, ResponseContent, ResponsePayload, ServerMessage, SessionLink, ToolResultPayload,
    ToolUsePayload,
};
use crate::tasks::{TaskId, TaskStatus};

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `Completed`, `Failed` or `Cancelled`.
    pub status: TaskStatus,
    pub turns: u32,
    pub tokens: u64,
    pub error: Option<String>,
    /// An `error` event already reached the session.
    pub error_reported: bool,
}

impl ExecutionOutcome {
    pub fn cancelled(turns: u32, tokens: u64) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            turns,
            tokens,
            error: Some("Cancelled".to_string()),
            error_reported: false,
        }
    }
}

/// Turn and token totals of a run. They stay readable after the run's
/// future is dropped.
#[derive(Debug, Default)]
pub struct RunCounters {
    turns: AtomicU32,
    tokens: AtomicU64,
}

impl RunCounters {
    pub fn turns(&self) -> u32 {
        self.turns.load(Ordering::Relaxed)
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

/// Wraps an executor with per-session limits and event conversion.
#[derive(Clone)]
pub struct ExecutionAdapter {
    executor: Arc<dyn AgentExecutor>,
}

impl ExecutionAdapter {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor }
    }

    /// Run one task to completion, failure or cancellation.
    ///
    /// Never returns an error: executor failures are classified, reported
    /// to the session once, and folded into the outcome.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        link: Option<&SessionLink>,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        self.run_counted(request, link, cancel, &RunCounters::default())
            .await
    }

    /// Like `run`, tallying turns and tokens into `counters` as they happen.
    pub async fn run_counted(
        &self,
        request: ExecutionRequest,
        link: Option<&SessionLink>,
        cancel: &CancellationToken,
        counters: &RunCounters,
    ) -> ExecutionOutcome {
        let task_id = request.task_id;
        let mut run = Run {
            task_id,
            link,
            cancel,
            counters,
            max_turns: request.options.max_turns,
            open_tools: HashMap::new(),
        };

        if cancel.is_cancelled() {
            debug!(task_id = %task_id, "Cancelled before the agent started");
            return run.cancelled();
        }

        run.notify(
            ProgressStage::Initializing,
            format!("Starting agent on {}", request.worker_address),
        )
        .await;

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return run.cancelled(),
            started = self.executor.execute(request) => started,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => return run.failed(e).await,
        };
        run.notify(ProgressStage::Processing, "Agent started".to_string())
            .await;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return run.cancelled(),
                next = stream.next() => next,
            };

            match next {
                None => break,
                Some(Err(e)) => return run.failed(e).await,
                Some(Ok(message)) => {
                    run.turn(message).await;
                    if cancel.is_cancelled() {
                        return run.cancelled();
                    }
                    if let Some(limit) = run.max_turns.filter(|limit| run.turns() >= *limit) {
                        info!(task_id = %task_id, limit, "Turn limit reached");
                        run.notify(
                            ProgressStage::Finalizing,
                            format!("Reached the {limit}-turn limit"),
                        )
                        .await;
                        break;
                    }
                }
            }
        }

        run.send(ServerMessage::Response(ResponsePayload {
            session_id: run.session_id(),
            content: Vec::new(),
            turn: run.turns(),
            done: true,
        }))
        .await;
        if cancel.is_cancelled() {
            return run.cancelled();
        }

        ExecutionOutcome {
            status: TaskStatus::Completed,
            turns: run.turns(),
            tokens: counters.tokens(),
            error: None,
            error_reported: false,
        }
    }
}

/// State for a single execution.
struct Run<'a> {
    task_id: TaskId,
    link: Option<&'a SessionLink>,
    cancel: &'a CancellationToken,
    counters: &'a RunCounters,
    max_turns: Option<u32>,
    /// Open tool uses by id, with their start time.
    open_tools: HashMap<String, Instant>,
}

impl Run<'_> {
    fn turns(&self) -> u32 {
        self.counters.turns()
    }

    fn session_id(&self) -> String {
        self.link
            .map(|l| l.session_id().to_string())
            .unwrap_or_default()
    }

    /// Forward one output event. Nothing goes out once cancelled, including
    /// a send already waiting for buffer space.
    async fn send(&self, message: ServerMessage) {
        let Some(link) = self.link else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(task_id = %self.task_id, "Output dropped after cancellation");
            }
            _ = link.send(message) => {}
        }
    }

    async fn notify(&self, stage: ProgressStage, text: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(link) = self.link {
            let turns = self.turns();
            let turn = (turns > 0).then_some(turns);
            link.notify(ServerMessage::progress(link.session_id(), stage, text, turn))
                .await;
        }
    }

    async fn flush(&self, text: &mut Vec<ResponseContent>) {
        if text.is_empty() {
            return;
        }
        self.send(ServerMessage::Response(ResponsePayload {
            session_id: self.session_id(),
            content: std::mem::take(text),
            turn: self.turns(),
            done: false,
        }))
        .await;
    }

    async fn turn(&mut self, message: AgentMessage) {
        // Messages carrying only tool results belong to the previous turn.
        let produces_output = message
            .blocks
            .iter()
            .any(|b| !matches!(b, ContentBlock::ToolResult { .. }));
        if produces_output {
            self.counters.turns.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(usage) = message.usage {
            self.counters.tokens.fetch_add(usage.total(), Ordering::Relaxed);
        }

        let mut text = Vec::new();
        for block in message.blocks {
            if self.cancel.is_cancelled() {
                return;
            }
            match block {
                ContentBlock::Text { text: t } => text.push(ResponseContent::Text { text: t }),
                ContentBlock::ToolUse { id, name, input } => {
                    self.flush(&mut text).await;
                    self.open_tools.insert(id.clone(), Instant::now());
                    self.send(ServerMessage::ToolUse(ToolUsePayload {
                        session_id: self.session_id(),
                        tool_id: id,
                        tool_name: name,
                        input,
                    }))
                    .await;
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let Some(opened) = self.open_tools.remove(&tool_use_id) else {
                        warn!(
                            task_id = %self.task_id,
                            tool_id = %tool_use_id,
                            "Dropping tool result without a matching tool use"
                        );
                        continue;
                    };
                    self.flush(&mut text).await;
                    self.send(ServerMessage::ToolResult(ToolResultPayload {
                        session_id: self.session_id(),
                        tool_id: tool_use_id,
                        output: content,
                        is_error,
                        duration: Some(opened.elapsed().as_millis() as u64),
                    }))
                    .await;
                }
            }
        }
        self.flush(&mut text).await;
    }

    fn cancelled(self) -> ExecutionOutcome {
        ExecutionOutcome::cancelled(self.counters.turns(), self.counters.tokens())
    }

    async fn failed(self, error: ExecutorError) -> ExecutionOutcome {
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        let message = error.to_string();
        let code = classify(&message);
        warn!(task_id = %self.task_id, %code, error = %message, "Agent execution failed");

        if let Some(link) = self.link {
            link.send(ServerMessage::error(Some(link.session_id()), code, &message))
                .await;
        }

        ExecutionOutcome {
            status: TaskStatus::Failed,
            turns: self.counters.turns(),
            tokens: self.counters.tokens(),
            error: Some(message),
            error_reported: self.link.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::agent::{ExecutionOptions, ScriptedExecutor, Usage};
    use crate::session::{Envelope, ErrorCode, SessionRegistry};

    fn request(max_turns: Option<u32>) -> ExecutionRequest {
        ExecutionRequest {
            task_id: Uuid::new_v4(),
            session_id: Some("s1".into()),
            prompt: "fix it".into(),
            repository: "org/repo".into(),
            branch: None,
            worker_address: "local://worker-1".into(),
            options: ExecutionOptions {
                max_turns,
                ..Default::default()
            },
        }
    }

    fn link() -> (SessionLink, mpsc::Receiver<Envelope>) {
        link_with_capacity(64)
    }

    fn link_with_capacity(capacity: usize) -> (SessionLink, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let link = SessionLink::new(
            "s1",
            tx,
            Arc::new(SessionRegistry::new()),
            ExecutionOptions::default(),
        );
        (link, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            out.push(env.message);
        }
        out
    }

    fn tool_turn() -> AgentMessage {
        AgentMessage {
            blocks: vec![
                ContentBlock::Text {
                    text: "Listing files".into(),
                },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "Bash".into(),
                    input: json!({"command": "ls"}),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "src".into(),
                    is_error: false,
                },
            ],
            usage: Some(Usage {
                input_tokens: 7,
                output_tokens: 3,
            }),
        }
    }

    #[tokio::test]
    async fn converts_blocks_in_order() {
        let adapter = ExecutionAdapter::new(Arc::new(ScriptedExecutor::new(vec![
            tool_turn(),
            AgentMessage::text("Done"),
        ])));
        let (link, mut rx) = link();

        let outcome = adapter
            .run(request(None), Some(&link), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.tokens, 10);

        let messages = drain(&mut rx);
        let kinds: Vec<&str> = messages
            .iter()
            .map(|m| match m {
                ServerMessage::Progress(_) => "progress",
                ServerMessage::Response(r) if r.done => "done",
                ServerMessage::Response(_) => "response",
                ServerMessage::ToolUse(_) => "tool_use",
                ServerMessage::ToolResult(_) => "tool_result",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "progress",
                "progress",
                "response",
                "tool_use",
                "tool_result",
                "response",
                "done"
            ]
        );
    }

    #[tokio::test]
    async fn orphan_tool_result_is_dropped() {
        let adapter = ExecutionAdapter::new(Arc::new(ScriptedExecutor::new(vec![AgentMessage {
            blocks: vec![ContentBlock::ToolResult {
                tool_use_id: "ghost".into(),
                content: "?".into(),
                is_error: false,
            }],
            usage: None,
        }])));
        let (link, mut rx) = link();

        adapter
            .run(request(None), Some(&link), &CancellationToken::new())
            .await;
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|m| matches!(m, ServerMessage::ToolResult(_)))
        );
    }

    #[tokio::test]
    async fn stops_at_turn_limit() {
        let adapter = ExecutionAdapter::new(Arc::new(ScriptedExecutor::new(vec![
            AgentMessage::text("1"),
            AgentMessage::text("2"),
            AgentMessage::text("3"),
        ])));
        let (link, mut rx) = link();

        let outcome = adapter
            .run(request(Some(2)), Some(&link), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.turns, 2);

        let messages = drain(&mut rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::Progress(p) if p.stage == ProgressStage::Finalizing
        )));
        assert!(!messages.iter().any(|m| matches!(
            m,
            ServerMessage::Response(r) if r.content == vec![ResponseContent::Text { text: "3".into() }]
        )));
    }

    #[tokio::test]
    async fn executor_error_is_classified_once() {
        let adapter =
            ExecutionAdapter::new(Arc::new(ScriptedExecutor::failing("Invalid API key")));
        let (link, mut rx) = link();

        let outcome = adapter
            .run(request(None), Some(&link), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.error_reported);

        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Error(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ErrorCode::AuthenticationError);
        assert!(!errors[0].recoverable);
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_executor() {
        let executor = ScriptedExecutor::new(vec![AgentMessage::text("never")]);
        let adapter = ExecutionAdapter::new(Arc::new(executor.clone()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = adapter.run(request(None), None, &cancel).await;
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(executor.calls().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_stream_stops_output() {
        let adapter = ExecutionAdapter::new(Arc::new(
            ScriptedExecutor::new(vec![AgentMessage::text("first"), AgentMessage::text("second")])
                .with_delay(Duration::from_secs(10)),
        ));
        let (link, mut rx) = link();
        let cancel = CancellationToken::new();

        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trip.cancel();
        });

        let outcome = adapter.run(request(None), Some(&link), &cancel).await;
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.turns, 1);

        let responses = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Response(_)))
            .count();
        assert_eq!(responses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_send_is_blocked_forwards_nothing_more() {
        let adapter = ExecutionAdapter::new(Arc::new(ScriptedExecutor::new(vec![
            AgentMessage {
                blocks: vec![
                    ContentBlock::Text {
                        text: "Looking".into(),
                    },
                    ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "Bash".into(),
                        input: json!({"command": "ls"}),
                    },
                    ContentBlock::ToolResult {
                        tool_use_id: "t1".into(),
                        content: "src".into(),
                        is_error: false,
                    },
                    ContentBlock::Text {
                        text: "Found it".into(),
                    },
                ],
                usage: None,
            },
        ])));
        // One slot: the first progress fills it and the first response blocks.
        let (link, mut rx) = link_with_capacity(1);
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { adapter.run(request(None), Some(&link), &cancel).await }
        });

        // Let the run reach the blocked send.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.turns, 1);

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|m| match m {
                ServerMessage::Progress(p) => format!("progress:{:?}", p.stage),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec!["progress:Initializing"]);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_survive_a_dropped_run() {
        let adapter = ExecutionAdapter::new(Arc::new(
            ScriptedExecutor::new(vec![
                AgentMessage {
                    blocks: vec![ContentBlock::Text {
                        text: "first".into(),
                    }],
                    usage: Some(Usage {
                        input_tokens: 20,
                        output_tokens: 5,
                    }),
                },
                AgentMessage::text("second"),
            ])
            .with_delay(Duration::from_secs(10)),
        ));
        let counters = RunCounters::default();
        let cancel = CancellationToken::new();

        let dropped = tokio::time::timeout(
            Duration::from_secs(15),
            adapter.run_counted(request(None), None, &cancel, &counters),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(counters.turns(), 1);
        assert_eq!(counters.tokens(), 25);
    }
}
