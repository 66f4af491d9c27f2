//! Per-session turn worker
//!
//! One worker task owns one agent process for the length of a turn. It is
//! the only writer of the session's state and the only sender on the
//! turn's event channel, so events leave in exactly the order the agent
//! produced them and exactly one terminator is sent.

use std::collections::{HashSet, VecDeque};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handshake::Handshake;
use super::state::{SessionStreamState, StreamStatus};
use crate::agent::cli::permission_reply_line;
use crate::agent::permissions::{summarize_input, PermissionPolicy, PolicyDecision, StandingRules};
use crate::agent::process::AgentProcess;
use crate::agent::stream::{parse_event, AgentOutput, TurnAccumulator};
use crate::error::{PermissionError, TurnFailure};
use crate::protocol::{
    ContentBlock, PermissionDecision, PermissionOutcome, PermissionRequest, StreamEvent,
    TurnResult,
};
use crate::store::{SessionStore, TurnRecord, TurnStatus};

const DENIED_MESSAGE: &str = "Permission denied by user";
const BLOCKED_MESSAGE: &str = "Tool is not allowed in this session";

/// Messages from the orchestrator to a worker
#[derive(Debug)]
pub(crate) enum Control {
    /// A client decision for the pending request
    Resolve {
        decision: PermissionDecision,
        reply: oneshot::Sender<Result<(), PermissionError>>,
    },
    /// Stop the turn
    Cancel,
}

/// How the drive loop ended
enum Exit {
    Finished(TurnResult),
    Eof,
    Failed(TurnFailure),
}

impl From<TurnFailure> for Exit {
    fn from(failure: TurnFailure) -> Self {
        Self::Failed(failure)
    }
}

/// Everything a worker needs for one turn
pub(crate) struct TurnSpec {
    pub session_id: String,
    pub prompt: String,
    pub command: Command,
    pub policy: PermissionPolicy,
    pub rules: Arc<Mutex<StandingRules>>,
    pub stall_timeout: Duration,
    pub max_turn_duration: Option<Duration>,
    pub shutdown_grace: Duration,
}

pub(crate) struct Worker {
    session_id: String,
    prompt: String,
    policy: PermissionPolicy,
    rules: Arc<Mutex<StandingRules>>,
    stall_timeout: Duration,
    max_turn_duration: Option<Duration>,
    /// Running-time cap; pushed back by every permission pause
    turn_deadline: Option<Instant>,
    shutdown_grace: Duration,
    events: mpsc::Sender<StreamEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    /// Decisions that arrived while an event send was blocked
    held: VecDeque<Control>,
    state: watch::Sender<SessionStreamState>,
    store: Arc<dyn SessionStore>,
    release: Box<dyn FnOnce() + Send + Sync>,
    handshake: Handshake,
    accumulator: TurnAccumulator,
    /// Blocks held back while a permission request is outstanding
    deferred: VecDeque<ContentBlock>,
    /// Tool uses answered with a synthetic error result
    denied: HashSet<String>,
}

impl Worker {
    pub(crate) fn new(
        spec: TurnSpec,
        events: mpsc::Sender<StreamEvent>,
        control: mpsc::UnboundedReceiver<Control>,
        state: watch::Sender<SessionStreamState>,
        store: Arc<dyn SessionStore>,
        release: Box<dyn FnOnce() + Send + Sync>,
    ) -> (Self, Command) {
        let worker = Self {
            session_id: spec.session_id,
            prompt: spec.prompt,
            policy: spec.policy,
            rules: spec.rules,
            stall_timeout: spec.stall_timeout,
            max_turn_duration: spec.max_turn_duration,
            turn_deadline: None,
            shutdown_grace: spec.shutdown_grace,
            events,
            control,
            held: VecDeque::new(),
            state,
            store,
            release,
            handshake: Handshake::new(),
            accumulator: TurnAccumulator::new(),
            deferred: VecDeque::new(),
            denied: HashSet::new(),
        };
        (worker, spec.command)
    }

    /// Run the turn to its terminator.
    pub(crate) async fn run(mut self, command: Command) {
        let mut process = match AgentProcess::spawn(command, &self.prompt).await {
            Ok(process) => process,
            Err(e) => {
                error!(session_id = %self.session_id, error = %format!("{e:#}"), "agent spawn failed");
                let failure = TurnFailure::Spawn(format!("{e:#}"));
                self.conclude(failure.into_event(), TurnStatus::Failed).await;
                return;
            }
        };

        info!(session_id = %self.session_id, pid = ?process.id(), "agent turn started");
        self.set_status(StreamStatus::Running);
        self.turn_deadline = self.max_turn_duration.map(|cap| Instant::now() + cap);

        let exit = self.drive(&mut process).await;

        let (terminator, status) = match exit {
            Exit::Finished(mut result) => {
                if result.agent_session_id.is_none() {
                    result
                        .agent_session_id
                        .clone_from(&self.accumulator.agent_session_id);
                }
                process.shutdown(self.shutdown_grace).await;
                let status = if result.is_error {
                    TurnStatus::Failed
                } else {
                    TurnStatus::Completed
                };
                (StreamEvent::Result(result), status)
            }
            Exit::Eof => {
                let report = process.shutdown(self.shutdown_grace).await;
                warn!(session_id = %self.session_id, exit_code = ?report.exit_code, "agent exited without a result");
                (
                    TurnFailure::Upstream(report.describe()).into_event(),
                    TurnStatus::Failed,
                )
            }
            Exit::Failed(failure) => {
                let status = match failure {
                    TurnFailure::Cancelled | TurnFailure::Disconnected => {
                        self.set_status(StreamStatus::Cancelling);
                        TurnStatus::Cancelled
                    }
                    _ => TurnStatus::Failed,
                };
                match &failure {
                    TurnFailure::Disconnected => {
                        info!(session_id = %self.session_id, "subscriber disconnected, cancelling turn");
                    }
                    TurnFailure::Cancelled => {
                        info!(session_id = %self.session_id, "turn cancelled");
                    }
                    other => {
                        warn!(session_id = %self.session_id, error = %other, "turn failed");
                    }
                }
                process.kill().await;
                (failure.into_event(), status)
            }
        };

        self.conclude(terminator, status).await;
    }

    async fn drive(&mut self, process: &mut AgentProcess) -> Exit {
        let mut deadline = Instant::now() + self.stall_timeout;

        loop {
            while let Some(Control::Resolve { decision, reply }) = self.held.pop_front() {
                self.reject_stale(decision, reply);
            }
            let wake = match self.turn_deadline {
                Some(cap) => deadline.min(cap),
                None => deadline,
            };

            tokio::select! {
                biased;
                ctrl = self.control.recv() => match ctrl {
                    None | Some(Control::Cancel) => return TurnFailure::Cancelled.into(),
                    Some(Control::Resolve { decision, reply }) => self.reject_stale(decision, reply),
                },
                () = self.events.closed() => return TurnFailure::Disconnected.into(),
                line = tokio::time::timeout_at(wake, process.next_line()) => {
                    let line = match line {
                        Err(_) => match (self.turn_deadline, self.max_turn_duration) {
                            (Some(cap), Some(max)) if Instant::now() >= cap => {
                                return TurnFailure::TurnLimit(max).into();
                            }
                            _ => return TurnFailure::Stall(self.stall_timeout).into(),
                        },
                        Ok(Err(e)) => {
                            return TurnFailure::Upstream(format!("failed to read agent output: {e}")).into();
                        }
                        Ok(Ok(None)) => return Exit::Eof,
                        Ok(Ok(Some(line))) => line,
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Some(output) = parse_event(&line) else {
                        warn!(session_id = %self.session_id, line = %preview(&line), "dropping malformed agent output");
                        continue;
                    };

                    if let Err(exit) = self.handle_output(output, process).await {
                        return exit;
                    }
                    // also restarts the clock after a permission pause
                    deadline = Instant::now() + self.stall_timeout;
                }
            }
        }
    }

    async fn handle_output(
        &mut self,
        output: AgentOutput,
        process: &mut AgentProcess,
    ) -> Result<(), Exit> {
        self.accumulator.process(&output);

        match output {
            AgentOutput::Init {
                session_id,
                model,
                tools,
            } => {
                self.emit(StreamEvent::System {
                    subtype: "init".to_string(),
                    session_id: self.session_id.clone(),
                    agent_session_id: (!session_id.is_empty()).then_some(session_id),
                    model,
                    tools,
                })
                .await?;
            }
            AgentOutput::Assistant { blocks, usage } => {
                if let Some(usage) = usage {
                    self.state.send_modify(|s| s.usage.add(&usage));
                }
                self.forward_blocks(blocks, process).await?;
            }
            AgentOutput::ToolResults { blocks } => {
                self.forward_blocks(blocks, process).await?;
            }
            AgentOutput::Result(result) => {
                self.state.send_modify(|s| {
                    if !result.usage.is_empty() {
                        s.usage = result.usage;
                    }
                    s.total_cost_usd = result.total_cost_usd;
                });
                return Err(Exit::Finished(result));
            }
            AgentOutput::Ignored { event_type } => {
                debug!(session_id = %self.session_id, event_type = %event_type, "ignoring agent event");
            }
        }
        Ok(())
    }

    /// Forward blocks in order, pausing at any tool use that needs a decision.
    async fn forward_blocks(
        &mut self,
        blocks: Vec<ContentBlock>,
        process: &mut AgentProcess,
    ) -> Result<(), Exit> {
        self.deferred.extend(blocks);
        let mut batch = Vec::new();

        while let Some(block) = self.deferred.pop_front() {
            match block {
                ContentBlock::ToolUse {
                    ref tool_use_id,
                    ref name,
                    ref input,
                } => {
                    let decision = {
                        let rules = self
                            .rules
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        self.policy.evaluate(&rules, name, input)
                    };
                    let tool_use_id = tool_use_id.clone();
                    let request = match decision {
                        PolicyDecision::Ask => Some(self.permission_request(&block)),
                        _ => None,
                    };
                    self.accumulator.record_block(&block);
                    batch.push(block);

                    match decision {
                        PolicyDecision::PreApproved => {}
                        PolicyDecision::Allow => {
                            debug!(session_id = %self.session_id, tool_use_id = %tool_use_id, "approved by standing rule");
                            reply_to_agent(process, &tool_use_id, true).await;
                        }
                        PolicyDecision::Blocked | PolicyDecision::Deny => {
                            if decision == PolicyDecision::Deny {
                                reply_to_agent(process, &tool_use_id, false).await;
                            }
                            let message = if decision == PolicyDecision::Deny {
                                DENIED_MESSAGE
                            } else {
                                BLOCKED_MESSAGE
                            };
                            batch.push(self.denial_block(&tool_use_id, message));
                        }
                        PolicyDecision::Ask => {
                            self.flush(&mut batch).await?;
                            if let Some(request) = request {
                                self.await_decision(request, process).await?;
                            }
                        }
                    }
                }
                ContentBlock::ToolResult {
                    ref tool_use_id, ..
                } if self.denied.contains(tool_use_id) => {
                    debug!(session_id = %self.session_id, tool_use_id = %tool_use_id, "dropping agent result for denied tool");
                }
                other => {
                    self.accumulator.record_block(&other);
                    batch.push(other);
                }
            }
        }

        self.flush(&mut batch).await
    }

    fn permission_request(&self, block: &ContentBlock) -> PermissionRequest {
        let (tool_use_id, name, input) = match block {
            ContentBlock::ToolUse {
                tool_use_id,
                name,
                input,
            } => (tool_use_id.clone(), name.clone(), input.clone()),
            _ => (String::new(), String::new(), serde_json::Value::Null),
        };
        PermissionRequest {
            id: Uuid::new_v4().to_string(),
            input_summary: summarize_input(&name, &input),
            tool_name: name,
            tool_use_id,
            input,
            requested_at: Utc::now(),
        }
    }

    fn denial_block(&mut self, tool_use_id: &str, message: &str) -> ContentBlock {
        self.denied.insert(tool_use_id.to_string());
        let block = ContentBlock::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: message.to_string(),
            is_error: true,
        };
        self.accumulator.record_block(&block);
        block
    }

    /// Emit the request and hold the session until a matching decision,
    /// a cancel, or a disconnect arrives.
    async fn await_decision(
        &mut self,
        request: PermissionRequest,
        process: &mut AgentProcess,
    ) -> Result<(), Exit> {
        info!(
            session_id = %self.session_id,
            id = %request.id,
            tool = %request.tool_name,
            "awaiting permission"
        );
        self.handshake.open(request.clone());
        self.state.send_modify(|s| {
            s.pending_permission = Some(request.clone());
            s.awaiting_since = Some(request.requested_at);
            s.transition(StreamStatus::AwaitingPermission);
        });
        let paused = Instant::now();
        self.emit(StreamEvent::PermissionRequest(request)).await?;

        loop {
            let ctrl = match self.held.pop_front() {
                Some(ctrl) => Some(ctrl),
                None => tokio::select! {
                    biased;
                    ctrl = self.control.recv() => ctrl,
                    () = self.events.closed() => {
                        self.handshake.clear();
                        return Err(TurnFailure::Disconnected.into());
                    }
                },
            };
            match ctrl {
                None | Some(Control::Cancel) => {
                    self.handshake.clear();
                    return Err(TurnFailure::Cancelled.into());
                }
                Some(Control::Resolve { decision, reply }) => {
                    let waited = self.handshake.awaiting_for();
                    match self.handshake.resolve(&decision) {
                        Err(e) => {
                            debug!(session_id = %self.session_id, error = %e, "rejecting stale decision");
                            let _ = reply.send(Err(e));
                        }
                        Ok(request) => {
                            info!(
                                session_id = %self.session_id,
                                id = %request.id,
                                outcome = ?decision.outcome,
                                waited_ms = waited.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                                "permission resolved"
                            );
                            self.state.send_modify(|s| {
                                s.pending_permission = None;
                                s.awaiting_since = None;
                                s.transition(StreamStatus::Running);
                            });
                            let _ = reply.send(Ok(()));
                            // time spent waiting on the user does not count against the cap
                            if let Some(cap) = self.turn_deadline.as_mut() {
                                *cap += paused.elapsed();
                            }
                            return self.apply_decision(&request, decision.outcome, process).await;
                        }
                    }
                }
            }
        }
    }

    async fn apply_decision(
        &mut self,
        request: &PermissionRequest,
        outcome: PermissionOutcome,
        process: &mut AgentProcess,
    ) -> Result<(), Exit> {
        if outcome.is_standing() {
            let recorded = self
                .rules
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .record(outcome, &request.tool_name, &request.input);
            if let Some(pattern) = recorded {
                info!(session_id = %self.session_id, rule = %pattern, outcome = ?outcome, "recorded standing permission rule");
            }
        }

        reply_to_agent(process, &request.tool_use_id, outcome.is_allow()).await;

        if !outcome.is_allow() {
            let block = self.denial_block(&request.tool_use_id, DENIED_MESSAGE);
            self.emit(StreamEvent::Assistant {
                content: vec![block],
            })
            .await?;
        }
        Ok(())
    }

    async fn flush(&mut self, batch: &mut Vec<ContentBlock>) -> Result<(), Exit> {
        if batch.is_empty() {
            return Ok(());
        }
        let content = std::mem::take(batch);
        self.emit(StreamEvent::Assistant { content }).await
    }

    /// Send one event, waiting for the subscriber to make room. A cancel
    /// still ends the turn while the channel is full; decisions are held
    /// for the loop that owns the handshake.
    async fn emit(&mut self, event: StreamEvent) -> Result<(), Exit> {
        let send = self.events.send(event);
        tokio::pin!(send);

        loop {
            tokio::select! {
                biased;
                ctrl = self.control.recv() => match ctrl {
                    None | Some(Control::Cancel) => return Err(TurnFailure::Cancelled.into()),
                    Some(resolve) => self.held.push_back(resolve),
                },
                sent = &mut send => {
                    return sent.map_err(|_| Exit::Failed(TurnFailure::Disconnected));
                }
            }
        }
    }

    fn reject_stale(
        &self,
        decision: PermissionDecision,
        reply: oneshot::Sender<Result<(), PermissionError>>,
    ) {
        debug!(session_id = %self.session_id, id = %decision.id, "resolve while not awaiting permission");
        let _ = reply.send(Err(PermissionError::Stale(decision.id)));
    }

    fn set_status(&self, status: StreamStatus) {
        self.state.send_modify(|s| {
            s.transition(status);
        });
    }

    /// Persist, release the session, then send the single terminator.
    async fn conclude(self, terminator: StreamEvent, status: TurnStatus) {
        let usage = match &terminator {
            StreamEvent::Result(result) if !result.usage.is_empty() => result.usage,
            _ => self.accumulator.final_usage(),
        };
        let record = TurnRecord {
            session_id: self.session_id.clone(),
            prompt: self.prompt.clone(),
            text: self.accumulator.text(),
            tool_calls: self.accumulator.tool_calls.clone(),
            tool_results: self.accumulator.tool_results.clone(),
            usage,
            total_cost_usd: self.accumulator.total_cost_usd(),
            status,
            agent_session_id: self.accumulator.agent_session_id.clone(),
            completed_at: Utc::now(),
        };
        if let Err(e) = self.store.record_turn(record).await {
            error!(session_id = %self.session_id, error = %e, "failed to persist turn");
        }

        self.state.send_modify(|s| {
            s.pending_permission = None;
            s.awaiting_since = None;
            s.transition(StreamStatus::Terminated);
        });
        (self.release)();

        info!(session_id = %self.session_id, status = ?status, terminator = terminator.kind(), "turn finished");
        // the session is already released, so a cancel can no longer reach us
        match tokio::time::timeout(self.stall_timeout, self.events.send(terminator)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(session_id = %self.session_id, "subscriber gone before terminator"),
            Err(_) => warn!(session_id = %self.session_id, "subscriber did not take the terminator, dropping it"),
        }
    }
}

async fn reply_to_agent(process: &mut AgentProcess, tool_use_id: &str, allow: bool) {
    let message = (!allow).then_some(DENIED_MESSAGE);
    let line = permission_reply_line(tool_use_id, allow, message);
    if let Err(e) = process.send_line(&line).await {
        warn!(tool_use_id = %tool_use_id, error = %e, "failed to send permission reply to agent");
    }
}

fn preview(line: &str) -> String {
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(200).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
