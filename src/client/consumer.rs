//! Client stream consumer
//!
//! Opens a session stream, decodes frames, and hands events to a
//! `StreamHandler` in delivery order. A dropped connection is retried with
//! exponential backoff by restarting the turn (`resume: true`), after the
//! handler has been told about the gap.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{backoff, ConnectionState};
use super::transport::StreamTransport;
use crate::error::ConsumerError;
use crate::protocol::{
    FrameDecoder, PermissionDecision, PermissionOutcome, PermissionRequest, StartRequest,
    StreamEvent,
};

/// Retry and timeout knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Reconnection attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_backoff: Duration,
    /// Upper bound on any retry delay
    pub max_backoff: Duration,
    /// A read that yields nothing for this long counts as a dropped connection
    pub read_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            read_timeout: Duration::from_secs(45),
        }
    }
}

/// Receives everything the consumer observes.
///
/// Callbacks run on the consumer's read task, one at a time.
pub trait StreamHandler: Send + 'static {
    /// A decoded event, in delivery order.
    fn on_event(&mut self, event: &StreamEvent);

    /// The connection state changed.
    fn on_state(&mut self, _state: ConnectionState) {}

    /// The connection dropped mid-turn; events after this belong to a
    /// restarted turn. `attempt` is the retry about to be made.
    fn on_gap(&mut self, _attempt: u32) {}

    /// A recoverable problem (bad frame, failed attempt).
    fn on_error(&mut self, _error: &ConsumerError) {}
}

/// Everything a `ChannelHandler` forwards
#[derive(Debug)]
pub enum ConsumerUpdate {
    /// See `StreamHandler::on_event`
    Event(StreamEvent),
    /// See `StreamHandler::on_state`
    State(ConnectionState),
    /// See `StreamHandler::on_gap`
    Gap(u32),
    /// See `StreamHandler::on_error`
    Error(String),
}

/// Forwards callbacks into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConsumerUpdate>,
}

impl ChannelHandler {
    /// Create a handler and the receiver it feeds.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConsumerUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamHandler for ChannelHandler {
    fn on_event(&mut self, event: &StreamEvent) {
        let _ = self.tx.send(ConsumerUpdate::Event(event.clone()));
    }

    fn on_state(&mut self, state: ConnectionState) {
        let _ = self.tx.send(ConsumerUpdate::State(state));
    }

    fn on_gap(&mut self, attempt: u32) {
        let _ = self.tx.send(ConsumerUpdate::Gap(attempt));
    }

    fn on_error(&mut self, error: &ConsumerError) {
        let _ = self.tx.send(ConsumerUpdate::Error(error.to_string()));
    }
}

/// How a consumed turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// The server sent the turn's terminator
    Finished(StreamEvent),
    /// `cancel()` stopped the consumer
    Cancelled,
    /// The consumer gave up
    Failed(ConsumerError),
}

/// Resolves once the read task has stopped.
///
/// After it resolves no handler callback runs again.
pub struct Cancellation {
    inner: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Cancellation {
    fn wait_for(mut stopped: watch::Receiver<bool>) -> Self {
        Self {
            inner: Box::pin(async move {
                // A dropped sender means the task is gone too
                let _ = stopped.wait_for(|done| *done).await;
            }),
        }
    }

    fn done() -> Self {
        Self {
            inner: Box::pin(std::future::ready(())),
        }
    }
}

impl Future for Cancellation {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.as_mut().poll(cx)
    }
}

struct ActiveTurn {
    token: CancellationToken,
    stopped: watch::Receiver<bool>,
}

struct Inner {
    transport: Arc<dyn StreamTransport>,
    settings: ConsumerSettings,
    session_id: String,
    state: watch::Sender<ConnectionState>,
    active: Mutex<Option<ActiveTurn>>,
    pending: Mutex<Option<PermissionRequest>>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Option<PermissionRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless cancelled or illegal. Returns whether it moved.
    fn transition(&self, token: &CancellationToken, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if token.is_cancelled() {
                return false;
            }
            let legal = current.can_transition_to(next);
            debug_assert!(legal, "illegal connection transition {current} -> {next}");
            if !legal || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }
}

/// Consumes one session's stream
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct StreamConsumer {
    inner: Arc<Inner>,
}

impl StreamConsumer {
    /// Create a consumer for `session_id`.
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        session_id: impl Into<String>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                session_id: session_id.into(),
                state,
                active: Mutex::new(None),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Session this consumer streams
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The permission request awaiting a decision, if any.
    #[must_use]
    pub fn pending_permission(&self) -> Option<PermissionRequest> {
        self.inner.pending().clone()
    }

    /// Start streaming `request`, dispatching to `handler`.
    ///
    /// The returned task resolves with the turn's outcome.
    pub fn connect<H: StreamHandler>(
        &self,
        request: StartRequest,
        handler: H,
    ) -> Result<JoinHandle<TurnOutcome>, ConsumerError> {
        let token = CancellationToken::new();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        {
            let mut active = self.inner.active();
            if active.as_ref().is_some_and(|a| !*a.stopped.borrow()) {
                return Err(ConsumerError::AlreadyActive);
            }
            *active = Some(ActiveTurn {
                token: token.clone(),
                stopped: stopped_rx,
            });
        }
        self.inner.pending().take();

        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let outcome = ReadLoop {
                inner: &inner,
                token: &token,
                handler,
            }
            .run(request)
            .await;
            stopped_tx.send_replace(true);
            outcome
        }))
    }

    /// Stop the consumer.
    ///
    /// Never blocks and is idempotent. The returned future resolves once the
    /// read task has stopped; no handler callback runs after that, and
    /// events still buffered at cancellation are discarded.
    pub fn cancel(&self) -> Cancellation {
        let Some(active) = self.inner.active().take() else {
            return Cancellation::done();
        };

        if !*active.stopped.borrow() {
            active.token.cancel();
            info!(session_id = %self.inner.session_id, "stream cancelled");

            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let transport = Arc::clone(&self.inner.transport);
                let session_id = self.inner.session_id.clone();
                runtime.spawn(async move {
                    if let Err(e) = transport.cancel(&session_id).await {
                        debug!(session_id = %session_id, error = %e, "server-side cancel failed");
                    }
                });
            }
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
        self.inner.pending().take();
        Cancellation::wait_for(active.stopped)
    }

    /// Answer the pending permission request.
    pub async fn decide(&self, outcome: PermissionOutcome) -> Result<(), ConsumerError> {
        let Some(request) = self.pending_permission() else {
            return Err(ConsumerError::NoPendingPermission);
        };
        let decision = PermissionDecision {
            id: request.id.clone(),
            outcome,
        };
        self.inner
            .transport
            .decide(&self.inner.session_id, &decision)
            .await?;

        let mut pending = self.inner.pending();
        if pending.as_ref().is_some_and(|p| p.id == request.id) {
            pending.take();
        }
        Ok(())
    }
}

/// How a single connection ended
enum Interrupted {
    Cancelled,
    Finished(StreamEvent),
    Lost { error: ConsumerError, connected: bool },
}

struct ReadLoop<'a, H> {
    inner: &'a Inner,
    token: &'a CancellationToken,
    handler: H,
}

impl<H: StreamHandler> ReadLoop<'_, H> {
    fn set_state(&mut self, next: ConnectionState) {
        if self.inner.transition(self.token, next) {
            debug!(session_id = %self.inner.session_id, state = %next, "connection state");
            self.handler.on_state(next);
        }
    }

    async fn run(mut self, request: StartRequest) -> TurnOutcome {
        let settings = self.inner.settings;
        let mut request = request;
        let mut attempt: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            self.set_state(ConnectionState::Connecting);

            let (error, connected) = match self.connection(&request, &mut attempt).await {
                Interrupted::Cancelled => return TurnOutcome::Cancelled,
                Interrupted::Finished(event) => {
                    self.set_state(ConnectionState::Disconnected);
                    return TurnOutcome::Finished(event);
                }
                Interrupted::Lost { error, connected } => (error, connected),
            };

            if !error.is_retryable() {
                warn!(session_id = %self.inner.session_id, error = %error, "stream failed");
                self.set_state(ConnectionState::Disconnected);
                return TurnOutcome::Failed(error);
            }

            attempt += 1;
            if attempt > settings.max_attempts {
                let attempts = attempt - 1;
                warn!(session_id = %self.inner.session_id, attempts, error = %error, "giving up");
                self.set_state(ConnectionState::Disconnected);
                return TurnOutcome::Failed(ConsumerError::RetriesExhausted { attempts });
            }

            if self.token.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
            self.handler.on_error(&error);
            if connected {
                // The server cancels a turn whose subscriber left
                self.inner.pending().take();
                self.handler.on_gap(attempt);
            }
            self.set_state(ConnectionState::Reconnecting { attempt });

            let mut delay = backoff(attempt, settings.base_backoff, settings.max_backoff);
            if let ConsumerError::RateLimited { retry_after } = error {
                delay = delay.max(retry_after);
            }
            info!(
                session_id = %self.inner.session_id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "reconnecting"
            );

            tokio::select! {
                () = self.token.cancelled() => return TurnOutcome::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }

            // Restart policy: the server cancelled the interrupted turn, so
            // the retry continues the agent conversation from its last result.
            request.resume = true;
        }
    }

    /// One connection: open, read until terminator, drop, or cancel.
    async fn connection(&mut self, request: &StartRequest, attempt: &mut u32) -> Interrupted {
        let opened = tokio::select! {
            biased;
            () = self.token.cancelled() => return Interrupted::Cancelled,
            opened = self.inner.transport.open(&self.inner.session_id, request) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(error) => {
                return Interrupted::Lost {
                    error,
                    connected: false,
                }
            }
        };
        self.set_state(ConnectionState::Connected);

        let read_timeout = self.inner.settings.read_timeout;
        let mut decoder = FrameDecoder::new();
        let mut first_frame = true;

        loop {
            let chunk = tokio::select! {
                biased;
                () = self.token.cancelled() => return Interrupted::Cancelled,
                chunk = tokio::time::timeout(read_timeout, body.next()) => chunk,
            };

            let (frames, lost) = match chunk {
                Ok(Some(Ok(bytes))) => (decoder.feed(&bytes), None),
                Ok(Some(Err(error))) => (Vec::new(), Some(error)),
                Ok(None) => (
                    decoder.finish(),
                    Some(ConsumerError::Transport(
                        "stream ended before the turn finished".to_string(),
                    )),
                ),
                Err(_) => (
                    Vec::new(),
                    Some(ConsumerError::Transport(format!(
                        "no data for {}s",
                        read_timeout.as_secs()
                    ))),
                ),
            };

            for frame in frames {
                if self.token.is_cancelled() {
                    return Interrupted::Cancelled;
                }
                match frame {
                    Ok(event) => {
                        if first_frame {
                            first_frame = false;
                            *attempt = 0;
                        }
                        if let Some(done) = self.dispatch(event) {
                            return Interrupted::Finished(done);
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %self.inner.session_id, error = %e, "undecodable frame");
                        self.handler.on_error(&ConsumerError::Codec(e));
                    }
                }
            }

            if let Some(error) = lost {
                return Interrupted::Lost {
                    error,
                    connected: true,
                };
            }
        }
    }

    /// Hand one event to the handler; returns it back if it ends the turn.
    fn dispatch(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        match &event {
            StreamEvent::PermissionRequest(request) => {
                *self.inner.pending() = Some(request.clone());
            }
            _ if event.is_terminal() => {
                self.inner.pending().take();
            }
            _ => {}
        }

        self.handler.on_event(&event);
        event.is_terminal().then_some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::ByteStream;
    use crate::protocol::{encode_sse, ErrorCode, TurnResult, Usage};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    enum Script {
        Fail(ConsumerError),
        Body(Vec<Result<Vec<u8>, ConsumerError>>),
        /// Chunks followed by a connection that stays open
        Open(Vec<Result<Vec<u8>, ConsumerError>>),
        Hang,
    }

    struct ScriptedTransport {
        opens: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StartRequest>>,
        decisions: Mutex<Vec<PermissionDecision>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                opens: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
                decisions: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn open(
            &self,
            _session_id: &str,
            request: &StartRequest,
        ) -> Result<ByteStream, ConsumerError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.opens.lock().unwrap().pop_front();
            match next {
                Some(Script::Fail(e)) => Err(e),
                Some(Script::Body(chunks)) => Ok(Box::pin(futures::stream::iter(chunks))),
                Some(Script::Open(chunks)) => Ok(Box::pin(
                    futures::stream::iter(chunks).chain(futures::stream::pending()),
                )),
                Some(Script::Hang) => Ok(Box::pin(futures::stream::pending::<
                    Result<Vec<u8>, ConsumerError>,
                >())),
                None => Err(ConsumerError::Transport("connection refused".into())),
            }
        }

        async fn decide(
            &self,
            _session_id: &str,
            decision: &PermissionDecision,
        ) -> Result<(), ConsumerError> {
            self.decisions.lock().unwrap().push(decision.clone());
            Ok(())
        }

        async fn cancel(&self, _session_id: &str) -> Result<bool, ConsumerError> {
            Ok(true)
        }
    }

    fn fast_settings(max_attempts: u32) -> ConsumerSettings {
        ConsumerSettings {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            read_timeout: Duration::from_secs(5),
        }
    }

    fn frame(event: &StreamEvent) -> Result<Vec<u8>, ConsumerError> {
        Ok(encode_sse(event).unwrap().into_bytes())
    }

    fn text_event(text: &str) -> StreamEvent {
        StreamEvent::Assistant {
            content: vec![crate::protocol::ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    fn result_event() -> StreamEvent {
        StreamEvent::Result(TurnResult {
            subtype: "success".to_string(),
            is_error: false,
            num_turns: 1,
            duration_ms: 10,
            total_cost_usd: 0.01,
            usage: Usage::default(),
            result: Some("done".to_string()),
            agent_session_id: None,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConsumerUpdate>) -> Vec<ConsumerUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    fn states(updates: &[ConsumerUpdate]) -> Vec<ConnectionState> {
        updates
            .iter()
            .filter_map(|u| match u {
                ConsumerUpdate::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_delivers_events_in_order_until_result() {
        let transport = ScriptedTransport::new(vec![Script::Body(vec![
            frame(&text_event("one")),
            frame(&text_event("two")),
            frame(&result_event()),
            frame(&text_event("after terminator")),
        ])]);
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(3));
        let (handler, mut rx) = ChannelHandler::new();

        let outcome = consumer
            .connect(StartRequest::new("hi"), handler)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Finished(StreamEvent::Result(_))));

        let events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|u| match u {
                ConsumerUpdate::Event(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(
            events,
            vec![text_event("one"), text_event("two"), result_event()]
        );
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_up_to_cap() {
        let transport = ScriptedTransport::new(vec![Script::Body(vec![
            frame(&text_event("partial")),
            Err(ConsumerError::Transport("reset".into())),
        ])]);
        let consumer = StreamConsumer::new(transport.clone(), "s-1", fast_settings(2));
        let (handler, mut rx) = ChannelHandler::new();

        let outcome = consumer
            .connect(StartRequest::new("hi"), handler)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(ConsumerError::RetriesExhausted { attempts: 2 })
        ));

        let updates = drain(&mut rx);
        assert_eq!(
            states(&updates),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Connecting,
                ConnectionState::Reconnecting { attempt: 2 },
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
            ]
        );
        assert_eq!(
            updates
                .iter()
                .filter(|u| matches!(u, ConsumerUpdate::Gap(1)))
                .count(),
            1
        );

        // Every retry restarts the turn with resume set
        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[1..].iter().all(|r| r.resume));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Script::Fail(ConsumerError::Rejected {
            status: 422,
            message: "prompt cannot be empty".into(),
        })]);
        let consumer = StreamConsumer::new(transport.clone(), "s-1", fast_settings(5));
        let (handler, _rx) = ChannelHandler::new();

        let outcome = consumer
            .connect(StartRequest::new(" "), handler)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Failed(ConsumerError::Rejected { status: 422, .. })
        ));
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_counter_resets_after_first_frame() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(ConsumerError::Transport("refused".into())),
            Script::Body(vec![
                frame(&text_event("a")),
                Err(ConsumerError::Transport("reset".into())),
            ]),
            Script::Body(vec![frame(&result_event())]),
        ]);
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(1));
        let (handler, mut rx) = ChannelHandler::new();

        let outcome = consumer
            .connect(StartRequest::new("hi"), handler)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Finished(_)));

        let reconnects: Vec<_> = states(&drain(&mut rx))
            .into_iter()
            .filter(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .collect();
        assert_eq!(
            reconnects,
            vec![
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Reconnecting { attempt: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_delivery() {
        let transport = ScriptedTransport::new(vec![Script::Hang]);
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(3));
        let (handler, mut rx) = ChannelHandler::new();

        let task = consumer.connect(StartRequest::new("hi"), handler).unwrap();
        let mut state = consumer.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        consumer.cancel().await;
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
        let seen = drain(&mut rx).len();

        consumer.cancel().await;
        assert!(matches!(task.await.unwrap(), TurnOutcome::Cancelled));
        assert_eq!(drain(&mut rx).len(), 0, "{seen} updates before cancel, none after");
    }

    /// Records events and cancels its own consumer from the first one
    struct CancelOnFirstEvent {
        consumer: StreamConsumer,
        seen: Arc<Mutex<Vec<StreamEvent>>>,
    }

    impl StreamHandler for CancelOnFirstEvent {
        fn on_event(&mut self, event: &StreamEvent) {
            self.seen.lock().unwrap().push(event.clone());
            drop(self.consumer.cancel());
        }
    }

    #[tokio::test]
    async fn test_cancel_discards_frames_already_buffered() {
        // three frames arrive in one chunk, so all are decoded before the first is delivered
        let mut chunk = frame(&text_event("one")).unwrap();
        chunk.extend(frame(&text_event("two")).unwrap());
        chunk.extend(frame(&result_event()).unwrap());
        let transport = ScriptedTransport::new(vec![Script::Open(vec![Ok(chunk)])]);
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(3));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = CancelOnFirstEvent {
            consumer: consumer.clone(),
            seen: Arc::clone(&seen),
        };

        let outcome = consumer
            .connect(StartRequest::new("hi"), handler)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert_eq!(*seen.lock().unwrap(), vec![text_event("one")]);
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_before_connect_is_noop() {
        let transport = ScriptedTransport::new(Vec::new());
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(3));
        consumer.cancel().await;
        consumer.cancel().await;
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let transport = ScriptedTransport::new(vec![Script::Hang]);
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(3));
        let (handler, _rx) = ChannelHandler::new();
        let _task = consumer.connect(StartRequest::new("hi"), handler).unwrap();

        let (second, _rx2) = ChannelHandler::new();
        assert!(matches!(
            consumer.connect(StartRequest::new("again"), second),
            Err(ConsumerError::AlreadyActive)
        ));
        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_decide_posts_pending_request() {
        let request = PermissionRequest {
            id: "perm-1".to_string(),
            tool_name: "Bash".to_string(),
            tool_use_id: "tu_1".to_string(),
            input_summary: "ls".to_string(),
            input: serde_json::json!({"command": "ls"}),
            requested_at: chrono::Utc::now(),
        };
        let transport = ScriptedTransport::new(vec![Script::Open(vec![
            frame(&StreamEvent::PermissionRequest(request)),
            Ok(b": ping\n\n".to_vec()),
        ])]);
        let consumer = StreamConsumer::new(transport.clone(), "s-1", fast_settings(3));
        let (handler, mut rx) = ChannelHandler::new();

        assert!(matches!(
            consumer.decide(PermissionOutcome::Allow).await,
            Err(ConsumerError::NoPendingPermission)
        ));

        let _task = consumer.connect(StartRequest::new("hi"), handler).unwrap();
        loop {
            match rx.recv().await.unwrap() {
                ConsumerUpdate::Event(StreamEvent::PermissionRequest(_)) => break,
                _ => continue,
            }
        }

        consumer.decide(PermissionOutcome::AllowAlways).await.unwrap();
        assert!(consumer.pending_permission().is_none());
        let decisions = transport.decisions.lock().unwrap().clone();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].id, "perm-1");
        assert_eq!(decisions[0].outcome, PermissionOutcome::AllowAlways);

        consumer.cancel().await;
    }

    #[tokio::test]
    async fn test_recoverable_error_does_not_end_turn() {
        let transport = ScriptedTransport::new(vec![Script::Body(vec![
            frame(&StreamEvent::Error {
                code: ErrorCode::Internal,
                message: "transient".into(),
                recoverable: true,
            }),
            Ok(b"data: {\"type\":\"bogus\"}\n\n".to_vec()),
            frame(&result_event()),
        ])]);
        let consumer = StreamConsumer::new(transport, "s-1", fast_settings(3));
        let (handler, mut rx) = ChannelHandler::new();

        let outcome = consumer
            .connect(StartRequest::new("hi"), handler)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Finished(StreamEvent::Result(_))));
        let errors = drain(&mut rx)
            .into_iter()
            .filter(|u| matches!(u, ConsumerUpdate::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }
}
