//! One agent session: a running engine bound to a client connection.
//!
//! Engine events are forwarded by a dedicated task. Commands run on the
//! connection's worker and only ever hold the session through an `Arc`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};

use relay_core::engine::{
    AutomationEngine, EngineEvent, EngineHandle, FrameSource, StartOptions, Subscription,
};
use relay_core::ids::{ConnectionId, SessionId};
use relay_core::persistence::{MessageType, PersistenceSink};
use relay_core::protocol::{AgentStatus, ServerEvent};
use relay_core::EngineError;

use crate::broadcaster::Broadcaster;

/// Optional bounds on engine calls. `None` waits indefinitely.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionTimeouts {
    pub start: Option<Duration>,
    pub task: Option<Duration>,
}

/// Everything needed to bring a session up.
pub struct SessionParams {
    pub engine: Arc<dyn AutomationEngine>,
    pub options: StartOptions,
    pub broadcaster: Broadcaster,
    pub persistence: Arc<dyn PersistenceSink>,
    /// Persisted transcript id, if persistence assigned one.
    pub session_id: Option<SessionId>,
    pub timeouts: SessionTimeouts,
}

#[derive(Debug)]
struct SessionState {
    status: AgentStatus,
    current_url: Option<String>,
}

/// Writes to the persisted transcript, or nothing when no id was assigned.
#[derive(Clone)]
struct Transcript {
    sink: Arc<dyn PersistenceSink>,
    session_id: Option<SessionId>,
}

impl Transcript {
    async fn message(&self, kind: MessageType, content: &str) {
        if let Some(id) = &self.session_id {
            self.sink.save_message(id, kind, content).await;
        }
    }

    async fn screenshot(&self, data: &str) {
        if let Some(id) = &self.session_id {
            self.sink.save_screenshot(id, data).await;
        }
    }
}

pub struct AgentSession {
    session_id: Option<SessionId>,
    engine: Arc<dyn EngineHandle>,
    broadcaster: Broadcaster,
    transcript: Transcript,
    state: Arc<Mutex<SessionState>>,
    task_timeout: Option<Duration>,
    /// Held for the whole of a task so at most one runs at a time.
    task_lock: tokio::sync::Mutex<()>,
    subscription: Mutex<Option<Subscription>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    flush_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    stopped: AtomicBool,
    teardown_done: OnceCell<()>,
}

impl AgentSession {
    /// Start the engine and announce readiness.
    ///
    /// Emits `status: working`, then once the engine is up an initial
    /// screenshot (if one is available), `status: idle` and a `nav` to the
    /// requested URL. On error nothing past `working` has been emitted and
    /// the caller reports the failure.
    #[instrument(skip_all, fields(connection_id = %params.broadcaster.connection_id(), url = %params.options.url))]
    pub async fn start(params: SessionParams) -> Result<Arc<Self>, EngineError> {
        let SessionParams {
            engine,
            options,
            broadcaster,
            persistence,
            session_id,
            timeouts,
        } = params;
        let url = options.url.clone();

        let _ = broadcaster.emit(ServerEvent::status(AgentStatus::Working)).await;

        let handle = with_timeout(timeouts.start, "engine start", engine.start(options)).await?;
        info!(engine = engine.name(), "engine started");

        let transcript = Transcript {
            sink: persistence,
            session_id: session_id.clone(),
        };
        let state = Arc::new(Mutex::new(SessionState {
            status: AgentStatus::Working,
            current_url: None,
        }));
        let frames = handle.frames();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let subscription = handle.subscribe(events_tx);

        let forwarder = Forwarder {
            broadcaster: broadcaster.clone(),
            transcript: transcript.clone(),
            frames: Arc::clone(&frames),
            state: Arc::clone(&state),
        };
        let forwarder = tokio::spawn(forwarder.run(events_rx, flush_rx).in_current_span());

        let session = Arc::new(Self {
            session_id,
            engine: handle,
            broadcaster,
            transcript,
            state,
            task_timeout: timeouts.task,
            task_lock: tokio::sync::Mutex::new(()),
            subscription: Mutex::new(Some(subscription)),
            forwarder: Mutex::new(Some(forwarder)),
            flush_tx,
            stopped: AtomicBool::new(false),
            teardown_done: OnceCell::new(),
        });

        if let Some(data) = capture(frames.as_ref()).await {
            let _ = session.broadcaster.emit(ServerEvent::Screenshot { data }).await;
        }
        session.set_status(AgentStatus::Idle).await;
        let _ = session.broadcaster.emit(ServerEvent::Nav { url }).await;

        Ok(session)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.broadcaster.connection_id()
    }

    pub fn status(&self) -> AgentStatus {
        self.state.lock().status
    }

    /// Last URL the engine navigated to.
    pub fn current_url(&self) -> Option<String> {
        self.state.lock().current_url.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run one natural-language task.
    ///
    /// All engine events raised while the task runs are emitted before its
    /// `taskComplete`, and the session always returns to `idle` afterwards.
    #[instrument(skip_all, fields(connection_id = %self.connection_id()))]
    pub async fn execute_task(&self, task: &str) {
        let _guard = self.task_lock.lock().await;

        self.set_status(AgentStatus::Working).await;
        self.transcript.message(MessageType::User, task).await;

        let outcome = with_timeout(self.task_timeout, "task", self.engine.act(task)).await;
        self.flush().await;

        match outcome {
            Ok(()) => {
                debug!("task complete");
                let _ = self.broadcaster.emit(ServerEvent::TaskComplete { success: true }).await;
            }
            Err(e) => {
                warn!(incident = "task_failure", error = %e, kind = e.error_kind(), "task failed");
                let message = e.to_string();
                let _ = self.broadcaster.emit(ServerEvent::error(message.clone())).await;
                let _ = self.broadcaster.emit(ServerEvent::TaskComplete { success: false }).await;
                self.transcript
                    .message(MessageType::System, &format!("Error: {message}"))
                    .await;
            }
        }

        self.set_status(AgentStatus::Idle).await;
    }

    /// Stop the engine and detach from its events. Runs once; later calls return immediately.
    #[instrument(skip_all, fields(connection_id = %self.connection_id()))]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.engine.stop().await {
            warn!(incident = "teardown_failure", error = %e, "engine stop failed");
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        info!("session stopped");
    }

    /// End the persisted transcript, then stop. Concurrent callers all wait
    /// for the single teardown to finish.
    pub(crate) async fn teardown(&self, persistence: &dyn PersistenceSink) {
        self.teardown_done
            .get_or_init(|| async move {
                if let Some(session_id) = &self.session_id {
                    persistence.end_session(session_id).await;
                }
                self.stop().await;
            })
            .await;
    }

    async fn set_status(&self, status: AgentStatus) {
        self.state.lock().status = status;
        let _ = self.broadcaster.emit(ServerEvent::status(status)).await;
    }

    /// Wait until the forwarder has handled every event received so far.
    async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Forwards engine events to the client and the transcript.
struct Forwarder {
    broadcaster: Broadcaster,
    transcript: Transcript,
    frames: Arc<dyn FrameSource>,
    state: Arc<Mutex<SessionState>>,
}

impl Forwarder {
    async fn run(
        self,
        mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
        mut flush_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) {
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                event = events_rx.recv(), if events_open => match event {
                    Some(event) => self.forward(event).await,
                    None => events_open = false,
                },
                ack = flush_rx.recv() => match ack {
                    Some(ack) => {
                        while let Ok(event) = events_rx.try_recv() {
                            self.forward(event).await;
                        }
                        let _ = ack.send(());
                    }
                    None => break,
                },
            }
        }
    }

    async fn forward(&self, event: EngineEvent) {
        match event {
            EngineEvent::Thought(content) => {
                let _ = self
                    .broadcaster
                    .emit(ServerEvent::Thought {
                        content: content.clone(),
                    })
                    .await;
                self.transcript.message(MessageType::Thought, &content).await;
            }
            EngineEvent::ActionDone(action) => {
                let _ = self
                    .broadcaster
                    .emit(ServerEvent::Action {
                        action: action.variant.clone(),
                        target: action.display_target().map(str::to_owned),
                    })
                    .await;
                self.transcript
                    .message(MessageType::Action, &action.transcript_line())
                    .await;

                if let Some(data) = capture(self.frames.as_ref()).await {
                    let _ = self
                        .broadcaster
                        .emit(ServerEvent::Screenshot { data: data.clone() })
                        .await;
                    self.transcript.screenshot(&data).await;
                }
            }
            EngineEvent::Nav(url) => {
                self.state.lock().current_url = Some(url.clone());
                let _ = self.broadcaster.emit(ServerEvent::Nav { url }).await;
            }
        }
    }
}

/// Best-effort screenshot as base64. Failures are logged and yield `None`.
async fn capture(frames: &dyn FrameSource) -> Option<String> {
    match frames.last_screenshot().await {
        Ok(Some(frame)) => Some(frame.to_base64()),
        Ok(None) => {
            debug!("no frame available yet");
            None
        }
        Err(e) => {
            warn!(incident = "capture_failure", error = %e, "screenshot capture failed");
            None
        }
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    operation: &'static str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .unwrap_or(Err(EngineError::Timeout { operation, after })),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::engine::{EngineAction, Frame, LlmConfig};
    use relay_core::persistence::DisabledSink;
    use relay_engine::{MockEngine, MockFrames, MockScript};
    use relay_store::history::HistoryReader;
    use relay_store::{Database, SqliteSink};
    use serde_json::Value;

    fn options(url: &str) -> StartOptions {
        StartOptions {
            url: url.into(),
            llm: LlmConfig {
                provider: "anthropic".into(),
                model: "test-model".into(),
                api_key: None,
            },
        }
    }

    fn params(
        engine: &MockEngine,
        broadcaster: Broadcaster,
        persistence: Arc<dyn PersistenceSink>,
        session_id: Option<SessionId>,
    ) -> SessionParams {
        SessionParams {
            engine: Arc::new(engine.clone()),
            options: options("https://example.com"),
            broadcaster,
            persistence,
            session_id,
            timeouts: SessionTimeouts::default(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e["type"].as_str().unwrap() {
                "status" => format!("status:{}", e["status"].as_str().unwrap()),
                other => other.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn start_announces_readiness() {
        let engine = MockEngine::new();
        engine.frames(MockFrames::Image(Frame::new(vec![1, 2, 3])));
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);

        let session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(types(&events), ["status:working", "screenshot", "status:idle", "nav"]);
        assert_eq!(events[3]["url"], "https://example.com");
        assert_eq!(session.status(), AgentStatus::Idle);
        assert!(session.current_url().is_none());
    }

    #[tokio::test]
    async fn start_without_frame_skips_initial_screenshot() {
        let engine = MockEngine::new();
        engine.frames(MockFrames::Failing("no page".into()));
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);

        let _session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();
        assert_eq!(types(&drain(&mut rx)), ["status:working", "status:idle", "nav"]);
    }

    #[tokio::test]
    async fn start_failure_is_returned() {
        let engine = MockEngine::new();
        engine.fail_start("browser crashed");
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);

        let err = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "browser crashed");
        assert_eq!(types(&drain(&mut rx)), ["status:working"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_timeout_is_reported() {
        let engine = MockEngine::new();
        engine.start_delay(Duration::from_secs(60));
        let (b, _rx) = Broadcaster::channel(ConnectionId::new(), 64);
        let mut p = params(&engine, b, Arc::new(DisabledSink), None);
        p.timeouts.start = Some(Duration::from_secs(5));

        let err = AgentSession::start(p).await.err().unwrap();
        assert!(matches!(err, EngineError::Timeout { operation: "engine start", .. }));
    }

    #[tokio::test]
    async fn task_events_precede_completion() {
        let engine = MockEngine::new();
        engine.frames(MockFrames::Image(Frame::new(vec![9])));
        engine.push_script(MockScript::events(vec![
            EngineEvent::Thought("I need to find the login button".into()),
            EngineEvent::ActionDone(EngineAction {
                variant: "click".into(),
                target: Some("login".into()),
                content: None,
            }),
            EngineEvent::Nav("https://example.com/login".into()),
        ]));
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);
        let session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();
        drain(&mut rx);

        session.execute_task("Click the login button").await;

        let events = drain(&mut rx);
        assert_eq!(
            types(&events),
            ["status:working", "thought", "action", "screenshot", "nav", "taskComplete", "status:idle"]
        );
        assert_eq!(events[2]["action"], "click");
        assert_eq!(events[2]["target"], "login");
        assert_eq!(events[5]["success"], true);
        assert_eq!(session.current_url().as_deref(), Some("https://example.com/login"));
        assert_eq!(session.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn failed_task_reports_error_then_idles() {
        let engine = MockEngine::new();
        engine.push_script(MockScript::failing("Element not found"));
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);
        let session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();
        drain(&mut rx);

        session.execute_task("click nothing").await;

        let events = drain(&mut rx);
        assert_eq!(
            types(&events),
            ["status:working", "error", "taskComplete", "status:idle"]
        );
        assert_eq!(events[1]["message"], "Element not found");
        assert_eq!(events[2]["success"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_fails_task() {
        let engine = MockEngine::new();
        engine.push_script(MockScript::events(vec![]).with_delay(Duration::from_secs(600)));
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);
        let mut p = params(&engine, b, Arc::new(DisabledSink), None);
        p.timeouts.task = Some(Duration::from_secs(30));
        let session = AgentSession::start(p).await.unwrap();
        drain(&mut rx);

        session.execute_task("slow").await;

        let events = drain(&mut rx);
        assert_eq!(events[1]["type"], "error");
        assert_eq!(events[1]["message"], "task timed out after 30s");
        assert_eq!(events[2]["success"], false);
    }

    #[tokio::test]
    async fn screenshot_failure_does_not_break_task() {
        let engine = MockEngine::new();
        engine.frames(MockFrames::Failing("capture broke".into()));
        let (b, mut rx) = Broadcaster::channel(ConnectionId::new(), 64);
        let session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();
        drain(&mut rx);

        session.execute_task("search for shoes").await;

        let events = drain(&mut rx);
        assert_eq!(
            types(&events),
            ["status:working", "thought", "action", "taskComplete", "status:idle"]
        );
        assert_eq!(events[3]["success"], true);
    }

    #[tokio::test]
    async fn concurrent_tasks_run_one_at_a_time() {
        let engine = MockEngine::new();
        engine.push_script(MockScript::events(vec![]).with_delay(Duration::from_millis(20)));
        engine.push_script(MockScript::events(vec![]).with_delay(Duration::from_millis(20)));
        let (b, _rx) = Broadcaster::channel(ConnectionId::new(), 256);
        let session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();

        let a = Arc::clone(&session);
        let c = Arc::clone(&session);
        tokio::join!(a.execute_task("one"), c.execute_task("two"));

        let stats = engine.stats();
        assert_eq!(stats.acts, 2);
        assert_eq!(stats.max_concurrent_acts, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let engine = MockEngine::new();
        let (b, _rx) = Broadcaster::channel(ConnectionId::new(), 64);
        let session = AgentSession::start(params(&engine, b, Arc::new(DisabledSink), None))
            .await
            .unwrap();

        session.stop().await;
        session.stop().await;
        assert!(session.is_stopped());
        assert_eq!(engine.stats().stops, 1);
    }

    #[tokio::test]
    async fn transcript_is_persisted() {
        let db = Database::in_memory().unwrap();
        let sink = Arc::new(SqliteSink::new(db.clone()));
        let sid = sink.create_session("https://example.com").await.unwrap();

        let engine = MockEngine::new();
        engine.frames(MockFrames::Image(Frame::new(vec![7])));
        engine.push_script(MockScript::events(vec![
            EngineEvent::Thought("looking".into()),
            EngineEvent::ActionDone(EngineAction {
                variant: "type".into(),
                target: None,
                content: Some("shoes".into()),
            }),
        ]));
        engine.push_script(MockScript::failing("Element not found"));
        let (b, _rx) = Broadcaster::channel(ConnectionId::new(), 256);
        let session = AgentSession::start(params(&engine, b, sink, Some(sid.clone())))
            .await
            .unwrap();

        session.execute_task("search").await;
        session.execute_task("click").await;

        let history = HistoryReader::new(db).session_history(&sid).unwrap();
        let lines: Vec<(String, String)> = history
            .messages
            .iter()
            .map(|m| (m.kind.to_string(), m.content.clone()))
            .collect();
        assert_eq!(
            lines,
            [
                ("user".to_string(), "search".to_string()),
                ("thought".to_string(), "looking".to_string()),
                ("action".to_string(), "type: shoes".to_string()),
                ("user".to_string(), "click".to_string()),
                ("system".to_string(), "Error: Element not found".to_string()),
            ]
        );
        // The initial readiness frame is not persisted.
        assert_eq!(history.screenshots.len(), 1);
    }
}
