//! Client command handlers.
//!
//! Each connection's commands are dispatched one at a time by its worker, so
//! a handler here runs to completion before the next command is read.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use relay_core::engine::{AutomationEngine, LlmConfig, StartOptions};
use relay_core::ids::ConnectionId;
use relay_core::persistence::PersistenceSink;
use relay_core::protocol::{decode_command, AgentStatus, ClientCommand, Inbound, ServerEvent};
use relay_core::EngineError;

use crate::broadcaster::Broadcaster;
use crate::registry::SessionRegistry;
use crate::session::{AgentSession, SessionParams, SessionTimeouts};

pub const NO_SESSION_MESSAGE: &str = "No active session. Please start an agent first.";
pub const MALFORMED_MESSAGE: &str = "Failed to process message";

/// Shared state available to all command handlers.
pub struct HandlerState {
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<dyn AutomationEngine>,
    pub persistence: Arc<dyn PersistenceSink>,
    pub llm: LlmConfig,
    pub timeouts: SessionTimeouts,
}

impl HandlerState {
    pub fn new(
        engine: Arc<dyn AutomationEngine>,
        persistence: Arc<dyn PersistenceSink>,
        llm: LlmConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(Arc::clone(&persistence))),
            engine,
            persistence,
            llm,
            timeouts: SessionTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Decode one text frame and run the command it carries.
pub async fn dispatch(state: &HandlerState, out: &Broadcaster, raw: &str) {
    match decode_command(raw) {
        Ok(Inbound::Command(command)) => handle_command(state, out, command).await,
        Ok(Inbound::Unknown(kind)) => {
            warn!(connection_id = %out.connection_id(), kind = ?kind, "ignoring unknown message type");
        }
        Err(e) => {
            warn!(incident = "decode_failure", connection_id = %out.connection_id(), error = %e, "failed to decode client message");
            let _ = out.emit(ServerEvent::error(MALFORMED_MESSAGE)).await;
        }
    }
}

async fn handle_command(state: &HandlerState, out: &Broadcaster, command: ClientCommand) {
    debug!(connection_id = %out.connection_id(), command = command.command_type(), "handling command");
    match command {
        ClientCommand::Start { url } => start_session(state, out, url).await,
        ClientCommand::Task { content } => run_task(state, out, &content).await,
        ClientCommand::Stop => stop_session(state, out).await,
    }
}

#[instrument(skip(state, out), fields(connection_id = %out.connection_id()))]
async fn start_session(state: &HandlerState, out: &Broadcaster, url: String) {
    let connection_id = out.connection_id().clone();
    let result = state
        .registry
        .replace(&connection_id, || launch(state, out, url))
        .await;

    match result {
        Ok(session) => {
            info!(session_id = ?session.session_id(), "agent session ready");
        }
        Err(e) => {
            warn!(incident = "start_failure", error = %e, kind = e.error_kind(), "failed to start agent");
            let _ = out.emit(ServerEvent::error(e.to_string())).await;
            let _ = out.emit(ServerEvent::status(AgentStatus::Error)).await;
        }
    }
}

/// Open the transcript and start the engine. A transcript opened for a
/// session that never came up is ended straight away.
async fn launch(
    state: &HandlerState,
    out: &Broadcaster,
    url: String,
) -> Result<Arc<AgentSession>, EngineError> {
    let session_id = state.persistence.create_session(&url).await;
    let params = SessionParams {
        engine: Arc::clone(&state.engine),
        options: StartOptions {
            url,
            llm: state.llm.clone(),
        },
        broadcaster: out.clone(),
        persistence: Arc::clone(&state.persistence),
        session_id: session_id.clone(),
        timeouts: state.timeouts,
    };

    match AgentSession::start(params).await {
        Ok(session) => Ok(session),
        Err(e) => {
            if let Some(id) = &session_id {
                state.persistence.end_session(id).await;
            }
            Err(e)
        }
    }
}

async fn run_task(state: &HandlerState, out: &Broadcaster, content: &str) {
    match state.registry.get(out.connection_id()) {
        Some(session) => session.execute_task(content).await,
        None => {
            let _ = out.emit(ServerEvent::error(NO_SESSION_MESSAGE)).await;
        }
    }
}

async fn stop_session(state: &HandlerState, out: &Broadcaster) {
    let _ = state.registry.remove(out.connection_id()).await;
    let _ = out.emit(ServerEvent::status(AgentStatus::Disconnected)).await;
}

/// Connection closed: tear down its session without notifying anyone.
pub async fn handle_close(state: &HandlerState, connection_id: &ConnectionId) {
    if state.registry.remove(connection_id).await {
        info!(connection_id = %connection_id, "session torn down on close");
    }
}
