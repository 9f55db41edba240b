//! WebSocket connection channel.
//!
//! Each socket is split into a writer task (outbound queue + heartbeat
//! pings), a reader task (frames → command queue) and a worker that runs
//! commands strictly one after another. Closing the socket tears down the
//! connection's session right away; a command already running finishes on
//! its own and anything still queued is dropped.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use relay_core::ids::ConnectionId;

use crate::broadcaster::Broadcaster;
use crate::handlers::{self, HandlerState};

/// Per-connection channel settings.
#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
        }
    }
}

/// Time of the last frame received from the client.
struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Serve one upgraded WebSocket until it closes or `shutdown` fires.
pub async fn serve_socket(
    socket: WebSocket,
    state: Arc<HandlerState>,
    config: ChannelConfig,
    shutdown: CancellationToken,
) {
    let connection_id = ConnectionId::new();
    let span = info_span!("connection", connection_id = %connection_id);
    run(socket, connection_id, state, config, shutdown)
        .instrument(span)
        .await;
}

async fn run(
    socket: WebSocket,
    connection_id: ConnectionId,
    state: Arc<HandlerState>,
    config: ChannelConfig,
    shutdown: CancellationToken,
) {
    info!("client connected");
    let (ws_tx, ws_rx) = socket.split();
    let (broadcaster, out_rx) = Broadcaster::channel(connection_id.clone(), config.max_send_queue);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
    let liveness = Arc::new(Liveness::new());
    let closed = CancellationToken::new();

    let mut writer = tokio::spawn(
        write_loop(ws_tx, out_rx, Arc::clone(&liveness), config, shutdown.clone()).in_current_span(),
    );
    let mut reader = tokio::spawn(read_loop(ws_rx, cmd_tx, Arc::clone(&liveness)).in_current_span());
    let worker = tokio::spawn(
        work_loop(Arc::clone(&state), broadcaster, cmd_rx, closed.clone()).in_current_span(),
    );

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
    }
    reader.abort();
    closed.cancel();

    handlers::handle_close(&state, &connection_id).await;
    let _ = worker.await;
    writer.abort();
    info!("client disconnected");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut out_rx: mpsc::Receiver<String>,
    liveness: Arc<Liveness>,
    config: ChannelConfig,
    shutdown: CancellationToken,
) {
    let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if liveness.idle_for() > config.client_timeout {
                    warn!(incident = "client_timeout", "client timed out");
                    break;
                }
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                trace!("sent ping");
            }
            _ = shutdown.cancelled() => {
                debug!("server shutting down, closing socket");
                break;
            }
        }
    }
    let _ = ws_tx.close().await;
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    cmd_tx: mpsc::UnboundedSender<String>,
    liveness: Arc<Liveness>,
) {
    while let Some(Ok(msg)) = ws_rx.next().await {
        liveness.touch();
        match msg {
            WsMessage::Text(text) => {
                if cmd_tx.send(text.to_string()).is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            // Pings are answered by axum; pongs only refresh liveness.
            _ => {}
        }
    }
}

/// Run queued commands one at a time. After `closed` fires, the command in
/// progress completes, the rest are dropped, and the session (possibly one
/// the last command created) is torn down.
async fn work_loop(
    state: Arc<HandlerState>,
    broadcaster: Broadcaster,
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            raw = cmd_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        handlers::dispatch(&state, &broadcaster, &raw).await;
    }
    handlers::handle_close(&state, broadcaster.connection_id()).await;
}
