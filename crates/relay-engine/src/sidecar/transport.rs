//! Request/response multiplexing over the sidecar's stdio.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::wire::{self, Incoming};
use crate::listeners::EventHub;

/// Why a call did not produce a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallError {
    /// The sidecar answered with an error message.
    Remote(String),
    /// The pipe closed or the process went away.
    Closed(String),
}

type PendingTx = oneshot::Sender<Result<Value, CallError>>;

struct Call {
    method: &'static str,
    params: Value,
    response_tx: PendingTx,
}

/// Cloneable client side of the sidecar connection.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::Sender<Call>,
    closing: Arc<AtomicBool>,
}

impl Transport {
    /// Start the handler loop. Notifications read from `reader` go to `hub`.
    pub fn spawn<R, W>(reader: R, writer: W, hub: EventHub) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Call>(64);
        let closing = Arc::new(AtomicBool::new(false));
        let handler = tokio::spawn(handler_loop(reader, writer, cmd_rx, hub, Arc::clone(&closing)));
        (Self { cmd_tx, closing }, handler)
    }

    pub async fn call(&self, method: &'static str, params: Value) -> Result<Value, CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Call {
                method,
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| CallError::Closed("sidecar connection closed".into()))?;

        rx.await
            .map_err(|_| CallError::Closed("response dropped".into()))?
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// The sidecar is about to be told to stop; its exit is no longer news.
    pub fn begin_shutdown(&self) {
        self.closing.store(true, Ordering::Release);
    }
}

async fn handler_loop<R, W>(
    reader: R,
    mut writer: W,
    mut cmd_rx: mpsc::Receiver<Call>,
    hub: EventHub,
    closing: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let mut next_id: u64 = 1;

    let reason = loop {
        tokio::select! {
            call = cmd_rx.recv() => {
                let Some(call) = call else { break "client dropped".to_string() };
                let id = next_id;
                next_id += 1;

                let line = match wire::encode_request(id, call.method, &call.params) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = call.response_tx.send(Err(CallError::Remote(format!("encode request: {e}"))));
                        continue;
                    }
                };
                debug!(id, method = call.method, "sidecar request");
                let _ = pending.insert(id, call.response_tx);

                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    break format!("write failed: {e}");
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break "sidecar closed its output".to_string(),
                    Err(e) => break format!("read failed: {e}"),
                };
                if line.trim().is_empty() {
                    continue;
                }
                match wire::parse_line(&line) {
                    Ok(Incoming::Response { id, outcome }) => {
                        if let Some(tx) = pending.remove(&id) {
                            let _ = tx.send(outcome.map_err(CallError::Remote));
                        } else {
                            warn!(id, "response for unknown request");
                        }
                    }
                    Ok(Incoming::Event(event)) => hub.publish(&event),
                    Err(e) => warn!(error = %e, line = %truncate(&line, 200), "unparseable sidecar line"),
                }
            }
        }
    };

    if closing.load(Ordering::Acquire) {
        debug!(reason = %reason, pending = pending.len(), "sidecar transport stopped");
    } else {
        warn!(incident = "engine_exit", reason = %reason, pending = pending.len(), "sidecar went away");
    }

    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CallError::Closed(reason.clone())));
    }
    cmd_rx.close();
    while let Ok(call) = cmd_rx.try_recv() {
        let _ = call.response_tx.send(Err(CallError::Closed(reason.clone())));
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
