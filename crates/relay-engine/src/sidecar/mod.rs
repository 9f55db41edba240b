//! Engine backed by an external browser-agent process.
//!
//! The process is spawned with piped stdio and spoken to with the
//! line protocol in [`wire`]. Its stderr is forwarded to the log.

mod transport;
pub mod wire;

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_core::engine::{
    AutomationEngine, EngineHandle, EngineEvent, Frame, FrameSource, StartOptions, Subscription,
};
use relay_core::errors::EngineError;

use crate::listeners::EventHub;
pub use transport::{CallError, Transport};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// How to launch the sidecar.
#[derive(Clone, Debug)]
pub struct SidecarConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            command: "npx".into(),
            args: vec!["browser-agent-sidecar".into()],
        }
    }
}

pub struct SidecarEngine {
    config: SidecarConfig,
}

impl SidecarEngine {
    pub fn new(config: SidecarConfig) -> Self {
        Self { config }
    }

    fn spawn_child(&self) -> Result<Child, EngineError> {
        Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Start(format!("failed to launch {}: {e}", self.config.command)))
    }
}

#[async_trait]
impl AutomationEngine for SidecarEngine {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn start(&self, options: StartOptions) -> Result<Arc<dyn EngineHandle>, EngineError> {
        let mut child = self.spawn_child()?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(EngineError::Start("sidecar stdio unavailable".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            let _ = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "relay_engine::sidecar::stderr", "{line}");
                }
            });
        }

        let hub = EventHub::new();
        let (transport, handler) = Transport::spawn(stdout, stdin, hub.clone());
        let handle = SidecarHandle {
            transport,
            hub,
            child: Mutex::new(Some(child)),
            handler,
            stopped: AtomicBool::new(false),
        };

        info!(?pid, url = %options.url, "sidecar launched");

        match handle.transport.call("start", start_params(&options)).await {
            Ok(_) => Ok(Arc::new(handle)),
            Err(e) => {
                let _ = handle.stop().await;
                Err(match e {
                    CallError::Remote(msg) => EngineError::Start(msg),
                    CallError::Closed(reason) => {
                        EngineError::Start(format!("sidecar exited during start: {reason}"))
                    }
                })
            }
        }
    }
}

fn start_params(options: &StartOptions) -> Value {
    let mut llm = json!({
        "provider": options.llm.provider,
        "model": options.llm.model,
    });
    if let Some(key) = &options.llm.api_key {
        llm["apiKey"] = Value::String(key.expose_secret().to_string());
    }
    json!({ "url": options.url, "llm": llm })
}

/// One running sidecar process.
pub struct SidecarHandle {
    transport: Transport,
    hub: EventHub,
    child: Mutex<Option<Child>>,
    handler: JoinHandle<()>,
    stopped: AtomicBool,
}

#[async_trait]
impl EngineHandle for SidecarHandle {
    fn subscribe(&self, sink: tokio::sync::mpsc::UnboundedSender<EngineEvent>) -> Subscription {
        self.hub.subscribe(sink)
    }

    async fn act(&self, task: &str) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        self.transport
            .call("act", json!({ "task": task }))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                CallError::Remote(msg) => EngineError::Task(msg),
                CallError::Closed(reason) => EngineError::Transport(reason),
            })
    }

    async fn stop(&self) -> Result<(), EngineError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transport.begin_shutdown();

        if !self.transport.is_closed() {
            match tokio::time::timeout(STOP_GRACE, self.transport.call("stop", json!({}))).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(?e, "sidecar stop request failed"),
                Err(_) => warn!("sidecar did not acknowledge stop in time"),
            }
        }

        self.handler.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "sidecar already gone");
            }
        }
        info!("sidecar stopped");
        Ok(())
    }

    fn frames(&self) -> Arc<dyn FrameSource> {
        Arc::new(SidecarFrames {
            transport: self.transport.clone(),
        })
    }
}

/// Screenshot connector over the same transport.
struct SidecarFrames {
    transport: Transport,
}

#[async_trait]
impl FrameSource for SidecarFrames {
    async fn last_screenshot(&self) -> Result<Option<Frame>, EngineError> {
        let result = self
            .transport
            .call("screenshot", json!({}))
            .await
            .map_err(|e| match e {
                CallError::Remote(msg) => EngineError::Capture(msg),
                CallError::Closed(reason) => EngineError::Transport(reason),
            })?;

        match result.get("data").and_then(Value::as_str) {
            Some(data) if !data.is_empty() => Frame::from_base64(data).map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::engine::LlmConfig;
    use secrecy::SecretString;

    fn options(api_key: Option<&str>) -> StartOptions {
        StartOptions {
            url: "https://example.com".into(),
            llm: LlmConfig {
                provider: "anthropic".into(),
                model: "claude-sonnet-4-20250514".into(),
                api_key: api_key.map(|k| SecretString::from(k.to_string())),
            },
        }
    }

    #[test]
    fn start_params_include_llm_settings() {
        let params = start_params(&options(Some("sk-test")));
        assert_eq!(params["url"], "https://example.com");
        assert_eq!(params["llm"]["model"], "claude-sonnet-4-20250514");
        assert_eq!(params["llm"]["apiKey"], "sk-test");
    }

    #[test]
    fn start_params_omit_missing_key() {
        let params = start_params(&options(None));
        assert!(params["llm"].get("apiKey").is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_start_error() {
        let engine = SidecarEngine::new(SidecarConfig {
            command: "/nonexistent/relay-sidecar-binary".into(),
            args: vec![],
        });
        let err = engine.start(options(None)).await.err().unwrap();
        assert!(matches!(err, EngineError::Start(_)));
        assert!(err.to_string().contains("failed to launch"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sidecar_that_exits_immediately_fails_start() {
        let engine = SidecarEngine::new(SidecarConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
        });
        let err = engine.start(options(None)).await.err().unwrap();
        assert!(matches!(err, EngineError::Start(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_sidecar_round_trip() {
        // Answers start, emits a thought then acks act, reports no frame.
        let script = r#"
read line; echo '{"id":1,"result":{}}'
read line; echo '{"event":"thought","text":"on it"}'; echo '{"id":2,"result":null}'
read line; echo '{"id":3,"result":{"data":null}}'
read line; echo '{"id":4,"result":null}'
"#;
        let engine = SidecarEngine::new(SidecarConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
        });
        let handle = engine.start(options(None)).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = handle.subscribe(tx);

        handle.act("say hi").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Thought("on it".into()));

        assert!(handle.frames().last_screenshot().await.unwrap().is_none());

        handle.stop().await.unwrap();
        handle.stop().await.unwrap();
        assert!(matches!(handle.act("again").await, Err(EngineError::NotRunning)));
    }
}
