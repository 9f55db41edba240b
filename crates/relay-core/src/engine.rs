//! Contracts the relay needs from the browser-automation engine.
//!
//! The engine itself (LLM reasoning, DOM interaction, screenshot capture) is
//! an external collaborator. The relay only starts it, subscribes to its
//! events, runs one task at a time on it, grabs frames, and stops it.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::errors::EngineError;

/// LLM settings handed through to the engine on start.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct StartOptions {
    pub url: String,
    pub llm: LlmConfig,
}

/// A completed browser interaction as reported by the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineAction {
    pub variant: String,
    pub target: Option<String>,
    pub content: Option<String>,
}

impl EngineAction {
    /// The action's target, falling back to its content. Empty strings count as absent.
    pub fn display_target(&self) -> Option<&str> {
        self.target
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.content.as_deref().filter(|c| !c.is_empty()))
    }

    /// Transcript line for this action: `"{variant}: {target}"` or just the variant.
    pub fn transcript_line(&self) -> String {
        match self.display_target() {
            Some(target) => format!("{}: {}", self.variant, target),
            None => self.variant.clone(),
        }
    }
}

/// Events an engine emits asynchronously while it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    Thought(String),
    ActionDone(EngineAction),
    Nav(String),
}

/// A captured page frame (PNG bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    png: Bytes,
}

impl Frame {
    pub fn new(png: impl Into<Bytes>) -> Self {
        Self { png: png.into() }
    }

    /// Decode a frame delivered as base64 text.
    pub fn from_base64(data: &str) -> Result<Self, EngineError> {
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map(Self::new)
            .map_err(|e| EngineError::Capture(format!("invalid base64 frame: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.png
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.png)
    }
}

/// Source of the last rendered page frame.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// `Ok(None)` means no frame has been rendered yet, which is not an error.
    async fn last_screenshot(&self) -> Result<Option<Frame>, EngineError>;
}

/// Unsubscribe handle returned by [`EngineHandle::subscribe`].
///
/// Dropping it unsubscribes as well; `unsubscribe` makes that explicit.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// One running engine instance (one browser).
///
/// Implementations must deliver every event raised during `act` to
/// subscribers before `act` resolves.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn subscribe(&self, sink: mpsc::UnboundedSender<EngineEvent>) -> Subscription;

    /// Run one task to completion.
    async fn act(&self, task: &str) -> Result<(), EngineError>;

    /// Terminate the engine and release its browser. Idempotent.
    async fn stop(&self) -> Result<(), EngineError>;

    /// The connector used for on-demand screenshots.
    fn frames(&self) -> Arc<dyn FrameSource>;
}

/// Factory for engine instances.
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Bring up a browser-controlled agent at `options.url`. May take arbitrarily long.
    async fn start(&self, options: StartOptions) -> Result<Arc<dyn EngineHandle>, EngineError>;
}
