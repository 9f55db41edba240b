//! Scripted in-process engine.
//!
//! Each `act` consumes the next queued [`MockScript`]; when the queue is empty
//! a default script echoes the task as one thought and one click.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relay_core::engine::{
    AutomationEngine, EngineAction, EngineEvent, EngineHandle, Frame, FrameSource, StartOptions,
    Subscription,
};
use relay_core::errors::EngineError;

use crate::listeners::EventHub;

/// 1x1 transparent PNG.
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// What one `act` call does.
#[derive(Clone, Debug, Default)]
pub struct MockScript {
    pub events: Vec<EngineEvent>,
    /// Sleep before emitting events.
    pub delay: Option<Duration>,
    /// `Some(msg)` makes the task fail with `msg`.
    pub failure: Option<String>,
}

impl MockScript {
    pub fn events(events: Vec<EngineEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn echo(task: &str) -> Self {
        Self::events(vec![
            EngineEvent::Thought(format!("Working on: {task}")),
            EngineEvent::ActionDone(EngineAction {
                variant: "click".into(),
                target: Some(task.to_string()),
                content: None,
            }),
        ])
    }
}

/// Screenshot behaviour.
#[derive(Clone, Debug)]
pub enum MockFrames {
    Missing,
    Image(Frame),
    Failing(String),
}

#[derive(Default)]
struct Counters {
    starts: AtomicUsize,
    acts: AtomicUsize,
    stops: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct Shared {
    scripts: Mutex<VecDeque<MockScript>>,
    start_failure: Mutex<Option<String>>,
    start_delay: Mutex<Option<Duration>>,
    frames: Mutex<MockFrames>,
    tasks: Mutex<Vec<String>>,
    counters: Counters,
}

/// Snapshot of how the engine has been driven.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    pub starts: usize,
    pub acts: usize,
    pub stops: usize,
    pub max_concurrent_acts: usize,
}

#[derive(Clone)]
pub struct MockEngine {
    shared: Arc<Shared>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts: Mutex::new(VecDeque::new()),
                start_failure: Mutex::new(None),
                start_delay: Mutex::new(None),
                frames: Mutex::new(MockFrames::Image(Frame::new(PLACEHOLDER_PNG))),
                tasks: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Every subsequent `start` fails with `message`.
    pub fn fail_start(&self, message: impl Into<String>) -> &Self {
        *self.shared.start_failure.lock() = Some(message.into());
        self
    }

    pub fn start_delay(&self, delay: Duration) -> &Self {
        *self.shared.start_delay.lock() = Some(delay);
        self
    }

    pub fn frames(&self, frames: MockFrames) -> &Self {
        *self.shared.frames.lock() = frames;
        self
    }

    pub fn push_script(&self, script: MockScript) -> &Self {
        self.shared.scripts.lock().push_back(script);
        self
    }

    /// Tasks received by `act`, in order.
    pub fn tasks(&self) -> Vec<String> {
        self.shared.tasks.lock().clone()
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.shared.counters;
        MockStats {
            starts: c.starts.load(Ordering::SeqCst),
            acts: c.acts.load(Ordering::SeqCst),
            stops: c.stops.load(Ordering::SeqCst),
            max_concurrent_acts: c.max_in_flight.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl AutomationEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, _options: StartOptions) -> Result<Arc<dyn EngineHandle>, EngineError> {
        self.shared.counters.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.shared.start_failure.lock().clone();
        if let Some(message) = failure {
            return Err(EngineError::Start(message));
        }
        Ok(Arc::new(MockHandle {
            shared: Arc::clone(&self.shared),
            hub: EventHub::new(),
            stopped: AtomicBool::new(false),
        }))
    }
}

pub struct MockHandle {
    shared: Arc<Shared>,
    hub: EventHub,
    stopped: AtomicBool,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineHandle for MockHandle {
    fn subscribe(&self, sink: mpsc::UnboundedSender<EngineEvent>) -> Subscription {
        self.hub.subscribe(sink)
    }

    async fn act(&self, task: &str) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        self.shared.counters.acts.fetch_add(1, Ordering::SeqCst);
        self.shared.tasks.lock().push(task.to_string());
        let _guard = InFlight::enter(&self.shared.counters);

        let script = self
            .shared
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockScript::echo(task));

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        for event in &script.events {
            self.hub.publish(event);
        }
        match script.failure {
            Some(message) => Err(EngineError::Task(message)),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), EngineError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.shared.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn frames(&self) -> Arc<dyn FrameSource> {
        Arc::new(MockFrameSource {
            shared: Arc::clone(&self.shared),
        })
    }
}

struct MockFrameSource {
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameSource for MockFrameSource {
    async fn last_screenshot(&self) -> Result<Option<Frame>, EngineError> {
        match &*self.shared.frames.lock() {
            MockFrames::Missing => Ok(None),
            MockFrames::Image(frame) => Ok(Some(frame.clone())),
            MockFrames::Failing(message) => Err(EngineError::Capture(message.clone())),
        }
    }
}
