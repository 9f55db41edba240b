//! Automation engine implementations.
//!
//! [`SidecarEngine`] drives an external browser-agent process over
//! line-delimited JSON on its stdio. [`MockEngine`] is a scripted in-process
//! engine for tests and offline runs.

pub mod listeners;
pub mod mock;
pub mod sidecar;

pub use listeners::EventHub;
pub use mock::{MockEngine, MockFrames, MockScript};
pub use sidecar::{SidecarConfig, SidecarEngine};
