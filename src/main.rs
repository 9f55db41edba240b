//! # relay
//!
//! Relay server binary: loads settings, initializes telemetry, opens the
//! transcript store, builds the automation engine and serves clients until
//! Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tracing::{info, warn};

use relay_core::engine::{AutomationEngine, LlmConfig};
use relay_core::persistence::{DisabledSink, PersistenceSink};
use relay_engine::{MockEngine, SidecarConfig, SidecarEngine};
use relay_server::settings::{load_settings, EngineKind, RelaySettings};
use relay_server::{AvatarBroker, HandlerState, ServerConfig, Services, SessionTimeouts};
use relay_store::{Database, HistoryReader, SqliteSink};

/// Browser-agent chat relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Browser-agent chat relay")]
struct Cli {
    /// Settings file (defaults to ~/.relay/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Automation engine: `sidecar` or `mock`.
    #[arg(long)]
    engine: Option<EngineKind>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(kind) = self.engine {
            settings.engine.kind = kind;
        }
        if self.log_json {
            settings.telemetry.json = true;
        }
    }
}

fn secret_from_env(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn build_engine(settings: &RelaySettings) -> Arc<dyn AutomationEngine> {
    match settings.engine.kind {
        EngineKind::Sidecar => Arc::new(SidecarEngine::new(SidecarConfig {
            command: settings.engine.command.clone(),
            args: settings.engine.args.clone(),
        })),
        EngineKind::Mock => Arc::new(MockEngine::new()),
    }
}

/// Open the transcript store, or run without one if it is disabled or unavailable.
fn open_store(settings: &RelaySettings) -> (Arc<dyn PersistenceSink>, Option<HistoryReader>) {
    if !settings.persistence.enabled {
        info!("persistence disabled");
        return (Arc::new(DisabledSink), None);
    }
    match Database::open(&settings.persistence.db_path) {
        Ok(db) => (Arc::new(SqliteSink::new(db.clone())), Some(HistoryReader::new(db))),
        Err(e) => {
            warn!(error = %e, "failed to open transcript database, continuing without persistence");
            (Arc::new(DisabledSink), None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("Failed to load settings")?;
    cli.apply(&mut settings);

    let telemetry = relay_telemetry::init_telemetry(settings.telemetry.to_config());
    settings.report_rejected_overrides();
    info!(engine = ?settings.engine.kind, "starting relay");

    let engine = build_engine(&settings);
    let (persistence, history) = open_store(&settings);

    let llm = LlmConfig {
        provider: settings.engine.llm_provider.clone(),
        model: settings.engine.llm_model.clone(),
        api_key: secret_from_env("ANTHROPIC_API_KEY"),
    };
    if llm.api_key.is_none() {
        warn!("ANTHROPIC_API_KEY is not set; the engine will rely on its own configuration");
    }

    let handler_state = HandlerState::new(engine, persistence, llm).with_timeouts(SessionTimeouts {
        start: settings.engine.start_timeout(),
        task: settings.engine.task_timeout(),
    });
    let avatar = AvatarBroker::new(
        settings.avatar.api_url.clone(),
        secret_from_env("HEYGEN_API_KEY"),
    );

    let services = Services {
        handler_state: Arc::new(handler_state),
        history,
        avatar: Arc::new(avatar),
        incidents: telemetry.incidents(),
    };

    let handle = relay_server::start(ServerConfig::from_settings(&settings), services)
        .await
        .with_context(|| format!("Failed to bind port {}", settings.server.port))?;
    info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    handle.shutdown().await;
    info!("relay stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from(["relay", "--port", "4500", "--engine", "mock", "--log-json"]);
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 4500);
        assert_eq!(settings.engine.kind, EngineKind::Mock);
        assert!(settings.telemetry.json);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let cli = Cli::parse_from(["relay"]);
        let mut settings = RelaySettings::default();
        settings.server.port = 3100;
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 3100);
        assert_eq!(settings.engine.kind, EngineKind::Sidecar);
    }

    #[test]
    fn disabled_persistence_has_no_history() {
        let mut settings = RelaySettings::default();
        settings.persistence.enabled = false;
        let (sink, history) = open_store(&settings);
        assert!(!sink.is_enabled());
        assert!(history.is_none());
    }

    #[test]
    fn store_opens_at_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = RelaySettings::default();
        settings.persistence.db_path = dir.path().join("nested").join("relay.db");
        let (sink, history) = open_store(&settings);
        assert!(sink.is_enabled());
        assert!(history.is_some());
    }
}
