//! Relay settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides
//!
//! CLI flags are applied by the binary on top of the result. Loading
//! happens before tracing is installed, so rejected overrides are kept on
//! [`RelaySettings::rejected_overrides`] for the binary to report.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn, Level};

use relay_telemetry::{relay_home, TelemetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub persistence: PersistenceSettings,
    pub avatar: AvatarSettings,
    pub telemetry: TelemetrySettings,
    /// Env overrides that failed to parse and were left at their prior value.
    #[serde(skip)]
    pub rejected_overrides: Vec<RejectedOverride>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedOverride {
    pub key: String,
    pub value: String,
}

impl RelaySettings {
    /// Warn once per rejected override. Call after telemetry is up.
    pub fn report_rejected_overrides(&self) {
        for rejected in &self.rejected_overrides {
            warn!(key = %rejected.key, value = %rejected.value, "invalid env var, ignoring");
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// `*` allows any origin.
    pub cors_origin: String,
    /// Outbound messages buffered per connection before senders wait.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// A client silent for longer than this is disconnected.
    pub client_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
            cors_origin: "*".into(),
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs.max(1))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Sidecar,
    Mock,
}

impl std::str::FromStr for EngineKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sidecar" => Ok(Self::Sidecar),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown engine kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub kind: EngineKind,
    pub command: String,
    pub args: Vec<String>,
    pub llm_provider: String,
    pub llm_model: String,
    /// `None` waits indefinitely.
    pub start_timeout_secs: Option<u64>,
    /// `None` waits indefinitely.
    pub task_timeout_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kind: EngineKind::Sidecar,
            command: "npx".into(),
            args: vec!["browser-agent-sidecar".into()],
            llm_provider: "anthropic".into(),
            llm_model: "claude-sonnet-4-20250514".into(),
            start_timeout_secs: None,
            task_timeout_secs: None,
        }
    }
}

impl EngineSettings {
    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_secs.map(Duration::from_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub db_path: PathBuf,
    /// Default page size for the session list.
    pub history_limit: u32,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: relay_home().join("relay.db"),
            history_limit: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvatarSettings {
    pub api_url: String,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.heygen.com/v1/streaming.create_token".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub journal_incidents: bool,
    pub incident_db_path: PathBuf,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json: false,
            journal_incidents: false,
            incident_db_path: relay_home().join("incidents.db"),
        }
    }
}

impl TelemetrySettings {
    pub fn to_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: self.json,
            journal_incidents: self.journal_incidents,
            incident_db_path: self.incident_db_path.clone(),
        }
    }
}

/// `~/.relay/settings.json`
pub fn settings_path() -> PathBuf {
    relay_home().join("settings.json")
}

/// Load settings from `path` (or the default path) and apply env overrides.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings, SettingsError> {
    let default_path = settings_path();
    let mut settings = load_settings_from_path(path.unwrap_or(&default_path))?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`. A missing file yields defaults.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings, SettingsError> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from `lookup`. Invalid values are ignored and recorded in
/// `settings.rejected_overrides`.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let mut env = EnvReader {
        lookup,
        rejected: Vec::new(),
    };

    if let Some(v) = env.parsed("PORT", |v| parse_u16_range(v, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.string("CORS_ORIGIN") {
        settings.server.cors_origin = v;
    }
    if let Some(v) = env.string("RELAY_DB_PATH") {
        settings.persistence.db_path = PathBuf::from(v);
    }
    if let Some(v) = env.parsed("RELAY_PERSISTENCE", parse_bool) {
        settings.persistence.enabled = v;
    }
    if let Some(v) = env.parsed("RELAY_ENGINE", |v| v.parse::<EngineKind>().ok()) {
        settings.engine.kind = v;
    }
    if let Some(v) = env.string("RELAY_ENGINE_COMMAND") {
        settings.engine.command = v;
    }
    if let Some(v) = env.string("RELAY_LLM_MODEL") {
        settings.engine.llm_model = v;
    }
    if let Some(v) = env.parsed("RELAY_START_TIMEOUT_SECS", |v| parse_u64_range(v, 1, 86_400)) {
        settings.engine.start_timeout_secs = Some(v);
    }
    if let Some(v) = env.parsed("RELAY_TASK_TIMEOUT_SECS", |v| parse_u64_range(v, 1, 86_400)) {
        settings.engine.task_timeout_secs = Some(v);
    }

    settings.rejected_overrides.append(&mut env.rejected);
}

struct EnvReader<F> {
    lookup: F,
    rejected: Vec<RejectedOverride>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    /// Non-empty value of `name`.
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&mut self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let parsed = parse(&val);
        if parsed.is_none() {
            self.rejected.push(RejectedOverride {
                key: name.to_string(),
                value: val,
            });
        }
        parsed
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = RelaySettings::default();
        assert_eq!(s.server.port, 3001);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.engine.kind, EngineKind::Sidecar);
        assert!(s.engine.start_timeout().is_none());
        assert!(s.persistence.enabled);
        assert_eq!(s.persistence.history_limit, 50);
    }

    #[test]
    fn deep_merge_rules() {
        let target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2], "keep": "x"});
        let source = json!({"a": {"c": 3}, "list": [9], "keep": null});
        assert_eq!(
            deep_merge(target, source),
            json!({"a": {"b": 1, "c": 3}, "list": [9], "keep": "x"})
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.server.port, 3001);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server":{"port":4000},"engine":{"kind":"mock","taskTimeoutSecs":30}}"#,
        )
        .unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.server.max_send_queue, 256);
        assert_eq!(s.engine.kind, EngineKind::Mock);
        assert_eq!(s.engine.task_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(s.engine.command, "npx");
    }

    #[test]
    fn invalid_file_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("PORT", "8080"),
                ("RELAY_PERSISTENCE", "off"),
                ("RELAY_ENGINE", "MOCK"),
                ("RELAY_TASK_TIMEOUT_SECS", "120"),
                ("RELAY_DB_PATH", "/tmp/relay-test.db"),
            ]),
        );
        assert_eq!(s.server.port, 8080);
        assert!(!s.persistence.enabled);
        assert_eq!(s.engine.kind, EngineKind::Mock);
        assert_eq!(s.engine.task_timeout_secs, Some(120));
        assert_eq!(s.persistence.db_path, PathBuf::from("/tmp/relay-test.db"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("PORT", "0"),
                ("RELAY_PERSISTENCE", "maybe"),
                ("RELAY_ENGINE", "selenium"),
                ("HOST", ""),
            ]),
        );
        assert_eq!(s.server.port, 3001);
        assert!(s.persistence.enabled);
        assert_eq!(s.engine.kind, EngineKind::Sidecar);
        assert_eq!(s.server.host, "0.0.0.0");
    }

    #[test]
    fn invalid_env_values_are_kept_for_reporting() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("PORT", "not-a-port"),
                ("RELAY_TASK_TIMEOUT_SECS", "0"),
                ("RELAY_START_TIMEOUT_SECS", "15"),
            ]),
        );
        assert_eq!(s.engine.start_timeout_secs, Some(15));
        assert_eq!(
            s.rejected_overrides,
            vec![
                RejectedOverride {
                    key: "PORT".into(),
                    value: "not-a-port".into(),
                },
                RejectedOverride {
                    key: "RELAY_TASK_TIMEOUT_SECS".into(),
                    value: "0".into(),
                },
            ]
        );
    }

    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                let _ = self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn rejected_overrides_are_reported_as_warnings() {
        let mut s = RelaySettings::default();
        apply_overrides(&mut s, env(&[("PORT", "99999"), ("RELAY_ENGINE", "selenium")]));

        let counter = WarnCounter::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        tracing::subscriber::with_default(subscriber, || s.report_rejected_overrides());
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
    }

    #[test]
    fn telemetry_config_falls_back_to_info() {
        let mut t = TelemetrySettings::default();
        t.log_level = "verbose".into();
        assert_eq!(t.to_config().log_level, Level::INFO);
        t.log_level = "debug".into();
        assert_eq!(t.to_config().log_level, Level::DEBUG);
    }
}
