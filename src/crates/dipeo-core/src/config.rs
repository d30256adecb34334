//! Engine constants and recognized environment variables.

use std::time::Duration;

/// Maximum concurrent node executions within one engine loop.
pub const ENGINE_MAX_CONCURRENT: usize = 20;

/// Maximum concurrent child executions in sub-diagram batch mode.
pub const BATCH_MAX_CONCURRENT: usize = 10;

/// Maximum items processed in one batch.
pub const BATCH_SIZE: usize = 100;

/// Sleep between scheduler polls when no node is ready.
pub const NODE_READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default execution deadline.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound for each event-bus subscriber queue.
pub const EVENT_QUEUE_CAPACITY: usize = 50_000;

/// Settings recognized from `DIPEO_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    /// `DIPEO_MINIMAL_WIRING=1` registers only the services the engine
    /// itself needs.
    pub minimal_wiring: bool,
    /// `DIPEO_FEATURES` csv of optional service groups (`llm`, `http`,
    /// `hooks`).
    pub features: Vec<String>,
    /// `DIPEO_LOG_LEVEL` forwarded to the tracing subscriber.
    pub log_level: Option<String>,
    /// `DIPEO_TIMING_ENABLED=1` logs per-phase durations.
    pub timing_enabled: bool,
    /// `DIPEO_EXECUTION_ID` pre-allocated id for background runs.
    pub execution_id: Option<String>,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        Self {
            minimal_wiring: flag("DIPEO_MINIMAL_WIRING"),
            features: std::env::var("DIPEO_FEATURES")
                .map(|csv| {
                    csv.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_level: std::env::var("DIPEO_LOG_LEVEL").ok(),
            timing_enabled: flag("DIPEO_TIMING_ENABLED"),
            execution_id: std::env::var("DIPEO_EXECUTION_ID")
                .ok()
                .filter(|id| is_execution_id(id)),
        }
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }
}

/// Mint a new execution id: `exec_` followed by 32 hex characters.
pub fn new_execution_id() -> String {
    format!("exec_{}", uuid::Uuid::new_v4().simple())
}

/// Whether `s` matches `exec_[0-9a-f]{32}`.
pub fn is_execution_id(s: &str) -> bool {
    match s.strip_prefix("exec_") {
        Some(hex) => hex.len() == 32 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()),
        None => false,
    }
}
