use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::enums::{ChangeKind, ChartTable};

/// Application-level constants
pub const APP_NAME: &str = "OdontoChart";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default quiet window for change coalescing.
const DEFAULT_QUIET_WINDOW_MS: u64 = 300;

/// Upper bound on how long a continuous burst may defer a fetch.
const DEFAULT_MAX_BURST_MS: u64 = 2_000;

/// Get the application data directory (~/OdontoChart/).
/// `None` when the home directory cannot be determined.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_NAME))
}

/// Default location of the local chart database.
pub fn default_database_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join("chart.db"))
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,odontochart_lib=debug"
}

// ═══════════════════════════════════════════════════════════
// SyncConfig
// ═══════════════════════════════════════════════════════════

/// Tuning for the reconciliation core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Debounce window after the last qualifying change event.
    pub quiet_window_ms: u64,
    /// A burst never defers the fetch longer than this after its first event.
    pub max_burst_ms: u64,
    /// Backoff used when a subscription set drops.
    pub reconnect: ReconnectionPolicy,
    /// Which related-table events are worth a refetch.
    pub relevance: RelevancePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: DEFAULT_QUIET_WINDOW_MS,
            max_burst_ms: DEFAULT_MAX_BURST_MS,
            reconnect: ReconnectionPolicy::default(),
            relevance: RelevancePolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    pub fn max_burst(&self) -> Duration {
        Duration::from_millis(self.max_burst_ms)
    }

    /// Reject settings that would break debounce guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quiet_window_ms == 0 {
            return Err(ConfigError::Invalid("quiet_window_ms must be > 0".into()));
        }
        if self.max_burst_ms < self.quiet_window_ms {
            return Err(ConfigError::Invalid(format!(
                "max_burst_ms ({}) must be >= quiet_window_ms ({})",
                self.max_burst_ms, self.quiet_window_ms
            )));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Parse from JSON, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid sync configuration: {0}")]
    Invalid(String),
    #[error("Cannot parse sync configuration: {0}")]
    Parse(String),
}

/// Exponential backoff for resubscription:
/// `delay = min(initial_delay_ms * 2^attempt, max_delay_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Initial delay before first resubscription attempt (ms).
    pub initial_delay_ms: u64,
    /// Maximum delay cap (ms).
    pub max_delay_ms: u64,
    /// Maximum number of attempts before staying degraded.
    pub max_retries: u32,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before attempt number `attempt` (0-based). `None` once retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(ms))
    }
}

/// Allow-list of event kinds per related table.
///
/// The entity table itself is always relevant. For the two related tables
/// an event qualifies when its kind is allowed and, for updates that report
/// changed columns, the watched column is among them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevancePolicy {
    pub appointment_kinds: Vec<ChangeKind>,
    pub treatment_plan_kinds: Vec<ChangeKind>,
    pub watched_column: String,
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        Self {
            appointment_kinds: vec![ChangeKind::Update],
            treatment_plan_kinds: vec![ChangeKind::Update],
            watched_column: "status".into(),
        }
    }
}

impl RelevancePolicy {
    pub fn allowed_kinds(&self, table: ChartTable) -> Option<&[ChangeKind]> {
        match table {
            ChartTable::ToothDiagnoses => None,
            ChartTable::Appointments => Some(&self.appointment_kinds),
            ChartTable::TreatmentPlans => Some(&self.treatment_plan_kinds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        if let (Some(dir), Some(home)) = (app_data_dir(), dirs::home_dir()) {
            assert!(dir.starts_with(home));
            assert!(dir.ends_with("OdontoChart"));
        }
    }

    #[test]
    fn database_path_inside_app_dir() {
        if let (Some(db), Some(app)) = (default_database_path(), app_data_dir()) {
            assert!(db.starts_with(app));
            assert!(db.ends_with("chart.db"));
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quiet_window(), Duration::from_millis(300));
        assert_eq!(config.max_burst(), Duration::from_secs(2));
    }

    #[test]
    fn zero_quiet_window_rejected() {
        let config = SyncConfig {
            quiet_window_ms: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn burst_shorter_than_window_rejected() {
        let config = SyncConfig {
            quiet_window_ms: 500,
            max_burst_ms: 100,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = SyncConfig::from_json(r#"{"quiet_window_ms": 150}"#).unwrap();
        assert_eq!(config.quiet_window_ms, 150);
        assert_eq!(config.max_burst_ms, DEFAULT_MAX_BURST_MS);
        assert_eq!(config.reconnect, ReconnectionPolicy::default());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            SyncConfig::from_json("{quiet"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(2_000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(16_000)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(30_000)));
        assert_eq!(policy.delay_for(10), None);
    }

    #[test]
    fn relevance_entity_table_unrestricted() {
        let policy = RelevancePolicy::default();
        assert!(policy.allowed_kinds(ChartTable::ToothDiagnoses).is_none());
        assert_eq!(
            policy.allowed_kinds(ChartTable::Appointments),
            Some(&[ChangeKind::Update][..])
        );
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.3.0");
    }
}
