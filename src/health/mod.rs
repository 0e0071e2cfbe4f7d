// =============================================================================
// Health Aggregator & Readiness Gates
// =============================================================================
//
// Consolidates per-service heartbeat files into one aggregated `health.json`
// and exposes the readiness predicates consumed by the admission pipeline and
// the auto-heal FSM. Ported from `guard/health/aggregate_health.py` and
// `shared/robust_health_reader.py` — read-then-classify, one writer.
// =============================================================================

pub mod aggregator;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{now_secs_f64, HealthStatus, ServiceState};

pub use aggregator::Aggregator;

/// Default per-component freshness thresholds in seconds. `feeder`/`ares`/
/// `trader` values are named explicitly in the spec (§4.F); `uds` and
/// `autoheal` are not, so a conservative 60 s default is used for both.
pub const DEFAULT_FRESHNESS_THRESHOLDS: &[(&str, f64)] = &[
    ("feeder", 30.0),
    ("trader", 300.0),
    ("ares", 75.0),
    ("uds", 60.0),
    ("autoheal", 60.0),
];

/// Look up the default freshness threshold for a component, falling back to
/// 60 s for anything not in [`DEFAULT_FRESHNESS_THRESHOLDS`].
pub fn default_threshold(component: &str) -> f64 {
    DEFAULT_FRESHNESS_THRESHOLDS
        .iter()
        .find(|(name, _)| *name == component)
        .map(|(_, t)| *t)
        .unwrap_or(60.0)
}

/// A timestamp as emitted by a heartbeat writer: numeric milliseconds
/// (> 10^12), numeric seconds, or an ISO-8601 string. Normalized to epoch
/// seconds on read, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlexibleTimestamp(pub f64);

impl<'de> Deserialize<'de> for FlexibleTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        let raw = Raw::deserialize(deserializer)?;
        let secs = match raw {
            Raw::Number(n) => {
                if n > 1e12 {
                    n / 1000.0
                } else {
                    n
                }
            }
            Raw::Text(s) => chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
                .map_err(serde::de::Error::custom)?,
        };
        Ok(FlexibleTimestamp(secs))
    }
}

impl Serialize for FlexibleTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.0)
    }
}

/// One per-service heartbeat document, written atomically to
/// `shared_data/health/<service>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub service_name: String,
    pub status: HealthStatus,
    pub ts: FlexibleTimestamp,
    pub producer: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-component entry inside the aggregated health document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<f64>,
    pub age_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The consolidated document written to `shared_data/health.json` every
/// aggregation cycle (default 3 s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub ts: f64,
    pub global_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub writer_version: String,
}

/// Options for [`check_services_green`].
#[derive(Debug, Clone, Default)]
pub struct ReadinessOptions {
    pub require_both: bool,
    pub max_age_sec: Option<f64>,
    pub check_snapshots: bool,
}

/// `true` iff `feeder` is `GREEN` and fresh within `threshold` seconds
/// (default 30 s, per spec §4.C).
pub fn feeder_ready(health: &AggregatedHealth, threshold: Option<f64>) -> bool {
    component_ready(health, "feeder", threshold.unwrap_or(default_threshold("feeder")))
}

/// `true` iff `ares` is `GREEN` and fresh within `threshold` seconds
/// (default 75 s, per spec §4.C).
pub fn ares_ready(health: &AggregatedHealth, threshold: Option<f64>) -> bool {
    component_ready(health, "ares", threshold.unwrap_or(default_threshold("ares")))
}

fn component_ready(health: &AggregatedHealth, component: &str, threshold: f64) -> bool {
    health
        .components
        .get(component)
        .map(|c| c.status == HealthStatus::Green && c.age_sec <= threshold)
        .unwrap_or(false)
}

/// Gate consumed by admission/UI: require feeder (and optionally ares) fresh
/// and, if `check_snapshots` is set, the databus/account snapshot files
/// present with mtime age within 120 s.
pub fn check_services_green(
    paths: &crate::ssot::RepoPaths,
    health: &AggregatedHealth,
    opts: &ReadinessOptions,
) -> bool {
    const SNAPSHOT_MAX_AGE_SEC: f64 = 120.0;

    let feeder_threshold = opts.max_age_sec.unwrap_or(default_threshold("feeder"));
    let ares_threshold = opts.max_age_sec.unwrap_or(default_threshold("ares"));

    let feeder_ok = component_ready(health, "feeder", feeder_threshold);
    let ares_ok = component_ready(health, "ares", ares_threshold);

    let services_ok = if opts.require_both {
        feeder_ok && ares_ok
    } else {
        feeder_ok
    };

    if !services_ok {
        return false;
    }

    if opts.check_snapshots {
        let snapshots_ok = file_age_within(&paths.databus_snapshot_file(), SNAPSHOT_MAX_AGE_SEC)
            && file_age_within(&paths.account_snapshot_file(), SNAPSHOT_MAX_AGE_SEC);
        if !snapshots_ok {
            return false;
        }
    }

    true
}

fn file_age_within(path: &std::path::Path, max_age_sec: f64) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age.as_secs_f64() <= max_age_sec)
        .unwrap_or(false)
}

/// Derived per-component lifecycle state from its freshness age — shared by
/// the health aggregator's classification and the auto-heal FSM's
/// `assess_health` step (spec §4.C / §4.F use the identical rule).
pub fn classify_state(age_sec: Option<f64>, threshold: f64) -> ServiceState {
    match age_sec {
        None => ServiceState::Failed,
        Some(age) if age <= threshold => ServiceState::Healthy,
        Some(age) if age <= 2.0 * threshold => ServiceState::Degraded,
        Some(_) => ServiceState::Failed,
    }
}

/// Worst-of rule for the aggregated global status (spec §4.C step 5).
pub fn worst_of(statuses: impl Iterator<Item = HealthStatus>) -> HealthStatus {
    let mut any_red = false;
    let mut any_yellow = false;
    for s in statuses {
        match s {
            HealthStatus::Red | HealthStatus::Error => any_red = true,
            HealthStatus::Yellow | HealthStatus::Missing => any_yellow = true,
            _ => {}
        }
    }
    if any_red {
        HealthStatus::Red
    } else if any_yellow {
        HealthStatus::Yellow
    } else {
        HealthStatus::Green
    }
}

#[allow(dead_code)]
fn current_ts() -> f64 {
    now_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_state_boundaries() {
        assert_eq!(classify_state(Some(30.0), 30.0), ServiceState::Healthy);
        assert_eq!(classify_state(Some(30.001), 30.0), ServiceState::Degraded);
        assert_eq!(classify_state(Some(60.0), 30.0), ServiceState::Degraded);
        assert_eq!(classify_state(Some(60.001), 30.0), ServiceState::Failed);
        assert_eq!(classify_state(None, 30.0), ServiceState::Failed);
    }

    #[test]
    fn worst_of_picks_red_over_yellow() {
        let statuses = vec![HealthStatus::Green, HealthStatus::Yellow, HealthStatus::Red];
        assert_eq!(worst_of(statuses.into_iter()), HealthStatus::Red);
    }

    #[test]
    fn worst_of_picks_yellow_over_green() {
        let statuses = vec![HealthStatus::Green, HealthStatus::Missing];
        assert_eq!(worst_of(statuses.into_iter()), HealthStatus::Yellow);
    }

    #[test]
    fn worst_of_all_green_is_green() {
        let statuses = vec![HealthStatus::Green, HealthStatus::Green];
        assert_eq!(worst_of(statuses.into_iter()), HealthStatus::Green);
    }

    #[test]
    fn flexible_timestamp_accepts_ms_and_seconds() {
        let ms: FlexibleTimestamp = serde_json::from_str("1700000000000.0").unwrap();
        let secs: FlexibleTimestamp = serde_json::from_str("1700000000.0").unwrap();
        assert!((ms.0 - secs.0).abs() < 1.0);
    }

    #[test]
    fn feeder_ready_requires_green_and_fresh() {
        let mut components = HashMap::new();
        components.insert(
            "feeder".to_string(),
            ComponentHealth {
                status: HealthStatus::Green,
                last_ts: Some(100.0),
                age_sec: 10.0,
                data: None,
            },
        );
        let health = AggregatedHealth {
            ts: 110.0,
            global_status: HealthStatus::Green,
            components,
            writer_version: "1".to_string(),
        };
        assert!(feeder_ready(&health, None));
        assert!(!feeder_ready(&health, Some(5.0)));
    }
}
