// =============================================================================
// Shared types used across the core runtime
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction carried by a signal and by every downstream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Whether a signal's `size` is denominated in base asset units or quote
/// (USDT) notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeType {
    Base,
    Usdt,
}

/// Raw trading signal as handed to the admission pipeline. The core does not
/// compute this — it is produced by an out-of-scope strategy/alpha component
/// and consumed here as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub size_type: SizeType,
    pub price: f64,
    #[serde(default)]
    pub confidence: f64,
    /// Unix epoch seconds (float, matches upstream producers).
    pub timestamp: f64,
}

/// Per-component liveness/quality status, as emitted in heartbeat files and
/// aggregated into `health.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
    Missing,
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "GREEN"),
            Self::Yellow => write!(f, "YELLOW"),
            Self::Red => write!(f, "RED"),
            Self::Missing => write!(f, "MISSING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Per-service derived lifecycle state used by the auto-heal FSM. Distinct
/// from [`HealthStatus`] — this is the FSM's own state machine, not the raw
/// heartbeat reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Failed,
    Quarantined,
    Recovering,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Quarantined => write!(f, "QUARANTINED"),
            Self::Recovering => write!(f, "RECOVERING"),
        }
    }
}

/// Current UNIX epoch time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current UNIX epoch time in seconds (float, matches the original's
/// `time.time()` granularity).
pub fn now_secs_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
    }

    #[test]
    fn health_status_display_matches_serde_rename() {
        assert_eq!(HealthStatus::Green.to_string(), "GREEN");
        assert_eq!(
            serde_json::to_string(&HealthStatus::Missing).unwrap(),
            "\"MISSING\""
        );
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
