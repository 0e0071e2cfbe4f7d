// =============================================================================
// Drop code taxonomy — closed set used in evidence and UI (spec §4.D)
// =============================================================================

use serde::{Deserialize, Serialize};

/// Every reason the admission pipeline can refuse to send an order. Closed
/// set — no free-form strings ever reach evidence or the UI (spec §9's
/// "replace dynamic dispatch with tagged variants").
///
/// `DRY_RUN_MODE` also covers the original Python taxonomy's
/// `SIMULATION_BLOCK`: both conditions (env `DRY_RUN` or `SIMULATION_MODE`)
/// map to this single wire value, per the spec's explicit naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropCode {
    // Basic validation
    InvalidSymbol,
    InvalidSide,
    InvalidSize,
    InvalidPrice,
    SymbolNotUppercase,
    InvalidSymbolFormat,

    // Exchange filter
    NotionalTooSmall,
    InvalidQuantityStep,

    // Risk
    InsufficientBalance,
    MinNotional,
    MaxPositionSize,
    PositionTooLarge,
    TotalExposureExceeded,
    DailyLossLimit,
    CircuitBreaker,

    // Signal quality
    StaleSignal,
    LowConfidence,
    DuplicateSignal,

    // System
    ExchangeDown,
    NetworkError,
    RateLimit,
    Maintenance,

    // Guard
    DryRunMode,
    TestFilterViolation,

    // Fallthrough
    UnknownError,
}

impl std::fmt::Display for DropCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&DropCode::DryRunMode).unwrap(),
            "\"DRY_RUN_MODE\""
        );
        assert_eq!(
            serde_json::to_string(&DropCode::DuplicateSignal).unwrap(),
            "\"DUPLICATE_SIGNAL\""
        );
    }

    #[test]
    fn display_matches_wire_format() {
        assert_eq!(DropCode::NotionalTooSmall.to_string(), "NOTIONAL_TOO_SMALL");
    }
}
