// =============================================================================
// Fixed 6-gate sequence — spec §4.D
// =============================================================================
//
// Gates are plain functions evaluated in a fixed order and short-circuit the
// pipeline at the first failure (spec §9: "a fixed-order list, not a plugin
// registry"). None of them throw — every outcome is a closed-set
// [`GateOutcome`] value.
// =============================================================================

use crate::types::Side;

use super::drop_code::DropCode;

/// Per-symbol exchange filter, supplied externally (spec §4.D G2 — "requires
/// an externally provided filter map per symbol").
#[derive(Debug, Clone, Copy)]
pub struct ExchangeFilter {
    pub min_notional: f64,
    pub step_size: f64,
}

/// Risk limits consulted by gate G3. Values come from `RuntimeConfig`
/// (`MAX_POSITION_USDT` / `MAX_TOTAL_EXPOSURE_USDT`).
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub max_position_usdt: f64,
    pub max_total_exposure_usdt: f64,
}

/// Whether an opposite-side existing position blocks the new signal. Default
/// is netting (allowed); spec §4.D G5 allows configuring this to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionConflictPolicy {
    AllowNetting,
    DropOnConflict,
}

impl Default for PositionConflictPolicy {
    fn default() -> Self {
        Self::AllowNetting
    }
}

/// Everything the gate sequence needs to evaluate one signal, after symbol
/// and quantity have been normalized from the raw [`crate::types::Signal`].
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub symbol: &'a str,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub exchange_filter: Option<ExchangeFilter>,
    pub risk: RiskLimits,
    pub current_position_notional_usdt: f64,
    pub projected_total_exposure_usdt: f64,
    pub existing_opposite_side_position: bool,
    pub position_conflict_policy: PositionConflictPolicy,
    pub dry_run: bool,
    pub breaker_active: bool,
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Pass,
    Drop(DropCode, String),
}

impl GateOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }
}

/// Relative tolerance used when checking quantity against `step_size`
/// (spec §4.D G2 — "tolerance 0.1 %").
const STEP_SIZE_TOLERANCE: f64 = 0.001;

/// G1 — symbol normalization: already UPPERCASE and length >= 6.
pub fn gate_symbol_normalization(input: &GateInput) -> GateOutcome {
    if input.symbol != input.symbol.to_uppercase() {
        return GateOutcome::Drop(
            DropCode::SymbolNotUppercase,
            format!("symbol {} is not uppercase", input.symbol),
        );
    }
    if input.symbol.len() < 6 {
        return GateOutcome::Drop(
            DropCode::InvalidSymbolFormat,
            format!("symbol {} shorter than minimum length 6", input.symbol),
        );
    }
    GateOutcome::Pass
}

/// G2 — exchange filters: notional floor and step-size multiple check.
pub fn gate_exchange_filters(input: &GateInput) -> GateOutcome {
    let Some(filter) = input.exchange_filter else {
        // No filter supplied for this symbol: nothing to gate against.
        return GateOutcome::Pass;
    };

    let notional = input.qty * input.price;
    if notional < filter.min_notional {
        return GateOutcome::Drop(
            DropCode::NotionalTooSmall,
            format!("notional {notional} < min_notional {}", filter.min_notional),
        );
    }

    if filter.step_size > 0.0 {
        let steps = input.qty / filter.step_size;
        let nearest = steps.round();
        let relative_deviation = if nearest != 0.0 {
            (steps - nearest).abs() / nearest.abs()
        } else {
            (steps - nearest).abs()
        };
        if relative_deviation > STEP_SIZE_TOLERANCE {
            return GateOutcome::Drop(
                DropCode::InvalidQuantityStep,
                format!(
                    "qty {} is not a multiple of step_size {} (relative deviation {relative_deviation:.5})",
                    input.qty, filter.step_size
                ),
            );
        }
    }

    GateOutcome::Pass
}

/// G3 — risk limits: position notional and projected total exposure caps.
pub fn gate_risk_limits(input: &GateInput) -> GateOutcome {
    if input.current_position_notional_usdt > input.risk.max_position_usdt {
        return GateOutcome::Drop(
            DropCode::PositionTooLarge,
            format!(
                "position notional {} exceeds max_position_usdt {}",
                input.current_position_notional_usdt, input.risk.max_position_usdt
            ),
        );
    }
    if input.projected_total_exposure_usdt > input.risk.max_total_exposure_usdt {
        return GateOutcome::Drop(
            DropCode::TotalExposureExceeded,
            format!(
                "projected exposure {} exceeds max_total_exposure_usdt {}",
                input.projected_total_exposure_usdt, input.risk.max_total_exposure_usdt
            ),
        );
    }
    GateOutcome::Pass
}

/// G4 — slippage guard. Stub: the original source has no concrete check
/// here (spec §9 Open Questions), preserved as pass-through.
pub fn gate_slippage(_input: &GateInput) -> GateOutcome {
    GateOutcome::Pass
}

/// G5 — position-conflict policy. Netting (allow) by default; may be
/// configured to drop on an opposite-side existing position.
pub fn gate_position_conflict(input: &GateInput) -> GateOutcome {
    if input.position_conflict_policy == PositionConflictPolicy::DropOnConflict
        && input.existing_opposite_side_position
    {
        return GateOutcome::Drop(
            DropCode::PositionTooLarge,
            "opposite-side position exists and conflict policy is drop".to_string(),
        );
    }
    GateOutcome::Pass
}

/// G6 — simulation / global-breaker guard.
pub fn gate_simulation_guard(input: &GateInput) -> GateOutcome {
    if input.breaker_active {
        return GateOutcome::Drop(
            DropCode::CircuitBreaker,
            "global breaker (STOP.TXT) is active".to_string(),
        );
    }
    if input.dry_run {
        return GateOutcome::Drop(DropCode::DryRunMode, "DRY_RUN or SIMULATION_MODE set".to_string());
    }
    GateOutcome::Pass
}

/// The fixed gate sequence, evaluated in order. Not a registry — a plain
/// array of function pointers, per spec §9.
pub const GATE_SEQUENCE: &[fn(&GateInput) -> GateOutcome] = &[
    gate_symbol_normalization,
    gate_exchange_filters,
    gate_risk_limits,
    gate_slippage,
    gate_position_conflict,
    gate_simulation_guard,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> GateInput<'static> {
        GateInput {
            symbol: "BTCUSDT",
            side: Side::Buy,
            qty: 0.001,
            price: 67000.0,
            exchange_filter: None,
            risk: RiskLimits {
                max_position_usdt: 100_000.0,
                max_total_exposure_usdt: 500_000.0,
            },
            current_position_notional_usdt: 0.0,
            projected_total_exposure_usdt: 0.0,
            existing_opposite_side_position: false,
            position_conflict_policy: PositionConflictPolicy::AllowNetting,
            dry_run: false,
            breaker_active: false,
        }
    }

    #[test]
    fn lowercase_symbol_drops_at_g1() {
        let mut input = base_input();
        input.symbol = "btcusdt";
        assert_eq!(
            gate_symbol_normalization(&input),
            GateOutcome::Drop(DropCode::SymbolNotUppercase, "symbol btcusdt is not uppercase".to_string())
        );
    }

    #[test]
    fn short_symbol_drops_invalid_format() {
        let mut input = base_input();
        input.symbol = "BTC";
        match gate_symbol_normalization(&input) {
            GateOutcome::Drop(DropCode::InvalidSymbolFormat, _) => {}
            other => panic!("expected InvalidSymbolFormat, got {other:?}"),
        }
    }

    #[test]
    fn notional_exactly_at_minimum_passes() {
        let mut input = base_input();
        input.qty = 1.0;
        input.price = 10.0;
        input.exchange_filter = Some(ExchangeFilter {
            min_notional: 10.0,
            step_size: 0.0,
        });
        assert!(gate_exchange_filters(&input).is_pass());
    }

    #[test]
    fn notional_just_below_minimum_drops() {
        let mut input = base_input();
        input.qty = 1.0;
        input.price = 9.999;
        input.exchange_filter = Some(ExchangeFilter {
            min_notional: 10.0,
            step_size: 0.0,
        });
        assert!(matches!(
            gate_exchange_filters(&input),
            GateOutcome::Drop(DropCode::NotionalTooSmall, _)
        ));
    }

    #[test]
    fn step_size_within_tolerance_passes() {
        let mut input = base_input();
        input.exchange_filter = Some(ExchangeFilter {
            min_notional: 0.0,
            step_size: 0.001,
        });
        input.qty = 0.001 * 5.0 * 1.0005; // within 0.1% tolerance
        assert!(gate_exchange_filters(&input).is_pass());
    }

    #[test]
    fn step_size_beyond_tolerance_drops() {
        let mut input = base_input();
        input.exchange_filter = Some(ExchangeFilter {
            min_notional: 0.0,
            step_size: 0.001,
        });
        input.qty = 0.001 * 5.0 * 1.002; // beyond 0.1% tolerance
        assert!(matches!(
            gate_exchange_filters(&input),
            GateOutcome::Drop(DropCode::InvalidQuantityStep, _)
        ));
    }

    #[test]
    fn risk_limit_position_too_large_drops() {
        let mut input = base_input();
        input.current_position_notional_usdt = 200_000.0;
        assert!(matches!(
            gate_risk_limits(&input),
            GateOutcome::Drop(DropCode::PositionTooLarge, _)
        ));
    }

    #[test]
    fn dry_run_drops_at_g6() {
        let mut input = base_input();
        input.dry_run = true;
        assert!(matches!(
            gate_simulation_guard(&input),
            GateOutcome::Drop(DropCode::DryRunMode, _)
        ));
    }

    #[test]
    fn breaker_active_drops_before_dry_run_check() {
        let mut input = base_input();
        input.breaker_active = true;
        input.dry_run = true;
        assert!(matches!(
            gate_simulation_guard(&input),
            GateOutcome::Drop(DropCode::CircuitBreaker, _)
        ));
    }

    #[test]
    fn full_sequence_passes_for_happy_path() {
        let input = base_input();
        for gate in GATE_SEQUENCE {
            assert!(gate(&input).is_pass());
        }
    }
}
