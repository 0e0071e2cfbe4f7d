// =============================================================================
// Admission & Order-Gate Pipeline — spec §4.D
// =============================================================================
//
// Ported from `shared/signal_order_admission.py`'s `SignalOrderAdmission`,
// generalized to the spec's fixed 6-gate sequence and closed `DropCode` set.
// Every admission — accepted or dropped — writes one NDJSON evidence record;
// nothing here throws, every outcome is a typed [`AdmissionResult`].
// =============================================================================

pub mod drop_code;
pub mod gates;

use std::collections::HashMap;

use anyhow::Result;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::fs_bus;
use crate::ssot::RepoPaths;
use crate::types::{now_secs_f64, Side, Signal, SizeType};

pub use drop_code::DropCode;
pub use gates::{ExchangeFilter, GateInput, GateOutcome, PositionConflictPolicy, RiskLimits, GATE_SEQUENCE};

/// Opaque compile-time engine identity folded into `trace_id`. The spec
/// leaves "engine tag" ambiguous and declares it an opaque constant per
/// admission instance (spec §9 Open Questions) — this is that constant.
const ENGINE_TAG: &str = "core";

/// FIFO/age cap on the in-memory dedupe map (spec §4.D).
const MAX_RECENT_ORDERS: usize = 1000;

/// Default dedupe window: a submission with a seen `client_order_id` younger
/// than this is dropped as a duplicate. Overridable via
/// `RuntimeConfig::dedupe_window_secs`.
const DEFAULT_DEDUPE_WINDOW_SECS: f64 = 300.0;

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub accepted: bool,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_code: Option<DropCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_price: Option<f64>,
    pub ts: f64,
    pub processing_time_ms: f64,
}

/// Immutable audit record appended to `order_evidence.jsonl` for every
/// admission attempt, accepted or dropped.
///
/// `client_order_id` is computed as soon as `trace_id` is available (even
/// for signals later dropped by a gate), so evidence always carries it —
/// this differs slightly from the original Python, which only assigned a
/// `client_order_id` after validation passed; recorded in DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvidence {
    pub trace_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub ts: f64,
    pub input_signal: Signal,
    pub admission_result: AdmissionResult,
    #[serde(default)]
    pub exchange_filters: serde_json::Value,
    #[serde(default)]
    pub risk_checks: serde_json::Value,
    #[serde(default)]
    pub order_request: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_response: Option<serde_json::Value>,
    pub final_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of live counters, mirroring the original's
/// `get_live_counters()`/`get_drop_code_histogram()` (spec §1 supplement).
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    pub signals_in: u64,
    pub orders_sent: u64,
    pub drops: u64,
    pub drop_codes: HashMap<DropCode, u64>,
}

/// Everything the caller must supply beyond the raw [`Signal`] to evaluate
/// the gate sequence: exchange filters, risk limits, current exposure, and
/// operational flags.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub exchange_filter: Option<ExchangeFilter>,
    pub risk: RiskLimits,
    pub current_position_notional_usdt: f64,
    pub projected_total_exposure_usdt: f64,
    pub existing_opposite_side_position: bool,
    pub position_conflict_policy: PositionConflictPolicy,
    pub dry_run: bool,
    pub breaker_active: bool,
}

/// The signal-to-order admission pipeline: dedupe map, fixed gate sequence,
/// counters, and evidence writer, all scoped to one process (spec §9 — no
/// cross-process in-memory singletons).
pub struct AdmissionPipeline {
    paths: RepoPaths,
    recent_orders: HashMap<String, f64>,
    stats: AdmissionStats,
    dedupe_window_secs: f64,
}

impl AdmissionPipeline {
    pub fn new(paths: RepoPaths) -> Self {
        Self::with_dedupe_window(paths, DEFAULT_DEDUPE_WINDOW_SECS)
    }

    /// Build a pipeline with a dedupe window other than the default, per
    /// `RuntimeConfig::dedupe_window_secs` (spec §6 — reconfigurable without
    /// a restart).
    pub fn with_dedupe_window(paths: RepoPaths, dedupe_window_secs: f64) -> Self {
        Self {
            paths,
            recent_orders: HashMap::new(),
            stats: AdmissionStats::default(),
            dedupe_window_secs,
        }
    }

    /// Evaluate one signal end to end: basic validation, trace/order-id
    /// derivation, duplicate suppression, the fixed gate sequence, and
    /// evidence recording. Never panics; every path returns a structured
    /// [`AdmissionResult`] and appends one evidence line.
    pub fn process_signal(&mut self, signal: &Signal, ctx: &AdmissionContext) -> AdmissionResult {
        let start = std::time::Instant::now();
        self.stats.signals_in += 1;

        let symbol = signal.symbol.clone();
        let qty = compute_qty(signal);
        let price = signal.price;

        if symbol.is_empty() {
            return self.finish_drop(signal, None, DropCode::InvalidSymbol, "empty symbol", start, qty, price);
        }
        if signal.size <= 0.0 {
            return self.finish_drop(signal, None, DropCode::InvalidSize, "size must be > 0", start, qty, price);
        }
        if price <= 0.0 {
            return self.finish_drop(signal, None, DropCode::InvalidPrice, "price must be > 0", start, qty, price);
        }

        let trace_id = compute_trace_id(&symbol, signal.side, signal.timestamp);
        let client_order_id = compute_client_order_id(&trace_id, &symbol, signal.side, price, qty);

        if self.is_duplicate(&client_order_id) {
            return self.finish_drop_with_ids(
                signal,
                &trace_id,
                Some(client_order_id),
                DropCode::DuplicateSignal,
                "duplicate client_order_id within dedupe window",
                start,
                qty,
                price,
            );
        }

        let gate_input = GateInput {
            symbol: &symbol,
            side: signal.side,
            qty,
            price,
            exchange_filter: ctx.exchange_filter,
            risk: ctx.risk,
            current_position_notional_usdt: ctx.current_position_notional_usdt,
            projected_total_exposure_usdt: ctx.projected_total_exposure_usdt,
            existing_opposite_side_position: ctx.existing_opposite_side_position,
            position_conflict_policy: ctx.position_conflict_policy,
            dry_run: ctx.dry_run,
            breaker_active: ctx.breaker_active,
        };

        for gate in GATE_SEQUENCE {
            if let GateOutcome::Drop(code, detail) = gate(&gate_input) {
                return self.finish_drop_with_ids(
                    signal, &trace_id, Some(client_order_id), code, &detail, start, qty, price,
                );
            }
        }

        self.record_recent_order(client_order_id.clone());
        self.stats.orders_sent += 1;

        let result = AdmissionResult {
            accepted: true,
            trace_id: trace_id.clone(),
            drop_code: None,
            drop_detail: None,
            client_order_id: Some(client_order_id.clone()),
            computed_qty: Some(qty),
            computed_price: Some(price),
            ts: now_secs_f64(),
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        };

        self.write_evidence(signal, &trace_id, &client_order_id, &result, qty, price, "accepted");
        info!(trace_id = %trace_id, %client_order_id, symbol = %symbol, "signal admitted");
        result
    }

    pub fn stats(&self) -> AdmissionStats {
        self.stats.clone()
    }

    fn is_duplicate(&mut self, client_order_id: &str) -> bool {
        let now = now_secs_f64();
        match self.recent_orders.get(client_order_id) {
            Some(&last_seen) if now - last_seen < self.dedupe_window_secs => true,
            _ => false,
        }
    }

    fn record_recent_order(&mut self, client_order_id: String) {
        let now = now_secs_f64();
        self.recent_orders
            .retain(|_, &mut ts| now - ts < self.dedupe_window_secs);
        self.recent_orders.insert(client_order_id, now);

        if self.recent_orders.len() > MAX_RECENT_ORDERS {
            if let Some(oldest) = self
                .recent_orders
                .iter()
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(k, _)| k.clone())
            {
                self.recent_orders.remove(&oldest);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_drop(
        &mut self,
        signal: &Signal,
        client_order_id: Option<String>,
        code: DropCode,
        detail: &str,
        start: std::time::Instant,
        qty: f64,
        price: f64,
    ) -> AdmissionResult {
        let trace_id = format!("drop_{}", signal.timestamp.floor() as u64);
        self.finish_drop_with_ids(signal, &trace_id, client_order_id, code, detail, start, qty, price)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_drop_with_ids(
        &mut self,
        signal: &Signal,
        trace_id: &str,
        client_order_id: Option<String>,
        code: DropCode,
        detail: &str,
        start: std::time::Instant,
        qty: f64,
        price: f64,
    ) -> AdmissionResult {
        self.stats.drops += 1;
        *self.stats.drop_codes.entry(code).or_insert(0) += 1;

        let result = AdmissionResult {
            accepted: false,
            trace_id: trace_id.to_string(),
            drop_code: Some(code),
            drop_detail: Some(detail.to_string()),
            client_order_id: client_order_id.clone(),
            computed_qty: Some(qty),
            computed_price: Some(price),
            ts: now_secs_f64(),
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        };

        let coid = client_order_id.unwrap_or_default();
        self.write_evidence(signal, trace_id, &coid, &result, qty, price, "dropped");
        result
    }

    fn write_evidence(
        &self,
        signal: &Signal,
        trace_id: &str,
        client_order_id: &str,
        result: &AdmissionResult,
        qty: f64,
        price: f64,
        final_status: &str,
    ) {
        let evidence = OrderEvidence {
            trace_id: trace_id.to_string(),
            client_order_id: client_order_id.to_string(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            qty,
            price,
            ts: now_secs_f64(),
            input_signal: signal.clone(),
            admission_result: result.clone(),
            exchange_filters: serde_json::Value::Null,
            risk_checks: serde_json::Value::Null,
            order_request: serde_json::Value::Null,
            order_response: None,
            final_status: final_status.to_string(),
            error: None,
        };

        if let Err(e) = self.append_evidence(&evidence) {
            warn!(error = %e, trace_id, "failed to append order evidence");
        }
    }

    fn append_evidence(&self, evidence: &OrderEvidence) -> Result<()> {
        fs_bus::append_ndjson(&self.paths.order_evidence_file(), evidence)
    }
}

/// Convert a signal's `(size, size_type)` into a base-asset quantity.
fn compute_qty(signal: &Signal) -> f64 {
    match signal.size_type {
        SizeType::Base => signal.size,
        SizeType::Usdt => {
            if signal.price > 0.0 {
                signal.size / signal.price
            } else {
                signal.size
            }
        }
    }
}

/// `trace_id = md5(symbol | side | floor(ts) | engine_tag)[:16]` — stable
/// for the signal identity (spec §4.D).
fn compute_trace_id(symbol: &str, side: Side, ts: f64) -> String {
    let floored_ts = ts.floor() as i64;
    let input = format!("{symbol}|{side}|{floored_ts}|{ENGINE_TAG}");
    let digest = Md5::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// `client_order_id = sha256(trace_id | symbol | side | price | qty)[:32]`
/// — deterministic per signal parameters (spec §4.D, invariant I6).
fn compute_client_order_id(trace_id: &str, symbol: &str, side: Side, price: f64, qty: f64) -> String {
    let input = format!("{trace_id}|{symbol}|{side}|{price}|{qty}");
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> Signal {
        Signal {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            size: 0.001,
            size_type: SizeType::Base,
            price: 67000.0,
            confidence: 0.9,
            timestamp: 1_700_000_000.0,
        }
    }

    fn ctx() -> AdmissionContext {
        AdmissionContext {
            exchange_filter: None,
            risk: RiskLimits {
                max_position_usdt: 1_000_000.0,
                max_total_exposure_usdt: 1_000_000.0,
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
    fn happy_path_is_accepted_with_16_and_32_hex_ids() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut pipeline = AdmissionPipeline::new(paths.clone());

        let result = pipeline.process_signal(&signal(), &ctx());
        assert!(result.accepted);
        assert_eq!(result.trace_id.len(), 16);
        assert_eq!(result.client_order_id.as_ref().unwrap().len(), 32);
        assert!(result.trace_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));

        let content = std::fs::read_to_string(paths.order_evidence_file()).unwrap();
        assert_eq!(content.lines().count(), 1);

        let stats = pipeline.stats();
        assert_eq!(stats.signals_in, 1);
        assert_eq!(stats.orders_sent, 1);
    }

    #[test]
    fn duplicate_within_window_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut pipeline = AdmissionPipeline::new(paths.clone());

        let sig = signal();
        let first = pipeline.process_signal(&sig, &ctx());
        assert!(first.accepted);

        let second = pipeline.process_signal(&sig, &ctx());
        assert!(!second.accepted);
        assert_eq!(second.drop_code, Some(DropCode::DuplicateSignal));

        let content = std::fs::read_to_string(paths.order_evidence_file()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn zero_dedupe_window_lets_repeats_through() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut pipeline = AdmissionPipeline::with_dedupe_window(paths, 0.0);

        let sig = signal();
        assert!(pipeline.process_signal(&sig, &ctx()).accepted);
        assert!(pipeline.process_signal(&sig, &ctx()).accepted);
    }

    #[test]
    fn identical_params_produce_identical_client_order_id() {
        let a = compute_client_order_id("abc123", "BTCUSDT", Side::Buy, 67000.0, 0.001);
        let b = compute_client_order_id("abc123", "BTCUSDT", Side::Buy, 67000.0, 0.001);
        assert_eq!(a, b);
    }

    #[test]
    fn dry_run_drops_with_dry_run_mode_code() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut pipeline = AdmissionPipeline::new(paths);
        let mut c = ctx();
        c.dry_run = true;

        let result = pipeline.process_signal(&signal(), &c);
        assert!(!result.accepted);
        assert_eq!(result.drop_code, Some(DropCode::DryRunMode));
    }

    #[test]
    fn breaker_active_blocks_every_admission() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut pipeline = AdmissionPipeline::new(paths);
        let mut c = ctx();
        c.breaker_active = true;

        let result = pipeline.process_signal(&signal(), &c);
        assert!(!result.accepted);
    }

    #[test]
    fn invalid_size_drops_before_gate_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut pipeline = AdmissionPipeline::new(paths);
        let mut sig = signal();
        sig.size = 0.0;

        let result = pipeline.process_signal(&sig, &ctx());
        assert!(!result.accepted);
        assert_eq!(result.drop_code, Some(DropCode::InvalidSize));
    }
}
