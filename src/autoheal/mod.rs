// =============================================================================
// Auto-Heal FSM — spec §4.F
// =============================================================================
//
// Ported from `shared/auto_heal_fsm.py`'s `AutoHealFSM`: assess per-service
// liveness from aggregated health, check the global breaker conditions
// first, decide one action per service (MONITOR/RESTART/QUARANTINE/
// GLOBAL_BREAK), execute, and append an audit record. Restart execution
// itself (process spawn/stop) is out of scope (spec §1) — callers supply a
// [`ServiceRestarter`] implementation.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::fs_bus;
use crate::health::{classify_state, AggregatedHealth};
use crate::ssot::RepoPaths;
use crate::types::{now_secs_f64, ServiceState};

/// Default per-service failure budget before quarantine (spec §4.F step 3).
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base quarantine duration (spec §4.F: "QUARANTINE for 300 s").
const BASE_QUARANTINE_SECS: f64 = 300.0;

/// Ceiling on the exponential quarantine backoff across repeated
/// quarantines of the same service (spec §2's overview line calls this out
/// as "exponential-backoff quarantine"; §4.F pins the base to 300 s — this
/// reconciles both by scaling the base geometrically per repeat offense,
/// recorded as a design decision in DESIGN.md).
const MAX_QUARANTINE_SECS: f64 = 3600.0;

/// Global breaker trip thresholds (spec §4.F step 2).
#[derive(Debug, Clone, Copy)]
pub struct GlobalBreakerThresholds {
    pub daily_pnl_loss: f64,
    pub balance_shortfall: f64,
    pub ws_failure_count: u32,
}

impl Default for GlobalBreakerThresholds {
    fn default() -> Self {
        Self {
            daily_pnl_loss: -1000.0,
            balance_shortfall: -500.0,
            ws_failure_count: 10,
        }
    }
}

/// External signals the FSM checks against the breaker thresholds. Sourced
/// from PnL/balance data this crate does not itself compute (spec §1 —
/// strategy/account math is out of scope).
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalBreakerInputs {
    pub daily_pnl: f64,
    pub balance_shortfall: f64,
    pub ws_failure_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub state: ServiceState,
    pub age: Option<f64>,
    pub threshold: f64,
    pub consecutive_failures: u32,
    pub last_restart_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_until_ts: Option<f64>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub quarantine_count: u32,
}

impl ServiceHealth {
    fn new(name: &str, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            state: ServiceState::Healthy,
            age: None,
            threshold,
            consecutive_failures: 0,
            last_restart_ts: 0.0,
            quarantine_until_ts: None,
            restart_count: 0,
            quarantine_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealAction {
    Restart,
    Quarantine,
    GlobalBreak,
    Monitor,
    NoAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealDecision {
    pub service: String,
    pub action: HealAction,
    pub reason: String,
    pub confidence: f64,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalBreaker {
    pub active: bool,
    pub reason: String,
    pub triggered_at: f64,
    pub daily_pnl_loss: f64,
    pub balance_shortfall: f64,
    pub ws_failure_count: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoHealStats {
    pub restarts_last_hour: u64,
    pub quarantines: u64,
    pub global_breaks: u64,
    pub health_score: f64,
}

/// Restarts a named service. Implemented externally — this crate decides
/// *what* gets restarted, never *how* the OS spawns it (spec §1).
pub trait ServiceRestarter {
    fn restart(&self, service: &str) -> bool;
}

/// Per-service thresholds the assessment step reads ages against
/// (spec §4.F: "configuration, not hard-coded behavior").
pub type ServiceThresholds = HashMap<String, f64>;

pub fn default_service_thresholds() -> ServiceThresholds {
    [("feeder", 30.0), ("ares", 75.0), ("trader", 300.0), ("positions", 60.0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub struct AutoHealFsm {
    paths: RepoPaths,
    services: HashMap<String, ServiceHealth>,
    thresholds: ServiceThresholds,
    global_breaker: GlobalBreaker,
    breaker_thresholds: GlobalBreakerThresholds,
    max_restart_attempts: u32,
    stats: AutoHealStats,
    start_time: f64,
    last_restart_hour: i64,
}

impl AutoHealFsm {
    pub fn new(paths: RepoPaths) -> Self {
        let thresholds = default_service_thresholds();
        let services = thresholds
            .keys()
            .map(|name| (name.clone(), ServiceHealth::new(name, thresholds[name])))
            .collect();
        let now = now_secs_f64();
        Self {
            paths,
            services,
            thresholds,
            global_breaker: GlobalBreaker::default(),
            breaker_thresholds: GlobalBreakerThresholds::default(),
            max_restart_attempts: MAX_RESTART_ATTEMPTS,
            stats: AutoHealStats::default(),
            start_time: now,
            last_restart_hour: (now / 3600.0).floor() as i64,
        }
    }

    pub fn is_breaker_active(&self) -> bool {
        self.global_breaker.active
    }

    /// Clears the in-memory breaker latch. Per invariant I7 the caller must
    /// also have removed `STOP.TXT` externally; this alone does not delete
    /// the file.
    pub fn clear_breaker(&mut self) {
        self.global_breaker = GlobalBreaker::default();
    }

    /// Step 1: recompute each service's lifecycle state from aggregated
    /// health, preserving the counters carried across cycles.
    pub fn assess_health(&mut self, health: &AggregatedHealth) {
        for (name, threshold) in self.thresholds.clone() {
            let age = health.components.get(&name).map(|c| c.age_sec);
            let state = classify_state(age, threshold);
            let entry = self
                .services
                .entry(name.clone())
                .or_insert_with(|| ServiceHealth::new(&name, threshold));
            entry.age = age;
            entry.threshold = threshold;
            if entry.quarantine_until_ts.map(|until| now_secs_f64() < until).unwrap_or(false) {
                entry.state = ServiceState::Quarantined;
            } else {
                entry.state = state;
            }
        }
    }

    /// Steps 2-3: check the global breaker, then decide one action per
    /// service. Short-circuits to a single `GLOBAL_BREAK` decision if any
    /// breaker condition fires.
    pub fn make_heal_decisions(&mut self, inputs: GlobalBreakerInputs) -> Vec<HealDecision> {
        if let Some(reason) = self.check_global_breakers(inputs) {
            return vec![HealDecision {
                service: "system".to_string(),
                action: HealAction::GlobalBreak,
                reason,
                confidence: 1.0,
                timestamp: now_secs_f64(),
                metadata: serde_json::to_value(&self.global_breaker).unwrap_or_default(),
            }];
        }

        let mut decisions = Vec::new();
        let names: Vec<String> = self.services.keys().cloned().collect();
        for name in names {
            if let Some(decision) = self.decide_for_service(&name) {
                decisions.push(decision);
            }
        }
        decisions
    }

    fn check_global_breakers(&mut self, inputs: GlobalBreakerInputs) -> Option<String> {
        if inputs.daily_pnl < self.breaker_thresholds.daily_pnl_loss {
            let reason = format!("Daily PnL loss: {:.2}", inputs.daily_pnl);
            self.global_breaker.daily_pnl_loss = inputs.daily_pnl;
            self.global_breaker.reason = reason.clone();
            return Some(reason);
        }
        if inputs.balance_shortfall < self.breaker_thresholds.balance_shortfall {
            let reason = format!("Balance shortfall: {:.2}", inputs.balance_shortfall);
            self.global_breaker.balance_shortfall = inputs.balance_shortfall;
            self.global_breaker.reason = reason.clone();
            return Some(reason);
        }
        if inputs.ws_failure_count >= self.breaker_thresholds.ws_failure_count {
            let reason = format!("WebSocket failures: {}", inputs.ws_failure_count);
            self.global_breaker.ws_failure_count = inputs.ws_failure_count;
            self.global_breaker.reason = reason.clone();
            return Some(reason);
        }
        None
    }

    fn decide_for_service(&self, name: &str) -> Option<HealDecision> {
        let health = self.services.get(name)?;
        let now = now_secs_f64();

        if let Some(until) = health.quarantine_until_ts {
            if now < until {
                return Some(HealDecision {
                    service: name.to_string(),
                    action: HealAction::Monitor,
                    reason: format!("service in quarantine until {until:.0}"),
                    confidence: 1.0,
                    timestamp: now,
                    metadata: serde_json::json!({ "quarantine_until": until }),
                });
            }
        }

        match health.state {
            ServiceState::Healthy => None,
            ServiceState::Degraded => Some(HealDecision {
                service: name.to_string(),
                action: HealAction::Monitor,
                reason: format!(
                    "service degraded (age {:.1}s > {}s)",
                    health.age.unwrap_or(f64::INFINITY),
                    health.threshold
                ),
                confidence: 0.7,
                timestamp: now,
                metadata: serde_json::json!({ "age": health.age, "threshold": health.threshold }),
            }),
            ServiceState::Failed => {
                if health.consecutive_failures < self.max_restart_attempts {
                    Some(HealDecision {
                        service: name.to_string(),
                        action: HealAction::Restart,
                        reason: format!(
                            "service failed (age {:.1}s > {}s), attempt {}",
                            health.age.unwrap_or(f64::INFINITY),
                            health.threshold,
                            health.consecutive_failures + 1
                        ),
                        confidence: 0.8,
                        timestamp: now,
                        metadata: serde_json::json!({
                            "age": health.age,
                            "threshold": health.threshold,
                            "attempt": health.consecutive_failures + 1,
                        }),
                    })
                } else {
                    Some(HealDecision {
                        service: name.to_string(),
                        action: HealAction::Quarantine,
                        reason: format!(
                            "service failed {} times, entering quarantine",
                            health.consecutive_failures
                        ),
                        confidence: 0.9,
                        timestamp: now,
                        metadata: serde_json::json!({ "consecutive_failures": health.consecutive_failures }),
                    })
                }
            }
            ServiceState::Quarantined | ServiceState::Recovering => None,
        }
    }

    /// Step 4: execute decisions against the supplied restarter, update
    /// per-service counters, and step 5: append one audit record per
    /// decision to `heal_decisions.jsonl`.
    pub fn execute_heal_actions(
        &mut self,
        decisions: &[HealDecision],
        restarter: &dyn ServiceRestarter,
    ) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        for decision in decisions {
            let success = match decision.action {
                HealAction::Restart => {
                    let ok = restarter.restart(&decision.service);
                    if ok {
                        self.update_service_after_restart(&decision.service);
                        self.stats.restarts_last_hour += 1;
                        info!(service = %decision.service, "service restarted");
                    } else {
                        self.increment_failure_count(&decision.service);
                        warn!(service = %decision.service, "service restart failed");
                    }
                    ok
                }
                HealAction::Quarantine => {
                    self.quarantine_service(&decision.service, &decision.reason);
                    self.stats.quarantines += 1;
                    true
                }
                HealAction::GlobalBreak => {
                    self.trigger_global_break(&decision.reason);
                    self.stats.global_breaks += 1;
                    true
                }
                HealAction::Monitor | HealAction::NoAction => true,
            };
            results.insert(decision.service.clone(), success);
            self.log_heal_decision(decision, success);
        }

        self.update_stats();
        results
    }

    fn update_service_after_restart(&mut self, name: &str) {
        if let Some(service) = self.services.get_mut(name) {
            service.last_restart_ts = now_secs_f64();
            service.consecutive_failures = 0;
            service.quarantine_until_ts = None;
            service.restart_count += 1;
            service.state = ServiceState::Recovering;
        }
    }

    fn increment_failure_count(&mut self, name: &str) {
        if let Some(service) = self.services.get_mut(name) {
            service.consecutive_failures += 1;
        }
    }

    fn quarantine_service(&mut self, name: &str, reason: &str) {
        let now = now_secs_f64();
        if let Some(service) = self.services.get_mut(name) {
            let duration =
                (BASE_QUARANTINE_SECS * 2f64.powi(service.quarantine_count as i32)).min(MAX_QUARANTINE_SECS);
            service.quarantine_until_ts = Some(now + duration);
            service.state = ServiceState::Quarantined;
            service.quarantine_count += 1;
        }
        warn!(service = name, reason, "service quarantined");
    }

    fn trigger_global_break(&mut self, reason: &str) {
        let now = now_secs_f64();
        self.global_breaker.active = true;
        self.global_breaker.reason = reason.to_string();
        self.global_breaker.triggered_at = now;

        let body = format!(
            "Global breaker triggered at {now}\nReason: {reason}\nAll new orders are blocked\nManual intervention required\n"
        );
        if let Err(e) = fs_bus::write_atomic(&self.paths.stop_file(), body.as_bytes()) {
            error!(error = %e, "failed to write STOP.TXT");
        }
        error!(reason, "global breaker triggered");
    }

    fn log_heal_decision(&self, decision: &HealDecision, success: bool) {
        let entry = serde_json::json!({
            "ts": decision.timestamp,
            "service": decision.service,
            "action": decision.action,
            "reason": decision.reason,
            "confidence": decision.confidence,
            "success": success,
            "metadata": decision.metadata,
        });
        if let Err(e) = fs_bus::append_ndjson(&self.paths.heal_decisions_file(), &entry) {
            error!(error = %e, "failed to append heal decision audit record");
        }
    }

    fn update_stats(&mut self) {
        let now_hour = (now_secs_f64() / 3600.0).floor() as i64;
        if now_hour != self.last_restart_hour {
            self.stats.restarts_last_hour = 0;
            self.last_restart_hour = now_hour;
        }

        let healthy = self.services.values().filter(|s| s.state == ServiceState::Healthy).count();
        let total = self.services.len();
        self.stats.health_score = if total > 0 {
            healthy as f64 / total as f64 * 100.0
        } else {
            0.0
        };
    }

    pub fn stats(&self) -> AutoHealStats {
        self.stats.clone()
    }

    pub fn services(&self) -> &HashMap<String, ServiceHealth> {
        &self.services
    }

    pub fn uptime_secs(&self) -> f64 {
        now_secs_f64() - self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentHealth;
    use crate::types::HealthStatus;

    struct AlwaysSucceeds;
    impl ServiceRestarter for AlwaysSucceeds {
        fn restart(&self, _service: &str) -> bool {
            true
        }
    }

    struct AlwaysFails;
    impl ServiceRestarter for AlwaysFails {
        fn restart(&self, _service: &str) -> bool {
            false
        }
    }

    fn health_with_age(name: &str, age: f64) -> AggregatedHealth {
        let mut components = HashMap::new();
        components.insert(
            name.to_string(),
            ComponentHealth {
                status: HealthStatus::Green,
                last_ts: Some(now_secs_f64() - age),
                age_sec: age,
                data: None,
            },
        );
        AggregatedHealth {
            ts: now_secs_f64(),
            global_status: HealthStatus::Green,
            components,
            writer_version: "1".to_string(),
        }
    }

    fn fsm() -> AutoHealFsm {
        let dir = tempfile::tempdir().unwrap();
        AutoHealFsm::new(RepoPaths::from_root(dir.path()).unwrap())
    }

    #[test]
    fn healthy_service_gets_no_action() {
        let mut fsm = fsm();
        fsm.assess_health(&health_with_age("feeder", 1.0));
        let decisions = fsm.make_heal_decisions(GlobalBreakerInputs::default());
        assert!(decisions.iter().all(|d| d.service != "feeder"));
    }

    #[test]
    fn failed_service_restarts_then_quarantines_after_three_failures() {
        let mut fsm = fsm();
        for _ in 0..3 {
            fsm.assess_health(&health_with_age("feeder", 100.0));
            let decisions = fsm.make_heal_decisions(GlobalBreakerInputs::default());
            let feeder_decision = decisions.iter().find(|d| d.service == "feeder").unwrap();
            assert_eq!(feeder_decision.action, HealAction::Restart);
            fsm.execute_heal_actions(&decisions, &AlwaysFails);
        }

        fsm.assess_health(&health_with_age("feeder", 100.0));
        let decisions = fsm.make_heal_decisions(GlobalBreakerInputs::default());
        let feeder_decision = decisions.iter().find(|d| d.service == "feeder").unwrap();
        assert_eq!(feeder_decision.action, HealAction::Quarantine);
    }

    #[test]
    fn quarantined_service_produces_monitor_only_within_window() {
        let mut fsm = fsm();
        fsm.quarantine_service("feeder", "forced for test");
        fsm.assess_health(&health_with_age("feeder", 1.0));
        let decisions = fsm.make_heal_decisions(GlobalBreakerInputs::default());
        let feeder_decision = decisions.iter().find(|d| d.service == "feeder").unwrap();
        assert_eq!(feeder_decision.action, HealAction::Monitor);
    }

    #[test]
    fn successful_restart_resets_consecutive_failures() {
        let mut fsm = fsm();
        fsm.increment_failure_count("feeder");
        fsm.increment_failure_count("feeder");
        let decisions = vec![HealDecision {
            service: "feeder".to_string(),
            action: HealAction::Restart,
            reason: "test".to_string(),
            confidence: 0.8,
            timestamp: now_secs_f64(),
            metadata: serde_json::json!({}),
        }];
        fsm.execute_heal_actions(&decisions, &AlwaysSucceeds);
        assert_eq!(fsm.services()["feeder"].consecutive_failures, 0);
        assert_eq!(fsm.services()["feeder"].restart_count, 1);
    }

    #[test]
    fn global_breaker_trips_on_ws_failures_and_writes_stop_file() {
        let mut fsm = fsm();
        let inputs = GlobalBreakerInputs {
            daily_pnl: 0.0,
            balance_shortfall: 0.0,
            ws_failure_count: 10,
        };
        let decisions = fsm.make_heal_decisions(inputs);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, HealAction::GlobalBreak);

        fsm.execute_heal_actions(&decisions, &AlwaysSucceeds);
        assert!(fsm.is_breaker_active());
        assert!(fsm.paths.stop_file().exists());
    }

    #[test]
    fn heal_decisions_are_appended_to_audit_log() {
        let mut fsm = fsm();
        fsm.assess_health(&health_with_age("feeder", 100.0));
        let decisions = fsm.make_heal_decisions(GlobalBreakerInputs::default());
        fsm.execute_heal_actions(&decisions, &AlwaysSucceeds);

        let content = std::fs::read_to_string(fsm.paths.heal_decisions_file()).unwrap();
        assert!(content.lines().count() >= 1);
    }
}
