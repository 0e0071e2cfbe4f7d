// =============================================================================
// cq-core — auto-heal supervisor process entry point
// =============================================================================
//
// This binary wires the library's components into the "auto-heal
// supervisor" service named in spec §1/§2: it acquires the supervisor's
// singleton lock, reconciles the SSOT material-env record, runs the 3 s
// health-aggregation loop and the 30 s auto-heal FSM cycle side by side, and
// emits its own heartbeat like every other service. Feeder/trader/ares are
// separate out-of-scope processes (spec §1); this binary only consumes
// their heartbeat files through the shared filesystem bus.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cq_core::autoheal::{AutoHealFsm, GlobalBreakerInputs, ServiceRestarter};
use cq_core::fs_bus;
use cq_core::health::{Aggregator, AggregatedHealth, HeartbeatRecord};
use cq_core::runtime_config::RuntimeConfig;
use cq_core::singleton::{AcquireOutcome, SingletonGuard};
use cq_core::ssot::{self, RepoPaths};
use cq_core::types::{now_secs_f64, HealthStatus};

const SERVICE_NAME: &str = "autoheal";
const RUNTIME_CONFIG_FILE: &str = "runtime_config.json";

/// Restart execution is out of scope for the core (spec §1: "the auto-heal
/// FSM describes *what* is restarted, not *how* the OS spawns it"). This
/// supervisor logs the intent instead of invoking a real process-spawn
/// primitive, which is supplied by the surrounding deployment, not this
/// crate.
struct LoggingRestarter;

impl ServiceRestarter for LoggingRestarter {
    fn restart(&self, service: &str) -> bool {
        warn!(service, "restart requested — no process-spawn primitive wired into this binary, treating as no-op success");
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("cq-core auto-heal supervisor starting up");

    // ── 1. Resolve the SSOT root; any failure here is fatal (spec §4.A). ──
    let paths = match RepoPaths::resolve() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to resolve SSOT repo root");
            std::process::exit(1);
        }
    };
    info!(root = %paths.root().display(), "repo root resolved");

    // ── 2. Singleton guard — exit 1 if another instance already owns it. ──
    let mut guard = SingletonGuard::new(SERVICE_NAME, paths.clone());
    match guard.acquire() {
        Ok(AcquireOutcome::Acquired) => info!(service = SERVICE_NAME, "singleton lock acquired"),
        Ok(AcquireOutcome::AlreadyRunning) => {
            error!(service = SERVICE_NAME, "another instance is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "failed to acquire singleton lock");
            std::process::exit(1);
        }
    }

    // ── 3. Load runtime config, apply env overrides, reconcile SSOT env. ──
    let config_path = paths.root().join(RUNTIME_CONFIG_FILE);
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    let config = Arc::new(RwLock::new(config));

    if let Some(drift) = ssot::material_env::detect_drift(&paths)? {
        warn!(severity = ?drift.severity, "material env drift detected at startup, reconciling");
    }
    ssot::material_env::reconcile_to_runtime(&paths)?;

    // ── 4. Spawn the health aggregation loop (spec §4.C, 3 s cycle). ──────
    let agg_paths = paths.clone();
    let agg_config = config.clone();
    tokio::spawn(async move {
        let mut aggregator = Aggregator::new(agg_paths);
        {
            let cfg = agg_config.read();
            aggregator.set_threshold("feeder", cfg.freshness.feeder_ttl);
            aggregator.set_threshold("trader", cfg.freshness.trader_ttl);
            aggregator.set_threshold("ares", cfg.freshness.ares_ttl);
        }
        aggregator.run().await
    });

    // ── 5. Emit this service's own heartbeat every 30 s. ──────────────────
    let hb_paths = paths.clone();
    tokio::spawn(async move {
        heartbeat_loop(hb_paths).await;
    });

    // ── 6. Auto-heal FSM cycle (spec §4.F, 30 s). ─────────────────────────
    let fsm_paths = paths.clone();
    let heal_task = tokio::spawn(async move {
        let mut fsm = AutoHealFsm::new(fsm_paths.clone());
        let restarter = LoggingRestarter;
        let mut ticker = tokio::time::interval(Duration::from_secs(30));

        loop {
            ticker.tick().await;

            let health_path = fsm_paths.aggregated_health_file();
            let health: AggregatedHealth = match fs_bus::read_json_tolerant(&health_path) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "no aggregated health snapshot available yet, skipping heal cycle");
                    continue;
                }
            };

            fsm.assess_health(&health);

            // PnL/balance inputs are produced by out-of-scope account/risk
            // math (spec §1); absent a live feed this supervisor only reacts
            // to the WS-failure/service-liveness signals it can observe
            // directly from the filesystem bus.
            let inputs = GlobalBreakerInputs::default();
            let decisions = fsm.make_heal_decisions(inputs);

            if !decisions.is_empty() {
                info!(decisions = decisions.len(), "auto-heal cycle produced decisions");
                fsm.execute_heal_actions(&decisions, &restarter);
            }
        }
    });

    info!("auto-heal supervisor running — press Ctrl+C to stop");

    // ── 7. Graceful shutdown (spec §5 cancellation semantics). ────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    heal_task.abort();
    if let Err(e) = config.read().save(&config_path) {
        error!(error = %e, "failed to persist runtime config on shutdown");
    }
    guard.release()?;

    info!("auto-heal supervisor shut down complete");
    Ok(())
}

async fn heartbeat_loop(paths: RepoPaths) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let record = HeartbeatRecord {
            service_name: SERVICE_NAME.to_string(),
            status: HealthStatus::Green,
            ts: cq_core::health::FlexibleTimestamp(now_secs_f64()),
            producer: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checksum: None,
            payload: serde_json::json!({}),
        };
        if let Ok(bytes) = serde_json::to_vec(&record) {
            if let Err(e) = fs_bus::write_atomic(&paths.health_file(SERVICE_NAME), &bytes) {
                warn!(error = %e, "failed to write own heartbeat");
            }
        }
    }
}
