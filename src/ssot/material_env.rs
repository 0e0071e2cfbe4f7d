// =============================================================================
// Material environment hashing & drift detection
// =============================================================================
//
// "Material" environment variables are the closed, compile-time-declared
// subset whose values actually change trading behaviour. Everything else
// (timestamps, PIDs, session tokens) is volatile and excluded from the hash
// so that restarting a process with an unrelated env change doesn't trip
// drift detection.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::fs_bus;
use crate::types::now_secs_f64;

use super::RepoPaths;

/// Env vars whose values affect trading behaviour — the only keys that ever
/// enter `material_env()`. Closed, compile-time set per spec §4.A.
pub const MATERIAL_ENV_KEYS: &[&str] = &[
    "CQ_ROOT",
    "DRY_RUN",
    "SIMULATION_MODE",
    "MAX_POSITION_USDT",
    "MAX_TOTAL_EXPOSURE_USDT",
    "MAX_DAILY_LOSS_PCT",
    "FEEDER_TTL",
    "TRADER_TTL",
    "ARES_TTL",
    "BINANCE_API_KEY",
    "BINANCE_API_SECRET",
];

/// Belt-and-suspenders exclusion list: even if one of these were ever added
/// to [`MATERIAL_ENV_KEYS`] by mistake, it is filtered back out here.
const VOLATILE_ENV_KEYS: &[&str] = &["PID", "TIMESTAMP", "SESSION_TOKEN", "REQUEST_ID"];

/// Severity of a detected drift between live and persisted material env.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    /// Additions only — safe, informational.
    Soft,
    /// A value was removed or changed — must be reconciled before trading.
    Hard,
    /// No persisted SSOT record exists (or it was unreadable). Treated as
    /// hard per spec §4.A failure semantics.
    Missing,
}

/// Structured diff between the live material environment and the persisted
/// SSOT record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub added: BTreeMap<String, String>,
    pub removed: BTreeMap<String, String>,
    pub changed: BTreeMap<String, (String, String)>,
    pub severity: DriftSeverity,
}

impl DriftReport {
    fn missing() -> Self {
        Self {
            added: BTreeMap::new(),
            removed: BTreeMap::new(),
            changed: BTreeMap::new(),
            severity: DriftSeverity::Missing,
        }
    }
}

/// Persisted `{material_env, env_hash, timestamp}` record at
/// `shared_data/ssot/env.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsotEnvRecord {
    pub material_env: BTreeMap<String, String>,
    pub env_hash: String,
    pub timestamp: f64,
}

/// Read the subset of the live process environment declared material,
/// sorted by key for deterministic hashing.
pub fn material_env() -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for &key in MATERIAL_ENV_KEYS {
        if VOLATILE_ENV_KEYS.contains(&key) {
            continue;
        }
        if let Ok(value) = std::env::var(key) {
            map.insert(key.to_string(), value);
        }
    }
    map
}

/// Short deterministic hash over sorted material env entries (first 16 hex
/// characters of the SHA-256 digest of `"k=v\n"` lines).
pub fn env_hash(env: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in env {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Compare the live material environment against the persisted SSOT record.
/// Returns `None` if they match exactly, else a structured diff.
pub fn detect_drift(paths: &RepoPaths) -> Result<Option<DriftReport>> {
    let live = material_env();
    let live_hash = env_hash(&live);

    let persisted: Option<SsotEnvRecord> =
        match fs_bus::read_json_tolerant::<SsotEnvRecord>(&paths.ssot_env_file()) {
            Ok(record) => Some(record),
            Err(_) => None,
        };

    let Some(persisted) = persisted else {
        warn!(path = %paths.ssot_env_file().display(), "SSOT env record missing or malformed — treating as hard drift");
        return Ok(Some(DriftReport::missing()));
    };

    if persisted.env_hash == live_hash {
        return Ok(None);
    }

    let mut added = BTreeMap::new();
    let mut removed = BTreeMap::new();
    let mut changed = BTreeMap::new();

    for (k, v) in &live {
        match persisted.material_env.get(k) {
            None => {
                added.insert(k.clone(), v.clone());
            }
            Some(old) if old != v => {
                changed.insert(k.clone(), (old.clone(), v.clone()));
            }
            _ => {}
        }
    }
    for (k, v) in &persisted.material_env {
        if !live.contains_key(k) {
            removed.insert(k.clone(), v.clone());
        }
    }

    let severity = if !removed.is_empty() || !changed.is_empty() {
        DriftSeverity::Hard
    } else {
        DriftSeverity::Soft
    };

    info!(
        added = added.len(),
        removed = removed.len(),
        changed = changed.len(),
        severity = ?severity,
        "material env drift detected"
    );

    Ok(Some(DriftReport {
        added,
        removed,
        changed,
        severity,
    }))
}

/// Persist the current live material environment as the new SSOT record.
pub fn reconcile_to_runtime(paths: &RepoPaths) -> Result<()> {
    let live = material_env();
    let record = SsotEnvRecord {
        env_hash: env_hash(&live),
        material_env: live,
        timestamp: now_secs_f64(),
    };
    let bytes = serde_json::to_vec_pretty(&record)?;
    fs_bus::write_atomic(&paths.ssot_env_file(), &bytes)?;
    info!(env_hash = %record.env_hash, "SSOT env record reconciled to runtime");
    Ok(())
}

/// Signal downstream services to reload their environment-derived config,
/// without mutating anything in the calling (already-running) process.
/// Implemented as an atomically-written marker file that the file watcher
/// (§4.B) can observe.
pub fn reconcile_to_ssot(paths: &RepoPaths) -> Result<()> {
    let payload = serde_json::json!({ "requested_at": now_secs_f64() });
    let bytes = serde_json::to_vec(&payload)?;
    fs_bus::write_atomic(&paths.ssot_reload_signal_file(), &bytes)?;
    info!("reload signal written for downstream services");
    Ok(())
}

/// Return the env hash recorded in the persisted SSOT file, if any.
pub fn ssot_env_hash(paths: &RepoPaths) -> Option<String> {
    fs_bus::read_json_tolerant::<SsotEnvRecord>(&paths.ssot_env_file())
        .ok()
        .map(|r| r.env_hash)
}
