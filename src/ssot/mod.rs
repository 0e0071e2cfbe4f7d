// =============================================================================
// SSOT Path & Config Resolver — one canonical repo root, every path derived
// =============================================================================
//
// `RepoPaths` is resolved once at process startup and frozen for the
// process lifetime (I1: every path handed out is an absolute child of a
// single root). Resolution order:
//
//   1. `CQ_ROOT` environment variable (must point at an existing directory).
//   2. Walk upward from the current executable's directory until a
//      `shared_data` sentinel directory is found (or its parent already
//      holds one), mirroring the original Python resolver's "parent of the
//      package layout" heuristic generalized to a single marker.
//
// Any failure here is fatal to the calling process — there is no fallback
// root, per spec §4.A.
// =============================================================================

pub mod material_env;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub use material_env::{DriftReport, DriftSeverity, SsotEnvRecord};

/// Sentinel directory name used to recognise a repo root during upward walk.
const ROOT_SENTINEL: &str = "shared_data";

/// Declared health component names the aggregator and FSM both key off of.
pub const HEALTH_COMPONENTS: &[&str] = &["feeder", "trader", "uds", "ares", "autoheal"];

/// Resolved, canonicalised filesystem layout for one running process.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    root: PathBuf,
}

impl RepoPaths {
    /// Resolve the repo root once. Reads `CQ_ROOT`, falling back to an
    /// upward directory walk from the current executable's location.
    pub fn resolve() -> Result<Self> {
        if let Ok(cq_root) = std::env::var("CQ_ROOT") {
            let path = PathBuf::from(&cq_root);
            if !path.is_absolute() {
                bail!("CQ_ROOT must be an absolute path, got: {cq_root}");
            }
            let canonical = path
                .canonicalize()
                .with_context(|| format!("CQ_ROOT does not exist or is unreadable: {cq_root}"))?;
            return Ok(Self { root: canonical });
        }

        let exe = std::env::current_exe().context("failed to resolve current executable path")?;
        let mut dir = exe
            .parent()
            .context("executable path has no parent directory")?
            .to_path_buf();

        loop {
            if dir.join(ROOT_SENTINEL).is_dir() {
                let canonical = dir
                    .canonicalize()
                    .context("failed to canonicalize detected repo root")?;
                return Ok(Self { root: canonical });
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => bail!(
                    "could not locate a '{ROOT_SENTINEL}' sentinel above {}; set CQ_ROOT explicitly",
                    exe.display()
                ),
            }
        }
    }

    /// Build a `RepoPaths` directly from an already-resolved root. Used by
    /// tests and by callers that have already validated the directory.
    pub fn from_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            bail!("repo root must be absolute: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shared_data_dir(&self) -> PathBuf {
        self.root.join("shared_data")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.shared_data_dir().join("health")
    }

    pub fn health_file(&self, service: &str) -> PathBuf {
        self.health_dir().join(format!("{service}.json"))
    }

    pub fn aggregated_health_file(&self) -> PathBuf {
        self.shared_data_dir().join("health.json")
    }

    pub fn ssot_dir(&self) -> PathBuf {
        self.shared_data_dir().join("ssot")
    }

    pub fn ssot_env_file(&self) -> PathBuf {
        self.ssot_dir().join("env.json")
    }

    pub fn ssot_reload_signal_file(&self) -> PathBuf {
        self.ssot_dir().join("reload_requested.json")
    }

    pub fn databus_snapshot_file(&self) -> PathBuf {
        self.shared_data_dir().join("databus_snapshot.json")
    }

    pub fn account_snapshot_file(&self) -> PathBuf {
        self.shared_data_dir().join("account_snapshot.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn orders_dir(&self) -> PathBuf {
        self.logs_dir().join("orders")
    }

    pub fn order_evidence_file(&self) -> PathBuf {
        self.orders_dir().join("order_evidence.jsonl")
    }

    pub fn orders_skipped_file(&self) -> PathBuf {
        self.orders_dir().join("orders_skipped.jsonl")
    }

    pub fn auto_heal_dir(&self) -> PathBuf {
        self.logs_dir().join("auto_heal")
    }

    pub fn heal_decisions_file(&self) -> PathBuf {
        self.auto_heal_dir().join("heal_decisions.jsonl")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.shared_data_dir().join("memory")
    }

    pub fn events_file(&self) -> PathBuf {
        self.memory_dir().join("events.jsonl")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.memory_dir().join("snapshots")
    }

    pub fn deltas_file(&self) -> PathBuf {
        self.memory_dir().join("deltas.jsonl")
    }

    pub fn hash_chain_file(&self) -> PathBuf {
        self.memory_dir().join("hash_chain.json")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(".runtime")
    }

    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.runtime_dir().join(format!("{service}.pid"))
    }

    pub fn runtime_info_file(&self, service: &str) -> PathBuf {
        self.runtime_dir().join(format!("{service}.info"))
    }

    pub fn stop_file(&self) -> PathBuf {
        self.root.join("STOP.TXT")
    }

    /// `true` iff the global-breaker sentinel is present — the authoritative
    /// trading-disabled signal per spec §7.
    pub fn is_breaker_active(&self) -> bool {
        self.stop_file().exists()
    }
}
