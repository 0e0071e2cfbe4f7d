// =============================================================================
// Snapshot Store — point-in-time snapshots with a delta journal (spec §4.G)
// =============================================================================
//
// Ported from `coin_quant/memory/snapshot_store.py`'s `SnapshotStore`: each
// snapshot is written atomically to its own file under `snapshots/`, and a
// one-line delta record is appended to `deltas.jsonl` recording that the
// snapshot was created.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fs_bus;
use crate::ssot::RepoPaths;
use crate::types::now_secs_f64;

use super::SCHEMA_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub ts: f64,
    pub schema_version: String,
    pub snapshot_type: String,
    pub snapshot_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub ts: f64,
    pub action: String,
    pub snapshot_id: String,
    pub snapshot_type: String,
}

pub struct SnapshotStore {
    paths: RepoPaths,
}

impl SnapshotStore {
    pub fn new(paths: RepoPaths) -> Self {
        Self { paths }
    }

    /// `snapshot_id = type + "_" + floor(ts)`; writes the snapshot
    /// atomically then appends one delta record, per spec.
    pub fn create_snapshot(&self, data: serde_json::Value, snapshot_type: &str) -> Result<String> {
        let ts = now_secs_f64();
        let snapshot_id = format!("{snapshot_type}_{}", ts.floor() as i64);

        let snapshot = Snapshot {
            ts,
            schema_version: SCHEMA_VERSION.to_string(),
            snapshot_type: snapshot_type.to_string(),
            snapshot_id: snapshot_id.clone(),
            data,
        };

        let bytes = serde_json::to_vec_pretty(&snapshot).context("failed to serialize snapshot")?;
        fs_bus::write_atomic(&self.snapshot_file(&snapshot_id), &bytes)?;

        let delta = DeltaRecord {
            ts,
            action: "create_snapshot".to_string(),
            snapshot_id: snapshot_id.clone(),
            snapshot_type: snapshot_type.to_string(),
        };
        fs_bus::append_ndjson(&self.paths.deltas_file(), &delta)?;

        Ok(snapshot_id)
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Option<Snapshot> {
        fs_bus::read_json_tolerant(&self.snapshot_file(snapshot_id)).ok()
    }

    /// Most recent snapshot, optionally filtered by `snapshot_type`. Scans
    /// `snapshots/` and picks the highest timestamp, matching the original's
    /// "glob then sort" approach.
    pub fn get_latest_snapshot(&self, snapshot_type: Option<&str>) -> Option<Snapshot> {
        let dir = self.paths.snapshots_dir();
        let entries = std::fs::read_dir(&dir).ok()?;

        let mut latest: Option<Snapshot> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot: Snapshot = match fs_bus::read_json_tolerant(&path) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot file");
                    continue;
                }
            };
            if snapshot.schema_version != SCHEMA_VERSION {
                continue;
            }
            if let Some(st) = snapshot_type {
                if snapshot.snapshot_type != st {
                    continue;
                }
            }
            if latest.as_ref().map(|s| snapshot.ts > s.ts).unwrap_or(true) {
                latest = Some(snapshot);
            }
        }
        latest
    }

    /// Deltas in append order, optionally filtered to those at or after
    /// `since`.
    pub fn get_deltas(&self, since: Option<f64>) -> Vec<DeltaRecord> {
        let path = self.paths.deltas_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<DeltaRecord>(l).ok())
            .filter(|d| since.map(|s| d.ts >= s).unwrap_or(true))
            .collect()
    }

    fn snapshot_file(&self, snapshot_id: &str) -> std::path::PathBuf {
        self.paths.snapshots_dir().join(format!("{snapshot_id}.json"))
    }
}
