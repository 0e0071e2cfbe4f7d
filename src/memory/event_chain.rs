// =============================================================================
// Event Chain — append-only NDJSON event log (spec §4.G)
// =============================================================================
//
// Ported from `coin_quant/memory/event_chain.py`'s `EventChain`: every call
// to `append_event` adds one line to `events.jsonl` and nothing already
// written is ever rewritten. Reimplemented against [`crate::fs_bus`] instead
// of a raw `open()`/`write()` pair.
// =============================================================================

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fs_bus;
use crate::ssot::RepoPaths;
use crate::types::now_secs_f64;

use super::SCHEMA_VERSION;

/// One entry in the event chain. `data` is caller-defined and opaque to this
/// module — the chain only guarantees append order and schema versioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: f64,
    pub schema_version: String,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
}

/// Optional filters for [`EventChain::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_type: Option<String>,
    pub since_ts: Option<f64>,
}

pub struct EventChain {
    paths: RepoPaths,
}

impl EventChain {
    pub fn new(paths: RepoPaths) -> Self {
        Self { paths }
    }

    /// Build and append one event. Never rewrites an existing line — NDJSON
    /// append is the only write operation this type performs.
    pub fn append_event(
        &self,
        event_type: &str,
        data: serde_json::Value,
        source: &str,
    ) -> Result<()> {
        let record = EventRecord {
            ts: now_secs_f64(),
            schema_version: SCHEMA_VERSION.to_string(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            data,
        };
        fs_bus::append_ndjson(&self.paths.events_file(), &record)
    }

    /// Scan the event file, applying `query` filters, returning matches in
    /// file order. Malformed lines are skipped silently but counted in the
    /// returned `skipped` count (spec §4.G: "counted").
    pub fn get_events(&self, query: &EventQuery) -> (Vec<EventRecord>, u64) {
        let path = self.paths.events_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return (Vec::new(), 0),
        };

        let mut events = Vec::new();
        let mut skipped = 0u64;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(line) {
                Ok(record) => {
                    if let Some(ref et) = query.event_type {
                        if &record.event_type != et {
                            continue;
                        }
                    }
                    if let Some(since) = query.since_ts {
                        if record.ts < since {
                            continue;
                        }
                    }
                    events.push(record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed event line");
                    skipped += 1;
                }
            }
        }

        (events, skipped)
    }

    /// Most recent event matching an optional type filter, if any.
    pub fn get_latest_event(&self, event_type: Option<&str>) -> Option<EventRecord> {
        let query = EventQuery {
            event_type: event_type.map(str::to_string),
            since_ts: None,
        };
        let (events, _) = self.get_events(&query);
        events.into_iter().last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (tempfile::TempDir, EventChain) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        (dir, EventChain::new(paths))
    }

    #[test]
    fn append_then_get_events_round_trips() {
        let (_dir, chain) = chain();
        chain
            .append_event("order_filled", serde_json::json!({"qty": 1.0}), "router")
            .unwrap();
        chain
            .append_event("heartbeat", serde_json::json!({}), "feeder")
            .unwrap();

        let (events, skipped) = chain.get_events(&EventQuery::default());
        assert_eq!(events.len(), 2);
        assert_eq!(skipped, 0);
        assert_eq!(events[0].event_type, "order_filled");
    }

    #[test]
    fn filters_by_event_type() {
        let (_dir, chain) = chain();
        chain.append_event("a", serde_json::json!({}), "x").unwrap();
        chain.append_event("b", serde_json::json!({}), "x").unwrap();

        let (events, _) = chain.get_events(&EventQuery {
            event_type: Some("b".to_string()),
            since_ts: None,
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "b");
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let (dir, chain) = chain();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        chain.append_event("a", serde_json::json!({}), "x").unwrap();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(paths.events_file())
                .unwrap();
            writeln!(f, "{{not valid json").unwrap();
        }
        chain.append_event("b", serde_json::json!({}), "x").unwrap();

        let (events, skipped) = chain.get_events(&EventQuery::default());
        assert_eq!(events.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn get_latest_event_returns_last_match() {
        let (_dir, chain) = chain();
        chain.append_event("a", serde_json::json!({"n": 1}), "x").unwrap();
        chain.append_event("a", serde_json::json!({"n": 2}), "x").unwrap();

        let latest = chain.get_latest_event(Some("a")).unwrap();
        assert_eq!(latest.data["n"], 2);
    }
}
