// =============================================================================
// Memory Layer — spec §4.G
// =============================================================================
//
// Three append-only/atomic stores ported from `coin_quant/memory/*.py`:
// an event chain, a snapshot store with a delta journal, and a Merkle-rooted
// hash chain. Reimplemented against [`crate::fs_bus`] for every read/write
// instead of the original's ad hoc `open()`/`json` calls.
// =============================================================================

pub mod event_chain;
pub mod hash_chain;
pub mod snapshot_store;

pub use event_chain::{EventChain, EventRecord};
pub use hash_chain::{Block, ChainVerification, HashChain, Proof};
pub use snapshot_store::{DeltaRecord, Snapshot, SnapshotStore};

/// Schema version embedded in every record across the memory layer.
pub const SCHEMA_VERSION: &str = "1.0";

/// Serialize a value the way the original's `json.dumps(..., sort_keys=True)`
/// does: every object's keys sorted alphabetically at every nesting level.
/// `serde_json::Value`'s default `Map` is `BTreeMap`-backed, so round-
/// tripping a value through it sorts keys for free.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> anyhow::Result<String> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest;
    hex::encode(sha2::Sha256::digest(bytes))
}
