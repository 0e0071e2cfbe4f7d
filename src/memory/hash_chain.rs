// =============================================================================
// Hash Chain — Merkle-rooted block chain with prev-hash linkage (spec §4.G)
// =============================================================================
//
// Ported from `coin_quant/memory/hash_chain.py`'s `HashChain`. Each block
// commits to a Merkle root over its data items and links to the previous
// block's hash; `block_hash` is the SHA-256 of the block's canonical JSON
// with `block_hash` itself excluded from the pre-image (spec invariant I5).
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs_bus;
use crate::ssot::RepoPaths;
use crate::types::now_secs_f64;

use super::{canonical_json, sha256_hex, SCHEMA_VERSION};

/// One block in the chain. Field order matches the original's dict literal
/// so the canonical (sorted-key) serialization used for hashing is stable
/// regardless of construction order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub ts: f64,
    pub schema_version: String,
    pub block_type: String,
    pub merkle_root: String,
    pub previous_hash: String,
    pub data_count: usize,
    pub block_hash: String,
}

/// A block with `block_hash` omitted, used only to compute the pre-image
/// hash (spec I5: "blocks[i].block_hash equals the SHA-256 over the
/// canonical serialization of blocks[i] minus its own block_hash field").
#[derive(Debug, Clone, Serialize)]
struct BlockPreimage<'a> {
    ts: f64,
    schema_version: &'a str,
    block_type: &'a str,
    merkle_root: &'a str,
    previous_hash: &'a str,
    data_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChainFile {
    #[serde(default)]
    schema_version: String,
    #[serde(default)]
    blocks: Vec<Block>,
    #[serde(default)]
    last_hash: String,
    #[serde(default)]
    last_update: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub error_messages: Vec<String>,
    pub blocks_verified: usize,
    pub last_valid_block: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Proof {
    pub block_index: usize,
    pub merkle_root: String,
    pub block_hash: String,
    pub ts: f64,
}

pub struct HashChain {
    paths: RepoPaths,
}

impl HashChain {
    pub fn new(paths: RepoPaths) -> Self {
        Self { paths }
    }

    /// Compute the Merkle root over `data`'s canonical-JSON item hashes,
    /// duplicating the last hash at odd tree levels (spec §4.G step 1).
    pub fn merkle_root(data: &[serde_json::Value]) -> Result<String> {
        if data.is_empty() {
            return Ok(sha256_hex(b""));
        }

        let mut hashes: Vec<String> = data
            .iter()
            .map(|item| canonical_json(item).map(|s| sha256_hex(s.as_bytes())))
            .collect::<Result<_>>()?;

        while hashes.len() > 1 {
            let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
            for pair in hashes.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let combined = format!("{left}{right}");
                next_level.push(sha256_hex(combined.as_bytes()));
            }
            hashes = next_level;
        }

        Ok(hashes.into_iter().next().unwrap())
    }

    /// Append a new block covering `data`, linking to the current
    /// `last_hash`, and persist the whole chain file atomically.
    pub fn add_block(&self, data: &[serde_json::Value], block_type: &str) -> Result<Block> {
        let mut chain = self.load_chain()?;

        let ts = now_secs_f64();
        let merkle_root = Self::merkle_root(data)?;
        let previous_hash = chain.last_hash.clone();

        let preimage = BlockPreimage {
            ts,
            schema_version: SCHEMA_VERSION,
            block_type,
            merkle_root: &merkle_root,
            previous_hash: &previous_hash,
            data_count: data.len(),
        };
        let block_hash = sha256_hex(canonical_json(&preimage)?.as_bytes());

        let block = Block {
            ts,
            schema_version: SCHEMA_VERSION.to_string(),
            block_type: block_type.to_string(),
            merkle_root,
            previous_hash,
            data_count: data.len(),
            block_hash: block_hash.clone(),
        };

        chain.blocks.push(block.clone());
        chain.last_hash = block_hash;
        chain.last_update = ts;
        chain.schema_version = SCHEMA_VERSION.to_string();

        self.save_chain(&chain)?;
        Ok(block)
    }

    /// Recompute every block's hash and linkage, stopping at the first
    /// mismatch but continuing to collect all error messages (spec §4.G).
    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let chain = self.load_chain()?;

        if chain.blocks.is_empty() {
            return Ok(ChainVerification {
                is_valid: true,
                error_messages: Vec::new(),
                blocks_verified: 0,
                last_valid_block: None,
            });
        }

        let mut errors = Vec::new();
        let mut previous_hash = String::new();
        let mut last_valid_block: Option<usize> = None;
        let mut chain_broken = false;

        for (i, block) in chain.blocks.iter().enumerate() {
            let preimage = BlockPreimage {
                ts: block.ts,
                schema_version: &block.schema_version,
                block_type: &block.block_type,
                merkle_root: &block.merkle_root,
                previous_hash: &block.previous_hash,
                data_count: block.data_count,
            };
            let expected_hash = sha256_hex(canonical_json(&preimage)?.as_bytes());

            let mut block_ok = true;
            if block.block_hash != expected_hash {
                errors.push(format!("Block {i} hash mismatch"));
                block_ok = false;
            }
            if block.previous_hash != previous_hash {
                errors.push(format!("Block {i} previous hash mismatch"));
                block_ok = false;
            }

            if !block_ok {
                chain_broken = true;
            }
            if block_ok && !chain_broken {
                last_valid_block = Some(i);
            }

            previous_hash = block.block_hash.clone();
        }

        Ok(ChainVerification {
            is_valid: errors.is_empty(),
            blocks_verified: chain.blocks.len(),
            last_valid_block,
            error_messages: errors,
        })
    }

    /// Skeleton Merkle proof for `block_index` (spec §4.G — full inclusion
    /// path against `data_item` is an extension point, not implemented
    /// here).
    pub fn get_proof(&self, block_index: usize) -> Result<Option<Proof>> {
        let chain = self.load_chain()?;
        let Some(block) = chain.blocks.get(block_index) else {
            return Ok(None);
        };
        Ok(Some(Proof {
            block_index,
            merkle_root: block.merkle_root.clone(),
            block_hash: block.block_hash.clone(),
            ts: block.ts,
        }))
    }

    pub fn block_count(&self) -> Result<usize> {
        Ok(self.load_chain()?.blocks.len())
    }

    fn load_chain(&self) -> Result<ChainFile> {
        let path = self.paths.hash_chain_file();
        if !path.exists() {
            return Ok(ChainFile {
                schema_version: SCHEMA_VERSION.to_string(),
                ..Default::default()
            });
        }
        fs_bus::read_json_tolerant(&path).context("failed to load hash chain file")
    }

    fn save_chain(&self, chain: &ChainFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(chain).context("failed to serialize hash chain")?;
        fs_bus::write_atomic(&self.paths.hash_chain_file(), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (tempfile::TempDir, HashChain) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        (dir, HashChain::new(paths))
    }

    #[test]
    fn genesis_block_has_empty_previous_hash() {
        let (_dir, chain) = chain();
        let block = chain.add_block(&[serde_json::json!({"a": 1})], "data").unwrap();
        assert_eq!(block.previous_hash, "");
    }

    #[test]
    fn blocks_link_previous_hash_to_prior_block_hash() {
        let (_dir, chain) = chain();
        let b0 = chain.add_block(&[serde_json::json!({"a": 1})], "data").unwrap();
        let b1 = chain.add_block(&[serde_json::json!({"a": 2})], "data").unwrap();
        assert_eq!(b1.previous_hash, b0.block_hash);
    }

    #[test]
    fn verify_chain_passes_for_untampered_chain() {
        let (_dir, chain) = chain();
        chain.add_block(&[serde_json::json!({"price": 1.0})], "data").unwrap();
        chain.add_block(&[serde_json::json!({"price": 2.0})], "data").unwrap();
        chain.add_block(&[serde_json::json!({"price": 3.0})], "data").unwrap();

        let verification = chain.verify_chain().unwrap();
        assert!(verification.is_valid);
        assert_eq!(verification.blocks_verified, 3);
        assert_eq!(verification.last_valid_block, Some(2));
    }

    #[test]
    fn tampering_with_a_block_field_fails_verification_at_that_block() {
        let (dir, chain) = chain();
        chain.add_block(&[serde_json::json!({"price": 1.0})], "data").unwrap();
        chain.add_block(&[serde_json::json!({"price": 2.0})], "data").unwrap();
        chain.add_block(&[serde_json::json!({"price": 3.0})], "data").unwrap();

        // Flip a byte in block 1's merkle_root directly on disk.
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut chain_file: ChainFile = fs_bus::read_json_tolerant(&paths.hash_chain_file()).unwrap();
        let mut root = chain_file.blocks[1].merkle_root.clone();
        let last = root.pop().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        root.push(flipped);
        chain_file.blocks[1].merkle_root = root;
        let bytes = serde_json::to_vec_pretty(&chain_file).unwrap();
        fs_bus::write_atomic(&paths.hash_chain_file(), &bytes).unwrap();

        let verification = chain.verify_chain().unwrap();
        assert!(!verification.is_valid);
        assert!(verification.error_messages.iter().any(|m| m == "Block 1 hash mismatch"));
        assert_eq!(verification.last_valid_block, Some(0));
    }

    #[test]
    fn merkle_root_is_deterministic_regardless_of_call_site() {
        let data = vec![serde_json::json!({"a": 1}), serde_json::json!({"b": 2})];
        let a = HashChain::merkle_root(&data).unwrap();
        let b = HashChain::merkle_root(&data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_data_produces_sha256_of_empty_string() {
        let root = HashChain::merkle_root(&[]).unwrap();
        assert_eq!(root, sha256_hex(b""));
    }

    #[test]
    fn get_proof_returns_skeleton_for_existing_block() {
        let (_dir, chain) = chain();
        chain.add_block(&[serde_json::json!({"a": 1})], "data").unwrap();
        let proof = chain.get_proof(0).unwrap().unwrap();
        assert_eq!(proof.block_index, 0);
        assert!(chain.get_proof(5).unwrap().is_none());
    }
}
