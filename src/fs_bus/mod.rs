// =============================================================================
// Atomic File Bus — temp-file/rename writes, BOM-tolerant reads, NDJSON append
// =============================================================================
//
// Every shared-state file under `<RepoRoot>` goes through this module. No
// caller is permitted to write directly to a target path (I2: readers must
// never observe a partial write).
// =============================================================================

pub mod watcher;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Retries for the write+rename pair on `EACCES`/`EBUSY`-style failures.
const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Retries for tolerant reads.
const READ_RETRIES: u32 = 5;
const READ_RETRY_MIN_MS: u64 = 20;
const READ_RETRY_MAX_MS: u64 = 40;

/// A write is considered "possibly in progress" if the target's mtime is
/// younger than this.
const FRESH_WRITE_WINDOW: Duration = Duration::from_millis(100);

/// Process-lifetime cap on BOM-removed log notices (rate limiting).
const MAX_BOM_NOTICES: u32 = 3;
static BOM_NOTICES_EMITTED: AtomicU32 = AtomicU32::new(0);

/// UTF-8 byte-order mark.
const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Atomically write `bytes` to `target`: write to a sibling `.tmp` file,
/// fsync, then rename over the target. Retries the whole (write, rename)
/// pair up to [`WRITE_RETRIES`] times on transient failures.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent dir for {}", target.display()))?;
    }

    let mut last_err = None;
    for attempt in 0..=WRITE_RETRIES {
        match try_write_atomic_once(target, bytes) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    path = %target.display(),
                    attempt,
                    error = %e,
                    "atomic write attempt failed"
                );
                last_err = Some(e);
                if attempt < WRITE_RETRIES {
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("atomic write failed with no error recorded")))
}

fn try_write_atomic_once(target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = tmp_sibling_path(target);

    let result = (|| -> Result<()> {
        let mut f = File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp file {}", tmp_path.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
        f.flush().context("failed to flush tmp file")?;
        f.sync_all().context("failed to fsync tmp file")?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    std::fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}

fn tmp_sibling_path(target: &Path) -> std::path::PathBuf {
    let pid = std::process::id();
    let rand_suffix: u32 = rand::thread_rng().gen();
    let file_name = target
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    target.with_file_name(format!("{file_name}.{pid}-{rand_suffix:08x}.tmp"))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// Read and parse a JSON file, tolerating a leading UTF-8 BOM and retrying a
/// handful of times if the file looks mid-write or fails to parse.
pub fn read_json_tolerant<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut last_err = None;

    for attempt in 0..READ_RETRIES {
        if !path.exists() {
            bail!("file not found: {}", path.display());
        }

        let looks_in_progress = attempt == 0 && is_fresh_write(path);

        match read_and_parse(path) {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if looks_in_progress || attempt + 1 < READ_RETRIES {
                    let jitter_ms =
                        rand::thread_rng().gen_range(READ_RETRY_MIN_MS..=READ_RETRY_MAX_MS);
                    std::thread::sleep(Duration::from_millis(jitter_ms));
                    continue;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("read_json_tolerant: exhausted retries for {}", path.display())))
}

fn is_fresh_write(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age < FRESH_WRITE_WINDOW)
        .unwrap_or(false)
}

fn read_and_parse<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut content = Vec::new();
    file.read_to_end(&mut content)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let had_bom = content.starts_with(&BOM);
    let slice = if had_bom { &content[3..] } else { &content[..] };

    let value = serde_json::from_slice(slice)
        .with_context(|| format!("failed to parse JSON from {}", path.display()))?;

    if had_bom {
        note_bom_removed(path);
    }

    Ok(value)
}

fn note_bom_removed(path: &Path) {
    let count = BOM_NOTICES_EMITTED.fetch_add(1, Ordering::Relaxed);
    if count < MAX_BOM_NOTICES {
        debug!(path = %path.display(), "stripped leading UTF-8 BOM while reading");
    }
}

/// Number of BOM-removal notices emitted so far this process lifetime.
/// Exposed for tests verifying the rate-limited-notice contract.
pub fn bom_notices_emitted() -> u32 {
    BOM_NOTICES_EMITTED.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Append (NDJSON)
// ---------------------------------------------------------------------------

/// Serialize `record` as single-line JSON and append it (plus `\n`) to
/// `path`. NDJSON is inherently append-safe with a single `write()` call —
/// no temp file is used.
pub fn append_ndjson<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent dir for {}", path.display()))?;
    }

    let mut line = serde_json::to_string(record).context("failed to serialize NDJSON record")?;
    line.push('\n');

    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {} for append", path.display()))?;

    f.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    f.flush().context("failed to flush NDJSON append")?;
    f.sync_all().context("failed to fsync NDJSON append")?;
    Ok(())
}
