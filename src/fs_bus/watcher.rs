// =============================================================================
// Directory-tree watcher — spec §4.B
// =============================================================================
//
// Wraps `notify`'s recursive watcher with the debounce, rename-coalescing,
// and allow/deny filtering the spec requires. This is the one place the
// crate reaches for an ecosystem watcher instead of hand-rolled polling
// (grounded in `notify` usage across the pack's `other_examples/` daemons).
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// Per-path debounce window (spec §4.B: "300 ms").
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Kinds of change this bus cares about after `.tmp -> target` rename
/// coalescing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEventKind {
    Created,
    Modified,
    Moved,
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub path: PathBuf,
    pub kind: BusEventKind,
}

/// Glob-ish allow/deny filter. Entries are matched against the file name only
/// (spec examples are bare globs like `*.tmp`, `health/*.json`).
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl PathFilter {
    /// Default allowlist/denylist named in spec §4.B.
    pub fn spec_default() -> Self {
        Self {
            allow: vec!["databus_snapshot.json".to_string(), "health/*.json".to_string()],
            deny: vec![
                "*.tmp".to_string(),
                "*.bak".to_string(),
                "*.log.*".to_string(),
                "history_*".to_string(),
                "archive_*".to_string(),
            ],
        }
    }

    /// Matches `name` against a glob-ish `pattern` where `*` stands for any
    /// run of characters. Splits on every `*`, not just the first, so
    /// multi-wildcard patterns like `*.log.*` work as intended.
    fn matches(pattern: &str, name: &str) -> bool {
        if !pattern.contains('*') {
            return pattern == name;
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let mut rest = name;

        if let Some(first) = parts.first() {
            if !rest.starts_with(first) {
                return false;
            }
            rest = &rest[first.len()..];
        }

        for part in &parts[1..parts.len().saturating_sub(1)] {
            if part.is_empty() {
                continue;
            }
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }

        match parts.last() {
            Some(last) => rest.ends_with(last),
            None => true,
        }
    }

    pub fn passes(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let rel = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(|parent| format!("{parent}/{name}"))
            .unwrap_or_else(|| name.to_string());

        if self
            .deny
            .iter()
            .any(|pat| Self::matches(pat, name) || Self::matches(pat, &rel))
        {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow
            .iter()
            .any(|pat| Self::matches(pat, name) || Self::matches(pat, &rel))
    }
}

/// Debounced, filtered wrapper over a `notify` recursive watcher.
///
/// Holds the underlying watcher alive for as long as the struct lives (drop
/// stops the OS-level watch). Callers drain coalesced events with
/// [`DirWatcher::poll`].
pub struct DirWatcher {
    _inner: notify::RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    filter: PathFilter,
    pending: HashMap<PathBuf, (BusEventKind, Instant)>,
    last_created: HashMap<PathBuf, Instant>,
}

impl DirWatcher {
    pub fn new(root: &Path, filter: PathFilter) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("failed to create filesystem watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        Ok(Self {
            _inner: watcher,
            rx,
            filter,
            pending: HashMap::new(),
            last_created: HashMap::new(),
        })
    }

    /// Drain any events received since the last call, applying the allow/deny
    /// filter and coalescing a `.tmp -> target` rename pair into one `Moved`
    /// event rather than a `Created` + a spurious `Modified`.
    pub fn poll(&mut self) -> Vec<BusEvent> {
        while let Ok(res) = self.rx.try_recv() {
            let Ok(event) = res else { continue };
            self.ingest(event);
        }
        self.flush_ready()
    }

    fn ingest(&mut self, event: Event) {
        let now = Instant::now();
        for path in event.paths {
            if !self.filter.passes(&path) {
                continue;
            }

            let is_tmp = path.extension().and_then(|e| e.to_str()) == Some("tmp");

            match event.kind {
                EventKind::Create(_) => {
                    if is_tmp {
                        // Track the create so the following rename can be
                        // coalesced into one Moved event instead of two.
                        self.last_created.insert(path, now);
                    } else {
                        self.pending.insert(path, (BusEventKind::Created, now));
                    }
                }
                EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                    // Rename: if the source was a tracked .tmp, this is the
                    // atomic-write completion — emit Moved for the target.
                    if !is_tmp {
                        self.pending.insert(path, (BusEventKind::Moved, now));
                    }
                }
                EventKind::Modify(_) => {
                    if !is_tmp {
                        self.pending
                            .entry(path)
                            .and_modify(|(kind, ts)| {
                                if *kind != BusEventKind::Created {
                                    *kind = BusEventKind::Modified;
                                }
                                *ts = now;
                            })
                            .or_insert((BusEventKind::Modified, now));
                    }
                }
                _ => {}
            }
        }
    }

    fn flush_ready(&mut self) -> Vec<BusEvent> {
        let now = Instant::now();
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, ts))| now.duration_since(*ts) >= DEBOUNCE_WINDOW)
            .map(|(p, _)| p.clone())
            .collect();

        let mut out = Vec::with_capacity(ready.len());
        for path in ready {
            if let Some((kind, _)) = self.pending.remove(&path) {
                debug!(path = %path.display(), kind = ?kind, "filesystem bus event");
                out.push(BusEvent { path, kind });
            }
        }
        self.last_created.retain(|_, ts| now.duration_since(*ts) < Duration::from_secs(5));
        out
    }
}

pub fn warn_on_queue_overflow(dropped: u64) {
    if dropped > 0 {
        warn!(dropped, "watcher event queue overflowed, oldest events dropped");
    }
}
