// =============================================================================
// Singleton Guards — PID-file single-instance enforcement (spec §4.H)
// =============================================================================
//
// Ported from `coin_quant/shared/singleton.py`'s `SingletonGuard`. The
// Python original shells out to `kill(pid, 0)` / `tasklist` to check
// liveness; here that's replaced with the `sysinfo` crate's process table,
// a safe cross-platform equivalent (see SPEC_FULL.md §4.H).
// =============================================================================

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tracing::{info, warn};

use crate::fs_bus;
use crate::ssot::RepoPaths;
use crate::types::now_secs_f64;

/// How long `force_takeover` waits after SIGTERM before escalating to
/// SIGKILL, per spec §4.H.
const TAKEOVER_GRACE_PERIOD: Duration = Duration::from_secs(5);
const TAKEOVER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Companion info recorded alongside the PID file for operator tooling
/// (spec §4.H: "may record last-known port/root").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeInfo {
    pub pid: u32,
    pub service: String,
    pub root: String,
    pub started_at: f64,
}

/// Outcome of [`SingletonGuard::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// No prior owner, or the prior owner's PID file was stale — lock taken.
    Acquired,
    /// A live process already owns the lock; caller must decide whether to
    /// exit or call [`SingletonGuard::force_takeover`].
    AlreadyRunning,
}

pub struct SingletonGuard {
    service: String,
    paths: RepoPaths,
    pid: u32,
    held: bool,
}

impl SingletonGuard {
    pub fn new(service: impl Into<String>, paths: RepoPaths) -> Self {
        Self {
            service: service.into(),
            paths,
            pid: std::process::id(),
            held: false,
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.paths.pid_file(&self.service)
    }

    fn info_file(&self) -> PathBuf {
        self.paths.runtime_info_file(&self.service)
    }

    /// Acquire the lock, reclaiming a stale PID file in place (spec §4.H
    /// steps 1-2). Returns [`AcquireOutcome::AlreadyRunning`] instead of
    /// erroring when a live owner holds the lock, so callers can choose to
    /// exit with `already-running` or escalate to [`Self::force_takeover`].
    pub fn acquire(&mut self) -> Result<AcquireOutcome> {
        if let Some(existing_pid) = self.read_pid()? {
            if is_process_running(existing_pid) {
                return Ok(AcquireOutcome::AlreadyRunning);
            }
            info!(
                service = %self.service,
                stale_pid = existing_pid,
                "reclaiming stale singleton lock"
            );
        }

        self.write_pid()?;
        self.held = true;
        Ok(AcquireOutcome::Acquired)
    }

    /// Terminate the current owner (SIGTERM, then SIGKILL after the grace
    /// period if it hasn't exited) and retry acquisition, per spec §4.H
    /// step 3.
    pub fn force_takeover(&mut self) -> Result<()> {
        let Some(existing_pid) = self.read_pid()? else {
            self.write_pid()?;
            self.held = true;
            return Ok(());
        };

        if !is_process_running(existing_pid) {
            self.write_pid()?;
            self.held = true;
            return Ok(());
        }

        warn!(service = %self.service, victim_pid = existing_pid, "forcing singleton takeover");
        send_signal(existing_pid, Signal::Term);

        let deadline = std::time::Instant::now() + TAKEOVER_GRACE_PERIOD;
        while std::time::Instant::now() < deadline {
            if !is_process_running(existing_pid) {
                break;
            }
            thread::sleep(TAKEOVER_POLL_INTERVAL);
        }

        if is_process_running(existing_pid) {
            warn!(service = %self.service, victim_pid = existing_pid, "SIGTERM ignored, sending SIGKILL");
            send_signal(existing_pid, Signal::Kill);
            thread::sleep(TAKEOVER_POLL_INTERVAL);
        }

        if is_process_running(existing_pid) {
            bail!("failed to terminate prior owner pid {existing_pid} for service {}", self.service);
        }

        let _ = std::fs::remove_file(self.pid_file());
        self.write_pid()?;
        self.held = true;
        Ok(())
    }

    /// Release the lock on graceful shutdown (spec §4.H "Release").
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        let _ = std::fs::remove_file(self.pid_file());
        let _ = std::fs::remove_file(self.info_file());
        self.held = false;
        Ok(())
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self
            .read_pid()?
            .map(is_process_running)
            .unwrap_or(false))
    }

    pub fn running_pid(&self) -> Result<Option<u32>> {
        Ok(self
            .read_pid()?
            .filter(|pid| is_process_running(*pid)))
    }

    fn read_pid(&self) -> Result<Option<u32>> {
        let path = self.pid_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read pid file {}", path.display()))?;
        Ok(content.trim().parse::<u32>().ok())
    }

    fn write_pid(&self) -> Result<()> {
        fs_bus::write_atomic(&self.pid_file(), self.pid.to_string().as_bytes())?;

        let info = RuntimeInfo {
            pid: self.pid,
            service: self.service.clone(),
            root: self.paths.root().display().to_string(),
            started_at: now_secs_f64(),
        };
        let bytes = serde_json::to_vec_pretty(&info).context("failed to serialize runtime info")?;
        fs_bus::write_atomic(&self.info_file(), &bytes)
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        if self.held {
            let _ = self.release();
        }
    }
}

fn is_process_running(pid: u32) -> bool {
    let mut system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

fn send_signal(pid: u32, signal: Signal) {
    let mut system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system.refresh_processes();
    if let Some(process) = system.process(Pid::from_u32(pid)) {
        let _ = process.kill_with(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(service: &str) -> (tempfile::TempDir, SingletonGuard) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        (dir, SingletonGuard::new(service, paths))
    }

    #[test]
    fn acquire_with_no_existing_lock_succeeds() {
        let (_dir, mut g) = guard("feeder");
        assert_eq!(g.acquire().unwrap(), AcquireOutcome::Acquired);
        assert!(g.pid_file().exists());
    }

    #[test]
    fn acquire_writes_own_pid() {
        let (_dir, mut g) = guard("feeder");
        g.acquire().unwrap();
        let content = std::fs::read_to_string(g.pid_file()).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn acquire_reclaims_stale_pid_file() {
        let (_dir, mut g) = guard("feeder");
        // A PID that's virtually certain not to be a live process.
        std::fs::create_dir_all(g.pid_file().parent().unwrap()).unwrap();
        std::fs::write(g.pid_file(), "999999999").unwrap();

        assert_eq!(g.acquire().unwrap(), AcquireOutcome::Acquired);
        let content = std::fs::read_to_string(g.pid_file()).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn acquire_reports_already_running_for_live_owner() {
        let (_dir, mut g) = guard("feeder");
        std::fs::create_dir_all(g.pid_file().parent().unwrap()).unwrap();
        std::fs::write(g.pid_file(), std::process::id().to_string()).unwrap();

        assert_eq!(g.acquire().unwrap(), AcquireOutcome::AlreadyRunning);
    }

    #[test]
    fn release_removes_pid_file() {
        let (_dir, mut g) = guard("feeder");
        g.acquire().unwrap();
        assert!(g.pid_file().exists());
        g.release().unwrap();
        assert!(!g.pid_file().exists());
    }

    #[test]
    fn is_running_reflects_lock_state() {
        let (_dir, mut g) = guard("feeder");
        assert!(!g.is_running().unwrap());
        g.acquire().unwrap();
        assert!(g.is_running().unwrap());
    }
}
