// =============================================================================
// Aggregation loop — spec §4.C steps 1-6
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::fs_bus;
use crate::ssot::{RepoPaths, HEALTH_COMPONENTS};
use crate::types::{now_secs_f64, HealthStatus};

use super::{default_threshold, worst_of, AggregatedHealth, ComponentHealth, HeartbeatRecord};

const WRITER_VERSION: &str = "cq-core/1";

/// Periodic scanner of per-service heartbeat files that writes the
/// consolidated `health.json` document.
pub struct Aggregator {
    paths: RepoPaths,
    interval: Duration,
    thresholds: HashMap<String, f64>,
}

impl Aggregator {
    /// Build an aggregator with the default 3 s cycle and the spec's default
    /// per-component freshness thresholds.
    pub fn new(paths: RepoPaths) -> Self {
        Self::with_interval(paths, Duration::from_secs(3))
    }

    pub fn with_interval(paths: RepoPaths, interval: Duration) -> Self {
        let thresholds = HEALTH_COMPONENTS
            .iter()
            .map(|name| (name.to_string(), default_threshold(name)))
            .collect();
        Self {
            paths,
            interval,
            thresholds,
        }
    }

    /// Override a component's freshness threshold (e.g. from `FEEDER_TTL`).
    pub fn set_threshold(&mut self, component: &str, seconds: f64) {
        self.thresholds.insert(component.to_string(), seconds);
    }

    /// Run the aggregation loop forever, ticking every `interval`. Intended
    /// to be spawned as its own task — matches the teacher's
    /// `tokio::time::interval` loop shape used for its periodic jobs.
    pub async fn run(mut self) -> ! {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.cycle() {
                Ok(health) => debug!(
                    global_status = %health.global_status,
                    components = health.components.len(),
                    "health aggregation cycle complete"
                ),
                Err(e) => warn!(error = %e, "health aggregation cycle failed"),
            }
        }
    }

    /// Run a single aggregation cycle: read every component's heartbeat,
    /// classify it, compute the global status, and write the result
    /// atomically. Never fails the whole cycle on one component's read
    /// error — per spec §7, the aggregator is the one component allowed to
    /// degrade locally instead of surfacing a typed error.
    pub fn cycle(&mut self) -> Result<AggregatedHealth> {
        let now = now_secs_f64();
        let mut components = HashMap::new();

        for &name in HEALTH_COMPONENTS {
            let threshold = *self.thresholds.get(name).unwrap_or(&60.0);
            let entry = self.read_component(name, now, threshold);
            components.insert(name.to_string(), entry);
        }

        let global_status = worst_of(components.values().map(|c| c.status));

        let health = AggregatedHealth {
            ts: now,
            global_status,
            components,
            writer_version: WRITER_VERSION.to_string(),
        };

        let bytes = serde_json::to_vec_pretty(&health)?;
        fs_bus::write_atomic(&self.paths.aggregated_health_file(), &bytes)?;

        Ok(health)
    }

    fn read_component(&self, name: &str, now: f64, threshold: f64) -> ComponentHealth {
        let path = self.paths.health_file(name);

        if !path.exists() {
            return ComponentHealth {
                status: HealthStatus::Missing,
                last_ts: None,
                age_sec: f64::INFINITY,
                data: None,
            };
        }

        match fs_bus::read_json_tolerant::<HeartbeatRecord>(&path) {
            Ok(record) => {
                let last_ts = record.ts.0;
                // Spec §4.C step 2: age_sec is measured against the file's
                // mtime, not the payload's self-reported ts, so a stalled
                // writer that last touched the file N seconds ago is caught
                // even if its payload.ts lags or lies.
                let age_sec = file_mtime_age_sec(&path, now).unwrap_or((now - last_ts).max(0.0));
                // Reported status is advisory; freshness still governs the
                // worst-of computation via the classified age below when the
                // service itself under-reports its own staleness.
                let status = if age_sec > 2.0 * threshold {
                    HealthStatus::Red
                } else if age_sec > threshold {
                    HealthStatus::Yellow
                } else {
                    record.status
                };
                ComponentHealth {
                    status,
                    last_ts: Some(last_ts),
                    age_sec,
                    data: Some(record.payload),
                }
            }
            Err(e) => {
                info!(component = name, error = %e, "failed to parse heartbeat file");
                ComponentHealth {
                    status: HealthStatus::Error,
                    last_ts: None,
                    age_sec: f64::INFINITY,
                    data: Some(serde_json::json!({ "error": e.to_string() })),
                }
            }
        }
    }
}

/// Seconds since `path`'s mtime, measured against `now` (epoch seconds).
/// `None` if the file's metadata or mtime can't be read, in which case the
/// caller falls back to the payload's self-reported timestamp.
fn file_mtime_age_sec(path: &std::path::Path, now: f64) -> Option<f64> {
    let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
    let mtime_epoch_secs = mtime.duration_since(std::time::UNIX_EPOCH).ok()?.as_secs_f64();
    Some((now - mtime_epoch_secs).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FlexibleTimestamp;
    use crate::types::now_secs_f64;

    /// Writes a heartbeat file and backdates its mtime by `age_offset`
    /// seconds, since the aggregator now ages components off the file's
    /// mtime rather than the payload's self-reported `ts` (spec §4.C step 2).
    fn write_heartbeat(paths: &RepoPaths, service: &str, status: HealthStatus, age_offset: f64) {
        let ts = now_secs_f64() - age_offset;
        let record = HeartbeatRecord {
            service_name: service.to_string(),
            status,
            ts: FlexibleTimestamp(ts),
            producer: "test".to_string(),
            version: "1".to_string(),
            checksum: None,
            payload: serde_json::json!({}),
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        let path = paths.health_file(service);
        fs_bus::write_atomic(&path, &bytes).unwrap();

        let backdated = std::time::UNIX_EPOCH + std::time::Duration::from_secs_f64(ts.max(0.0));
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(backdated).unwrap();
    }

    #[test]
    fn missing_component_is_missing_status() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        let mut agg = Aggregator::new(paths);
        let health = agg.cycle().unwrap();
        assert_eq!(health.components["feeder"].status, HealthStatus::Missing);
        assert_eq!(health.global_status, HealthStatus::Yellow);
    }

    #[test]
    fn fresh_green_component_stays_green() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        write_heartbeat(&paths, "feeder", HealthStatus::Green, 1.0);
        let mut agg = Aggregator::new(paths);
        let health = agg.cycle().unwrap();
        assert_eq!(health.components["feeder"].status, HealthStatus::Green);
    }

    #[test]
    fn stale_component_degrades_to_yellow_then_red() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        write_heartbeat(&paths, "feeder", HealthStatus::Green, 65.0);
        let mut agg = Aggregator::new(paths.clone());
        let health = agg.cycle().unwrap();
        assert_eq!(health.components["feeder"].status, HealthStatus::Yellow);

        write_heartbeat(&paths, "feeder", HealthStatus::Green, 61.0 + 60.0);
        let health = agg.cycle().unwrap();
        assert_eq!(health.components["feeder"].status, HealthStatus::Red);
        assert_eq!(health.global_status, HealthStatus::Red);
    }

    #[test]
    fn any_red_component_makes_global_red() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::from_root(dir.path()).unwrap();
        for &name in HEALTH_COMPONENTS {
            write_heartbeat(&paths, name, HealthStatus::Green, 1.0);
        }
        write_heartbeat(&paths, "trader", HealthStatus::Red, 1.0);
        let mut agg = Aggregator::new(paths);
        let health = agg.cycle().unwrap();
        assert_eq!(health.global_status, HealthStatus::Red);
    }
}
