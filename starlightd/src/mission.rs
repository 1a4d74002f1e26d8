//! Mission state and the final report.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use starlight_protocol::ContextMap;
use starlight_resolver::ResolverStats;
use tracing::{debug, info, warn};

use crate::registry::SentinelSummary;
use crate::trace::{write_atomic, EventKind, ForensicEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    /// Connection label the offending frame came from.
    pub origin: String,
    pub kind: String,
    /// Already redacted.
    pub detail: String,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionMetrics {
    pub consensus_rounds: u64,
    pub consensus_timeouts: u64,
    pub recovery_latencies_ms: Vec<u64>,
}

impl MissionMetrics {
    pub fn mean_recovery_ms(&self) -> Option<f64> {
        if self.recovery_latencies_ms.is_empty() {
            return None;
        }
        let total: u64 = self.recovery_latencies_ms.iter().sum();
        Some(total as f64 / self.recovery_latencies_ms.len() as f64)
    }
}

/// One orchestrator run.
#[derive(Debug)]
pub struct Mission {
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub target_url: Option<String>,
    context: ContextMap,
    security_events: Vec<SecurityEvent>,
    pub metrics: MissionMetrics,
}

impl Mission {
    pub fn new(target_url: Option<String>) -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            target_url,
            context: ContextMap::new(),
            security_events: Vec::new(),
            metrics: MissionMetrics::default(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Merge `update` into the shared context; later writes win per key.
    pub fn merge_context(&mut self, update: ContextMap) {
        self.context.extend(update);
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    pub fn record_security_event(&mut self, origin: &str, kind: &str, detail: String) {
        self.security_events.push(SecurityEvent {
            timestamp: Utc::now(),
            origin: origin.to_string(),
            kind: kind.to_string(),
            detail,
        });
    }

    pub fn security_events(&self) -> &[SecurityEvent] {
        &self.security_events
    }

    pub fn record_recovery(&mut self, latency: Duration) {
        self.metrics
            .recovery_latencies_ms
            .push(latency.as_millis() as u64);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionStats {
    pub commands: usize,
    pub failures: usize,
    pub hijacks: usize,
    pub sentinel_actions: usize,
    pub recoveries: usize,
    pub checkpoints: usize,
    pub consensus_rounds: u64,
    pub consensus_timeouts: u64,
    pub mean_recovery_ms: Option<f64>,
    pub cache_hits: u64,
    pub history_hits: u64,
    pub heuristic_runs: u64,
    pub learned: u64,
}

impl MissionStats {
    pub fn collect(trace: &[ForensicEvent], metrics: &MissionMetrics, resolver: ResolverStats) -> Self {
        let count = |kind: EventKind| trace.iter().filter(|e| e.kind == kind).count();
        Self {
            commands: count(EventKind::Command),
            failures: count(EventKind::Failure),
            hijacks: count(EventKind::Hijack),
            sentinel_actions: count(EventKind::SentinelAction),
            recoveries: count(EventKind::Recovery),
            checkpoints: count(EventKind::Checkpoint),
            consensus_rounds: metrics.consensus_rounds,
            consensus_timeouts: metrics.consensus_timeouts,
            mean_recovery_ms: metrics.mean_recovery_ms(),
            cache_hits: resolver.cache_hits,
            history_hits: resolver.history_hits,
            heuristic_runs: resolver.heuristic_runs,
            learned: resolver.learned,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionReport {
    pub version: String,
    pub build: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub target_url: Option<String>,
    pub success: bool,
    pub shutdown_reason: String,
    pub stats: MissionStats,
    pub roster: Vec<SentinelSummary>,
    pub context: Value,
    pub security_events: Vec<SecurityEvent>,
    pub trace: Vec<ForensicEvent>,
}

/// Turns a finished mission into a document.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, report: &MissionReport) -> Result<Vec<u8>>;
}

pub struct JsonReportRenderer;

impl ReportRenderer for JsonReportRenderer {
    fn render(&self, report: &MissionReport) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(report).context("serialising mission report")
    }
}

pub fn write_report(renderer: &dyn ReportRenderer, report: &MissionReport, path: &Path) -> Result<()> {
    let body = renderer.render(report)?;
    write_atomic(path, &body)?;
    info!(path = %path.display(), success = report.success, "Mission report written");
    Ok(())
}

/// Delete screenshots older than `max_age`. Returns how many were removed.
pub fn prune_screenshots(dir: &Path, max_age: Duration) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "No screenshot directory to prune");
            return 0;
        }
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e, "png" | "jpg" | "jpeg"))
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if expired {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "Failed to prune screenshot"),
            }
        }
    }
    if removed > 0 {
        info!(removed, dir = %dir.display(), "Pruned old screenshots");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_merge_is_last_write_wins() {
        let mut mission = Mission::new(None);
        mission.merge_context(ContextMap::from([
            ("user".to_string(), json!("alice")),
            ("step".to_string(), json!(1)),
        ]));
        mission.merge_context(ContextMap::from([("step".to_string(), json!(2))]));
        assert_eq!(mission.context()["user"], json!("alice"));
        assert_eq!(mission.context()["step"], json!(2));
    }

    #[test]
    fn stats_count_trace_kinds() {
        let trace = vec![
            ForensicEvent::new(EventKind::Command, "client").success(true),
            ForensicEvent::new(EventKind::Hijack, "pii"),
            ForensicEvent::new(EventKind::SentinelAction, "pii").success(true),
            ForensicEvent::new(EventKind::Recovery, "pii").latency_ms(40),
            ForensicEvent::new(EventKind::Failure, "client").success(false),
        ];
        let mut metrics = MissionMetrics::default();
        metrics.recovery_latencies_ms = vec![40, 60];
        let stats = MissionStats::collect(&trace, &metrics, ResolverStats::default());
        assert_eq!(stats.commands, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.hijacks, 1);
        assert_eq!(stats.mean_recovery_ms, Some(50.0));
    }

    #[test]
    fn prune_only_touches_old_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"png").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(prune_screenshots(dir.path(), Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(prune_screenshots(dir.path(), Duration::from_millis(1)), 1);
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(prune_screenshots(&dir.path().join("missing"), Duration::ZERO), 0);
    }
}
