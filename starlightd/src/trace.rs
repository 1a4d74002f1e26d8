//! The mission trace: ordered forensic record of everything the hub did.
//!
//! The trace is the only source of truth for mission success. It is
//! rewritten atomically after every append so a crash leaves the last
//! complete version on disk.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to write trace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialise trace: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Command,
    Failure,
    Hijack,
    SentinelAction,
    Recovery,
    Checkpoint,
}

impl EventKind {
    /// Kinds that decide whether the mission succeeded.
    pub fn is_outcome(self) -> bool {
        matches!(self, EventKind::Command | EventKind::Failure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForensicEvent {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// `hub`, `client` or the sentinel's layer name.
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_screenshot: Option<String>,
    /// Error text, hijack reason or checkpoint label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ForensicEvent {
    pub fn new(kind: EventKind, actor: impl Into<String>) -> Self {
        Self {
            seq: 0,
            kind,
            timestamp: Utc::now(),
            actor: actor.into(),
            command_id: None,
            cmd: None,
            goal: None,
            selector: None,
            success: None,
            before_screenshot: None,
            after_screenshot: None,
            detail: None,
            latency_ms: None,
        }
    }

    pub fn command(mut self, id: Option<String>, cmd: impl Into<String>) -> Self {
        self.command_id = id;
        self.cmd = Some(cmd.into());
        self
    }

    pub fn goal(mut self, goal: Option<String>) -> Self {
        self.goal = goal;
        self
    }

    pub fn selector(mut self, selector: Option<String>) -> Self {
        self.selector = selector;
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn screenshots(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.before_screenshot = before;
        self.after_screenshot = after;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn latency_ms(mut self, latency: u64) -> Self {
        self.latency_ms = Some(latency);
        self
    }
}

#[derive(Debug, Default)]
pub struct MissionTrace {
    path: Option<PathBuf>,
    events: Vec<ForensicEvent>,
}

impl MissionTrace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            events: Vec::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append and flush. The event is kept in memory even if the flush
    /// fails; the error is returned for the caller to log.
    pub fn append(&mut self, mut event: ForensicEvent) -> Result<u64, TraceError> {
        event.seq = self.events.len() as u64 + 1;
        let seq = event.seq;
        self.events.push(event);
        self.flush()?;
        Ok(seq)
    }

    pub fn events(&self) -> &[ForensicEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    /// AND over every command outcome. A mission with no commands succeeded.
    pub fn mission_success(&self) -> bool {
        self.events
            .iter()
            .filter(|e| e.kind.is_outcome())
            .all(|e| e.kind == EventKind::Command && e.success.unwrap_or(false))
    }

    pub fn flush(&self) -> Result<(), TraceError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(&self.events)?;
        write_atomic(path, &body)
    }
}

/// Write `body` to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, body: &[u8]) -> Result<(), TraceError> {
    let io_err = |source: std::io::Error| TraceError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_and_over_outcomes() {
        let mut trace = MissionTrace::in_memory();
        assert!(trace.mission_success());

        trace
            .append(ForensicEvent::new(EventKind::Command, "client").success(true))
            .unwrap();
        trace
            .append(ForensicEvent::new(EventKind::Hijack, "pii").detail("modal"))
            .unwrap();
        assert!(trace.mission_success());

        trace
            .append(ForensicEvent::new(EventKind::Failure, "client").success(false))
            .unwrap();
        assert!(!trace.mission_success());
        assert_eq!(trace.count(EventKind::Command), 1);
        assert_eq!(trace.events()[2].seq, 3);
    }

    #[test]
    fn every_append_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/trace.json");
        let mut trace = MissionTrace::new(&path);

        trace
            .append(
                ForensicEvent::new(EventKind::Command, "client")
                    .command(Some("1".into()), "goto")
                    .success(true),
            )
            .unwrap();
        trace
            .append(ForensicEvent::new(EventKind::Checkpoint, "client").detail("cart"))
            .unwrap();

        let on_disk: Vec<ForensicEvent> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, trace.events());
        assert!(!path.with_extension("tmp").exists());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"type\": \"CHECKPOINT\""));
        assert!(raw.contains("\"commandId\": \"1\""));
    }
}
