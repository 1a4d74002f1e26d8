//! Connections and the sentinel roster.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use starlight_protocol::{Envelope, RegistrationParams};
use tokio::sync::mpsc;

pub type ConnId = u64;

/// What a connection's writer task should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close,
}

pub type Outbox = mpsc::UnboundedSender<Outbound>;

/// Queue `envelope` on `outbox`. False when the writer has gone away.
pub fn send_envelope(outbox: &Outbox, envelope: &Envelope) -> bool {
    outbox.send(Outbound::Frame(envelope.to_text())).is_ok()
}

#[derive(Debug, Clone)]
pub enum Phase {
    Connected,
    ChallengePending {
        challenge: String,
        assigned_id: String,
        registration: RegistrationParams,
    },
    Sentinel,
    Client,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub peer: String,
    pub phase: Phase,
    pub outbox: Outbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Online,
    Degraded,
    Offline,
    Idle,
    AwaitingPulse,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Health::Online => "online",
            Health::Degraded => "degraded",
            Health::Offline => "offline",
            Health::Idle => "idle",
            Health::AwaitingPulse => "awaiting_pulse",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SentinelRecord {
    pub conn: ConnId,
    pub layer: String,
    pub assigned_id: String,
    pub priority: u8,
    pub capabilities: Vec<String>,
    pub selectors: Vec<String>,
    pub version: Option<String>,
    pub health: Health,
    pub last_seen: Instant,
    pub registered_at: DateTime<Utc>,
    pub outbox: Outbox,
}

impl SentinelRecord {
    pub fn new(conn: ConnId, assigned_id: String, params: RegistrationParams, outbox: Outbox) -> Self {
        Self {
            conn,
            layer: params.layer,
            assigned_id,
            priority: params.priority,
            capabilities: params.capabilities,
            selectors: params.selectors,
            version: params.version,
            health: Health::AwaitingPulse,
            last_seen: Instant::now(),
            registered_at: Utc::now(),
            outbox,
        }
    }

    /// Record a heartbeat. A sentinel may report itself idle.
    pub fn pulse(&mut self, reported: Option<&str>) {
        self.last_seen = Instant::now();
        self.health = match reported {
            Some("idle") => Health::Idle,
            Some("degraded") => Health::Degraded,
            _ => Health::Online,
        };
    }

    /// Age the health by silence. Returns `(from, to)` on a change.
    pub fn refresh_health(&mut self, now: Instant, timeout: Duration) -> Option<(Health, Health)> {
        let silent = now.saturating_duration_since(self.last_seen);
        let next = if silent > timeout * 3 {
            Health::Offline
        } else if silent > timeout {
            Health::Degraded
        } else {
            return None;
        };
        if next == self.health {
            return None;
        }
        let previous = self.health;
        self.health = next;
        Some((previous, next))
    }

    pub fn summary(&self) -> SentinelSummary {
        SentinelSummary {
            layer: self.layer.clone(),
            assigned_id: self.assigned_id.clone(),
            priority: self.priority,
            capabilities: self.capabilities.clone(),
            selectors: self.selectors.clone(),
            health: self.health,
            last_seen_ms_ago: self.last_seen.elapsed().as_millis() as u64,
            registered_at: self.registered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSummary {
    pub layer: String,
    pub assigned_id: String,
    pub priority: u8,
    pub capabilities: Vec<String>,
    pub selectors: Vec<String>,
    pub health: Health,
    pub last_seen_ms_ago: u64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnId, Connection>,
    sentinels: BTreeMap<ConnId, SentinelRecord>,
    /// Sentinels that ever joined, kept for the final roster.
    departed: Vec<SentinelSummary>,
}

impl Registry {
    pub fn attach(&mut self, id: ConnId, peer: String, outbox: Outbox) {
        self.connections.insert(
            id,
            Connection {
                id,
                peer,
                phase: Phase::Connected,
                outbox,
            },
        );
    }

    /// Forget a connection. Returns the sentinel it carried, if any.
    pub fn detach(&mut self, id: ConnId) -> Option<SentinelRecord> {
        self.connections.remove(&id);
        let record = self.sentinels.remove(&id)?;
        let mut summary = record.summary();
        summary.health = Health::Offline;
        self.departed.push(summary);
        Some(record)
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn promote(&mut self, record: SentinelRecord) {
        if let Some(conn) = self.connections.get_mut(&record.conn) {
            conn.phase = Phase::Sentinel;
        }
        self.sentinels.insert(record.conn, record);
    }

    pub fn sentinel(&self, id: ConnId) -> Option<&SentinelRecord> {
        self.sentinels.get(&id)
    }

    pub fn sentinel_mut(&mut self, id: ConnId) -> Option<&mut SentinelRecord> {
        self.sentinels.get_mut(&id)
    }

    pub fn sentinel_by_layer(&self, layer: &str) -> Option<&SentinelRecord> {
        self.sentinels.values().find(|s| s.layer == layer)
    }

    pub fn sentinels(&self) -> impl Iterator<Item = &SentinelRecord> {
        self.sentinels.values()
    }

    pub fn sentinels_mut(&mut self) -> impl Iterator<Item = &mut SentinelRecord> {
        self.sentinels.values_mut()
    }

    pub fn active_ids(&self) -> Vec<ConnId> {
        self.sentinels.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.sentinels.len()
    }

    pub fn layers(&self) -> Vec<String> {
        self.sentinels.values().map(|s| s.layer.clone()).collect()
    }

    /// Union of the selectors every sentinel watches, in first-seen order.
    pub fn watch_selectors(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for selector in self.sentinels.values().flat_map(|s| s.selectors.iter()) {
            if !out.contains(selector) {
                out.push(selector.clone());
            }
        }
        out
    }

    /// Send to every sentinel except `except`. Returns the number reached.
    pub fn broadcast(&self, envelope: &Envelope, except: Option<ConnId>) -> usize {
        let text = envelope.to_text();
        self.sentinels
            .values()
            .filter(|s| Some(s.conn) != except)
            .filter(|s| s.outbox.send(Outbound::Frame(text.clone())).is_ok())
            .count()
    }

    /// Display label for log fields and the audit trail.
    pub fn label(&self, id: ConnId) -> String {
        match self.sentinels.get(&id) {
            Some(sentinel) => sentinel.layer.clone(),
            None => format!("conn-{id}"),
        }
    }

    /// Current sentinels followed by those that left during the mission.
    pub fn roster(&self) -> Vec<SentinelSummary> {
        self.sentinels
            .values()
            .map(SentinelRecord::summary)
            .chain(self.departed.iter().cloned())
            .collect()
    }

    pub fn outboxes(&self) -> Vec<Outbox> {
        self.connections.values().map(|c| c.outbox.clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use starlight_protocol::Method;

    fn registration(layer: &str, selectors: &[&str]) -> RegistrationParams {
        RegistrationParams {
            layer: layer.to_string(),
            priority: 5,
            capabilities: vec!["detection".into()],
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            version: None,
            auth_token: None,
        }
    }

    #[test]
    fn health_ages_with_silence() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut record = SentinelRecord::new(1, "s-1".into(), registration("pii", &[]), tx);
        let timeout = Duration::from_millis(100);
        let start = record.last_seen;

        assert_eq!(record.refresh_health(start + Duration::from_millis(50), timeout), None);
        assert_eq!(
            record.refresh_health(start + Duration::from_millis(150), timeout),
            Some((Health::AwaitingPulse, Health::Degraded))
        );
        assert_eq!(record.refresh_health(start + Duration::from_millis(200), timeout), None);
        assert_eq!(
            record.refresh_health(start + Duration::from_millis(301), timeout),
            Some((Health::Degraded, Health::Offline))
        );
        record.pulse(None);
        assert_eq!(record.health, Health::Online);
        record.pulse(Some("idle"));
        assert_eq!(record.health, Health::Idle);
    }

    #[test]
    fn broadcast_skips_sender_and_roster_keeps_departed() {
        let mut registry = Registry::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.attach(1, "peer1".into(), tx1.clone());
        registry.attach(2, "peer2".into(), tx2.clone());
        registry.promote(SentinelRecord::new(1, "s-1".into(), registration("pii", &["#modal"]), tx1));
        registry.promote(SentinelRecord::new(2, "s-2".into(), registration("janitor", &["#modal", ".popup"]), tx2));

        assert_eq!(registry.watch_selectors(), vec!["#modal".to_string(), ".popup".to_string()]);
        let note = Envelope::notification(Method::SovereignUpdate, json!({"context": {}}));
        assert_eq!(registry.broadcast(&note, Some(1)), 1);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(Outbound::Frame(_))));

        assert_eq!(registry.label(2), "janitor");
        assert!(registry.detach(2).is_some());
        assert_eq!(registry.label(2), "conn-2");
        let roster = registry.roster();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[1].health, Health::Offline);
    }
}
