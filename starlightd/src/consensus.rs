//! Consensus rounds.
//!
//! A round is opened for a command before it touches the page. Every
//! verified sentinel at broadcast time is a participant; the round resolves
//! once all current participants have cleared and nobody holds a hijack.
//! Membership is dynamic: a participant that disconnects stops counting
//! towards the quorum. A round resolves exactly once, through quorum,
//! resume, timeout, supersession or abort, whichever comes first.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use crate::registry::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Quorum,
    Resumed,
    TimedOut,
    /// A newer round replaced this one before it resolved.
    Superseded,
    /// The hub is shutting down.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearEffect {
    NoRound,
    /// Sender is not a participant of the round.
    Ignored,
    Pending { cleared: usize, required: usize },
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HijackEffect {
    NoRound,
    Hijacked { round: String },
    AlreadyHijacked { by: ConnId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeEffect {
    NoRound,
    NotHijacked,
    Resumed { round: String, latency: Duration },
}

#[derive(Debug)]
struct Round {
    participants: HashSet<ConnId>,
    cleared: HashSet<ConnId>,
    waits: usize,
    hijacked_by: Option<ConnId>,
    hijacked_at: Option<Instant>,
    resolver: Option<oneshot::Sender<RoundOutcome>>,
}

impl Round {
    fn required(&self) -> usize {
        self.participants.len()
    }

    fn quorum_reached(&self) -> bool {
        self.hijacked_by.is_none() && self.cleared.len() >= self.required()
    }
}

#[derive(Debug, Default)]
pub struct ConsensusBook {
    rounds: HashMap<String, Round>,
    active: Option<String>,
}

impl ConsensusBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open round `id` and make it the active one. Any other active round
    /// is resolved as superseded.
    pub fn open(
        &mut self,
        id: &str,
        participants: impl IntoIterator<Item = ConnId>,
    ) -> oneshot::Receiver<RoundOutcome> {
        if let Some(previous) = self.active.clone() {
            self.settle(&previous, RoundOutcome::Superseded);
        }
        if self.rounds.contains_key(id) {
            self.settle(id, RoundOutcome::Superseded);
        }

        let (tx, rx) = oneshot::channel();
        let round = Round {
            participants: participants.into_iter().collect(),
            cleared: HashSet::new(),
            waits: 0,
            hijacked_by: None,
            hijacked_at: None,
            resolver: Some(tx),
        };
        let immediate = round.quorum_reached();
        self.rounds.insert(id.to_string(), round);
        self.active = Some(id.to_string());
        if immediate {
            self.settle(id, RoundOutcome::Quorum);
        }
        rx
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn required(&self, id: &str) -> Option<usize> {
        self.rounds.get(id).map(Round::required)
    }

    pub fn cleared(&self, id: &str) -> Option<usize> {
        self.rounds.get(id).map(|r| r.cleared.len())
    }

    pub fn waits(&self, id: &str) -> Option<usize> {
        self.rounds.get(id).map(|r| r.waits)
    }

    /// Round currently hijacked by `conn`, if any.
    pub fn hijacked_by(&self, conn: ConnId) -> Option<&str> {
        self.rounds
            .iter()
            .find(|(_, round)| round.hijacked_by == Some(conn))
            .map(|(id, _)| id.as_str())
    }

    fn target(&self, id: Option<&str>) -> Option<String> {
        match id {
            Some(id) if self.rounds.contains_key(id) => Some(id.to_string()),
            _ => self.active.clone(),
        }
    }

    pub fn clear(&mut self, conn: ConnId, id: Option<&str>) -> ClearEffect {
        let Some(target) = self.target(id) else {
            return ClearEffect::NoRound;
        };
        let Some(round) = self.rounds.get_mut(&target) else {
            return ClearEffect::NoRound;
        };
        if !round.participants.contains(&conn) {
            return ClearEffect::Ignored;
        }
        round.cleared.insert(conn);
        self.evaluate(&target)
    }

    /// Record a `wait`. It neither clears nor blocks the round.
    pub fn wait(&mut self, conn: ConnId, id: Option<&str>) -> bool {
        let Some(target) = self.target(id) else {
            return false;
        };
        match self.rounds.get_mut(&target) {
            Some(round) => {
                round.waits += 1;
                debug!(round = %target, conn, "wait recorded");
                true
            }
            None => false,
        }
    }

    pub fn hijack(&mut self, conn: ConnId, id: Option<&str>) -> HijackEffect {
        let Some(target) = self.target(id) else {
            return HijackEffect::NoRound;
        };
        let Some(round) = self.rounds.get_mut(&target) else {
            return HijackEffect::NoRound;
        };
        if let Some(by) = round.hijacked_by {
            return HijackEffect::AlreadyHijacked { by };
        }
        round.hijacked_by = Some(conn);
        round.hijacked_at = Some(Instant::now());
        HijackEffect::Hijacked { round: target }
    }

    /// End a hijack. The resumer counts as cleared and the round resolves.
    pub fn resume(&mut self, conn: ConnId, id: Option<&str>) -> ResumeEffect {
        let target = match id {
            Some(id) if self.rounds.contains_key(id) => Some(id.to_string()),
            _ => self
                .hijacked_by(conn)
                .map(str::to_string)
                .or_else(|| self.active.clone()),
        };
        let Some(target) = target else {
            return ResumeEffect::NoRound;
        };
        let Some(round) = self.rounds.get_mut(&target) else {
            return ResumeEffect::NoRound;
        };
        let Some(started) = round.hijacked_at.take() else {
            return ResumeEffect::NotHijacked;
        };
        round.hijacked_by = None;
        if round.participants.contains(&conn) {
            round.cleared.insert(conn);
        }
        let latency = started.elapsed();
        self.settle(&target, RoundOutcome::Resumed);
        ResumeEffect::Resumed {
            round: target,
            latency,
        }
    }

    /// Drop `conn` from every round it takes part in. Returns the rounds
    /// that resolved as a result.
    pub fn depart(&mut self, conn: ConnId) -> Vec<String> {
        let affected: Vec<String> = self
            .rounds
            .iter()
            .filter(|(_, r)| r.participants.contains(&conn) || r.hijacked_by == Some(conn))
            .map(|(id, _)| id.clone())
            .collect();

        let mut resolved = Vec::new();
        for id in affected {
            if let Some(round) = self.rounds.get_mut(&id) {
                round.participants.remove(&conn);
                round.cleared.remove(&conn);
                if round.hijacked_by == Some(conn) {
                    round.hijacked_by = None;
                    round.hijacked_at = None;
                }
            }
            if self.evaluate(&id) == ClearEffect::Resolved {
                resolved.push(id);
            }
        }
        resolved
    }

    /// Timeout path. Returns false when the round had already resolved.
    pub fn expire(&mut self, id: &str) -> bool {
        self.settle(id, RoundOutcome::TimedOut)
    }

    pub fn abort_all(&mut self) -> usize {
        let ids: Vec<String> = self.rounds.keys().cloned().collect();
        ids.iter()
            .filter(|id| self.settle(id, RoundOutcome::Aborted))
            .count()
    }

    fn evaluate(&mut self, id: &str) -> ClearEffect {
        let Some(round) = self.rounds.get(id) else {
            return ClearEffect::NoRound;
        };
        if round.quorum_reached() {
            self.settle(id, RoundOutcome::Quorum);
            ClearEffect::Resolved
        } else {
            ClearEffect::Pending {
                cleared: round.cleared.len(),
                required: round.required(),
            }
        }
    }

    fn settle(&mut self, id: &str, outcome: RoundOutcome) -> bool {
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        let Some(mut round) = self.rounds.remove(id) else {
            return false;
        };
        match round.resolver.take() {
            Some(tx) => {
                // The waiter may already have given up; that is fine.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}
