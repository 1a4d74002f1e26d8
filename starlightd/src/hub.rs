//! The orchestrator.
//!
//! Every inbound frame passes through the [`SecurityGate`] first. Accepted
//! frames are audited in their redacted form and dispatched by method;
//! handlers return the reply to queue on the sender's connection, if any.
//! Intents run one at a time against the page: resolve the goal, hold a
//! consensus round when sentinels are connected, execute with verification,
//! then record the outcome in the mission trace.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use serde_json::{json, Value};
use starlight_build_info::build_stamp;
use starlight_driver::{blocking_elements, PageDriver, StructuralSnapshot};
use starlight_protocol::{
    ActionKind, ActionParams, BlockingElement, ChallengeResponseParams, ClearParams, CommandEvidence,
    CommandOutcome, ContextMap, ContextUpdateParams, DeliveryStatus, Envelope, GateError, HijackParams,
    IntentParams, Method, PreCheckParams, PulseParams, Redactor, RegistrationAckParams,
    RegistrationParams, RegistrationReply, ResumeParams, RpcCode, Screened, SecurityGate,
    ShutdownParams, SidetalkAckParams, SidetalkParams, WaitParams, COMMAND_COMPLETE, PROTOCOL_VERSION,
};
use starlight_resolver::{IntentHint, ResolutionSource, SelectorHistory, SemanticResolver};
use starlight_supervisor::Supervisor;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::auth::RegistrationAuth;
use crate::config::Config;
use crate::consensus::{ClearEffect, ConsensusBook, HijackEffect, ResumeEffect, RoundOutcome};
use crate::executor::{ExecutionError, Executor, ExecutorSettings, Step};
use crate::mission::{
    write_report, JsonReportRenderer, Mission, MissionReport, MissionStats, ReportRenderer,
};
use crate::registry::{send_envelope, ConnId, Outbound, Outbox, Phase, Registry, SentinelRecord};
use crate::trace::{EventKind, ForensicEvent, MissionTrace};

/// Whether the connection's read loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Why the hub is going down; decides the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Requested,
    StartupFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Stopping,
    Exited(i32),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: String,
    pub build: String,
    pub sentinels: usize,
    pub connections: usize,
    pub trace_length: usize,
    pub uptime_secs: u64,
}

/// State touched by almost every handler, kept under one lock.
struct HubState {
    registry: Registry,
    consensus: ConsensusBook,
    mission: Mission,
}

pub struct Hub {
    config: Config,
    gate: SecurityGate,
    auth: RegistrationAuth,
    page: Arc<dyn PageDriver>,
    executor: Executor,
    resolver: Mutex<SemanticResolver>,
    state: Mutex<HubState>,
    trace: Mutex<MissionTrace>,
    supervisor: Mutex<Supervisor>,
    audit: Option<AuditLog>,
    renderer: Box<dyn ReportRenderer>,
    /// Serialises page use between intents and sentinel actions.
    page_lock: Mutex<()>,
    navigated: AtomicBool,
    next_conn: AtomicU64,
    next_command: AtomicU64,
    stopping: AtomicBool,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Hub {
    pub fn new(config: Config, page: Arc<dyn PageDriver>) -> Self {
        let audit = match AuditLog::open(&config.paths.audit, &config.audit_key()) {
            Ok(log) => Some(log),
            Err(err) => {
                warn!("Audit log disabled: {:#}", err);
                None
            }
        };
        let history = SelectorHistory::load(config.paths.history.clone());
        let executor = Executor::new(
            page.clone(),
            ExecutorSettings {
                attempt_timeout: config.hub.attempt_timeout(),
                stabilization_pause: config.hub.stabilization_pause(),
            },
        );
        let (lifecycle, _) = watch::channel(Lifecycle::Running);

        Self {
            gate: SecurityGate::new(Redactor::new(config.security.redact_strings)),
            auth: RegistrationAuth::from_config(&config),
            executor,
            resolver: Mutex::new(SemanticResolver::new(history)),
            state: Mutex::new(HubState {
                registry: Registry::default(),
                consensus: ConsensusBook::new(),
                mission: Mission::new(config.hub.target_url.clone()),
            }),
            trace: Mutex::new(MissionTrace::new(config.paths.trace.clone())),
            supervisor: Mutex::new(Supervisor::new(config.hub.hub_url())),
            audit,
            renderer: Box::new(JsonReportRenderer),
            page_lock: Mutex::new(()),
            navigated: AtomicBool::new(false),
            next_conn: AtomicU64::new(1),
            next_command: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            lifecycle,
            page,
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every enabled sentinel from the configuration.
    pub async fn launch_sentinels(&self) {
        let manifests = self.config.enabled_sentinels();
        if manifests.is_empty() {
            return;
        }
        let report = self.supervisor.lock().await.launch_all(&manifests);
        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Sentinel launch finished"
        );
    }

    pub async fn attach(&self, peer: String, outbox: Outbox) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.state.lock().await.registry.attach(conn, peer.clone(), outbox);
        debug!(conn, peer = %peer, "Connection opened");
        conn
    }

    /// Forget `conn`. A departing sentinel leaves any open round.
    pub async fn detach(&self, conn: ConnId) {
        let mut state = self.state.lock().await;
        let record = state.registry.detach(conn);
        let resolved = state.consensus.depart(conn);
        let remaining = state.registry.active_count();
        drop(state);

        if let Some(record) = record {
            info!(sentinel = %record.layer, sentinels = remaining, "Sentinel disconnected");
        } else {
            debug!(conn, "Connection closed");
        }
        for round in resolved {
            info!(round = %round, "Consensus round resolved after a sentinel left");
        }
    }

    /// Screen, audit and dispatch one inbound text frame.
    pub async fn handle_frame(&self, conn: ConnId, raw: &str) -> Flow {
        if self.stopping.load(Ordering::SeqCst) {
            return Flow::Close;
        }

        let screened = match self.gate.process(raw) {
            Ok(screened) => screened,
            Err(err) => {
                self.reject(conn, &err).await;
                return self.flow(conn).await;
            }
        };

        let (label, verified) = {
            let state = self.state.lock().await;
            (
                state.registry.label(conn),
                state.registry.sentinel(conn).is_some(),
            )
        };

        if screened.method.is_audited() {
            self.audit_event(
                screened.method.as_str(),
                screened.id().as_deref(),
                &label,
                screened.redacted.clone(),
            );
        }

        if screened.method.requires_sentinel() && !verified {
            self.security_event(
                &label,
                "unverified",
                format!("{} from a connection that is not a verified sentinel", screened.method),
            )
            .await;
            if let Some(id) = screened.envelope.id.clone() {
                let reply = Envelope::error_response(
                    Some(id),
                    RpcCode::UNAUTHORIZED,
                    "sentinel registration required",
                );
                self.send_to(conn, &reply).await;
            }
            return self.flow(conn).await;
        }

        match self.dispatch(conn, &label, &screened).await {
            Ok(Some(reply)) => self.send_to(conn, &reply).await,
            Ok(None) => {}
            Err(err) => match err.downcast_ref::<GateError>() {
                Some(gate) => {
                    warn!(conn = %label, method = %screened.method, "Params rejected: {}", gate);
                }
                None => {
                    error!(conn = %label, method = %screened.method, "Handler failed: {:#}", err);
                    if let Some(id) = screened.envelope.id.clone() {
                        let reply = Envelope::error_response(Some(id), RpcCode::INTERNAL, "internal error");
                        self.send_to(conn, &reply).await;
                    }
                }
            },
        }
        self.flow(conn).await
    }

    async fn dispatch(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        match screened.method {
            Method::Registration => self.on_registration(conn, label, screened).await,
            Method::ChallengeResponse => self.on_challenge_response(conn, label, screened).await,
            Method::Pulse => self.on_pulse(conn, screened).await,
            Method::Intent => self.on_intent(conn, label, screened).await,
            Method::Clear => self.on_clear(conn, label, screened).await,
            Method::Wait => self.on_wait(conn, label, screened).await,
            Method::Hijack => self.on_hijack(conn, label, screened).await,
            Method::Action => self.on_action(conn, label, screened).await,
            Method::Resume => self.on_resume(conn, label, screened).await,
            Method::ContextUpdate => self.on_context_update(label, screened).await,
            Method::Sidetalk => self.on_sidetalk(conn, label, screened).await,
            Method::Entropy => self.on_entropy(conn, screened).await,
            Method::Shutdown | Method::Finish => self.on_shutdown_request(conn, label, screened).await,
            Method::RegistrationAck
            | Method::PreCheck
            | Method::SovereignUpdate
            | Method::SidetalkAck
            | Method::CommandComplete => {
                debug!(conn = %label, method = %screened.method, "Ignoring hub-to-peer method");
                Ok(screened.envelope.id.clone().map(|id| {
                    Envelope::error_response(
                        Some(id),
                        RpcCode::INVALID_REQUEST,
                        format!("{} is only sent by the hub", screened.method),
                    )
                }))
            }
        }
    }

    async fn reject(&self, conn: ConnId, err: &GateError) {
        let label = self.state.lock().await.registry.label(conn);
        if err.is_security_event() {
            let kind = match err {
                GateError::UnknownMethod(_) => "unknown_method",
                _ => "protocol",
            };
            self.security_event(&label, kind, err.to_string()).await;
        } else {
            warn!(conn = %label, "Frame rejected: {}", self.gate.redactor().redact_str(&err.to_string()));
        }
    }

    /// Record a security event in the mission and the audit trail.
    async fn security_event(&self, origin: &str, kind: &str, detail: String) {
        let detail = self.gate.redactor().redact_str(&detail);
        warn!(conn = %origin, kind, "Security event: {}", detail);
        self.audit_event(
            "SECURITY_EVENT",
            None,
            origin,
            json!({ "kind": kind, "detail": detail }),
        );
        self.state
            .lock()
            .await
            .mission
            .record_security_event(origin, kind, detail);
    }

    fn audit_event(&self, event: &str, msg_id: Option<&str>, from: &str, meta: Value) {
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.append(event, msg_id.unwrap_or("-"), from, meta) {
                warn!("Audit append failed: {:#}", err);
            }
        }
    }

    async fn send_to(&self, conn: ConnId, envelope: &Envelope) {
        let state = self.state.lock().await;
        if let Some(connection) = state.registry.connection(conn) {
            if !send_envelope(&connection.outbox, envelope) {
                debug!(conn, "Reply dropped; writer gone");
            }
        }
    }

    async fn flow(&self, conn: ConnId) -> Flow {
        if self.stopping.load(Ordering::SeqCst) {
            return Flow::Close;
        }
        match self.state.lock().await.registry.connection(conn) {
            Some(_) => Flow::Continue,
            None => Flow::Close,
        }
    }

    async fn record(&self, event: ForensicEvent) {
        if let Err(err) = self.trace.lock().await.append(event) {
            warn!("Mission trace flush failed: {}", err);
        }
    }

    fn scrub(&self, text: &str) -> String {
        self.gate.redactor().redact_str(text)
    }

    // --- registration -------------------------------------------------

    async fn on_registration(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: RegistrationParams = screened.params()?;
        let id = screened.envelope.id.clone();

        if let Err(err) = self.auth.check(&params.layer, params.auth_token.as_deref()) {
            self.security_event(label, "auth", format!("layer '{}' refused: {}", params.layer, err))
                .await;
            let reply = Envelope::error_response(id, RpcCode::UNAUTHORIZED, "authentication failed");
            let mut state = self.state.lock().await;
            eject(&mut state, conn, Some(&reply));
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        let Some(connection) = state.registry.connection_mut(conn) else {
            return Ok(None);
        };
        if matches!(connection.phase, Phase::Sentinel) {
            return Ok(Some(Envelope::error_response(
                id,
                RpcCode::INVALID_REQUEST,
                "already registered",
            )));
        }

        let challenge = random_hex(16);
        let assigned_id = format!("{}-{}", params.layer, conn);
        info!(layer = %params.layer, priority = params.priority, "Sentinel registering; challenge issued");
        connection.phase = Phase::ChallengePending {
            challenge: challenge.clone(),
            assigned_id: assigned_id.clone(),
            registration: params,
        };

        let reply = RegistrationReply {
            success: true,
            assigned_id,
            challenge,
        };
        Ok(Some(Envelope::response(id, serde_json::to_value(reply)?)))
    }

    async fn on_challenge_response(
        &self,
        conn: ConnId,
        label: &str,
        screened: &Screened,
    ) -> Result<Option<Envelope>> {
        let params: ChallengeResponseParams = screened.params()?;
        let id = screened.envelope.id.clone();

        let mut state = self.state.lock().await;
        let Some(connection) = state.registry.connection(conn) else {
            return Ok(None);
        };
        let Phase::ChallengePending {
            challenge,
            assigned_id,
            registration,
        } = connection.phase.clone()
        else {
            return Ok(Some(Envelope::error_response(
                id,
                RpcCode::INVALID_REQUEST,
                "no challenge pending",
            )));
        };
        let outbox = connection.outbox.clone();

        if params.response != challenge {
            let reply = Envelope::error_response(id, RpcCode::UNAUTHORIZED, "challenge mismatch");
            eject(&mut state, conn, Some(&reply));
            drop(state);
            self.security_event(label, "challenge", "challenge response mismatch".to_string())
                .await;
            return Ok(None);
        }

        let layer = registration.layer.clone();
        state.registry.promote(SentinelRecord::new(
            conn,
            assigned_id.clone(),
            registration,
            outbox.clone(),
        ));
        let sentinels = state.registry.active_count();
        drop(state);
        info!(sentinel = %layer, sentinels, "Sentinel verified");

        let ack = Envelope::notification(
            Method::RegistrationAck,
            serde_json::to_value(RegistrationAckParams {
                assigned_id,
                protocol_version: PROTOCOL_VERSION.to_string(),
                status: "verified".to_string(),
            })?,
        );
        let delay = self.config.hub.ack_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send_envelope(&outbox, &ack);
        });

        Ok(Some(Envelope::response(id, json!({ "success": true }))))
    }

    async fn on_pulse(&self, conn: ConnId, screened: &Screened) -> Result<Option<Envelope>> {
        let params: PulseParams = screened.params()?;
        if let Some(sentinel) = self.state.lock().await.registry.sentinel_mut(conn) {
            sentinel.pulse(params.health.as_deref());
        }
        Ok(None)
    }

    // --- intents ------------------------------------------------------

    async fn on_intent(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: IntentParams = screened.params()?;
        {
            let mut state = self.state.lock().await;
            if let Some(connection) = state.registry.connection_mut(conn) {
                if matches!(connection.phase, Phase::Connected) {
                    connection.phase = Phase::Client;
                }
            }
            if let Some(context) = redacted_context(screened) {
                state.mission.merge_context(context);
            }
        }

        let command_id = screened
            .id()
            .unwrap_or_else(|| format!("cmd-{}", self.next_command.fetch_add(1, Ordering::Relaxed)));
        let outcome = self.run_intent(label, &command_id, &params).await;

        let completion = Envelope::notification(
            Method::CommandComplete,
            json!({
                "type": COMMAND_COMPLETE,
                "id": command_id,
                "cmd": params.action().as_str(),
                "goal": params.goal.as_deref().map(|g| self.scrub(g)),
                "success": outcome.success,
            }),
        );
        self.state.lock().await.registry.broadcast(&completion, None);

        Ok(Some(Envelope::response(
            screened.envelope.id.clone(),
            serde_json::to_value(&outcome)?,
        )))
    }

    async fn run_intent(&self, label: &str, id: &str, params: &IntentParams) -> CommandOutcome {
        let _page = self.page_lock.lock().await;
        let kind = params.action();

        match kind {
            ActionKind::Checkpoint => {
                let name = params
                    .goal
                    .clone()
                    .unwrap_or_else(|| "checkpoint".to_string());
                info!(checkpoint = %name, "Checkpoint reached");
                self.record(
                    ForensicEvent::new(EventKind::Checkpoint, label)
                        .command(Some(id.to_string()), kind.as_str())
                        .goal(Some(self.scrub(&name)))
                        .success(true),
                )
                .await;
                return completion(true, None, None, None, None);
            }
            ActionKind::Navigate => return self.run_navigation(label, id, &kind, params).await,
            _ => {}
        }

        let goal = params
            .goal
            .clone()
            .or_else(|| params.selector.clone())
            .unwrap_or_default();
        let step = Step::new(kind.clone(), goal.clone())
            .with_input(params.input().map(str::to_string))
            .with_key(params.key.clone())
            .with_files(params.file_paths());
        if let Err(err) = step.check() {
            return self.finish_command(label, id, &kind, params, Err(err), None, None).await;
        }

        let context_url = self.current_url().await;
        let (tiers, learnable) = self.candidate_tiers(&kind, params, &context_url).await;
        let page_wide = matches!(kind, ActionKind::Press | ActionKind::Type | ActionKind::Scroll);
        if tiers.is_empty() && !page_wide {
            let err = match kind {
                ActionKind::Generic(ref name) => ExecutionError::UnsupportedCommand(name.clone()),
                _ => ExecutionError::ResolutionMiss { goal },
            };
            return self.finish_command(label, id, &kind, params, Err(err), None, None).await;
        }

        self.run_consensus(id, &kind, params, &context_url).await;

        let before = self.capture(&format!("{id}_before")).await;
        let result = self.executor.execute(&step, &tiers).await;
        tokio::time::sleep(self.config.hub.settle_delay()).await;
        let after = self.capture(&format!("{id}_after")).await;

        if let (Ok(executed), Some(goal)) = (&result, learnable.as_deref()) {
            if let Some(selector) = executed.selector.as_deref() {
                if let Err(err) = self.resolver.lock().await.learn(goal, selector, &context_url) {
                    warn!(goal, selector, "Could not persist learned selector: {}", err);
                }
            }
        }

        let result = result.map(|executed| executed.selector);
        self.finish_command(label, id, &kind, params, result, before, after).await
    }

    async fn run_navigation(
        &self,
        label: &str,
        id: &str,
        kind: &ActionKind,
        params: &IntentParams,
    ) -> CommandOutcome {
        let fallback = self.state.lock().await.mission.target_url.clone();
        let Some(url) = params.target_url().map(str::to_string).or(fallback) else {
            let err = ExecutionError::MissingInput(kind.to_string());
            return self.finish_command(label, id, kind, params, Err(err), None, None).await;
        };

        let first = !self.navigated.swap(true, Ordering::SeqCst);
        let before = if first {
            None
        } else {
            self.capture(&format!("{id}_before")).await
        };
        let result = self.executor.navigate(&url).await;
        tokio::time::sleep(self.config.hub.settle_delay()).await;
        let after = self.capture(&format!("{id}_after")).await;

        self.finish_command(label, id, kind, params, result.map(|_| None), before, after)
            .await
    }

    /// Candidate tiers for an intent, plus the goal to learn under when the
    /// tiers came from resolution rather than a literal selector.
    async fn candidate_tiers(
        &self,
        kind: &ActionKind,
        params: &IntentParams,
        context_url: &str,
    ) -> (Vec<Vec<String>>, Option<String>) {
        if let Some(selector) = params.selector.as_deref().filter(|s| !s.trim().is_empty()) {
            return (vec![vec![selector.to_string()]], None);
        }
        let Some(goal) = params.goal.as_deref().filter(|g| !g.trim().is_empty()) else {
            return (Vec::new(), None);
        };

        let hint = match kind {
            ActionKind::Click => IntentHint::Click,
            ActionKind::Fill | ActionKind::Type | ActionKind::Select => IntentHint::Fill,
            _ => IntentHint::Generic,
        };
        match self.resolver.lock().await.resolve(goal, context_url, hint) {
            Some(resolution) => {
                let learnable =
                    (resolution.source != ResolutionSource::Literal).then(|| goal.to_string());
                (resolution.tiers, learnable)
            }
            None => (Vec::new(), None),
        }
    }

    /// Hold a consensus round for command `id` when sentinels are connected.
    /// Timeouts are logged and the command proceeds.
    async fn run_consensus(&self, id: &str, kind: &ActionKind, params: &IntentParams, url: &str) {
        if self.state.lock().await.registry.active_count() == 0 {
            return;
        }

        let snapshot = match self.page.dom_tree().await {
            Ok(tree) => StructuralSnapshot::capture(&tree),
            Err(err) => {
                warn!(command = id, "Structural snapshot failed: {}", err);
                StructuralSnapshot::default()
            }
        };

        let (outcome_rx, required) = {
            let mut state = self.state.lock().await;
            let blocking = blocking_elements(&snapshot, &state.registry.watch_selectors())
                .into_iter()
                .map(|found| BlockingElement {
                    selector: found.selector,
                    text: found.text,
                    id: found.id,
                    class_name: found.class_name,
                    matched_by: Some("structure".to_string()),
                })
                .collect();
            let pre_check = PreCheckParams {
                id: id.to_string(),
                command: kind.to_string(),
                goal: params.goal.clone(),
                selector: params.selector.clone(),
                url: url.to_string(),
                snapshot: snapshot.to_value(),
                blocking,
            };
            let participants = state.registry.active_ids();
            let required = participants.len();
            let rx = state.consensus.open(id, participants);
            state.mission.metrics.consensus_rounds += 1;

            match serde_json::to_value(&pre_check) {
                Ok(params) => {
                    let envelope = Envelope::request(Method::PreCheck, id, self.gate.redact(&params));
                    state.registry.broadcast(&envelope, None);
                }
                Err(err) => warn!(command = id, "Could not encode pre_check: {}", err),
            }
            (rx, required)
        };

        info!(command = id, required, "Consensus round opened");
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.hub.consensus_timeout(), outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => RoundOutcome::Aborted,
            Err(_) => {
                let mut state = self.state.lock().await;
                let cleared = state.consensus.cleared(id).unwrap_or(0);
                let waits = state.consensus.waits(id).unwrap_or(0);
                if state.consensus.expire(id) {
                    state.mission.metrics.consensus_timeouts += 1;
                    debug!(command = id, cleared, required, waits, "Round expired");
                }
                RoundOutcome::TimedOut
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            RoundOutcome::TimedOut => {
                info!(command = id, elapsed_ms, "Consensus timed out; proceeding with partial clearance")
            }
            other => info!(command = id, elapsed_ms, outcome = ?other, "Consensus resolved"),
        }
    }

    async fn capture(&self, label: &str) -> Option<String> {
        match self.page.snapshot(label).await {
            Ok(shot) => Some(shot.reference()),
            Err(err) => {
                debug!(label, "Screenshot failed: {}", err);
                None
            }
        }
    }

    async fn current_url(&self) -> String {
        match self.page.page_state().await {
            Ok(state) if !state.url.is_empty() => state.url,
            _ => self
                .state
                .lock()
                .await
                .mission
                .target_url
                .clone()
                .unwrap_or_default(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_command(
        &self,
        label: &str,
        id: &str,
        kind: &ActionKind,
        params: &IntentParams,
        result: Result<Option<String>, ExecutionError>,
        before: Option<String>,
        after: Option<String>,
    ) -> CommandOutcome {
        let (success, selector, error) = match result {
            Ok(selector) => (true, selector, None),
            Err(err) => {
                let detail = self.scrub(&err.to_string());
                warn!(command = id, cmd = %kind, code = err.code(), "Command failed: {}", detail);
                (false, None, Some(detail))
            }
        };

        let goal = params
            .goal
            .as_deref()
            .or(params.url.as_deref())
            .or(params.selector.as_deref())
            .map(|g| self.scrub(g));
        let mut event = ForensicEvent::new(
            if success { EventKind::Command } else { EventKind::Failure },
            label,
        )
        .command(Some(id.to_string()), kind.as_str())
        .goal(goal)
        .selector(selector.as_deref().map(|s| self.scrub(s)))
        .success(success)
        .screenshots(before.clone(), after.clone());
        if let Some(detail) = &error {
            event = event.detail(detail.clone());
        }
        self.record(event).await;

        if success {
            info!(command = id, cmd = %kind, selector = ?selector, "Command completed");
        }
        completion(success, error, selector, before, after)
    }

    // --- consensus signals --------------------------------------------

    async fn on_clear(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: ClearParams = screened.params()?;
        let effect = self
            .state
            .lock()
            .await
            .consensus
            .clear(conn, params.id.as_deref());
        match effect {
            ClearEffect::Resolved => debug!(sentinel = %label, "Clearance completed quorum"),
            ClearEffect::Pending { cleared, required } => {
                debug!(sentinel = %label, cleared, required, "Clearance recorded")
            }
            ClearEffect::Ignored => debug!(sentinel = %label, "Clearance from a non-participant ignored"),
            ClearEffect::NoRound => debug!(sentinel = %label, "Clearance with no open round"),
        }
        Ok(None)
    }

    async fn on_wait(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: WaitParams = screened.params()?;
        let counted = self
            .state
            .lock()
            .await
            .consensus
            .wait(conn, params.id.as_deref());
        debug!(sentinel = %label, retry_after_ms = params.retry_after_ms, counted, "Sentinel asked to wait");
        Ok(None)
    }

    async fn on_hijack(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: HijackParams = screened.params()?;
        let effect = self
            .state
            .lock()
            .await
            .consensus
            .hijack(conn, params.id.as_deref());

        match effect {
            HijackEffect::Hijacked { round } => {
                let reason = self.scrub(&params.reason);
                info!(sentinel = %label, round = %round, reason = %reason, "Pipeline hijacked");
                self.record(
                    ForensicEvent::new(EventKind::Hijack, label)
                        .command(Some(round), "hijack")
                        .detail(reason),
                )
                .await;
            }
            HijackEffect::AlreadyHijacked { by } => {
                warn!(sentinel = %label, holder = by, "Hijack refused; round already hijacked")
            }
            HijackEffect::NoRound => warn!(sentinel = %label, "Hijack with no open round"),
        }
        Ok(None)
    }

    async fn on_action(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: ActionParams = screened.params()?;
        let kind = params.action();
        let holds_hijack = self
            .state
            .lock()
            .await
            .consensus
            .hijacked_by(conn)
            .map(str::to_string);

        // The hijacked pipeline is parked inside the page lock; its holder
        // drives the page directly.
        let _page = match holds_hijack {
            Some(_) => None,
            None => Some(self.page_lock.lock().await),
        };

        let target = params
            .selector
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| params.goal.clone())
            .unwrap_or_default();

        let result = if kind.is_navigation() {
            self.executor.navigate(&target).await.map(|_| None)
        } else {
            let tiers = if params.selector.as_deref().is_some_and(|s| !s.trim().is_empty()) {
                vec![vec![target.clone()]]
            } else if let Some(goal) = params.goal.as_deref() {
                let context_url = self.current_url().await;
                self.resolver
                    .lock()
                    .await
                    .resolve(goal, &context_url, IntentHint::Generic)
                    .map(|r| r.tiers)
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            let files = params.files.clone().map(|f| f.into_vec()).unwrap_or_default();
            let step = Step::new(kind.clone(), target.clone())
                .with_input(params.input().map(str::to_string))
                .with_key(params.key.clone())
                .with_files(files);
            self.executor
                .execute(&step, &tiers)
                .await
                .map(|executed| executed.selector)
        };

        let mut event = ForensicEvent::new(EventKind::SentinelAction, label)
            .command(holds_hijack, kind.as_str())
            .selector(Some(self.scrub(&target)))
            .success(result.is_ok());
        match &result {
            Ok(_) => info!(sentinel = %label, cmd = %kind, "Sentinel action succeeded"),
            Err(err) => {
                let detail = self.scrub(&err.to_string());
                warn!(sentinel = %label, cmd = %kind, "Sentinel action failed: {}", detail);
                event = event.detail(detail);
            }
        }
        self.record(event).await;
        Ok(None)
    }

    async fn on_resume(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let params: ResumeParams = screened.params()?;

        // Hold the trace across the resume so the recovery entry lands
        // before the released command's own entry.
        let mut trace = self.trace.lock().await;
        let effect = {
            let mut state = self.state.lock().await;
            let effect = state.consensus.resume(conn, params.id.as_deref());
            if let ResumeEffect::Resumed { latency, .. } = &effect {
                state.mission.record_recovery(*latency);
            }
            effect
        };

        match effect {
            ResumeEffect::Resumed { round, latency } => {
                let latency_ms = latency.as_millis() as u64;
                info!(sentinel = %label, round = %round, latency_ms, re_check = params.re_check, "Pipeline resumed");
                let event = ForensicEvent::new(EventKind::Recovery, label)
                    .command(Some(round), "resume")
                    .latency_ms(latency_ms)
                    .success(true)
                    .detail(format!("re_check={}", params.re_check));
                if let Err(err) = trace.append(event) {
                    warn!("Mission trace flush failed: {}", err);
                }
            }
            ResumeEffect::NotHijacked => debug!(sentinel = %label, "Resume without a hijack ignored"),
            ResumeEffect::NoRound => debug!(sentinel = %label, "Resume with no open round"),
        }
        Ok(None)
    }

    // --- shared context and sentinel chatter --------------------------

    async fn on_context_update(&self, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        // Validate the original shape, merge the redacted copy.
        let _: ContextUpdateParams = screened.params()?;
        let Some(update) = redacted_context(screened) else {
            return Ok(None);
        };
        let keys = update.len();

        let mut state = self.state.lock().await;
        state.mission.merge_context(update);
        let broadcast = Envelope::notification(
            Method::SovereignUpdate,
            json!({ "context": state.mission.context() }),
        );
        let reached = state.registry.broadcast(&broadcast, None);
        drop(state);

        debug!(sentinel = %label, keys, reached, "Mission context updated");
        Ok(None)
    }

    async fn on_sidetalk(&self, conn: ConnId, label: &str, screened: &Screened) -> Result<Option<Envelope>> {
        let original: SidetalkParams = screened.params()?;
        let mut forwarded: SidetalkParams = serde_json::from_value(screened.redacted_params())?;
        forwarded.from = label.to_string();
        forwarded.to = original.to.clone();

        let state = self.state.lock().await;
        let available: Vec<String> = state
            .registry
            .sentinels()
            .filter(|s| s.conn != conn)
            .map(|s| s.layer.clone())
            .collect();
        let envelope = Envelope::notification(Method::Sidetalk, serde_json::to_value(&forwarded)?);

        let (status, reason) = if original.is_broadcast() {
            match state.registry.broadcast(&envelope, Some(conn)) {
                0 => (DeliveryStatus::Undeliverable, Some("no other sentinels connected".to_string())),
                _ => (DeliveryStatus::Delivered, None),
            }
        } else {
            match state
                .registry
                .sentinel_by_layer(&original.to)
                .filter(|s| s.conn != conn)
            {
                Some(target) if send_envelope(&target.outbox, &envelope) => (DeliveryStatus::Delivered, None),
                Some(_) => (DeliveryStatus::Undeliverable, Some(format!("'{}' is not reachable", original.to))),
                None => (DeliveryStatus::Undeliverable, Some(format!("unknown sentinel '{}'", original.to))),
            }
        };
        drop(state);

        debug!(from = %label, to = %original.to, topic = %forwarded.topic, status = ?status, "Sidetalk routed");
        let ack = SidetalkAckParams {
            original_id: screened.id(),
            status,
            reason,
            available_sentinels: available,
        };
        Ok(Some(Envelope::notification(
            Method::SidetalkAck,
            serde_json::to_value(ack)?,
        )))
    }

    async fn on_entropy(&self, conn: ConnId, screened: &Screened) -> Result<Option<Envelope>> {
        let envelope = Envelope::notification(Method::Entropy, screened.redacted_params());
        self.state.lock().await.registry.broadcast(&envelope, Some(conn));
        Ok(None)
    }

    async fn on_shutdown_request(
        &self,
        conn: ConnId,
        label: &str,
        screened: &Screened,
    ) -> Result<Option<Envelope>> {
        let params: ShutdownParams = screened.params()?;
        let reason = params
            .reason
            .as_deref()
            .map(|r| self.scrub(r))
            .unwrap_or_else(|| format!("{} requested by {}", screened.method, label));
        info!(conn = %label, reported_success = ?params.success, "Shutdown requested: {}", reason);

        let ack = Envelope::response(screened.envelope.id.clone(), json!({ "success": true }));
        self.send_to(conn, &ack).await;
        self.shutdown(&reason, ShutdownCause::Requested).await;
        Ok(None)
    }

    // --- lifecycle ----------------------------------------------------

    pub async fn health(&self) -> HealthReport {
        let (sentinels, connections, uptime) = {
            let state = self.state.lock().await;
            (
                state.registry.active_count(),
                state.registry.connection_count(),
                state.mission.elapsed(),
            )
        };
        let status = if self.stopping.load(Ordering::SeqCst) {
            "stopping"
        } else {
            "ok"
        };
        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: build_stamp().to_string(),
            sentinels,
            connections,
            trace_length: self.trace.lock().await.len(),
            uptime_secs: uptime.as_secs(),
        }
    }

    /// Re-evaluate sentinel health against the heartbeat timeout.
    pub async fn check_heartbeats(&self) {
        let timeout = self.config.hub.heartbeat_timeout();
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for sentinel in state.registry.sentinels_mut() {
            if let Some((from, to)) = sentinel.refresh_health(now, timeout) {
                warn!(sentinel = %sentinel.layer, from = %from, to = %to, "Sentinel health changed");
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has begun closing listeners.
    pub async fn stopped(&self) {
        let mut rx = self.lifecycle.subscribe();
        loop {
            if *rx.borrow_and_update() != Lifecycle::Running {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves with the exit code once shutdown has finished.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut rx = self.lifecycle.subscribe();
        loop {
            if let Lifecycle::Exited(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return 0;
            }
        }
    }

    /// Finalise the mission and release everything. Only the first call
    /// does any work.
    pub async fn shutdown(&self, reason: &str, cause: ShutdownCause) -> i32 {
        let code = match cause {
            ShutdownCause::Requested => 0,
            ShutdownCause::StartupFailure => 1,
        };
        if self.stopping.swap(true, Ordering::SeqCst) {
            return code;
        }

        let (roster, context, security_events, metrics, started_at, elapsed, target_url, aborted) = {
            let mut state = self.state.lock().await;
            let aborted = state.consensus.abort_all();
            (
                state.registry.roster(),
                serde_json::to_value(state.mission.context()).unwrap_or(Value::Null),
                state.mission.security_events().to_vec(),
                state.mission.metrics.clone(),
                state.mission.started_at,
                state.mission.elapsed(),
                state.mission.target_url.clone(),
                aborted,
            )
        };
        info!(reason, aborted_rounds = aborted, sentinels = roster.len(), "Graceful shutdown initiated");

        let resolver_stats = self.resolver.lock().await.stats();
        let (events, success) = {
            let trace = self.trace.lock().await;
            if let Err(err) = trace.flush() {
                warn!("Final trace flush failed: {}", err);
            }
            (trace.events().to_vec(), trace.mission_success())
        };

        let report = MissionReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: build_stamp().to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            target_url,
            success,
            shutdown_reason: reason.to_string(),
            stats: MissionStats::collect(&events, &metrics, resolver_stats),
            roster,
            context,
            security_events,
            trace: events,
        };
        if let Err(err) = write_report(self.renderer.as_ref(), &report, &self.config.paths.report) {
            error!("Could not write mission report: {:#}", err);
        }

        let (closed, _, _) = tokio::join!(
            self.page.close(),
            async { self.supervisor.lock().await.kill_all().await },
            self.close_listeners(),
        );
        if let Err(err) = closed {
            warn!("Page close failed: {}", err);
        }

        info!(success, code, "Mission finished");
        self.lifecycle.send_replace(Lifecycle::Exited(code));
        code
    }

    async fn close_listeners(&self) {
        self.lifecycle.send_replace(Lifecycle::Stopping);
        let outboxes = self.state.lock().await.registry.outboxes();
        for outbox in outboxes {
            let _ = outbox.send(Outbound::Close);
        }
    }
}

/// Periodic heartbeat evaluation until shutdown.
pub fn spawn_heartbeat_monitor(hub: Arc<Hub>) {
    let period = (hub.config.hub.heartbeat_timeout() / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if hub.is_stopping() {
                break;
            }
            hub.check_heartbeats().await;
        }
    });
}

/// End the mission after the configured wall-clock budget.
pub fn spawn_mission_timer(hub: Arc<Hub>) {
    let Some(limit) = hub.config.hub.mission_timeout() else {
        return;
    };
    tokio::spawn(async move {
        tokio::time::sleep(limit).await;
        if !hub.is_stopping() {
            warn!(limit_secs = limit.as_secs(), "Mission timeout reached");
            hub.shutdown("mission timeout", ShutdownCause::Requested).await;
        }
    });
}

fn completion(
    success: bool,
    error: Option<String>,
    selector: Option<String>,
    before: Option<String>,
    after: Option<String>,
) -> CommandOutcome {
    CommandOutcome {
        kind: COMMAND_COMPLETE.to_string(),
        success,
        error,
        result: CommandEvidence {
            success,
            before_screenshot: before,
            after_screenshot: after,
            selector,
            timestamp: Utc::now().to_rfc3339(),
        },
    }
}

/// Queue `reply` and a close on `conn`, then forget it.
fn eject(state: &mut HubState, conn: ConnId, reply: Option<&Envelope>) {
    if let Some(connection) = state.registry.connection(conn) {
        if let Some(reply) = reply {
            send_envelope(&connection.outbox, reply);
        }
        let _ = connection.outbox.send(Outbound::Close);
    }
    state.registry.detach(conn);
    state.consensus.depart(conn);
}

fn redacted_context(screened: &Screened) -> Option<ContextMap> {
    let context = screened.redacted_params().get("context")?.clone();
    serde_json::from_value(context).ok()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlight_driver::scripted::{ScriptedElement, ScriptedPage};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.history = dir.path().join("memory.json");
        config.paths.audit = dir.path().join("audit.ndjson");
        config.paths.trace = dir.path().join("trace.json");
        config.paths.report = dir.path().join("report.json");
        config.security.audit_key = Some("test-key".to_string());
        config.hub.settle_delay_ms = 0;
        config.hub.ack_delay_ms = 0;
        config.hub.attempt_timeout_ms = 500;
        config.hub.stabilization_pause_ms = 5;
        config.hub.consensus_timeout_ms = 300;
        config
    }

    fn hub_with(dir: &TempDir, page: ScriptedPage) -> Hub {
        Hub::new(test_config(dir), Arc::new(page))
    }

    async fn connect(hub: &Hub) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = hub.attach("test".to_string(), tx).await;
        (conn, rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    async fn register(hub: &Hub, layer: &str) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = connect(hub).await;
        let frame = json!({
            "jsonrpc": "2.0", "id": "r1", "method": "starlight.registration",
            "params": { "layer": layer, "priority": 5 }
        });
        hub.handle_frame(conn, &frame.to_string()).await;
        let reply = frames(&mut rx).pop().unwrap();
        let challenge = reply["result"]["challenge"].as_str().unwrap().to_string();
        let frame = json!({
            "jsonrpc": "2.0", "id": "r2", "method": "starlight.challenge_response",
            "params": { "response": challenge }
        });
        hub.handle_frame(conn, &frame.to_string()).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn wrong_challenge_closes_connection() {
        let dir = TempDir::new().unwrap();
        let hub = hub_with(&dir, ScriptedPage::new("https://shop.test/"));
        let (conn, mut rx) = connect(&hub).await;
        let frame = json!({
            "jsonrpc": "2.0", "id": "r1", "method": "starlight.registration",
            "params": { "layer": "janitor" }
        });
        assert_eq!(hub.handle_frame(conn, &frame.to_string()).await, Flow::Continue);
        let frame = json!({
            "jsonrpc": "2.0", "id": "r2", "method": "starlight.challenge_response",
            "params": { "response": "guess" }
        });
        assert_eq!(hub.handle_frame(conn, &frame.to_string()).await, Flow::Close);

        let mut saw_close = false;
        while let Ok(item) = rx.try_recv() {
            saw_close |= item == Outbound::Close;
        }
        assert!(saw_close);
        assert_eq!(hub.health().await.sentinels, 0);
    }

    #[tokio::test]
    async fn verified_sentinel_is_counted() {
        let dir = TempDir::new().unwrap();
        let hub = hub_with(&dir, ScriptedPage::new("https://shop.test/"));
        let (_conn, mut rx) = register(&hub, "janitor").await;
        let replies = frames(&mut rx);
        assert_eq!(replies[0]["result"]["success"], true);
        assert_eq!(hub.health().await.sentinels, 1);
    }

    #[tokio::test]
    async fn clear_from_unverified_connection_is_refused() {
        let dir = TempDir::new().unwrap();
        let hub = hub_with(&dir, ScriptedPage::new("https://shop.test/"));
        let (conn, mut rx) = connect(&hub).await;
        let frame = json!({ "jsonrpc": "2.0", "id": "c1", "method": "starlight.clear", "params": {} });
        hub.handle_frame(conn, &frame.to_string()).await;
        let reply = frames(&mut rx).pop().unwrap();
        assert_eq!(reply["error"]["code"], RpcCode::UNAUTHORIZED);
        assert_eq!(hub.state.lock().await.mission.security_events().len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_gets_no_reply() {
        let dir = TempDir::new().unwrap();
        let hub = hub_with(&dir, ScriptedPage::new("https://shop.test/"));
        let (conn, mut rx) = connect(&hub).await;
        let frame = json!({ "method": "starlight.intent", "id": "1", "params": { "cmd": "click", "goal": "user@example.com" } });
        assert_eq!(hub.handle_frame(conn, &frame.to_string()).await, Flow::Continue);
        assert!(frames(&mut rx).is_empty());

        let events = hub.state.lock().await.mission.security_events().to_vec();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "protocol");
    }

    #[tokio::test]
    async fn intent_without_sentinels_executes_and_learns() {
        let dir = TempDir::new().unwrap();
        let page = ScriptedPage::new("https://shop.test/cart")
            .with_element(ScriptedElement::button("#submit", "Submit").navigates_to("https://shop.test/done"));
        let hub = hub_with(&dir, page.clone());
        let (conn, mut rx) = connect(&hub).await;

        let frame = json!({
            "jsonrpc": "2.0", "id": "7", "method": "starlight.intent",
            "params": { "cmd": "click", "goal": "Submit" }
        });
        hub.handle_frame(conn, &frame.to_string()).await;
        let reply = frames(&mut rx).pop().unwrap();
        assert_eq!(reply["id"], "7");
        assert_eq!(reply["result"]["success"], true);
        assert_eq!(reply["result"]["result"]["selector"], "#submit");
        assert_eq!(page.url(), "https://shop.test/done");

        let trace = hub.trace.lock().await;
        assert_eq!(trace.count(EventKind::Command), 1);
        assert!(trace.mission_success());
        assert_eq!(hub.resolver.lock().await.stats().learned, 1);
    }

    #[tokio::test]
    async fn goal_only_intent_clicks_the_goal() {
        let dir = TempDir::new().unwrap();
        let page = ScriptedPage::new("https://shop.test/cart")
            .with_element(ScriptedElement::button("#submit", "Submit").navigates_to("https://shop.test/done"));
        let hub = hub_with(&dir, page.clone());
        let (conn, mut rx) = connect(&hub).await;

        let frame = json!({
            "jsonrpc": "2.0", "id": "g1", "method": "starlight.intent",
            "params": { "goal": "Submit" }
        });
        hub.handle_frame(conn, &frame.to_string()).await;
        let reply = frames(&mut rx).pop().unwrap();
        assert_eq!(reply["id"], "g1");
        assert_eq!(reply["result"]["success"], true);
        assert_eq!(page.url(), "https://shop.test/done");

        let trace = hub.trace.lock().await;
        assert_eq!(trace.events()[0].cmd.as_deref(), Some("click"));
    }

    #[tokio::test]
    async fn unresolvable_goal_fails_without_consensus() {
        let dir = TempDir::new().unwrap();
        let hub = hub_with(&dir, ScriptedPage::new("https://shop.test/"));
        let (_sentinel, mut sentinel_rx) = register(&hub, "janitor").await;
        frames(&mut sentinel_rx);
        let (conn, mut rx) = connect(&hub).await;

        let frame = json!({
            "jsonrpc": "2.0", "id": "8", "method": "starlight.intent",
            "params": { "cmd": "click", "goal": "!!!" }
        });
        hub.handle_frame(conn, &frame.to_string()).await;
        let reply = frames(&mut rx).pop().unwrap();
        assert_eq!(reply["result"]["success"], false);
        assert!(frames(&mut sentinel_rx)
            .iter()
            .all(|f| f["method"] != "starlight.pre_check"));
        assert_eq!(hub.trace.lock().await.count(EventKind::Failure), 1);
    }

    #[tokio::test]
    async fn unanswered_round_times_out_and_proceeds() {
        let dir = TempDir::new().unwrap();
        let page = ScriptedPage::new("https://shop.test/")
            .with_element(ScriptedElement::button("#go", "Go"));
        let hub = hub_with(&dir, page);
        let (_sentinel, _sentinel_rx) = register(&hub, "silent").await;
        let (conn, mut rx) = connect(&hub).await;

        let frame = json!({
            "jsonrpc": "2.0", "id": "9", "method": "starlight.intent",
            "params": { "cmd": "click", "selector": "#go" }
        });
        let started = Instant::now();
        hub.handle_frame(conn, &frame.to_string()).await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        let reply = frames(&mut rx).pop().unwrap();
        assert_eq!(reply["result"]["success"], true);
        assert_eq!(hub.state.lock().await.mission.metrics.consensus_timeouts, 1);
    }

    #[tokio::test]
    async fn sidetalk_to_unknown_layer_is_undeliverable() {
        let dir = TempDir::new().unwrap();
        let hub = hub_with(&dir, ScriptedPage::new("https://shop.test/"));
        let (conn, mut rx) = register(&hub, "janitor").await;
        frames(&mut rx);
        let frame = json!({
            "jsonrpc": "2.0", "id": "s1", "method": "starlight.sidetalk",
            "params": { "from": "janitor", "to": "vision", "topic": "hello", "payload": {} }
        });
        hub.handle_frame(conn, &frame.to_string()).await;
        let ack = frames(&mut rx)
            .into_iter()
            .find(|f| f["method"] == "starlight.sidetalk_ack")
            .unwrap();
        assert_eq!(ack["params"]["status"], "undeliverable");
    }

    #[tokio::test]
    async fn shutdown_writes_report_once() {
        let dir = TempDir::new().unwrap();
        let page = ScriptedPage::new("https://shop.test/");
        let hub = hub_with(&dir, page.clone());
        assert_eq!(hub.shutdown("test", ShutdownCause::Requested).await, 0);
        assert_eq!(hub.shutdown("again", ShutdownCause::StartupFailure).await, 1);
        assert!(page.is_closed());

        let report: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap()).unwrap();
        assert_eq!(report["success"], true);
        assert_eq!(report["shutdownReason"], "test");
        assert_eq!(hub.wait_for_exit().await, 0);
    }

    #[tokio::test]
    async fn signed_registration_is_checked_against_the_layer() {
        use crate::auth::Claims;
        use jsonwebtoken::{encode, EncodingKey, Header};

        let secret = "test-secret-key-32-characters-long";
        let sign = |key: &str, sub: &str| {
            let claims = Claims {
                sub: sub.to_string(),
                exp: Utc::now().timestamp() + 600,
                iat: None,
                iss: None,
            };
            encode(&Header::default(), &claims, &EncodingKey::from_secret(key.as_bytes())).unwrap()
        };

        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.security.jwt_secret = Some(secret.to_string());
        let hub = Hub::new(config, Arc::new(ScriptedPage::new("https://shop.test/")));

        let (good, mut good_rx) = connect(&hub).await;
        let frame = json!({
            "jsonrpc": "2.0", "id": "r1", "method": "starlight.registration",
            "params": { "layer": "janitor", "authToken": sign(secret, "janitor") }
        });
        assert_eq!(hub.handle_frame(good, &frame.to_string()).await, Flow::Continue);
        let reply = frames(&mut good_rx).pop().unwrap();
        assert!(reply["result"]["challenge"].is_string());

        let (bad, mut bad_rx) = connect(&hub).await;
        let frame = json!({
            "jsonrpc": "2.0", "id": "r1", "method": "starlight.registration",
            "params": { "layer": "janitor", "authToken": sign("not-the-hub-secret-at-all-000000", "janitor") }
        });
        assert_eq!(hub.handle_frame(bad, &frame.to_string()).await, Flow::Close);
        let reply = frames(&mut bad_rx).pop().unwrap();
        assert_eq!(reply["error"]["code"], RpcCode::UNAUTHORIZED);
        assert_eq!(hub.state.lock().await.mission.security_events().len(), 1);
    }
}
