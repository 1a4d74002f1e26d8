use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manifest::{Invocation, SentinelManifest};
use crate::{HUB_URL_ENV, SENTINEL_NAME_ENV};

const STOP_GRACE: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no manifest registered for sentinel '{0}'")]
    UnknownSentinel(String),
    #[error("sentinel '{0}' is already running")]
    AlreadyRunning(String),
    #[error("sentinel '{0}' is not running")]
    NotRunning(String),
    #[error("interpreter '{program}' for sentinel '{name}' not found on PATH")]
    InterpreterNotFound { name: String, program: String },
    #[error("failed to spawn sentinel '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Outcome of [`Supervisor::launch_all`]. Failures never abort the batch.
#[derive(Debug, Default)]
pub struct LaunchReport {
    pub started: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

struct Supervised {
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    pumps: Vec<JoinHandle<()>>,
}

/// Owns every sentinel child process the hub launched.
pub struct Supervisor {
    hub_url: String,
    manifests: HashMap<String, SentinelManifest>,
    running: HashMap<String, Supervised>,
}

impl Supervisor {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            manifests: HashMap::new(),
            running: HashMap::new(),
        }
    }

    pub fn register(&mut self, manifest: SentinelManifest) {
        self.manifests.insert(manifest.name.clone(), manifest);
    }

    /// Register and start every enabled manifest. A sentinel that cannot be
    /// spawned is logged and left out; the rest still start.
    pub fn launch_all(&mut self, manifests: &[SentinelManifest]) -> LaunchReport {
        let mut report = LaunchReport::default();
        for manifest in manifests {
            self.register(manifest.clone());
            if !manifest.enabled {
                debug!(sentinel = %manifest.name, "sentinel disabled in manifest");
                report.skipped.push(manifest.name.clone());
                continue;
            }
            match self.start_by_name(&manifest.name) {
                Ok(_) => report.started.push(manifest.name.clone()),
                Err(err) => {
                    warn!(sentinel = %manifest.name, error = %err, "sentinel failed to launch");
                    report.failed.push((manifest.name.clone(), err.to_string()));
                }
            }
        }
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "sentinel launch complete"
        );
        report
    }

    /// Spawn a registered sentinel. Returns the child pid when known.
    pub fn start_by_name(&mut self, name: &str) -> Result<Option<u32>, SupervisorError> {
        self.reap();
        if self.running.contains_key(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        let manifest = self
            .manifests
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownSentinel(name.to_string()))?;

        let invocation = manifest.invocation();
        let program = resolve_program(name, &invocation)?;

        let mut command = Command::new(&program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(HUB_URL_ENV, &self.hub_url)
            .env(SENTINEL_NAME_ENV, name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = manifest.working_dir.as_ref() {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })?;
        let pid = child.id();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(forward_lines(name.to_string(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(forward_lines(name.to_string(), stderr, true));
        }

        info!(
            sentinel = name,
            runtime = %manifest.runtime,
            program = %program.display(),
            pid,
            "sentinel started"
        );
        self.running.insert(
            name.to_string(),
            Supervised {
                child,
                pid,
                started_at: Utc::now(),
                pumps,
            },
        );
        Ok(pid)
    }

    /// Terminate one sentinel: polite signal first, forced kill after a grace
    /// period.
    pub async fn stop_by_name(&mut self, name: &str) -> Result<(), SupervisorError> {
        let supervised = self
            .running
            .remove(name)
            .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;
        terminate(name, supervised).await;
        Ok(())
    }

    /// Best-effort teardown of every child. Never fails.
    pub async fn kill_all(&mut self) {
        let drained: Vec<(String, Supervised)> = self.running.drain().collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "stopping all sentinels");
        let stops = drained
            .into_iter()
            .map(|(name, supervised)| async move { terminate(&name, supervised).await });
        futures_join_all(stops).await;
    }

    /// Drop bookkeeping for children that exited on their own.
    pub fn reap(&mut self) -> Vec<(String, Option<i32>)> {
        let mut exited = Vec::new();
        self.running.retain(|name, supervised| match supervised.child.try_wait() {
            Ok(Some(status)) => {
                warn!(sentinel = %name, code = ?status.code(), "sentinel exited");
                exited.push((name.clone(), status.code()));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(sentinel = %name, error = %err, "failed to poll sentinel status");
                true
            }
        });
        exited
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn started_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.running.get(name).map(|s| s.started_at)
    }
}

fn resolve_program(name: &str, invocation: &Invocation) -> Result<PathBuf, SupervisorError> {
    let direct = PathBuf::from(&invocation.program);
    if direct.components().count() > 1 || direct.is_absolute() {
        return Ok(direct);
    }
    std::iter::once(&invocation.program)
        .chain(invocation.fallbacks.iter())
        .find_map(|candidate| which::which(candidate).ok())
        .ok_or_else(|| SupervisorError::InterpreterNotFound {
            name: name.to_string(),
            program: invocation.program.clone(),
        })
}

fn forward_lines<R>(name: String, stream: R, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => warn!(sentinel = %name, "{}", line),
                Ok(Some(line)) => info!(sentinel = %name, "{}", line),
                Ok(None) => break,
                Err(err) => {
                    debug!(sentinel = %name, error = %err, "sentinel output stream closed");
                    break;
                }
            }
        }
    })
}

async fn terminate(name: &str, mut supervised: Supervised) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = supervised.pid {
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(sentinel = name, error = %err, "SIGTERM to sentinel group failed");
            }
            if tokio::time::timeout(STOP_GRACE, supervised.child.wait())
                .await
                .is_ok()
            {
                finish(name, supervised);
                return;
            }
        }
    }

    if let Err(err) = supervised.child.start_kill() {
        debug!(sentinel = name, error = %err, "sentinel already gone");
    }
    let _ = tokio::time::timeout(STOP_GRACE, supervised.child.wait()).await;
    finish(name, supervised);
}

fn finish(name: &str, supervised: Supervised) {
    for pump in supervised.pumps {
        pump.abort();
    }
    info!(sentinel = name, pid = supervised.pid, "sentinel stopped");
}

async fn futures_join_all<F>(futures: impl Iterator<Item = F>)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handles: Vec<JoinHandle<()>> = futures.map(tokio::spawn).collect();
    for handle in handles {
        let _ = handle.await;
    }
}
