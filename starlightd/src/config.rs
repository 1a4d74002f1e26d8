//! `starlight.toml` loading.
//!
//! The file is read once at startup. A missing or unparsable file is not
//! fatal: the hub logs a warning and runs on defaults, and individual
//! sentinel entries that fail validation are skipped.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use starlight_supervisor::SentinelManifest;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "STARLIGHT_CONFIG";
pub const AUDIT_KEY_ENV: &str = "STARLIGHT_AUDIT_KEY";
pub const JWT_SECRET_ENV: &str = "STARLIGHT_JWT_SECRET";
pub const DEFAULT_CONFIG_FILE: &str = "starlight.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    pub host: String,
    pub port: u16,
    pub consensus_timeout_ms: u64,
    pub ack_delay_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub mission_timeout_secs: Option<u64>,
    pub settle_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    pub stabilization_pause_ms: u64,
    pub target_url: Option<String>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            consensus_timeout_ms: 5_000,
            ack_delay_ms: 100,
            heartbeat_timeout_ms: 5_000,
            mission_timeout_secs: None,
            settle_delay_ms: 300,
            attempt_timeout_ms: 2_500,
            stabilization_pause_ms: 500,
            target_url: None,
        }
    }
}

impl HubSettings {
    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }

    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn stabilization_pause(&self) -> Duration {
        Duration::from_millis(self.stabilization_pause_ms)
    }

    pub fn mission_timeout(&self) -> Option<Duration> {
        self.mission_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Address sentinels are told to dial. A wildcard bind is reached
    /// through loopback.
    pub fn hub_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
            other => other,
        };
        format!("ws://{host}:{}", self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    pub history: PathBuf,
    pub audit: PathBuf,
    pub trace: PathBuf,
    pub report: PathBuf,
    pub screenshots: PathBuf,
    pub screenshot_max_age_secs: u64,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            history: PathBuf::from("starlight_memory.json"),
            audit: PathBuf::from("logs/audit.ndjson"),
            trace: PathBuf::from("mission_trace.json"),
            report: PathBuf::from("report.json"),
            screenshots: PathBuf::from("screenshots"),
            screenshot_max_age_secs: 86_400,
        }
    }
}

impl PathSettings {
    fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.history,
            &mut self.audit,
            &mut self.trace,
            &mut self.report,
            &mut self.screenshots,
        ] {
            *path = resolve_relative(base, path);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecuritySettings {
    /// Token sentinels must present at registration. Unset disables the check.
    pub auth_token: Option<String>,
    /// HS256 secret for signed registration tokens (or `STARLIGHT_JWT_SECRET`).
    pub jwt_secret: Option<String>,
    pub audit_key: Option<String>,
    /// Scan every string for PII, not only values under sensitive keys.
    pub redact_strings: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            auth_token: None,
            jwt_secret: None,
            audit_key: None,
            redact_strings: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Cdp,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverSettings {
    pub kind: DriverKind,
    pub endpoint: String,
    pub ws_url: Option<String>,
    pub launch: bool,
    pub browser_path: Option<PathBuf>,
    pub headless: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            kind: DriverKind::Cdp,
            endpoint: "http://127.0.0.1:9222".to_string(),
            ws_url: None,
            launch: true,
            browser_path: None,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub hub: HubSettings,
    pub paths: PathSettings,
    pub security: SecuritySettings,
    pub driver: DriverSettings,
    pub sentinels: Vec<SentinelManifest>,
}

impl Config {
    /// HMAC key for the audit chain: config, then environment, then a
    /// random per-run key (the log is then only verifiable within the run).
    pub fn audit_key(&self) -> Vec<u8> {
        if let Some(key) = self.security.audit_key.as_deref().filter(|k| !k.is_empty()) {
            return key.as_bytes().to_vec();
        }
        if let Ok(key) = std::env::var(AUDIT_KEY_ENV) {
            if !key.trim().is_empty() {
                return key.trim().as_bytes().to_vec();
            }
        }
        warn!("No audit key configured; using an ephemeral key for this run");
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Registration JWT secret: config first, then the environment.
    pub fn jwt_secret(&self) -> Option<String> {
        self.security
            .jwt_secret
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var(JWT_SECRET_ENV).ok().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
    }

    pub fn enabled_sentinels(&self) -> Vec<SentinelManifest> {
        self.sentinels.iter().filter(|s| s.enabled).cloned().collect()
    }
}

/// Config file to use: explicit flag, then `STARLIGHT_CONFIG`, then
/// `./starlight.toml` when it exists.
pub fn resolve_config_path(cli: Option<&Path>) -> Option<PathBuf> {
    cli.map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
}

pub fn load_config(config_path: Option<&Path>) -> Config {
    let Some(path) = config_path else {
        return Config::default();
    };

    let contents = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to read config file {}: {}", path.display(), err);
            return Config::default();
        }
    };

    let mut config = match parse_config(&contents) {
        Ok(config) => config,
        Err(err) => {
            warn!("Failed to parse {}: {} (running on defaults)", path.display(), err);
            return Config::default();
        }
    };

    if let Err(err) = validate_hub_settings(&config.hub) {
        warn!("[hub] section rejected: {} (using hub defaults)", err);
        config.hub = HubSettings::default();
    }

    let mut seen = HashSet::new();
    let mut sentinels = Vec::new();
    for manifest in config.sentinels.drain(..) {
        match validate_sentinel(&manifest, &mut seen) {
            Ok(()) => sentinels.push(manifest),
            Err(err) => warn!("Sentinel entry '{}' skipped: {}", manifest.name, err),
        }
    }
    config.sentinels = sentinels;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.paths.rebase(base);

    info!(
        sentinels = config.sentinels.len(),
        driver = ?config.driver.kind,
        "Loaded configuration from {}",
        path.display()
    );
    config
}

pub fn parse_config(contents: &str) -> Result<Config> {
    Ok(toml::from_str(contents)?)
}

pub fn validate_hub_settings(hub: &HubSettings) -> Result<()> {
    if hub.host.trim().is_empty() {
        bail!("host must not be empty");
    }
    if hub.consensus_timeout_ms == 0 {
        bail!("consensus_timeout_ms must be greater than zero");
    }
    if hub.heartbeat_timeout_ms == 0 {
        bail!("heartbeat_timeout_ms must be greater than zero");
    }
    if hub.attempt_timeout_ms == 0 {
        bail!("attempt_timeout_ms must be greater than zero");
    }
    Ok(())
}

fn validate_sentinel(manifest: &SentinelManifest, seen: &mut HashSet<String>) -> Result<()> {
    if manifest.name.trim().is_empty() {
        bail!("name empty");
    }
    if manifest.entry.trim().is_empty() {
        bail!("entry empty");
    }
    if !seen.insert(manifest.name.clone()) {
        bail!("duplicate sentinel name");
    }
    Ok(())
}

fn resolve_relative(base: &Path, raw: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_home(&raw.to_string_lossy()));
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn expand_home(raw: &str) -> String {
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, stripped);
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use starlight_supervisor::Runtime;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.hub.port, 8080);
        assert_eq!(config.hub.consensus_timeout(), Duration::from_secs(5));
        assert_eq!(config.hub.ack_delay(), Duration::from_millis(100));
        assert!(config.hub.mission_timeout().is_none());
        assert_eq!(config.driver.kind, DriverKind::Cdp);
        assert!(config.security.redact_strings);
    }

    #[test]
    fn parses_full_file() {
        let config = parse_config(
            r#"
            [hub]
            port = 9100
            consensus_timeout_ms = 1500
            target_url = "https://shop.test/"

            [security]
            auth_token = "s3cret"

            [driver]
            kind = "none"

            [[sentinels]]
            name = "janitor"
            runtime = "python"
            entry = "sentinels/janitor.py"
            args = ["--verbose"]

            [[sentinels]]
            name = "pii"
            runtime = "node"
            entry = "pii.js"
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.hub.port, 9100);
        assert_eq!(config.hub.consensus_timeout_ms, 1500);
        assert_eq!(config.hub.ack_delay_ms, 100);
        assert_eq!(config.security.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.driver.kind, DriverKind::None);
        assert_eq!(config.sentinels.len(), 2);
        assert_eq!(config.sentinels[0].runtime, Runtime::Python);
        assert_eq!(config.enabled_sentinels().len(), 1);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[hub\nport = ").unwrap();
        assert_eq!(load_config(Some(file.path())), Config::default());
        assert_eq!(load_config(Some(Path::new("/nonexistent/starlight.toml"))), Config::default());
    }

    #[test]
    fn bad_sentinels_are_skipped_and_paths_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("starlight.toml");
        fs::write(
            &path,
            r#"
            [hub]
            consensus_timeout_ms = 0

            [paths]
            trace = "out/trace.json"

            [[sentinels]]
            name = "a"
            runtime = "binary"
            entry = "./a"

            [[sentinels]]
            name = "a"
            runtime = "binary"
            entry = "./again"

            [[sentinels]]
            name = "empty"
            runtime = "go"
            entry = " "
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.hub, HubSettings::default());
        assert_eq!(config.sentinels.len(), 1);
        assert_eq!(config.paths.trace, dir.path().join("out/trace.json"));
    }

    #[test]
    fn hub_url_uses_loopback_for_wildcard_bind() {
        let hub = HubSettings {
            host: "0.0.0.0".into(),
            port: 7000,
            ..HubSettings::default()
        };
        assert_eq!(hub.hub_url(), "ws://127.0.0.1:7000");
    }

    #[test]
    fn configured_audit_key_wins() {
        let mut config = Config::default();
        config.security.audit_key = Some("k1".into());
        assert_eq!(config.audit_key(), b"k1".to_vec());
    }
}
