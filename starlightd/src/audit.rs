//! HMAC-chained audit log.
//!
//! One NDJSON line per accepted protocol event, written after redaction.
//! Each entry's hash covers the previous entry's hash, so removing,
//! reordering or editing a line breaks verification from that point on.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub seq: u64,
    /// Milliseconds since the epoch.
    pub ts: i64,
    /// Event type: a method name, or `SECURITY_EVENT` / `CONNECTION`.
    pub ev: String,
    pub msg_id: String,
    /// Connection or sentinel the event came from.
    pub from: String,
    /// Redacted payload.
    pub meta: Value,
    pub prev: String,
    pub hash: String,
}

#[derive(Debug, Default)]
struct Chain {
    seq: u64,
    last_hash: String,
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
    key: Vec<u8>,
    chain: Mutex<Chain>,
}

impl AuditLog {
    /// Open or create the log, continuing the chain of any existing entries.
    pub fn open(path: &Path, key: &[u8]) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let chain = match last_entry(path) {
            Ok(Some(entry)) => Chain {
                seq: entry.seq,
                last_hash: entry.hash,
            },
            Ok(None) => Chain::default(),
            Err(err) => {
                warn!("Audit log {} unreadable ({}); starting a new chain", path.display(), err);
                Chain::default()
            }
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            key: key.to_vec(),
            chain: Mutex::new(chain),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &str, msg_id: &str, from: &str, meta: Value) -> Result<String> {
        let ts = Utc::now().timestamp_millis();
        let mut chain = self
            .chain
            .lock()
            .map_err(|_| anyhow!("audit chain lock poisoned"))?;
        let seq = chain.seq + 1;
        let hash = entry_hash(&self.key, &chain.last_hash, seq, ts, event, msg_id, from, &meta)?;

        let entry = AuditEntry {
            seq,
            ts,
            ev: event.to_string(),
            msg_id: msg_id.to_string(),
            from: from.to_string(),
            meta,
            prev: chain.last_hash.clone(),
            hash: hash.clone(),
        };

        let line = serde_json::to_string(&entry)? + "\n";
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| anyhow!("audit file lock poisoned"))?;
            file.write_all(line.as_bytes())?;
            file.sync_data()?;
        }

        chain.seq = seq;
        chain.last_hash = hash.clone();
        Ok(hash)
    }

    pub fn current_seq(&self) -> u64 {
        self.chain.lock().map(|c| c.seq).unwrap_or_default()
    }
}

#[allow(clippy::too_many_arguments)]
fn entry_hash(
    key: &[u8],
    prev: &str,
    seq: u64,
    ts: i64,
    event: &str,
    msg_id: &str,
    from: &str,
    meta: &Value,
) -> Result<String> {
    let canonical = format!("{}|{}|{}|{}|{}", seq, ts, event, msg_id, from);
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(prev.as_bytes());
    mac.update(canonical.as_bytes());
    mac.update(serde_json::to_string(meta)?.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn last_entry(path: &Path) -> Result<Option<AuditEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    match last {
        Some(line) => Ok(Some(serde_json::from_str(&line)?)),
        None => Ok(None),
    }
}

/// Result of checking a log file against its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Intact { entries: u64 },
    /// First line (1-based) that fails to parse, is out of sequence or
    /// does not hash to its recorded value.
    Broken { line: usize, reason: String },
}

impl Verdict {
    pub fn is_intact(&self) -> bool {
        matches!(self, Verdict::Intact { .. })
    }
}

pub struct AuditVerifier {
    key: Vec<u8>,
}

impl AuditVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    pub fn verify_file(&self, path: &Path) -> Result<Verdict> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut prev_hash = String::new();
        let mut expected_seq = 1u64;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            let broken = |reason: &str| Verdict::Broken {
                line: line_no,
                reason: reason.to_string(),
            };

            let entry: AuditEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(_) => return Ok(broken("unparsable entry")),
            };
            if entry.seq != expected_seq {
                return Ok(broken("sequence gap"));
            }
            if entry.prev != prev_hash {
                return Ok(broken("chain link mismatch"));
            }
            let expected = entry_hash(
                &self.key,
                &prev_hash,
                entry.seq,
                entry.ts,
                &entry.ev,
                &entry.msg_id,
                &entry.from,
                &entry.meta,
            )?;
            if entry.hash != expected {
                return Ok(broken("hash mismatch"));
            }

            prev_hash = entry.hash;
            expected_seq += 1;
        }

        Ok(Verdict::Intact {
            entries: expected_seq - 1,
        })
    }
}
