//! Append-only, hash-chained audit log (C2).
//!
//! Entries are written as UTF-8 JSON Lines, one per `log()` call, each
//! carrying the SHA-256 hash of the previous entry so truncation or
//! in-place edits are detectable by `verify`.

use std::collections::HashMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

const GENESIS: &str = "genesis";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("audit log corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("audit chain broken at entry {index}: {reason}")]
    ChainBroken { index: usize, reason: String },
}

/// A single audit record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub scopes: Vec<String>,
    pub decision: String,
    pub actor: String,
    pub details: Option<HashMap<String, String>>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Canonical bytes hashed to produce `hash`: fixed field order
    /// (timestamp, action, scopes, decision, actor, details, prev_hash),
    /// excluding `hash` itself. This is the one place that order is
    /// allowed to be encoded.
    fn canonical_bytes(
        timestamp: &DateTime<Utc>,
        action: &str,
        scopes: &[String],
        decision: &str,
        actor: &str,
        details: &Option<HashMap<String, String>>,
        prev_hash: &str,
    ) -> Vec<u8> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            timestamp: &'a DateTime<Utc>,
            action: &'a str,
            scopes: &'a [String],
            decision: &'a str,
            actor: &'a str,
            details: &'a Option<HashMap<String, String>>,
            prev_hash: &'a str,
        }
        // serde_json::to_vec is deterministic for this shape: all fields are
        // either scalars, a `Vec`, or a map whose keys we don't rely on for
        // ordering guarantees beyond "same map contents hash the same" —
        // the spec does not require ordering *within* `details`, only that
        // the five top-level fields appear in this order.
        serde_json::to_vec(&Canonical {
            timestamp,
            action,
            scopes,
            decision,
            actor,
            details,
            prev_hash,
        })
        .expect("canonical audit entry always serializes")
    }
}

/// An append-only, hash-chained audit logger.
pub struct AuditLog {
    path: PathBuf,
    last_hash: Mutex<String>,
}

impl AuditLog {
    /// Opens (creating if needed) the audit log at `path`, resuming the
    /// hash chain from the last line if the file already has entries.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            let mut perms = fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(parent, perms)?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)?;

        let last_hash = last_hash_in_file(&path)?.unwrap_or_else(|| GENESIS.to_string());

        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    /// Appends a new entry, serialized + fsynced before returning.
    /// Concurrent calls are serialized by an internal mutex.
    pub fn log(
        &self,
        action: &str,
        scopes: &[String],
        decision: &str,
        actor: &str,
        details: Option<HashMap<String, String>>,
    ) -> Result<AuditEntry, AuditError> {
        let mut last_hash = self
            .last_hash
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let timestamp = Utc::now();
        let prev_hash = last_hash.clone();
        let bytes = AuditEntry::canonical_bytes(
            &timestamp, action, scopes, decision, actor, &details, &prev_hash,
        );
        let hash = hex::encode(Sha256::digest(&bytes));

        let entry = AuditEntry {
            timestamp,
            action: action.to_string(),
            scopes: scopes.to_vec(),
            decision: decision.to_string(),
            actor: actor.to_string(),
            details,
            prev_hash,
            hash: hash.clone(),
        };

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_all()?;

        *last_hash = hash;
        Ok(entry)
    }

    /// Returns all entries, or an empty vec if the file does not exist.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, AuditError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| AuditError::Corrupt {
                line: idx + 1,
                reason: e.to_string(),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Re-walks the file, recomputing each entry's own hash from its fields
    /// and verifying genesis linkage and hash chain continuity. Catches
    /// both in-place field tampering (recomputed hash won't match the
    /// stored one) and chain tampering (reordering, deletion, truncation).
    /// A missing file verifies as valid (empty chain).
    pub fn verify(path: impl AsRef<Path>) -> Result<bool, AuditError> {
        let entries = Self::read_all(path)?;
        let Some(first) = entries.first() else {
            return Ok(true);
        };
        if first.prev_hash != GENESIS {
            return Ok(false);
        }
        for entry in &entries {
            let bytes = AuditEntry::canonical_bytes(
                &entry.timestamp,
                &entry.action,
                &entry.scopes,
                &entry.decision,
                &entry.actor,
                &entry.details,
                &entry.prev_hash,
            );
            if hex::encode(Sha256::digest(&bytes)) != entry.hash {
                return Ok(false);
            }
        }
        for pair in entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.prev_hash != prev.hash {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn last_hash_in_file(path: &Path) -> Result<Option<String>, AuditError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let last_nonempty = contents.lines().rev().find(|l| !l.trim().is_empty());
    match last_nonempty {
        None => Ok(None),
        Some(line) => {
            let entry: AuditEntry = serde_json::from_str(line)?;
            Ok(Some(entry.hash))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_at(dir: &TempDir) -> AuditLog {
        AuditLog::open(dir.path().join("audit").join("audit.log")).expect("open log")
    }

    #[test]
    fn first_entry_has_genesis_prev_hash() {
        let dir = TempDir::new().unwrap();
        let log = log_at(&dir);
        let entry = log.log("skill.exec", &[], "allow", "echo-skill", None).unwrap();
        assert_eq!(entry.prev_hash, GENESIS);
    }

    #[test]
    fn chain_links_by_hash() {
        use pretty_assertions::assert_eq;

        let dir = TempDir::new().unwrap();
        let log = log_at(&dir);
        let first = log.log("skill.exec", &[], "allow", "a", None).unwrap();
        let second = log.log("skill.exec", &[], "deny", "b", None).unwrap();
        assert_eq!(second.prev_hash, first.hash);
    }

    // (P1)
    #[test]
    fn verify_passes_for_untouched_chain() {
        let dir = TempDir::new().unwrap();
        let log = log_at(&dir);
        for i in 0..5 {
            log.log("skill.exec", &[], "allow", &format!("skill-{i}"), None)
                .unwrap();
        }
        assert!(AuditLog::verify(dir.path().join("audit").join("audit.log")).unwrap());
    }

    // (P2)
    #[test]
    fn verify_fails_on_tampered_field() {
        let dir = TempDir::new().unwrap();
        let log = log_at(&dir);
        log.log("skill.exec", &[], "allow", "a", None).unwrap();
        log.log("skill.exec", &[], "deny", "b", None).unwrap();

        let path = dir.path().join("audit").join("audit.log");
        let contents = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let mut first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        first["actor"] = serde_json::Value::String("tampered".to_string());
        lines[0] = serde_json::to_string(&first).unwrap();
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        assert!(!AuditLog::verify(&path).unwrap());
    }

    #[test]
    fn verify_on_missing_file_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope").join("audit.log");
        assert!(AuditLog::verify(&path).unwrap());
    }

    #[test]
    fn read_all_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope").join("audit.log");
        assert!(AuditLog::read_all(&path).unwrap().is_empty());
    }

    #[test]
    fn resumes_chain_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit").join("audit.log");
        {
            let log = AuditLog::open(&path).unwrap();
            log.log("skill.exec", &[], "allow", "a", None).unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        let entry = log.log("skill.exec", &[], "allow", "b", None).unwrap();
        let entries = AuditLog::read_all(&path).unwrap();
        assert_eq!(entry.prev_hash, entries[0].hash);
    }
}
