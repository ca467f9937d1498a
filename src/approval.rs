//! Approval store (C5): persistent "always" decisions keyed by scope hash.

use std::collections::HashMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

/// TTL for an "always" grant (spec §3).
const ALWAYS_TTL_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub scope_text: String,
    pub scope_hash: String,
    /// Always `"always"` — the only decision kind this store persists.
    pub decision: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalDecision {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Hashes a scope's canonical text into the hex key used for storage.
pub fn scope_hash(scope_text: &str) -> String {
    hex::encode(Sha256::digest(scope_text.as_bytes()))
}

/// A file-backed store mapping `scope_hash -> ApprovalDecision`. Reads
/// tolerate a missing file; writes replace the whole file atomically.
pub struct ApprovalStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ApprovalStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, ApprovalDecision>, ApprovalError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, decisions: &HashMap<String, ApprovalDecision>) -> Result<(), ApprovalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(decisions)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Returns the stored decision for `scope_text` if present and
    /// unexpired.
    pub fn check(&self, scope_text: &str) -> Result<Option<ApprovalDecision>, ApprovalError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let decisions = self.load()?;
        let hash = scope_hash(scope_text);
        Ok(decisions
            .get(&hash)
            .filter(|d| !d.is_expired(Utc::now()))
            .cloned())
    }

    /// Persists an "always" grant for `scope_text`, expiring in 30 days.
    pub fn grant_always(&self, scope_text: &str) -> Result<ApprovalDecision, ApprovalError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut decisions = self.load()?;
        let now = Utc::now();
        let hash = scope_hash(scope_text);
        let decision = ApprovalDecision {
            scope_text: scope_text.to_string(),
            scope_hash: hash.clone(),
            decision: "always".to_string(),
            granted_at: now,
            expires_at: Some(now + Duration::days(ALWAYS_TTL_DAYS)),
        };
        decisions.insert(hash, decision.clone());
        self.save(&decisions)?;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn check_on_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::open(dir.path().join("approvals.json"));
        assert!(store.check("files.write:/data").unwrap().is_none());
    }

    // (P10)
    #[test]
    fn grant_then_check_returns_always() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::open(dir.path().join("approvals.json"));
        store.grant_always("files.write:/data").unwrap();
        let decision = store.check("files.write:/data").unwrap().unwrap();
        assert_eq!(decision.decision, "always");
    }

    #[test]
    fn expires_at_is_30_days_out() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::open(dir.path().join("approvals.json"));
        let granted = store.grant_always("files.write:/data").unwrap();
        let expires_at = granted.expires_at.unwrap();
        assert_eq!((expires_at - granted.granted_at).num_days(), ALWAYS_TTL_DAYS);
    }

    #[test]
    fn expired_grant_is_not_returned() {
        let dir = TempDir::new().unwrap();
        let store = ApprovalStore::open(dir.path().join("approvals.json"));
        let mut decisions = HashMap::new();
        let hash = scope_hash("files.write:/data");
        decisions.insert(
            hash.clone(),
            ApprovalDecision {
                scope_text: "files.write:/data".to_string(),
                scope_hash: hash,
                decision: "always".to_string(),
                granted_at: Utc::now() - Duration::days(40),
                expires_at: Some(Utc::now() - Duration::days(10)),
            },
        );
        store.save(&decisions).unwrap();
        assert!(store.check("files.write:/data").unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("approvals.json");
        ApprovalStore::open(&path).grant_always("files.write:/data").unwrap();
        let store = ApprovalStore::open(&path);
        assert!(store.check("files.write:/data").unwrap().is_some());
    }
}
