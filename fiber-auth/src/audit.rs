// fiber-auth: Append-only audit trail
// Line-delimited JSON with a SHA-256 hash chain; one tampered entry
// invalidates every successor.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{AuthError, AuthResult};

/// Root of the chain before the first entry.
pub const GENESIS_HASH: &str = "GENESIS";

/// One audit record. `hash` covers the whole entry (including `prev_hash`)
/// concatenated with the previous hash, truncated to 16 hex chars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub user: String,
    pub role: String,
    pub action: String,
    pub resource: String,
    pub details: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Audit log statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_entries: usize,
    pub file_size_bytes: u64,
    pub path: String,
}

fn compute_hash(entry_without_hash: &Value, prev_hash: &str) -> AuthResult<String> {
    // Canonical form: compact JSON with sorted keys (serde_json default map
    // ordering), then the previous hash appended.
    let canonical = serde_json::to_string(entry_without_hash)
        .map_err(|e| AuthError::Audit(format!("canonicalization failed: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize())[..16].to_string())
}

/// Single-writer audit log. Concurrent handlers must serialize through one
/// instance (the gateway holds it behind a mutex).
pub struct AuditLog {
    path: PathBuf,
    last_hash: String,
}

impl AuditLog {
    /// Open (or create) the log, recovering the chain tail so appends after
    /// a restart keep the chain unbroken.
    pub fn open(path: impl Into<PathBuf>) -> AuthResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Audit(format!("cannot create audit dir: {}", e)))?;
        }

        let last_hash = match Self::read_last_hash(&path) {
            Ok(Some(hash)) => hash,
            Ok(None) => GENESIS_HASH.to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "could not recover audit chain tail, restarting chain");
                GENESIS_HASH.to_string()
            }
        };

        Ok(Self { path, last_hash })
    }

    fn read_last_hash(path: &Path) -> AuthResult<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let file =
            File::open(path).map_err(|e| AuthError::Audit(format!("open failed: {}", e)))?;
        let mut last = None;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| AuthError::Audit(format!("read failed: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: Value = serde_json::from_str(&line)
                .map_err(|e| AuthError::Audit(format!("corrupt tail entry: {}", e)))?;
            last = entry
                .get("hash")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(last)
    }

    /// Append an entry and advance the chain.
    pub fn append(
        &mut self,
        user: &str,
        role: &str,
        action: &str,
        resource: &str,
        details: Value,
    ) -> AuthResult<AuditEntry> {
        let mut value = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "user": user,
            "role": role,
            "action": action,
            "resource": resource,
            "details": details,
            "prev_hash": self.last_hash,
        });
        let hash = compute_hash(&value, &self.last_hash)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("hash".to_string(), Value::from(hash.clone()));
        }

        let entry: AuditEntry = serde_json::from_value(value.clone())
            .map_err(|e| AuthError::Audit(format!("entry build failed: {}", e)))?;

        tracing::info!(
            user = %entry.user,
            role = %entry.role,
            action = %entry.action,
            resource = %entry.resource,
            "AUDIT"
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuthError::Audit(format!("open for append failed: {}", e)))?;
        let line = serde_json::to_string(&value)
            .map_err(|e| AuthError::Audit(format!("serialize failed: {}", e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| AuthError::Audit(format!("append failed: {}", e)))?;

        self.last_hash = entry.hash.clone();
        Ok(entry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk the file and verify the chain.
    ///
    /// Returns `(true, None)` when intact, `(false, Some(line))` for the
    /// first broken line (1-based).
    pub fn verify_chain(path: &Path) -> (bool, Option<usize>) {
        if !path.exists() {
            return (true, None);
        }
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "audit verification failed to open file");
                return (false, Some(0));
            }
        };

        let mut prev_hash = GENESIS_HASH.to_string();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line_num = idx + 1;
            let line = match line {
                Ok(l) => l,
                Err(_) => return (false, Some(line_num)),
            };
            if line.trim().is_empty() {
                continue;
            }

            let mut entry: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => return (false, Some(line_num)),
            };

            if entry.get("prev_hash").and_then(Value::as_str) != Some(prev_hash.as_str()) {
                tracing::error!(line = line_num, "audit chain broken: prev_hash mismatch");
                return (false, Some(line_num));
            }

            let stored_hash = match entry
                .as_object_mut()
                .and_then(|o| o.remove("hash"))
                .and_then(|v| v.as_str().map(str::to_string))
            {
                Some(h) => h,
                None => return (false, Some(line_num)),
            };

            match compute_hash(&entry, &prev_hash) {
                Ok(expected) if expected == stored_hash => {}
                _ => {
                    tracing::error!(line = line_num, "audit chain broken: hash mismatch");
                    return (false, Some(line_num));
                }
            }
            prev_hash = stored_hash;
        }

        (true, None)
    }

    pub fn stats(path: &Path) -> AuditStats {
        let (total_entries, file_size_bytes) = match File::open(path) {
            Ok(f) => {
                let count = BufReader::new(f)
                    .lines()
                    .map_while(Result::ok)
                    .filter(|l| !l.trim().is_empty())
                    .count();
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                (count, size)
            }
            Err(_) => (0, 0),
        };
        AuditStats {
            total_entries,
            file_size_bytes,
            path: path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_chain_links_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut log = AuditLog::open(&path).unwrap();

        let first = log
            .append("admin", "ADMIN", "CREATE_NODE", "node:p1", json!({}))
            .unwrap();
        let second = log
            .append("admin", "ADMIN", "DELETE_NODE", "node:p1", json!({}))
            .unwrap();

        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(first.hash.len(), 16);
    }

    #[test]
    fn test_verify_accepts_intact_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut log = AuditLog::open(&path).unwrap();
        for i in 0..5 {
            log.append("u", "VIEWER", "LOGIN_SUCCESS", "auth", json!({"n": i}))
                .unwrap();
        }
        assert_eq!(AuditLog::verify_chain(&path), (true, None));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut log = AuditLog::open(&path).unwrap();
        for _ in 0..3 {
            log.append("u", "VIEWER", "LOGIN_SUCCESS", "auth", json!({}))
                .unwrap();
        }

        // Flip a field in the middle entry.
        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered: Vec<String> = contents
            .lines()
            .enumerate()
            .map(|(i, l)| {
                if i == 1 {
                    l.replace("LOGIN_SUCCESS", "DELETE_NODE")
                } else {
                    l.to_string()
                }
            })
            .collect();
        std::fs::write(&path, tampered.join("\n") + "\n").unwrap();

        let (valid, broken_at) = AuditLog::verify_chain(&path);
        assert!(!valid);
        assert_eq!(broken_at, Some(2));
    }

    #[test]
    fn test_chain_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.append("u", "ADMIN", "LOGIN_SUCCESS", "auth", json!({}))
                .unwrap();
        }
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.append("u", "ADMIN", "LOGOUT", "auth", json!({}))
                .unwrap();
        }
        assert_eq!(AuditLog::verify_chain(&path), (true, None));
    }

    #[test]
    fn test_missing_file_is_valid_and_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.jsonl");
        assert_eq!(AuditLog::verify_chain(&path), (true, None));
        assert_eq!(AuditLog::stats(&path).total_entries, 0);
    }
}
