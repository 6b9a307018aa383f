//! Token-keyed store of time-limited confirmation records.
//!
//! Subscription and unsubscription requests park a small string-to-string
//! record here and mail the token to the user; confirming the token
//! returns the record at most once. Records are individual JSON files so
//! the store survives process restarts, and the claim step is a rename so
//! two racing confirmations cannot both win.
//!
//! # Example
//!
//! ```
//! use postroom_pending::PendingStore;
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let store = PendingStore::new(dir.path());
//!
//! let mut fields = BTreeMap::new();
//! fields.insert("action".to_string(), "subscribe".to_string());
//! fields.insert("address".to_string(), "anne@example.com".to_string());
//!
//! let token = store.add(fields, None).expect("add");
//! let record = store.confirm(&token, true).expect("confirm").expect("present");
//! assert_eq!(record.get("action").map(String::as_str), Some("subscribe"));
//! // At most once: the second confirm sees nothing.
//! assert!(store.confirm(&token, true).expect("confirm").is_none());
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default record lifetime: three days.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Token length in random bytes (hex-doubled on disk): 160 bits.
const TOKEN_BYTES: usize = 20;

#[derive(Debug, Serialize, Deserialize)]
struct PendingRecord {
    fields: BTreeMap<String, String>,
    expires_at: DateTime<Utc>,
}

/// File-backed pending-confirmation store.
#[derive(Debug, Clone)]
pub struct PendingStore {
    dir: PathBuf,
}

impl PendingStore {
    /// Open a store rooted at `dir`; the directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist a record, returning its fresh token.
    ///
    /// `lifetime` defaults to [`DEFAULT_LIFETIME`]. Tokens are never
    /// reused; 160 bits of entropy makes collision practically
    /// impossible, and the exclusive create turns one into an error
    /// rather than an overwrite.
    pub fn add(
        &self,
        fields: BTreeMap<String, String>,
        lifetime: Option<Duration>,
    ) -> Result<String> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create pending dir {}", self.dir.display()))?;

        let token = make_token();
        let record = PendingRecord {
            fields,
            expires_at: Utc::now()
                + chrono::Duration::from_std(lifetime.unwrap_or(DEFAULT_LIFETIME))
                    .unwrap_or_else(|_| chrono::Duration::days(3)),
        };
        let json = serde_json::to_string_pretty(&record).context("serialize pending record")?;

        let path = self.record_path(&token);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create pending record {}", path.display()))?;
        use std::io::Write;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .with_context(|| format!("failed to write pending record {}", path.display()))?;

        Ok(token)
    }

    /// Return the record for `token` iff present and unexpired.
    ///
    /// With `expunge`, the record is atomically claimed (renamed) before
    /// reading, so a token confirms at most once even under races.
    pub fn confirm(
        &self,
        token: &str,
        expunge: bool,
    ) -> Result<Option<BTreeMap<String, String>>> {
        if !is_valid_token(token) {
            return Ok(None);
        }
        let path = self.record_path(token);

        let read_path = if expunge {
            let claimed = path.with_extension("json.claimed");
            match fs::rename(&path, &claimed) {
                Ok(()) => claimed,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to claim pending record {}", path.display())
                    });
                }
            }
        } else {
            path.clone()
        };

        let content = match fs::read_to_string(&read_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read pending record {}", read_path.display())
                });
            }
        };

        if expunge {
            let _ = fs::remove_file(&read_path);
        }

        let record: PendingRecord = serde_json::from_str(&content)
            .with_context(|| format!("corrupt pending record {}", read_path.display()))?;

        if record.expires_at <= Utc::now() {
            // Expired records are invisible; if not expunged above, leave
            // the file for evict() to sweep.
            return Ok(None);
        }

        Ok(Some(record.fields))
    }

    /// Remove every expired record. Returns the number removed.
    pub fn evict(&self) -> Result<u32> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read pending dir {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let extension = path.extension().and_then(|e| e.to_str());
            // A crash between claim and unlink leaves a consumed record
            // behind under the claimed suffix; it is garbage either way.
            if extension == Some("claimed") {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
                continue;
            }
            if extension != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let expired = match serde_json::from_str::<PendingRecord>(&content) {
                Ok(record) => record.expires_at <= now,
                // Unreadable records are dead weight.
                Err(_) => true,
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn record_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.json"))
    }
}

fn make_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.chars().all(|c| c.is_ascii_hexdigit())
}
