//! Durable on-disk message queues ("switchboards").
//!
//! Each queue is a directory; each entry is a pair of sibling files named
//! by a monotonic sortable id: `<id>.msg` holds raw RFC 5322 bytes and
//! `<id>.pck` holds the JSON metadata sidecar. The `.pck` file is renamed
//! into place last, so a reader that lists an entry will always find both
//! halves. Dequeuing renames the pair to a `.bak` suffix; a crash leaves
//! the `.bak` pair behind and startup recovery renames it back, giving
//! at-least-once processing.
//!
//! # Example
//!
//! ```
//! use postroom_switchboard::{Metadata, Switchboard};
//! use postroom_types::QueueName;
//!
//! let root = tempfile::tempdir().expect("tempdir");
//! let board = Switchboard::new(root.path(), QueueName::In).expect("open");
//!
//! let mut meta = Metadata::new();
//! meta.set_listname("test@example.com");
//! let id = board.enqueue(b"Subject: hi\n\nbody\n", &meta).expect("enqueue");
//!
//! let (bytes, meta) = board.dequeue(&id).expect("dequeue");
//! assert_eq!(meta.listname(), Some("test@example.com"));
//! assert!(bytes.starts_with(b"Subject: hi"));
//! board.finish(&id).expect("finish");
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use postroom_types::QueueName;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Current metadata schema version.
pub const CURRENT_VERSION: i64 = 3;

/// Sentinel version marking a clean-stop entry.
pub const STOP_VERSION: i64 = -1;

/// Errors surfaced by switchboard operations.
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    #[error("queue I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("entry {id} not found")]
    Missing { id: String },
    #[error("corrupt metadata for entry {id}: {reason}")]
    CorruptMetadata { id: String, reason: String },
    #[error("unknown metadata schema version {found} for entry {id} (current {CURRENT_VERSION})")]
    UnknownVersion { id: String, found: i64 },
}

type Result<T> = std::result::Result<T, SwitchboardError>;

/// JSON metadata sidecar attached to every queued message.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    map: BTreeMap<String, Value>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata {
    /// Fresh metadata at the current schema version.
    pub fn new() -> Self {
        let mut map = BTreeMap::new();
        map.insert("version".to_string(), Value::from(CURRENT_VERSION));
        Self { map }
    }

    /// The clean-stop sentinel.
    pub fn stop_sentinel() -> Self {
        let mut map = BTreeMap::new();
        map.insert("version".to_string(), Value::from(STOP_VERSION));
        Self { map }
    }

    /// Schema version recorded in the sidecar.
    pub fn version(&self) -> i64 {
        self.map
            .get("version")
            .and_then(Value::as_i64)
            .unwrap_or(CURRENT_VERSION)
    }

    /// Whether this entry is the stop sentinel.
    pub fn is_stop(&self) -> bool {
        self.version() == STOP_VERSION
    }

    pub fn listname(&self) -> Option<&str> {
        self.get_str("listname")
    }

    pub fn set_listname(&mut self, listname: &str) {
        self.set_str("listname", listname);
    }

    /// Explicit recipient set; `None` means "use the list roster".
    pub fn recipients(&self) -> Option<Vec<String>> {
        self.map.get("recipients").and_then(Value::as_array).map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    pub fn set_recipients(&mut self, recipients: &[String]) {
        self.map.insert(
            "recipients".to_string(),
            Value::from(recipients.to_vec()),
        );
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.map
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.map.get(key).and_then(Value::as_i64)
    }

    pub fn set_i64(&mut self, key: &str, value: i64) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.map).unwrap_or_else(|_| "{}".to_string())
    }

    fn from_json(id: &str, content: &str) -> Result<Self> {
        let map: BTreeMap<String, Value> =
            serde_json::from_str(content).map_err(|err| SwitchboardError::CorruptMetadata {
                id: id.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self { map })
    }
}

/// One named queue directory.
#[derive(Debug, Clone)]
pub struct Switchboard {
    dir: PathBuf,
}

impl Switchboard {
    /// Open (creating if needed) the named queue under `queue_root`.
    pub fn new(queue_root: &Path, name: QueueName) -> Result<Self> {
        Self::at(queue_root.join(name.dir_name()))
    }

    /// Open (creating if needed) a queue at an explicit directory.
    pub fn at(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|source| SwitchboardError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// The queue directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an entry; both files become visible atomically via rename,
    /// metadata last. Returns the new entry id.
    pub fn enqueue(&self, message: &[u8], metadata: &Metadata) -> Result<String> {
        let id = make_id();
        let msg_path = self.entry_path(&id, "msg");
        let pck_path = self.entry_path(&id, "pck");

        write_via_rename(&msg_path, message)?;
        write_via_rename(&pck_path, metadata.to_json().as_bytes())?;
        Ok(id)
    }

    /// Enqueue the clean-stop sentinel.
    pub fn enqueue_stop(&self) -> Result<String> {
        self.enqueue(b"", &Metadata::stop_sentinel())
    }

    /// Ready entry ids in arrival order.
    pub fn files(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|source| SwitchboardError::Io {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SwitchboardError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".pck") {
                ids.push(id.to_string());
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Load an entry, marking it in-flight by renaming both files to the
    /// `.bak` suffix first.
    pub fn dequeue(&self, id: &str) -> Result<(Vec<u8>, Metadata)> {
        let msg_path = self.entry_path(id, "msg");
        let pck_path = self.entry_path(id, "pck");
        let msg_bak = self.bak_path(id, "msg");
        let pck_bak = self.bak_path(id, "pck");

        rename_entry(&msg_path, &msg_bak, id)?;
        rename_entry(&pck_path, &pck_bak, id)?;

        let message = fs::read(&msg_bak).map_err(|source| SwitchboardError::Io {
            path: msg_bak.clone(),
            source,
        })?;
        let content = fs::read_to_string(&pck_bak).map_err(|source| SwitchboardError::Io {
            path: pck_bak.clone(),
            source,
        })?;
        let metadata = Metadata::from_json(id, &content)?;

        let version = metadata.version();
        if version != CURRENT_VERSION && version != STOP_VERSION {
            return Err(SwitchboardError::UnknownVersion { id: id.to_string(), found: version });
        }

        Ok((message, metadata))
    }

    /// Delete the in-flight backup of a processed entry.
    pub fn finish(&self, id: &str) -> Result<()> {
        for path in [self.bak_path(id, "msg"), self.bak_path(id, "pck")] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(SwitchboardError::Io { path, source }),
            }
        }
        Ok(())
    }

    /// Move an entry into `to` (possibly this switchboard), restoring the
    /// canonical suffixes. Works on both in-flight and canonical entries.
    pub fn requeue(&self, id: &str, to: &Switchboard) -> Result<()> {
        for kind in ["msg", "pck"] {
            let bak = self.bak_path(id, kind);
            let canonical = self.entry_path(id, kind);
            let source = if bak.exists() { bak } else { canonical };
            let dest = to.entry_path(id, kind);
            rename_entry(&source, &dest, id)?;
        }
        Ok(())
    }

    /// Rehabilitate every `.bak` pair left behind by a crashed runner.
    /// Returns the number of recovered entries.
    pub fn recover(&self) -> Result<u32> {
        let mut recovered = 0;
        let entries = fs::read_dir(&self.dir).map_err(|source| SwitchboardError::Io {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| SwitchboardError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".pck.bak") {
                let msg_bak = self.bak_path(stem, "msg");
                if msg_bak.exists() {
                    rename_entry(&msg_bak, &self.entry_path(stem, "msg"), stem)?;
                }
                rename_entry(&entry.path(), &self.entry_path(stem, "pck"), stem)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn entry_path(&self, id: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{id}.{kind}"))
    }

    fn bak_path(&self, id: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{id}.{kind}.bak"))
    }
}

fn rename_entry(from: &Path, to: &Path, id: &str) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            Err(SwitchboardError::Missing { id: id.to_string() })
        }
        Err(source) => Err(SwitchboardError::Io {
            path: from.to_path_buf(),
            source,
        }),
    }
}

fn write_via_rename(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    fs::write(&tmp, content).map_err(|source| SwitchboardError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| SwitchboardError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Generate a fresh entry id: zero-padded microsecond timestamp plus a
/// hash suffix covering pid and fresh randomness, so concurrent writers
/// never collide and lexicographic order matches arrival order. Within a
/// process the timestamp component is strictly monotonic even when two
/// enqueues land in the same microsecond.
fn make_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let micros = loop {
        let last = LAST_MICROS.load(Ordering::SeqCst);
        let candidate = now.max(last + 1);
        if LAST_MICROS
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break candidate;
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(micros.to_be_bytes());
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(rand::random::<[u8; 8]>());
    let digest = hasher.finalize();
    format!("{micros:020}+{}", hex::encode(&digest[..8]))
}
