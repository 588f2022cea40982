//! Realm Sync Progression Saves
//!
//! Local progression (gold, level, wave, inventory) is delegated to an
//! external key-value blob store keyed by `(slot, username)`. This crate
//! provides:
//! - `BlobStore`: the collaborator seam
//! - `MemoryBlobStore` and `FileBlobStore` implementations
//! - `SaveEnvelope`: checksummed, versioned wrapper around the snapshot
//!
//! The shared session document is never persisted; it is transient
//! membership state rebuilt by whichever client initialises a session.

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use realmsync_doc::progress::INVENTORY_SIZE;
use realmsync_doc::{PlayerProgress, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Envelope schema version.
pub const SAVE_FORMAT_VERSION: u32 = 2;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("invalid save key: {0}")]
    InvalidKey(String),
    #[error("save blob for {key} failed checksum verification")]
    ChecksumMismatch { key: SaveKey },
    #[error("save blob for {key} has unsupported format version {version}")]
    UnsupportedVersion { key: SaveKey, version: u32 },
    #[error("failed to encode or decode save blob: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Keys and Envelopes
// ============================================================================

/// Storage key for one save slot of one user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SaveKey {
    pub slot: u32,
    pub username: String,
}

impl SaveKey {
    pub fn new(slot: u32, username: impl Into<String>) -> Self {
        Self {
            slot,
            username: username.into(),
        }
    }

    /// Reject usernames that cannot be used as a single path component.
    pub fn validate(&self) -> Result<(), PersistError> {
        let name = &self.username;
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.chars().any(|c| matches!(c, '/' | '\\' | '\0'))
        {
            return Err(PersistError::InvalidKey(format!("username {name:?}")));
        }
        Ok(())
    }
}

impl std::fmt::Display for SaveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.username, self.slot)
    }
}

/// Versioned, checksummed save record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveEnvelope {
    pub format_version: u32,
    pub slot: u32,
    pub username: String,
    pub saved_at: Timestamp,
    /// Lowercase hex SHA-256 of `payload`.
    pub sha256: String,
    /// JSON encoding of the `PlayerProgress` snapshot.
    pub payload: String,
}

impl SaveEnvelope {
    /// Wrap a progress snapshot.
    pub fn seal(
        key: &SaveKey,
        progress: &PlayerProgress,
        saved_at: Timestamp,
    ) -> Result<Self, PersistError> {
        let payload = serde_json::to_string(progress)?;
        Ok(Self {
            format_version: SAVE_FORMAT_VERSION,
            slot: key.slot,
            username: key.username.clone(),
            saved_at,
            sha256: sha256_hex(payload.as_bytes()),
            payload,
        })
    }

    /// Verify the checksum and decode the snapshot.
    ///
    /// Short inventories from older layouts are grown to the default slot
    /// count. Larger inventories keep their saved size.
    pub fn open(&self) -> Result<PlayerProgress, PersistError> {
        let key = SaveKey::new(self.slot, self.username.clone());
        if self.format_version != SAVE_FORMAT_VERSION {
            return Err(PersistError::UnsupportedVersion {
                key,
                version: self.format_version,
            });
        }
        if sha256_hex(self.payload.as_bytes()) != self.sha256 {
            return Err(PersistError::ChecksumMismatch { key });
        }
        let mut progress: PlayerProgress = serde_json::from_str(&self.payload)?;
        let size = progress.inventory.size().max(INVENTORY_SIZE);
        progress.inventory.normalize(size);
        Ok(progress)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Blob Store Seam
// ============================================================================

/// External key-value store holding opaque save blobs.
pub trait BlobStore {
    fn put(&mut self, key: &SaveKey, blob: Vec<u8>) -> Result<(), PersistError>;
    fn get(&self, key: &SaveKey) -> Result<Option<Vec<u8>>, PersistError>;
    /// All keys stored for `username`.
    fn keys_for(&self, username: &str) -> Result<Vec<SaveKey>, PersistError>;
}

/// Save `progress` into `key`, replacing any previous blob.
pub fn save_progress(
    store: &mut dyn BlobStore,
    key: &SaveKey,
    progress: &PlayerProgress,
    now: Timestamp,
) -> Result<SaveEnvelope, PersistError> {
    key.validate()?;
    let envelope = SaveEnvelope::seal(key, progress, now)?;
    store.put(key, envelope.to_bytes()?)?;
    tracing::debug!(key = %key, saved_at = now, "saved progress");
    Ok(envelope)
}

/// Load the snapshot stored under `key`, if any.
pub fn load_progress(
    store: &dyn BlobStore,
    key: &SaveKey,
) -> Result<Option<PlayerProgress>, PersistError> {
    key.validate()?;
    let Some(blob) = store.get(key)? else {
        return Ok(None);
    };
    let progress = SaveEnvelope::from_bytes(&blob)?.open()?;
    Ok(Some(progress))
}

/// Load the most recently saved slot of `username`.
///
/// Unreadable slots are skipped with a warning rather than failing the load.
pub fn load_latest(
    store: &dyn BlobStore,
    username: &str,
) -> Result<Option<(SaveKey, PlayerProgress)>, PersistError> {
    let mut latest: Option<(Timestamp, SaveKey, PlayerProgress)> = None;

    for key in store.keys_for(username)? {
        let Some(blob) = store.get(&key)? else {
            continue;
        };
        let opened = SaveEnvelope::from_bytes(&blob)
            .and_then(|env| env.open().map(|progress| (env.saved_at, progress)));
        match opened {
            Ok((saved_at, progress)) => {
                if latest.as_ref().is_none_or(|(at, _, _)| saved_at > *at) {
                    latest = Some((saved_at, key, progress));
                }
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable save"),
        }
    }

    Ok(latest.map(|(_, key, progress)| (key, progress)))
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Blob store backed by a map; used by tests and headless sessions.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    blobs: BTreeMap<SaveKey, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&mut self, key: &SaveKey, blob: Vec<u8>) -> Result<(), PersistError> {
        self.blobs.insert(key.clone(), blob);
        Ok(())
    }

    fn get(&self, key: &SaveKey) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.blobs.get(key).cloned())
    }

    fn keys_for(&self, username: &str) -> Result<Vec<SaveKey>, PersistError> {
        Ok(self
            .blobs
            .keys()
            .filter(|k| k.username == username)
            .cloned()
            .collect())
    }
}

// ============================================================================
// File Store
// ============================================================================

/// Blob store laid out as `<root>/<username>/slot_<n>.json`.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &SaveKey) -> Result<PathBuf, PersistError> {
        key.validate()?;
        Ok(self
            .root
            .join(&key.username)
            .join(format!("slot_{}.json", key.slot)))
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl BlobStore for FileBlobStore {
    fn put(&mut self, key: &SaveKey, blob: Vec<u8>) -> Result<(), PersistError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        // Write then rename so a crash never leaves a torn blob behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &blob).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }

    fn get(&self, key: &SaveKey) -> Result<Option<Vec<u8>>, PersistError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistError::Io { path, source }),
        }
    }

    fn keys_for(&self, username: &str) -> Result<Vec<SaveKey>, PersistError> {
        let key = SaveKey::new(0, username);
        key.validate()?;
        let dir = self.root.join(username);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(PersistError::Io { path: dir, source }),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name();
            let Some(slot) = name
                .to_str()
                .and_then(|n| n.strip_prefix("slot_"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            keys.push(SaveKey::new(slot, username));
        }
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use realmsync_doc::{Item, Rarity};

    fn progress(gold: u64) -> PlayerProgress {
        let mut progress = PlayerProgress {
            gold,
            wave: 12,
            realm: 2,
            ..Default::default()
        };
        progress
            .inventory
            .place(Item {
                id: "box-1".to_string(),
                name: "Epic Mystery Relic".to_string(),
                rarity: Rarity::Epic,
                icon: "🔮".to_string(),
                stats: Default::default(),
                season: None,
            })
            .unwrap();
        progress
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "realmsync-persist-{}-{name}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_memory_round_trip() {
        let mut store = MemoryBlobStore::new();
        let key = SaveKey::new(1, "alice");

        save_progress(&mut store, &key, &progress(250), 1_000).unwrap();
        let loaded = load_progress(&store, &key).unwrap().unwrap();

        assert_eq!(loaded, progress(250));
        assert!(load_progress(&store, &SaveKey::new(2, "alice")).unwrap().is_none());
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let mut store = MemoryBlobStore::new();
        let key = SaveKey::new(1, "alice");
        let mut envelope = save_progress(&mut store, &key, &progress(250), 1_000).unwrap();

        envelope.payload = envelope.payload.replace("250", "999999");
        store.put(&key, envelope.to_bytes().unwrap()).unwrap();

        assert!(matches!(
            load_progress(&store, &key),
            Err(PersistError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let key = SaveKey::new(1, "alice");
        let mut envelope = SaveEnvelope::seal(&key, &progress(1), 0).unwrap();
        envelope.format_version = 99;
        assert!(matches!(
            envelope.open(),
            Err(PersistError::UnsupportedVersion { version: 99, .. })
        ));
    }

    #[test]
    fn test_load_latest_picks_newest_slot() {
        let mut store = MemoryBlobStore::new();
        save_progress(&mut store, &SaveKey::new(1, "alice"), &progress(10), 5_000).unwrap();
        save_progress(&mut store, &SaveKey::new(2, "alice"), &progress(20), 9_000).unwrap();
        save_progress(&mut store, &SaveKey::new(3, "bob"), &progress(30), 99_000).unwrap();

        let (key, loaded) = load_latest(&store, "alice").unwrap().unwrap();
        assert_eq!(key, SaveKey::new(2, "alice"));
        assert_eq!(loaded.gold, 20);

        assert!(load_latest(&store, "carol").unwrap().is_none());
    }

    #[test]
    fn test_load_latest_skips_corrupt_slot() {
        let mut store = MemoryBlobStore::new();
        save_progress(&mut store, &SaveKey::new(1, "alice"), &progress(10), 5_000).unwrap();
        store.put(&SaveKey::new(2, "alice"), b"not json".to_vec()).unwrap();

        let (key, _) = load_latest(&store, "alice").unwrap().unwrap();
        assert_eq!(key.slot, 1);
    }

    #[test]
    fn test_short_inventory_normalised_on_load() {
        let key = SaveKey::new(1, "alice");
        let mut old = progress(5);
        old.inventory.normalize(10);
        let envelope = SaveEnvelope::seal(&key, &old, 0).unwrap();

        let loaded = envelope.open().unwrap();
        assert_eq!(loaded.inventory.size(), INVENTORY_SIZE);
        assert!(loaded.inventory.contains("box-1"));
    }

    #[test]
    fn test_large_inventory_survives_round_trip() {
        let mut store = MemoryBlobStore::new();
        let key = SaveKey::new(1, "alice");
        let mut big = progress(0);
        big.inventory.normalize(60);
        for n in 1..56 {
            big.inventory
                .place(Item {
                    id: format!("gem-{n}"),
                    name: "Rare Gem".to_string(),
                    rarity: Rarity::Rare,
                    icon: "💎".to_string(),
                    stats: Default::default(),
                    season: None,
                })
                .unwrap();
        }
        assert_eq!(big.inventory.items().count(), 56);

        save_progress(&mut store, &key, &big, 5).unwrap();
        let loaded = load_progress(&store, &key).unwrap().unwrap();
        assert_eq!(loaded.inventory.size(), 60);
        assert_eq!(loaded.inventory.items().count(), 56);
        assert!(loaded.inventory.contains("gem-55"));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = scratch_dir("round-trip");
        let mut store = FileBlobStore::new(&dir);
        let key = SaveKey::new(3, "alice");

        save_progress(&mut store, &key, &progress(77), 1).unwrap();
        assert_eq!(load_progress(&store, &key).unwrap().unwrap().gold, 77);
        assert_eq!(store.keys_for("alice").unwrap(), vec![key]);
        assert!(store.keys_for("nobody").unwrap().is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_path_traversal_rejected() {
        let mut store = FileBlobStore::new(scratch_dir("traversal"));
        let key = SaveKey::new(1, "../escape");
        assert!(matches!(
            save_progress(&mut store, &key, &progress(1), 0),
            Err(PersistError::InvalidKey(_))
        ));
    }
}
