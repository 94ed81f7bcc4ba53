// Navigation-surviving key/value storage for session state.
//
// A browser client keeps these in `sessionStorage`; native clients and tests
// use `MemoryStore` (a cloneable handle, so a "reloaded" manager can be built
// over the same data) or `FileStore` (one file per key).
//
// Three keys are used:
// - `SESSION_KEY`: the `SessionRecord` (room code, display name, creator
//   flag) written on every successful create/join.
// - `SNAPSHOT_KEY`: the full CRDT document, written on every mutation.
// - `EPOCH_KEY`: the current combat round number, so a reloaded client
//   doesn't come back a round behind its peer.
// - `LOCAL_TIMERS_KEY`: single-player timers, the seed source and export
//   sink for the shared document.
//
// The session record, snapshot and epoch always go away together
// (`clear_session`).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::rc::Rc;

use kipukas_protocol::types::{Epoch, RoomCode};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, SessionError, StoreError};

pub const SESSION_KEY: &str = "kipukas.session";
pub const SNAPSHOT_KEY: &str = "kipukas.crdt";
pub const EPOCH_KEY: &str = "kipukas.epoch";
pub const LOCAL_TIMERS_KEY: &str = "kipukas.timers";

pub trait SessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// Which room to return to after a reload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub room_code: RoomCode,
    pub display_name: String,
    pub is_creator: bool,
}

pub fn load_record(store: &impl SessionStore) -> Result<Option<SessionRecord>, SessionError> {
    match store.get(SESSION_KEY)? {
        Some(json) => Ok(Some(
            serde_json::from_str(&json).map_err(CodecError::from)?,
        )),
        None => Ok(None),
    }
}

pub fn save_record(store: &mut impl SessionStore, record: &SessionRecord) -> Result<(), SessionError> {
    let json = serde_json::to_string(record).map_err(CodecError::from)?;
    store.set(SESSION_KEY, &json)?;
    Ok(())
}

/// Forget the room: record, CRDT snapshot and combat epoch together.
pub fn clear_session(store: &mut impl SessionStore) -> Result<(), StoreError> {
    store.remove(SESSION_KEY)?;
    store.remove(SNAPSHOT_KEY)?;
    store.remove(EPOCH_KEY)
}

/// The stored combat epoch. Missing or unreadable means round zero.
pub fn load_epoch(store: &impl SessionStore) -> Result<Epoch, StoreError> {
    Ok(store
        .get(EPOCH_KEY)?
        .and_then(|raw| raw.parse().ok())
        .map(Epoch)
        .unwrap_or_default())
}

pub fn save_epoch(store: &mut impl SessionStore, epoch: Epoch) -> Result<(), StoreError> {
    store.set(EPOCH_KEY, &epoch.0.to_string())
}

/// In-memory store. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// One file per key under `dir`.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        // Write-then-rename: readers see the old value or the new one.
        let path = self.path(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            room_code: RoomCode::parse("HJKM").unwrap(),
            display_name: "Mossy Den".into(),
            is_creator: true,
        }
    }

    #[test]
    fn memory_store_clones_share_state() {
        let mut a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "v").unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn record_round_trip_and_clear() {
        let mut store = MemoryStore::new();
        assert_eq!(load_record(&store).unwrap(), None);

        save_record(&mut store, &record()).unwrap();
        store.set(SNAPSHOT_KEY, "AAA").unwrap();
        store.set(LOCAL_TIMERS_KEY, "[]").unwrap();
        assert_eq!(load_record(&store).unwrap(), Some(record()));

        clear_session(&mut store).unwrap();
        assert_eq!(load_record(&store).unwrap(), None);
        assert!(!store.contains(SNAPSHOT_KEY));
        assert!(store.contains(LOCAL_TIMERS_KEY), "local timers outlive the room");
    }

    #[test]
    fn epoch_defaults_to_zero_and_clears_with_the_session() {
        let mut store = MemoryStore::new();
        assert_eq!(load_epoch(&store).unwrap(), Epoch(0));
        save_epoch(&mut store, Epoch(3)).unwrap();
        assert_eq!(load_epoch(&store).unwrap(), Epoch(3));

        store.set(EPOCH_KEY, "three").unwrap();
        assert_eq!(load_epoch(&store).unwrap(), Epoch(0));

        save_epoch(&mut store, Epoch(2)).unwrap();
        clear_session(&mut store).unwrap();
        assert!(!store.contains(EPOCH_KEY));
    }

    #[test]
    fn stored_record_with_bad_code_is_rejected() {
        let mut store = MemoryStore::new();
        store
            .set(
                SESSION_KEY,
                r#"{"room_code":"0OIL","display_name":"x","is_creator":false}"#,
            )
            .unwrap();
        assert!(matches!(
            load_record(&store),
            Err(SessionError::Codec(CodecError::Json(_)))
        ));
    }

    #[test]
    fn corrupt_record_is_a_codec_error() {
        let mut store = MemoryStore::new();
        store.set(SESSION_KEY, "{not json").unwrap();
        assert!(matches!(
            load_record(&store),
            Err(SessionError::Codec(CodecError::Json(_)))
        ));
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path().join("session")).unwrap();
        save_record(&mut store, &record()).unwrap();

        let reopened = FileStore::open(dir.path().join("session")).unwrap();
        assert_eq!(load_record(&reopened).unwrap(), Some(record()));

        let mut reopened = reopened;
        clear_session(&mut reopened).unwrap();
        assert_eq!(reopened.get(SESSION_KEY).unwrap(), None);
        // Removing a missing key is fine.
        reopened.remove(SNAPSHOT_KEY).unwrap();
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get("../escape"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get(""), Err(StoreError::InvalidKey(_))));
    }
}
