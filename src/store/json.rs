//! JSON-file store adapter.
//!
//! A [`MemStore`] whose contents are loaded from and written back to a JSON
//! document after every successful `set`. The CLI uses it on hosts without a
//! native registry, and it doubles as a portable capture of an endpoint's
//! namespace for offline learning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointKey, Flow};
use crate::error::StoreError;

use super::mem::{MemStore, SectionDump};
use super::{PersistentStore, Scope, SectionPath, StoreResult, Timestamp, TypedValue};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    /// Scopes this process may not write (mirrors a non-elevated session).
    #[serde(default)]
    protected: Vec<Scope>,
    #[serde(default)]
    sections: Vec<SectionDump>,
}

fn read_document(path: &Path) -> StoreResult<StoreDocument> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<StoreDocument>(&content).map_err(|e| StoreError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(source) => Err(StoreError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Store persisted as a JSON document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemStore,
}

impl JsonFileStore {
    /// Open a store document. A missing file opens as an empty store and is
    /// created on the first successful write.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc = read_document(&path)?;
        tracing::debug!(path = %path.display(), sections = doc.sections.len(), "opened JSON store");
        Ok(Self {
            inner: MemStore::import(doc.sections, &doc.protected),
            path,
        })
    }

    /// Re-read the document, picking up edits made by another process.
    pub fn reload(&self) -> StoreResult<()> {
        let doc = read_document(&self.path)?;
        tracing::debug!(path = %self.path.display(), sections = doc.sections.len(), "reloaded JSON store");
        self.inner.restore(doc.sections, &doc.protected);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direct access to the in-memory state (driver-side edits, dumps).
    pub fn memory(&self) -> &MemStore {
        &self.inner
    }

    /// Write the current state back to disk.
    pub fn flush(&self) -> StoreResult<()> {
        let doc = StoreDocument {
            protected: self.inner.protected_scopes(),
            sections: self.inner.export(),
        };
        let content = serde_json::to_string_pretty(&doc).map_err(|e| StoreError::Parse {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(&self.path, content).map_err(|source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }
}

impl PersistentStore for JsonFileStore {
    fn get(&self, scope: Scope, section: &SectionPath, name: &str) -> Option<TypedValue> {
        self.inner.get(scope, section, name)
    }

    fn set(
        &self,
        scope: Scope,
        section: &SectionPath,
        name: &str,
        value: &TypedValue,
    ) -> StoreResult<()> {
        let previous = self.inner.get(scope, section, name);
        let modified = self.inner.last_modified(scope, section);
        self.inner.set(scope, section, name, value)?;
        if let Err(e) = self.flush() {
            if let Some(modified) = modified {
                self.inner.revert(scope, section, name, previous, modified);
            }
            tracing::warn!(path = %self.path.display(), %scope, record = name, "store write rolled back");
            return Err(e);
        }
        Ok(())
    }

    fn enumerate(&self, scope: Scope, section: &SectionPath) -> Vec<(String, TypedValue)> {
        self.inner.enumerate(scope, section)
    }

    fn sections(&self, scope: Scope, flow: Flow, endpoint: &EndpointKey) -> Vec<String> {
        self.inner.sections(scope, flow, endpoint)
    }

    fn last_modified(&self, scope: Scope, section: &SectionPath) -> Option<Timestamp> {
        self.inner.last_modified(scope, section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let ep = EndpointKey::parse("{beef}").unwrap();
        let section = SectionPath::new(Flow::Capture, &ep, "Properties");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.memory().create_section(Scope::User, &section);
            store
                .set(Scope::User, &section, "{g},3", &TypedValue::Binary(vec![1, 2]))
                .unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            store.get(Scope::User, &section, "{g},3"),
            Some(TypedValue::Binary(vec![1, 2]))
        );
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("absent.json")).unwrap();
        assert!(store.memory().export().is_empty());
    }

    #[test]
    fn garbage_document_is_a_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn reload_sees_external_edits() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let ep = EndpointKey::parse("{beef}").unwrap();
        let section = SectionPath::new(Flow::Render, &ep, "FxProperties");

        let ours = JsonFileStore::open(&path).unwrap();
        let theirs = JsonFileStore::open(&path).unwrap();
        theirs.memory().insert(Scope::User, &section, "x", TypedValue::Integer(7));
        theirs.flush().unwrap();

        assert_eq!(ours.get(Scope::User, &section, "x"), None);
        ours.reload().unwrap();
        assert_eq!(ours.get(Scope::User, &section, "x"), Some(TypedValue::Integer(7)));
    }

    #[test]
    fn failed_flush_leaves_memory_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let ep = EndpointKey::parse("{beef}").unwrap();
        let section = SectionPath::new(Flow::Render, &ep, "FxProperties");

        let store = JsonFileStore::open(&path).unwrap();
        store.memory().insert(Scope::User, &section, "{g},1", TypedValue::Integer(0));
        let before = store.last_modified(Scope::User, &section);
        // A directory in the document's place makes every flush fail.
        std::fs::create_dir(&path).unwrap();

        let err = store
            .set(Scope::User, &section, "{g},1", &TypedValue::Integer(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(store.get(Scope::User, &section, "{g},1"), Some(TypedValue::Integer(0)));
        assert_eq!(store.last_modified(Scope::User, &section), before);
        assert!(store.memory().writes().is_empty());

        store.set(Scope::User, &section, "{g},2", &TypedValue::Integer(1)).unwrap_err();
        assert_eq!(store.get(Scope::User, &section, "{g},2"), None);
    }
}
