//! In-memory store adapter backed by DashMap.
//!
//! Models the registry semantics the engine depends on: sections must exist
//! before records can be written into them, a scope can be write-protected
//! (the elevation-gated partition), and every write bumps the section's
//! last-modified clock. Every successful `set` is also appended to a write
//! log so tests can assert exactly what the engine touched.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointKey, Flow};
use crate::error::StoreError;

use super::{PersistentStore, Scope, SectionPath, StoreResult, Timestamp, TypedValue};

#[derive(Debug, Clone, Default)]
struct SectionData {
    values: BTreeMap<String, TypedValue>,
    modified: Timestamp,
}

/// One successful write performed through [`PersistentStore::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub scope: Scope,
    pub section: SectionPath,
    pub name: String,
    pub value: TypedValue,
}

/// Serializable form of one section, used by [`super::JsonFileStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDump {
    pub scope: Scope,
    pub flow: Flow,
    pub endpoint: EndpointKey,
    pub location: String,
    #[serde(default)]
    pub modified: Timestamp,
    #[serde(default)]
    pub values: BTreeMap<String, TypedValue>,
}

/// Concurrent in-memory store.
#[derive(Debug, Default)]
pub struct MemStore {
    sections: DashMap<(Scope, SectionPath), SectionData>,
    protected: DashSet<Scope>,
    clock: AtomicU64,
    writes: Mutex<Vec<WriteRecord>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> Timestamp {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current value of the modification clock.
    pub fn now(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    /// Create an empty section (what a driver does on install).
    pub fn create_section(&self, scope: Scope, section: &SectionPath) {
        let ts = self.tick();
        self.sections
            .entry((scope, section.clone()))
            .or_insert_with(|| SectionData {
                values: BTreeMap::new(),
                modified: ts,
            });
    }

    /// Driver-side write: creates the section if needed and bypasses
    /// protection and the write log.
    pub fn insert(&self, scope: Scope, section: &SectionPath, name: &str, value: TypedValue) {
        let ts = self.tick();
        let mut data = self.sections.entry((scope, section.clone())).or_default();
        data.values.insert(name.to_ascii_lowercase(), value);
        data.modified = ts;
    }

    /// Driver-side delete of one record.
    pub fn remove(&self, scope: Scope, section: &SectionPath, name: &str) -> Option<TypedValue> {
        let ts = self.tick();
        let mut data = self.sections.get_mut(&(scope, section.clone()))?;
        let removed = data.values.remove(&name.to_ascii_lowercase());
        if removed.is_some() {
            data.modified = ts;
        }
        removed
    }

    /// Force a section's last-modified time.
    pub fn touch(&self, scope: Scope, section: &SectionPath, modified: Timestamp) {
        if let Some(mut data) = self.sections.get_mut(&(scope, section.clone())) {
            data.modified = modified;
        }
        self.clock.fetch_max(modified, Ordering::SeqCst);
    }

    /// Refuse all writes into `scope` (simulates a non-elevated process).
    pub fn protect(&self, scope: Scope) {
        self.protected.insert(scope);
    }

    /// Undo the latest [`PersistentStore::set`] of `name`: restore the
    /// previous value and section timestamp, and drop the write from the log.
    pub fn revert(
        &self,
        scope: Scope,
        section: &SectionPath,
        name: &str,
        previous: Option<TypedValue>,
        modified: Timestamp,
    ) {
        let name = name.to_ascii_lowercase();
        if let Some(mut data) = self.sections.get_mut(&(scope, section.clone())) {
            match previous {
                Some(value) => {
                    data.values.insert(name.clone(), value);
                }
                None => {
                    data.values.remove(&name);
                }
            }
            data.modified = modified;
        }
        let mut writes = self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pos) = writes
            .iter()
            .rposition(|w| w.scope == scope && w.section == *section && w.name == name)
        {
            writes.remove(pos);
        }
    }

    /// Every successful write so far, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Export all sections, sorted by address.
    pub fn export(&self) -> Vec<SectionDump> {
        let mut out: Vec<SectionDump> = self
            .sections
            .iter()
            .map(|entry| {
                let (scope, path) = entry.key();
                SectionDump {
                    scope: *scope,
                    flow: path.flow,
                    endpoint: path.endpoint.clone(),
                    location: path.location.clone(),
                    modified: entry.value().modified,
                    values: entry.value().values.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| {
            (a.scope, a.flow, &a.endpoint, &a.location).cmp(&(b.scope, b.flow, &b.endpoint, &b.location))
        });
        out
    }

    /// Build a store from exported sections.
    pub fn import(dumps: Vec<SectionDump>, protected: &[Scope]) -> Self {
        let store = Self::new();
        store.restore(dumps, protected);
        store
    }

    /// Replace every section and the protection set. The clock resumes after
    /// the newest section so later writes always compare as more recent.
    pub fn restore(&self, dumps: Vec<SectionDump>, protected: &[Scope]) {
        self.sections.clear();
        self.protected.clear();
        let mut newest = 0;
        for dump in dumps {
            newest = newest.max(dump.modified);
            let path = SectionPath {
                flow: dump.flow,
                endpoint: dump.endpoint,
                location: dump.location,
            };
            let values = dump
                .values
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect();
            self.sections.insert(
                (dump.scope, path),
                SectionData {
                    values,
                    modified: dump.modified,
                },
            );
        }
        self.clock.fetch_max(newest, Ordering::SeqCst);
        for scope in protected {
            self.protect(*scope);
        }
    }

    /// Scopes currently write-protected.
    pub fn protected_scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.protected.iter().map(|s| *s).collect();
        scopes.sort();
        scopes
    }
}

impl PersistentStore for MemStore {
    fn get(&self, scope: Scope, section: &SectionPath, name: &str) -> Option<TypedValue> {
        self.sections
            .get(&(scope, section.clone()))
            .and_then(|data| data.values.get(&name.to_ascii_lowercase()).cloned())
    }

    fn set(
        &self,
        scope: Scope,
        section: &SectionPath,
        name: &str,
        value: &TypedValue,
    ) -> StoreResult<()> {
        if self.protected.contains(&scope) {
            return Err(StoreError::PermissionDenied {
                scope,
                location: section.location.clone(),
            });
        }
        let ts = self.tick();
        let mut data = self
            .sections
            .get_mut(&(scope, section.clone()))
            .ok_or_else(|| StoreError::SectionMissing {
                scope,
                location: section.location.clone(),
            })?;
        data.values.insert(name.to_ascii_lowercase(), value.clone());
        data.modified = ts;
        drop(data);

        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(WriteRecord {
                scope,
                section: section.clone(),
                name: name.to_ascii_lowercase(),
                value: value.clone(),
            });
        Ok(())
    }

    fn enumerate(&self, scope: Scope, section: &SectionPath) -> Vec<(String, TypedValue)> {
        self.sections
            .get(&(scope, section.clone()))
            .map(|data| {
                data.values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn sections(&self, scope: Scope, flow: Flow, endpoint: &EndpointKey) -> Vec<String> {
        let mut out: Vec<String> = self
            .sections
            .iter()
            .filter(|entry| {
                let (s, path) = entry.key();
                *s == scope && path.flow == flow && &path.endpoint == endpoint
            })
            .map(|entry| entry.key().1.location.clone())
            .collect();
        out.sort();
        out
    }

    fn last_modified(&self, scope: Scope, section: &SectionPath) -> Option<Timestamp> {
        self.sections
            .get(&(scope, section.clone()))
            .map(|data| data.modified)
    }
}
