//! Learning engine: discover a toggle's records by diffing snapshots.
//!
//! A human flips the OS-level control while the engine captures the
//! endpoint's whole namespace four times:
//!
//! ```text
//! Idle -> CaptureA1 -> CaptureB1 -> CaptureA2 -> CaptureB2 -> Extract -> Merge -> Persisted
//!                                                                  \-> Aborted (any step)
//! ```
//!
//! State A is "feature on", state B is "feature off". The first pair primes
//! the driver (some drivers only create their records on the first flip); the
//! second pair is authoritative. Sessions serialize to JSON so a learn can be
//! resumed by a later process.

pub mod extract;
pub mod merge;

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointKey, Flow};
use crate::error::LearnError;
use crate::rules::ToggleKind;
use crate::store::{PersistentStore, Scope, SectionPath, TypedValue};

pub use extract::{Candidate, MainSwitch};
pub use merge::MergeOutcome;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LearnPhase {
    Idle,
    CaptureA1,
    CaptureB1,
    CaptureA2,
    CaptureB2,
    Extract,
    Merge,
    Persisted,
    Aborted,
}

impl LearnPhase {
    pub const CAPTURES: [LearnPhase; 4] = [
        LearnPhase::CaptureA1,
        LearnPhase::CaptureB1,
        LearnPhase::CaptureA2,
        LearnPhase::CaptureB2,
    ];

    pub fn is_capture(self) -> bool {
        Self::CAPTURES.contains(&self)
    }

    /// The state the control must be in before this capture: `Some(true)`
    /// for A (on), `Some(false)` for B (off).
    pub fn wants_enabled(self) -> Option<bool> {
        match self {
            Self::CaptureA1 | Self::CaptureA2 => Some(true),
            Self::CaptureB1 | Self::CaptureB2 => Some(false),
            _ => None,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::Idle => Self::CaptureA1,
            Self::CaptureA1 => Self::CaptureB1,
            Self::CaptureB1 => Self::CaptureA2,
            Self::CaptureA2 => Self::CaptureB2,
            Self::CaptureB2 => Self::Extract,
            Self::Extract => Self::Merge,
            Self::Merge => Self::Persisted,
            Self::Persisted => Self::Persisted,
            Self::Aborted => Self::Aborted,
        }
    }
}

impl fmt::Display for LearnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::CaptureA1 => "capture A1",
            Self::CaptureB1 => "capture B1",
            Self::CaptureA2 => "capture A2",
            Self::CaptureB2 => "capture B2",
            Self::Extract => "extract",
            Self::Merge => "merge",
            Self::Persisted => "persisted",
            Self::Aborted => "aborted",
        })
    }
}

/// Asks the human to put the control in the state a capture needs.
///
/// Returning `false` aborts the learn.
pub trait CapturePrompt {
    fn ready(&mut self, phase: LearnPhase) -> bool;

    /// Called after each capture is recorded (e.g. to save the session).
    fn captured(&mut self, _session: &LearnSession) {}
}

impl<F: FnMut(LearnPhase) -> bool> CapturePrompt for F {
    fn ready(&mut self, phase: LearnPhase) -> bool {
        self(phase)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Identity of one record in an endpoint's namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub scope: Scope,
    pub location: String,
    pub name: String,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}\\{}", self.scope, self.location, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(flatten)]
    pub id: RecordId,
    pub value: TypedValue,
}

/// Every record under one endpoint (both scopes, every section), sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<SnapshotRecord>,
}

impl Snapshot {
    /// Read the whole namespace once.
    pub fn capture<S: PersistentStore>(store: &S, endpoint: &EndpointKey, flow: Flow) -> Self {
        let mut records = Vec::new();
        for scope in Scope::CANONICAL {
            for location in store.sections(scope, flow, endpoint) {
                let section = SectionPath::new(flow, endpoint, location.as_str());
                for (name, value) in store.enumerate(scope, &section) {
                    records.push(SnapshotRecord {
                        id: RecordId {
                            scope,
                            location: location.clone(),
                            name: name.to_ascii_lowercase(),
                        },
                        value,
                    });
                }
            }
        }
        Self::from_records(records)
    }

    pub fn from_records(mut records: Vec<SnapshotRecord>) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records.dedup_by(|a, b| a.id == b.id);
        Self { records }
    }

    pub fn get(&self, id: &RecordId) -> Option<&TypedValue> {
        self.records
            .binary_search_by(|r| r.id.cmp(id))
            .ok()
            .map(|i| &self.records[i].value)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records with the same value in every sample.
    pub fn stable(samples: &[Snapshot]) -> Snapshot {
        let Some((first, rest)) = samples.split_first() else {
            return Snapshot::default();
        };
        let records = first
            .records
            .iter()
            .filter(|r| rest.iter().all(|s| s.get(&r.id) == Some(&r.value)))
            .cloned()
            .collect();
        Snapshot { records }
    }
}

/// How each capture is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub samples: usize,
    pub settle: Duration,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            samples: 3,
            settle: Duration::from_millis(150),
        }
    }
}

/// Capture `sampling.samples` snapshots and keep only the stable records,
/// which filters out counters and timestamps the driver keeps rewriting.
pub fn sample<S: PersistentStore>(store: &S, endpoint: &EndpointKey, flow: Flow, sampling: Sampling) -> Snapshot {
    let count = sampling.samples.max(1);
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        if i > 0 && !sampling.settle.is_zero() {
            thread::sleep(sampling.settle);
        }
        samples.push(Snapshot::capture(store, endpoint, flow));
    }
    let stable = Snapshot::stable(&samples);
    tracing::debug!(
        %endpoint,
        records = samples[0].len(),
        stable = stable.len(),
        "sampled namespace"
    );
    stable
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// What is being learned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnTarget {
    pub endpoint: EndpointKey,
    pub flow: Flow,
    pub kind: ToggleKind,
    /// Friendly device name, recorded as `device_name_pattern` for FX rules.
    #[serde(default)]
    pub device_name: String,
}

/// One learn in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnSession {
    pub target: LearnTarget,
    phase: LearnPhase,
    #[serde(default)]
    a1: Option<Snapshot>,
    #[serde(default)]
    b1: Option<Snapshot>,
    #[serde(default)]
    a2: Option<Snapshot>,
    #[serde(default)]
    b2: Option<Snapshot>,
}

impl LearnSession {
    pub fn new(target: LearnTarget) -> Self {
        Self {
            target,
            phase: LearnPhase::Idle,
            a1: None,
            b1: None,
            a2: None,
            b2: None,
        }
    }

    pub fn phase(&self) -> LearnPhase {
        self.phase
    }

    fn expect(&self, expected: LearnPhase) -> Result<(), LearnError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(LearnError::OutOfOrder {
                expected: expected.to_string(),
                actual: self.phase.to_string(),
            })
        }
    }

    /// `Idle -> CaptureA1`.
    pub fn start(&mut self) -> Result<(), LearnError> {
        self.expect(LearnPhase::Idle)?;
        self.phase = LearnPhase::CaptureA1;
        Ok(())
    }

    /// Record the snapshot for the current capture phase and advance.
    pub fn accept_snapshot(&mut self, phase: LearnPhase, snapshot: Snapshot) -> Result<(), LearnError> {
        self.expect(phase)?;
        let slot = match phase {
            LearnPhase::CaptureA1 => &mut self.a1,
            LearnPhase::CaptureB1 => &mut self.b1,
            LearnPhase::CaptureA2 => &mut self.a2,
            LearnPhase::CaptureB2 => &mut self.b2,
            other => {
                return Err(LearnError::OutOfOrder {
                    expected: "a capture phase".to_string(),
                    actual: other.to_string(),
                });
            }
        };
        *slot = Some(snapshot);
        self.phase = phase.next();
        Ok(())
    }

    /// Sample the store for the current capture phase.
    pub fn capture<S: PersistentStore>(&mut self, store: &S, sampling: Sampling) -> Result<(), LearnError> {
        let phase = self.phase;
        if !phase.is_capture() {
            return Err(LearnError::OutOfOrder {
                expected: "a capture phase".to_string(),
                actual: phase.to_string(),
            });
        }
        let snapshot = sample(store, &self.target.endpoint, self.target.flow, sampling);
        tracing::debug!(endpoint = %self.target.endpoint, %phase, records = snapshot.len(), "captured");
        self.accept_snapshot(phase, snapshot)
    }

    /// Diff the four snapshots. `Extract -> Merge` on success.
    pub fn extract(&mut self) -> Result<Vec<Candidate>, LearnError> {
        self.expect(LearnPhase::Extract)?;
        let (Some(a1), Some(b1), Some(a2), Some(b2)) = (&self.a1, &self.b1, &self.a2, &self.b2) else {
            return Err(LearnError::Session {
                message: "extract phase reached without all four snapshots".to_string(),
            });
        };
        let candidates = extract::extract(a1, b1, a2, b2);
        if candidates.is_empty() {
            self.abort();
            return Err(LearnError::LearningNoStableCandidate {
                endpoint: self.target.endpoint.to_string(),
            });
        }
        self.phase = LearnPhase::Merge;
        Ok(candidates)
    }

    /// `Merge -> Persisted`; the snapshots are no longer needed.
    pub fn mark_persisted(&mut self) -> Result<(), LearnError> {
        self.expect(LearnPhase::Merge)?;
        self.phase = LearnPhase::Persisted;
        self.discard_snapshots();
        Ok(())
    }

    /// Abandon the learn. Snapshots are dropped and nothing is persisted.
    pub fn abort(&mut self) {
        self.phase = LearnPhase::Aborted;
        self.discard_snapshots();
    }

    fn discard_snapshots(&mut self) {
        self.a1 = None;
        self.b1 = None;
        self.a2 = None;
        self.b2 = None;
    }

    pub fn to_json(&self) -> Result<String, LearnError> {
        serde_json::to_string_pretty(self).map_err(|e| LearnError::Session { message: e.to_string() })
    }

    pub fn from_json(text: &str) -> Result<Self, LearnError> {
        serde_json::from_str(text).map_err(|e| LearnError::Session { message: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn target() -> LearnTarget {
        LearnTarget {
            endpoint: EndpointKey::parse("{e}").unwrap(),
            flow: Flow::Render,
            kind: ToggleKind::Main,
            device_name: "Speakers".into(),
        }
    }

    fn snap(value: u32) -> Snapshot {
        Snapshot::from_records(vec![SnapshotRecord {
            id: RecordId {
                scope: Scope::User,
                location: "FxProperties".into(),
                name: "{l},1".into(),
            },
            value: TypedValue::Integer(value),
        }])
    }

    #[test]
    fn phases_must_run_in_order() {
        let mut session = LearnSession::new(target());
        assert!(session.accept_snapshot(LearnPhase::CaptureA1, snap(0)).is_err());
        session.start().unwrap();
        assert!(matches!(
            session.accept_snapshot(LearnPhase::CaptureB1, snap(1)),
            Err(LearnError::OutOfOrder { .. })
        ));
        for (phase, v) in LearnPhase::CAPTURES.into_iter().zip([0, 1, 0, 1]) {
            session.accept_snapshot(phase, snap(v)).unwrap();
        }
        assert_eq!(session.phase(), LearnPhase::Extract);
        let candidates = session.extract().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(session.phase(), LearnPhase::Merge);
        session.mark_persisted().unwrap();
        assert_eq!(session.phase(), LearnPhase::Persisted);
    }

    #[test]
    fn nothing_flipped_aborts_with_no_candidate() {
        let mut session = LearnSession::new(target());
        session.start().unwrap();
        for phase in LearnPhase::CAPTURES {
            session.accept_snapshot(phase, snap(0)).unwrap();
        }
        assert!(matches!(
            session.extract(),
            Err(LearnError::LearningNoStableCandidate { .. })
        ));
        assert_eq!(session.phase(), LearnPhase::Aborted);
    }

    #[test]
    fn session_survives_json() {
        let mut session = LearnSession::new(target());
        session.start().unwrap();
        session.accept_snapshot(LearnPhase::CaptureA1, snap(0)).unwrap();
        let restored = LearnSession::from_json(&session.to_json().unwrap()).unwrap();
        assert_eq!(restored, session);
        assert_eq!(restored.phase(), LearnPhase::CaptureB1);
    }

    #[test]
    fn stable_drops_changing_records() {
        let mut noisy = snap(0);
        noisy.records.push(SnapshotRecord {
            id: RecordId {
                scope: Scope::User,
                location: "FxProperties".into(),
                name: "counter".into(),
            },
            value: TypedValue::Integer(1),
        });
        let noisy = Snapshot::from_records(noisy.records);
        let mut later = noisy.clone();
        if let Some(r) = later.records.iter_mut().find(|r| r.id.name == "counter") {
            r.value = TypedValue::Integer(2);
        }
        let stable = Snapshot::stable(&[noisy, later]);
        assert_eq!(stable, snap(0));
    }

    #[test]
    fn capture_reads_every_section_in_both_scopes() {
        let store = MemStore::new();
        let endpoint = EndpointKey::parse("{e}").unwrap();
        let fx = SectionPath::new(Flow::Render, &endpoint, "FxProperties");
        let props = SectionPath::new(Flow::Render, &endpoint, "Properties");
        let other = SectionPath::new(Flow::Capture, &endpoint, "FxProperties");
        store.insert(Scope::User, &fx, "A", TypedValue::Integer(1));
        store.insert(Scope::Machine, &props, "b", TypedValue::Text("x".into()));
        store.insert(Scope::User, &other, "c", TypedValue::Integer(1));

        let snapshot = Snapshot::capture(&store, &endpoint, Flow::Render);
        assert_eq!(snapshot.len(), 2);
        let id = RecordId {
            scope: Scope::User,
            location: "FxProperties".into(),
            name: "a".into(),
        };
        assert_eq!(snapshot.get(&id), Some(&TypedValue::Integer(1)));
    }
}
