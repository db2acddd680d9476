//! State reader: current boolean state of a rule for one endpoint.
//!
//! Single-record rules are probed scope by scope. Multi-record rules are read
//! block by block and decided by a quorum vote, falling back to the single
//! block that carries the best signal.
//!
//! Two scopes can disagree about the same record (a driver may mirror it).
//! Disagreements are settled by section last-modified time: the more recent
//! write wins, ties keep the earlier-declared scope, and a reading without a
//! timestamp never overrides one that has it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointKey, Flow};
use crate::rules::{MultiRecord, RuleRef, SwitchRecord, WriteBlock};
use crate::store::{PersistentStore, Scope, SectionPath, Timestamp, TypedValue, ValueKind};

/// Result of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleState {
    Enabled,
    Disabled,
    /// No known payload, or an inconclusive vote.
    Unknown,
}

impl ToggleState {
    pub fn from_bool(enabled: bool) -> Self {
        if enabled { Self::Enabled } else { Self::Disabled }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Enabled => Some(true),
            Self::Disabled => Some(false),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ToggleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Unknown => "unknown",
        })
    }
}

/// How thoroughly to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Probe every scope and every applicable block.
    #[default]
    Full,
    /// Stop at the first definitive answer.
    Fast,
}

/// One record's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Enable,
    Disable,
    Abstain,
}

impl Vote {
    fn is_definitive(self) -> bool {
        self != Self::Abstain
    }

    pub fn state(self) -> ToggleState {
        match self {
            Self::Enable => ToggleState::Enabled,
            Self::Disable => ToggleState::Disabled,
            Self::Abstain => ToggleState::Unknown,
        }
    }
}

/// A classified value from one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedReading {
    pub scope: Scope,
    pub vote: Vote,
    pub modified: Option<Timestamp>,
}

/// State plus the scope that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub state: ToggleState,
    pub scope: Option<Scope>,
}

impl Reading {
    pub const UNKNOWN: Reading = Reading {
        state: ToggleState::Unknown,
        scope: None,
    };
}

// ---------------------------------------------------------------------------
// Pure pieces
// ---------------------------------------------------------------------------

/// Compare a live value with a payload pair. A different type never matches.
pub fn classify(value: Option<&TypedValue>, enable: &TypedValue, disable: &TypedValue) -> Vote {
    match value {
        Some(v) if v == enable => Vote::Enable,
        Some(v) if v == disable => Vote::Disable,
        _ => Vote::Abstain,
    }
}

fn newer(candidate: Option<Timestamp>, current: Option<Timestamp>) -> bool {
    match (candidate, current) {
        (Some(c), Some(cur)) => c > cur,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Settle readings taken in declared order: the first definitive reading
/// stands unless a later one disagrees and was written more recently.
pub fn resolve_scoped(readings: &[ScopedReading]) -> Option<ScopedReading> {
    let mut definitive = readings.iter().filter(|r| r.vote.is_definitive());
    let mut winner = *definitive.next()?;
    for reading in definitive {
        if reading.vote != winner.vote && newer(reading.modified, winner.modified) {
            winner = *reading;
        }
    }
    Some(winner)
}

/// Quorum decision over non-abstaining votes.
///
/// `Some(true)` iff the enable share reaches `threshold` and the disable
/// share does not (and symmetrically for `Some(false)`).
pub fn vote(votes: &[Vote], threshold: f64) -> Option<bool> {
    let enable = votes.iter().filter(|v| **v == Vote::Enable).count();
    let disable = votes.iter().filter(|v| **v == Vote::Disable).count();
    let total = enable + disable;
    if total == 0 {
        return None;
    }
    let enable_ok = enable as f64 / total as f64 >= threshold;
    let disable_ok = disable as f64 / total as f64 >= threshold;
    match (enable_ok, disable_ok) {
        (true, false) => Some(true),
        (false, true) => Some(false),
        _ => None,
    }
}

/// Pick the block carrying the strongest signal among `candidates`
/// (`(position in rule, block)` pairs, 0-based positions).
///
/// Integer blocks first, then the 1-based `decider_index`, then the earlier
/// canonical scope, then file order.
pub fn select_best_signal(candidates: &[(usize, &WriteBlock)], decider_index: usize) -> Option<usize> {
    candidates
        .iter()
        .min_by_key(|(pos, block)| {
            (
                block.enable.kind() != ValueKind::Integer,
                pos + 1 != decider_index,
                block.scope.rank(),
                *pos,
            )
        })
        .map(|(pos, _)| *pos)
}

// ---------------------------------------------------------------------------
// Store-backed reads
// ---------------------------------------------------------------------------

fn probe<S: PersistentStore>(
    store: &S,
    scope: Scope,
    section: &SectionPath,
    name: &str,
    enable: &TypedValue,
    disable: &TypedValue,
) -> ScopedReading {
    let value = store.get(scope, section, name);
    ScopedReading {
        scope,
        vote: classify(value.as_ref(), enable, disable),
        modified: store.last_modified(scope, section),
    }
}

/// Read a single-record rule across its declared scopes.
pub fn read_switch<S: PersistentStore>(
    store: &S,
    record: &SwitchRecord,
    scopes: &[Scope],
    endpoint: &EndpointKey,
    flow: Flow,
    mode: ReadMode,
) -> Reading {
    let section = SectionPath::new(flow, endpoint, record.location.as_str());
    let (enable, disable) = (record.enable_value(), record.disable_value());

    let mut readings = Vec::with_capacity(scopes.len());
    for &scope in scopes {
        let reading = probe(store, scope, &section, &record.value_name, &enable, &disable);
        tracing::debug!(%scope, record = %record.value_name, vote = ?reading.vote, "probed switch");
        if mode == ReadMode::Fast && reading.vote.is_definitive() {
            return Reading {
                state: reading.vote.state(),
                scope: Some(scope),
            };
        }
        readings.push(reading);
    }

    resolve_scoped(&readings).map_or(Reading::UNKNOWN, |r| Reading {
        state: r.vote.state(),
        scope: Some(r.scope),
    })
}

/// Read one write block: its recorded scope, then the alternate scope.
pub fn read_block<S: PersistentStore>(
    store: &S,
    block: &WriteBlock,
    endpoint: &EndpointKey,
    flow: Flow,
) -> Option<ScopedReading> {
    let section = SectionPath::new(flow, endpoint, block.location.as_str());
    let readings = [block.scope, block.scope.alternate()]
        .map(|scope| probe(store, scope, &section, &block.name, &block.enable, &block.disable));
    resolve_scoped(&readings)
}

/// Outcome of reading every applicable block of a multi-record rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Tally {
    pub enable: usize,
    pub disable: usize,
    pub abstain: usize,
    /// The quorum decision, if decisive.
    pub decision: Option<bool>,
    /// Best-signal block position and its own reading.
    pub best: Option<(usize, Option<ScopedReading>)>,
}

impl Tally {
    pub fn reading(&self) -> Reading {
        let best_reading = self.best.and_then(|(_, r)| r);
        match self.decision {
            Some(enabled) => Reading {
                state: ToggleState::from_bool(enabled),
                scope: best_reading.map(|r| r.scope),
            },
            None => best_reading.map_or(Reading::UNKNOWN, |r| Reading {
                state: r.vote.state(),
                scope: Some(r.scope),
            }),
        }
    }
}

/// Blocks of `multi` that apply to `endpoint`, with their positions.
pub fn applicable_blocks<'a>(multi: &'a MultiRecord, endpoint: &EndpointKey) -> Vec<(usize, &'a WriteBlock)> {
    multi
        .blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| b.device_scope.applies_to(endpoint))
        .collect()
}

/// Full quorum read of a multi-record rule.
pub fn tally<S: PersistentStore>(store: &S, multi: &MultiRecord, endpoint: &EndpointKey, flow: Flow) -> Tally {
    let blocks = applicable_blocks(multi, endpoint);
    let mut votes = Vec::with_capacity(blocks.len());
    let mut readings = Vec::with_capacity(blocks.len());
    for (pos, block) in &blocks {
        let reading = read_block(store, block, endpoint, flow);
        votes.push(reading.map_or(Vote::Abstain, |r| r.vote));
        readings.push((*pos, reading));
    }

    let decision = vote(&votes, multi.quorum_threshold);
    let best = select_best_signal(&blocks, multi.decider_index)
        .and_then(|pos| readings.iter().find(|(p, _)| *p == pos).copied());
    let tally = Tally {
        enable: votes.iter().filter(|v| **v == Vote::Enable).count(),
        disable: votes.iter().filter(|v| **v == Vote::Disable).count(),
        abstain: votes.iter().filter(|v| **v == Vote::Abstain).count(),
        decision,
        best,
    };
    if decision.is_none() {
        tracing::debug!(
            %endpoint,
            enable = tally.enable,
            disable = tally.disable,
            abstain = tally.abstain,
            threshold = multi.quorum_threshold,
            "quorum inconclusive, using best-signal block"
        );
    }
    tally
}

fn read_multi<S: PersistentStore>(
    store: &S,
    multi: &MultiRecord,
    endpoint: &EndpointKey,
    flow: Flow,
    mode: ReadMode,
) -> Reading {
    if mode == ReadMode::Fast {
        let blocks = applicable_blocks(multi, endpoint);
        if let Some(pos) = select_best_signal(&blocks, multi.decider_index) {
            let block = &multi.blocks[pos];
            let section = SectionPath::new(flow, endpoint, block.location.as_str());
            let recorded = probe(store, block.scope, &section, &block.name, &block.enable, &block.disable);
            if recorded.vote.is_definitive() {
                let alternate = probe(
                    store,
                    block.scope.alternate(),
                    &section,
                    &block.name,
                    &block.enable,
                    &block.disable,
                );
                if let Some(r) = resolve_scoped(&[recorded, alternate]) {
                    return Reading {
                        state: r.vote.state(),
                        scope: Some(r.scope),
                    };
                }
            }
        }
    }
    tally(store, multi, endpoint, flow).reading()
}

/// Read the current state of any rule.
pub fn read_state<S: PersistentStore>(
    store: &S,
    rule: RuleRef<'_>,
    endpoint: &EndpointKey,
    flow: Flow,
    mode: ReadMode,
) -> Reading {
    if let Some(record) = rule.switch() {
        return read_switch(store, record, rule.scopes(), endpoint, flow, mode);
    }
    match rule.multi() {
        Some(multi) => read_multi(store, multi, endpoint, flow, mode),
        None => Reading::UNKNOWN,
    }
}
