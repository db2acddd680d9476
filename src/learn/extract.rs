//! Stable candidate extraction from four snapshots.

use std::collections::BTreeSet;

use crate::error::LearnError;
use crate::rules::SwitchRecord;
use crate::store::{Scope, TypedValue};

use super::{RecordId, Snapshot};

/// A record that flipped consistently between state A (on) and B (off).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: RecordId,
    /// Value in the authoritative A capture: the enable payload.
    pub enable: TypedValue,
    /// Value in the authoritative B capture: the disable payload.
    pub disable: TypedValue,
}

impl Candidate {
    /// Lower sorts first: 0/1 integer flips, other integers, text, binary.
    fn strength(&self) -> u8 {
        match (&self.enable, &self.disable) {
            (TypedValue::Integer(a), TypedValue::Integer(b)) if *a <= 1 && *b <= 1 => 0,
            (TypedValue::Integer(_), _) => 1,
            (TypedValue::Text(_), _) => 2,
            (TypedValue::Binary(_), _) => 3,
        }
    }
}

/// Diff the captures.
///
/// A record is a candidate iff it is present in both A2 and B2 with the same
/// value kind and different values, and, where the priming pair saw it in
/// both captures, A1/B1 paired the same way. Records missing from A1 or B1
/// are accepted: drivers often create them on the first flip.
pub fn extract(a1: &Snapshot, b1: &Snapshot, a2: &Snapshot, b2: &Snapshot) -> Vec<Candidate> {
    let ids: BTreeSet<&RecordId> = a2.records.iter().chain(&b2.records).map(|r| &r.id).collect();

    let mut candidates: Vec<Candidate> = ids
        .into_iter()
        .filter_map(|id| {
            let (a, b) = (a2.get(id)?, b2.get(id)?);
            if a.kind() != b.kind() || a == b {
                return None;
            }
            if let (Some(pa), Some(pb)) = (a1.get(id), b1.get(id)) {
                if pa != a || pb != b {
                    tracing::debug!(record = %id, "flip not reproduced by priming captures");
                    return None;
                }
            }
            Some(Candidate {
                id: id.clone(),
                enable: a.clone(),
                disable: b.clone(),
            })
        })
        .collect();

    candidates.sort_by(|x, y| {
        (x.strength(), x.id.scope.rank(), &x.id.location, &x.id.name)
            .cmp(&(y.strength(), y.id.scope.rank(), &y.id.location, &y.id.name))
    });
    candidates
}

/// A main-switch identity and the scopes it was seen in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainSwitch {
    pub record: SwitchRecord,
    /// Canonical order.
    pub scopes: Vec<Scope>,
}

/// Collapse candidates to the single integer switch a Main rule needs.
///
/// The same record mirrored in both scopes counts once.
pub fn main_switch(candidates: &[Candidate], endpoint: &str) -> Result<MainSwitch, LearnError> {
    let mut groups: Vec<MainSwitch> = Vec::new();
    for c in candidates {
        let (TypedValue::Integer(enable), TypedValue::Integer(disable)) = (&c.enable, &c.disable) else {
            continue;
        };
        let record = SwitchRecord {
            value_name: c.id.name.clone(),
            location: c.id.location.clone(),
            enable: *enable,
            disable: *disable,
        };
        let existing = groups.iter_mut().find(|g| {
            g.record.value_name == record.value_name
                && g.record.location.eq_ignore_ascii_case(&record.location)
                && g.record.enable == record.enable
                && g.record.disable == record.disable
        });
        match existing {
            Some(group) => {
                if !group.scopes.contains(&c.id.scope) {
                    group.scopes.push(c.id.scope);
                    group.scopes.sort_by_key(|s| s.rank());
                }
            }
            None => groups.push(MainSwitch {
                record,
                scopes: vec![c.id.scope],
            }),
        }
    }

    match groups.len() {
        0 => Err(LearnError::LearningNoStableCandidate {
            endpoint: endpoint.to_string(),
        }),
        1 => Ok(groups.remove(0)),
        count => Err(LearnError::AmbiguousMainSwitch {
            count,
            records: groups
                .iter()
                .map(|g| format!("{}\\{}", g.record.location, g.record.value_name))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}
