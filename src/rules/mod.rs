//! Rule model: Main rules, FX rules and their write blocks.
//!
//! A rule describes how one vendor driver stores one on/off feature. Rules
//! live in an INI-style file (see [`database`]) and are matched against
//! endpoints by live signature rather than by membership alone.

pub mod codec;
pub mod database;
pub mod ini;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointKey, Flow};
use crate::store::{Scope, TypedValue};

pub use database::{LoadReport, RuleCache, RuleDatabase};

/// Default location for records learned without an explicit one.
pub const DEFAULT_LOCATION: &str = "FxProperties";

/// Default multi-record agreement threshold.
pub const DEFAULT_QUORUM: f64 = 0.60;

/// Bounds applied to every loaded quorum threshold.
pub const QUORUM_BOUNDS: (f64, f64) = (0.50, 0.95);

/// Clamp a quorum threshold into [`QUORUM_BOUNDS`]. NaN maps to the default.
pub fn clamp_quorum(threshold: f64) -> f64 {
    if threshold.is_nan() {
        return DEFAULT_QUORUM;
    }
    threshold.clamp(QUORUM_BOUNDS.0, QUORUM_BOUNDS.1)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Rule identifier: the rule file section name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which feature a caller is asking about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToggleKind {
    /// The overall enhancements switch.
    Main,
    /// A named effect (matched case-insensitively).
    Fx(String),
}

impl ToggleKind {
    pub fn fx(name: impl Into<String>) -> Self {
        Self::Fx(name.into())
    }
}

impl fmt::Display for ToggleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main"),
            Self::Fx(name) => write!(f, "fx \"{name}\""),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

/// A single integer record with its two known payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchRecord {
    /// Lower-cased record name, e.g. `{fmtid},pid`.
    pub value_name: String,
    /// Fixed section the record was learned under.
    pub location: String,
    pub enable: u32,
    pub disable: u32,
}

impl SwitchRecord {
    pub fn enable_value(&self) -> TypedValue {
        TypedValue::Integer(self.enable)
    }

    pub fn disable_value(&self) -> TypedValue {
        TypedValue::Integer(self.disable)
    }

    pub fn payload(&self, enabled: bool) -> TypedValue {
        if enabled { self.enable_value() } else { self.disable_value() }
    }
}

/// Endpoint bookkeeping shared by every rule kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    /// Endpoints this rule was learned on or merged into.
    pub devices: BTreeSet<EndpointKey>,
    /// Endpoints the user explicitly removed; never matched by signature.
    pub excluded: BTreeSet<EndpointKey>,
}

impl Membership {
    pub fn lists(&self, endpoint: &EndpointKey) -> bool {
        self.devices.contains(endpoint)
    }

    pub fn excludes(&self, endpoint: &EndpointKey) -> bool {
        self.excluded.contains(endpoint)
    }

    /// Record the endpoint as a member, lifting any earlier exclusion.
    pub fn adopt(&mut self, endpoint: &EndpointKey) {
        self.excluded.remove(endpoint);
        self.devices.insert(endpoint.clone());
    }

    /// Drop the endpoint and remember that it was removed on purpose.
    pub fn release(&mut self, endpoint: &EndpointKey) {
        self.devices.remove(endpoint);
        self.excluded.insert(endpoint.clone());
    }
}

/// Per-block endpoint scoping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceScope {
    /// No `write{i}_devices` line: applies wherever the rule applies.
    Universal,
    /// Present but empty: applies to no endpoint.
    Nobody,
    /// Present and non-empty: applies only to these endpoints.
    Only(BTreeSet<EndpointKey>),
}

impl DeviceScope {
    /// Build an explicit scope, collapsing an empty set to [`DeviceScope::Nobody`].
    pub fn only(keys: impl IntoIterator<Item = EndpointKey>) -> Self {
        let set: BTreeSet<EndpointKey> = keys.into_iter().collect();
        if set.is_empty() { Self::Nobody } else { Self::Only(set) }
    }

    pub fn applies_to(&self, endpoint: &EndpointKey) -> bool {
        match self {
            Self::Universal => true,
            Self::Nobody => false,
            Self::Only(keys) => keys.contains(endpoint),
        }
    }

    /// Add an endpoint. Universal stays universal.
    pub fn include(&mut self, endpoint: &EndpointKey) {
        match self {
            Self::Universal => {}
            Self::Nobody => *self = Self::only([endpoint.clone()]),
            Self::Only(keys) => {
                keys.insert(endpoint.clone());
            }
        }
    }

    /// Remove an endpoint. A universal scope is materialized as
    /// `members - endpoint` so every other member keeps its behavior.
    pub fn exclude(&mut self, endpoint: &EndpointKey, members: &BTreeSet<EndpointKey>) -> bool {
        match self {
            Self::Universal => {
                *self = Self::only(members.iter().filter(|k| *k != endpoint).cloned());
                true
            }
            Self::Nobody => false,
            Self::Only(keys) => {
                if !keys.remove(endpoint) {
                    return false;
                }
                if keys.is_empty() {
                    *self = Self::Nobody;
                }
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Single-record rule for the overall enhancements switch.
#[derive(Debug, Clone, PartialEq)]
pub struct MainRule {
    pub id: RuleId,
    pub record: SwitchRecord,
    /// Write preference and read fallback order.
    pub scopes: Vec<Scope>,
    pub flows: Vec<Flow>,
    pub membership: Membership,
    pub notes: String,
}

/// One record of a multi-record FX rule.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBlock {
    pub scope: Scope,
    pub location: String,
    /// Lower-cased record name.
    pub name: String,
    pub enable: TypedValue,
    pub disable: TypedValue,
    pub device_scope: DeviceScope,
}

impl WriteBlock {
    pub fn payload(&self, enabled: bool) -> &TypedValue {
        if enabled { &self.enable } else { &self.disable }
    }

    /// Same (scope, location, name) record.
    pub fn same_identity(&self, other: &WriteBlock) -> bool {
        self.scope == other.scope
            && self.location.eq_ignore_ascii_case(&other.location)
            && self.name == other.name
    }

    /// Same record, same value types, same payload pair.
    pub fn same_payload(&self, other: &WriteBlock) -> bool {
        self.same_identity(other) && self.enable == other.enable && self.disable == other.disable
    }
}

/// Multi-record body of an FX rule.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiRecord {
    /// 1-based preferred primary block.
    pub decider_index: usize,
    /// Clamped to [`QUORUM_BOUNDS`].
    pub quorum_threshold: f64,
    pub blocks: Vec<WriteBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FxBody {
    /// Legacy single integer record.
    Legacy(SwitchRecord),
    Multi(MultiRecord),
}

/// Rule controlling one named effect.
#[derive(Debug, Clone, PartialEq)]
pub struct FxRule {
    pub id: RuleId,
    pub fx_name: String,
    /// Informational; recorded at learn time.
    pub device_name_pattern: String,
    pub scopes: Vec<Scope>,
    pub flows: Vec<Flow>,
    pub membership: Membership,
    pub notes: String,
    pub body: FxBody,
}

impl FxRule {
    pub fn is_named(&self, name: &str) -> bool {
        self.fx_name.trim().eq_ignore_ascii_case(name.trim())
    }

    pub fn multi(&self) -> Option<&MultiRecord> {
        match &self.body {
            FxBody::Multi(m) => Some(m),
            FxBody::Legacy(_) => None,
        }
    }
}

/// Any rule held by the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Main(MainRule),
    Fx(FxRule),
}

impl Rule {
    pub fn id(&self) -> &RuleId {
        match self {
            Self::Main(r) => &r.id,
            Self::Fx(r) => &r.id,
        }
    }

    pub fn view(&self) -> RuleRef<'_> {
        match self {
            Self::Main(r) => RuleRef::Main(r),
            Self::Fx(r) => RuleRef::Fx(r),
        }
    }
}

/// Borrowed view over a rule, as handed to the reader and applier.
#[derive(Debug, Clone, Copy)]
pub enum RuleRef<'a> {
    Main(&'a MainRule),
    Fx(&'a FxRule),
}

impl<'a> RuleRef<'a> {
    pub fn id(&self) -> &'a RuleId {
        match self {
            Self::Main(r) => &r.id,
            Self::Fx(r) => &r.id,
        }
    }

    pub fn scopes(&self) -> &'a [Scope] {
        match self {
            Self::Main(r) => &r.scopes,
            Self::Fx(r) => &r.scopes,
        }
    }

    pub fn flows(&self) -> &'a [Flow] {
        match self {
            Self::Main(r) => &r.flows,
            Self::Fx(r) => &r.flows,
        }
    }

    pub fn membership(&self) -> &'a Membership {
        match self {
            Self::Main(r) => &r.membership,
            Self::Fx(r) => &r.membership,
        }
    }

    /// The single record, for Main and legacy FX rules.
    pub fn switch(&self) -> Option<&'a SwitchRecord> {
        match self {
            Self::Main(r) => Some(&r.record),
            Self::Fx(r) => match &r.body {
                FxBody::Legacy(rec) => Some(rec),
                FxBody::Multi(_) => None,
            },
        }
    }

    pub fn multi(&self) -> Option<&'a MultiRecord> {
        match self {
            Self::Main(_) => None,
            Self::Fx(r) => r.multi(),
        }
    }

    /// An empty flow list means "any flow".
    pub fn allows_flow(&self, flow: Flow) -> bool {
        let flows = self.flows();
        flows.is_empty() || flows.contains(&flow)
    }
}
