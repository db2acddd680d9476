//! Persistent store adapter boundary.
//!
//! Vendors keep their toggles in a registry-like key/value store partitioned
//! by [`Scope`] (two overlapping namespaces, one elevation-gated) and by
//! section (a named sub-group under one endpoint). The engine only ever talks
//! to that store through [`PersistentStore`], so every algorithm can be
//! exercised against [`MemStore`] without an OS dependency.
//!
//! - [`MemStore`]: in-memory adapter (tests, benches, discovery dry-runs)
//! - [`JsonFileStore`]: [`MemStore`] persisted as a JSON document on every write

pub mod json;
pub mod mem;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::endpoint::{EndpointKey, Flow};
use crate::error::StoreError;

pub use json::JsonFileStore;
pub use mem::{MemStore, SectionDump, WriteRecord};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store-defined modification clock. Only ordering matters.
pub type Timestamp = u64;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// One of the two overlapping store partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Per-user partition (`HKCU`).
    #[serde(rename = "HKCU")]
    User,
    /// Machine-wide partition (`HKLM`); writes usually need elevation.
    #[serde(rename = "HKLM")]
    Machine,
}

impl Scope {
    /// Canonical preference order.
    pub const CANONICAL: [Scope; 2] = [Scope::User, Scope::Machine];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "HKCU",
            Self::Machine => "HKLM",
        }
    }

    /// The other partition.
    pub fn alternate(self) -> Self {
        match self {
            Self::User => Self::Machine,
            Self::Machine => Self::User,
        }
    }

    /// Position in [`Scope::CANONICAL`]; lower is preferred.
    pub fn rank(self) -> usize {
        match self {
            Self::User => 0,
            Self::Machine => 1,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HKCU" | "USER" => Ok(Self::User),
            "HKLM" | "MACHINE" => Ok(Self::Machine),
            other => Err(format!("unknown scope: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

/// Value type of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    #[serde(rename = "REG_DWORD")]
    Integer,
    #[serde(rename = "REG_SZ")]
    Text,
    #[serde(rename = "REG_BINARY")]
    Binary,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "REG_DWORD",
            Self::Text => "REG_SZ",
            Self::Binary => "REG_BINARY",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REG_DWORD" | "DWORD" | "INTEGER" => Ok(Self::Integer),
            "REG_SZ" | "SZ" | "TEXT" => Ok(Self::Text),
            "REG_BINARY" | "BINARY" => Ok(Self::Binary),
            other => Err(format!("unsupported value type: {other:?}")),
        }
    }
}

/// A record value as stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TypedValue {
    #[serde(rename = "REG_DWORD")]
    Integer(u32),
    #[serde(rename = "REG_SZ")]
    Text(String),
    #[serde(rename = "REG_BINARY")]
    Binary(Vec<u8>),
}

impl TypedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Integer(_) => ValueKind::Integer,
            Self::Text(_) => ValueKind::Text,
            Self::Binary(_) => ValueKind::Binary,
        }
    }

    /// Rule-file text form: decimal for integers, verbatim text,
    /// `hex:aa,bb,...` for binary.
    pub fn encode(&self) -> String {
        match self {
            Self::Integer(v) => v.to_string(),
            Self::Text(s) => s.clone(),
            Self::Binary(bytes) => {
                let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
                format!("hex:{}", hex.join(","))
            }
        }
    }

    /// Parse the rule-file text form for a given kind.
    ///
    /// Binary accepts both `hex:aa,bb` and bare `aabb`.
    pub fn decode(kind: ValueKind, text: &str) -> Result<Self, String> {
        match kind {
            ValueKind::Integer => {
                let t = text.trim();
                let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => t.parse::<u32>(),
                };
                parsed
                    .map(Self::Integer)
                    .map_err(|e| format!("invalid integer {t:?}: {e}"))
            }
            ValueKind::Text => Ok(Self::Text(text.to_string())),
            ValueKind::Binary => {
                let t = text.trim().to_ascii_lowercase();
                let body = t.strip_prefix("hex:").unwrap_or(&t);
                let digits: String = body
                    .chars()
                    .filter(|c| *c != ',' && !c.is_whitespace())
                    .collect();
                if !digits.is_ascii() || digits.len() % 2 != 0 {
                    return Err(format!("expected pairs of hex digits in {text:?}"));
                }
                (0..digits.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map(Self::Binary)
                    .map_err(|e| format!("invalid hex in {text:?}: {e}"))
            }
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.encode())
    }
}

// ---------------------------------------------------------------------------
// Sections and the adapter trait
// ---------------------------------------------------------------------------

/// Address of one section: a named location under one endpoint of one flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionPath {
    pub flow: Flow,
    pub endpoint: EndpointKey,
    pub location: String,
}

impl SectionPath {
    pub fn new(flow: Flow, endpoint: &EndpointKey, location: impl Into<String>) -> Self {
        Self {
            flow,
            endpoint: endpoint.clone(),
            location: location.into(),
        }
    }
}

impl fmt::Display for SectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}\\{}", self.flow, self.endpoint, self.location)
    }
}

/// Registry-like key/value store the engine reads and writes.
///
/// Adapters swallow their own I/O failures on reads (a failed read is an
/// absent record) and report write failures through [`StoreError`].
/// Record names are case-insensitive.
pub trait PersistentStore {
    /// Read one record.
    fn get(&self, scope: Scope, section: &SectionPath, name: &str) -> Option<TypedValue>;

    /// Write one record into an existing section.
    ///
    /// Must fail with [`StoreError::SectionMissing`] rather than create the
    /// section, and with [`StoreError::PermissionDenied`] for protected scopes.
    fn set(
        &self,
        scope: Scope,
        section: &SectionPath,
        name: &str,
        value: &TypedValue,
    ) -> StoreResult<()>;

    /// All records of one section, sorted by name.
    fn enumerate(&self, scope: Scope, section: &SectionPath) -> Vec<(String, TypedValue)>;

    /// Names of every section that exists under one endpoint in one scope.
    fn sections(&self, scope: Scope, flow: Flow, endpoint: &EndpointKey) -> Vec<String>;

    /// Last-modified time of a section, if the adapter can tell.
    fn last_modified(&self, scope: Scope, section: &SectionPath) -> Option<Timestamp>;
}

impl<S: PersistentStore + ?Sized> PersistentStore for &S {
    fn get(&self, scope: Scope, section: &SectionPath, name: &str) -> Option<TypedValue> {
        (**self).get(scope, section, name)
    }

    fn set(
        &self,
        scope: Scope,
        section: &SectionPath,
        name: &str,
        value: &TypedValue,
    ) -> StoreResult<()> {
        (**self).set(scope, section, name, value)
    }

    fn enumerate(&self, scope: Scope, section: &SectionPath) -> Vec<(String, TypedValue)> {
        (**self).enumerate(scope, section)
    }

    fn sections(&self, scope: Scope, flow: Flow, endpoint: &EndpointKey) -> Vec<String> {
        (**self).sections(scope, flow, endpoint)
    }

    fn last_modified(&self, scope: Scope, section: &SectionPath) -> Option<Timestamp> {
        (**self).last_modified(scope, section)
    }
}
