//! Endpoint identity: the stable key extracted from a device handle, and the
//! endpoint flow (render or capture).
//!
//! Rules never store full device handles. A handle such as
//! `{0.0.1.00000000}.{83a9be54-901e-4429-993b-c9088e3028a0}` is reduced to its
//! trailing `{guid}` component, lower-cased, and that key is what rule files,
//! write-block scopes and store sections are keyed by.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ToggleError;

/// Stable short identifier for one audio endpoint (`{guid}`, lower-cased).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Extract the endpoint key from a full device handle or a bare `{guid}`.
    ///
    /// Returns `None` when the handle does not end in a braced hex/dash group.
    pub fn parse(handle: &str) -> Option<Self> {
        let handle = handle.trim();
        let close = handle.strip_suffix('}')?;
        let open = close.rfind('{')?;
        let body = &close[open + 1..];
        if body.is_empty() || !body.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return None;
        }
        // The guid must either be the whole handle or follow a '.' separator.
        if open > 0 && !close[..open].ends_with('.') {
            return None;
        }
        Some(Self(format!("{{{}}}", body.to_ascii_lowercase())))
    }

    /// Like [`parse`](Self::parse) but reports an engine error for bad handles.
    pub fn from_handle(handle: &str) -> Result<Self, ToggleError> {
        Self::parse(handle).ok_or_else(|| ToggleError::InvalidEndpoint {
            handle: handle.to_string(),
        })
    }

    /// Normalize a key listed in a rule file (trimmed, lower-cased).
    ///
    /// Rule files are hand-editable, so listed keys are kept even when they
    /// do not look like a guid; they simply never match a real endpoint.
    pub fn normalized(listed: &str) -> Option<Self> {
        let key = listed.trim().to_ascii_lowercase();
        if key.is_empty() { None } else { Some(Self(key)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Endpoint class a rule may apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flow {
    Render,
    Capture,
}

impl Flow {
    pub const ALL: [Flow; 2] = [Flow::Render, Flow::Capture];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Render => "Render",
            Self::Capture => "Capture",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flow {
    type Err = String;

    /// Accepts any casing; only the first letter is significant (`r…`/`c…`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('r') => Ok(Self::Render),
            Some('c') => Ok(Self::Capture),
            _ => Err(format!("unknown flow: {s:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_device_handle() {
        let key =
            EndpointKey::parse("{0.0.1.00000000}.{83A9BE54-901E-4429-993B-C9088E3028A0}").unwrap();
        assert_eq!(key.as_str(), "{83a9be54-901e-4429-993b-c9088e3028a0}");
    }

    #[test]
    fn parses_bare_guid() {
        let key = EndpointKey::parse("{abc-123}").unwrap();
        assert_eq!(key.as_str(), "{abc-123}");
    }

    #[test]
    fn rejects_handles_without_guid() {
        assert!(EndpointKey::parse("Speakers (Realtek)").is_none());
        assert!(EndpointKey::parse("{}").is_none());
        assert!(EndpointKey::parse("{0.0.1.0000}x{abcd}").is_none());
        assert!(EndpointKey::from_handle("nope").is_err());
    }

    #[test]
    fn flow_parsing_is_forgiving() {
        assert_eq!("render".parse::<Flow>().unwrap(), Flow::Render);
        assert_eq!("Capture".parse::<Flow>().unwrap(), Flow::Capture);
        assert!("loopback".parse::<Flow>().is_err());
    }
}
