// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # vendorfx
//!
//! A rule engine that reads, sets and learns vendor audio-enhancement toggles
//! (the overall enhancements switch and individual named effects) stored as
//! typed records in a registry-like persistent store.
//!
//! ## Architecture
//!
//! - **Store adapters** (`store`): the [`store::PersistentStore`] seam, an
//!   in-memory DashMap store and a JSON-file store
//! - **Rule database** (`rules`): loss-free INI rule file with per-section
//!   round-tripping and an mtime-checked snapshot cache
//! - **Matcher** (`matcher`): explicit device lists first, then signature probes
//! - **Reader** (`reader`): scope tie-break and weighted quorum voting
//! - **Applier** (`apply`): scope fallback, multi-record writes, verification
//! - **Learner** (`learn`): four-capture diff, candidate ranking, append-only merge
//!
//! ## Library usage
//!
//! ```no_run
//! use vendorfx::config::EngineConfig;
//! use vendorfx::endpoint::{EndpointKey, Flow};
//! use vendorfx::engine::Engine;
//! use vendorfx::reader::ReadMode;
//! use vendorfx::rules::ToggleKind;
//! use vendorfx::store::JsonFileStore;
//!
//! let store = JsonFileStore::open("store.json").unwrap();
//! let engine = Engine::new(EngineConfig::default(), "vendor_toggles.ini", store);
//! let endpoint = EndpointKey::from_handle("{0.0.0.00000000}.{5c1a7f2e-0b1d-4c55-9e0a-2f3b4c5d6e7f}").unwrap();
//! let state = engine.get_state(&endpoint, Flow::Render, &ToggleKind::Main, ReadMode::Full).unwrap();
//! println!("{}", state.state);
//! ```

pub mod apply;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod learn;
pub mod matcher;
pub mod paths;
pub mod reader;
pub mod rules;
pub mod store;
