//! Engine facade: top-level API for vendorfx.
//!
//! The `Engine` owns the store adapter and the rule cache. Reads and applies
//! work on one shared immutable rule snapshot; learn and delete clone it,
//! modify the copy, and persist it immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::apply::{self, ApplyOutcome};
use crate::config::EngineConfig;
use crate::endpoint::{EndpointKey, Flow};
use crate::error::{FxResult, LearnError, ToggleError};
use crate::learn::extract::main_switch;
use crate::learn::merge::{self, MergeOutcome};
use crate::learn::{CapturePrompt, LearnPhase, LearnSession, LearnTarget, Snapshot};
use crate::matcher;
use crate::reader::{self, ReadMode, ToggleState};
use crate::rules::{RuleCache, RuleDatabase, RuleId, RuleRef, ToggleKind};
use crate::store::{PersistentStore, Scope};

/// Answer to [`Engine::get_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateReport {
    pub state: ToggleState,
    /// Rule section that produced the answer.
    pub source: RuleId,
    /// Scope whose record decided the state.
    pub scope: Option<Scope>,
}

/// Answer to [`Engine::set_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: bool,
    pub verified: bool,
    /// First scope written.
    pub scope: Option<Scope>,
    pub source: RuleId,
    pub state: ToggleState,
    pub blocks_written: usize,
    pub blocks_skipped: usize,
}

/// Answer to [`Engine::learn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LearnReport {
    pub rule_persisted: bool,
    /// Stable candidates found by the diff.
    pub blocks_found: usize,
    pub section: RuleId,
    /// A new section was appended rather than an existing one extended.
    pub created: bool,
}

/// Answer to [`Engine::delete_association`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub endpoint: EndpointKey,
    /// Rules the endpoint was removed from.
    pub rules: Vec<RuleId>,
    pub persisted: bool,
}

/// One row of [`Engine::list_fx`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FxListing {
    pub name: String,
    pub state: ToggleState,
    pub source: RuleId,
}

/// The vendor toggle engine.
pub struct Engine<S: PersistentStore> {
    config: EngineConfig,
    store: S,
    rules: RuleCache,
}

impl<S: PersistentStore> Engine<S> {
    /// Create an engine over a store and a rule file (loaded lazily).
    pub fn new(config: EngineConfig, rules_path: impl Into<PathBuf>, store: S) -> Self {
        let rules_path = rules_path.into();
        tracing::debug!(rules = %rules_path.display(), "initializing vendorfx engine");
        let rules = RuleCache::new(rules_path, config.quorum());
        Self { config, store, rules }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn rules_path(&self) -> &Path {
        self.rules.path()
    }

    /// Current rule snapshot (reloaded when the file changed).
    pub fn rules(&self) -> FxResult<Arc<RuleDatabase>> {
        Ok(self.rules.snapshot()?)
    }

    fn resolve<'a>(
        &self,
        db: &'a RuleDatabase,
        endpoint: &EndpointKey,
        flow: Flow,
        kind: &ToggleKind,
    ) -> Option<RuleRef<'a>> {
        match kind {
            ToggleKind::Main => matcher::find_main(&self.store, db, endpoint, flow).map(RuleRef::Main),
            ToggleKind::Fx(name) => matcher::find_fx(&self.store, db, endpoint, flow, name).map(RuleRef::Fx),
        }
    }

    fn no_match(endpoint: &EndpointKey, kind: &ToggleKind) -> ToggleError {
        ToggleError::NoMatchingRule {
            endpoint: endpoint.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Whether some rule currently describes this toggle on this endpoint.
    pub fn is_supported(&self, endpoint: &EndpointKey, flow: Flow, kind: &ToggleKind) -> FxResult<bool> {
        let db = self.rules()?;
        Ok(self.resolve(&db, endpoint, flow, kind).is_some())
    }

    /// Read the toggle's state.
    pub fn get_state(
        &self,
        endpoint: &EndpointKey,
        flow: Flow,
        kind: &ToggleKind,
        mode: ReadMode,
    ) -> FxResult<StateReport> {
        let db = self.rules()?;
        let rule = self
            .resolve(&db, endpoint, flow, kind)
            .ok_or_else(|| Self::no_match(endpoint, kind))?;
        let reading = reader::read_state(&self.store, rule, endpoint, flow, mode);
        Ok(StateReport {
            state: reading.state,
            source: rule.id().clone(),
            scope: reading.scope,
        })
    }

    /// Set the toggle and verify the result.
    pub fn set_state(
        &self,
        endpoint: &EndpointKey,
        flow: Flow,
        kind: &ToggleKind,
        desired: bool,
    ) -> FxResult<ApplyReport> {
        let db = self.rules()?;
        let rule = self
            .resolve(&db, endpoint, flow, kind)
            .ok_or_else(|| Self::no_match(endpoint, kind))?;
        let ApplyOutcome {
            applied,
            verified,
            scopes,
            state,
            blocks_written,
            blocks_skipped,
        } = apply::apply(&self.store, rule, endpoint, flow, desired, &self.config.verify_policy())?;
        Ok(ApplyReport {
            applied,
            verified,
            scope: scopes.first().copied(),
            source: rule.id().clone(),
            state,
            blocks_written,
            blocks_skipped,
        })
    }

    /// Every effect that currently applies to the endpoint, with its state.
    pub fn list_fx(&self, endpoint: &EndpointKey, flow: Flow, mode: ReadMode) -> FxResult<Vec<FxListing>> {
        let db = self.rules()?;
        Ok(matcher::list_fx(&self.store, &db, endpoint, flow)
            .into_iter()
            .map(|rule| FxListing {
                name: rule.fx_name.clone(),
                state: reader::read_state(&self.store, RuleRef::Fx(rule), endpoint, flow, mode).state,
                source: rule.id.clone(),
            })
            .collect())
    }

    /// Capture the endpoint's namespace as the learner sees it.
    pub fn snapshot(&self, endpoint: &EndpointKey, flow: Flow) -> Snapshot {
        Snapshot::capture(&self.store, endpoint, flow)
    }

    /// Run a full learn: four prompted captures, extract, merge, persist.
    pub fn learn<P: CapturePrompt + ?Sized>(&self, target: LearnTarget, prompt: &mut P) -> FxResult<LearnReport> {
        let mut session = LearnSession::new(target);
        self.resume_learn(&mut session, prompt)
    }

    /// Continue a learn from whatever phase `session` is in.
    pub fn resume_learn<P: CapturePrompt + ?Sized>(
        &self,
        session: &mut LearnSession,
        prompt: &mut P,
    ) -> FxResult<LearnReport> {
        if session.phase() == LearnPhase::Idle {
            session.start()?;
        }
        while session.phase().is_capture() {
            let phase = session.phase();
            if !prompt.ready(phase) {
                session.abort();
                tracing::info!(endpoint = %session.target.endpoint, %phase, "learn aborted");
                return Err(LearnError::Aborted {
                    phase: phase.to_string(),
                }
                .into());
            }
            session.capture(&self.store, self.config.sampling())?;
            prompt.captured(session);
        }

        let candidates = session.extract()?;
        let target = session.target.clone();
        let mut db = (*self.rules()?).clone();
        let outcome: MergeOutcome = match &target.kind {
            ToggleKind::Main => match main_switch(&candidates, target.endpoint.as_str()) {
                Ok(learned) => merge::merge_main(&mut db, &target, learned),
                Err(e) => {
                    session.abort();
                    return Err(e.into());
                }
            },
            ToggleKind::Fx(name) => merge::merge_fx(&mut db, &target, name, &candidates),
        };

        self.rules.store(db)?;
        session.mark_persisted()?;
        tracing::info!(
            endpoint = %target.endpoint,
            kind = %target.kind,
            rule = %outcome.section,
            candidates = candidates.len(),
            "learned rule persisted"
        );
        Ok(LearnReport {
            rule_persisted: true,
            blocks_found: candidates.len(),
            section: outcome.section,
            created: outcome.created,
        })
    }

    /// Unscope the endpoint from every rule of `kind` that lists it or
    /// matches it by signature. Rules themselves are kept.
    pub fn delete_association(&self, endpoint: &EndpointKey, kind: &ToggleKind) -> FxResult<DeleteReport> {
        let snapshot = self.rules()?;
        let matches_any_flow = |rule: RuleRef<'_>| {
            Flow::ALL.into_iter().filter(|f| rule.allows_flow(*f)).any(|flow| match rule {
                RuleRef::Main(m) => matcher::main_signature_matches(&self.store, m, endpoint, flow),
                RuleRef::Fx(f) => matcher::fx_signature_matches(&self.store, f, endpoint, flow),
            })
        };

        let ids: Vec<RuleId> = snapshot
            .rules()
            .map(|r| r.view())
            .filter(|r| match (kind, r) {
                (ToggleKind::Main, RuleRef::Main(_)) => true,
                (ToggleKind::Fx(name), RuleRef::Fx(f)) => f.is_named(name),
                _ => false,
            })
            .filter(|r| !r.membership().excludes(endpoint))
            .filter(|r| r.membership().lists(endpoint) || matches_any_flow(*r))
            .map(|r| r.id().clone())
            .collect();

        if ids.is_empty() {
            return Err(Self::no_match(endpoint, kind).into());
        }

        let mut db = (*snapshot).clone();
        for id in &ids {
            merge::delete_endpoint(&mut db, id, endpoint);
        }
        self.rules.store(db)?;
        Ok(DeleteReport {
            endpoint: endpoint.clone(),
            rules: ids,
            persisted: true,
        })
    }
}

impl<S: PersistentStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("rules", &self.rules.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, SectionPath, TypedValue};

    fn engine(dir: &tempfile::TempDir, rules: &str) -> Engine<MemStore> {
        let path = dir.path().join("vendor_toggles.ini");
        std::fs::write(&path, rules).unwrap();
        Engine::new(EngineConfig::immediate(), path, MemStore::new())
    }

    #[test]
    fn unsupported_endpoint_reports_no_match() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(&dir, "");
        let e = EndpointKey::parse("{e}").unwrap();
        assert!(!engine.is_supported(&e, Flow::Render, &ToggleKind::Main).unwrap());
        let err = engine
            .get_state(&e, Flow::Render, &ToggleKind::Main, ReadMode::Full)
            .unwrap_err();
        assert!(matches!(err, crate::error::FxError::Toggle(ToggleError::NoMatchingRule { .. })));
    }

    #[test]
    fn aborted_learn_persists_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(&dir, "; empty\n");
        let e = EndpointKey::parse("{e}").unwrap();
        let target = LearnTarget {
            endpoint: e,
            flow: Flow::Render,
            kind: ToggleKind::Main,
            device_name: String::new(),
        };
        let mut prompt = |phase: LearnPhase| phase != LearnPhase::CaptureA2;
        let err = engine.learn(target, &mut prompt).unwrap_err();
        assert!(matches!(err, crate::error::FxError::Learn(LearnError::Aborted { .. })));
        assert_eq!(std::fs::read_to_string(engine.rules_path()).unwrap(), "; empty\n");
    }

    #[test]
    fn list_fx_reports_state_per_effect() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(
            &dir,
            "[fx_echo]\ntype = fx\nfx_name = Echo\nvalue_name = {g},1\ndword_enable = 1\ndword_disable = 0\ndevices = {e}\n",
        );
        let e = EndpointKey::parse("{e}").unwrap();
        let section = SectionPath::new(Flow::Capture, &e, "FxProperties");
        engine.store().insert(Scope::User, &section, "{g},1", TypedValue::Integer(1));

        let fx = engine.list_fx(&e, Flow::Capture, ReadMode::Full).unwrap();
        assert_eq!(fx.len(), 1);
        assert_eq!(fx[0].name, "Echo");
        assert_eq!(fx[0].state, ToggleState::Enabled);
    }
}
