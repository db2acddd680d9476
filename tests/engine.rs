//! End-to-end engine tests against the in-memory store.
//!
//! Each test writes a rule file into a temp dir, seeds a `MemStore` the way a
//! driver would, and drives the public `Engine` API.

use std::path::{Path, PathBuf};

use vendorfx::config::EngineConfig;
use vendorfx::endpoint::{EndpointKey, Flow};
use vendorfx::engine::Engine;
use vendorfx::error::{FxError, LearnError, ToggleError};
use vendorfx::learn::{LearnPhase, LearnTarget};
use vendorfx::reader::{ReadMode, ToggleState};
use vendorfx::rules::{Rule, RuleId, ToggleKind};
use vendorfx::store::{MemStore, PersistentStore, Scope, SectionPath, TypedValue};

const MAIN_RULES: &str = "\
[realtek]
value_name = {l},1
dword_enable = 0
dword_disable = 1
devices =
";

const FX_RULES: &str = "\
[fx_echo]
type = fx
fx_name = Echo
multi_write = 1
write_count = 2
write1_hive = HKCU
write1_name = {g},1
write1_enable = 1
write1_disable = 0
write2_hive = HKLM
write2_name = {g},2
write2_enable = 1
write2_disable = 0
devices = {e}
";

fn key(s: &str) -> EndpointKey {
    EndpointKey::parse(s).unwrap()
}

fn fx_section(endpoint: &EndpointKey) -> SectionPath {
    SectionPath::new(Flow::Render, endpoint, "FxProperties")
}

fn rules_file(dir: &tempfile::TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("vendor_toggles.ini");
    std::fs::write(&path, text).unwrap();
    path
}

fn engine<'a>(path: &Path, store: &'a MemStore) -> Engine<&'a MemStore> {
    Engine::new(EngineConfig::immediate(), path, store)
}

fn target(endpoint: &str, kind: ToggleKind) -> LearnTarget {
    LearnTarget {
        endpoint: key(endpoint),
        flow: Flow::Render,
        kind,
        device_name: "Speakers".into(),
    }
}

// ---------------------------------------------------------------------------
// Read and apply
// ---------------------------------------------------------------------------

#[test]
fn main_rule_reads_sets_and_verifies() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    let e = key("{0.0.0.00000000}.{E}");
    store.insert(Scope::User, &fx_section(&e), "{L},1", TypedValue::Integer(0));
    let engine = engine(&path, &store);

    assert!(engine.is_supported(&e, Flow::Render, &ToggleKind::Main).unwrap());
    let state = engine
        .get_state(&e, Flow::Render, &ToggleKind::Main, ReadMode::Full)
        .unwrap();
    assert_eq!(state.state, ToggleState::Enabled);
    assert_eq!(state.source, RuleId("realtek".into()));
    assert_eq!(state.scope, Some(Scope::User));

    let report = engine.set_state(&e, Flow::Render, &ToggleKind::Main, false).unwrap();
    assert!(report.applied);
    assert!(report.verified);
    assert_eq!(report.state, ToggleState::Disabled);
    assert_eq!(report.scope, Some(Scope::User));
    assert_eq!(
        store.get(Scope::User, &fx_section(&e), "{l},1"),
        Some(TypedValue::Integer(1))
    );
    assert_eq!(store.writes().len(), 1);
}

#[test]
fn setting_the_current_state_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    let e = key("{e}");
    store.insert(Scope::User, &fx_section(&e), "{l},1", TypedValue::Integer(1));
    let engine = engine(&path, &store);

    for _ in 0..2 {
        let report = engine.set_state(&e, Flow::Render, &ToggleKind::Main, false).unwrap();
        assert!(report.verified);
        assert_eq!(report.state, ToggleState::Disabled);
    }
    assert_eq!(
        store.get(Scope::User, &fx_section(&e), "{l},1"),
        Some(TypedValue::Integer(1))
    );
}

#[test]
fn apply_never_creates_records_or_sections() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, FX_RULES);
    let store = MemStore::new();
    let e = key("{e}");
    store.insert(Scope::User, &fx_section(&e), "{g},1", TypedValue::Integer(0));
    let sections_before = store.export().len();
    let engine = engine(&path, &store);

    let report = engine.set_state(&e, Flow::Render, &ToggleKind::fx("echo"), true).unwrap();
    assert!(report.applied && report.verified);
    assert_eq!((report.blocks_written, report.blocks_skipped), (1, 1));

    assert_eq!(store.export().len(), sections_before);
    for scope in Scope::CANONICAL {
        assert_eq!(store.get(scope, &fx_section(&e), "{g},2"), None);
    }
    assert_eq!(store.get(Scope::Machine, &fx_section(&e), "{g},1"), None);
}

#[test]
fn scope_disagreement_goes_to_the_later_write() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    let e = key("{e}");
    let section = fx_section(&e);
    store.insert(Scope::User, &section, "{l},1", TypedValue::Integer(0));
    store.insert(Scope::Machine, &section, "{l},1", TypedValue::Integer(1));
    let engine = engine(&path, &store);
    let read = || {
        engine
            .get_state(&e, Flow::Render, &ToggleKind::Main, ReadMode::Full)
            .unwrap()
    };

    let newer_machine = read();
    assert_eq!(newer_machine.state, ToggleState::Disabled);
    assert_eq!(newer_machine.scope, Some(Scope::Machine));

    store.touch(Scope::User, &section, store.now() + 1);
    assert_eq!(read().state, ToggleState::Enabled);

    // Equal timestamps keep the first declared scope.
    let ts = store.now();
    store.touch(Scope::Machine, &section, ts);
    store.touch(Scope::User, &section, ts);
    let tie = read();
    assert_eq!(tie.state, ToggleState::Enabled);
    assert_eq!(tie.scope, Some(Scope::User));
}

fn quorum_rules(threshold: &str) -> String {
    format!(
        "\
[fx_bass]
type = fx
fx_name = Bass Boost
multi_write = 1
write_count = 3
decider_index = 3
quorum_threshold = {threshold}
write1_hive = HKCU
write1_name = a
write1_enable = 1
write1_disable = 0
write2_hive = HKCU
write2_name = b
write2_enable = 1
write2_disable = 0
write3_hive = HKCU
write3_name = c
write3_enable = 1
write3_disable = 0
devices = {{e}}
"
    )
}

#[test]
fn two_of_three_blocks_carry_the_vote() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = MemStore::new();
    let e = key("{e}");
    let section = fx_section(&e);
    store.insert(Scope::User, &section, "a", TypedValue::Integer(1));
    store.insert(Scope::User, &section, "b", TypedValue::Integer(1));
    store.insert(Scope::User, &section, "c", TypedValue::Integer(0));
    let kind = ToggleKind::fx("bass boost");

    let path = rules_file(&dir, &quorum_rules("0.60"));
    let state = engine(&path, &store)
        .get_state(&e, Flow::Render, &kind, ReadMode::Full)
        .unwrap();
    assert_eq!(state.state, ToggleState::Enabled);

    // 2/3 misses a 0.70 quorum: the decider block (c, off) answers.
    let path = rules_file(&dir, &quorum_rules("0.70"));
    let state = engine(&path, &store)
        .get_state(&e, Flow::Render, &kind, ReadMode::Full)
        .unwrap();
    assert_eq!(state.state, ToggleState::Disabled);

    // Fast mode goes straight to the decider block.
    let state = engine(&path, &store)
        .get_state(&e, Flow::Render, &kind, ReadMode::Fast)
        .unwrap();
    assert_eq!(state.state, ToggleState::Disabled);
}

#[test]
fn sibling_endpoint_matches_by_signature() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    let sibling = key("{f}");
    store.insert(Scope::Machine, &fx_section(&sibling), "{l},1", TypedValue::Integer(1));
    let stranger = key("{0}");
    store.insert(Scope::User, &fx_section(&stranger), "{l},1", TypedValue::Integer(7));
    let engine = engine(&path, &store);

    assert!(engine.is_supported(&sibling, Flow::Render, &ToggleKind::Main).unwrap());
    assert!(!engine.is_supported(&stranger, Flow::Render, &ToggleKind::Main).unwrap());
    let err = engine
        .set_state(&stranger, Flow::Render, &ToggleKind::Main, true)
        .unwrap_err();
    assert!(matches!(err, FxError::Toggle(ToggleError::NoMatchingRule { .. })));
}

#[test]
fn protected_scope_only_is_permission_denied() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    let e = key("{e}");
    store.insert(Scope::Machine, &fx_section(&e), "{l},1", TypedValue::Integer(0));
    store.protect(Scope::Machine);
    let engine = engine(&path, &store);

    let err = engine.set_state(&e, Flow::Render, &ToggleKind::Main, false).unwrap_err();
    assert!(matches!(
        err,
        FxError::Toggle(ToggleError::WritePermissionDenied { .. })
    ));
    assert!(store.writes().is_empty());
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[test]
fn delete_unscopes_only_the_named_endpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(
        &dir,
        "[realtek]\nvalue_name = {l},1\ndword_enable = 0\ndword_disable = 1\ndevices = {e},{f}\n",
    );
    let store = MemStore::new();
    let (e, f) = (key("{e}"), key("{f}"));
    store.insert(Scope::User, &fx_section(&e), "{l},1", TypedValue::Integer(0));
    store.insert(Scope::User, &fx_section(&f), "{l},1", TypedValue::Integer(1));
    let engine = engine(&path, &store);

    let report = engine.delete_association(&e, &ToggleKind::Main).unwrap();
    assert_eq!(report.rules, vec![RuleId("realtek".into())]);
    assert!(report.persisted);

    // E's record still carries a known payload, but the exclusion wins.
    assert!(!engine.is_supported(&e, Flow::Render, &ToggleKind::Main).unwrap());
    let f_state = engine
        .get_state(&f, Flow::Render, &ToggleKind::Main, ReadMode::Full)
        .unwrap();
    assert_eq!(f_state.state, ToggleState::Disabled);

    let db = engine.rules().unwrap();
    let rule = db.main_rules().next().unwrap();
    assert!(rule.membership.lists(&f));
    assert!(!rule.membership.lists(&e));
    assert!(rule.membership.excludes(&e));

    let again = engine.delete_association(&e, &ToggleKind::Main).unwrap_err();
    assert!(matches!(again, FxError::Toggle(ToggleError::NoMatchingRule { .. })));
}

#[test]
fn delete_keeps_the_fx_rule_for_other_endpoints() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(
        &dir,
        &FX_RULES.replace("devices = {e}\n", "devices = {e},{f}\n"),
    );
    let store = MemStore::new();
    let f = key("{f}");
    store.insert(Scope::User, &fx_section(&f), "{g},1", TypedValue::Integer(1));
    let engine = engine(&path, &store);

    engine.delete_association(&key("{e}"), &ToggleKind::fx("Echo")).unwrap();

    let fx = engine.list_fx(&f, Flow::Render, ReadMode::Full).unwrap();
    assert_eq!(fx.len(), 1);
    assert_eq!(fx[0].state, ToggleState::Enabled);
    assert!(engine.list_fx(&key("{e}"), Flow::Render, ReadMode::Full).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Learn
// ---------------------------------------------------------------------------

#[test]
fn learn_main_switch_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("vendor_toggles.ini");
    let store = MemStore::new();
    let e = key("{e}");
    let section = fx_section(&e);
    store.insert(Scope::User, &section, "{l},1", TypedValue::Integer(1));
    store.insert(Scope::User, &section, "counter", TypedValue::Integer(0));
    let engine = engine(&path, &store);

    let mut tick = 0;
    let mut prompt = |phase: LearnPhase| {
        let on = phase.wants_enabled().unwrap_or(false);
        store.insert(Scope::User, &section, "{l},1", TypedValue::Integer(if on { 0 } else { 1 }));
        tick += 1;
        store.insert(Scope::User, &section, "counter", TypedValue::Integer(tick));
        true
    };
    let report = engine.learn(target("{e}", ToggleKind::Main), &mut prompt).unwrap();
    assert!(report.rule_persisted);
    assert!(report.created);
    assert_eq!(report.blocks_found, 1);
    assert_eq!(report.section, RuleId("main_l_1".into()));

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("[main_l_1]"));
    assert!(text.contains("dword_enable = 0"));
    assert!(text.contains("devices = {e}"));
    assert!(!text.contains("counter"));

    // Last capture was B (off).
    let state = engine
        .get_state(&e, Flow::Render, &ToggleKind::Main, ReadMode::Full)
        .unwrap();
    assert_eq!(state.state, ToggleState::Disabled);
    engine.set_state(&e, Flow::Render, &ToggleKind::Main, true).unwrap();
    assert_eq!(store.get(Scope::User, &section, "{l},1"), Some(TypedValue::Integer(0)));
}

#[test]
fn relearned_main_switch_takes_over_from_the_old_rule() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(
        &dir,
        "[old]\nvalue_name = {l},1\ndword_enable = 0\ndword_disable = 1\ndevices = {e}\n",
    );
    let store = MemStore::new();
    let e = key("{e}");
    let section = fx_section(&e);
    store.insert(Scope::User, &section, "{l},1", TypedValue::Integer(0));
    let engine = engine(&path, &store);

    // The driver actually uses 1 for on and 0 for off.
    let mut prompt = |phase: LearnPhase| {
        let on = phase.wants_enabled().unwrap_or(false);
        store.insert(Scope::User, &section, "{l},1", TypedValue::Integer(on as u32));
        true
    };
    let report = engine.learn(target("{e}", ToggleKind::Main), &mut prompt).unwrap();
    assert!(report.created);
    assert_eq!(report.section, RuleId("main_l_1".into()));

    // Last capture was B (off), live value 0.
    let state = engine
        .get_state(&e, Flow::Render, &ToggleKind::Main, ReadMode::Full)
        .unwrap();
    assert_eq!(state.state, ToggleState::Disabled);
    assert_eq!(state.source, RuleId("main_l_1".into()));

    let text = std::fs::read_to_string(&path).unwrap();
    let old = &text[..text.find("[main_l_1]").unwrap()];
    assert!(old.contains("dword_enable = 0"));
    assert!(!old.contains("{e}"));
}

#[test]
fn learn_fx_creates_bucket_then_joins_it() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("vendor_toggles.ini");
    let store = MemStore::new();
    let engine = engine(&path, &store);

    let learn_on = |endpoint: &str| {
        let section = fx_section(&key(endpoint));
        let mut prompt = |phase: LearnPhase| {
            let on = phase.wants_enabled().unwrap_or(false);
            store.insert(Scope::User, &section, "{g},4", TypedValue::Integer(on as u32));
            store.insert(
                Scope::Machine,
                &section,
                "{g},9",
                TypedValue::Binary(if on { vec![1, 0] } else { vec![0, 0] }),
            );
            true
        };
        engine.learn(target(endpoint, ToggleKind::fx("Echo")), &mut prompt).unwrap()
    };

    let first = learn_on("{e}");
    assert!(first.created);
    assert_eq!(first.blocks_found, 2);
    assert_eq!(first.section, RuleId("fx_echo".into()));

    let second = learn_on("{f}");
    assert!(!second.created);
    assert_eq!(second.section, first.section);

    let db = engine.rules().unwrap();
    assert_eq!(db.fx_rules().count(), 1);
    let Some(Rule::Fx(rule)) = db.get(&first.section) else {
        panic!("learned bucket missing");
    };
    let multi = rule.multi().unwrap();
    assert_eq!(multi.blocks.len(), 2);
    // Integer block ranks first and is the decider.
    assert_eq!(multi.blocks[0].name, "{g},4");
    assert_eq!(multi.decider_index, 1);
    assert_eq!(rule.device_name_pattern, "Speakers");
    for endpoint in ["{e}", "{f}"] {
        assert!(multi.blocks.iter().all(|b| b.device_scope.applies_to(&key(endpoint))));
    }

    let fx = engine.list_fx(&key("{f}"), Flow::Render, ReadMode::Full).unwrap();
    assert_eq!(fx.len(), 1);
    assert_eq!(fx[0].name, "Echo");
    assert_eq!(fx[0].state, ToggleState::Disabled);
}

#[test]
fn two_flipping_switches_are_ambiguous_for_main() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    let section = fx_section(&key("{e}"));
    let engine = engine(&path, &store);

    let mut prompt = |phase: LearnPhase| {
        let on = phase.wants_enabled().unwrap_or(false) as u32;
        store.insert(Scope::User, &section, "x", TypedValue::Integer(on));
        store.insert(Scope::User, &section, "y", TypedValue::Integer(1 - on));
        true
    };
    let err = engine.learn(target("{e}", ToggleKind::Main), &mut prompt).unwrap_err();
    assert!(matches!(
        err,
        FxError::Learn(LearnError::AmbiguousMainSwitch { count: 2, .. })
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MAIN_RULES);
}

#[test]
fn nothing_flipping_is_no_stable_candidate() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = rules_file(&dir, MAIN_RULES);
    let store = MemStore::new();
    store.insert(Scope::User, &fx_section(&key("{e}")), "static", TypedValue::Integer(3));
    let engine = engine(&path, &store);

    let err = engine
        .learn(target("{e}", ToggleKind::fx("Echo")), &mut |_: LearnPhase| true)
        .unwrap_err();
    assert!(matches!(
        err,
        FxError::Learn(LearnError::LearningNoStableCandidate { .. })
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MAIN_RULES);
}
