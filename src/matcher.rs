//! Applicability matcher: which rules describe an endpoint right now.
//!
//! Matching is by live signature. A rule applies when the endpoint's store
//! currently holds one of the rule's known payloads, so a rule learned on one
//! device is picked up by every sibling device running the same driver.
//! Membership lists only break ties (and keep FX rules visible while their
//! records are in an unrecognized state).

use crate::endpoint::{EndpointKey, Flow};
use crate::reader::{self, Vote};
use crate::rules::{FxBody, FxRule, MainRule, RuleDatabase, RuleRef, SwitchRecord};
use crate::store::{PersistentStore, Scope, SectionPath};

/// Whether a single record holds its enable or disable payload in any of
/// the declared scopes.
pub fn switch_signature_matches<S: PersistentStore>(
    store: &S,
    record: &SwitchRecord,
    scopes: &[Scope],
    endpoint: &EndpointKey,
    flow: Flow,
) -> bool {
    let section = SectionPath::new(flow, endpoint, record.location.as_str());
    let (enable, disable) = (record.enable_value(), record.disable_value());
    scopes.iter().any(|&scope| {
        let value = store.get(scope, &section, &record.value_name);
        reader::classify(value.as_ref(), &enable, &disable) != Vote::Abstain
    })
}

pub fn main_signature_matches<S: PersistentStore>(
    store: &S,
    rule: &MainRule,
    endpoint: &EndpointKey,
    flow: Flow,
) -> bool {
    switch_signature_matches(store, &rule.record, &rule.scopes, endpoint, flow)
}

/// Legacy FX: record equals a payload. Multi-record FX: the quorum vote over
/// the blocks applicable to this endpoint is decisive.
pub fn fx_signature_matches<S: PersistentStore>(
    store: &S,
    rule: &FxRule,
    endpoint: &EndpointKey,
    flow: Flow,
) -> bool {
    match &rule.body {
        FxBody::Legacy(record) => switch_signature_matches(store, record, &rule.scopes, endpoint, flow),
        FxBody::Multi(multi) => reader::tally(store, multi, endpoint, flow).decision.is_some(),
    }
}

fn eligible(rule: RuleRef<'_>, endpoint: &EndpointKey, flow: Flow) -> bool {
    rule.allows_flow(flow) && !rule.membership().excludes(endpoint)
}

/// The Main rule for an endpoint, if any.
///
/// Among rules whose signature matches, one that lists the endpoint wins;
/// otherwise the first in file order. There is no generic fallback.
pub fn find_main<'a, S: PersistentStore>(
    store: &S,
    db: &'a RuleDatabase,
    endpoint: &EndpointKey,
    flow: Flow,
) -> Option<&'a MainRule> {
    let mut first = None;
    for rule in db.main_rules() {
        if !eligible(RuleRef::Main(rule), endpoint, flow) {
            continue;
        }
        if !main_signature_matches(store, rule, endpoint, flow) {
            continue;
        }
        if rule.membership.lists(endpoint) {
            return Some(rule);
        }
        first.get_or_insert(rule);
    }
    if let Some(rule) = first {
        tracing::debug!(%endpoint, rule = %rule.id, "main rule matched by signature");
    }
    first
}

/// Every FX rule that currently applies to the endpoint, in file order.
pub fn list_fx<'a, S: PersistentStore>(
    store: &S,
    db: &'a RuleDatabase,
    endpoint: &EndpointKey,
    flow: Flow,
) -> Vec<&'a FxRule> {
    db.fx_rules()
        .filter(|rule| eligible(RuleRef::Fx(rule), endpoint, flow))
        .filter(|rule| rule.membership.lists(endpoint) || fx_signature_matches(store, rule, endpoint, flow))
        .collect()
}

/// The FX rule for one effect name. A rule listing the endpoint wins over
/// one that only matches by signature.
pub fn find_fx<'a, S: PersistentStore>(
    store: &S,
    db: &'a RuleDatabase,
    endpoint: &EndpointKey,
    flow: Flow,
    fx_name: &str,
) -> Option<&'a FxRule> {
    let matching: Vec<&FxRule> = list_fx(store, db, endpoint, flow)
        .into_iter()
        .filter(|rule| rule.is_named(fx_name))
        .collect();
    matching
        .iter()
        .find(|rule| rule.membership.lists(endpoint))
        .or_else(|| matching.first())
        .copied()
}
