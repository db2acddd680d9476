//! Merge learned records into the rule database, and unscope endpoints.
//!
//! Merging only appends: an endpoint joins an identical existing rule or
//! block, otherwise a new rule or block scoped to that endpoint is added.
//! Existing payloads are never overwritten.

use std::collections::BTreeSet;

use crate::endpoint::EndpointKey;
use crate::rules::{
    DeviceScope, FxBody, FxRule, MainRule, Membership, MultiRecord, Rule, RuleDatabase, RuleId,
    SwitchRecord, WriteBlock,
};
use crate::store::Scope;

use super::{Candidate, LearnTarget, MainSwitch};

/// Where a merge landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub section: RuleId,
    /// A new section was appended (as opposed to an existing one updated).
    pub created: bool,
    /// Blocks appended to an existing bucket.
    pub blocks_added: usize,
}

fn learned_note(target: &LearnTarget) -> String {
    if target.device_name.is_empty() {
        format!("learned on {}", target.endpoint)
    } else {
        format!("learned on {} ({})", target.device_name, target.endpoint)
    }
}

fn join_flow(flows: &mut Vec<crate::endpoint::Flow>, target: &LearnTarget) {
    if !flows.is_empty() && !flows.contains(&target.flow) {
        flows.push(target.flow);
    }
}

/// Drop the endpoint from the `devices` of every other main rule that reads
/// the same record with a different payload pair. An endpoint keeps one
/// interpretation per record.
fn detach_conflicting_main(db: &mut RuleDatabase, record: &SwitchRecord, endpoint: &EndpointKey, keep: &RuleId) {
    let stale: Vec<RuleId> = db
        .main_rules()
        .filter(|r| {
            r.id != *keep
                && r.membership.lists(endpoint)
                && r.record.value_name == record.value_name
                && r.record.location.eq_ignore_ascii_case(&record.location)
                && (r.record.enable != record.enable || r.record.disable != record.disable)
        })
        .map(|r| r.id.clone())
        .collect();
    for id in stale {
        if let Some(Rule::Main(rule)) = db.rule_mut(&id) {
            rule.membership.devices.remove(endpoint);
        }
        tracing::info!(rule = %id, %endpoint, "endpoint moved off conflicting main rule");
    }
}

/// Merge a learned main switch.
pub fn merge_main(db: &mut RuleDatabase, target: &LearnTarget, learned: MainSwitch) -> MergeOutcome {
    let existing = db
        .main_rules()
        .find(|r| {
            r.record.value_name == learned.record.value_name
                && r.record.location.eq_ignore_ascii_case(&learned.record.location)
                && r.record.enable == learned.record.enable
                && r.record.disable == learned.record.disable
        })
        .map(|r| r.id.clone());

    if let Some(id) = existing {
        detach_conflicting_main(db, &learned.record, &target.endpoint, &id);
        if let Some(Rule::Main(rule)) = db.rule_mut(&id) {
            rule.membership.adopt(&target.endpoint);
            join_flow(&mut rule.flows, target);
            for scope in &learned.scopes {
                if !rule.scopes.contains(scope) {
                    rule.scopes.push(*scope);
                }
            }
        }
        tracing::info!(rule = %id, endpoint = %target.endpoint, "endpoint joined existing main rule");
        return MergeOutcome {
            section: id,
            created: false,
            blocks_added: 0,
        };
    }

    let id = db.unique_id(&format!("main {}", learned.record.value_name));
    detach_conflicting_main(db, &learned.record, &target.endpoint, &id);
    let mut membership = Membership::default();
    membership.adopt(&target.endpoint);
    db.push_rule(Rule::Main(MainRule {
        id: id.clone(),
        record: learned.record,
        scopes: learned.scopes,
        flows: vec![target.flow],
        membership,
        notes: learned_note(target),
    }));
    tracing::info!(rule = %id, endpoint = %target.endpoint, "new main rule");
    MergeOutcome {
        section: id,
        created: true,
        blocks_added: 0,
    }
}

fn block_for(candidate: &Candidate, endpoint: &EndpointKey) -> WriteBlock {
    WriteBlock {
        scope: candidate.id.scope,
        location: candidate.id.location.clone(),
        name: candidate.id.name.clone(),
        enable: candidate.enable.clone(),
        disable: candidate.disable.clone(),
        device_scope: DeviceScope::only([endpoint.clone()]),
    }
}

/// Add the endpoint to matching blocks, append the rest, then remove the
/// endpoint from every other block addressing the same record.
fn merge_blocks(multi: &mut MultiRecord, members: &BTreeSet<EndpointKey>, learned: &[WriteBlock], endpoint: &EndpointKey) -> usize {
    let mut claimed = Vec::with_capacity(learned.len());
    let mut added = 0;
    for new in learned {
        match multi.blocks.iter().position(|b| b.same_payload(new)) {
            Some(pos) => {
                multi.blocks[pos].device_scope.include(endpoint);
                claimed.push(pos);
            }
            None => {
                multi.blocks.push(new.clone());
                claimed.push(multi.blocks.len() - 1);
                added += 1;
            }
        }
    }

    for (pos, block) in multi.blocks.iter_mut().enumerate() {
        if claimed.contains(&pos) {
            continue;
        }
        if learned.iter().any(|new| new.same_identity(block)) && block.device_scope.exclude(endpoint, members) {
            tracing::debug!(block = pos + 1, record = %block.name, %endpoint, "endpoint moved off conflicting block");
        }
    }
    added
}

/// Merge learned FX candidates into the bucket for `fx_name`.
pub fn merge_fx(db: &mut RuleDatabase, target: &LearnTarget, fx_name: &str, candidates: &[Candidate]) -> MergeOutcome {
    let learned: Vec<WriteBlock> = candidates.iter().map(|c| block_for(c, &target.endpoint)).collect();
    let bucket = db
        .fx_rules()
        .find(|r| r.is_named(fx_name) && r.multi().is_some())
        .map(|r| r.id.clone());

    if let Some(id) = bucket {
        let mut added = 0;
        if let Some(Rule::Fx(rule)) = db.rule_mut(&id) {
            let members = rule.membership.devices.clone();
            if let FxBody::Multi(multi) = &mut rule.body {
                added = merge_blocks(multi, &members, &learned, &target.endpoint);
            }
            rule.membership.adopt(&target.endpoint);
            join_flow(&mut rule.flows, target);
        }
        tracing::info!(rule = %id, endpoint = %target.endpoint, added, "merged into fx bucket");
        return MergeOutcome {
            section: id,
            created: false,
            blocks_added: added,
        };
    }

    let mut scopes: Vec<Scope> = Vec::new();
    for scope in Scope::CANONICAL {
        if learned.iter().any(|b| b.scope == scope) {
            scopes.push(scope);
        }
    }
    let id = db.unique_id(&format!("fx {fx_name}"));
    let mut membership = Membership::default();
    membership.adopt(&target.endpoint);
    db.push_rule(Rule::Fx(FxRule {
        id: id.clone(),
        fx_name: fx_name.trim().to_string(),
        device_name_pattern: target.device_name.clone(),
        scopes,
        flows: vec![target.flow],
        membership,
        notes: learned_note(target),
        body: FxBody::Multi(MultiRecord {
            decider_index: 1,
            quorum_threshold: db.default_quorum(),
            blocks: learned,
        }),
    }));
    tracing::info!(rule = %id, endpoint = %target.endpoint, blocks = candidates.len(), "new fx bucket");
    MergeOutcome {
        section: id,
        created: true,
        blocks_added: candidates.len(),
    }
}

/// Unscope an endpoint from one rule. Structures are never removed.
///
/// Returns `false` when the rule does not exist.
pub fn delete_endpoint(db: &mut RuleDatabase, id: &RuleId, endpoint: &EndpointKey) -> bool {
    let Some(rule) = db.rule_mut(id) else {
        return false;
    };
    match rule {
        Rule::Main(main) => main.membership.release(endpoint),
        Rule::Fx(fx) => {
            let members = fx.membership.devices.clone();
            if let FxBody::Multi(multi) = &mut fx.body {
                for block in &mut multi.blocks {
                    block.device_scope.exclude(endpoint, &members);
                }
            }
            fx.membership.release(endpoint);
        }
    }
    tracing::info!(rule = %id, %endpoint, "endpoint unscoped");
    true
}
