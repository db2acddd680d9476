//! Toggle applier: write the records that set a rule, then verify.
//!
//! The applier only ever overwrites records that already exist. A scope or a
//! block whose record is missing is skipped, never created, because the
//! driver alone decides where its settings live.

use std::thread;
use std::time::Duration;

use crate::endpoint::{EndpointKey, Flow};
use crate::error::{StoreError, ToggleError};
use crate::reader::{self, ReadMode, ToggleState};
use crate::rules::{MultiRecord, RuleRef, SwitchRecord};
use crate::store::{PersistentStore, Scope, SectionPath, TypedValue};

/// Bounded re-read policy after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Agreeing reads in a row required (clamped to `attempts`).
    pub consecutive: u32,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(200),
            consecutive: 2,
        }
    }
}

/// What an apply did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub verified: bool,
    /// Scopes written, in write order (deduplicated).
    pub scopes: Vec<Scope>,
    /// Last state read during verification.
    pub state: ToggleState,
    pub blocks_written: usize,
    pub blocks_skipped: usize,
}

#[derive(Default)]
struct WriteTally {
    scopes: Vec<Scope>,
    written: usize,
    skipped: usize,
    denied: Vec<Scope>,
}

impl WriteTally {
    fn wrote(&mut self, scope: Scope) {
        self.written += 1;
        if !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
    }

    fn denied(&mut self, scope: Scope) {
        if !self.denied.contains(&scope) {
            self.denied.push(scope);
        }
    }
}

/// Try `scopes` in order until one write succeeds. Scopes where the record
/// does not exist are never written.
fn write_first<S: PersistentStore>(
    store: &S,
    scopes: &[Scope],
    section: &SectionPath,
    name: &str,
    value: &TypedValue,
    tally: &mut WriteTally,
) -> bool {
    for &scope in scopes {
        if store.get(scope, section, name).is_none() {
            tracing::debug!(%scope, %section, record = name, "record absent, not writing");
            continue;
        }
        match store.set(scope, section, name, value) {
            Ok(()) => {
                tracing::debug!(%scope, %section, record = name, %value, "wrote record");
                tally.wrote(scope);
                return true;
            }
            Err(StoreError::PermissionDenied { .. }) => {
                tracing::warn!(%scope, %section, record = name, "write denied, trying next scope");
                tally.denied(scope);
            }
            Err(e) => {
                tracing::warn!(%scope, %section, record = name, error = %e, "write failed");
            }
        }
    }
    false
}

fn write_switch<S: PersistentStore>(
    store: &S,
    record: &SwitchRecord,
    scopes: &[Scope],
    endpoint: &EndpointKey,
    flow: Flow,
    desired: bool,
    tally: &mut WriteTally,
) {
    let section = SectionPath::new(flow, endpoint, record.location.as_str());
    if !write_first(store, scopes, &section, &record.value_name, &record.payload(desired), tally) {
        tally.skipped += 1;
    }
}

fn write_blocks<S: PersistentStore>(
    store: &S,
    multi: &MultiRecord,
    endpoint: &EndpointKey,
    flow: Flow,
    desired: bool,
    tally: &mut WriteTally,
) {
    for (pos, block) in reader::applicable_blocks(multi, endpoint) {
        let section = SectionPath::new(flow, endpoint, block.location.as_str());
        let order = [block.scope, block.scope.alternate()];
        if !order.iter().any(|&s| store.get(s, &section, &block.name).is_some()) {
            tracing::debug!(block = pos + 1, record = %block.name, "record absent in both scopes, skipping block");
            tally.skipped += 1;
            continue;
        }
        if !write_first(store, &order, &section, &block.name, block.payload(desired), tally) {
            tally.skipped += 1;
        }
    }
}

/// Re-read with the full reader until `consecutive` reads in a row show the
/// desired state, or the attempts run out.
pub fn verify<S: PersistentStore>(
    store: &S,
    rule: RuleRef<'_>,
    endpoint: &EndpointKey,
    flow: Flow,
    desired: bool,
    policy: &VerifyPolicy,
) -> (bool, ToggleState) {
    let attempts = policy.attempts.max(1);
    let needed = policy.consecutive.clamp(1, attempts);
    let want = ToggleState::from_bool(desired);
    let mut streak = 0;
    let mut last = ToggleState::Unknown;

    for attempt in 1..=attempts {
        last = reader::read_state(store, rule, endpoint, flow, ReadMode::Full).state;
        if last == want {
            streak += 1;
            if streak >= needed {
                return (true, last);
            }
        } else {
            streak = 0;
        }
        if attempt < attempts && !policy.interval.is_zero() {
            thread::sleep(policy.interval);
        }
    }
    (false, last)
}

/// Set a rule to `desired` for one endpoint.
pub fn apply<S: PersistentStore>(
    store: &S,
    rule: RuleRef<'_>,
    endpoint: &EndpointKey,
    flow: Flow,
    desired: bool,
    policy: &VerifyPolicy,
) -> Result<ApplyOutcome, ToggleError> {
    let mut tally = WriteTally::default();
    if let Some(record) = rule.switch() {
        write_switch(store, record, rule.scopes(), endpoint, flow, desired, &mut tally);
    } else if let Some(multi) = rule.multi() {
        write_blocks(store, multi, endpoint, flow, desired, &mut tally);
    }

    if tally.written == 0 {
        if !tally.denied.is_empty() {
            let scopes = tally.denied.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
            return Err(ToggleError::WritePermissionDenied {
                rule: rule.id().to_string(),
                scopes,
            });
        }
        let state = reader::read_state(store, rule, endpoint, flow, ReadMode::Full).state;
        tracing::warn!(rule = %rule.id(), %endpoint, "no record could be written");
        return Ok(ApplyOutcome {
            applied: false,
            verified: false,
            scopes: Vec::new(),
            state,
            blocks_written: 0,
            blocks_skipped: tally.skipped,
        });
    }

    let (verified, state) = verify(store, rule, endpoint, flow, desired, policy);
    if verified {
        tracing::info!(rule = %rule.id(), %endpoint, %state, written = tally.written, "toggle applied");
    } else {
        tracing::warn!(
            rule = %rule.id(),
            %endpoint,
            expected = %ToggleState::from_bool(desired),
            observed = %state,
            "verification timed out"
        );
    }
    Ok(ApplyOutcome {
        applied: true,
        verified,
        scopes: tally.scopes,
        state,
        blocks_written: tally.written,
        blocks_skipped: tally.skipped,
    })
}
