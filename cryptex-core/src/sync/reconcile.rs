//! Operator-directed reconciliation of two credential sets.
//!
//! Rules, from the local side's point of view:
//! 1. Same id, different hash: `Update` carrying the remote version.
//! 2. Same id, same hash: nothing.
//! 3. Local only: `Delete` carrying the local version.
//! 4. Remote only: `Add` carrying the remote version.
//!
//! The operator then keeps a subset. Kept diffs are applied locally; every
//! rejected diff is inverted and sent to the peer so both sides converge
//! after one round.

use crate::credential::Credential;
use crate::sync::diff::{Diff, DiffKey, DiffKind};
use crate::{CryptexError, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of a selection: what to apply here and what to send back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_apply: Vec<Diff>,
    pub to_send: Vec<Diff>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_apply.is_empty() && self.to_send.is_empty()
    }
}

/// Compare two immutable snapshots.
///
/// Updates and deletes come out in local order, followed by adds in remote
/// order.
pub fn compute_diffs(ours: &[Credential], theirs: &[Credential]) -> Vec<Diff> {
    let remote: HashMap<Uuid, &Credential> = theirs.iter().map(|c| (c.id, c)).collect();
    let local_ids: HashSet<Uuid> = ours.iter().map(|c| c.id).collect();

    let mut diffs = Vec::new();
    for local in ours {
        match remote.get(&local.id) {
            Some(theirs) if theirs.content_hash() != local.content_hash() => {
                diffs.push(Diff::update(theirs));
            }
            Some(_) => {}
            None => diffs.push(Diff::delete(local)),
        }
    }
    for theirs in theirs.iter().filter(|c| !local_ids.contains(&c.id)) {
        diffs.push(Diff::add(theirs));
    }

    debug!(
        local = ours.len(),
        remote = theirs.len(),
        diffs = diffs.len(),
        "Computed credential diffs"
    );
    diffs
}

/// Split diffs by the operator's selection.
///
/// Fails with [`CryptexError::Consistency`] when a rejected update or delete
/// names an id that is no longer in `ours`; nothing is produced in that case.
pub fn split_selection(
    diffs: &[Diff],
    selected: &HashSet<DiffKey>,
    ours: &[Credential],
) -> Result<Reconciliation> {
    let local: HashMap<Uuid, &Credential> = ours.iter().map(|c| (c.id, c)).collect();
    let ours_for = |id: Uuid| local.get(&id).copied().ok_or(CryptexError::Consistency { id });

    let mut out = Reconciliation::default();
    for diff in diffs {
        let kept = selected.contains(&diff.key());
        match (diff.kind(), kept) {
            (DiffKind::Add | DiffKind::Update, true) => out.to_apply.push(diff.clone()),
            (DiffKind::Delete, true) => out.to_apply.push(diff.finalized_delete()),
            (DiffKind::Add, false) => out.to_send.push(diff.finalized_delete()),
            (DiffKind::Update, false) => out.to_send.push(Diff::update(ours_for(diff.id())?)),
            (DiffKind::Delete, false) => out.to_send.push(Diff::add(ours_for(diff.id())?)),
        }
    }

    info!(
        apply = out.to_apply.len(),
        send = out.to_send.len(),
        "Split reconciliation selection"
    );
    Ok(out)
}

/// Apply diffs by id: adds and updates upsert, deletes remove. Applying the
/// same list twice changes nothing the second time.
pub fn apply_diffs(credentials: &mut Vec<Credential>, diffs: &[Diff]) -> Result<()> {
    for diff in diffs {
        match diff.kind() {
            DiffKind::Add | DiffKind::Update => {
                let props = diff.props().ok_or_else(|| {
                    CryptexError::InvalidInput(format!(
                        "{} diff for {} carries no credential",
                        diff.kind(),
                        diff.id()
                    ))
                })?;
                if props.id != diff.id() {
                    return Err(CryptexError::InvalidInput(format!(
                        "diff for {} carries credential {}",
                        diff.id(),
                        props.id
                    )));
                }
                match credentials.iter_mut().find(|c| c.id == props.id) {
                    Some(slot) => *slot = props.clone(),
                    None => credentials.push(props.clone()),
                }
            }
            DiffKind::Delete => credentials.retain(|c| c.id != diff.id()),
        }
    }
    Ok(())
}

/// The operator's choice of which proposed changes to keep.
pub trait DiffSelector: Send {
    fn select(&mut self, diffs: &[Diff]) -> HashSet<DiffKey>;
}

/// Keep every proposed change.
pub struct AcceptAll;

impl DiffSelector for AcceptAll {
    fn select(&mut self, diffs: &[Diff]) -> HashSet<DiffKey> {
        diffs.iter().map(Diff::key).collect()
    }
}

/// Reject every proposed change; the peer is told to match us.
pub struct RejectAll;

impl DiffSelector for RejectAll {
    fn select(&mut self, _diffs: &[Diff]) -> HashSet<DiffKey> {
        HashSet::new()
    }
}

/// A per-diff predicate: keep the diff when it returns `true`.
impl<F> DiffSelector for F
where
    F: FnMut(&Diff) -> bool + Send,
{
    fn select(&mut self, diffs: &[Diff]) -> HashSet<DiffKey> {
        diffs.iter().filter(|d| self(*d)).map(Diff::key).collect()
    }
}

/// Compute, select and split in one call.
pub fn reconcile(
    ours: &[Credential],
    theirs: &[Credential],
    selector: &mut dyn DiffSelector,
) -> Result<Reconciliation> {
    let diffs = compute_diffs(ours, theirs);
    let selected = selector.select(&diffs);
    split_selection(&diffs, &selected, ours)
}
