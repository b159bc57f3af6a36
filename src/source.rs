//! Selection of the items a run still has to process.

use std::collections::HashSet;

use crate::ledger::{ItemState, LedgerSnapshot, WorkItem};

/// Whether an item in `state` should be handed to the pool.
/// Unknown identities (`None`) have never been seen and are eligible.
pub fn is_eligible(state: Option<ItemState>, force_retry: bool) -> bool {
    match state {
        None | Some(ItemState::Pending) | Some(ItemState::InProgress) => true,
        Some(ItemState::Done) => false,
        Some(ItemState::FailedPermanent) => force_retry,
    }
}

/// Lazy, finite sequence of eligible items in candidate order.
///
/// Duplicate identities are yielded once, at their first position.
pub struct PendingItems<'a, I> {
    candidates: I,
    snapshot: &'a LedgerSnapshot,
    force_retry: bool,
    seen: HashSet<String>,
}

impl<I> Iterator for PendingItems<'_, I>
where
    I: Iterator<Item = WorkItem>,
{
    type Item = WorkItem;

    fn next(&mut self) -> Option<WorkItem> {
        for item in self.candidates.by_ref() {
            if !self.seen.insert(item.identity.clone()) {
                continue;
            }
            if is_eligible(self.snapshot.state_of(&item.identity), self.force_retry) {
                return Some(item);
            }
        }
        None
    }
}

/// Filters `candidates` against a ledger snapshot.
///
/// With `force_retry`, `failed-permanent` items are yielded as well; the
/// caller is responsible for resetting them in the ledger.
pub fn pending_items<I>(
    candidates: I,
    snapshot: &LedgerSnapshot,
    force_retry: bool,
) -> PendingItems<'_, I::IntoIter>
where
    I: IntoIterator<Item = WorkItem>,
{
    PendingItems {
        candidates: candidates.into_iter(),
        snapshot,
        force_retry,
        seen: HashSet::new(),
    }
}
