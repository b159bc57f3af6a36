mod entry;
mod rejections;
mod store;

pub use entry::{AttemptOutcome, AttemptRecord, ItemPayload, ItemState, LedgerEntry, WorkItem};
pub use rejections::{RejectionList, RejectionRow};
pub use store::{Ledger, LedgerSnapshot, StateCounts};

pub(crate) use store::write_atomic;
