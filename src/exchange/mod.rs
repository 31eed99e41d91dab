//! Partition map exchange.
//!
//! Every topology version is agreed on in one exchange: nodes report their
//! partitions to the coordinator (the oldest alive server), the coordinator
//! merges the reports with the affinity function and broadcasts the result,
//! and every node applies it atomically. Exchanges are strictly ordered; a
//! newer version only begins after the previous one completed or was
//! superseded.

mod actions;
mod future;
pub mod merge;
mod worker;

pub use actions::{CacheChangeKind, CacheChangeRequest, ExchangeAction, ExchangeTrigger};
pub use future::{ExchangeFutures, ExchangeRecord, ExchangeState};
pub use merge::{merge, MergeInput};
pub use worker::{ExchangeInput, ExchangeWorker};
