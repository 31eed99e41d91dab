//! Cache handles and routing of data operations.

mod handle;
mod manager;
pub mod router;

pub use handle::CacheHandle;
pub use manager::{CacheHandleManager, HandleState};
pub use router::RequestRouter;
