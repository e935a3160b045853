//! Pipeline orchestration: the block poller, chunk worker pool, the manager's
//! ordered fan-in and the run lifecycle.

pub(crate) mod backoff;
pub(crate) mod chunk_pool;
pub mod indexer;
pub(crate) mod lifecycle;
pub mod manager;
pub(crate) mod messages;
pub(crate) mod poller;
pub(crate) mod reorder;
