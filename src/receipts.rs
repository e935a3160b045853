//! Receipt handling: relevance filtering, outcome lookups, de-duplication and
//! the built-in event policies.

pub mod dedup;
pub(crate) mod handler;
pub mod policies;

pub use dedup::RecentReceipts;
pub use policies::{ContractEvents, EventLog, EventLogDecoder, ReceiverFilter};
