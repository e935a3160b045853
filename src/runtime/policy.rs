//! Injected policy seams: which receipts matter and how they turn into
//! application events.

use crate::ledger::{Outcome, Receipt};
use anyhow::Result;

/// Decides whether a receipt is relevant to the indexed application.
///
/// Any closure `Fn(&Receipt) -> bool` is a filter. An `Err` halts the pipeline.
pub trait ReceiptFilter: Send + Sync + 'static {
    fn is_relevant(&self, receipt: &Receipt) -> Result<bool>;
}

impl<F> ReceiptFilter for F
where
    F: Fn(&Receipt) -> bool + Send + Sync + 'static,
{
    fn is_relevant(&self, receipt: &Receipt) -> Result<bool> {
        Ok(self(receipt))
    }
}

/// Turns a relevant receipt and its execution outcome into at most one event.
///
/// `Ok(None)` means the receipt produced nothing worth emitting. An `Err`
/// halts the pipeline.
pub trait EventDecoder: Send + Sync + 'static {
    type Event: Send + 'static;

    fn decode(&self, receipt: &Receipt, outcome: &Outcome) -> Result<Option<Self::Event>>;
}
