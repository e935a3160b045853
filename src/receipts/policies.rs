//! Ready-made filter and decoder for contracts that emit NEP-297 event logs.

use crate::ledger::{AccountId, Outcome, Receipt, ReceiptId, ReceiptKind};
use crate::runtime::policy::{EventDecoder, ReceiptFilter};
use anyhow::Result;
use serde::{Deserialize, Serialize};

const EVENT_LOG_PREFIX: &str = "EVENT_JSON:";

/// Keeps action receipts addressed to one account.
#[derive(Debug, Clone)]
pub struct ReceiverFilter {
    account: AccountId,
}

impl ReceiverFilter {
    pub fn new(account: impl Into<AccountId>) -> Self {
        Self {
            account: account.into(),
        }
    }
}

impl ReceiptFilter for ReceiverFilter {
    fn is_relevant(&self, receipt: &Receipt) -> Result<bool> {
        Ok(receipt.kind == ReceiptKind::Action && receipt.receiver_id == self.account)
    }
}

/// Standard event envelope logged by contracts as `EVENT_JSON:{...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    pub standard: String,
    pub version: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvents {
    pub receipt_id: ReceiptId,
    pub executor_id: AccountId,
    pub events: Vec<EventLog>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventLogDecoder;

impl EventDecoder for EventLogDecoder {
    type Event = ContractEvents;

    fn decode(&self, receipt: &Receipt, outcome: &Outcome) -> Result<Option<ContractEvents>> {
        let events: Vec<EventLog> = outcome
            .logs
            .iter()
            .filter_map(|log| parse_event_log(&receipt.id, log))
            .collect();

        if events.is_empty() {
            return Ok(None);
        }

        Ok(Some(ContractEvents {
            receipt_id: receipt.id.clone(),
            executor_id: outcome.executor_id.clone(),
            events,
        }))
    }
}

fn parse_event_log(receipt: &ReceiptId, log: &str) -> Option<EventLog> {
    let payload = log.strip_prefix(EVENT_LOG_PREFIX)?;
    match serde_json::from_str(payload.trim()) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(receipt = %receipt, error = %err, "skipping malformed event log");
            None
        }
    }
}
