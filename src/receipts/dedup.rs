use crate::ledger::ReceiptId;
use std::collections::{HashSet, VecDeque};

/// Bounded memory of recently handled receipt ids. The oldest id is
/// forgotten once `capacity` is exceeded.
#[derive(Debug)]
pub struct RecentReceipts {
    capacity: usize,
    order: VecDeque<ReceiptId>,
    members: HashSet<ReceiptId>,
}

impl RecentReceipts {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &ReceiptId) -> bool {
        self.members.contains(id)
    }

    /// Remembers `id`; returns `false` if it was already known.
    pub fn insert(&mut self, id: ReceiptId) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
