use crate::ledger::{BlockHeight, ReceiptId};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A decoded event tagged with the block and receipt it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent<E> {
    pub height: BlockHeight,
    pub receipt_id: ReceiptId,
    pub event: E,
}

/// Ordered stream of indexed events handed to the caller.
///
/// Events arrive in non-decreasing height order. The stream ends once the
/// pipeline has stopped and every buffered event was consumed. Not polling it
/// stalls the receipt handler once the buffer is full.
#[derive(Debug)]
pub struct EventStream<E> {
    receiver: mpsc::Receiver<IndexedEvent<E>>,
}

pub(crate) fn event_channel<E>(capacity: usize) -> (mpsc::Sender<IndexedEvent<E>>, EventStream<E>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (sender, EventStream { receiver })
}

impl<E> EventStream<E> {
    pub async fn recv(&mut self) -> Option<IndexedEvent<E>> {
        self.receiver.recv().await
    }

    /// Returns an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<IndexedEvent<E>> {
        self.receiver.try_recv().ok()
    }
}

impl<E> Stream for EventStream<E> {
    type Item = IndexedEvent<E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
