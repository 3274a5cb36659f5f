//! The push subscription of a session, as an owned resource.
//!
//! A session holds at most one subscription. Acquiring a new one closes the previous one,
//! releasing is idempotent, and dropping the slot releases whatever it holds. Release also
//! reaches a stream that is currently being polled: it is aborted, so the poller gets `None`
//! and drops it.

use std::cell::RefCell;

use futures::StreamExt as _;
use futures::stream::{AbortHandle, Abortable};

use crate::collaborators::PushStream;
use crate::data_model::PushEvent;
use crate::error::SubscriptionError;

#[derive(Default)]
pub(crate) struct SubscriptionSlot {
    // taken out while it's being polled, so never borrowed across an .await
    events: RefCell<Option<Abortable<PushStream>>>,
    abort: RefCell<Option<AbortHandle>>,
}

impl SubscriptionSlot {
    pub(crate) fn acquire(&self, stream: PushStream) {
        self.release();
        let (events, abort) = futures::stream::abortable(stream);
        *self.events.borrow_mut() = Some(events);
        *self.abort.borrow_mut() = Some(abort);
    }

    pub(crate) fn release(&self) {
        if let Some(abort) = self.abort.borrow_mut().take() {
            abort.abort();
        }
        self.events.borrow_mut().take();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.abort.borrow().is_some()
    }

    /// Waits for the next event. `None` means the subscription is closed, either because
    /// it was released or because the feed ended; the stream is dropped in both cases.
    pub(crate) async fn next(&self) -> Option<Result<PushEvent, SubscriptionError>> {
        let mut events = self.events.borrow_mut().take()?;
        let item = events.next().await;

        match &item {
            Some(Ok(_)) if !events.is_aborted() => {
                *self.events.borrow_mut() = Some(events);
            }
            Some(Ok(_)) => {}
            // the feed is gone, stop reporting it as open
            Some(Err(_)) | None => {
                if !events.is_aborted() {
                    self.abort.borrow_mut().take();
                }
            }
        }
        item
    }
}

impl Drop for SubscriptionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_release_while_polling_ends_the_stream() {
        let (tx, rx) = mpsc::unbounded();
        let slot = SubscriptionSlot::default();
        slot.acquire(rx.boxed_local());
        assert!(slot.is_open());

        let (item, ()) = futures::join!(slot.next(), async {
            slot.release();
        });
        assert!(item.is_none());
        assert!(!slot.is_open());
        // the receiver has been dropped
        assert!(tx.is_closed());
        // releasing again is fine
        slot.release();
    }

    #[tokio::test]
    async fn test_ended_feed_closes_slot() {
        let (tx, rx) = mpsc::unbounded::<Result<PushEvent, SubscriptionError>>();
        let slot = SubscriptionSlot::default();
        slot.acquire(rx.boxed_local());
        drop(tx);
        assert!(slot.next().await.is_none());
        assert!(!slot.is_open());
        assert!(slot.next().await.is_none());
    }
}
