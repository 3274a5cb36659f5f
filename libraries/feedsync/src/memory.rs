//! An in-process backend. Used by the demo client and by tests.
//!
//! It behaves like the hosted store where it matters to a session: the store assigns ids and
//! timestamps, every write is fanned out to the channel's subscribers, and rows come back
//! sorted. Failures can be scripted, and the next fetch or insert can be held open until the
//! test releases it.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt as _;
use futures::channel::{mpsc, oneshot};

use crate::collaborators::{BlobStore, IdentityDirectory, MessageStore, PushFeed, PushStream, Upload};
use crate::data_model::{ChannelId, MessageRecord, NewMessage, Profile, PushEvent, UserId};
use crate::error::{StoreError, SubscriptionError, UploadError};

type Subscriber = mpsc::UnboundedSender<Result<PushEvent, SubscriptionError>>;

/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    rows: Vec<MessageRecord>,
    profiles: HashMap<UserId, Profile>,
    subscribers: Vec<(ChannelId, Subscriber)>,
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,

    blob_base_url: String,
    buckets: HashSet<String>,
    blobs: HashMap<String, Upload>,

    faults: Faults,
    held_fetch: Option<oneshot::Receiver<()>>,
    held_insert: Option<oneshot::Receiver<()>>,
    calls: CallCounts,
}

#[derive(Default)]
struct Faults {
    fetch: Option<StoreError>,
    lookup: Option<StoreError>,
    insert: Option<StoreError>,
    upload: Option<UploadError>,
    subscribe: Option<SubscriptionError>,
}

/// How many times each operation has been called.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetches: usize,
    pub lookups: usize,
    pub inserts: usize,
    pub uploads: usize,
    pub subscribes: usize,
}

/// Keeps a held operation waiting. Releasing it, or dropping it, lets the operation finish.
pub struct Gate {
    release: oneshot::Sender<()>,
}

impl Gate {
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty store with an `attachments` bucket.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                rows: Vec::new(),
                profiles: HashMap::new(),
                subscribers: Vec::new(),
                next_id: 1,
                last_timestamp: None,
                blob_base_url: "memory://blobs".to_string(),
                buckets: HashSet::from(["attachments".to_string()]),
                blobs: HashMap::new(),
                faults: Faults::default(),
                held_fetch: None,
                held_insert: None,
                calls: CallCounts::default(),
            })),
        }
    }

    pub fn with_blob_base_url(self, base_url: impl Into<String>) -> Self {
        self.inner.borrow_mut().blob_base_url = base_url.into();
        self
    }

    pub fn add_profile(&self, profile: Profile) {
        self.inner
            .borrow_mut()
            .profiles
            .insert(profile.user_id.clone(), profile);
    }

    /// Writes a row as if another client had sent it, and notifies subscribers.
    pub fn insert_row(&self, message: NewMessage) -> MessageRecord {
        let mut inner = self.inner.borrow_mut();
        let record = MessageRecord {
            id: format!("msg-{}", inner.next_id),
            content: message.content,
            created_at: inner.next_timestamp(),
            updated_at: None,
            user_id: message.user_id,
            channel_id: message.channel_id,
        };
        inner.next_id += 1;
        inner.rows.push(record.clone());
        inner.broadcast(PushEvent::Insert(record.clone()));
        record
    }

    /// Rewrites a row's content and notifies subscribers. Returns `None` for unknown ids.
    pub fn edit_row(&self, id: &str, content: impl Into<String>) -> Option<MessageRecord> {
        let mut inner = self.inner.borrow_mut();
        let updated_at = inner.next_timestamp();
        let row = inner.rows.iter_mut().find(|row| row.id == id)?;
        row.content = content.into();
        row.updated_at = Some(updated_at);
        let record = row.clone();
        inner.broadcast(PushEvent::Update(record.clone()));
        Some(record)
    }

    /// Delivers an event to the subscribers of its channel without touching the rows.
    pub fn push_event(&self, event: PushEvent) {
        self.inner.borrow_mut().broadcast(event);
    }

    /// Rows of `channel`, oldest first.
    pub fn rows(&self, channel: &ChannelId) -> Vec<MessageRecord> {
        self.inner.borrow().channel_rows(channel)
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.borrow().calls
    }

    /// Open subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.subscribers.retain(|(_, subscriber)| !subscriber.is_closed());
        inner
            .subscribers
            .iter()
            .filter(|(subscribed, _)| subscribed == channel)
            .count()
    }

    /// Sends `reason` as an error to every subscriber of `channel`, then closes their streams.
    pub fn drop_subscriptions(&self, channel: &ChannelId, reason: &str) {
        let mut inner = self.inner.borrow_mut();
        let (dropped, kept) = std::mem::take(&mut inner.subscribers)
            .into_iter()
            .partition::<Vec<_>, _>(|(subscribed, _)| subscribed == channel);
        inner.subscribers = kept;
        for (_, subscriber) in dropped {
            let _ = subscriber.unbounded_send(Err(SubscriptionError::Dropped(reason.to_string())));
        }
    }

    pub fn create_bucket(&self, bucket: impl Into<String>) {
        self.inner.borrow_mut().buckets.insert(bucket.into());
    }

    pub fn remove_bucket(&self, bucket: &str) {
        self.inner.borrow_mut().buckets.remove(bucket);
    }

    /// The file stored under `url`, if an upload returned it.
    pub fn blob(&self, url: &str) -> Option<Upload> {
        self.inner.borrow().blobs.get(url).cloned()
    }

    // =======
    // fault injection
    // =======

    pub fn fail_next_fetch(&self, error: StoreError) {
        self.inner.borrow_mut().faults.fetch = Some(error);
    }

    pub fn fail_next_lookup(&self, error: StoreError) {
        self.inner.borrow_mut().faults.lookup = Some(error);
    }

    pub fn fail_next_insert(&self, error: StoreError) {
        self.inner.borrow_mut().faults.insert = Some(error);
    }

    pub fn fail_next_upload(&self, error: UploadError) {
        self.inner.borrow_mut().faults.upload = Some(error);
    }

    pub fn fail_next_subscribe(&self, error: SubscriptionError) {
        self.inner.borrow_mut().faults.subscribe = Some(error);
    }

    /// The next fetch waits for the gate before it reads any rows.
    pub fn hold_next_fetch(&self) -> Gate {
        let (release, held) = oneshot::channel();
        self.inner.borrow_mut().held_fetch = Some(held);
        Gate { release }
    }

    /// The next insert waits for the gate before it writes anything.
    pub fn hold_next_insert(&self) -> Gate {
        let (release, held) = oneshot::channel();
        self.inner.borrow_mut().held_insert = Some(held);
        Gate { release }
    }
}

impl Inner {
    /// Wall clock time, nudged forward so that no two rows share a timestamp.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    fn channel_rows(&self, channel: &ChannelId) -> Vec<MessageRecord> {
        let mut rows: Vec<MessageRecord> = self
            .rows
            .iter()
            .filter(|row| &row.channel_id == channel)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        rows
    }

    fn broadcast(&mut self, event: PushEvent) {
        let channel = event.record().channel_id.clone();
        self.subscribers.retain(|(subscribed, subscriber)| {
            if *subscribed != channel {
                return !subscriber.is_closed();
            }
            subscriber.unbounded_send(Ok(event.clone())).is_ok()
        });
    }
}

impl MessageStore for MemoryBackend {
    async fn fetch_channel(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>, StoreError> {
        let held = {
            let mut inner = self.inner.borrow_mut();
            inner.calls.fetches += 1;
            inner.held_fetch.take()
        };
        if let Some(held) = held {
            // a dropped gate counts as released
            let _ = held.await;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(error) = inner.faults.fetch.take() {
            return Err(error);
        }
        Ok(inner.channel_rows(channel))
    }

    async fn insert(&self, message: NewMessage) -> Result<(), StoreError> {
        let held = {
            let mut inner = self.inner.borrow_mut();
            inner.calls.inserts += 1;
            inner.held_insert.take()
        };
        if let Some(held) = held {
            let _ = held.await;
        }

        if let Some(error) = self.inner.borrow_mut().faults.insert.take() {
            return Err(error);
        }
        let record = self.insert_row(message);
        log::debug!("Stored {} in {}", record.id, record.channel_id);
        Ok(())
    }
}

impl IdentityDirectory for MemoryBackend {
    async fn lookup_profiles(&self, user_ids: &[UserId]) -> Result<Vec<Profile>, StoreError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.lookups += 1;
        if let Some(error) = inner.faults.lookup.take() {
            return Err(error);
        }
        Ok(user_ids
            .iter()
            .filter_map(|user_id| inner.profiles.get(user_id).cloned())
            .collect())
    }
}

impl PushFeed for MemoryBackend {
    async fn subscribe(&self, channel: &ChannelId) -> Result<PushStream, SubscriptionError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.subscribes += 1;
        if let Some(error) = inner.faults.subscribe.take() {
            return Err(error);
        }
        let (subscriber, events) = mpsc::unbounded();
        inner.subscribers.push((channel.clone(), subscriber));
        Ok(events.boxed_local())
    }
}

impl BlobStore for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        upload: &Upload,
        _cache_seconds: u32,
    ) -> Result<String, UploadError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.uploads += 1;
        if let Some(error) = inner.faults.upload.take() {
            return Err(error);
        }
        if !inner.buckets.contains(bucket) {
            return Err(UploadError::MissingBucket {
                bucket: bucket.to_string(),
            });
        }
        let url = format!("{}/{bucket}/{path}", inner.blob_base_url);
        inner.blobs.insert(url.clone(), upload.clone());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn new_message(channel: &str, content: &str) -> NewMessage {
        NewMessage {
            content: content.to_string(),
            user_id: UserId::from("u1"),
            channel_id: ChannelId::from(channel),
        }
    }

    #[test]
    fn test_rows_get_ids_and_increasing_timestamps() {
        let backend = MemoryBackend::new();
        let first = backend.insert_row(new_message("general", "one"));
        let second = backend.insert_row(new_message("general", "two"));
        backend.insert_row(new_message("random", "elsewhere"));

        assert_eq!(first.id, "msg-1");
        assert_eq!(second.id, "msg-2");
        assert!(first.created_at < second.created_at);
        assert_eq!(backend.rows(&ChannelId::from("general")).len(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_only_see_their_channel() {
        let backend = MemoryBackend::new();
        let general = ChannelId::from("general");
        let mut events = backend.subscribe(&general).await.unwrap();
        assert_eq!(backend.subscriber_count(&general), 1);

        backend.insert_row(new_message("random", "elsewhere"));
        let record = backend.insert_row(new_message("general", "hello"));
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            PushEvent::Insert(record)
        );

        drop(events);
        assert_eq!(backend.subscriber_count(&general), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_reports_error_then_ends() {
        let backend = MemoryBackend::new();
        let general = ChannelId::from("general");
        let mut events = backend.subscribe(&general).await.unwrap();

        backend.drop_subscriptions(&general, "socket closed");
        assert!(matches!(
            events.next().await,
            Some(Err(SubscriptionError::Dropped(_)))
        ));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upload_needs_the_bucket() {
        let backend = MemoryBackend::new();
        let upload = Upload {
            name: "cat.png".to_string(),
            mime: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        };

        let url = backend
            .upload("attachments", "general/1-cat.png", &upload, 3600)
            .await
            .unwrap();
        assert_eq!(url, "memory://blobs/attachments/general/1-cat.png");
        assert_eq!(backend.blob(&url), Some(upload.clone()));

        backend.remove_bucket("attachments");
        assert!(matches!(
            backend.upload("attachments", "general/2-cat.png", &upload, 3600).await,
            Err(UploadError::MissingBucket { .. })
        ));
    }

    #[tokio::test]
    async fn test_held_insert_waits_for_release() {
        let backend = MemoryBackend::new();
        let gate = backend.hold_next_insert();
        let general = ChannelId::from("general");

        let (written, ()) = futures::join!(backend.insert(new_message("general", "hi")), async {
            tokio::task::yield_now().await;
            assert!(backend.rows(&general).is_empty());
            gate.release();
        });
        assert!(written.is_ok());
        assert_eq!(backend.rows(&general).len(), 1);
    }
}
