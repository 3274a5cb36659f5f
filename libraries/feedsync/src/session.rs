//! # FeedSession
//! Keeps one channel's [`FeedStore`] in sync with the durable store.
//!
//! Three things mutate the feed:
//! 1. Full fetches: the initial load when the session starts, and a refresh after every
//!    successful send. The rows are joined against the identity lookup and replace the
//!    whole feed.
//! 2. Push events, pulled from the subscription with [`FeedSession::next_push`] or
//!    [`FeedSession::run_push_loop`].
//! 3. Sends: an optimistic entry shows up immediately, then the durable write either
//!    succeeds (and the feed is refetched) or fails (and the entry is flipped to failed).
//!
//! Everything runs on one thread. The only suspension points are calls into the backend,
//! and no `RefCell` borrow is ever held across them. Results that land after
//! [`FeedSession::teardown`] are dropped instead of being applied.

use std::cell::{Cell, RefCell};

use chrono::Utc;
use serde::Serialize;

use crate::collaborators::{AuthProvider, Backend, BlobStore, Upload};
use crate::config::FeedConfig;
use crate::data_model::{
    AttachmentDescriptor, AttachmentKind, ChannelId, CurrentUser, FeedStore, ListenerKey,
    LocalState, Message, MessageBody, MessageId, NewMessage, PushEvent, TempId,
};
use crate::enrichment::{ProfileCache, author_ids, enrich};
use crate::error::{FeedError, SubscriptionError, UploadError};
use crate::subscription::SubscriptionSlot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    /// Only entered once, for the initial fetch. Later refreshes happen silently.
    Loading,
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

/// Something the user should be told about, like a toast.
#[derive(Clone, Debug, Serialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    /// The failure behind an error notice. Also set for failures the session recovers from
    /// on its own, which are never returned to the caller.
    #[serde(skip)]
    pub cause: Option<FeedError>,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity: Severity::Info,
            cause: None,
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity: Severity::Error,
            cause: None,
        }
    }

    pub fn caused_by(mut self, cause: FeedError) -> Self {
        self.cause = Some(cause);
        self
    }
}

pub struct FeedSession<B, A> {
    backend: B,
    auth: A,
    config: FeedConfig,

    // never hold a borrow of these across an .await
    store: RefCell<FeedStore>,
    profiles: RefCell<ProfileCache>,
    notices: RefCell<Vec<Notice>>,
    subscription: SubscriptionSlot,

    status: Cell<SessionStatus>,
    alive: Cell<bool>,
    sending: Cell<bool>,
    /// The send whose durable write is outstanding, if any.
    in_flight: Cell<Option<TempId>>,
    /// A send whose write succeeded but whose refetch hasn't finished yet.
    settling: Cell<Option<TempId>>,
    next_temp_id: Cell<u64>,
    fetch_generation: Cell<u64>,
    /// Generation of the last fetch whose rows made it into the store.
    applied_generation: Cell<u64>,
}

impl<B, A> FeedSession<B, A> {
    pub fn new(backend: B, auth: A, config: FeedConfig) -> Self {
        Self {
            backend,
            auth,
            config,
            store: RefCell::new(FeedStore::default()),
            profiles: RefCell::new(ProfileCache::default()),
            notices: RefCell::new(Vec::new()),
            subscription: SubscriptionSlot::default(),
            status: Cell::new(SessionStatus::Idle),
            alive: Cell::new(true),
            sending: Cell::new(false),
            in_flight: Cell::new(None),
            settling: Cell::new(None),
            next_temp_id: Cell::new(1),
            fetch_generation: Cell::new(0),
            applied_generation: Cell::new(0),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.config.channel_id
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The feed, oldest first, with local entries last.
    pub fn messages(&self) -> im::Vector<Message> {
        self.store.borrow().messages()
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.store.borrow().get(id).cloned()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// True until the initial fetch has settled.
    pub fn is_loading(&self) -> bool {
        self.status.get() != SessionStatus::Ready
    }

    pub fn is_sending(&self) -> bool {
        self.sending.get()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_open()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Registers a callback that runs after the feed, the loading/sending flags or the
    /// notices change.
    pub fn register_listener(&self, listener: impl Fn(ListenerKey) + 'static) -> ListenerKey {
        self.store.borrow_mut().register_listener(listener)
    }

    pub fn unregister_listener(&self, key: ListenerKey) {
        self.store.borrow_mut().unregister_listener(key)
    }

    pub fn drain_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.borrow_mut())
    }

    /// Ends the session: closes the push subscription and makes sure nothing that is still
    /// in flight gets applied. Calling it again does nothing.
    pub fn teardown(&self) {
        if !self.alive.replace(false) {
            return;
        }
        self.subscription.release();
        log::info!("Closed session for channel {}", self.config.channel_id);
    }

    fn push_notice(&self, notice: Notice) {
        self.notices.borrow_mut().push(notice);
        self.store.borrow_mut().mark_changed();
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.set(status);
        self.store.borrow_mut().mark_changed();
    }

    fn ensure_alive(&self) -> Result<(), FeedError> {
        if self.alive.get() {
            Ok(())
        } else {
            Err(FeedError::SessionClosed)
        }
    }

    fn next_temp_id(&self) -> TempId {
        let n = self.next_temp_id.get();
        self.next_temp_id.set(n + 1);
        TempId(n)
    }

    /// Runs due listener callbacks. The store borrow is released before they're called,
    /// since they usually read the session.
    fn flush_notifications(&self) {
        let notifications = self.store.borrow_mut().drain_due_notifications();
        for notification in notifications {
            notification();
        }
    }
}

impl<B: Backend, A: AuthProvider> FeedSession<B, A> {
    /// Loads the feed and opens the push subscription. Only the first call does anything.
    ///
    /// A failed fetch is returned (and queued as a notice), but the session stays usable:
    /// the subscription is still opened and sends are still attempted.
    pub async fn start(&self) -> Result<(), FeedError> {
        self.ensure_alive()?;
        if self.status.get() != SessionStatus::Idle {
            return Ok(());
        }
        let _flusher = FlushLater::new(self);

        self.set_status(SessionStatus::Loading);
        self.flush_notifications();
        let fetched = self.fetch_and_replace().await;
        self.ensure_alive()?;
        self.set_status(SessionStatus::Ready);

        if let Err(e) = self.open_subscription().await {
            log::warn!("Continuing without live updates: {e}");
        }
        fetched
    }

    /// Reloads the whole feed from the store without going back to the loading state.
    pub async fn refetch(&self) -> Result<(), FeedError> {
        self.ensure_alive()?;
        let _flusher = FlushLater::new(self);
        self.fetch_and_replace().await
    }

    async fn fetch_and_replace(&self) -> Result<(), FeedError> {
        let generation = self.fetch_generation.get() + 1;
        self.fetch_generation.set(generation);
        let channel = &self.config.channel_id;

        let fetched = self.backend.fetch_channel(channel).await;
        self.ensure_alive()?;
        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                log::error!("Error fetching messages for {channel}: {e}");
                self.push_notice(
                    Notice::error("Error", "Failed to load messages")
                        .caused_by(FeedError::FetchFailed(e.clone())),
                );
                return Err(FeedError::FetchFailed(e));
            }
        };

        let authors = author_ids(&records);
        let profiles = if authors.is_empty() {
            None
        } else {
            let looked_up = self.backend.lookup_profiles(&authors).await;
            self.ensure_alive()?;
            match looked_up {
                Ok(profiles) => Some(profiles.into_iter().collect::<ProfileCache>()),
                Err(e) => {
                    log::warn!("Error looking up senders: {e}, using previously known names");
                    self.push_notice(
                        Notice::error("Error", "Failed to resolve sender names")
                            .caused_by(FeedError::IdentityLookupFailed(e)),
                    );
                    None
                }
            }
        };

        // a newer fetch that failed doesn't make this one stale, only a newer applied one does
        let applied = self.applied_generation.get();
        if applied > generation {
            log::debug!("Discarding fetch #{generation}, fetch #{applied} already replaced the feed");
            return Ok(());
        }
        self.applied_generation.set(generation);

        if let Some(profiles) = profiles {
            *self.profiles.borrow_mut() = profiles;
        }
        let messages = enrich(records, &self.profiles.borrow());
        log::info!("Loaded {} messages for {channel}", messages.len());

        let mut store = self.store.borrow_mut();
        // a send whose write hasn't settled keeps its optimistic entry
        let outstanding = self
            .in_flight
            .get()
            .and_then(|temp_id| store.get(&MessageId::Temp(temp_id)).cloned());
        store.replace_all(messages);
        if let Some(pending) = outstanding {
            store.upsert_local(pending);
        }
        Ok(())
    }

    async fn open_subscription(&self) -> Result<(), FeedError> {
        let channel = &self.config.channel_id;
        let subscribed = self.backend.subscribe(channel).await;
        self.ensure_alive()?;

        match subscribed {
            Ok(stream) => {
                self.subscription.acquire(stream);
                log::info!("Subscribed to push events for {channel}");
                Ok(())
            }
            Err(e) => {
                log::warn!("Error subscribing to {channel}: {e}");
                self.push_notice(
                    Notice::error(
                        "Live updates unavailable",
                        "New messages will appear after a refresh",
                    )
                    .caused_by(e.clone().into()),
                );
                Err(e.into())
            }
        }
    }

    /// Waits for the next push event and applies it.
    /// Returns `false` once there is no subscription left to listen to.
    pub async fn next_push(&self) -> bool {
        match self.subscription.next().await {
            Some(Ok(event)) => {
                self.apply_push(event);
                true
            }
            Some(Err(e)) if self.alive.get() => self.resubscribe_after(e).await,
            Some(Err(_)) => false,
            None => {
                if self.alive.get() {
                    log::info!("Push feed for {} ended", self.config.channel_id);
                }
                false
            }
        }
    }

    /// Applies push events until the subscription closes.
    pub async fn run_push_loop(&self) {
        while self.next_push().await {}
    }

    async fn resubscribe_after(&self, error: SubscriptionError) -> bool {
        log::warn!("{error}, resubscribing");
        let _flusher = FlushLater::new(self);
        self.push_notice(
            Notice::error("Connection lost", "Live updates were interrupted, reconnecting")
                .caused_by(error.into()),
        );
        self.flush_notifications();
        self.open_subscription().await.is_ok()
    }

    /// Applies one push event: inserts are added unless already present, updates replace
    /// the known entry in place.
    pub fn apply_push(&self, event: PushEvent) {
        if !self.alive.get() {
            return;
        }
        let _flusher = FlushLater::new(self);

        match event {
            PushEvent::Insert(record) => {
                let profile = self.profiles.borrow().get(&record.user_id).cloned();
                let message = Message::confirmed(record, profile.as_ref());
                let id = message.id.clone();
                if !self.store.borrow_mut().append_if_absent(message) {
                    log::debug!("Message {id} is already in the feed");
                }
            }
            PushEvent::Update(record) => {
                let profile = self.profiles.borrow().get(&record.user_id).cloned();
                let mut message = Message::confirmed(record, profile.as_ref());

                let mut store = self.store.borrow_mut();
                if message.sender_name.is_none() {
                    if let Some(existing) = store.get(&message.id) {
                        message.sender_name = existing.sender_name.clone();
                        message.sender_avatar = existing.sender_avatar.clone();
                    }
                }
                store.apply_update(message);
            }
        }
    }

    /// Sends a message. The optimistic entry is visible as soon as this is first polled.
    ///
    /// With `anonymous`, the entry shows the anonymous label instead of the user's name; the
    /// store still records the real author.
    pub async fn send_message(&self, body: MessageBody, anonymous: bool) -> Result<TempId, FeedError> {
        let _flusher = FlushLater::new(self);
        let (user, _sending) = self.begin_send()?;
        self.deliver(user, body, anonymous).await
    }

    /// Uploads a file, then sends it as an attachment message.
    pub async fn send_attachment(
        &self,
        blobs: &impl BlobStore,
        upload: Upload,
        anonymous: bool,
    ) -> Result<TempId, FeedError> {
        let _flusher = FlushLater::new(self);
        let (user, _sending) = self.begin_send()?;

        let bucket = &self.config.attachments_bucket;
        let path = format!(
            "{}/{}-{}",
            self.config.channel_id,
            Utc::now().timestamp_millis(),
            upload.name
        );
        self.push_notice(Notice::info("Uploading", format!("Uploading {}...", upload.name)));
        self.flush_notifications();

        let uploaded = blobs
            .upload(bucket, &path, &upload, self.config.attachment_cache_seconds)
            .await;
        self.ensure_alive()?;
        let url = match uploaded {
            Ok(url) => url,
            Err(e) => {
                log::error!("Error uploading {}: {e}", upload.name);
                self.push_notice(
                    Notice::error("Upload failed", e.to_string())
                        .caused_by(FeedError::UploadFailed(e.clone())),
                );
                if let UploadError::MissingBucket { bucket } = &e {
                    self.push_notice(Notice::error(
                        "Missing storage bucket",
                        format!("Create a storage bucket named '{bucket}' to enable uploads."),
                    ));
                }
                return Err(FeedError::UploadFailed(e));
            }
        };

        let body = MessageBody::Attachment(AttachmentDescriptor {
            kind: AttachmentKind::from_mime(&upload.mime),
            url,
            size: upload.bytes.len() as u64,
            name: upload.name.clone(),
            mime: upload.mime.clone(),
        });
        let temp_id = self.deliver(user, body, anonymous).await?;
        self.push_notice(Notice::info("Uploaded", format!("{} uploaded", upload.name)));
        Ok(temp_id)
    }

    /// Sends the content of a failed entry again, under a new temporary id.
    pub async fn retry_failed(&self, temp_id: TempId, anonymous: bool) -> Result<TempId, FeedError> {
        let _flusher = FlushLater::new(self);
        let (user, _sending) = self.begin_send()?;

        let failed_body = self
            .store
            .borrow()
            .get(&MessageId::Temp(temp_id))
            .filter(|message| message.state == LocalState::Failed)
            .map(|message| message.body.clone());
        let Some(body) = failed_body else {
            return Err(FeedError::NothingToRetry(temp_id));
        };
        self.store.borrow_mut().discard_local(temp_id);
        self.deliver(user, body, anonymous).await
    }

    /// Checks the preconditions shared by every kind of send and raises the sending flag.
    fn begin_send(&self) -> Result<(CurrentUser, SendingGuard<'_, B, A>), FeedError> {
        self.ensure_alive()?;
        if self.sending.get() {
            log::warn!("Rejecting send while another one is in flight");
            return Err(FeedError::SendInFlight);
        }
        let Some(user) = self.auth.current_user() else {
            self.push_notice(
                Notice::error("Authentication required", "Please sign in to send messages")
                    .caused_by(FeedError::AuthRequired),
            );
            return Err(FeedError::AuthRequired);
        };

        self.sending.set(true);
        self.store.borrow_mut().mark_changed();
        Ok((user, SendingGuard { session: self }))
    }

    async fn deliver(
        &self,
        user: CurrentUser,
        body: MessageBody,
        anonymous: bool,
    ) -> Result<TempId, FeedError> {
        let temp_id = self.next_temp_id();
        let new_message = NewMessage {
            content: body.to_content(),
            user_id: user.id.clone(),
            channel_id: self.config.channel_id.clone(),
        };
        let (sender_name, sender_avatar) = if anonymous {
            (Some(self.config.anonymous_label.clone()), None)
        } else {
            (user.display_name, user.avatar_url)
        };

        self.store.borrow_mut().upsert_local(Message {
            id: MessageId::Temp(temp_id),
            body,
            created_at: Utc::now(),
            updated_at: None,
            channel_id: self.config.channel_id.clone(),
            author_id: user.id,
            sender_name,
            sender_avatar,
            state: LocalState::Pending,
        });
        self.in_flight.set(Some(temp_id));
        self.flush_notifications();

        let written = self.backend.insert(new_message).await;
        self.in_flight.set(None);
        if !self.alive.get() {
            log::debug!("Dropping result of {temp_id}, the session was closed");
            let mut store = self.store.borrow_mut();
            match written {
                Ok(()) => {
                    store.discard_local(temp_id);
                }
                Err(_) => {
                    store.mark_failed(temp_id);
                }
            }
            return Err(FeedError::SessionClosed);
        }

        match written {
            Ok(()) => {
                log::info!("Sent {temp_id}, refreshing the feed");
                self.settling.set(Some(temp_id));
                let refreshed = self.fetch_and_replace().await;
                self.settling.set(None);
                // normally the refetch has already replaced it
                let leftover = self.store.borrow_mut().discard_local(temp_id);
                if let Err(FeedError::SessionClosed) = refreshed {
                    return Err(FeedError::SessionClosed);
                }
                if leftover.is_some() {
                    log::warn!("Feed wasn't refreshed after {temp_id}, dropping its placeholder");
                }
                Ok(temp_id)
            }
            Err(source) => {
                log::error!("Error sending {temp_id}: {source}");
                self.store.borrow_mut().mark_failed(temp_id);
                let error = FeedError::WriteFailed { temp_id, source };
                self.push_notice(
                    Notice::error("Error", "Failed to send message").caused_by(error.clone()),
                );
                Err(error)
            }
        }
    }
}

impl<B, A> Drop for FeedSession<B, A> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Flushes listeners when dropped, whichever way the function that holds it returns.
struct FlushLater<'a, B, A> {
    session: &'a FeedSession<B, A>,
}

impl<'a, B, A> FlushLater<'a, B, A> {
    fn new(session: &'a FeedSession<B, A>) -> Self {
        Self { session }
    }
}

impl<B, A> Drop for FlushLater<'_, B, A> {
    fn drop(&mut self) {
        self.session.flush_notifications();
    }
}

/// Lowers the sending flag when a send finishes, including when its future is dropped
/// half-way. A write abandoned like that has an unknown outcome, so its entry is marked
/// failed; one abandoned after the write went through just loses its placeholder.
struct SendingGuard<'a, B, A> {
    session: &'a FeedSession<B, A>,
}

impl<B, A> Drop for SendingGuard<'_, B, A> {
    fn drop(&mut self) {
        let session = self.session;
        session.sending.set(false);
        let mut store = session.store.borrow_mut();
        if let Some(temp_id) = session.in_flight.take() {
            store.mark_failed(temp_id);
        }
        if let Some(temp_id) = session.settling.take() {
            store.discard_local(temp_id);
        }
        store.mark_changed();
    }
}
