//! The services a session talks to. None of them are implemented here: see
//! [`crate::memory`] for an in-process implementation and `crate::supabase` for a hosted one.
//!
//! Futures returned by these traits are not required to be `Send`. A session runs on a
//! single thread and only suspends on these calls.

use std::cell::RefCell;
use std::rc::Rc;

use futures::stream::LocalBoxStream;

use crate::data_model::{ChannelId, CurrentUser, MessageRecord, NewMessage, Profile, PushEvent, UserId};
use crate::error::{StoreError, SubscriptionError, UploadError};

/// Stream of row events for one channel. Dropping it closes the subscription.
pub type PushStream = LocalBoxStream<'static, Result<PushEvent, SubscriptionError>>;

#[allow(async_fn_in_trait)]
pub trait MessageStore {
    /// Every row of `channel`, ordered by `created_at` ascending.
    async fn fetch_channel(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>, StoreError>;

    /// Writes a message. The store assigns its id and timestamp.
    async fn insert(&self, message: NewMessage) -> Result<(), StoreError>;
}

#[allow(async_fn_in_trait)]
pub trait IdentityDirectory {
    /// Profiles for as many of `user_ids` as are known. Unknown ids are simply absent.
    async fn lookup_profiles(&self, user_ids: &[UserId]) -> Result<Vec<Profile>, StoreError>;
}

#[allow(async_fn_in_trait)]
pub trait PushFeed {
    /// Opens a subscription that only delivers events for `channel`.
    async fn subscribe(&self, channel: &ChannelId) -> Result<PushStream, SubscriptionError>;
}

/// A file picked by the user, ready to upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[allow(async_fn_in_trait)]
pub trait BlobStore {
    /// Stores `upload` at `path` inside `bucket` and returns a public URL for it.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        upload: &Upload,
        cache_seconds: u32,
    ) -> Result<String, UploadError>;
}

/// Everything a session needs from its backing store.
pub trait Backend: MessageStore + IdentityDirectory + PushFeed {}

impl<T: MessageStore + IdentityDirectory + PushFeed> Backend for T {}

pub trait AuthProvider {
    /// The signed-in user, or `None` when signed out.
    fn current_user(&self) -> Option<CurrentUser>;
}

impl AuthProvider for Option<CurrentUser> {
    fn current_user(&self) -> Option<CurrentUser> {
        self.clone()
    }
}

impl<T: AuthProvider + ?Sized> AuthProvider for Rc<T> {
    fn current_user(&self) -> Option<CurrentUser> {
        (**self).current_user()
    }
}

/// A sign-in slot that can be flipped while a session is running.
#[derive(Debug, Default)]
pub struct AuthState {
    user: RefCell<Option<CurrentUser>>,
}

impl AuthState {
    pub fn signed_in(user: CurrentUser) -> Self {
        Self {
            user: RefCell::new(Some(user)),
        }
    }

    pub fn sign_in(&self, user: CurrentUser) {
        *self.user.borrow_mut() = Some(user);
    }

    pub fn sign_out(&self) {
        self.user.borrow_mut().take();
    }
}

impl AuthProvider for AuthState {
    fn current_user(&self) -> Option<CurrentUser> {
        self.user.borrow().clone()
    }
}
