//! This is a library for keeping a chat channel's feed in sync with a hosted store.
//!
//! Syncing strategy:
//! 1. When a session starts, every row of the channel is fetched, the authors are looked up,
//!    and the result replaces the local feed.
//! 2. While the session is alive, push events from the store are merged in: inserts are added
//!    unless they're already there, updates replace the entry in place.
//! 3. When the user sends a message, it shows up right away as a pending entry. Once the
//!    durable write goes through, the whole feed is fetched again so the pending entry gets
//!    replaced by the real row. If the write fails, the entry stays and is marked failed.
//!
//! Only one send may be in flight at a time, and nothing that completes after the session is
//! torn down is applied.

pub mod collaborators;
pub mod config;
pub mod data_model;
pub mod enrichment;
pub mod error;
pub mod memory;
pub mod session;

#[cfg(feature = "supabase")]
pub mod supabase;

mod subscription;

pub use collaborators::{
    AuthProvider, AuthState, Backend, BlobStore, IdentityDirectory, MessageStore, PushFeed,
    PushStream, Upload,
};
pub use config::FeedConfig;
pub use error::{FeedError, StoreError, SubscriptionError, UploadError};
pub use session::{FeedSession, Notice, SessionStatus, Severity};
