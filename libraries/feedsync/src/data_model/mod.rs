//! # Data model
//! A channel's feed is a list of [`Message`]s. Rows come from the durable store as
//! [`MessageRecord`]s and get joined against [`Profile`]s to resolve who sent them.
//! Messages the user sends are shown immediately as local entries (see [`LocalState`])
//! and are replaced by the authoritative rows once the write settles.

mod feed_store;
mod message;

pub use feed_store::{FeedStore, ListenerKey};
pub use message::{
    AttachmentDescriptor, AttachmentKind, ChannelId, CurrentUser, LocalState, Message,
    MessageBody, MessageId, MessageRecord, NewMessage, Profile, PushEvent, TempId, UserId,
};
