use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FeedConfig;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// The partition key of the feed. A session only ever looks at one channel.
    ChannelId
);
string_id!(UserId);

/// Identifier handed out to optimistic entries before the store has assigned a real id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub u64);

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

/// Serialized with an explicit tag (`{"stored": "…"}` or `{"temp": 3}`), so a store id that
/// happens to look like `temp-3` never turns into a local one.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageId {
    /// Assigned by the durable store. Stable once assigned.
    Stored(String),
    /// Local-only id of an optimistic entry.
    Temp(TempId),
}

impl MessageId {
    pub fn stored(id: impl Into<String>) -> Self {
        Self::Stored(id.into())
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self {
            MessageId::Stored(_) => None,
            MessageId::Temp(temp) => Some(*temp),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Stored(id) => f.write_str(id),
            MessageId::Temp(temp) => temp.fmt(f),
        }
    }
}

impl From<TempId> for MessageId {
    fn from(temp: TempId) -> Self {
        MessageId::Temp(temp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }
}

/// Metadata of an uploaded file. The file itself lives in blob storage at `url`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Attachment(AttachmentDescriptor),
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text(text.into())
    }

    /// Decodes the store's `content` column.
    ///
    /// The store only has a single text column, so attachments are kept there as a JSON
    /// object tagged with `"type": "image" | "file"`. Anything that isn't such an object
    /// is plain text.
    pub fn from_content(content: &str) -> Self {
        if content.trim_start().starts_with('{') {
            if let Ok(descriptor) = serde_json::from_str::<AttachmentDescriptor>(content) {
                return MessageBody::Attachment(descriptor);
            }
        }
        MessageBody::Text(content.to_string())
    }

    /// Encodes the body for the store's `content` column. Inverse of [`MessageBody::from_content`].
    pub fn to_content(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Attachment(descriptor) => serde_json::json!({
                "type": descriptor.kind.as_str(),
                "url": descriptor.url,
                "name": descriptor.name,
                "size": descriptor.size,
                "mime": descriptor.mime,
            })
            .to_string(),
        }
    }

    /// One-line rendering, for logs and terminals.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Attachment(descriptor) => {
                format!("[{}] {} <{}>", descriptor.kind.as_str(), descriptor.name, descriptor.url)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalState {
    /// Came from the store, either through a fetch or a push event.
    #[default]
    Confirmed,
    /// Sent locally, waiting on the durable write.
    Pending,
    /// Sent locally, the durable write was rejected.
    Failed,
}

/// A row of the durable `messages` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub user_id: UserId,
    pub channel_id: ChannelId,
}

/// A row of the identity lookup. Missing rows mean "unresolved", not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// What gets written to the store. The store assigns `id` and `created_at`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: String,
    pub user_id: UserId,
    pub channel_id: ChannelId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushEvent {
    Insert(MessageRecord),
    Update(MessageRecord),
}

impl PushEvent {
    pub fn record(&self) -> &MessageRecord {
        match self {
            PushEvent::Insert(record) | PushEvent::Update(record) => record,
        }
    }
}

/// The signed-in user, as reported by the authentication provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    /// `None` means unresolved or anonymous.
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub state: LocalState,
}

impl Message {
    /// Builds a confirmed message from a store row, attaching the author's profile if known.
    pub fn confirmed(record: MessageRecord, profile: Option<&Profile>) -> Self {
        let MessageRecord {
            id,
            content,
            created_at,
            updated_at,
            user_id,
            channel_id,
        } = record;

        Self {
            id: MessageId::Stored(id),
            body: MessageBody::from_content(&content),
            created_at,
            updated_at,
            channel_id,
            author_id: user_id,
            sender_name: profile.and_then(|p| p.display_name.clone()),
            sender_avatar: profile.and_then(|p| p.avatar_url.clone()),
            state: LocalState::Confirmed,
        }
    }

    pub fn is_local(&self) -> bool {
        self.state != LocalState::Confirmed
    }

    pub fn temp_id(&self) -> Option<TempId> {
        self.id.temp_id()
    }

    pub fn is_anonymous(&self) -> bool {
        self.sender_name.is_none() && self.state != LocalState::Pending
    }

    /// Name to show next to the message.
    pub fn sender_label<'a>(&'a self, config: &'a FeedConfig) -> &'a str {
        match (&self.sender_name, self.state) {
            (Some(name), _) => name,
            (None, LocalState::Pending) => &config.self_label,
            (None, _) => &config.anonymous_label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, content: &str) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            content: content.to_string(),
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            updated_at: None,
            user_id: UserId::from("u1"),
            channel_id: ChannelId::from("general"),
        }
    }

    #[test]
    fn test_plain_text_content() {
        assert_eq!(
            MessageBody::from_content("hello there"),
            MessageBody::text("hello there")
        );
        // json that doesn't describe an attachment stays text
        assert_eq!(
            MessageBody::from_content(r#"{"hello": "there"}"#),
            MessageBody::text(r#"{"hello": "there"}"#)
        );
    }

    #[test]
    fn test_attachment_content() {
        let content = r#"{"type":"image","url":"https://cdn/x.png","name":"x.png","size":12,"mime":"image/png"}"#;
        let body = MessageBody::from_content(content);
        assert_eq!(
            body,
            MessageBody::Attachment(AttachmentDescriptor {
                kind: AttachmentKind::Image,
                url: "https://cdn/x.png".to_string(),
                name: "x.png".to_string(),
                size: 12,
                mime: "image/png".to_string(),
            })
        );
        assert_eq!(MessageBody::from_content(&body.to_content()), body);
    }

    #[test]
    fn test_attachment_kind_from_mime() {
        assert_eq!(AttachmentKind::from_mime("image/jpeg"), AttachmentKind::Image);
        assert_eq!(AttachmentKind::from_mime("application/pdf"), AttachmentKind::File);
        assert_eq!(AttachmentKind::from_mime(""), AttachmentKind::File);
    }

    #[test]
    fn test_message_id_forms() {
        let temp = MessageId::Temp(TempId(42));
        assert_eq!(temp.to_string(), "temp-42");
        assert_eq!(serde_json::to_string(&temp).unwrap(), r#"{"temp":42}"#);
        assert_eq!(
            serde_json::from_str::<MessageId>(r#"{"temp":42}"#).unwrap(),
            temp
        );

        // a store id shaped like a temp id stays a store id
        let lookalike = MessageId::stored("temp-42");
        assert_eq!(lookalike.to_string(), "temp-42");
        assert_eq!(lookalike.temp_id(), None);
        let json = serde_json::to_string(&lookalike).unwrap();
        assert_eq!(json, r#"{"stored":"temp-42"}"#);
        assert_eq!(serde_json::from_str::<MessageId>(&json).unwrap(), lookalike);
        assert_ne!(lookalike, temp);
    }

    #[test]
    fn test_store_row_with_temp_shaped_id_is_confirmed() {
        let message = Message::confirmed(record("temp-7", "hi"), None);
        assert_eq!(message.id, MessageId::stored("temp-7"));
        assert_eq!(message.temp_id(), None);
    }

    #[test]
    fn test_record_from_store_json() {
        let json = r#"{
            "id": "a1",
            "content": "hi",
            "created_at": "2025-03-01T10:00:00.123456+00:00",
            "updated_at": null,
            "user_id": "u1",
            "channel_id": "fun-friday-group"
        }"#;
        let record: MessageRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "a1");
        assert_eq!(record.updated_at, None);
        assert_eq!(record.channel_id.as_str(), "fun-friday-group");
    }

    #[test]
    fn test_confirmed_message_takes_profile() {
        let profile = Profile {
            user_id: UserId::from("u1"),
            display_name: Some("Alice".to_string()),
            avatar_url: None,
        };
        let message = Message::confirmed(record("1", "hi"), Some(&profile));
        assert_eq!(message.id, MessageId::stored("1"));
        assert_eq!(message.sender_name.as_deref(), Some("Alice"));
        assert_eq!(message.state, LocalState::Confirmed);
        assert!(!message.is_anonymous());

        let unresolved = Message::confirmed(record("2", "hi"), None);
        assert!(unresolved.is_anonymous());
    }

    #[test]
    fn test_sender_label_fallbacks() {
        let config = FeedConfig::default();
        let mut message = Message::confirmed(record("1", "hi"), None);
        assert_eq!(message.sender_label(&config), "Anonymous");

        message.state = LocalState::Pending;
        assert_eq!(message.sender_label(&config), "You");

        message.sender_name = Some("Bob".to_string());
        assert_eq!(message.sender_label(&config), "Bob");
    }
}
