use serde::{Deserialize, Serialize};

use crate::data_model::ChannelId;

/// Settings for one channel session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub channel_id: ChannelId,
    /// Shown instead of the sender's name for anonymous or unresolved messages.
    pub anonymous_label: String,
    /// Shown for the user's own pending messages when they have no display name.
    pub self_label: String,
    /// Blob storage bucket that attachments are uploaded to.
    pub attachments_bucket: String,
    /// `Cache-Control` max-age, in seconds, for uploaded attachments.
    pub attachment_cache_seconds: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_id: ChannelId::from("fun-friday-group"),
            anonymous_label: "Anonymous".to_string(),
            self_label: "You".to_string(),
            attachments_bucket: "attachments".to_string(),
            attachment_cache_seconds: 3600,
        }
    }
}

impl FeedConfig {
    pub fn for_channel(channel_id: impl Into<ChannelId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: FeedConfig =
            serde_json::from_str(r#"{"channel_id": "team", "anonymous_label": "Someone"}"#)
                .unwrap();
        assert_eq!(config.channel_id, ChannelId::from("team"));
        assert_eq!(config.anonymous_label, "Someone");
        assert_eq!(config.self_label, "You");
        assert_eq!(config.attachments_bucket, "attachments");
    }
}
