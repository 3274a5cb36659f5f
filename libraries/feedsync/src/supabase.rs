//! Utilities for syncing a channel against a Supabase project.
//!
//! Rows go through PostgREST (`messages` and `profiles` tables), attachments through Supabase
//! Storage. Realtime isn't spoken here, so subscribing is refused and the session carries on
//! without live updates: the feed only changes on explicit refreshes and after the user's own
//! sends.

use postgrest::Postgrest;
use serde::de::DeserializeOwned;

use crate::collaborators::{BlobStore, IdentityDirectory, MessageStore, PushFeed, PushStream, Upload};
use crate::data_model::{ChannelId, MessageRecord, NewMessage, Profile, UserId};
use crate::error::{StoreError, SubscriptionError, UploadError};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SupabaseConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

#[derive(Debug, thiserror::Error)]
#[error("environment variable {0} is not set")]
pub struct MissingEnvVar(pub &'static str);

impl SupabaseConfig {
    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
    pub fn from_env() -> Result<Self, MissingEnvVar> {
        let var = |name: &'static str| std::env::var(name).map_err(|_| MissingEnvVar(name));
        Ok(Self {
            supabase_url: var("SUPABASE_URL")?.trim_end_matches('/').to_string(),
            supabase_anon_key: var("SUPABASE_ANON_KEY")?,
        })
    }
}

pub struct SupabaseBackend {
    config: SupabaseConfig,
    access_token: Option<String>,
    http: reqwest::Client,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            config,
            access_token: None,
            http: reqwest::Client::new(),
        }
    }

    /// Makes requests on behalf of a signed-in user instead of with the anon key.
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    fn bearer(&self) -> &str {
        self.access_token
            .as_deref()
            .unwrap_or(&self.config.supabase_anon_key)
    }

    fn rest(&self) -> Postgrest {
        let SupabaseConfig {
            supabase_url,
            supabase_anon_key,
        } = &self.config;
        Postgrest::new(format!("{supabase_url}/rest/v1"))
            .insert_header("apikey", supabase_anon_key)
            .insert_header("Authorization", format!("Bearer {}", self.bearer()))
    }

    /// `<supabase_url>/storage/v1/object/<prefix..>/<bucket>/<path>`, with each segment escaped.
    fn storage_url(&self, prefix: &[&str], bucket: &str, path: &str) -> Result<reqwest::Url, UploadError> {
        let mut url = reqwest::Url::parse(&self.config.supabase_url)
            .map_err(|e| UploadError::Transport(format!("invalid Supabase URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| UploadError::Transport("Supabase URL can't have a path".to_string()))?
            .pop_if_empty()
            .extend(["storage", "v1", "object"])
            .extend(prefix)
            .push(bucket)
            .extend(path.split('/'));
        Ok(url)
    }
}

fn transport(error: impl std::fmt::Display) -> StoreError {
    StoreError::Transport(error.to_string())
}

fn decode<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, StoreError> {
    if !(200..300).contains(&status) {
        return Err(StoreError::Status {
            status,
            body: body.to_string(),
        });
    }
    serde_json::from_str(body)
        .map_err(|e| StoreError::Decode(format!("{e}\nResponse body: {body}")))
}

impl MessageStore for SupabaseBackend {
    async fn fetch_channel(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>, StoreError> {
        let response = self
            .rest()
            .from("messages")
            .select("*")
            .eq("channel_id", channel.as_str())
            .order("created_at.asc")
            .execute()
            .await
            .map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        decode(status, &body)
    }

    async fn insert(&self, message: NewMessage) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&message).map_err(|e| StoreError::Decode(e.to_string()))?;
        let response = self
            .rest()
            .from("messages")
            .insert(payload)
            .execute()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

impl IdentityDirectory for SupabaseBackend {
    async fn lookup_profiles(&self, user_ids: &[UserId]) -> Result<Vec<Profile>, StoreError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .rest()
            .from("profiles")
            .select("user_id, display_name, avatar_url")
            .in_("user_id", user_ids.iter().map(UserId::as_str))
            .execute()
            .await
            .map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        decode(status, &body)
    }
}

impl PushFeed for SupabaseBackend {
    async fn subscribe(&self, channel: &ChannelId) -> Result<PushStream, SubscriptionError> {
        log::warn!("No realtime connection for {channel}, the feed will only update on refresh and after sends");
        Err(SubscriptionError::Refused("realtime is not supported".to_string()))
    }
}

impl BlobStore for SupabaseBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        upload: &Upload,
        cache_seconds: u32,
    ) -> Result<String, UploadError> {
        let url = self.storage_url(&[], bucket, path)?;
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.supabase_anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .header("Content-Type", &upload.mime)
            .header("Cache-Control", format!("max-age={cache_seconds}"))
            .header("x-upsert", "false")
            .body(upload.bytes.clone())
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            // Storage reports a missing bucket as a 404, sometimes wrapped in a 400
            if status == reqwest::StatusCode::NOT_FOUND || message.contains("Bucket not found") {
                return Err(UploadError::MissingBucket {
                    bucket: bucket.to_string(),
                });
            }
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let public_url = self.storage_url(&["public"], bucket, path)?;
        log::info!("Uploaded {} to {bucket}/{path}", upload.name);
        Ok(public_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SupabaseBackend {
        SupabaseBackend::new(SupabaseConfig {
            supabase_url: "https://project.supabase.co".to_string(),
            supabase_anon_key: "anon".to_string(),
        })
    }

    #[test]
    fn test_storage_urls_escape_segments() {
        let url = backend()
            .storage_url(&["public"], "attachments", "general/17-my cat.png")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://project.supabase.co/storage/v1/object/public/attachments/general/17-my%20cat.png"
        );
    }

    #[test]
    fn test_decode_reports_status_and_bad_bodies() {
        let rows: Vec<Profile> =
            decode(200, r#"[{"user_id": "u1", "display_name": "Alice", "avatar_url": null}]"#)
                .unwrap();
        assert_eq!(rows[0].display_name.as_deref(), Some("Alice"));

        assert!(matches!(
            decode::<Vec<Profile>>(401, "nope"),
            Err(StoreError::Status { status: 401, .. })
        ));
        assert!(matches!(
            decode::<Vec<Profile>>(200, "not json"),
            Err(StoreError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_is_refused() {
        let subscribed = backend().subscribe(&ChannelId::from("general")).await;
        assert!(matches!(subscribed, Err(SubscriptionError::Refused(_))));
    }

    #[test]
    fn test_access_token_replaces_anon_key() {
        assert_eq!(backend().bearer(), "anon");
        assert_eq!(backend().with_access_token("jwt").bearer(), "jwt");
    }
}
