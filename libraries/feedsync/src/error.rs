use crate::data_model::TempId;

/// Failures talking to the durable message store or the identity lookup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(String),

    #[error("store responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode store response: {0}")]
    Decode(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// The storage location does not exist. Needs to be created before uploads can work.
    #[error("storage bucket `{bucket}` does not exist")]
    MissingBucket { bucket: String },

    #[error("upload rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("upload failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    #[error("push subscription could not be opened: {0}")]
    Refused(String),

    #[error("push subscription dropped: {0}")]
    Dropped(String),
}

/// Everything a session reports to its caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("failed to load messages")]
    FetchFailed(#[source] StoreError),

    #[error("failed to resolve sender names")]
    IdentityLookupFailed(#[source] StoreError),

    #[error("authentication required: sign in to send messages")]
    AuthRequired,

    #[error("failed to send message {temp_id}")]
    WriteFailed {
        temp_id: TempId,
        #[source]
        source: StoreError,
    },

    #[error("failed to upload attachment")]
    UploadFailed(#[source] UploadError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("another message is still being sent")]
    SendInFlight,

    #[error("no failed message {0} to retry")]
    NothingToRetry(TempId),

    #[error("the channel session has been closed")]
    SessionClosed,
}
