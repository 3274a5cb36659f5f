use std::time::Duration;

use feedsync::data_model::{ChannelId, NewMessage, Profile, UserId};
use feedsync::memory::MemoryBackend;

const REGULARS: [(&str, &str, &str); 2] = [
    ("demo-alice", "Alice", "https://avatars.example/alice.png"),
    ("demo-bob", "Bob", "https://avatars.example/bob.png"),
];

const CHATTER: [(&str, &str); 5] = [
    ("demo-bob", "anyone up for lunch?"),
    ("demo-alice", "the build is green again"),
    ("demo-lurker", "first time posting here, hi all"),
    ("demo-bob", "who moved the meeting to 4pm"),
    ("demo-alice", "reminder: demo day is friday"),
];

/// A store with a couple of known people and some history in `channel`.
pub fn seeded_backend(channel: &ChannelId) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for (id, name, avatar) in REGULARS {
        backend.add_profile(Profile {
            user_id: UserId::from(id),
            display_name: Some(name.to_string()),
            avatar_url: Some(avatar.to_string()),
        });
    }
    for (user, content) in &CHATTER[..2] {
        backend.insert_row(NewMessage {
            content: content.to_string(),
            user_id: UserId::from(*user),
            channel_id: channel.clone(),
        });
    }
    backend
}

/// Posts a line of chatter from someone else every `every`, so there's something to push.
pub async fn chatter(backend: MemoryBackend, channel: ChannelId, every: Duration) {
    for (user, content) in CHATTER.iter().cycle().skip(2) {
        tokio::time::sleep(every).await;
        let record = backend.insert_row(NewMessage {
            content: content.to_string(),
            user_id: UserId::from(*user),
            channel_id: channel.clone(),
        });
        log::debug!("Demo chatter posted {}", record.id);
    }
}
