//! Resolving author ids to display names and avatars.
//! Nothing here is stored durably: it is recomputed with every full fetch.

use std::collections::{HashMap, HashSet};

use crate::data_model::{Message, MessageRecord, Profile, UserId};

/// Distinct author ids of `records`, in the order they first appear.
pub fn author_ids(records: &[MessageRecord]) -> Vec<UserId> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for record in records {
        if seen.insert(&record.user_id) {
            ids.push(record.user_id.clone());
        }
    }
    ids
}

/// Joins rows against known profiles. Authors without a profile stay unresolved.
pub fn enrich(records: Vec<MessageRecord>, profiles: &ProfileCache) -> Vec<Message> {
    records
        .into_iter()
        .map(|record| {
            let profile = profiles.get(&record.user_id);
            Message::confirmed(record, profile)
        })
        .collect()
}

/// The identity rows returned by the latest lookup, keyed by user id.
#[derive(Clone, Debug, Default)]
pub struct ProfileCache {
    profiles: HashMap<UserId, Profile>,
}

impl ProfileCache {
    pub fn get(&self, user_id: &UserId) -> Option<&Profile> {
        self.profiles.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl FromIterator<Profile> for ProfileCache {
    fn from_iter<I: IntoIterator<Item = Profile>>(iter: I) -> Self {
        Self {
            profiles: iter
                .into_iter()
                .map(|profile| (profile.user_id.clone(), profile))
                .collect(),
        }
    }
}
