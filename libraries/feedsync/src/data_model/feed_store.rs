//! # FeedStore
//! The in-memory feed of one channel.
//!
//! Confirmed entries are kept sorted by `created_at` (ties stay in arrival order).
//! Local entries (pending or failed sends) trail the confirmed ones in the order they were
//! sent, so a freshly sent message always shows up last and snaps into its server position
//! on the next full fetch.
//!
//! Every operation is synchronous and total: none of them can break ordering or leave two
//! entries with the same id.

use std::collections::HashSet;
use std::rc::Rc;

use slotmap::SlotMap;

use crate::data_model::{LocalState, Message, MessageId, TempId};

slotmap::new_key_type! {
    pub struct ListenerKey;
}

type Listener = Rc<dyn Fn(ListenerKey)>;

#[derive(Default)]
pub struct FeedStore {
    messages: im::Vector<Message>,
    listeners: SlotMap<ListenerKey, Listener>,
    changed: bool,
}

impl FeedStore {
    /// Replaces the whole feed, e.g. after a full fetch.
    ///
    /// The input is expected to be sorted by `created_at` already. Local entries from
    /// earlier sends are dropped along with everything else.
    pub fn replace_all(&mut self, messages: impl IntoIterator<Item = Message>) {
        let mut seen = HashSet::new();
        let mut incoming: Vec<Message> = messages
            .into_iter()
            .filter(|message| seen.insert(message.id.clone()))
            .collect();

        if !incoming.is_sorted_by_key(|message| message.created_at) {
            log::warn!("replace_all received messages out of order, sorting them");
            incoming.sort_by_key(|message| message.created_at);
        }

        self.messages = incoming.into_iter().collect();
        self.changed = true;
    }

    /// Inserts a message from a push event at its sorted position.
    /// Returns `false` (and leaves the feed alone) if the id is already present.
    pub fn append_if_absent(&mut self, message: Message) -> bool {
        if self.position(&message.id).is_some() {
            return false;
        }

        if message.is_local() {
            self.messages.push_back(message);
        } else {
            let index = self.insertion_index(&message);
            self.messages.insert(index, message);
        }
        self.changed = true;
        true
    }

    /// Replaces the entry with the same id in place. Unknown ids are ignored: the row will
    /// show up with the next fetch.
    pub fn apply_update(&mut self, message: Message) -> bool {
        let Some(index) = self.position(&message.id) else {
            log::debug!("Ignoring update for unknown message {}", message.id);
            return false;
        };
        self.messages.set(index, message);
        self.changed = true;
        true
    }

    /// Adds an optimistic entry at the end of the feed, or replaces the one with the same id.
    pub fn upsert_local(&mut self, message: Message) {
        match self.position(&message.id) {
            Some(index) => {
                self.messages.set(index, message);
            }
            None => self.messages.push_back(message),
        }
        self.changed = true;
    }

    /// Flips a pending entry to failed. Returns `false` if it has already been superseded.
    pub fn mark_failed(&mut self, temp_id: TempId) -> bool {
        let Some(index) = self.position(&MessageId::Temp(temp_id)) else {
            return false;
        };
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        if message.state != LocalState::Pending {
            return false;
        }
        message.state = LocalState::Failed;
        self.changed = true;
        true
    }

    /// Removes a local entry, returning it if it was present.
    pub fn discard_local(&mut self, temp_id: TempId) -> Option<Message> {
        let index = self.position(&MessageId::Temp(temp_id))?;
        self.changed = true;
        Some(self.messages.remove(index))
    }

    /// A cheap snapshot of the feed.
    pub fn messages(&self) -> im::Vector<Message> {
        self.messages.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    /// Index right after the last confirmed entry that isn't newer than `message`.
    fn insertion_index(&self, message: &Message) -> usize {
        let len = self.messages.len();
        self.messages
            .iter()
            .rev()
            .position(|existing| !existing.is_local() && existing.created_at <= message.created_at)
            .map(|from_end| len - from_end)
            .unwrap_or(0)
    }

    // =======
    // listeners
    // =======

    pub fn register_listener(&mut self, listener: impl Fn(ListenerKey) + 'static) -> ListenerKey {
        self.listeners.insert(Rc::new(listener))
    }

    pub fn unregister_listener(&mut self, key: ListenerKey) {
        self.listeners.remove(key);
    }

    /// For state that lives outside the feed (loading, sending) but that listeners care about.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Hands back the callbacks that are due. They are returned rather than called so that
    /// the caller can release its borrow of the store first: listeners usually read it.
    pub fn drain_due_notifications(&mut self) -> Vec<Box<dyn FnOnce()>> {
        if !std::mem::take(&mut self.changed) {
            return Vec::new();
        }
        self.listeners
            .iter()
            .map(|(key, listener)| {
                let listener = Rc::clone(listener);
                Box::new(move || listener(key)) as Box<dyn FnOnce()>
            })
            .collect()
    }
}
