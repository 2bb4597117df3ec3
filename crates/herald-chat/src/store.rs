//! In-memory conversation state shared between the controller and the UI.
//!
//! Readers get cloned snapshots. Every mutation is announced on a broadcast
//! channel so views can re-render without polling.

use herald_types::{Conversation, Feedback, Message};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationUpdate {
    Created { conversation_id: String },
    MessageAdded { conversation_id: String, message_id: String },
    MessageUpdated { conversation_id: String, message_id: String },
    MessageRemoved { conversation_id: String, message_id: String },
    Removed { conversation_id: String },
}

#[derive(Clone)]
pub struct ConversationStore {
    conversations: Arc<Mutex<HashMap<String, Conversation>>>,
    updates: broadcast::Sender<ConversationUpdate>,
}

impl ConversationStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
            updates,
        }
    }

    /// Insert `conversation`, replacing any conversation with the same id
    pub fn insert(&self, conversation: Conversation) {
        let conversation_id = conversation.id.clone();
        self.lock().insert(conversation_id.clone(), conversation);
        self.notify(ConversationUpdate::Created { conversation_id });
    }

    /// Create an empty conversation with a fresh id and return that id
    pub fn create(&self) -> String {
        let conversation = Conversation::new(uuid::Uuid::new_v4().to_string());
        let id = conversation.id.clone();
        self.insert(conversation);
        id
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock().get(conversation_id).cloned()
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.lock().contains_key(conversation_id)
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.lock()
            .get(conversation_id)
            .and_then(|c| c.message(message_id).cloned())
    }

    pub fn remove(&self, conversation_id: &str) -> Option<Conversation> {
        let removed = self.lock().remove(conversation_id);
        if removed.is_some() {
            self.notify(ConversationUpdate::Removed {
                conversation_id: conversation_id.to_string(),
            });
        }
        removed
    }

    /// Run `f` against a conversation while holding the store lock.
    ///
    /// Returns `None` when the conversation does not exist. Callers announce
    /// their own changes through [`ConversationStore::notify`].
    pub fn update<R>(&self, conversation_id: &str, f: impl FnOnce(&mut Conversation) -> R) -> Option<R> {
        self.lock().get_mut(conversation_id).map(f)
    }

    pub fn set_feedback(&self, conversation_id: &str, message_id: &str, feedback: Option<Feedback>) -> bool {
        let applied = self
            .update(conversation_id, |c| c.update_message(message_id, |m| m.feedback = feedback))
            .unwrap_or(false);
        if applied {
            self.notify(ConversationUpdate::MessageUpdated {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        applied
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationUpdate> {
        self.updates.subscribe()
    }

    /// Announce a change; dropped silently when nobody listens
    pub fn notify(&self, update: ConversationUpdate) {
        let _ = self.updates.send(update);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_snapshot() {
        let store = ConversationStore::new();
        store.insert(Conversation::new("c1").with_title("Quarterly report"));

        let snapshot = store.get("c1").unwrap();
        assert_eq!(snapshot.title.as_deref(), Some("Quarterly report"));
        assert!(store.contains("c1"));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_update_on_missing_conversation() {
        let store = ConversationStore::new();
        assert!(store.update("missing", |c| c.push(Message::user("hi"))).is_none());
    }

    #[tokio::test]
    async fn test_mutations_are_broadcast() {
        let store = ConversationStore::new();
        let mut updates = store.subscribe();

        let id = store.create();
        let message = Message::assistant_placeholder();
        let message_id = message.id.clone();
        store.update(&id, |c| c.push(message));
        store.set_feedback(&id, &message_id, Some(Feedback::Positive));

        assert_eq!(
            updates.recv().await.unwrap(),
            ConversationUpdate::Created { conversation_id: id.clone() }
        );
        assert_eq!(
            updates.recv().await.unwrap(),
            ConversationUpdate::MessageUpdated {
                conversation_id: id.clone(),
                message_id: message_id.clone(),
            }
        );
        assert_eq!(
            store.message(&id, &message_id).unwrap().feedback,
            Some(Feedback::Positive)
        );
    }
}
