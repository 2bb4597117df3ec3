use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata attached by the server to a completed answer
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
}

/// A single turn in a conversation.
///
/// Assistant messages start as an empty placeholder with `is_streaming = true`,
/// grow as fragments arrive and end with `is_streaming = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.into(),
            is_streaming: false,
            timestamp: Utc::now(),
            feedback: None,
            metadata: None,
        }
    }

    /// Create an empty assistant message that incoming fragments are written into
    pub fn assistant_placeholder() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            is_streaming: true,
            timestamp: Utc::now(),
            feedback: None,
            metadata: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.role == MessageRole::Assistant && self.is_streaming && self.content.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Append a message and bump `updated_at`
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Mutate a message in place. Returns `false` if the id is unknown.
    pub fn update_message(&mut self, id: &str, f: impl FnOnce(&mut Message)) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        f(message);
        self.touch();
        true
    }

    /// Remove a message, returning it if it was present
    pub fn remove_message(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        let removed = self.messages.remove(index);
        self.touch();
        Some(removed)
    }

    /// The message currently receiving fragments, if any
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_streaming)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // Keep updated_at monotonic even if the wall clock steps back.
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_shape() {
        let msg = Message::assistant_placeholder();
        assert_eq!(msg.role, MessageRole::Assistant);
        assert!(msg.is_streaming);
        assert!(msg.content.is_empty());
        assert!(msg.is_placeholder());
    }

    #[test]
    fn test_conversation_mutations_bump_updated_at() {
        let mut conv = Conversation::new("c1");
        let created = conv.updated_at;

        let user = Message::user("hi");
        let user_id = user.id.clone();
        conv.push(user);
        assert!(conv.updated_at >= created);

        let before = conv.updated_at;
        assert!(conv.update_message(&user_id, |m| m.content.push('!')));
        assert!(conv.updated_at >= before);
        assert_eq!(conv.message(&user_id).unwrap().content, "hi!");

        assert!(!conv.update_message("missing", |_| {}));
        assert!(conv.remove_message(&user_id).is_some());
        assert!(conv.messages.is_empty());
    }

    #[test]
    fn test_streaming_message_lookup() {
        let mut conv = Conversation::new("c1");
        conv.push(Message::user("question"));
        assert!(conv.streaming_message().is_none());

        let placeholder = Message::assistant_placeholder();
        let id = placeholder.id.clone();
        conv.push(placeholder);
        assert_eq!(conv.streaming_message().map(|m| m.id.as_str()), Some(id.as_str()));
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"isStreaming\":false"));
        assert!(json.contains("\"role\":\"user\""));
        assert!(!json.contains("feedback"));
    }
}
