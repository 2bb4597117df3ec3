use serde::{Deserialize, Serialize};

use crate::message::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    Chunk,
    Complete,
    Error,
}

/// One decoded unit of a chat stream payload
///
/// Wire shape: `{"type": "chunk" | "complete" | "error", "content": "...", "metadata": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFragment {
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,

    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl ChatFragment {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self {
            fragment_type: FragmentType::Chunk,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn complete(content: impl Into<String>) -> Self {
        Self {
            fragment_type: FragmentType::Complete,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            fragment_type: FragmentType::Error,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Final text carried by a `complete` fragment, if the server sent one
    pub fn final_content(&self) -> Option<&str> {
        match self.fragment_type {
            FragmentType::Complete if !self.content.is_empty() => Some(&self.content),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chunk() {
        let fragment: ChatFragment =
            serde_json::from_str(r#"{"type":"chunk","content":"Hel"}"#).unwrap();
        assert_eq!(fragment, ChatFragment::chunk("Hel"));
    }

    #[test]
    fn test_decode_complete_without_content() {
        let fragment: ChatFragment = serde_json::from_str(r#"{"type":"complete"}"#).unwrap();
        assert_eq!(fragment.fragment_type, FragmentType::Complete);
        assert_eq!(fragment.final_content(), None);
    }

    #[test]
    fn test_decode_complete_with_metadata() {
        let fragment: ChatFragment = serde_json::from_str(
            r#"{"type":"complete","content":"Hello.","metadata":{"sources":2}}"#,
        )
        .unwrap();
        assert_eq!(fragment.final_content(), Some("Hello."));
        assert_eq!(fragment.metadata.unwrap()["sources"], 2);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ChatFragment>(r#"{"type":"noise"}"#).is_err());
    }
}
