use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FieldError;

/// Sender id used for assistant replies.
pub const AI_SENDER: &str = "ai";

pub const MAX_MESSAGE_LEN: usize = 10_000;
const MAX_CLIENT_ID_LEN: usize = 64;

/// A chat message embedded in a project's message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn from_ai(text: String, session_id: Option<String>, model_type: Option<String>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            sender: AI_SENDER.to_string(),
            sender_name: Some("AI".to_string()),
            text,
            session_id,
            model_type,
            created_at: Utc::now(),
        }
    }

    pub fn is_from_ai(&self) -> bool {
        self.sender == AI_SENDER
    }
}

/// Message payload as sent by clients over REST or the socket. `id` is the
/// client's optimistic id; resending the same id never duplicates the message.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(alias = "message")]
    pub text: String,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default, alias = "modelType")]
    pub model_type: Option<String>,
}

impl NewMessage {
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if self.text.trim().is_empty() {
            errors.push(FieldError::new("text", "Message text is required"));
        } else if self.text.chars().count() > MAX_MESSAGE_LEN {
            errors.push(FieldError::new(
                "text",
                format!("Message text must be at most {} characters", MAX_MESSAGE_LEN),
            ));
        }
        if let Some(id) = &self.id {
            if id.is_empty() || id.len() > MAX_CLIENT_ID_LEN {
                errors.push(FieldError::new("id", "Message id must be 1-64 characters"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn into_message(self, sender: &str, sender_name: Option<String>) -> Message {
        Message {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender: sender.to_string(),
            sender_name,
            text: self.text,
            session_id: self.session_id,
            model_type: self.model_type,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> NewMessage {
        NewMessage {
            id: None,
            text: text.to_string(),
            session_id: None,
            model_type: None,
        }
    }

    #[test]
    fn blank_text_is_rejected() {
        let errors = payload("   ").validate().unwrap_err();
        assert_eq!(errors[0].field, "text");
    }

    #[test]
    fn keeps_client_id() {
        let mut msg = payload("hi");
        msg.id = Some("client-1".into());
        assert!(msg.validate().is_ok());
        let stored = msg.into_message("u1", Some("ada".into()));
        assert_eq!(stored.id, "client-1");
        assert_eq!(stored.sender, "u1");
        assert!(!stored.is_from_ai());
    }

    #[test]
    fn accepts_socket_field_names() {
        let msg: NewMessage =
            serde_json::from_str(r#"{"message":"@ai hi","sessionId":"s1","modelType":"gemini"}"#)
                .unwrap();
        assert_eq!(msg.text, "@ai hi");
        assert_eq!(msg.session_id.as_deref(), Some("s1"));
        assert_eq!(msg.model_type.as_deref(), Some("gemini"));
    }
}
