use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One entry in the conversation history. Immutable once appended, except
/// for the single in-place content replacement the session performs on the
/// reserved assistant slot when a stream finishes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self::with_attachments(role, content, Vec::new())
    }

    pub fn with_attachments(
        role: Role,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_millis(),
            attachments,
        }
    }
}

/// Reference to a picked document, resolved out-of-band.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DocumentRef {
    pub name: String,
    pub path: String,
    pub mime: String,
}

/// A file attached to the next user message. Starts in the loading state;
/// `loading` flips exactly once when the content has been resolved and a
/// short preview is available.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Attachment {
    pub id: String,
    pub doc: DocumentRef,
    pub loading: bool,
    pub preview: String,
}

impl Attachment {
    pub fn new(doc: DocumentRef) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            doc,
            loading: true,
            preview: String::new(),
        }
    }
}

fn now_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_default()
}
