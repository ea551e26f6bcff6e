use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chat message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single role/content pair as sent over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Chat completion request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: i32 = 2048;

impl ChatRequest {
    /// Streaming request with the default sampling parameters
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            temperature: Some(DEFAULT_TEMPERATURE),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
        }
    }
}

/// Current time as milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A message in the visible transcript
///
/// `content` is append-only while `in_progress` is true and immutable once
/// it flips to false. At most one message per session is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    pub model_id: String,
    #[serde(default)]
    pub in_progress: bool,
}

impl Message {
    pub fn user(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            created_at: now_millis(),
            model_id: model_id.into(),
            in_progress: false,
        }
    }

    /// Empty assistant message that accumulates streamed deltas
    pub fn assistant_placeholder(model_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            created_at: now_millis(),
            model_id: model_id.into(),
            in_progress: true,
        }
    }
}

/// An ordered conversation owned by the session reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub model_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

impl Session {
    pub fn new(model_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            model_id: model_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The transcript as wire messages, oldest first
    pub fn wire_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

/// Denormalized projection of a session used for list display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub timestamp: i64,
    #[serde(default)]
    pub pinned: bool,
}

impl From<&Session> for Conversation {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            timestamp: session.updated_at,
            pinned: false,
        }
    }
}

/// UI theme preference
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "light" => Some(Theme::Light),
            "dark" => Some(Theme::Dark),
            "system" => Some(Theme::System),
            _ => None,
        }
    }
}
