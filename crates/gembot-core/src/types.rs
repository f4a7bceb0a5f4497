use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// One role-tagged message of a conversation. Only text survives storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TurnRepr")]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<TextPart>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }

    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![TextPart { text: text.into() }],
        }
    }

    /// All text fragments joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Deserialize)]
struct TurnRepr {
    role: Role,
    #[serde(default)]
    parts: Vec<PartRepr>,
}

// Older history files stored bare strings as parts; non-text parts are dropped.
#[derive(Deserialize)]
#[serde(untagged)]
enum PartRepr {
    Text { text: String },
    Bare(String),
    Other(Value),
}

impl From<TurnRepr> for Turn {
    fn from(repr: TurnRepr) -> Self {
        let parts = repr
            .parts
            .into_iter()
            .filter_map(|p| match p {
                PartRepr::Text { text } | PartRepr::Bare(text) => Some(TextPart { text }),
                PartRepr::Other(_) => None,
            })
            .collect();
        Turn {
            role: repr.role,
            parts,
        }
    }
}

/// Routing decision for one user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    FunctionCall,
    Grounding,
    Hybrid,
    GeneralConversation,
}

impl Intent {
    pub const ALL: [Intent; 4] = [
        Intent::FunctionCall,
        Intent::Grounding,
        Intent::Hybrid,
        Intent::GeneralConversation,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Intent::FunctionCall => "FUNCTION_CALL",
            Intent::Grounding => "GROUNDING",
            Intent::Hybrid => "HYBRID",
            Intent::GeneralConversation => "GENERAL_CONVERSATION",
        }
    }

    /// Exact label match after trimming; anything else is general conversation.
    pub fn from_label(raw: &str) -> Intent {
        let label = raw.trim();
        Intent::ALL
            .into_iter()
            .find(|intent| intent.label() == label)
            .unwrap_or(Intent::GeneralConversation)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat_id: String,
    pub sender: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(flatten)]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    Text { content: String },
    Image { path: PathBuf },
    /// A "pat" notification from the chat client.
    Tickle { content: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub text: Option<String>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl OutboundReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            files: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Success,
    Failure,
    Error,
}

/// Result of one segmentation tool invocation, fed back to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub status: SegmentStatus,
    pub message: String,
    pub generated_files: Vec<PathBuf>,
}

impl SegmentOutcome {
    pub fn success(message: impl Into<String>, generated_files: Vec<PathBuf>) -> Self {
        Self {
            status: SegmentStatus::Success,
            message: message.into(),
            generated_files,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: SegmentStatus::Failure,
            message: message.into(),
            generated_files: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SegmentStatus::Error,
            message: message.into(),
            generated_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub queue_capacity: usize,
    pub queue_available: usize,
    pub known_sessions: usize,
}
