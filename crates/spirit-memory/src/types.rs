use serde::{Deserialize, Serialize};

/// Which of the three context tiers a [`MemoryBlock`] belongs to.
///
/// Core blocks are concatenated verbatim into every system prompt; working
/// blocks are surfaced as a "[Working Memory Context]" pseudo-message when
/// present; archival blocks (mostly compactor-produced summaries) are only
/// reachable through `memory_read` semantic search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Core,
    Working,
    Archival,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "core"),
            Self::Working => write!(f, "working"),
            Self::Archival => write!(f, "archival"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(Self::Core),
            "working" => Ok(Self::Working),
            "archival" => Ok(Self::Archival),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Write policy attached to a [`MemoryBlock`]. See spec §4.2's permission matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Readonly,
    Familiar,
    Append,
    Readwrite,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Readonly => write!(f, "readonly"),
            Self::Familiar => write!(f, "familiar"),
            Self::Append => write!(f, "append"),
            Self::Readwrite => write!(f, "readwrite"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(Self::Readonly),
            "familiar" => Ok(Self::Familiar),
            "append" => Ok(Self::Append),
            "readwrite" => Ok(Self::Readwrite),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Kind of a [`MemoryEvent`] — always one row per permission-allowed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Archive,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Archive => write!(f, "archive"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "archive" => Ok(Self::Archive),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Resolution state of a [`PendingMutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for MutationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown mutation status: {other}")),
        }
    }
}

/// A typed, permissioned block of persistent context.
///
/// `(owner, label)` is unique. `embedding`, when present, always has the
/// configured dimensionality — the manager either embeds on apply or leaves
/// it absent; it never stores a mismatched vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: String,
    pub owner: String,
    pub tier: Tier,
    pub label: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub permission: Permission,
    pub pinned: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Immutable append-only record of a permission-allowed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: String,
    pub block_id: String,
    pub event_type: EventType,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    pub created_at: String,
}

/// A deferred write against a `familiar` block, awaiting out-of-band approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: String,
    pub block_id: String,
    pub proposed_content: String,
    pub reason: Option<String>,
    pub status: MutationStatus,
    pub feedback: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

/// Role of a [`ConversationMessage`] in the model dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A tool invocation recorded on an assistant message's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Immutable append-only conversation log entry.
///
/// Invariant: every `role=tool` message has a strictly earlier `role=assistant`
/// message in the same conversation whose `tool_calls` contains a `ToolUse`
/// with matching `id`. Deleted only by the compactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<Vec<ToolUse>>,
    pub tool_call_id: Option<String>,
    pub created_at: String,
}

/// An archival artifact produced by the compactor.
///
/// Stored as a memory block of tier `archival` labeled
/// `compaction-batch-<conversation_id>-<endTime-iso>` with content
/// `[depth:N|start:ISO|end:ISO|count:M]\n<text>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryBatch {
    pub content: String,
    pub depth: u32,
    pub start_time: String,
    pub end_time: String,
    pub message_count: usize,
}

/// `{source, content, metadata, timestamp}` envelope emitted by an external
/// message source (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub source: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
