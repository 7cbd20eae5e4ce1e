//! Domain row types shared by the repositories and the HTTP surface
//!
//! Every identifier is an opaque textual UUID and every timestamp is an
//! RFC 3339 UTC string, so rows serialize straight to the API without
//! conversion layers.

use serde::{Deserialize, Serialize};

// ============================================================================
// Events
// ============================================================================

/// Lifecycle state of a voice memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Transcribing,
    Transcribed,
    Processing,
    NeedsReview,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Transcribing => "transcribing",
            EventStatus::Transcribed => "transcribed",
            EventStatus::Processing => "processing",
            EventStatus::NeedsReview => "needs_review",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EventStatus::Queued),
            "transcribing" => Some(EventStatus::Transcribing),
            "transcribed" => Some(EventStatus::Transcribed),
            "processing" => Some(EventStatus::Processing),
            "needs_review" => Some(EventStatus::NeedsReview),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// A single voice memo and its lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    /// Path of the uploaded audio on disk; cleared after the TTL sweep.
    pub audio_path: Option<String>,
    pub language: Option<String>,
    pub transcript: Option<String>,
    pub transcript_expires_at: Option<String>,
    pub status: EventStatus,
    pub status_reason: Option<String>,
    /// Imperative command recognised at the head of the transcript
    /// ("file this under …"), kept for operator review.
    pub detected_command: Option<String>,
    /// Epic the last successful extract/reprocess bound this event to.
    pub epic_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Epics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Active,
    Archived,
}

impl EpicStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EpicStatus::Active => "active",
            EpicStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EpicStatus::Active),
            "archived" => Some(EpicStatus::Archived),
            _ => None,
        }
    }
}

/// Long-lived project container that groups projections across memos.
#[derive(Debug, Clone, Serialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: EpicStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpicAlias {
    pub epic_id: String,
    pub alias: String,
    /// Lowercased, trimmed, whitespace-collapsed form; unique globally.
    pub normalized: String,
}

// ============================================================================
// Projections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FollowUp,
    Deadline,
    Email,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::FollowUp => "follow_up",
            ActionType::Deadline => "deadline",
            ActionType::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "follow_up" => Some(ActionType::FollowUp),
            "deadline" => Some(ActionType::Deadline),
            "email" => Some(ActionType::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P0" => Some(Priority::P0),
            "P1" => Some(Priority::P1),
            "P2" => Some(Priority::P2),
            _ => None,
        }
    }

    /// P0/P1 actions trigger a push notification on creation.
    pub fn is_notifiable(self) -> bool {
        matches!(self, Priority::P0 | Priority::P1)
    }
}

/// Actionable item projected from a transcript. Deadlines and email drafts
/// are stored as actions with their own `action_type`.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub id: String,
    pub source_event_id: String,
    pub epic_id: Option<String>,
    pub action_type: ActionType,
    pub title: String,
    pub body: Option<String>,
    pub priority: Priority,
    pub due_at: Option<String>,
    pub completed_at: Option<String>,
    pub mentions: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Open,
    Resolved,
}

impl NoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteStatus::Open => "open",
            NoteStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(NoteStatus::Open),
            "resolved" => Some(NoteStatus::Resolved),
            _ => None,
        }
    }
}

/// Which projection table a tracked note lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    Blocker,
    Dependency,
    Issue,
}

impl NoteKind {
    pub fn table(self) -> &'static str {
        match self {
            NoteKind::Blocker => "blockers",
            NoteKind::Dependency => "dependencies",
            NoteKind::Issue => "issues",
        }
    }
}

/// Blocker, dependency or issue row; same shape, separate tables.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedNote {
    pub id: String,
    pub source_event_id: String,
    pub epic_id: Option<String>,
    pub description: String,
    pub status: NoteStatus,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    Tech,
    Decision,
    Process,
}

impl KnowledgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            KnowledgeKind::Tech => "tech",
            KnowledgeKind::Decision => "decision",
            KnowledgeKind::Process => "process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tech" => Some(KnowledgeKind::Tech),
            "decision" => Some(KnowledgeKind::Decision),
            "process" => Some(KnowledgeKind::Process),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub source_event_id: String,
    pub epic_id: Option<String>,
    pub title: String,
    pub kind: KnowledgeKind,
    /// Tag set, persisted as a compact JSON array.
    pub tags: Vec<String>,
    pub body_md: String,
    pub created_at: String,
}

// ============================================================================
// Candidates, runs, push
// ============================================================================

/// Ranked potential epic for an event, persisted for operator review.
#[derive(Debug, Clone, Serialize)]
pub struct EpicCandidate {
    pub event_id: String,
    pub epic_id: String,
    pub score: f64,
    pub rank: i64,
    pub match_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Retry,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Retry => "retry",
        }
    }
}

/// One observability row per pipeline step (STT, extract, reprocess,
/// push, TTL sweep).
#[derive(Debug, Clone, Serialize)]
pub struct EventRun {
    pub id: i64,
    pub event_id: String,
    pub job_type: String,
    pub status: String,
    pub input_snapshot: Option<String>,
    pub output_snapshot: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub user_agent: Option<String>,
    pub created_at: String,
}

/// Current UTC instant as the canonical timestamp string.
///
/// All rows store RFC 3339 with a fixed +00:00 offset so lexicographic
/// comparison in SQL matches chronological order.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fresh opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
