//! Extractor output schema
//!
//! The model must answer with a single JSON object matching this shape.
//! Parsing is two-staged: first into a `serde_json::Value` (catches
//! malformed JSON), then into the typed struct (catches shape errors),
//! then `validate()` (catches cross-field rules like ISO dates). The
//! resulting error text is fed back verbatim in the retry prompt.

use crate::store::types::{ActionType, KnowledgeKind, Priority};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    EpicUpdate,
    KnowledgeNote,
    ActionItem,
    Decision,
    Blocker,
    Issue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEpic {
    pub epic_id: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicMention {
    pub name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub title: String,
    pub priority: Priority,
    #[serde(default)]
    pub due_at: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeadline {
    pub title: String,
    pub priority: Priority,
    pub due_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNote {
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKnowledgeItem {
    pub title: String,
    pub kind: KnowledgeKind,
    #[serde(default)]
    pub tags: Vec<String>,
    pub body_md: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

/// Top-level extractor output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionOutput {
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub resolved_epic: Option<ResolvedEpic>,
    #[serde(default)]
    pub epic_mentions: Vec<EpicMention>,
    #[serde(default)]
    pub new_actions: Vec<NewAction>,
    #[serde(default)]
    pub new_deadlines: Vec<NewDeadline>,
    #[serde(default)]
    pub blockers: Vec<NewNote>,
    #[serde(default)]
    pub dependencies: Vec<NewNote>,
    #[serde(default)]
    pub issues: Vec<NewNote>,
    #[serde(default)]
    pub knowledge_items: Vec<NewKnowledgeItem>,
    #[serde(default)]
    pub email_drafts: Vec<EmailDraft>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub evidence_snippets: Vec<String>,
}

/// JSON schema text included in the prompt so the model knows the shape.
pub const SCHEMA_TEXT: &str = r#"{
  "labels": ["EpicUpdate" | "KnowledgeNote" | "ActionItem" | "Decision" | "Blocker" | "Issue"],
  "resolved_epic": {"epic_id": "string", "confidence": 0.0} | null,
  "epic_mentions": [{"name": "string", "confidence": 0.0}],
  "new_actions": [{"type": "follow_up" | "deadline" | "email", "title": "string",
                   "priority": "P0" | "P1" | "P2", "due_at": "ISO-8601 or null",
                   "mentions": ["string"], "body": "string"}],
  "new_deadlines": [{"title": "string", "priority": "P0" | "P1" | "P2", "due_at": "ISO-8601"}],
  "blockers": [{"description": "string"}],
  "dependencies": [{"description": "string"}],
  "issues": [{"description": "string"}],
  "knowledge_items": [{"title": "string", "kind": "tech" | "decision" | "process",
                       "tags": ["string"], "body_md": "string"}],
  "email_drafts": [{"subject": "string", "body": "string"}],
  "needs_review": false,
  "evidence_snippets": ["string"]
}"#;

impl ExtractionOutput {
    /// Cross-field rules serde cannot express. Returns the first
    /// violation as the error text used in the retry prompt.
    pub fn validate(&self) -> Result<(), String> {
        for (i, action) in self.new_actions.iter().enumerate() {
            if action.title.trim().is_empty() {
                return Err(format!("new_actions[{}].title must not be empty", i));
            }
            if let Some(due) = &action.due_at {
                check_iso8601(due)
                    .map_err(|e| format!("new_actions[{}].due_at: {}", i, e))?;
            }
        }
        for (i, deadline) in self.new_deadlines.iter().enumerate() {
            if deadline.title.trim().is_empty() {
                return Err(format!("new_deadlines[{}].title must not be empty", i));
            }
            check_iso8601(&deadline.due_at)
                .map_err(|e| format!("new_deadlines[{}].due_at: {}", i, e))?;
        }
        for (name, notes) in [
            ("blockers", &self.blockers),
            ("dependencies", &self.dependencies),
            ("issues", &self.issues),
        ] {
            for (i, note) in notes.iter().enumerate() {
                if note.description.trim().is_empty() {
                    return Err(format!("{}[{}].description must not be empty", name, i));
                }
            }
        }
        for (i, item) in self.knowledge_items.iter().enumerate() {
            if item.title.trim().is_empty() {
                return Err(format!("knowledge_items[{}].title must not be empty", i));
            }
        }
        for (i, draft) in self.email_drafts.iter().enumerate() {
            if draft.subject.trim().is_empty() {
                return Err(format!("email_drafts[{}].subject must not be empty", i));
            }
        }
        if let Some(resolved) = &self.resolved_epic {
            if !(0.0..=1.0).contains(&resolved.confidence) {
                return Err("resolved_epic.confidence must be within [0, 1]".into());
            }
        }
        Ok(())
    }
}

fn check_iso8601(s: &str) -> Result<(), String> {
    // Accept full RFC 3339 timestamps and bare dates.
    if chrono::DateTime::parse_from_rfc3339(s).is_ok() {
        return Ok(());
    }
    if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
        return Ok(());
    }
    Err(format!("'{}' is not an ISO-8601 date", s))
}

/// Strip a fenced code block wrapper if the model added one despite the
/// output rules.
pub fn unwrap_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json") on the opening fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse and validate one model response.
pub fn parse_response(raw: &str) -> Result<ExtractionOutput, String> {
    let unwrapped = unwrap_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(unwrapped)
        .map_err(|e| format!("response is not valid JSON: {}", e))?;
    let output: ExtractionOutput = serde_json::from_value(value)
        .map_err(|e| format!("response does not match the schema: {}", e))?;
    output.validate()?;
    Ok(output)
}
