//! Prompt assembly for the extractor
//!
//! The system prompt fixes the output contract; the user prompt stacks
//! the schema, an epic snapshot when the event is bound to one, related
//! knowledge snippets, and finally the transcript.

use super::schema::SCHEMA_TEXT;
use crate::store::types::{Action, Epic, NoteKind, TrackedNote};
use crate::store::Store;
use anyhow::Result;

pub const SYSTEM_PROMPT: &str = "\
You convert a tech lead's voice memo transcript into structured project data.\n\
Rules:\n\
- Answer with a single JSON object and nothing else: no prose, no code fences.\n\
- Use only the labels: EpicUpdate, KnowledgeNote, ActionItem, Decision, Blocker, Issue.\n\
- All dates must be ISO-8601.\n\
- Be conservative: when unsure whether something is an action or a note, prefer\n\
  needs_review=true over guessing.\n\
- Never invent people, dates or epic ids that are not supported by the transcript\n\
  or the provided context.";

/// Open work attached to an epic, included so the model can update
/// rather than duplicate.
pub struct EpicSnapshot {
    pub epic: Epic,
    pub aliases: Vec<String>,
    pub open_blockers: Vec<TrackedNote>,
    pub open_dependencies: Vec<TrackedNote>,
    pub open_issues: Vec<TrackedNote>,
    pub open_actions: Vec<Action>,
    pub recent_excerpts: Vec<String>,
}

const SNAPSHOT_OPEN_ACTIONS: usize = 10;
const SNAPSHOT_EXCERPTS: usize = 3;
const SNAPSHOT_EXCERPT_CHARS: usize = 200;
const KNOWLEDGE_SNIPPETS: usize = 5;

pub fn build_epic_snapshot(store: &Store, epic: Epic) -> Result<EpicSnapshot> {
    let aliases = store
        .list_epic_aliases(&epic.id)?
        .into_iter()
        .map(|a| a.alias)
        .collect();
    let open_blockers = store.open_notes_for_epic(NoteKind::Blocker, &epic.id)?;
    let open_dependencies = store.open_notes_for_epic(NoteKind::Dependency, &epic.id)?;
    let open_issues = store.open_notes_for_epic(NoteKind::Issue, &epic.id)?;
    let open_actions = store.open_actions_for_epic(&epic.id, SNAPSHOT_OPEN_ACTIONS)?;
    let recent_excerpts =
        store.recent_event_excerpts(&epic.id, SNAPSHOT_EXCERPTS, SNAPSHOT_EXCERPT_CHARS)?;
    Ok(EpicSnapshot {
        epic,
        aliases,
        open_blockers,
        open_dependencies,
        open_issues,
        open_actions,
        recent_excerpts,
    })
}

/// Assemble the user prompt: schema, optional epic snapshot, related
/// knowledge, transcript.
pub fn build_user_prompt(
    store: &Store,
    snapshot: Option<&EpicSnapshot>,
    transcript: &str,
) -> Result<String> {
    let mut prompt = String::with_capacity(4096);

    prompt.push_str("Output JSON schema:\n");
    prompt.push_str(SCHEMA_TEXT);
    prompt.push('\n');

    if let Some(snapshot) = snapshot {
        prompt.push_str("\n## Current epic\n");
        prompt.push_str(&format!(
            "Title: {}\nAliases: {}\n",
            snapshot.epic.title,
            snapshot.aliases.join(", ")
        ));
        if let Some(description) = &snapshot.epic.description {
            prompt.push_str(&format!("Description: {}\n", description));
        }
        if !snapshot.open_blockers.is_empty() {
            prompt.push_str("Open blockers:\n");
            for note in &snapshot.open_blockers {
                prompt.push_str(&format!("- {}\n", note.description));
            }
        }
        if !snapshot.open_dependencies.is_empty() {
            prompt.push_str("Open dependencies:\n");
            for note in &snapshot.open_dependencies {
                prompt.push_str(&format!("- {}\n", note.description));
            }
        }
        if !snapshot.open_issues.is_empty() {
            prompt.push_str("Open issues:\n");
            for note in &snapshot.open_issues {
                prompt.push_str(&format!("- {}\n", note.description));
            }
        }
        if !snapshot.open_actions.is_empty() {
            prompt.push_str("Open actions:\n");
            for action in &snapshot.open_actions {
                prompt.push_str(&format!(
                    "- [{}] {}\n",
                    action.priority.as_str(),
                    action.title
                ));
            }
        }
        if !snapshot.recent_excerpts.is_empty() {
            prompt.push_str("Recent memo excerpts:\n");
            for excerpt in &snapshot.recent_excerpts {
                prompt.push_str(&format!("> {}\n", excerpt));
            }
        }
    }

    let knowledge = store.search_knowledge(transcript, KNOWLEDGE_SNIPPETS)?;
    if !knowledge.is_empty() {
        prompt.push_str("\n## Related knowledge\n");
        for hit in &knowledge {
            prompt.push_str(&format!("- {}: {}\n", hit.title, hit.content));
        }
    }

    prompt.push_str("\n## Transcript\n");
    prompt.push_str(transcript);
    Ok(prompt)
}

/// Follow-up prompt after an invalid response: truncate what the model
/// said, name the violation, restate the contract.
pub fn build_retry_prompt(previous_response: &str, error: &str) -> String {
    const PREVIOUS_LIMIT: usize = 500;
    let truncated: String = previous_response
        .chars()
        .take(PREVIOUS_LIMIT)
        .collect();
    format!(
        "Your previous response was invalid.\n\nResponse (truncated):\n{}\n\n\
         Validation error: {}\n\n\
         Answer again with ONLY a single JSON object matching the schema. \
         No prose, no code fences, ISO-8601 dates.",
        truncated, error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::KnowledgeKind;
    use crate::store::projections::{KnowledgeInsert, ProjectionBatch};

    #[test]
    fn user_prompt_contains_schema_and_transcript() {
        let (_dir, store) = Store::open_temp().unwrap();
        let prompt = build_user_prompt(&store, None, "ship the login fix").unwrap();
        assert!(prompt.contains("Output JSON schema"));
        assert!(prompt.contains("ship the login fix"));
        assert!(!prompt.contains("## Current epic"));
    }

    #[test]
    fn snapshot_section_lists_open_work() {
        let (_dir, store) = Store::open_temp().unwrap();
        let epic = store.create_epic("E1", "Payments", None).unwrap();
        store.create_event("ev0", "/tmp/a.ogg", None).unwrap();
        store
            .replace_projections(
                "ev0",
                Some("E1"),
                &ProjectionBatch {
                    blockers: vec![crate::store::projections::NoteInsert {
                        description: "waiting on PCI review".into(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let snapshot = build_epic_snapshot(&store, epic).unwrap();
        assert_eq!(snapshot.open_blockers.len(), 1);

        let prompt = build_user_prompt(&store, Some(&snapshot), "memo text").unwrap();
        assert!(prompt.contains("## Current epic"));
        assert!(prompt.contains("waiting on PCI review"));
    }

    #[test]
    fn knowledge_snippets_are_included_when_matching() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_event("ev0", "/tmp/a.ogg", None).unwrap();
        store
            .replace_projections(
                "ev0",
                None,
                &ProjectionBatch {
                    knowledge: vec![KnowledgeInsert {
                        title: "Deploy cadence".into(),
                        kind: KnowledgeKind::Process,
                        tags: vec![],
                        body_md: "We deploy on Tuesdays.".into(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let prompt = build_user_prompt(&store, None, "when do we deploy").unwrap();
        assert!(prompt.contains("Related knowledge"));
        assert!(prompt.contains("Deploy cadence"));
    }

    #[test]
    fn retry_prompt_truncates_previous_response() {
        let long = "x".repeat(2000);
        let prompt = build_retry_prompt(&long, "response is not valid JSON");
        assert!(prompt.contains(&"x".repeat(500)));
        assert!(!prompt.contains(&"x".repeat(501)));
        assert!(prompt.contains("response is not valid JSON"));
    }
}
