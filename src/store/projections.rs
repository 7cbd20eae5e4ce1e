//! Projection repository: actions, blockers, dependencies, issues,
//! knowledge items, mentions, and the per-event epic candidate list
//!
//! Extraction output is applied with delete-then-insert inside one
//! transaction, keyed on the source event, so re-running an extract or a
//! reprocess always converges to exactly what the last run produced.

use super::types::{
    now_rfc3339, Action, ActionType, EpicCandidate, KnowledgeItem, KnowledgeKind, NoteKind,
    NoteStatus, Priority, TrackedNote,
};
use super::Store;
use anyhow::{anyhow, Result};
use rusqlite::{params, Row};

// ─────────────────────────────────────────────────────────────────────────────
// Insert payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ActionInsert {
    pub action_type: ActionType,
    pub title: String,
    pub body: Option<String>,
    pub priority: Priority,
    pub due_at: Option<String>,
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NoteInsert {
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct KnowledgeInsert {
    pub title: String,
    pub kind: KnowledgeKind,
    pub tags: Vec<String>,
    pub body_md: String,
}

/// Everything one successful extract/reprocess writes for an event.
#[derive(Debug, Clone, Default)]
pub struct ProjectionBatch {
    pub actions: Vec<ActionInsert>,
    pub blockers: Vec<NoteInsert>,
    pub dependencies: Vec<NoteInsert>,
    pub issues: Vec<NoteInsert>,
    pub knowledge: Vec<KnowledgeInsert>,
}

/// Inserted action identity, returned so the caller can apply the push
/// policy (P0/P1 fan-out) after the transaction commits.
#[derive(Debug, Clone)]
pub struct InsertedAction {
    pub id: String,
    pub priority: Priority,
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<Action> {
    let action_type: String = row.get("action_type")?;
    let priority: String = row.get("priority")?;
    Ok(Action {
        id: row.get("id")?,
        source_event_id: row.get("source_event_id")?,
        epic_id: row.get("epic_id")?,
        action_type: ActionType::parse(&action_type).unwrap_or(ActionType::FollowUp),
        title: row.get("title")?,
        body: row.get("body")?,
        priority: Priority::parse(&priority).unwrap_or(Priority::P2),
        due_at: row.get("due_at")?,
        completed_at: row.get("completed_at")?,
        mentions: Vec::new(),
        created_at: row.get("created_at")?,
    })
}

fn row_to_note(row: &Row<'_>) -> rusqlite::Result<TrackedNote> {
    let status: String = row.get("status")?;
    Ok(TrackedNote {
        id: row.get("id")?,
        source_event_id: row.get("source_event_id")?,
        epic_id: row.get("epic_id")?,
        description: row.get("description")?,
        status: NoteStatus::parse(&status).unwrap_or(NoteStatus::Open),
        resolved_at: row.get("resolved_at")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_knowledge(row: &Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    let kind: String = row.get("kind")?;
    let tags: String = row.get("tags")?;
    Ok(KnowledgeItem {
        id: row.get("id")?,
        source_event_id: row.get("source_event_id")?,
        epic_id: row.get("epic_id")?,
        title: row.get("title")?,
        kind: KnowledgeKind::parse(&kind).unwrap_or(KnowledgeKind::Tech),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        body_md: row.get("body_md")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    // ─────────────────────────────────────────────────────────────────────
    // Projection writer
    // ─────────────────────────────────────────────────────────────────────

    /// Replace every projection of `event_id` with `batch`, binding all
    /// rows to `epic_id`, in one transaction. Returns the inserted
    /// actions so the caller can enqueue push notifications.
    pub fn replace_projections(
        &self,
        event_id: &str,
        epic_id: Option<&str>,
        batch: &ProjectionBatch,
    ) -> Result<Vec<InsertedAction>> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let mut inserted = Vec::new();

        // Mentions cascade with their actions.
        tx.execute("DELETE FROM actions WHERE source_event_id = ?1", params![event_id])?;
        tx.execute("DELETE FROM blockers WHERE source_event_id = ?1", params![event_id])?;
        tx.execute(
            "DELETE FROM dependencies WHERE source_event_id = ?1",
            params![event_id],
        )?;
        tx.execute("DELETE FROM issues WHERE source_event_id = ?1", params![event_id])?;
        tx.execute(
            "DELETE FROM knowledge_items WHERE source_event_id = ?1",
            params![event_id],
        )?;

        for action in &batch.actions {
            let id = super::types::new_id();
            tx.execute(
                "INSERT INTO actions
                     (id, source_event_id, epic_id, action_type, title, body, priority, due_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    event_id,
                    epic_id,
                    action.action_type.as_str(),
                    action.title,
                    action.body,
                    action.priority.as_str(),
                    action.due_at,
                    now
                ],
            )?;
            for name in &action.mentions {
                tx.execute(
                    "INSERT INTO action_mentions (action_id, name) VALUES (?1, ?2)",
                    params![id, name],
                )?;
            }
            inserted.push(InsertedAction {
                id,
                priority: action.priority,
            });
        }

        for (kind, notes) in [
            (NoteKind::Blocker, &batch.blockers),
            (NoteKind::Dependency, &batch.dependencies),
            (NoteKind::Issue, &batch.issues),
        ] {
            for note in notes.iter() {
                tx.execute(
                    &format!(
                        "INSERT INTO {} (id, source_event_id, epic_id, description, status, created_at)
                         VALUES (?1, ?2, ?3, ?4, 'open', ?5)",
                        kind.table()
                    ),
                    params![super::types::new_id(), event_id, epic_id, note.description, now],
                )?;
            }
        }

        for item in &batch.knowledge {
            tx.execute(
                "INSERT INTO knowledge_items
                     (id, source_event_id, epic_id, title, kind, tags, body_md, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    super::types::new_id(),
                    event_id,
                    epic_id,
                    item.title,
                    item.kind.as_str(),
                    serde_json::to_string(&item.tags)?,
                    item.body_md,
                    now
                ],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Projection reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn actions_for_event(&self, event_id: &str) -> Result<Vec<Action>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_event_id, epic_id, action_type, title, body, priority,
                    due_at, completed_at, created_at
             FROM actions WHERE source_event_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![event_id], row_to_action)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(self.attach_mentions(&conn, row?)?);
        }
        Ok(out)
    }

    pub fn get_action(&self, id: &str) -> Result<Option<Action>> {
        use rusqlite::OptionalExtension;
        let conn = self.reader()?;
        let action = conn
            .query_row(
                "SELECT id, source_event_id, epic_id, action_type, title, body, priority,
                        due_at, completed_at, created_at
                 FROM actions WHERE id = ?1",
                params![id],
                row_to_action,
            )
            .optional()?;
        match action {
            Some(a) => Ok(Some(self.attach_mentions(&conn, a)?)),
            None => Ok(None),
        }
    }

    fn attach_mentions(
        &self,
        conn: &rusqlite::Connection,
        mut action: Action,
    ) -> Result<Action> {
        let mut stmt =
            conn.prepare("SELECT name FROM action_mentions WHERE action_id = ?1 ORDER BY id")?;
        action.mentions = stmt
            .query_map(params![action.id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(action)
    }

    /// Ids of every action bound to an epic, open or completed, for
    /// scoping search results.
    pub fn action_ids_for_epic(&self, epic_id: &str) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT id FROM actions WHERE epic_id = ?1")?;
        let ids = stmt
            .query_map(params![epic_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Ids of every knowledge item bound to an epic.
    pub fn knowledge_ids_for_epic(&self, epic_id: &str) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT id FROM knowledge_items WHERE epic_id = ?1")?;
        let ids = stmt
            .query_map(params![epic_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Open (incomplete) actions bound to an epic, oldest first, for the
    /// extractor's epic snapshot.
    pub fn open_actions_for_epic(&self, epic_id: &str, limit: usize) -> Result<Vec<Action>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_event_id, epic_id, action_type, title, body, priority,
                    due_at, completed_at, created_at
             FROM actions
             WHERE epic_id = ?1 AND completed_at IS NULL
             ORDER BY created_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![epic_id, limit as i64], row_to_action)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn notes_for_event(&self, kind: NoteKind, event_id: &str) -> Result<Vec<TrackedNote>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, source_event_id, epic_id, description, status, resolved_at, created_at
             FROM {} WHERE source_event_id = ?1 ORDER BY created_at, id",
            kind.table()
        ))?;
        let rows = stmt.query_map(params![event_id], row_to_note)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn open_notes_for_epic(&self, kind: NoteKind, epic_id: &str) -> Result<Vec<TrackedNote>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, source_event_id, epic_id, description, status, resolved_at, created_at
             FROM {} WHERE epic_id = ?1 AND status = 'open' ORDER BY created_at",
            kind.table()
        ))?;
        let rows = stmt.query_map(params![epic_id], row_to_note)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn resolve_note(&self, kind: NoteKind, id: &str) -> Result<()> {
        let affected = self.writer().execute(
            &format!(
                "UPDATE {} SET status = 'resolved', resolved_at = ?1 WHERE id = ?2",
                kind.table()
            ),
            params![now_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(anyhow!("no such {} row: {}", kind.table(), id));
        }
        Ok(())
    }

    pub fn knowledge_for_event(&self, event_id: &str) -> Result<Vec<KnowledgeItem>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_event_id, epic_id, title, kind, tags, body_md, created_at
             FROM knowledge_items WHERE source_event_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![event_id], row_to_knowledge)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Recent transcript excerpts (≤ `max_chars` each) from other events
    /// already bound to an epic, newest first.
    pub fn recent_event_excerpts(
        &self,
        epic_id: &str,
        limit: usize,
        max_chars: usize,
    ) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT transcript FROM events
             WHERE epic_id = ?1 AND transcript IS NOT NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![epic_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let transcript = row?;
            out.push(truncate_chars(&transcript, max_chars));
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Epic candidates
    // ─────────────────────────────────────────────────────────────────────

    /// Rewrite the whole candidate list for an event atomically.
    pub fn replace_candidates(&self, event_id: &str, candidates: &[EpicCandidate]) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM event_epic_candidates WHERE event_id = ?1",
            params![event_id],
        )?;
        for candidate in candidates {
            tx.execute(
                "INSERT INTO event_epic_candidates (event_id, epic_id, score, rank, match_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event_id,
                    candidate.epic_id,
                    candidate.score,
                    candidate.rank,
                    candidate.match_type
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_candidates(&self, event_id: &str) -> Result<()> {
        self.writer().execute(
            "DELETE FROM event_epic_candidates WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    pub fn candidates_for_event(&self, event_id: &str) -> Result<Vec<EpicCandidate>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, epic_id, score, rank, match_type
             FROM event_epic_candidates WHERE event_id = ?1 ORDER BY rank",
        )?;
        let rows = stmt.query_map(params![event_id], |row| {
            Ok(EpicCandidate {
                event_id: row.get(0)?,
                epic_id: row.get(1)?,
                score: row.get(2)?,
                rank: row.get(3)?,
                match_type: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Truncate on a char boundary, appending an ellipsis when cut.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> ProjectionBatch {
        ProjectionBatch {
            actions: vec![ActionInsert {
                action_type: ActionType::FollowUp,
                title: "Check DB migration".into(),
                body: Some(String::new()),
                priority: Priority::P1,
                due_at: None,
                mentions: vec!["Ana".into()],
            }],
            blockers: vec![NoteInsert {
                description: "Waiting on infra ticket".into(),
            }],
            dependencies: vec![],
            issues: vec![],
            knowledge: vec![KnowledgeInsert {
                title: "Migration order".into(),
                kind: KnowledgeKind::Decision,
                tags: vec!["db".into()],
                body_md: "Run schema change before backfill.".into(),
            }],
        }
    }

    #[test]
    fn replace_is_idempotent() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_epic("E1", "Payments", None).unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();

        let batch = sample_batch();
        store.replace_projections("ev", Some("E1"), &batch).unwrap();
        store.replace_projections("ev", Some("E1"), &batch).unwrap();

        let actions = store.actions_for_event("ev").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].mentions, vec!["Ana".to_string()]);
        assert_eq!(store.notes_for_event(NoteKind::Blocker, "ev").unwrap().len(), 1);
        assert_eq!(store.knowledge_for_event("ev").unwrap().len(), 1);
    }

    #[test]
    fn replace_rebinds_to_new_epic() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_epic("E1", "Payments", None).unwrap();
        store.create_epic("E2", "Search", None).unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();

        store
            .replace_projections("ev", Some("E1"), &sample_batch())
            .unwrap();
        store
            .replace_projections("ev", Some("E2"), &sample_batch())
            .unwrap();

        let actions = store.actions_for_event("ev").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].epic_id.as_deref(), Some("E2"));
    }

    #[test]
    fn projections_cascade_with_event() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();
        store
            .replace_projections("ev", None, &sample_batch())
            .unwrap();

        store
            .writer()
            .execute("DELETE FROM events WHERE id = 'ev'", [])
            .unwrap();

        assert!(store.actions_for_event("ev").unwrap().is_empty());
        assert!(store
            .notes_for_event(NoteKind::Blocker, "ev")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn epic_id_sets_cover_only_the_epic() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_epic("E1", "Payments", None).unwrap();
        store.create_epic("E2", "Search", None).unwrap();
        store.create_event("ev1", "/tmp/a.ogg", None).unwrap();
        store.create_event("ev2", "/tmp/b.ogg", None).unwrap();
        store
            .replace_projections("ev1", Some("E1"), &sample_batch())
            .unwrap();
        store
            .replace_projections("ev2", Some("E2"), &sample_batch())
            .unwrap();

        let e1_actions = store.action_ids_for_epic("E1").unwrap();
        let e1_knowledge = store.knowledge_ids_for_epic("E1").unwrap();
        assert_eq!(e1_actions.len(), 1);
        assert_eq!(e1_knowledge.len(), 1);

        let e2_knowledge = store.knowledge_ids_for_epic("E2").unwrap();
        assert!(e1_knowledge
            .iter()
            .all(|id| !e2_knowledge.contains(id)));
    }

    #[test]
    fn candidate_list_is_rewritten_whole() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_epic("E1", "Payments", None).unwrap();
        store.create_epic("E2", "Search", None).unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();

        let first = vec![
            EpicCandidate {
                event_id: "ev".into(),
                epic_id: "E1".into(),
                score: 0.8,
                rank: 1,
                match_type: "fts".into(),
            },
            EpicCandidate {
                event_id: "ev".into(),
                epic_id: "E2".into(),
                score: 0.6,
                rank: 2,
                match_type: "fts".into(),
            },
        ];
        store.replace_candidates("ev", &first).unwrap();

        let second = vec![EpicCandidate {
            event_id: "ev".into(),
            epic_id: "E2".into(),
            score: 0.95,
            rank: 1,
            match_type: "exact".into(),
        }];
        store.replace_candidates("ev", &second).unwrap();

        let stored = store.candidates_for_event("ev").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].epic_id, "E2");
    }
}
