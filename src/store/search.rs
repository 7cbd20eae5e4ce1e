//! Full-text search over actions, knowledge items and epics
//!
//! The FTS5 table is kept in lockstep with the source tables by triggers
//! (see migration 2); `rebuild_search_index` repopulates it from scratch
//! and must produce the same ranked results as the incremental path.

use super::Store;
use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

/// Characters replaced with spaces before a user term reaches FTS5.
/// Everything here is FTS5 query syntax or a tokenizer delimiter.
const FTS_DELIMITERS: &[char] = &[
    '[', ']', '(', ')', '{', '}', ':', '^', '*', ',', '.', '/', ';', '!', '?', '@', '#', '$', '%',
    '&', '=', '+', '~', '`', '|', '\\', '-',
];

/// Escape a user-supplied search term for FTS5: double embedded quotes,
/// replace delimiter characters with spaces, collapse whitespace. An
/// empty result means "match nothing", never an FTS syntax error.
pub fn sanitize_fts_query(raw: &str) -> String {
    let doubled = raw.replace('"', "\"\"");
    let replaced: String = doubled
        .chars()
        .map(|c| if FTS_DELIMITERS.contains(&c) { ' ' } else { c })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One ranked search result. Lower rank = better match (bm25).
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub content_type: String,
    pub content_id: String,
    pub title: String,
    pub content: String,
    pub rank: f64,
}

/// Build an OR query over the first distinct significant terms of a
/// longer text, each term individually quoted. Free text (a transcript)
/// cannot match short rows as one phrase; per-term quoting keeps the
/// query syntax-safe while letting bm25 rank by overlap.
fn terms_or_query(text: &str, max_terms: usize) -> Option<String> {
    const MIN_TERM_CHARS: usize = 4;

    let sanitized = sanitize_fts_query(text);
    let mut seen = std::collections::HashSet::new();
    let terms: Vec<String> = sanitized
        .split_whitespace()
        .filter(|term| term.chars().count() >= MIN_TERM_CHARS)
        .filter(|term| seen.insert(term.to_lowercase()))
        .take(max_terms)
        .map(|term| format!("\"{}\"", term))
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(terms.join(" OR "))
}

impl Store {
    /// Ranked search across all three content kinds, phrase-safe.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let phrase = format!("\"{}\"", sanitized);

        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT content_type, content_id, title, content, bm25(search_index) AS rank
             FROM search_index
             WHERE search_index MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![phrase, limit as i64], |row| {
            Ok(SearchHit {
                content_type: row.get(0)?,
                content_id: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                rank: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Ranked search restricted to active epics, for the matcher's FTS
    /// stage. The query is typically a transcript, so it is matched as
    /// an OR over its significant terms.
    pub fn search_epics(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        const EPIC_QUERY_TERMS: usize = 24;
        let Some(phrase) = terms_or_query(query, EPIC_QUERY_TERMS) else {
            return Ok(Vec::new());
        };

        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT s.content_type, s.content_id, s.title, s.content, bm25(search_index) AS rank
             FROM search_index s
             JOIN epics e ON e.id = s.content_id
             WHERE search_index MATCH ?1
               AND s.content_type = 'epic'
               AND e.status = 'active'
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![phrase, limit as i64], |row| {
            Ok(SearchHit {
                content_type: row.get(0)?,
                content_id: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                rank: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Top knowledge snippets related to a transcript, for prompt
    /// assembly.
    pub fn search_knowledge(&self, transcript: &str, limit: usize) -> Result<Vec<SearchHit>> {
        const KNOWLEDGE_QUERY_TERMS: usize = 12;
        let Some(phrase) = terms_or_query(transcript, KNOWLEDGE_QUERY_TERMS) else {
            return Ok(Vec::new());
        };

        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT content_type, content_id, title, content, bm25(search_index) AS rank
             FROM search_index
             WHERE search_index MATCH ?1 AND content_type = 'knowledge'
             ORDER BY rank
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![phrase, limit as i64], |row| {
            Ok(SearchHit {
                content_type: row.get(0)?,
                content_id: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                rank: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deterministically repopulate the index from the source tables.
    /// Produces the same contents the triggers maintain incrementally.
    pub fn rebuild_search_index(&self) -> Result<()> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM search_index", [])?;
        tx.execute(
            "INSERT INTO search_index (content_type, content_id, title, content)
             SELECT 'action', id, title, COALESCE(body, '') FROM actions",
            [],
        )?;
        tx.execute(
            "INSERT INTO search_index (content_type, content_id, title, content)
             SELECT 'knowledge', id, title, body_md FROM knowledge_items",
            [],
        )?;
        tx.execute(
            "INSERT INTO search_index (content_type, content_id, title, content)
             SELECT 'epic', id, title, COALESCE(description, '') FROM epics",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{ActionType, KnowledgeKind, Priority};
    use crate::store::projections::{ActionInsert, KnowledgeInsert, ProjectionBatch};

    #[test]
    fn sanitizer_strips_delimiters_and_doubles_quotes() {
        assert_eq!(sanitize_fts_query("hello world"), "hello world");
        assert_eq!(sanitize_fts_query("a[b]c{d}:e^f*g"), "a b c d e f g");
        assert_eq!(sanitize_fts_query("\"quoted\""), "\"\"quoted\"\"");
        assert_eq!(sanitize_fts_query("-./;!?@#$%&=+~`|\\"), "");
        assert_eq!(sanitize_fts_query("  spaced   out  "), "spaced out");
    }

    #[test]
    fn terms_query_dedupes_and_quotes() {
        let query = terms_or_query("Fix the checkout, fix the CHECKOUT flow!", 10).unwrap();
        assert_eq!(query, "\"checkout\" OR \"flow\"");
        assert!(terms_or_query("a an of", 10).is_none());
    }

    #[test]
    fn empty_query_matches_nothing() {
        let (_dir, store) = crate::store::Store::open_temp().unwrap();
        store.create_epic("E1", "Payments", None).unwrap();
        assert!(store.search("---", 10).unwrap().is_empty());
        assert!(store.search("", 10).unwrap().is_empty());
    }

    #[test]
    fn triggers_index_epics_actions_and_knowledge() {
        let (_dir, store) = crate::store::Store::open_temp().unwrap();
        store
            .create_epic("E1", "Payment Rails", Some("billing and invoicing"))
            .unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();
        store
            .replace_projections(
                "ev",
                Some("E1"),
                &ProjectionBatch {
                    actions: vec![ActionInsert {
                        action_type: ActionType::FollowUp,
                        title: "Ship the invoicing fix".into(),
                        body: None,
                        priority: Priority::P1,
                        due_at: None,
                        mentions: vec![],
                    }],
                    knowledge: vec![KnowledgeInsert {
                        title: "Invoicing retry policy".into(),
                        kind: KnowledgeKind::Process,
                        tags: vec![],
                        body_md: "Retries happen at most once per day.".into(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let hits = store.search("invoicing", 10).unwrap();
        let kinds: Vec<&str> = hits.iter().map(|h| h.content_type.as_str()).collect();
        assert!(kinds.contains(&"epic"));
        assert!(kinds.contains(&"action"));
        assert!(kinds.contains(&"knowledge"));
    }

    #[test]
    fn delete_removes_index_rows() {
        let (_dir, store) = crate::store::Store::open_temp().unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();
        store
            .replace_projections(
                "ev",
                None,
                &ProjectionBatch {
                    actions: vec![ActionInsert {
                        action_type: ActionType::FollowUp,
                        title: "transient task".into(),
                        body: None,
                        priority: Priority::P2,
                        due_at: None,
                        mentions: vec![],
                    }],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.search("transient", 10).unwrap().len(), 1);

        // Replacing with an empty batch deletes the action and, through
        // the trigger, its index row.
        store
            .replace_projections("ev", None, &ProjectionBatch::default())
            .unwrap();
        assert!(store.search("transient", 10).unwrap().is_empty());
    }

    #[test]
    fn rebuild_matches_incremental_maintenance() {
        let (_dir, store) = crate::store::Store::open_temp().unwrap();
        store
            .create_epic("E1", "Search Revamp", Some("query rewrite"))
            .unwrap();
        store.create_event("ev", "/tmp/a.ogg", None).unwrap();
        store
            .replace_projections(
                "ev",
                Some("E1"),
                &ProjectionBatch {
                    knowledge: vec![KnowledgeInsert {
                        title: "Ranking notes".into(),
                        kind: KnowledgeKind::Tech,
                        tags: vec![],
                        body_md: "bm25 with porter stemming".into(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let incremental = store.search("ranking", 10).unwrap();
        store.rebuild_search_index().unwrap();
        let rebuilt = store.search("ranking", 10).unwrap();

        assert_eq!(incremental.len(), rebuilt.len());
        for (a, b) in incremental.iter().zip(rebuilt.iter()) {
            assert_eq!(a.content_id, b.content_id);
            assert_eq!(a.content_type, b.content_type);
        }
    }
}
