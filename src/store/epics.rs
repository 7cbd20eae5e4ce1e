//! Epic and alias repository
//!
//! Aliases carry a normalised form (lowercase, trimmed, single-spaced)
//! that is unique across all epics; the matcher's exact stage is a lookup
//! on that column.

use super::types::{now_rfc3339, Epic, EpicAlias, EpicStatus};
use super::Store;
use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Row};

/// Lowercase, trim, collapse internal whitespace.
pub fn normalize_alias(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_to_epic(row: &Row<'_>) -> rusqlite::Result<Epic> {
    let status: String = row.get("status")?;
    Ok(Epic {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: EpicStatus::parse(&status).unwrap_or(EpicStatus::Archived),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn create_epic(&self, id: &str, title: &str, description: Option<&str>) -> Result<Epic> {
        let now = now_rfc3339();
        self.writer().execute(
            "INSERT INTO epics (id, title, description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
            params![id, title, description, now],
        )?;
        // The title itself doubles as the first alias so the exact stage
        // matches memos that open with the epic name verbatim.
        self.add_epic_alias(id, title)?;
        self.get_epic(id)?
            .ok_or_else(|| anyhow!("epic {} vanished after insert", id))
    }

    pub fn get_epic(&self, id: &str) -> Result<Option<Epic>> {
        let conn = self.reader()?;
        let epic = conn
            .query_row(
                "SELECT id, title, description, status, created_at, updated_at
                 FROM epics WHERE id = ?1",
                params![id],
                row_to_epic,
            )
            .optional()?;
        Ok(epic)
    }

    pub fn list_epics(&self, status: Option<EpicStatus>) -> Result<Vec<Epic>> {
        let conn = self.reader()?;
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, status, created_at, updated_at
                     FROM epics WHERE status = ?1 ORDER BY title",
                )?;
                let rows = stmt.query_map(params![s.as_str()], row_to_epic)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, status, created_at, updated_at
                     FROM epics ORDER BY title",
                )?;
                let rows = stmt.query_map([], row_to_epic)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn set_epic_status(&self, id: &str, status: EpicStatus) -> Result<()> {
        let affected = self.writer().execute(
            "UPDATE epics SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(anyhow!("no such epic: {}", id));
        }
        Ok(())
    }

    /// Register an alias; the normalised form must be globally unique.
    pub fn add_epic_alias(&self, epic_id: &str, alias: &str) -> Result<()> {
        let normalized = normalize_alias(alias);
        if normalized.is_empty() {
            return Err(anyhow!("alias normalises to empty string"));
        }
        self.writer().execute(
            "INSERT OR IGNORE INTO epic_aliases (epic_id, alias, normalized) VALUES (?1, ?2, ?3)",
            params![epic_id, alias, normalized],
        )?;
        Ok(())
    }

    pub fn list_epic_aliases(&self, epic_id: &str) -> Result<Vec<EpicAlias>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT epic_id, alias, normalized FROM epic_aliases WHERE epic_id = ?1 ORDER BY alias",
        )?;
        let rows = stmt.query_map(params![epic_id], |row| {
            Ok(EpicAlias {
                epic_id: row.get(0)?,
                alias: row.get(1)?,
                normalized: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Exact-alias lookup on the normalised form. Returns the owning epic
    /// only while it is active.
    pub fn find_epic_by_alias(&self, query: &str) -> Result<Option<Epic>> {
        let normalized = normalize_alias(query);
        if normalized.is_empty() {
            return Ok(None);
        }
        let conn = self.reader()?;
        let epic = conn
            .query_row(
                "SELECT e.id, e.title, e.description, e.status, e.created_at, e.updated_at
                 FROM epic_aliases a JOIN epics e ON e.id = a.epic_id
                 WHERE a.normalized = ?1 AND e.status = 'active'",
                params![normalized],
                row_to_epic,
            )
            .optional()?;
        Ok(epic)
    }
}
