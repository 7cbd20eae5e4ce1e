//! Event repository

use super::types::{now_rfc3339, Event, EventStatus};
use super::Store;
use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Row};

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let status: String = row.get("status")?;
    Ok(Event {
        id: row.get("id")?,
        audio_path: row.get("audio_path")?,
        language: row.get("language")?,
        transcript: row.get("transcript")?,
        transcript_expires_at: row.get("transcript_expires_at")?,
        status: EventStatus::parse(&status).unwrap_or(EventStatus::Failed),
        status_reason: row.get("status_reason")?,
        detected_command: row.get("detected_command")?,
        epic_id: row.get("epic_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const EVENT_COLUMNS: &str = "id, audio_path, language, transcript, transcript_expires_at, \
     status, status_reason, detected_command, epic_id, created_at, updated_at";

impl Store {
    /// Insert a freshly uploaded memo in `queued` state.
    pub fn create_event(
        &self,
        id: &str,
        audio_path: &str,
        language: Option<&str>,
    ) -> Result<Event> {
        let now = now_rfc3339();
        self.writer().execute(
            "INSERT INTO events (id, audio_path, language, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?4)",
            params![id, audio_path, language, now],
        )?;
        self.get_event(id)?
            .ok_or_else(|| anyhow!("event {} vanished after insert", id))
    }

    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.reader()?;
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// List events newest-first, optionally filtered by status.
    pub fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Event>> {
        let conn = self.reader()?;
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows =
                    stmt.query_map(params![s.as_str(), limit as i64, offset as i64], row_to_event)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_event)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Transition an event's lifecycle state, optionally with a reason.
    pub fn set_event_status(
        &self,
        id: &str,
        status: EventStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let affected = self.writer().execute(
            "UPDATE events SET status = ?1, status_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), reason, now_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(anyhow!("no such event: {}", id));
        }
        Ok(())
    }

    /// Store the transcript and its expiry together (both set or both null
    /// is a schema invariant).
    pub fn set_transcript(&self, id: &str, transcript: &str, expires_at: &str) -> Result<()> {
        let affected = self.writer().execute(
            "UPDATE events SET transcript = ?1, transcript_expires_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![transcript, expires_at, now_rfc3339(), id],
        )?;
        if affected == 0 {
            return Err(anyhow!("no such event: {}", id));
        }
        Ok(())
    }

    pub fn set_event_epic(&self, id: &str, epic_id: Option<&str>) -> Result<()> {
        self.writer().execute(
            "UPDATE events SET epic_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![epic_id, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_detected_command(&self, id: &str, command: &str) -> Result<()> {
        self.writer().execute(
            "UPDATE events SET detected_command = ?1, updated_at = ?2 WHERE id = ?3",
            params![command, now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Expire transcripts whose TTL has passed. Clears transcript and
    /// expiry in one statement and returns the affected event ids.
    pub fn expire_transcripts(&self, now: &str) -> Result<Vec<String>> {
        let conn = self.writer();
        let mut stmt = conn.prepare(
            "SELECT id FROM events
             WHERE transcript IS NOT NULL AND transcript_expires_at < ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        if !ids.is_empty() {
            conn.execute(
                "UPDATE events
                 SET transcript = NULL, transcript_expires_at = NULL, updated_at = ?1
                 WHERE transcript IS NOT NULL AND transcript_expires_at < ?2",
                params![now_rfc3339(), now],
            )?;
        }
        Ok(ids)
    }

    /// Forget the on-disk audio location after the file has been removed.
    pub fn clear_audio_path(&self, id: &str) -> Result<()> {
        self.writer().execute(
            "UPDATE events SET audio_path = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Events that still hold a transcript, for the admin TTL view.
    pub fn list_transcripts(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE transcript IS NOT NULL
             ORDER BY transcript_expires_at ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_lifecycle_roundtrip() {
        let (_dir, store) = Store::open_temp().unwrap();
        let event = store
            .create_event("ev-1", "/tmp/audio.ogg", Some("es"))
            .unwrap();
        assert_eq!(event.status, EventStatus::Queued);
        assert_eq!(event.language.as_deref(), Some("es"));

        store
            .set_event_status("ev-1", EventStatus::Transcribing, None)
            .unwrap();
        store
            .set_transcript("ev-1", "hola mundo", "2999-01-01T00:00:00.000Z")
            .unwrap();
        store
            .set_event_status("ev-1", EventStatus::Transcribed, None)
            .unwrap();

        let event = store.get_event("ev-1").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Transcribed);
        assert_eq!(event.transcript.as_deref(), Some("hola mundo"));
        assert!(event.transcript_expires_at.is_some());
    }

    #[test]
    fn expire_clears_transcript_and_expiry_together() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_event("old", "/tmp/a.ogg", None).unwrap();
        store.create_event("new", "/tmp/b.ogg", None).unwrap();
        store
            .set_transcript("old", "stale", "2000-01-01T00:00:00.000Z")
            .unwrap();
        store
            .set_transcript("new", "fresh", "2999-01-01T00:00:00.000Z")
            .unwrap();

        let expired = store.expire_transcripts(&now_rfc3339()).unwrap();
        assert_eq!(expired, vec!["old".to_string()]);

        let old = store.get_event("old").unwrap().unwrap();
        assert!(old.transcript.is_none());
        assert!(old.transcript_expires_at.is_none());
        let new = store.get_event("new").unwrap().unwrap();
        assert_eq!(new.transcript.as_deref(), Some("fresh"));
    }

    #[test]
    fn list_events_filters_by_status() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.create_event("a", "/tmp/a.ogg", None).unwrap();
        store.create_event("b", "/tmp/b.ogg", None).unwrap();
        store
            .set_event_status("b", EventStatus::Completed, None)
            .unwrap();

        let queued = store
            .list_events(Some(EventStatus::Queued), 10, 0)
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "a");

        let all = store.list_events(None, 10, 0).unwrap();
        assert_eq!(all.len(), 2);
    }
}
