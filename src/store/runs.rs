//! Run log: one row per pipeline step
//!
//! Written on both success and error paths by the STT worker, the
//! extractor, the TTL sweeper and the runner's dispatch failures. These
//! rows are the source of truth for latency and failure dashboards.

use super::types::{now_rfc3339, EventRun, RunStatus};
use super::Store;
use anyhow::Result;
use rusqlite::params;

/// Everything one pipeline step reports about itself.
#[derive(Debug, Clone)]
pub struct RunRecord<'a> {
    pub event_id: &'a str,
    pub job_type: &'a str,
    pub status: RunStatus,
    pub input_snapshot: Option<&'a str>,
    pub output_snapshot: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub duration_ms: Option<i64>,
}

impl Store {
    pub fn record_run(&self, record: &RunRecord<'_>) -> Result<()> {
        self.writer().execute(
            "INSERT INTO event_runs
                 (event_id, job_type, status, input_snapshot, output_snapshot,
                  error_message, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.event_id,
                record.job_type,
                record.status.as_str(),
                record.input_snapshot,
                record.output_snapshot,
                record.error_message,
                record.duration_ms,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn runs_for_event(&self, event_id: &str) -> Result<Vec<EventRun>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_id, job_type, status, input_snapshot, output_snapshot,
                    error_message, duration_ms, created_at
             FROM event_runs WHERE event_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![event_id], |row| {
            Ok(EventRun {
                id: row.get(0)?,
                event_id: row.get(1)?,
                job_type: row.get(2)?,
                status: row.get(3)?,
                input_snapshot: row.get(4)?,
                output_snapshot: row.get(5)?,
                error_message: row.get(6)?,
                duration_ms: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// (job_type, status, count, mean duration) aggregates for the admin
    /// stats endpoint.
    pub fn run_stats(&self) -> Result<Vec<(String, String, i64, f64)>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT job_type, status, COUNT(*), COALESCE(AVG(duration_ms), 0.0)
             FROM event_runs GROUP BY job_type, status ORDER BY job_type, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
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
    fn runs_are_recorded_and_aggregated() {
        let (_dir, store) = Store::open_temp().unwrap();
        store.record_run(&RunRecord {
            event_id: "ev",
            job_type: "stt",
            status: RunStatus::Success,
            input_snapshot: Some("{\"audio\":\"a.ogg\"}"),
            output_snapshot: None,
            error_message: None,
            duration_ms: Some(1200),
        }).unwrap();
        store.record_run(&RunRecord {
            event_id: "ev",
            job_type: "extract",
            status: RunStatus::Error,
            input_snapshot: None,
            output_snapshot: None,
            error_message: Some("llm unreachable"),
            duration_ms: Some(40),
        }).unwrap();

        let runs = store.runs_for_event("ev").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].job_type, "stt");
        assert_eq!(runs[1].status, "error");

        let stats = store.run_stats().unwrap();
        assert_eq!(stats.len(), 2);
    }
}
