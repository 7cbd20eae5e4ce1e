//! Push subscription repository and sent ledger

use super::types::{now_rfc3339, new_id, PushSubscription};
use super::Store;
use anyhow::Result;
use rusqlite::params;

impl Store {
    /// Upsert on endpoint; re-subscribing refreshes key material.
    pub fn save_push_subscription(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        user_agent: Option<&str>,
    ) -> Result<()> {
        self.writer().execute(
            "INSERT INTO push_subscriptions (id, endpoint, p256dh, auth, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(endpoint) DO UPDATE SET
                 p256dh = excluded.p256dh,
                 auth = excluded.auth,
                 user_agent = excluded.user_agent",
            params![new_id(), endpoint, p256dh, auth, user_agent, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_push_subscriptions(&self) -> Result<Vec<PushSubscription>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, endpoint, p256dh, auth, user_agent, created_at
             FROM push_subscriptions ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PushSubscription {
                id: row.get(0)?,
                endpoint: row.get(1)?,
                p256dh: row.get(2)?,
                auth: row.get(3)?,
                user_agent: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Remove a subscription whose endpoint answered 410 Gone.
    pub fn delete_push_subscription(&self, endpoint: &str) -> Result<()> {
        self.writer().execute(
            "DELETE FROM push_subscriptions WHERE endpoint = ?1",
            params![endpoint],
        )?;
        Ok(())
    }

    /// Record a delivered notification; duplicate (action, type) pairs are
    /// suppressed so a reprocess never re-notifies.
    pub fn record_push_sent(
        &self,
        action_id: &str,
        event_id: &str,
        notification_type: &str,
    ) -> Result<()> {
        self.writer().execute(
            "INSERT OR IGNORE INTO push_sent (action_id, event_id, notification_type, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![action_id, event_id, notification_type, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn push_already_sent(&self, action_id: &str, notification_type: &str) -> Result<bool> {
        let conn = self.reader()?;
        let sent: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM push_sent WHERE action_id = ?1 AND notification_type = ?2",
            params![action_id, notification_type],
            |row| row.get(0),
        )?;
        Ok(sent)
    }
}
