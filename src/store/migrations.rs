//! Ordered schema migrations
//!
//! Each migration is (id, name, script) and runs exactly once inside its
//! own transaction; `schema_migrations` records applied ids so a crash
//! between script and bookkeeping is retried on next startup (scripts use
//! IF NOT EXISTS so the retry is harmless).

use anyhow::Result;
use rusqlite::Connection;

pub struct Migration {
    pub id: i64,
    pub name: &'static str,
    pub script: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "core_tables",
        script: r#"
            CREATE TABLE IF NOT EXISTS epics (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS epic_aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                epic_id TEXT NOT NULL REFERENCES epics(id) ON DELETE CASCADE,
                alias TEXT NOT NULL,
                normalized TEXT NOT NULL UNIQUE
            );
            CREATE INDEX IF NOT EXISTS idx_aliases_epic ON epic_aliases(epic_id);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                audio_path TEXT,
                language TEXT,
                transcript TEXT,
                transcript_expires_at TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                status_reason TEXT,
                detected_command TEXT,
                epic_id TEXT REFERENCES epics(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
            CREATE INDEX IF NOT EXISTS idx_events_expiry ON events(transcript_expires_at);

            CREATE TABLE IF NOT EXISTS actions (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                epic_id TEXT REFERENCES epics(id) ON DELETE SET NULL,
                action_type TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT,
                priority TEXT NOT NULL DEFAULT 'P2',
                due_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_event ON actions(source_event_id);
            CREATE INDEX IF NOT EXISTS idx_actions_epic ON actions(epic_id);

            CREATE TABLE IF NOT EXISTS action_mentions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_id TEXT NOT NULL REFERENCES actions(id) ON DELETE CASCADE,
                name TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mentions_action ON action_mentions(action_id);

            CREATE TABLE IF NOT EXISTS blockers (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                epic_id TEXT REFERENCES epics(id) ON DELETE SET NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                resolved_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_blockers_event ON blockers(source_event_id);

            CREATE TABLE IF NOT EXISTS dependencies (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                epic_id TEXT REFERENCES epics(id) ON DELETE SET NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                resolved_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dependencies_event ON dependencies(source_event_id);

            CREATE TABLE IF NOT EXISTS issues (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                epic_id TEXT REFERENCES epics(id) ON DELETE SET NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                resolved_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_issues_event ON issues(source_event_id);

            CREATE TABLE IF NOT EXISTS knowledge_items (
                id TEXT PRIMARY KEY,
                source_event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                epic_id TEXT REFERENCES epics(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                kind TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                body_md TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_knowledge_event ON knowledge_items(source_event_id);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                event_id TEXT,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payload TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                run_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                cancelled_at TEXT,
                cancelled_by TEXT,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, run_at, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_event ON jobs(event_id);

            CREATE TABLE IF NOT EXISTS dead_letter_jobs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                event_id TEXT,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'dead_letter',
                payload TEXT,
                attempts INTEGER NOT NULL,
                error_message TEXT,
                reason TEXT,
                dead_lettered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_epic_candidates (
                event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                epic_id TEXT NOT NULL REFERENCES epics(id) ON DELETE CASCADE,
                score REAL NOT NULL,
                rank INTEGER NOT NULL,
                match_type TEXT NOT NULL,
                PRIMARY KEY (event_id, rank)
            );

            CREATE TABLE IF NOT EXISTS event_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input_snapshot TEXT,
                output_snapshot TEXT,
                error_message TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_event ON event_runs(event_id);
            CREATE INDEX IF NOT EXISTS idx_runs_type ON event_runs(job_type);

            CREATE TABLE IF NOT EXISTS push_subscriptions (
                id TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL UNIQUE,
                p256dh TEXT NOT NULL,
                auth TEXT NOT NULL,
                user_agent TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS push_sent (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                notification_type TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                UNIQUE (action_id, notification_type)
            );
        "#,
    },
    Migration {
        id: 2,
        name: "search_index",
        script: r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
                content_type UNINDEXED,
                content_id UNINDEXED,
                title,
                content,
                tokenize='porter unicode61'
            );

            -- Actions
            CREATE TRIGGER IF NOT EXISTS actions_search_ai AFTER INSERT ON actions BEGIN
                INSERT INTO search_index(content_type, content_id, title, content)
                VALUES ('action', new.id, new.title, COALESCE(new.body, ''));
            END;
            CREATE TRIGGER IF NOT EXISTS actions_search_au AFTER UPDATE ON actions BEGIN
                DELETE FROM search_index WHERE content_type = 'action' AND content_id = old.id;
                INSERT INTO search_index(content_type, content_id, title, content)
                VALUES ('action', new.id, new.title, COALESCE(new.body, ''));
            END;
            CREATE TRIGGER IF NOT EXISTS actions_search_ad AFTER DELETE ON actions BEGIN
                DELETE FROM search_index WHERE content_type = 'action' AND content_id = old.id;
            END;

            -- Knowledge items
            CREATE TRIGGER IF NOT EXISTS knowledge_search_ai AFTER INSERT ON knowledge_items BEGIN
                INSERT INTO search_index(content_type, content_id, title, content)
                VALUES ('knowledge', new.id, new.title, new.body_md);
            END;
            CREATE TRIGGER IF NOT EXISTS knowledge_search_au AFTER UPDATE ON knowledge_items BEGIN
                DELETE FROM search_index WHERE content_type = 'knowledge' AND content_id = old.id;
                INSERT INTO search_index(content_type, content_id, title, content)
                VALUES ('knowledge', new.id, new.title, new.body_md);
            END;
            CREATE TRIGGER IF NOT EXISTS knowledge_search_ad AFTER DELETE ON knowledge_items BEGIN
                DELETE FROM search_index WHERE content_type = 'knowledge' AND content_id = old.id;
            END;

            -- Epics
            CREATE TRIGGER IF NOT EXISTS epics_search_ai AFTER INSERT ON epics BEGIN
                INSERT INTO search_index(content_type, content_id, title, content)
                VALUES ('epic', new.id, new.title, COALESCE(new.description, ''));
            END;
            CREATE TRIGGER IF NOT EXISTS epics_search_au AFTER UPDATE ON epics BEGIN
                DELETE FROM search_index WHERE content_type = 'epic' AND content_id = old.id;
                INSERT INTO search_index(content_type, content_id, title, content)
                VALUES ('epic', new.id, new.title, COALESCE(new.description, ''));
            END;
            CREATE TRIGGER IF NOT EXISTS epics_search_ad AFTER DELETE ON epics BEGIN
                DELETE FROM search_index WHERE content_type = 'epic' AND content_id = old.id;
            END;
        "#,
    },
];

/// Script that tears every core table back down (admin/test use).
pub const ROLLBACK_ALL: &str = r#"
    DROP TABLE IF EXISTS search_index;
    DROP TABLE IF EXISTS push_sent;
    DROP TABLE IF EXISTS push_subscriptions;
    DROP TABLE IF EXISTS event_runs;
    DROP TABLE IF EXISTS event_epic_candidates;
    DROP TABLE IF EXISTS dead_letter_jobs;
    DROP TABLE IF EXISTS jobs;
    DROP TABLE IF EXISTS knowledge_items;
    DROP TABLE IF EXISTS issues;
    DROP TABLE IF EXISTS dependencies;
    DROP TABLE IF EXISTS blockers;
    DROP TABLE IF EXISTS action_mentions;
    DROP TABLE IF EXISTS actions;
    DROP TABLE IF EXISTS events;
    DROP TABLE IF EXISTS epic_aliases;
    DROP TABLE IF EXISTS epics;
    DROP TABLE IF EXISTS schema_migrations;
"#;

/// Apply any migration not yet recorded in `schema_migrations`.
pub fn apply_all(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE id = ?1",
            [migration.id],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.script)?;
        tx.execute(
            "INSERT INTO schema_migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.id,
                migration.name,
                crate::store::types::now_rfc3339()
            ],
        )?;
        tx.commit()?;

        tracing::info!("Applied migration {} ({})", migration.id, migration.name);
    }

    Ok(())
}
