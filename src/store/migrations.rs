//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially. The
//! schema is split into four partitions: actor/identity records, dialogue
//! records, orchestration records, and call-metric records. Foreign keys
//! cross partitions only in the documented directions (orchestration rows
//! never point back into dialogue except through nullable back-links).

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "actors_and_dialogue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS actors (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                access INTEGER NOT NULL DEFAULT 1,
                verified INTEGER NOT NULL DEFAULT 0,
                settings TEXT NOT NULL DEFAULT '{}',
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actors_kind ON actors(kind);

            CREATE TABLE IF NOT EXISTS actor_identities (
                id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL REFERENCES actors(id) ON DELETE CASCADE,
                source TEXT NOT NULL,
                external_id TEXT NOT NULL,
                authorized INTEGER NOT NULL DEFAULT 1,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (source, external_id)
            );
            CREATE INDEX IF NOT EXISTS idx_actor_identities_actor
                ON actor_identities(actor_id);

            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL REFERENCES actors(id),
                external_identity_id TEXT REFERENCES actor_identities(id) ON DELETE SET NULL,
                status TEXT NOT NULL DEFAULT 'active',
                last_room_id TEXT REFERENCES rooms(id),
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_actor ON sessions(actor_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                parent_id TEXT REFERENCES messages(id),
                actor_id TEXT NOT NULL REFERENCES actors(id),
                actor_kind TEXT NOT NULL,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                room_id TEXT NOT NULL REFERENCES rooms(id),
                text TEXT NOT NULL,
                normalized_text TEXT,
                token_count INTEGER NOT NULL DEFAULT 0,
                answer_latency REAL,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_triple
                ON messages(session_id, room_id, actor_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);
        "#,
    },
    Migration {
        version: 2,
        name: "orchestration",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_types (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS step_types (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type_id TEXT NOT NULL REFERENCES task_types(id) ON DELETE RESTRICT,
                parent_task_id TEXT REFERENCES tasks(id),
                input TEXT NOT NULL DEFAULT '{}',
                output TEXT,
                priority REAL NOT NULL DEFAULT 0.5,
                status TEXT NOT NULL DEFAULT 'pending',
                worker_token TEXT,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                run_latency REAL,
                total_latency REAL,
                error_module TEXT,
                error_message TEXT,
                error_timestamp TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_claim
                ON tasks(status, priority DESC, created_at);

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                step_number INTEGER NOT NULL,
                step_type_id TEXT NOT NULL REFERENCES step_types(id) ON DELETE RESTRICT,
                step_name TEXT NOT NULL,
                task_type_name TEXT NOT NULL,
                parent_step_id TEXT REFERENCES steps(id),
                status TEXT NOT NULL DEFAULT 'pending',
                input TEXT NOT NULL DEFAULT '{}',
                output TEXT,
                reasoning_id TEXT,
                latency REAL,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_module TEXT,
                error_message TEXT,
                error_timestamp TEXT,
                UNIQUE (task_id, step_number)
            );
            CREATE INDEX IF NOT EXISTS idx_steps_task ON steps(task_id);
            CREATE INDEX IF NOT EXISTS idx_steps_status ON steps(status);

            CREATE TABLE IF NOT EXISTS reasonings (
                id TEXT PRIMARY KEY,
                step_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                kind TEXT NOT NULL,
                vector_point_id TEXT,
                embedding_metric_id TEXT,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reasonings_step ON reasonings(step_id);

            CREATE TABLE IF NOT EXISTS prompts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                text TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'draft',
                created_at TEXT NOT NULL,
                UNIQUE (name, version)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "call_metrics",
        sql: r#"
            CREATE TABLE IF NOT EXISTS generation_metrics (
                id TEXT PRIMARY KEY,
                step_id TEXT REFERENCES steps(id),
                prompt_id TEXT REFERENCES prompts(id),
                host TEXT NOT NULL,
                model TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                cache_tokens INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                host_ctx INTEGER NOT NULL DEFAULT 0,
                prompt_ms REAL NOT NULL DEFAULT 0,
                prompt_per_token_ms REAL NOT NULL DEFAULT 0,
                prompt_per_second REAL NOT NULL DEFAULT 0,
                predicted_per_second REAL NOT NULL DEFAULT 0,
                response_secs REAL NOT NULL DEFAULT 0,
                net_latency_secs REAL NOT NULL DEFAULT 0,
                total_secs REAL NOT NULL DEFAULT 0,
                error_status INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                error_at TEXT,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_generation_metrics_step
                ON generation_metrics(step_id);

            CREATE TABLE IF NOT EXISTS embedding_metrics (
                id TEXT PRIMARY KEY,
                step_id TEXT REFERENCES steps(id),
                host TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                duration_ms REAL NOT NULL DEFAULT 0,
                error_status INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                error_at TEXT,
                agent_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            ALTER TABLE messages ADD COLUMN step_id TEXT;
            ALTER TABLE messages ADD COLUMN llm_metric_id TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` journal table if it doesn't exist. Safe to
/// call on every startup.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!("Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "actors",
            "actor_identities",
            "rooms",
            "sessions",
            "messages",
            "task_types",
            "step_types",
            "tasks",
            "steps",
            "reasonings",
            "prompts",
            "generation_metrics",
            "embedding_metrics",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn step_numbers_are_unique_per_task() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute_batch(
            "INSERT INTO task_types (id, name) VALUES ('tt1', 'answer_generation');
             INSERT INTO step_types (id, name) VALUES ('st1', 'assemble_context');
             INSERT INTO tasks (id, task_type_id, agent_version, created_at)
                 VALUES ('t1', 'tt1', '0', '2026-01-01T00:00:00Z');
             INSERT INTO steps (id, task_id, step_number, step_type_id, step_name,
                 task_type_name, agent_version, created_at)
                 VALUES ('s1', 't1', 1, 'st1', 'assemble_context',
                 'answer_generation', '0', '2026-01-01T00:00:00Z');",
        )
        .await
        .unwrap();

        let dup = conn
            .execute(
                "INSERT INTO steps (id, task_id, step_number, step_type_id, step_name,
                 task_type_name, agent_version, created_at)
                 VALUES ('s2', 't1', 1, 'st1', 'assemble_context',
                 'answer_generation', '0', '2026-01-01T00:00:00Z')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
