use std::{collections::HashSet, path::Path};

use anyhow::anyhow;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    Connection, Row, SqliteConnection,
};
use tracing::debug;

use crate::{
    error::AppError,
    schedule::{now_millis, Schedule, ScheduleKind, ScheduleQuery},
};

/// Ordered migration list applied on every open. Each entry runs in its own
/// transaction and is recorded in the `_migrations` meta table, so adding a
/// migration to the end of this list upgrades existing agent databases in
/// place.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_state",
        "CREATE TABLE state (id INTEGER PRIMARY KEY CHECK (id = 0), state TEXT)",
    ),
    (
        "0002_queue",
        "CREATE TABLE queue (
            id TEXT PRIMARY KEY,
            callback TEXT NOT NULL,
            payload TEXT,
            created_at INTEGER NOT NULL
        )",
    ),
    (
        "0003_schedule",
        "CREATE TABLE schedule (
            id TEXT PRIMARY KEY,
            callback TEXT NOT NULL,
            payload TEXT,
            type TEXT NOT NULL,
            time INTEGER NOT NULL,
            delay_seconds INTEGER,
            cron TEXT,
            created_at INTEGER NOT NULL
        )",
    ),
    (
        "0004_mcp_servers",
        "CREATE TABLE mcp_servers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            server_url TEXT NOT NULL,
            callback_url TEXT NOT NULL,
            client_id TEXT,
            auth_url TEXT,
            server_options TEXT
        )",
    ),
    (
        "0005_chat_messages",
        "CREATE TABLE chat_messages (
            id TEXT PRIMARY KEY,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
    ),
];

/// A durable queue item, FIFO by `(created_at, id)`
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: String,
    pub callback: String,
    pub payload: Option<Value>,
    pub created_at: i64,
}

/// Durable record of a reconnectable MCP server binding
#[derive(Debug, Clone)]
pub struct McpServerRecord {
    pub id: String,
    pub name: String,
    pub server_url: String,
    pub callback_url: String,
    pub client_id: Option<String>,
    pub auth_url: Option<String>,
    pub server_options: Option<Value>,
}

/// The embedded store backing one agent instance.
///
/// The instance is a single-writer actor, so a lone connection is enough; a
/// pool would only add contention. All access goes through the typed methods
/// below — no SQL escapes this module.
pub struct AgentStore {
    conn: SqliteConnection,
    in_tx: bool,
}

impl AgentStore {
    /// Open (creating if missing) the database at `path` and bring its schema
    /// up to date.
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let conn = SqliteConnection::connect_with(&options).await?;
        let mut store = Self { conn, in_tx: false };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store, used by tests
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, AppError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let conn = SqliteConnection::connect_with(&options).await?;
        let mut store = Self { conn, in_tx: false };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&mut self) -> Result<(), AppError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (name TEXT PRIMARY KEY, applied_at INTEGER NOT NULL)")
            .execute(&mut self.conn)
            .await?;
        let applied: HashSet<String> = sqlx::query("SELECT name FROM _migrations")
            .fetch_all(&mut self.conn)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        for (name, sql) in MIGRATIONS {
            if applied.contains(*name) {
                continue;
            }
            sqlx::query("BEGIN").execute(&mut self.conn).await?;
            let result = async {
                sqlx::query(sql).execute(&mut self.conn).await?;
                sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
                    .bind(name)
                    .bind(now_millis())
                    .execute(&mut self.conn)
                    .await?;
                Ok::<_, AppError>(())
            }
            .await;
            match result {
                Ok(()) => {
                    sqlx::query("COMMIT").execute(&mut self.conn).await?;
                    debug!(migration = name, "applied migration");
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut self.conn).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Begin the handler-scoped transaction. All writes issued until
    /// `commit`/`rollback` become visible together.
    pub async fn begin(&mut self) -> Result<(), AppError> {
        if self.in_tx {
            return Err(anyhow!("handler transaction already open").into());
        }
        sqlx::query("BEGIN").execute(&mut self.conn).await?;
        self.in_tx = true;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), AppError> {
        if self.in_tx {
            sqlx::query("COMMIT").execute(&mut self.conn).await?;
            self.in_tx = false;
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), AppError> {
        if self.in_tx {
            sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
            self.in_tx = false;
        }
        Ok(())
    }

    // --- state ---

    /// The singleton state blob, or `None` before the first write
    pub async fn get_state(&mut self) -> Result<Option<Value>, AppError> {
        let row = sqlx::query("SELECT state FROM state WHERE id = 0")
            .fetch_optional(&mut self.conn)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get("state");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn put_state(&mut self, state: &Value) -> Result<(), AppError> {
        let raw = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO state (id, state) VALUES (0, ?)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state",
        )
        .bind(raw)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    // --- queue ---

    pub async fn push_queue(
        &mut self,
        id: &str,
        callback: &str,
        payload: &Value,
    ) -> Result<(), AppError> {
        sqlx::query("INSERT INTO queue (id, callback, payload, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(callback)
            .bind(serde_json::to_string(payload)?)
            .bind(now_millis())
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// All queued items in strict FIFO order
    pub async fn list_queue(&mut self) -> Result<Vec<QueueItem>, AppError> {
        let rows = sqlx::query(
            "SELECT id, callback, payload, created_at FROM queue ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&mut self.conn)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(QueueItem {
                    id: row.get("id"),
                    callback: row.get("callback"),
                    payload: parse_optional_json(row.get("payload"))?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    pub async fn delete_queue(&mut self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn queue_len(&mut self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(row.get("n"))
    }

    // --- schedule ---

    pub async fn put_schedule(&mut self, schedule: &Schedule) -> Result<(), AppError> {
        let payload = match &schedule.payload {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO schedule (id, callback, payload, type, time, delay_seconds, cron, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                callback = excluded.callback,
                payload = excluded.payload,
                type = excluded.type,
                time = excluded.time,
                delay_seconds = excluded.delay_seconds,
                cron = excluded.cron",
        )
        .bind(&schedule.id)
        .bind(&schedule.callback)
        .bind(payload)
        .bind(schedule.kind.as_str())
        .bind(schedule.time)
        .bind(schedule.delay_seconds)
        .bind(&schedule.cron)
        .bind(schedule.created_at)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    pub async fn get_schedule(&mut self, id: &str) -> Result<Option<Schedule>, AppError> {
        let row = sqlx::query("SELECT * FROM schedule WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut self.conn)
            .await?;
        row.map(schedule_from_row).transpose()
    }

    pub async fn list_schedules(
        &mut self,
        query: &ScheduleQuery,
    ) -> Result<Vec<Schedule>, AppError> {
        // The filter combinations are few enough to keep the SQL static and
        // filter in memory; schedule tables are tiny.
        let rows = sqlx::query("SELECT * FROM schedule ORDER BY time ASC, id ASC")
            .fetch_all(&mut self.conn)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let schedule = schedule_from_row(row)?;
            if let Some(id) = &query.id {
                if &schedule.id != id {
                    continue;
                }
            }
            if let Some(kind) = query.kind {
                if schedule.kind != kind {
                    continue;
                }
            }
            if let Some(after) = query.after {
                if schedule.time < after {
                    continue;
                }
            }
            if let Some(before) = query.before {
                if schedule.time > before {
                    continue;
                }
            }
            out.push(schedule);
        }
        Ok(out)
    }

    /// Rows due at or before `now` (epoch seconds), soonest first
    pub async fn due_schedules(&mut self, now: i64) -> Result<Vec<Schedule>, AppError> {
        let rows = sqlx::query("SELECT * FROM schedule WHERE time <= ? ORDER BY time ASC, id ASC")
            .bind(now)
            .fetch_all(&mut self.conn)
            .await?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    pub async fn delete_schedule(&mut self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM schedule WHERE id = ?")
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advance a cron row to its next computed fire
    pub async fn update_schedule_time(&mut self, id: &str, time: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE schedule SET time = ? WHERE id = ?")
            .bind(time)
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// The nearest pending fire across all schedule rows
    pub async fn next_schedule_time(&mut self) -> Result<Option<i64>, AppError> {
        let row = sqlx::query("SELECT MIN(time) AS t FROM schedule")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(row.get::<Option<i64>, _>("t"))
    }

    // --- mcp servers ---

    pub async fn put_mcp_server(&mut self, record: &McpServerRecord) -> Result<(), AppError> {
        let options = match &record.server_options {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO mcp_servers (id, name, server_url, callback_url, client_id, auth_url, server_options)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                server_url = excluded.server_url,
                callback_url = excluded.callback_url,
                client_id = excluded.client_id,
                auth_url = excluded.auth_url,
                server_options = excluded.server_options",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.server_url)
        .bind(&record.callback_url)
        .bind(&record.client_id)
        .bind(&record.auth_url)
        .bind(options)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    pub async fn list_mcp_servers(&mut self) -> Result<Vec<McpServerRecord>, AppError> {
        let rows = sqlx::query("SELECT * FROM mcp_servers ORDER BY id ASC")
            .fetch_all(&mut self.conn)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(McpServerRecord {
                    id: row.get("id"),
                    name: row.get("name"),
                    server_url: row.get("server_url"),
                    callback_url: row.get("callback_url"),
                    client_id: row.get("client_id"),
                    auth_url: row.get("auth_url"),
                    server_options: parse_optional_json(row.get("server_options"))?,
                })
            })
            .collect()
    }

    pub async fn delete_mcp_server(&mut self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM mcp_servers WHERE id = ?")
            .bind(id)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- chat messages ---

    /// Upsert messages into the append-log. Each message carries its own
    /// `id`; messages without one are skipped.
    pub async fn save_chat_messages(&mut self, messages: &[Value]) -> Result<(), AppError> {
        for message in messages {
            let Some(id) = message.get("id").and_then(Value::as_str) else {
                continue;
            };
            sqlx::query(
                "INSERT INTO chat_messages (id, message, created_at) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET message = excluded.message",
            )
            .bind(id)
            .bind(serde_json::to_string(message)?)
            .bind(now_millis())
            .execute(&mut self.conn)
            .await?;
        }
        Ok(())
    }

    pub async fn list_chat_messages(&mut self) -> Result<Vec<Value>, AppError> {
        let rows =
            sqlx::query("SELECT message FROM chat_messages ORDER BY created_at ASC, id ASC")
                .fetch_all(&mut self.conn)
                .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("message"))?))
            .collect()
    }

    pub async fn clear_chat_messages(&mut self) -> Result<(), AppError> {
        sqlx::query("DELETE FROM chat_messages")
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Empty every table; used by `destroy()`
    pub async fn wipe(&mut self) -> Result<(), AppError> {
        for table in ["state", "queue", "schedule", "mcp_servers", "chat_messages"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut self.conn)
                .await?;
        }
        Ok(())
    }
}

fn parse_optional_json(raw: Option<String>) -> Result<Option<Value>, AppError> {
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn schedule_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Schedule, AppError> {
    Ok(Schedule {
        id: row.get("id"),
        callback: row.get("callback"),
        payload: parse_optional_json(row.get("payload"))?,
        kind: ScheduleKind::parse(&row.get::<String, _>("type"))?,
        time: row.get("time"),
        delay_seconds: row.get("delay_seconds"),
        cron: row.get("cron"),
        created_at: row.get("created_at"),
    })
}
