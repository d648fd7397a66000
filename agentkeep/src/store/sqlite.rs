//! SQLite-backed implementation of [`EventLog`], [`RunRepository`], and
//! [`CheckpointStore`].
//!
//! Grounded on `machi::memory::sqlite::SqliteSession`: a `rusqlite`
//! connection wrapped in `Arc<Mutex<_>>`, synchronous access bridged to
//! async via `tokio::task::spawn_blocking`, WAL journal mode, and a
//! `busy_timeout` pragma.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    CheckpointStore, EventLog, EventPage, FanInOutcome, HistoryEntry, NewEvent, NewRun,
    RunRepository,
};
use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, EventId, GroupId, RunId, SessionKey, SpanId, ToolCallId};
use crate::scope::Scope;
use crate::types::{
    Checkpoint, CheckpointState, DependencyStatus, Event, EventPayload, PendingApproval,
    Redaction, Run, RunDependency, RunError, RunMessage, RunResult, RunStatus, SuspendReason,
};

/// A single SQLite-backed store implementing all three persistence traits
/// over one shared connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a database at `path` and initializes the schema.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` if the connection cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Opens an ephemeral in-memory database (data lost on drop).
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    ///
    /// # Errors
    /// Returns `STORAGE_ERROR` if the schema cannot be created.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id                  TEXT PRIMARY KEY,
                org_id                  TEXT NOT NULL,
                user_id                 TEXT NOT NULL,
                project_id              TEXT,
                session_key             TEXT NOT NULL,
                group_id                TEXT,
                input                   TEXT NOT NULL,
                agent_id                TEXT NOT NULL,
                llm_config              TEXT,
                parent_run_id           TEXT,
                delegated_permissions   TEXT,
                status                  TEXT NOT NULL,
                created_at              TEXT NOT NULL,
                started_at              TEXT,
                ended_at                TEXT,
                cancelled_at            TEXT,
                suspended_at            TEXT,
                suspend_reason          TEXT,
                result                  TEXT,
                error_code              TEXT,
                error_message           TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_session
            ON runs (session_key, parent_run_id, status);

            CREATE TABLE IF NOT EXISTS events (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id           TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                ts               TEXT NOT NULL,
                agent_id         TEXT NOT NULL,
                step_id          INTEGER NOT NULL,
                span_id          TEXT NOT NULL,
                parent_span_id   TEXT,
                event_type       TEXT NOT NULL,
                tool_call_id     TEXT,
                payload          TEXT NOT NULL,
                v                INTEGER NOT NULL,
                contains_secrets INTEGER NOT NULL,
                group_id         TEXT,
                UNIQUE(run_id, span_id)
            );

            CREATE INDEX IF NOT EXISTS idx_events_run
            ON events (run_id, id);

            CREATE INDEX IF NOT EXISTS idx_events_tool_call
            ON events (run_id, tool_call_id);

            CREATE TABLE IF NOT EXISTS run_dependencies (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_run_id   TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                child_run_id    TEXT NOT NULL UNIQUE,
                tool_call_id    TEXT NOT NULL,
                role_id         TEXT,
                goal            TEXT NOT NULL,
                status          TEXT NOT NULL,
                result          TEXT,
                error_code      TEXT,
                error_message   TEXT,
                created_at      TEXT NOT NULL,
                completed_at    TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_dependencies_parent
            ON run_dependencies (parent_run_id, status);

            CREATE TABLE IF NOT EXISTS checkpoints (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id     TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_id   TEXT NOT NULL,
                step_id    INTEGER NOT NULL,
                state      TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_latest
            ON checkpoints (run_id, agent_id, id);

            CREATE TABLE IF NOT EXISTS run_messages (
                run_id       TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_id     TEXT NOT NULL,
                step_id      INTEGER NOT NULL,
                ordinal      INTEGER NOT NULL,
                role         TEXT NOT NULL,
                content      TEXT NOT NULL,
                tool_call_id TEXT,
                tool_calls   TEXT,
                PRIMARY KEY (run_id, agent_id, ordinal)
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bridges a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| RuntimeError::Storage { message: e.to_string() })?;
            f(&guard)
        })
        .await?
    }

    fn row_scope(conn: &Connection, run_id: &str) -> Result<Option<Scope>> {
        conn.query_row(
            "SELECT org_id, user_id, project_id FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok(Scope {
                    org_id: row.get(0)?,
                    user_id: row.get(1)?,
                    project_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(RuntimeError::from)
    }

    fn check_visible(conn: &Connection, run_id: &str, scope: &Scope, what: &str) -> Result<()> {
        match Self::row_scope(conn, run_id)? {
            Some(stored) if scope.visible(&stored) => Ok(()),
            _ => Err(RuntimeError::not_found(format!("{what} '{run_id}'"))),
        }
    }
}

fn extract_tool_call_id(payload: &EventPayload) -> Option<String> {
    match payload {
        EventPayload::ToolCalled { tool_call_id, .. }
        | EventPayload::ToolResult { tool_call_id, .. }
        | EventPayload::ToolBlocked { tool_call_id, .. }
        | EventPayload::ToolRequiresApproval { tool_call_id, .. }
        | EventPayload::ToolApproved { tool_call_id, .. }
        | EventPayload::ToolRejected { tool_call_id, .. } => Some(tool_call_id.to_string()),
        _ => None,
    }
}

fn insert_event(tx: &rusqlite::Transaction<'_>, event: &NewEvent) -> Result<EventId> {
    let payload_json = serde_json::to_string(&event.payload)?;
    let ts = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO events (
            run_id, ts, agent_id, step_id, span_id, parent_span_id,
            event_type, tool_call_id, payload, v, contains_secrets, group_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?11)",
        params![
            event.run_id.as_str(),
            ts,
            event.agent_id.as_str(),
            event.step_id,
            event.span_id.as_str(),
            event.parent_span_id.as_ref().map(SpanId::as_str),
            event.payload.wire_type(),
            extract_tool_call_id(&event.payload),
            payload_json,
            event.redaction.contains_secrets,
            event.group_id.as_ref().map(GroupId::as_str),
        ],
    )?;
    #[allow(clippy::cast_sign_loss)]
    Ok(EventId::new(tx.last_insert_rowid() as u64))
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let id: i64 = row.get("id")?;
    let ts: String = row.get("ts")?;
    let payload_json: String = row.get("payload")?;
    let parent_span: Option<String> = row.get("parent_span_id")?;
    let group_id: Option<String> = row.get("group_id")?;

    let payload: EventPayload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    #[allow(clippy::cast_sign_loss)]
    Ok(Event {
        id: EventId::new(id as u64),
        run_id: RunId::new(row.get::<_, String>("run_id")?),
        ts: DateTime::parse_from_rfc3339(&ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        agent_id: AgentId::new(row.get::<_, String>("agent_id")?),
        step_id: {
            let v: i64 = row.get("step_id")?;
            v as u64
        },
        span_id: SpanId::new(row.get::<_, String>("span_id")?),
        parent_span_id: parent_span.map(SpanId::new),
        payload,
        v: {
            let v: i64 = row.get("v")?;
            v as u32
        },
        redaction: Redaction {
            contains_secrets: row.get("contains_secrets")?,
        },
        group_id: group_id.map(GroupId::new),
    })
}

#[async_trait]
impl EventLog for SqliteStore {
    async fn append_one(&self, event: NewEvent) -> Result<EventId> {
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let id = insert_event(&tx, &event)?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn append_many(&self, events: Vec<NewEvent>) -> Result<Vec<EventId>> {
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut ids = Vec::with_capacity(events.len());
            for event in &events {
                ids.push(insert_event(&tx, event)?);
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn read_page(
        &self,
        run_id: &RunId,
        scope: &Scope,
        after_id: Option<EventId>,
        limit: usize,
        exclude_types: &[&str],
    ) -> Result<EventPage> {
        let run_id = run_id.clone();
        let scope = scope.clone();
        let after = after_id.map_or(0, EventId::as_u64);
        let exclude: Vec<String> = exclude_types.iter().map(|s| (*s).to_string()).collect();

        self.blocking(move |conn| {
            Self::check_visible(conn, run_id.as_str(), &scope, "run")?;

            let mut stmt = conn.prepare(
                "SELECT * FROM events WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
            )?;
            #[allow(clippy::cast_possible_wrap)]
            let limit_i64 = limit as i64;
            let items: Vec<Event> = stmt
                .query_map(params![run_id.as_str(), after, limit_i64], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|e| !exclude.iter().any(|t| t == e.payload.wire_type()))
                .collect();

            let next_cursor = items.last().map(|e| e.id);
            Ok(EventPage { items, next_cursor })
        })
        .await
    }

    async fn pending_approvals(
        &self,
        run_id: &RunId,
        scope: &Scope,
    ) -> Result<Vec<PendingApproval>> {
        let run_id = run_id.clone();
        let scope = scope.clone();

        self.blocking(move |conn| {
            Self::check_visible(conn, run_id.as_str(), &scope, "run")?;

            let mut stmt = conn.prepare(
                "SELECT * FROM events WHERE run_id = ?1 AND event_type = 'tool.requires_approval' ORDER BY id ASC",
            )?;
            let requests: Vec<Event> = stmt
                .query_map(params![run_id.as_str()], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut resolved_stmt = conn.prepare(
                "SELECT 1 FROM events WHERE run_id = ?1 AND tool_call_id = ?2 \
                 AND event_type IN ('tool.approved', 'tool.rejected') LIMIT 1",
            )?;

            let mut pending = Vec::new();
            for event in requests {
                if let EventPayload::ToolRequiresApproval {
                    tool_call_id,
                    tool_name,
                    args,
                    reason,
                    risk_level,
                } = event.payload
                {
                    let resolved: Option<i64> = resolved_stmt
                        .query_row(params![run_id.as_str(), tool_call_id.as_str()], |row| {
                            row.get(0)
                        })
                        .optional()?;
                    if resolved.is_none() {
                        pending.push(PendingApproval {
                            run_id: run_id.clone(),
                            tool_call_id,
                            tool_name,
                            args,
                            reason,
                            risk_level,
                        });
                    }
                }
            }
            Ok(pending)
        })
        .await
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get("status")?;
    let status = parse_status(&status);
    let suspend_reason: Option<String> = row.get("suspend_reason")?;
    let result_json: Option<String> = row.get("result")?;
    let error_code: Option<String> = row.get("error_code")?;
    let error_message: Option<String> = row.get("error_message")?;
    let llm_config: Option<String> = row.get("llm_config")?;
    let delegated: Option<String> = row.get("delegated_permissions")?;

    Ok(Run {
        run_id: RunId::new(row.get::<_, String>("run_id")?),
        scope: Scope {
            org_id: row.get("org_id")?,
            user_id: row.get("user_id")?,
            project_id: row.get("project_id")?,
        },
        session_key: SessionKey::new(row.get::<_, String>("session_key")?),
        group_id: row.get::<_, Option<String>>("group_id")?.map(GroupId::new),
        input: row.get("input")?,
        agent_id: AgentId::new(row.get::<_, String>("agent_id")?),
        llm_config: llm_config.and_then(|s| serde_json::from_str(&s).ok()),
        parent_run_id: row
            .get::<_, Option<String>>("parent_run_id")?
            .map(RunId::new),
        delegated_permissions: delegated.and_then(|s| serde_json::from_str(&s).ok()),
        status,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        started_at: row.get::<_, Option<String>>("started_at")?.map(|s| parse_ts(&s)),
        ended_at: row.get::<_, Option<String>>("ended_at")?.map(|s| parse_ts(&s)),
        cancelled_at: row.get::<_, Option<String>>("cancelled_at")?.map(|s| parse_ts(&s)),
        suspended_at: row.get::<_, Option<String>>("suspended_at")?.map(|s| parse_ts(&s)),
        suspend_reason: suspend_reason.map(|s| parse_suspend_reason(&s)),
        result: result_json.and_then(|s| serde_json::from_str::<RunResult>(&s).ok()),
        error: match (error_code, error_message) {
            (Some(code), Some(message)) => Some(RunError { code, message }),
            _ => None,
        },
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Waiting => "waiting",
        RunStatus::Suspended => "suspended",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "waiting" => RunStatus::Waiting,
        "suspended" => RunStatus::Suspended,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Pending,
    }
}

const fn suspend_reason_str(reason: SuspendReason) -> &'static str {
    match reason {
        SuspendReason::AwaitingApproval => "awaiting_approval",
        SuspendReason::AwaitingChildren => "awaiting_children",
    }
}

fn parse_suspend_reason(s: &str) -> SuspendReason {
    match s {
        "awaiting_children" => SuspendReason::AwaitingChildren,
        _ => SuspendReason::AwaitingApproval,
    }
}

fn row_to_dependency(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunDependency> {
    let status: String = row.get("status")?;
    let status = match status.as_str() {
        "completed" => DependencyStatus::Completed,
        "failed" => DependencyStatus::Failed,
        _ => DependencyStatus::Pending,
    };
    let result_json: Option<String> = row.get("result")?;
    let error_code: Option<String> = row.get("error_code")?;
    let error_message: Option<String> = row.get("error_message")?;

    #[allow(clippy::cast_sign_loss)]
    Ok(RunDependency {
        id: row.get::<_, i64>("id")? as u64,
        parent_run_id: RunId::new(row.get::<_, String>("parent_run_id")?),
        child_run_id: RunId::new(row.get::<_, String>("child_run_id")?),
        tool_call_id: ToolCallId::new(row.get::<_, String>("tool_call_id")?),
        role_id: row.get("role_id")?,
        goal: row.get("goal")?,
        status,
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: match (error_code, error_message) {
            (Some(code), Some(message)) => Some(RunError { code, message }),
            _ => None,
        },
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        completed_at: row
            .get::<_, Option<String>>("completed_at")?
            .map(|s| parse_ts(&s)),
    })
}

#[async_trait]
impl RunRepository for SqliteStore {
    async fn create(&self, new_run: NewRun) -> Result<Run> {
        self.blocking(move |conn| {
            let run_id = RunId::new(uuid::Uuid::new_v4().to_string());
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO runs (
                    run_id, org_id, user_id, project_id, session_key, group_id,
                    input, agent_id, llm_config, parent_run_id, delegated_permissions,
                    status, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'pending', ?12)",
                params![
                    run_id.as_str(),
                    new_run.scope.org_id,
                    new_run.scope.user_id,
                    new_run.scope.project_id,
                    new_run.session_key.as_str(),
                    new_run.group_id.as_ref().map(GroupId::as_str),
                    new_run.input,
                    new_run.agent_id.as_str(),
                    new_run
                        .llm_config
                        .as_ref()
                        .map(serde_json::Value::to_string),
                    new_run.parent_run_id.as_ref().map(RunId::as_str),
                    new_run
                        .delegated_permissions
                        .as_ref()
                        .map(serde_json::Value::to_string),
                    created_at.to_rfc3339(),
                ],
            )?;

            Ok(Run {
                run_id,
                scope: new_run.scope,
                session_key: new_run.session_key,
                group_id: new_run.group_id,
                input: new_run.input,
                agent_id: new_run.agent_id,
                llm_config: new_run.llm_config,
                parent_run_id: new_run.parent_run_id,
                delegated_permissions: new_run.delegated_permissions,
                status: RunStatus::Pending,
                created_at,
                started_at: None,
                ended_at: None,
                cancelled_at: None,
                suspended_at: None,
                suspend_reason: None,
                result: None,
                error: None,
            })
        })
        .await
    }

    async fn get(&self, run_id: &RunId, scope: &Scope) -> Result<Run> {
        let run_id = run_id.clone();
        let scope = scope.clone();
        self.blocking(move |conn| {
            let run = conn
                .query_row(
                    "SELECT * FROM runs WHERE run_id = ?1",
                    params![run_id.as_str()],
                    row_to_run,
                )
                .optional()?
                .ok_or_else(|| RuntimeError::not_found(format!("run '{run_id}'")))?;
            if scope.visible(&run.scope) {
                Ok(run)
            } else {
                Err(RuntimeError::not_found(format!("run '{run_id}'")))
            }
        })
        .await
    }

    async fn claim_running(&self, run_id: &RunId) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE runs SET status = 'running', started_at = ?2 \
                 WHERE run_id = ?1 AND status = 'pending'",
                params![run_id.as_str(), now],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn mark_waiting(&self, run_id: &RunId) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE runs SET status = 'waiting' WHERE run_id = ?1 AND status = 'running'",
                params![run_id.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn resume_from_waiting(&self, run_id: &RunId) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE runs SET status = 'running' WHERE run_id = ?1 AND status = 'waiting'",
                params![run_id.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn mark_suspended(&self, run_id: &RunId, reason: SuspendReason) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE runs SET status = 'suspended', suspended_at = ?2, suspend_reason = ?3 \
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id.as_str(), now, suspend_reason_str(reason)],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn resume_from_suspended(&self, run_id: &RunId) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE runs SET status = 'pending', suspended_at = NULL, suspend_reason = NULL \
                 WHERE run_id = ?1 AND status = 'suspended'",
                params![run_id.as_str()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn complete(&self, run_id: &RunId, output: RunResult) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let result_json = serde_json::to_string(&output)?;
            let updated = conn.execute(
                "UPDATE runs SET status = 'completed', ended_at = ?2, result = ?3 \
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id.as_str(), now, result_json],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn fail(&self, run_id: &RunId, error: RunError) -> Result<bool> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE runs SET status = 'failed', ended_at = ?2, error_code = ?3, error_message = ?4 \
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id.as_str(), now, error.code, error.message],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn cancel(&self, run_id: &RunId, scope: &Scope) -> Result<bool> {
        let run_id = run_id.clone();
        let scope = scope.clone();
        self.blocking(move |conn| {
            Self::check_visible(conn, run_id.as_str(), &scope, "run")?;
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE runs SET status = 'cancelled', cancelled_at = ?2 \
                 WHERE run_id = ?1 AND status IN ('pending', 'running', 'waiting', 'suspended')",
                params![run_id.as_str(), now],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn create_dependency(
        &self,
        parent: &RunId,
        child: &RunId,
        tool_call_id: &ToolCallId,
        role_id: Option<String>,
        goal: String,
    ) -> Result<RunDependency> {
        let parent = parent.clone();
        let child = child.clone();
        let tool_call_id = tool_call_id.clone();
        self.blocking(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO run_dependencies (
                    parent_run_id, child_run_id, tool_call_id, role_id, goal, status, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    parent.as_str(),
                    child.as_str(),
                    tool_call_id.as_str(),
                    role_id,
                    goal,
                    created_at.to_rfc3339(),
                ],
            )?;
            #[allow(clippy::cast_sign_loss)]
            let id = conn.last_insert_rowid() as u64;
            Ok(RunDependency {
                id,
                parent_run_id: parent,
                child_run_id: child,
                tool_call_id,
                role_id,
                goal,
                status: DependencyStatus::Pending,
                result: None,
                error: None,
                created_at,
                completed_at: None,
            })
        })
        .await
    }

    async fn complete_dependency_atomic(
        &self,
        child_run_id: &RunId,
        status: DependencyStatus,
        result: Option<serde_json::Value>,
        error: Option<RunError>,
    ) -> Result<FanInOutcome> {
        let child_run_id = child_run_id.clone();
        self.blocking(move |conn| {
            // BEGIN IMMEDIATE takes the write lock up front, serializing
            // concurrent fan-ins for siblings of the same parent.
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let outcome = (|| -> Result<FanInOutcome> {
                let parent_run_id: String = conn
                    .query_row(
                        "SELECT parent_run_id FROM run_dependencies WHERE child_run_id = ?1",
                        params![child_run_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| {
                        RuntimeError::not_found(format!(
                            "dependency for child run '{child_run_id}'"
                        ))
                    })?;

                let status_str = match status {
                    DependencyStatus::Pending => "pending",
                    DependencyStatus::Completed => "completed",
                    DependencyStatus::Failed => "failed",
                };
                let now = Utc::now().to_rfc3339();
                let result_json = result.as_ref().map(serde_json::Value::to_string);
                let (error_code, error_message) = match &error {
                    Some(e) => (Some(e.code.clone()), Some(e.message.clone())),
                    None => (None, None),
                };

                conn.execute(
                    "UPDATE run_dependencies SET status = ?2, result = ?3, error_code = ?4, \
                     error_message = ?5, completed_at = ?6 WHERE child_run_id = ?1",
                    params![
                        child_run_id.as_str(),
                        status_str,
                        result_json,
                        error_code,
                        error_message,
                        now,
                    ],
                )?;

                let dependency = conn.query_row(
                    "SELECT * FROM run_dependencies WHERE child_run_id = ?1",
                    params![child_run_id.as_str()],
                    row_to_dependency,
                )?;

                #[allow(clippy::cast_sign_loss)]
                let pending_count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM run_dependencies \
                     WHERE parent_run_id = ?1 AND status = 'pending'",
                    params![parent_run_id],
                    |row| row.get::<_, i64>(0),
                )? as u64;

                Ok(FanInOutcome {
                    dependency,
                    pending_count,
                })
            })();

            match outcome {
                Ok(value) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .await
    }

    async fn list_session_history(
        &self,
        scope: &Scope,
        session_key: &SessionKey,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let scope = scope.clone();
        let session_key = session_key.clone();
        self.blocking(move |conn| {
            #[allow(clippy::cast_possible_wrap)]
            let limit_i64 = limit as i64;
            let mut stmt = conn.prepare(
                "SELECT run_id, input, result FROM runs \
                 WHERE session_key = ?1 AND parent_run_id IS NULL AND status = 'completed' \
                 AND org_id = ?2 AND user_id = ?3 AND project_id IS ?4 \
                 ORDER BY created_at ASC LIMIT ?5",
            )?;
            let rows = stmt.query_map(
                params![
                    session_key.as_str(),
                    scope.org_id,
                    scope.user_id,
                    scope.project_id,
                    limit_i64
                ],
                |row| {
                    let run_id: String = row.get(0)?;
                    let input: String = row.get(1)?;
                    let result_json: Option<String> = row.get(2)?;
                    Ok((run_id, input, result_json))
                },
            )?;

            let mut entries = Vec::new();
            for row in rows {
                let (run_id, input, result_json) = row?;
                let output = result_json.and_then(|s| {
                    serde_json::from_str::<RunResult>(&s)
                        .ok()
                        .map(|r| r.output)
                });
                entries.push(HistoryEntry {
                    run_id: RunId::new(run_id),
                    input,
                    output,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn list_children(&self, parent_run_id: &RunId) -> Result<Vec<RunDependency>> {
        let parent_run_id = parent_run_id.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM run_dependencies WHERE parent_run_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![parent_run_id.as_str()], row_to_dependency)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn ancestor_chain(&self, run_id: &RunId) -> Result<Vec<RunId>> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            let mut chain = Vec::new();
            let mut current = run_id;
            loop {
                let parent: Option<String> = conn
                    .query_row(
                        "SELECT parent_run_id FROM runs WHERE run_id = ?1",
                        params![current.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                match parent {
                    Some(p) => {
                        let parent_id = RunId::new(p);
                        chain.push(parent_id.clone());
                        current = parent_id;
                    }
                    None => break,
                }
            }
            Ok(chain)
        })
        .await
    }

    async fn scope_of(&self, run_id: &RunId) -> Result<Scope> {
        let run_id = run_id.clone();
        self.blocking(move |conn| {
            Self::row_scope(conn, run_id.as_str())?
                .ok_or_else(|| RuntimeError::not_found(format!("run '{run_id}'")))
        })
        .await
    }

    async fn append_message(&self, message: RunMessage) -> Result<()> {
        self.blocking(move |conn| {
            let role = match message.role {
                crate::types::MessageRole::System => "system",
                crate::types::MessageRole::User => "user",
                crate::types::MessageRole::Assistant => "assistant",
                crate::types::MessageRole::Tool => "tool",
            };
            conn.execute(
                "INSERT INTO run_messages (
                    run_id, agent_id, step_id, ordinal, role, content, tool_call_id, tool_calls
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.run_id.as_str(),
                    message.agent_id.as_str(),
                    message.step_id,
                    message.ordinal,
                    role,
                    message.content,
                    message.tool_call_id.as_ref().map(ToolCallId::as_str),
                    message
                        .tool_calls
                        .as_ref()
                        .map(serde_json::Value::to_string),
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::ConstraintViolation) => {
                    RuntimeError::invalid_input("ordinal would create a gap or duplicate")
                }
                _ => RuntimeError::from(e),
            })?;
            Ok(())
        })
        .await
    }

    async fn list_messages(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        scope: &Scope,
    ) -> Result<Vec<RunMessage>> {
        let run_id = run_id.clone();
        let agent_id = agent_id.clone();
        let scope = scope.clone();
        self.blocking(move |conn| {
            Self::check_visible(conn, run_id.as_str(), &scope, "run")?;

            let mut stmt = conn.prepare(
                "SELECT * FROM run_messages WHERE run_id = ?1 AND agent_id = ?2 \
                 ORDER BY ordinal ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id.as_str(), agent_id.as_str()], |row| {
                    let role: String = row.get("role")?;
                    let role = match role.as_str() {
                        "system" => crate::types::MessageRole::System,
                        "user" => crate::types::MessageRole::User,
                        "assistant" => crate::types::MessageRole::Assistant,
                        _ => crate::types::MessageRole::Tool,
                    };
                    let tool_calls: Option<String> = row.get("tool_calls")?;
                    #[allow(clippy::cast_sign_loss)]
                    Ok(RunMessage {
                        run_id: RunId::new(row.get::<_, String>("run_id")?),
                        agent_id: AgentId::new(row.get::<_, String>("agent_id")?),
                        step_id: row.get::<_, i64>("step_id")? as u64,
                        ordinal: row.get::<_, i64>("ordinal")? as u64,
                        role,
                        content: row.get("content")?,
                        tool_call_id: row
                            .get::<_, Option<String>>("tool_call_id")?
                            .map(ToolCallId::new),
                        tool_calls: tool_calls.and_then(|s| serde_json::from_str(&s).ok()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        step_id: u64,
        state: CheckpointState,
    ) -> Result<Checkpoint> {
        let run_id = run_id.clone();
        let agent_id = agent_id.clone();
        self.blocking(move |conn| {
            let created_at = Utc::now();
            let state_json = serde_json::to_string(&state)?;
            conn.execute(
                "INSERT INTO checkpoints (run_id, agent_id, step_id, state, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.as_str(),
                    agent_id.as_str(),
                    step_id,
                    state_json,
                    created_at.to_rfc3339(),
                ],
            )?;
            #[allow(clippy::cast_sign_loss)]
            let id = conn.last_insert_rowid() as u64;
            Ok(Checkpoint {
                id,
                run_id,
                agent_id,
                step_id,
                state,
                created_at,
            })
        })
        .await
    }

    async fn latest(
        &self,
        run_id: &RunId,
        agent_id: &AgentId,
        scope: &Scope,
    ) -> Result<Option<Checkpoint>> {
        let run_id = run_id.clone();
        let agent_id = agent_id.clone();
        let scope = scope.clone();
        self.blocking(move |conn| {
            Self::check_visible(conn, run_id.as_str(), &scope, "run")?;

            conn.query_row(
                "SELECT * FROM checkpoints WHERE run_id = ?1 AND agent_id = ?2 \
                 ORDER BY id DESC LIMIT 1",
                params![run_id.as_str(), agent_id.as_str()],
                |row| {
                    let state_json: String = row.get("state")?;
                    let created_at: String = row.get("created_at")?;
                    #[allow(clippy::cast_sign_loss)]
                    Ok(Checkpoint {
                        id: row.get::<_, i64>("id")? as u64,
                        run_id: RunId::new(row.get::<_, String>("run_id")?),
                        agent_id: AgentId::new(row.get::<_, String>("agent_id")?),
                        step_id: row.get::<_, i64>("step_id")? as u64,
                        state: serde_json::from_str(&state_json).unwrap_or_default(),
                        created_at: parse_ts(&created_at),
                    })
                },
            )
            .optional()
            .map_err(RuntimeError::from)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ids::SpanId;

    fn test_scope() -> Scope {
        Scope::new("org-1", "user-1")
    }

    fn sample_new_run() -> NewRun {
        NewRun {
            scope: test_scope(),
            session_key: SessionKey::new("session-1"),
            group_id: None,
            input: "say hi".into(),
            agent_id: AgentId::new("agent-default"),
            llm_config: None,
            parent_run_id: None,
            delegated_permissions: None,
        }
    }

    mod construction {
        use super::*;

        #[test]
        fn in_memory_creates_schema() {
            let store = SqliteStore::in_memory().unwrap();
            let guard = store.conn.lock().unwrap();
            let tables: Vec<String> = guard
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap()
                .query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(std::result::Result::ok)
                .collect();
            for expected in ["runs", "events", "run_dependencies", "checkpoints", "run_messages"] {
                assert!(tables.contains(&expected.to_owned()));
            }
        }
    }

    mod run_lifecycle {
        use super::*;

        #[tokio::test]
        async fn create_then_claim_then_complete() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            assert_eq!(run.status, RunStatus::Pending);

            assert!(store.claim_running(&run.run_id).await.unwrap());
            let claimed = store.get(&run.run_id, &test_scope()).await.unwrap();
            assert_eq!(claimed.status, RunStatus::Running);
            assert!(claimed.started_at.is_some());

            assert!(store
                .complete(&run.run_id, RunResult { output: "hi".into() })
                .await
                .unwrap());
            let done = store.get(&run.run_id, &test_scope()).await.unwrap();
            assert_eq!(done.status, RunStatus::Completed);
            assert_eq!(done.result.unwrap().output, "hi");
        }

        #[tokio::test]
        async fn claim_is_noop_when_not_pending() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            assert!(store.claim_running(&run.run_id).await.unwrap());
            assert!(!store.claim_running(&run.run_id).await.unwrap());
        }

        #[tokio::test]
        async fn suspend_then_resume_cycle() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            store.claim_running(&run.run_id).await.unwrap();

            assert!(store
                .mark_suspended(&run.run_id, SuspendReason::AwaitingChildren)
                .await
                .unwrap());
            let suspended = store.get(&run.run_id, &test_scope()).await.unwrap();
            assert_eq!(suspended.status, RunStatus::Suspended);
            assert_eq!(suspended.suspend_reason, Some(SuspendReason::AwaitingChildren));

            assert!(store.resume_from_suspended(&run.run_id).await.unwrap());
            let resumed = store.get(&run.run_id, &test_scope()).await.unwrap();
            assert_eq!(resumed.status, RunStatus::Pending);
            assert!(resumed.suspend_reason.is_none());
        }

        #[tokio::test]
        async fn cancel_from_any_non_terminal_state() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            assert!(store.cancel(&run.run_id, &test_scope()).await.unwrap());
            let cancelled = store.get(&run.run_id, &test_scope()).await.unwrap();
            assert_eq!(cancelled.status, RunStatus::Cancelled);
            assert!(cancelled.cancelled_at.is_some());
        }
    }

    mod scope_guard {
        use super::*;

        #[tokio::test]
        async fn get_with_wrong_scope_is_not_found() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();

            let wrong_scope = Scope::new("org-2", "user-1");
            let err = store.get(&run.run_id, &wrong_scope).await.unwrap_err();
            assert_eq!(err.code(), "NOT_FOUND");
        }

        #[tokio::test]
        async fn read_page_rejects_mismatched_scope() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            let wrong_scope = Scope::new("org-2", "user-1");
            let err = store
                .read_page(&run.run_id, &wrong_scope, None, 10, &[])
                .await
                .unwrap_err();
            assert_eq!(err.code(), "NOT_FOUND");
        }
    }

    mod event_log {
        use super::*;

        fn event(run_id: &RunId, span: &str) -> NewEvent {
            NewEvent {
                run_id: run_id.clone(),
                agent_id: AgentId::new("agent-default"),
                step_id: 1,
                span_id: SpanId::new(span),
                parent_span_id: None,
                payload: EventPayload::RunStarted,
                redaction: Redaction::default(),
                group_id: None,
            }
        }

        #[tokio::test]
        async fn append_assigns_monotonic_ids() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();

            let id1 = store.append_one(event(&run.run_id, "sp-1")).await.unwrap();
            let id2 = store.append_one(event(&run.run_id, "sp-2")).await.unwrap();
            assert!(id2.as_u64() > id1.as_u64());
        }

        #[tokio::test]
        async fn read_page_paginates_with_cursor() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            for i in 0..5 {
                store
                    .append_one(event(&run.run_id, &format!("sp-{i}")))
                    .await
                    .unwrap();
            }

            let page1 = store
                .read_page(&run.run_id, &test_scope(), None, 2, &[])
                .await
                .unwrap();
            assert_eq!(page1.items.len(), 2);
            assert!(page1.next_cursor.is_some());

            let page2 = store
                .read_page(&run.run_id, &test_scope(), page1.next_cursor, 10, &[])
                .await
                .unwrap();
            assert_eq!(page2.items.len(), 3);
            assert!(page2.next_cursor.is_none());
        }

        #[tokio::test]
        async fn exclude_types_filters_llm_token_events() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            store.append_one(event(&run.run_id, "sp-1")).await.unwrap();
            store
                .append_one(NewEvent {
                    payload: EventPayload::LlmToken { token: "hi".into() },
                    ..event(&run.run_id, "sp-2")
                })
                .await
                .unwrap();

            let page = store
                .read_page(&run.run_id, &test_scope(), None, 10, &["llm.token"])
                .await
                .unwrap();
            assert_eq!(page.items.len(), 1);
        }

        #[tokio::test]
        async fn duplicate_span_id_is_rejected() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            store.append_one(event(&run.run_id, "dup")).await.unwrap();
            let err = store.append_one(event(&run.run_id, "dup")).await;
            assert!(err.is_err());
        }

        #[tokio::test]
        async fn pending_approvals_excludes_resolved_calls() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();

            store
                .append_one(NewEvent {
                    payload: EventPayload::ToolRequiresApproval {
                        tool_call_id: ToolCallId::new("tc-1"),
                        tool_name: "delete_file".into(),
                        args: serde_json::json!({}),
                        reason: "mutating".into(),
                        risk_level: "high".into(),
                    },
                    ..event(&run.run_id, "sp-1")
                })
                .await
                .unwrap();
            store
                .append_one(NewEvent {
                    payload: EventPayload::ToolRequiresApproval {
                        tool_call_id: ToolCallId::new("tc-2"),
                        tool_name: "send_email".into(),
                        args: serde_json::json!({}),
                        reason: "mutating".into(),
                        risk_level: "high".into(),
                    },
                    ..event(&run.run_id, "sp-2")
                })
                .await
                .unwrap();
            store
                .append_one(NewEvent {
                    payload: EventPayload::ToolApproved {
                        tool_call_id: ToolCallId::new("tc-1"),
                        modified_args_applied: false,
                    },
                    ..event(&run.run_id, "sp-3")
                })
                .await
                .unwrap();

            let pending = store
                .pending_approvals(&run.run_id, &test_scope())
                .await
                .unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].tool_call_id, ToolCallId::new("tc-2"));
        }
    }

    mod fan_in {
        use super::*;

        #[tokio::test]
        async fn pending_count_reaches_zero_on_last_child() {
            let store = SqliteStore::in_memory().unwrap();
            let parent = store.create(sample_new_run()).await.unwrap();
            let child_a = store.create(sample_new_run()).await.unwrap();
            let child_b = store.create(sample_new_run()).await.unwrap();

            store
                .create_dependency(
                    &parent.run_id,
                    &child_a.run_id,
                    &ToolCallId::new("tc-a"),
                    None,
                    "subtask a".into(),
                )
                .await
                .unwrap();
            store
                .create_dependency(
                    &parent.run_id,
                    &child_b.run_id,
                    &ToolCallId::new("tc-b"),
                    None,
                    "subtask b".into(),
                )
                .await
                .unwrap();

            let first = store
                .complete_dependency_atomic(
                    &child_a.run_id,
                    DependencyStatus::Completed,
                    Some(serde_json::json!({"output": "a"})),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(first.pending_count, 1);

            let second = store
                .complete_dependency_atomic(
                    &child_b.run_id,
                    DependencyStatus::Completed,
                    Some(serde_json::json!({"output": "b"})),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(second.pending_count, 0);
        }
    }

    mod messages {
        use super::*;

        #[tokio::test]
        async fn append_and_list_preserve_ordinal_order() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            let agent_id = AgentId::new("agent-default");

            for i in 0..3u64 {
                store
                    .append_message(RunMessage {
                        run_id: run.run_id.clone(),
                        agent_id: agent_id.clone(),
                        step_id: 1,
                        ordinal: i,
                        role: crate::types::MessageRole::User,
                        content: format!("turn-{i}"),
                        tool_call_id: None,
                        tool_calls: None,
                    })
                    .await
                    .unwrap();
            }

            let messages = store
                .list_messages(&run.run_id, &agent_id, &test_scope())
                .await
                .unwrap();
            assert_eq!(messages.len(), 3);
            assert_eq!(messages[0].content, "turn-0");
            assert_eq!(messages[2].content, "turn-2");
        }
    }

    mod checkpoints {
        use super::*;

        #[tokio::test]
        async fn latest_returns_highest_id_checkpoint() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            let agent_id = AgentId::new("agent-default");

            store
                .save(&run.run_id, &agent_id, 1, CheckpointState::default())
                .await
                .unwrap();
            store
                .save(
                    &run.run_id,
                    &agent_id,
                    2,
                    CheckpointState {
                        message_ordinal: 5,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            let latest = store
                .latest(&run.run_id, &agent_id, &test_scope())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(latest.step_id, 2);
            assert_eq!(latest.state.message_ordinal, 5);
        }

        #[tokio::test]
        async fn latest_returns_none_when_no_checkpoint_exists() {
            let store = SqliteStore::in_memory().unwrap();
            let run = store.create(sample_new_run()).await.unwrap();
            let latest = store
                .latest(&run.run_id, &AgentId::new("agent-default"), &test_scope())
                .await
                .unwrap();
            assert!(latest.is_none());
        }
    }
}
