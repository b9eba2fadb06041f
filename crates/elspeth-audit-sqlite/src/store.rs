// crates/elspeth-audit-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Audit Recorder
// Description: Durable AuditRecorder backed by SQLite WAL.
// Purpose: Persist the full run/node/edge/row/token/node-state/routing/
//          checkpoint trail so a run can be replayed or resumed.
// Dependencies: elspeth-core, rusqlite, serde_json, thiserror
// ============================================================================

//! ## Overview
//! One [`SqliteAuditRecorder`] is bound to at most one active run at a
//! time (set by [`SqliteAuditRecorder::begin_run`] or
//! [`SqliteAuditRecorder::resume`]); row/token/node-state identifiers are
//! SQLite `AUTOINCREMENT` rowids, globally unique rather than merely
//! run-scoped, which is a strict superset of the
//! [`elspeth_core::core::RowId`] et al. invariant ("unique within the
//! owning run") and lets every `AuditRecorder` method that does not carry
//! an explicit `run_id` resolve its row directly. Routing-event groups are
//! written inside one `BEGIN IMMEDIATE ... COMMIT` transaction so the
//! group is atomic without a dedicated writer thread: unlike the teacher's
//! store, `AuditRecorder` is only ever driven synchronously from one
//! in-process orchestrator, so there is no concurrent writer to serialize
//! against.

use std::path::Path;

use elspeth_core::core::CallId;
use elspeth_core::core::CallStatus;
use elspeth_core::core::Checkpoint;
use elspeth_core::core::CheckpointId;
use elspeth_core::core::Determinism;
use elspeth_core::core::EdgeId;
use elspeth_core::core::EdgeMode;
use elspeth_core::core::EventId;
use elspeth_core::core::NodeId;
use elspeth_core::core::NodeState;
use elspeth_core::core::NodeStateStatus;
use elspeth_core::core::NodeType;
use elspeth_core::core::Row;
use elspeth_core::core::RowId;
use elspeth_core::core::RoutingGroupId;
use elspeth_core::core::RunId;
use elspeth_core::core::RunStatus;
use elspeth_core::core::StateId;
use elspeth_core::core::Timestamp;
use elspeth_core::core::TokenId;
use elspeth_core::core::TokenOutcome;
use elspeth_core::runtime::AuditRecorder;
use elspeth_core::runtime::IncompleteBatch;
use elspeth_core::runtime::RecorderError;
use elspeth_core::runtime::RoutingEventInput;
use elspeth_core::runtime::RunRefs;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde_json::Value;
use thiserror::Error;

/// `SQLite` schema version written to `store_meta`.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout applied to every connection.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Failures opening or migrating the store. Converted to [`RecorderError`]
/// at the `AuditRecorder` trait boundary.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// The underlying `SQLite` engine reported an error.
    #[error("sqlite audit store error: {0}")]
    Db(String),
    /// The store file exists but its schema version does not match.
    #[error("sqlite audit store schema version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version recorded in `store_meta`.
        found: i64,
        /// Version this build expects.
        expected: i64,
    },
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(value.to_string())
    }
}

fn recorder_err(err: impl std::fmt::Display) -> RecorderError {
    RecorderError::new(err.to_string())
}

fn json_text(value: &Value) -> String {
    value.to_string()
}

fn opt_json_text(value: Option<&Value>) -> Option<String> {
    value.map(json_text)
}

fn parse_json(text: &str) -> Result<Value, RecorderError> {
    serde_json::from_str(text).map_err(recorder_err)
}

fn parse_opt_json(text: Option<String>) -> Result<Option<Value>, RecorderError> {
    text.map(|t| parse_json(&t)).transpose()
}

fn parse_ts(text: &str) -> Result<Timestamp, RecorderError> {
    Timestamp::parse_rfc3339(text).map_err(recorder_err)
}

fn node_id_of(raw: i64) -> Result<NodeId, RecorderError> {
    NodeId::from_raw(raw as u64).ok_or_else(|| RecorderError::new("node_id must be non-zero"))
}

/// A durable [`AuditRecorder`] backed by an on-disk `SQLite` database.
pub struct SqliteAuditRecorder {
    conn: Connection,
    current_run: Option<RunId>,
}

impl SqliteAuditRecorder {
    /// Opens (creating if absent) the store at `path`, applying pragmas and
    /// initializing the schema.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the file cannot be opened, the
    /// pragmas cannot be applied, or the schema is present at an
    /// incompatible version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let mut conn = Connection::open_with_flags(path.as_ref(), flags)?;
        apply_pragmas(&conn)?;
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn,
            current_run: None,
        })
    }

    /// Binds this recorder to an already-existing run, for resume. Every
    /// subsequent call that does not carry an explicit `run_id` (node,
    /// edge, row, token creation) is scoped to this run.
    pub fn resume(&mut self, run_id: RunId) {
        self.current_run = Some(run_id);
    }

    fn require_run(&self) -> Result<RunId, RecorderError> {
        self.current_run
            .clone()
            .ok_or_else(|| RecorderError::new("no active run bound to this recorder"))
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), SqliteStoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
    conn.busy_timeout(std::time::Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

fn initialize_schema(conn: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        Some(found) if found != SCHEMA_VERSION => {
            return Err(SqliteStoreError::VersionMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Some(_) => {}
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(
                "CREATE TABLE runs (
                    run_id TEXT PRIMARY KEY,
                    canonical_version TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    settings_json TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE TABLE nodes (
                    run_id TEXT NOT NULL,
                    node_id INTEGER NOT NULL,
                    plugin_name TEXT NOT NULL,
                    node_type TEXT NOT NULL,
                    plugin_version TEXT NOT NULL,
                    determinism TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    config_json TEXT NOT NULL,
                    registered_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, node_id)
                );
                CREATE TABLE edges (
                    run_id TEXT NOT NULL,
                    edge_id INTEGER NOT NULL,
                    from_node_id INTEGER NOT NULL,
                    to_node_id INTEGER NOT NULL,
                    label TEXT NOT NULL,
                    default_mode TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, edge_id)
                );
                CREATE TABLE rows (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    source_node_id INTEGER NOT NULL,
                    row_index INTEGER NOT NULL,
                    source_data_hash TEXT NOT NULL,
                    source_data_ref TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX idx_rows_run ON rows (run_id, source_node_id, row_index);
                CREATE TABLE tokens (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    row_id INTEGER NOT NULL,
                    parent_token_id INTEGER,
                    branch_name TEXT,
                    created_at TEXT NOT NULL,
                    outcome_json TEXT
                );
                CREATE INDEX idx_tokens_run ON tokens (run_id);
                CREATE TABLE node_states (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    token_id INTEGER NOT NULL,
                    node_id INTEGER NOT NULL,
                    step_index INTEGER NOT NULL,
                    attempt INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    input_hash TEXT NOT NULL,
                    context_before TEXT,
                    output_hash TEXT,
                    error TEXT,
                    success_reason TEXT,
                    context_after TEXT,
                    duration_ms INTEGER,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX idx_node_states_run ON node_states (run_id);
                CREATE TABLE routing_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    state_id INTEGER NOT NULL,
                    edge_id INTEGER NOT NULL,
                    routing_group_id TEXT NOT NULL,
                    ordinal INTEGER NOT NULL,
                    mode TEXT NOT NULL,
                    reason_hash TEXT,
                    reason_ref TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE external_calls (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    state_id INTEGER NOT NULL,
                    call_index INTEGER NOT NULL,
                    call_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    request_hash TEXT NOT NULL,
                    request_ref TEXT,
                    response_hash TEXT NOT NULL,
                    response_ref TEXT,
                    retries INTEGER NOT NULL,
                    started_at TEXT NOT NULL,
                    completed_at TEXT NOT NULL
                );
                CREATE TABLE checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    token_id INTEGER NOT NULL,
                    node_id INTEGER NOT NULL,
                    sequence_number INTEGER NOT NULL,
                    topology_hash TEXT NOT NULL,
                    config_hash TEXT NOT NULL,
                    format_version INTEGER NOT NULL,
                    aggregation_state_json TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX idx_checkpoints_run ON checkpoints (run_id, sequence_number);",
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn node_type_tag(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::Source => "source",
        NodeType::Transform => "transform",
        NodeType::Gate => "gate",
        NodeType::Aggregation => "aggregation",
        NodeType::Coalesce => "coalesce",
        NodeType::Sink => "sink",
    }
}

fn determinism_tag(determinism: Determinism) -> &'static str {
    match determinism {
        Determinism::Deterministic => "deterministic",
        Determinism::NonDeterministic => "non_deterministic",
        Determinism::IoRead => "io_read",
        Determinism::IoWrite => "io_write",
    }
}

fn edge_mode_tag(mode: EdgeMode) -> &'static str {
    match mode {
        EdgeMode::Move => "move",
        EdgeMode::Copy => "copy",
        EdgeMode::Divert => "divert",
    }
}

fn parse_edge_mode(tag: &str) -> Result<EdgeMode, RecorderError> {
    match tag {
        "move" => Ok(EdgeMode::Move),
        "copy" => Ok(EdgeMode::Copy),
        "divert" => Ok(EdgeMode::Divert),
        other => Err(RecorderError::new(format!("unknown edge mode '{other}'"))),
    }
}

fn state_status_tag(status: NodeStateStatus) -> &'static str {
    match status {
        NodeStateStatus::Open => "open",
        NodeStateStatus::Completed => "completed",
        NodeStateStatus::Failed => "failed",
        NodeStateStatus::Pending => "pending",
    }
}

fn parse_state_status(tag: &str) -> Result<NodeStateStatus, RecorderError> {
    match tag {
        "open" => Ok(NodeStateStatus::Open),
        "completed" => Ok(NodeStateStatus::Completed),
        "failed" => Ok(NodeStateStatus::Failed),
        "pending" => Ok(NodeStateStatus::Pending),
        other => Err(RecorderError::new(format!("unknown node-state status '{other}'"))),
    }
}

fn call_status_tag(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Success => "success",
        CallStatus::Failed => "failed",
        CallStatus::Retrying => "retrying",
    }
}

fn run_status_tag(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

impl AuditRecorder for SqliteAuditRecorder {
    fn begin_run(
        &mut self,
        canonical_version: &str,
        config_hash: &str,
        settings_json: &Value,
    ) -> Result<RunId, RecorderError> {
        let now = Timestamp::now();
        let run_id = RunId::new(format!("run_{}", now.to_rfc3339().replace([':', '.'], "-")));
        self.conn
            .execute(
                "INSERT INTO runs (run_id, canonical_version, config_hash, settings_json, status, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, NULL)",
                params![
                    run_id.as_str(),
                    canonical_version,
                    config_hash,
                    json_text(settings_json),
                    now.to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        self.current_run = Some(run_id.clone());
        Ok(run_id)
    }

    fn register_node(
        &mut self,
        node_id: NodeId,
        plugin_name: &str,
        node_type: NodeType,
        plugin_version: &str,
        determinism: Determinism,
        config_hash: &str,
        config_json: &Value,
    ) -> Result<(), RecorderError> {
        let run_id = self.require_run()?;
        self.conn
            .execute(
                "INSERT INTO nodes (run_id, node_id, plugin_name, node_type, plugin_version, determinism, config_hash, config_json, registered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id.as_str(),
                    node_id.get() as i64,
                    plugin_name,
                    node_type_tag(node_type),
                    plugin_version,
                    determinism_tag(determinism),
                    config_hash,
                    json_text(config_json),
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        Ok(())
    }

    fn register_edge(
        &mut self,
        edge_id: EdgeId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        label: &str,
        default_mode: EdgeMode,
    ) -> Result<(), RecorderError> {
        let run_id = self.require_run()?;
        self.conn
            .execute(
                "INSERT INTO edges (run_id, edge_id, from_node_id, to_node_id, label, default_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id.as_str(),
                    edge_id.get() as i64,
                    from_node_id.get() as i64,
                    to_node_id.get() as i64,
                    label,
                    edge_mode_tag(default_mode),
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        Ok(())
    }

    fn create_row(
        &mut self,
        source_node_id: NodeId,
        row_index: u64,
        source_data_hash: &str,
        source_data_ref: Option<&str>,
    ) -> Result<RowId, RecorderError> {
        let run_id = self.require_run()?;
        self.conn
            .execute(
                "INSERT INTO rows (run_id, source_node_id, row_index, source_data_hash, source_data_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.as_str(),
                    source_node_id.get() as i64,
                    row_index as i64,
                    source_data_hash,
                    source_data_ref,
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        let id = self.conn.last_insert_rowid();
        RowId::from_raw(id as u64).ok_or_else(|| RecorderError::new("row_id must be non-zero"))
    }

    fn create_token(
        &mut self,
        row_id: RowId,
        parent_token_id: Option<TokenId>,
        branch_name: Option<&str>,
    ) -> Result<TokenId, RecorderError> {
        let run_id = self.require_run()?;
        self.conn
            .execute(
                "INSERT INTO tokens (run_id, row_id, parent_token_id, branch_name, created_at, outcome_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![
                    run_id.as_str(),
                    row_id.get() as i64,
                    parent_token_id.map(|t| t.get() as i64),
                    branch_name,
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        let id = self.conn.last_insert_rowid();
        TokenId::from_raw(id as u64).ok_or_else(|| RecorderError::new("token_id must be non-zero"))
    }

    fn begin_node_state(
        &mut self,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        attempt: u32,
        input_hash: &str,
        context_before: Option<&Value>,
    ) -> Result<StateId, RecorderError> {
        let run_id = self.require_run()?;
        self.conn
            .execute(
                "INSERT INTO node_states (run_id, token_id, node_id, step_index, attempt, status, input_hash, context_before, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8)",
                params![
                    run_id.as_str(),
                    token_id.get() as i64,
                    node_id.get() as i64,
                    step_index,
                    attempt,
                    input_hash,
                    opt_json_text(context_before),
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        let id = self.conn.last_insert_rowid();
        StateId::from_raw(id as u64).ok_or_else(|| RecorderError::new("state_id must be non-zero"))
    }

    fn complete_node_state(
        &mut self,
        state_id: StateId,
        status: NodeStateStatus,
        output_hash: Option<&str>,
        error: Option<&Value>,
        success_reason: Option<&Value>,
        context_after: Option<&Value>,
        duration_ms: Option<u64>,
    ) -> Result<(), RecorderError> {
        self.conn
            .execute(
                "UPDATE node_states SET status = ?1, output_hash = ?2, error = ?3, success_reason = ?4,
                     context_after = ?5, duration_ms = ?6, completed_at = ?7
                 WHERE id = ?8",
                params![
                    state_status_tag(status),
                    output_hash,
                    opt_json_text(error),
                    opt_json_text(success_reason),
                    opt_json_text(context_after),
                    duration_ms.map(|d| d as i64),
                    Timestamp::now().to_rfc3339(),
                    state_id.get() as i64
                ],
            )
            .map_err(recorder_err)?;
        Ok(())
    }

    fn record_routing_events(
        &mut self,
        state_id: StateId,
        group: &RoutingGroupId,
        events: &[RoutingEventInput],
    ) -> Result<Vec<EventId>, RecorderError> {
        let tx = self.conn.transaction().map_err(recorder_err)?;
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            tx.execute(
                "INSERT INTO routing_events (state_id, edge_id, routing_group_id, ordinal, mode, reason_hash, reason_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    state_id.get() as i64,
                    event.edge_id.get() as i64,
                    group.as_str(),
                    event.ordinal,
                    edge_mode_tag(event.mode),
                    event.reason_hash,
                    event.reason_ref,
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
            let id = tx.last_insert_rowid();
            ids.push(EventId::from_raw(id as u64).ok_or_else(|| RecorderError::new("event_id must be non-zero"))?);
        }
        tx.commit().map_err(recorder_err)?;
        Ok(ids)
    }

    fn record_external_call(
        &mut self,
        state_id: StateId,
        call_index: u32,
        call_type: &str,
        status: CallStatus,
        request_hash: &str,
        request_ref: Option<&str>,
        response_hash: &str,
        response_ref: Option<&str>,
        retries: u32,
    ) -> Result<CallId, RecorderError> {
        let now = Timestamp::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO external_calls (state_id, call_index, call_type, status, request_hash, request_ref,
                     response_hash, response_ref, retries, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    state_id.get() as i64,
                    call_index,
                    call_type,
                    call_status_tag(status),
                    request_hash,
                    request_ref,
                    response_hash,
                    response_ref,
                    retries,
                    now
                ],
            )
            .map_err(recorder_err)?;
        let id = self.conn.last_insert_rowid();
        CallId::from_raw(id as u64).ok_or_else(|| RecorderError::new("call_id must be non-zero"))
    }

    fn get_incomplete_batches(&mut self, run_id: &RunId) -> Result<Vec<IncompleteBatch>, RecorderError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ns.id, ns.node_id, ns.token_id FROM node_states ns
                 WHERE ns.run_id = ?1 AND ns.status = 'pending'
                 ORDER BY ns.id",
            )
            .map_err(recorder_err)?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                let state_id: i64 = row.get(0)?;
                let node_id: i64 = row.get(1)?;
                let token_id: i64 = row.get(2)?;
                Ok((state_id, node_id, token_id))
            })
            .map_err(recorder_err)?;
        let mut batches: Vec<IncompleteBatch> = Vec::new();
        for entry in rows {
            let (state_id, node_id, token_id) = entry.map_err(recorder_err)?;
            batches.push(IncompleteBatch {
                state_id: StateId::from_raw(state_id as u64).ok_or_else(|| RecorderError::new("state_id must be non-zero"))?,
                node_id: node_id_of(node_id)?,
                token_ids: vec![TokenId::from_raw(token_id as u64).ok_or_else(|| RecorderError::new("token_id must be non-zero"))?],
            });
        }
        Ok(batches)
    }

    fn update_batch_status(&mut self, state_id: StateId, status: NodeStateStatus) -> Result<(), RecorderError> {
        self.conn
            .execute(
                "UPDATE node_states SET status = ?1 WHERE id = ?2",
                params![state_status_tag(status), state_id.get() as i64],
            )
            .map_err(recorder_err)?;
        Ok(())
    }

    fn retry_batch(&mut self, state_id: StateId) -> Result<StateId, RecorderError> {
        let existing = self.get_node_state(state_id)?;
        self.begin_node_state(
            existing.token_id,
            existing.node_id,
            existing.step_index,
            existing.attempt + 1,
            &existing.input_hash,
            existing.context_before.as_ref(),
        )
    }

    fn get_node_state(&mut self, state_id: StateId) -> Result<NodeState, RecorderError> {
        self.conn
            .query_row(
                "SELECT id, run_id, token_id, node_id, step_index, attempt, status, input_hash, context_before,
                        output_hash, error, success_reason, context_after, duration_ms, started_at, completed_at
                 FROM node_states WHERE id = ?1",
                params![state_id.get() as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, Option<String>>(12)?,
                        row.get::<_, Option<i64>>(13)?,
                        row.get::<_, String>(14)?,
                        row.get::<_, Option<String>>(15)?,
                    ))
                },
            )
            .map_err(recorder_err)
            .and_then(
                |(
                    id,
                    run_id,
                    token_id,
                    node_id,
                    step_index,
                    attempt,
                    status,
                    input_hash,
                    context_before,
                    output_hash,
                    error,
                    success_reason,
                    context_after,
                    duration_ms,
                    started_at,
                    completed_at,
                )| {
                    Ok(NodeState {
                        state_id: StateId::from_raw(id as u64).ok_or_else(|| RecorderError::new("state_id must be non-zero"))?,
                        token_id: TokenId::from_raw(token_id as u64).ok_or_else(|| RecorderError::new("token_id must be non-zero"))?,
                        node_id: node_id_of(node_id)?,
                        run_id: RunId::new(run_id),
                        step_index,
                        attempt,
                        status: parse_state_status(&status)?,
                        input_hash,
                        context_before: parse_opt_json(context_before)?,
                        output_hash,
                        error: parse_opt_json(error)?,
                        success_reason: parse_opt_json(success_reason)?,
                        context_after: parse_opt_json(context_after)?,
                        duration_ms: duration_ms.map(|d| d as u64),
                        started_at: parse_ts(&started_at)?,
                        completed_at: completed_at.map(|t| parse_ts(&t)).transpose()?,
                    })
                },
            )
    }

    fn record_token_outcome(&mut self, token_id: TokenId, outcome: &TokenOutcome) -> Result<(), RecorderError> {
        let text = serde_json::to_string(outcome).map_err(recorder_err)?;
        self.conn
            .execute(
                "UPDATE tokens SET outcome_json = ?1 WHERE id = ?2",
                params![text, token_id.get() as i64],
            )
            .map_err(recorder_err)?;
        Ok(())
    }

    fn create_checkpoint(
        &mut self,
        run_id: &RunId,
        token_id: TokenId,
        node_id: NodeId,
        sequence_number: u64,
        topology_hash: &str,
        config_hash: &str,
        aggregation_state_json: Option<&Value>,
    ) -> Result<CheckpointId, RecorderError> {
        self.conn
            .execute(
                "INSERT INTO checkpoints (run_id, token_id, node_id, sequence_number, topology_hash, config_hash,
                     format_version, aggregation_state_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id.as_str(),
                    token_id.get() as i64,
                    node_id.get() as i64,
                    sequence_number as i64,
                    topology_hash,
                    config_hash,
                    elspeth_core::core::CHECKPOINT_FORMAT_VERSION,
                    opt_json_text(aggregation_state_json),
                    Timestamp::now().to_rfc3339()
                ],
            )
            .map_err(recorder_err)?;
        let id = self.conn.last_insert_rowid();
        CheckpointId::from_raw(id as u64).ok_or_else(|| RecorderError::new("checkpoint_id must be non-zero"))
    }

    fn latest_checkpoint(&mut self, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError> {
        self.conn
            .query_row(
                "SELECT id, token_id, node_id, sequence_number, topology_hash, config_hash, format_version,
                        aggregation_state_json, created_at
                 FROM checkpoints WHERE run_id = ?1 ORDER BY sequence_number DESC LIMIT 1",
                params![run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .map_err(recorder_err)?
            .map(
                |(id, token_id, node_id, sequence_number, topology_hash, config_hash, format_version, aggregation_state_json, created_at)| {
                    Ok(Checkpoint {
                        checkpoint_id: CheckpointId::from_raw(id as u64)
                            .ok_or_else(|| RecorderError::new("checkpoint_id must be non-zero"))?,
                        run_id: run_id.clone(),
                        token_id: TokenId::from_raw(token_id as u64).ok_or_else(|| RecorderError::new("token_id must be non-zero"))?,
                        node_id: node_id_of(node_id)?,
                        sequence_number: sequence_number as u64,
                        topology_hash,
                        config_hash,
                        format_version,
                        aggregation_state_json: parse_opt_json(aggregation_state_json)?,
                        created_at: parse_ts(&created_at)?,
                    })
                },
            )
            .transpose()
    }

    fn row_index_for_token(&mut self, token_id: TokenId) -> Result<Option<u64>, RecorderError> {
        self.conn
            .query_row(
                "SELECT rows.row_index FROM tokens JOIN rows ON rows.id = tokens.row_id WHERE tokens.id = ?1",
                params![token_id.get() as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(recorder_err)
            .map(|opt| opt.map(|v| v as u64))
    }

    fn complete_run(&mut self, run_id: &RunId, status: RunStatus) -> Result<(), RecorderError> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
                params![run_status_tag(status), Timestamp::now().to_rfc3339(), run_id.as_str()],
            )
            .map_err(recorder_err)?;
        if status == RunStatus::Completed {
            self.conn
                .execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id.as_str()])
                .map_err(recorder_err)?;
        }
        Ok(())
    }

    fn get_unprocessed_row_data(
        &mut self,
        run_id: &RunId,
        source_node_id: NodeId,
        after_row_index: u64,
    ) -> Result<Vec<Row>, RecorderError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, row_index, source_data_hash, source_data_ref, created_at FROM rows
                 WHERE run_id = ?1 AND source_node_id = ?2 AND row_index > ?3
                 ORDER BY row_index",
            )
            .map_err(recorder_err)?;
        let rows = stmt
            .query_map(
                params![run_id.as_str(), source_node_id.get() as i64, after_row_index as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .map_err(recorder_err)?;
        let mut result = Vec::new();
        for entry in rows {
            let (id, row_index, hash, data_ref, created_at) = entry.map_err(recorder_err)?;
            result.push(Row {
                row_id: RowId::from_raw(id as u64).ok_or_else(|| RecorderError::new("row_id must be non-zero"))?,
                run_id: run_id.clone(),
                source_node_id,
                row_index: row_index as u64,
                source_data_hash: hash,
                source_data_ref: data_ref,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(result)
    }

    fn run_refs_snapshot(&mut self) -> Result<Vec<RunRefs>, RecorderError> {
        let mut run_stmt = self.conn.prepare("SELECT run_id, completed_at FROM runs").map_err(recorder_err)?;
        let runs = run_stmt
            .query_map(params![], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))
            .map_err(recorder_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(recorder_err)?;
        drop(run_stmt);

        let mut snapshot = Vec::with_capacity(runs.len());
        for (run_id_text, completed_at_text) in runs {
            let mut refs = std::collections::HashSet::new();

            let mut row_stmt = self
                .conn
                .prepare("SELECT source_data_ref FROM rows WHERE run_id = ?1 AND source_data_ref IS NOT NULL")
                .map_err(recorder_err)?;
            for entry in row_stmt.query_map(params![run_id_text], |row| row.get::<_, String>(0)).map_err(recorder_err)? {
                refs.insert(entry.map_err(recorder_err)?);
            }
            drop(row_stmt);

            // Joins through node_states.run_id, never through nodes.node_id: a
            // node id may be reused across runs, making that join ambiguous.
            let mut call_stmt = self
                .conn
                .prepare(
                    "SELECT request_ref, response_ref FROM external_calls
                     WHERE state_id IN (SELECT id FROM node_states WHERE run_id = ?1)",
                )
                .map_err(recorder_err)?;
            for entry in call_stmt
                .query_map(params![run_id_text], |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)))
                .map_err(recorder_err)?
            {
                let (request_ref, response_ref) = entry.map_err(recorder_err)?;
                if let Some(r) = request_ref {
                    refs.insert(r);
                }
                if let Some(r) = response_ref {
                    refs.insert(r);
                }
            }
            drop(call_stmt);

            let mut event_stmt = self
                .conn
                .prepare(
                    "SELECT reason_ref FROM routing_events
                     WHERE state_id IN (SELECT id FROM node_states WHERE run_id = ?1) AND reason_ref IS NOT NULL",
                )
                .map_err(recorder_err)?;
            for entry in event_stmt.query_map(params![run_id_text], |row| row.get::<_, String>(0)).map_err(recorder_err)? {
                refs.insert(entry.map_err(recorder_err)?);
            }
            drop(event_stmt);

            snapshot.push(RunRefs {
                run_id: RunId::from(run_id_text.as_str()),
                completed_at: completed_at_text.map(|t| parse_ts(&t)).transpose()?,
                refs,
            });
        }
        Ok(snapshot)
    }
}
