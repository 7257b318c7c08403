//! The executor thread: sole owner of the SQLite connection.
//!
//! Requests arrive over a bounded crossbeam channel and are answered through
//! tokio oneshot channels. While an explicit transaction is open, requests
//! that do not belong to it are parked and replayed in arrival order once the
//! transaction ends.

use crate::state::DriverSettings;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use quarry_core::protocol::RestoreResponse;
use quarry_core::safety::{
    backup_database_files, is_corruption, probe_integrity, remove_database_files,
    restore_database_files,
};
use quarry_core::schema::{init_schema, open_database};
use quarry_core::{
    CorruptionMarker, IntegrityReport, IntegrityStatus, QuarryError, QueryOutput, Result,
    RpcRequest, RpcResult, SqlValue, Statement, TransactionId,
};
use rusqlite::Connection;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Job {
    Rpc {
        request: RpcRequest,
        reply: Reply<RpcResult>,
    },
    Integrity {
        reply: Reply<IntegrityReport>,
    },
    Backup {
        reply: Reply<Vec<PathBuf>>,
    },
    Recreate {
        reply: Reply<Vec<PathBuf>>,
    },
    Restore {
        backup_path: PathBuf,
        reply: Reply<RestoreResponse>,
    },
}

/// Cloneable async front of the executor thread
#[derive(Clone)]
pub struct ExecutorHandle {
    sender: Sender<Job>,
    parked: Arc<AtomicUsize>,
    open_tx: Arc<Mutex<Option<TransactionId>>>,
}

impl ExecutorHandle {
    pub async fn rpc(&self, request: RpcRequest) -> Result<RpcResult> {
        self.submit(|reply| Job::Rpc { request, reply }).await
    }

    pub async fn integrity(&self) -> Result<IntegrityReport> {
        self.submit(|reply| Job::Integrity { reply }).await
    }

    pub async fn backup(&self) -> Result<Vec<PathBuf>> {
        self.submit(|reply| Job::Backup { reply }).await
    }

    pub async fn recreate(&self) -> Result<Vec<PathBuf>> {
        self.submit(|reply| Job::Recreate { reply }).await
    }

    pub async fn restore(&self, backup_path: PathBuf) -> Result<RestoreResponse> {
        self.submit(|reply| Job::Restore { backup_path, reply }).await
    }

    /// Requests queued or parked, not yet answered
    pub fn queue_depth(&self) -> usize {
        self.sender.len() + self.parked.load(Ordering::Relaxed)
    }

    pub fn open_transaction(&self) -> Option<TransactionId> {
        self.open_tx.lock().ok().and_then(|slot| slot.clone())
    }

    async fn submit<T: Send + 'static>(
        &self,
        make: impl FnOnce(Reply<T>) -> Job,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        match self.sender.try_send(make(reply)) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                let sender = self.sender.clone();
                tokio::task::spawn_blocking(move || sender.send(job).is_ok())
                    .await
                    .ok()
                    .filter(|sent| *sent)
                    .ok_or_else(executor_stopped)?;
            }
            Err(TrySendError::Disconnected(_)) => return Err(executor_stopped()),
        }
        response.await.map_err(|_| executor_stopped())?
    }
}

fn executor_stopped() -> QuarryError {
    QuarryError::DriverUnavailable("executor thread stopped".to_string())
}

/// Spawn the executor thread for `settings.db_path`.
pub fn spawn(settings: &DriverSettings) -> std::io::Result<ExecutorHandle> {
    let (sender, receiver) = crossbeam_channel::bounded(settings.queue_capacity);
    let parked = Arc::new(AtomicUsize::new(0));
    let open_tx = Arc::new(Mutex::new(None));

    let executor = Executor {
        settings: settings.clone(),
        conn: None,
        open_tx: None,
        parked: VecDeque::new(),
        parked_count: Arc::clone(&parked),
        shared_tx: Arc::clone(&open_tx),
        last_probe_ok: None,
    };
    std::thread::Builder::new()
        .name("quarry-executor".to_string())
        .spawn(move || executor.run(receiver))?;

    Ok(ExecutorHandle {
        sender,
        parked,
        open_tx,
    })
}

struct OpenTransaction {
    id: TransactionId,
    last_activity: Instant,
}

enum Outcome {
    Result(RpcResult),
    Begun(TransactionId),
    Ended,
}

struct Executor {
    settings: DriverSettings,
    conn: Option<Connection>,
    open_tx: Option<OpenTransaction>,
    parked: VecDeque<Job>,
    parked_count: Arc<AtomicUsize>,
    shared_tx: Arc<Mutex<Option<TransactionId>>>,
    last_probe_ok: Option<Instant>,
}

impl Executor {
    fn run(mut self, receiver: Receiver<Job>) {
        tracing::info!(db = %self.settings.db_path.display(), "executor started");
        if let Err(err) = self.ensure_connection() {
            tracing::warn!(error = %err, "database not usable at startup");
        }

        loop {
            if self.open_tx.is_none() {
                if let Some(job) = self.parked.pop_front() {
                    self.parked_count.store(self.parked.len(), Ordering::Relaxed);
                    self.dispatch(job);
                    continue;
                }
            }

            let job = match &self.open_tx {
                Some(tx) => {
                    let deadline = tx.last_activity + self.settings.transaction_timeout;
                    match receiver.recv_deadline(deadline) {
                        Ok(job) => job,
                        Err(RecvTimeoutError::Timeout) => {
                            self.expire_transaction();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };
            self.dispatch(job);
        }

        self.abort_transaction("driver shutting down");
        tracing::info!("executor stopped");
    }

    fn dispatch(&mut self, job: Job) {
        match job {
            Job::Rpc { request, reply } => {
                if self.open_tx.is_some() && request.transaction_id().is_none() {
                    self.parked.push_back(Job::Rpc { request, reply });
                    self.parked_count.store(self.parked.len(), Ordering::Relaxed);
                    return;
                }
                let op = request.op_name();
                let result = self.handle_rpc(request);
                if let Err(err) = &result {
                    tracing::debug!(op, code = err.code(), error = %err, "rpc failed");
                }
                let _ = reply.send(result);
            }
            Job::Integrity { reply } => {
                let _ = reply.send(self.probe());
            }
            Job::Backup { reply } => {
                let _ = reply.send(backup_database_files(&self.settings.db_path));
            }
            Job::Recreate { reply } => {
                let _ = reply.send(self.recreate());
            }
            Job::Restore { backup_path, reply } => {
                let _ = reply.send(self.restore(backup_path));
            }
        }
    }

    fn handle_rpc(&mut self, request: RpcRequest) -> Result<RpcResult> {
        if let Some(id) = request.transaction_id() {
            match &mut self.open_tx {
                Some(open) if &open.id == id => open.last_activity = Instant::now(),
                _ => return Err(QuarryError::TransactionNotFound(id.to_string())),
            }
        }

        let is_rollback = matches!(request, RpcRequest::RollbackTransaction { .. });
        if !is_rollback {
            if let Some(marker) = CorruptionMarker::read(&self.settings.db_path)? {
                self.abort_transaction("database entered safe mode");
                return Err(QuarryError::corrupted(marker.message));
            }
            if self.open_tx.is_none() {
                self.ensure_probe()?;
            }
        }
        self.ensure_connection()?;

        let explicit = request.transaction_id().is_some();
        let outcome = match self.conn.as_ref() {
            Some(conn) => run_request(conn, request),
            None => Err(QuarryError::DriverUnavailable("no database connection".into())),
        };

        match outcome {
            Ok(Outcome::Result(result)) => Ok(result),
            Ok(Outcome::Begun(id)) => {
                tracing::debug!(transaction = %id, "transaction opened");
                self.set_open_tx(Some(OpenTransaction {
                    id: id.clone(),
                    last_activity: Instant::now(),
                }));
                Ok(RpcResult::Transaction { transaction_id: id })
            }
            Ok(Outcome::Ended) => {
                self.set_open_tx(None);
                Ok(RpcResult::Done)
            }
            Err(err) => Err(self.on_failure(err, explicit)),
        }
    }

    /// Any failure inside an explicit transaction rolls it back, whatever
    /// the cause, so the caller never holds a half-applied transaction.
    fn on_failure(&mut self, err: QuarryError, explicit: bool) -> QuarryError {
        if let QuarryError::Database(sql_err) = &err {
            if is_corruption(sql_err) {
                let message = sql_err.to_string();
                self.abort_transaction("corruption detected");
                self.enter_safe_mode(&message);
                return QuarryError::corrupted(message);
            }
        }
        if explicit {
            let message = match &err {
                QuarryError::Database(sql_err) => sql_err.to_string(),
                other => format!("{}: {other}", other.code()),
            };
            self.abort_transaction("request failed");
            return QuarryError::TransactionFailed(message);
        }
        err
    }

    fn set_open_tx(&mut self, open: Option<OpenTransaction>) {
        if let Ok(mut slot) = self.shared_tx.lock() {
            *slot = open.as_ref().map(|t| t.id.clone());
        }
        self.open_tx = open;
    }

    /// Roll back and forget the open transaction, if any.
    fn abort_transaction(&mut self, reason: &str) {
        let Some(open) = self.open_tx.take() else {
            return;
        };
        if let Some(conn) = self.conn.as_ref() {
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                tracing::debug!(error = %err, "rollback after failure");
            }
        }
        tracing::warn!(transaction = %open.id, reason, "transaction rolled back");
        self.set_open_tx(None);
    }

    fn expire_transaction(&mut self) {
        tracing::warn!(
            timeout = ?self.settings.transaction_timeout,
            "transaction idle past timeout"
        );
        self.abort_transaction("idle timeout");
    }

    fn ensure_connection(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let opened = open_database(&self.settings.db_path, self.settings.busy_timeout)
            .and_then(|conn| init_schema(&conn).map(|_| conn));
        match opened {
            Ok(conn) => {
                tracing::info!(db = %self.settings.db_path.display(), "database opened");
                self.conn = Some(conn);
                Ok(())
            }
            Err(QuarryError::Database(err)) if is_corruption(&err) => {
                let message = err.to_string();
                self.enter_safe_mode(&message);
                Err(QuarryError::corrupted(message))
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_probe(&mut self) -> Result<()> {
        let fresh = self
            .last_probe_ok
            .is_some_and(|at| at.elapsed() < self.settings.integrity_probe_interval);
        if fresh {
            return Ok(());
        }
        let report = self.probe()?;
        match report.status {
            IntegrityStatus::Corrupt => Err(QuarryError::corrupted(report.detail)),
            IntegrityStatus::Ok | IntegrityStatus::Busy => Ok(()),
        }
    }

    /// Run the integrity probe, entering safe mode when it fails.
    fn probe(&mut self) -> Result<IntegrityReport> {
        if let Err(err) = self.ensure_connection() {
            if err.is_safe_mode() {
                return Ok(IntegrityReport {
                    status: IntegrityStatus::Corrupt,
                    check: "open".to_string(),
                    detail: err.to_string(),
                });
            }
            return Err(err);
        }
        let report = match self.conn.as_ref() {
            Some(conn) => probe_integrity(conn),
            None => return Err(QuarryError::DriverUnavailable("no database connection".into())),
        };
        match report.status {
            IntegrityStatus::Ok => self.last_probe_ok = Some(Instant::now()),
            IntegrityStatus::Corrupt => {
                self.abort_transaction("integrity check failed");
                self.enter_safe_mode(&report.detail);
            }
            IntegrityStatus::Busy => {
                tracing::debug!(detail = %report.detail, "integrity probe busy");
            }
        }
        Ok(report)
    }

    /// Back up (first detection only), write the marker and drop the connection.
    fn enter_safe_mode(&mut self, message: &str) {
        let db_path = self.settings.db_path.clone();
        let backups = if CorruptionMarker::exists(&db_path) {
            Vec::new()
        } else {
            match backup_database_files(&db_path) {
                Ok(paths) => paths,
                Err(err) => {
                    tracing::error!(error = %err, "backup on corruption failed");
                    Vec::new()
                }
            }
        };
        if let Err(err) = CorruptionMarker::record(&db_path, message, &backups) {
            tracing::error!(error = %err, "failed to write corruption marker");
        }
        tracing::error!(db = %db_path.display(), message, "database corrupted, safe mode on");
        self.last_probe_ok = None;
        self.conn = None;
    }

    fn recreate(&mut self) -> Result<Vec<PathBuf>> {
        self.abort_transaction("database recreate");
        let db_path = self.settings.db_path.clone();
        let backups = backup_database_files(&db_path)?;
        self.conn = None;
        self.last_probe_ok = None;

        let rebuilt = remove_database_files(&db_path)
            .and_then(|_| open_database(&db_path, self.settings.busy_timeout))
            .and_then(|conn| init_schema(&conn).map(|_| conn));
        match rebuilt {
            Ok(conn) => {
                tracing::warn!(db = %db_path.display(), backups = backups.len(), "database recreated");
                self.conn = Some(conn);
                self.last_probe_ok = Some(Instant::now());
                Ok(backups)
            }
            Err(err) => Err(QuarryError::repair(
                format!("recreate failed: {err}"),
                backups,
            )),
        }
    }

    fn restore(&mut self, backup_path: PathBuf) -> Result<RestoreResponse> {
        if !backup_path.is_file() {
            return Err(QuarryError::FileNotFound(backup_path));
        }
        if backup_path == self.settings.db_path {
            return Err(QuarryError::InvalidRequest(
                "cannot restore the live database onto itself".to_string(),
            ));
        }
        self.abort_transaction("database restore");
        let db_path = self.settings.db_path.clone();
        let backups = backup_database_files(&db_path)?;
        self.conn = None;
        self.last_probe_ok = None;

        if let Err(err) = restore_database_files(&backup_path, &db_path) {
            return Err(QuarryError::repair(format!("restore failed: {err}"), backups));
        }

        // A restored file that fails to open is reported as corrupt, not as
        // a failed restore; the caller decides based on the integrity status.
        let integrity = match open_database(&db_path, self.settings.busy_timeout) {
            Ok(conn) => {
                let report = probe_integrity(&conn);
                if report.is_ok() {
                    if let Err(err) = init_schema(&conn) {
                        tracing::warn!(error = %err, "schema init after restore failed");
                    }
                    self.last_probe_ok = Some(Instant::now());
                    self.conn = Some(conn);
                }
                report
            }
            Err(err) => IntegrityReport {
                status: IntegrityStatus::Corrupt,
                check: "open".to_string(),
                detail: err.to_string(),
            },
        };
        tracing::warn!(
            backup = %backup_path.display(),
            status = ?integrity.status,
            "database restored"
        );
        Ok(RestoreResponse {
            backup_paths: backups,
            integrity,
        })
    }
}

fn run_request(conn: &Connection, request: RpcRequest) -> Result<Outcome> {
    match request {
        RpcRequest::Execute { sql, params, .. } => {
            Ok(Outcome::Result(RpcResult::Query(execute(conn, &sql, &params)?)))
        }
        RpcRequest::Select {
            table,
            filter,
            columns,
            order_by,
            limit,
            ..
        } => {
            let (sql, params) =
                build_select(&table, &filter, columns.as_deref(), order_by.as_deref(), limit)?;
            Ok(Outcome::Result(RpcResult::Query(execute(conn, &sql, &params)?)))
        }
        RpcRequest::ExecuteBatch {
            ops,
            transaction_id,
        } => {
            let results = if transaction_id.is_some() {
                execute_all(conn, &ops)?
            } else {
                execute_implicit_batch(conn, &ops)?
            };
            Ok(Outcome::Result(RpcResult::Batch { results }))
        }
        RpcRequest::BeginTransaction => {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(Outcome::Begun(TransactionId::generate()))
        }
        RpcRequest::CommitTransaction { .. } => {
            conn.execute_batch("COMMIT")?;
            Ok(Outcome::Ended)
        }
        RpcRequest::RollbackTransaction { .. } => {
            conn.execute_batch("ROLLBACK")?;
            Ok(Outcome::Ended)
        }
    }
}

fn execute_all(conn: &Connection, ops: &[Statement]) -> Result<Vec<QueryOutput>> {
    ops.iter()
        .map(|op| execute(conn, &op.sql, &op.params))
        .collect()
}

/// Run `ops` in one transaction of their own; any failure rolls all of them back.
fn execute_implicit_batch(conn: &Connection, ops: &[Statement]) -> Result<Vec<QueryOutput>> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let mut results = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        match execute(conn, &op.sql, &op.params) {
            Ok(output) => results.push(output),
            Err(err) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback_err, "batch rollback failed");
                }
                return Err(match err {
                    QuarryError::Database(sql_err) if is_corruption(&sql_err) => {
                        QuarryError::Database(sql_err)
                    }
                    other => QuarryError::TransactionFailed(format!("batch op {index}: {other}")),
                });
            }
        }
    }
    if let Err(err) = conn.execute_batch("COMMIT") {
        let _ = conn.execute_batch("ROLLBACK");
        if is_corruption(&err) {
            return Err(err.into());
        }
        return Err(QuarryError::TransactionFailed(format!("batch commit: {err}")));
    }
    Ok(results)
}

fn execute(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let readonly = stmt.readonly();

    let mut rows = Vec::new();
    {
        let mut cursor = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(SqlValue::from_value_ref(row.get_ref(i)?));
            }
            rows.push(values);
        }
    }

    Ok(QueryOutput {
        columns,
        rows,
        rows_affected: if readonly { 0 } else { conn.changes() as usize },
        last_insert_rowid: conn.last_insert_rowid(),
    })
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(name: &str) -> Result<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(QuarryError::InvalidRequest(format!("invalid identifier: {name:?}")))
    }
}

/// Equality-filtered SELECT with validated identifiers.
pub(crate) fn build_select(
    table: &str,
    filter: &BTreeMap<String, SqlValue>,
    columns: Option<&[String]>,
    order_by: Option<&str>,
    limit: Option<u64>,
) -> Result<(String, Vec<SqlValue>)> {
    let table = check_identifier(table)?;
    let projection = match columns {
        Some(cols) if !cols.is_empty() => cols
            .iter()
            .map(|c| check_identifier(c))
            .collect::<Result<Vec<_>>>()?
            .join(", "),
        _ => "*".to_string(),
    };

    let mut sql = format!("SELECT {projection} FROM {table}");
    let mut params = Vec::new();
    let mut clauses = Vec::new();
    for (column, value) in filter {
        let column = check_identifier(column)?;
        if value.is_null() {
            clauses.push(format!("{column} IS NULL"));
        } else {
            params.push(value.clone());
            clauses.push(format!("{column} = ?{}", params.len()));
        }
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if let Some(order_by) = order_by.filter(|o| !o.trim().is_empty()) {
        let mut terms = Vec::new();
        for term in order_by.split(',') {
            let mut parts = term.split_whitespace();
            let column = check_identifier(parts.next().unwrap_or_default())?;
            let direction = match parts.next().map(|d| d.to_ascii_uppercase()) {
                None => "",
                Some(d) if d == "ASC" => " ASC",
                Some(d) if d == "DESC" => " DESC",
                Some(d) => {
                    return Err(QuarryError::InvalidRequest(format!(
                        "invalid order direction: {d}"
                    )))
                }
            };
            if parts.next().is_some() {
                return Err(QuarryError::InvalidRequest(format!("invalid order_by: {order_by}")));
            }
            terms.push(format!("{column}{direction}"));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok((sql, params))
}
