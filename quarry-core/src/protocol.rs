//! Wire protocol shared by quarry-driver and quarry-client.
//!
//! Every data operation is one `POST /rpc` carrying an [`RpcRequest`] tagged
//! by `op`, answered by an [`RpcResponse`] tagged by `status`.

use crate::error::ErrorEnvelope;
use crate::safety::IntegrityReport;
use base64::Engine;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Opaque handle for an open driver-side transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("tx-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bound SQL parameter or a returned column value.
///
/// Blobs travel as `{"blob": "<base64>"}`; everything else maps onto the
/// natural JSON type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob {
        #[serde(with = "blob_base64")]
        blob: Vec<u8>,
    },
}

mod blob_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob { blob } => Some(blob),
            _ => None,
        }
    }

    pub fn from_value_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Real(v),
            ValueRef::Text(v) => Self::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Self::Blob { blob: v.to_vec() },
        }
    }

    /// Short human-readable rendering for logs and CLI tables
    pub fn display(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Integer(v) => v.to_string(),
            Self::Real(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Blob { blob } => format!(
                "<{} bytes {}>",
                blob.len(),
                base64::engine::general_purpose::STANDARD.encode(&blob[..blob.len().min(6)])
            ),
        }
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Self::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Blob { blob } => ToSqlOutput::Borrowed(ValueRef::Blob(blob)),
        })
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<usize> for SqlValue {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob { blob: value }
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Build a parameter list from heterogeneous values
#[macro_export]
macro_rules! sql_params {
    () => { Vec::<$crate::protocol::SqlValue>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::protocol::SqlValue::from($value)),+]
    };
}

/// One SQL statement with its positional parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A data operation sent to the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    Execute {
        sql: String,
        #[serde(default)]
        params: Vec<SqlValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<TransactionId>,
    },
    Select {
        table: String,
        #[serde(default)]
        filter: BTreeMap<String, SqlValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<TransactionId>,
    },
    ExecuteBatch {
        ops: Vec<Statement>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<TransactionId>,
    },
    BeginTransaction,
    CommitTransaction {
        transaction_id: TransactionId,
    },
    RollbackTransaction {
        transaction_id: TransactionId,
    },
}

impl RpcRequest {
    /// Transaction this request belongs to, if any
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            Self::Execute { transaction_id, .. }
            | Self::Select { transaction_id, .. }
            | Self::ExecuteBatch { transaction_id, .. } => transaction_id.as_ref(),
            Self::CommitTransaction { transaction_id }
            | Self::RollbackTransaction { transaction_id } => Some(transaction_id),
            Self::BeginTransaction => None,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::Select { .. } => "select",
            Self::ExecuteBatch { .. } => "execute_batch",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction { .. } => "commit_transaction",
            Self::RollbackTransaction { .. } => "rollback_transaction",
        }
    }
}

/// Rows plus write metadata for one executed statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<SqlValue>>,
    #[serde(default)]
    pub rows_affected: usize,
    #[serde(default)]
    pub last_insert_rowid: i64,
}

impl QueryOutput {
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn first(&self) -> Option<Row<'_>> {
        self.rows().next()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row as an integer (`SELECT COUNT(*) ...`)
    pub fn scalar_i64(&self) -> Option<i64> {
        self.rows.first()?.first()?.as_i64()
    }
}

/// Borrowed view over one result row with by-name column access
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [SqlValue],
}

static NULL: SqlValue = SqlValue::Null;

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> &'a SqlValue {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .unwrap_or(&NULL)
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        self.get(column).as_i64()
    }

    pub fn f64(&self, column: &str) -> Option<f64> {
        self.get(column).as_f64()
    }

    pub fn str(&self, column: &str) -> Option<&'a str> {
        self.get(column).as_str()
    }

    pub fn string(&self, column: &str) -> Option<String> {
        self.str(column).map(String::from)
    }

    pub fn bool(&self, column: &str) -> bool {
        self.i64(column).unwrap_or(0) != 0
    }

    pub fn blob(&self, column: &str) -> Option<&'a [u8]> {
        self.get(column).as_blob()
    }
}

/// Successful RPC payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcResult {
    Query(QueryOutput),
    Batch { results: Vec<QueryOutput> },
    Transaction { transaction_id: TransactionId },
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResponse {
    Ok { result: RpcResult },
    Error { error: ErrorEnvelope },
}

// Admin endpoints

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub db_path: PathBuf,
    pub safe_mode: bool,
    pub queue_depth: usize,
    pub open_transaction: Option<TransactionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResponse {
    pub backup_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub backup_paths: Vec<PathBuf>,
    pub integrity: IntegrityReport,
}

// Legacy submit/poll protocol

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_values_use_natural_json() {
        let params = sql_params![1i64, 2.5, "x", Option::<i64>::None, vec![1u8, 2, 3]];
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"[1,2.5,"x",null,{"blob":"AQID"}]"#);

        let back: Vec<SqlValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn request_is_tagged_by_op() {
        let req = RpcRequest::ExecuteBatch {
            ops: vec![Statement::new("DELETE FROM t", vec![])],
            transaction_id: Some(TransactionId::from("tx-1")),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["op"], "execute_batch");
        assert_eq!(v["transaction_id"], "tx-1");

        let begin: RpcRequest = serde_json::from_str(r#"{"op":"begin_transaction"}"#).unwrap();
        assert!(matches!(begin, RpcRequest::BeginTransaction));
        assert!(begin.transaction_id().is_none());
    }

    #[test]
    fn response_status_tags() {
        let ok = RpcResponse::Ok {
            result: RpcResult::Transaction {
                transaction_id: TransactionId::from("tx-9"),
            },
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["result"]["kind"], "transaction");

        let err: RpcResponse = serde_json::from_str(
            r#"{"status":"error","error":{"code":"database_corrupted","message":"m","hint":"h"}}"#,
        )
        .unwrap();
        assert!(matches!(err, RpcResponse::Error { .. }));
    }

    #[test]
    fn row_access_by_name() {
        let out = QueryOutput {
            columns: vec!["id".into(), "name".into(), "mtime".into()],
            rows: vec![vec![7.into(), "a.py".into(), 1.5.into()]],
            rows_affected: 0,
            last_insert_rowid: 0,
        };
        let row = out.first().unwrap();
        assert_eq!(row.i64("id"), Some(7));
        assert_eq!(row.str("name"), Some("a.py"));
        assert_eq!(row.f64("mtime"), Some(1.5));
        assert!(row.get("missing").is_null());
        assert_eq!(out.scalar_i64(), Some(7));
    }
}
