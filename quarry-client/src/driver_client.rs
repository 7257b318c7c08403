//! Blocking HTTP client for quarry-driver

use crate::gate::SafeModeGate;
use quarry_core::config::ClientConfig;
use quarry_core::protocol::{
    BackupResponse, HealthResponse, JobRecord, JobState, JobSubmitRequest, JobSubmitResponse,
    RestoreRequest, RestoreResponse,
};
use quarry_core::{
    ErrorEnvelope, IntegrityReport, QuarryError, QueryOutput, Result, RpcRequest, RpcResponse,
    RpcResult, SqlValue, Statement, TransactionId,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Backoff for failures where the request never reached the driver.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Equality-filtered select, built up and sent with [`DriverClient::select`].
#[derive(Debug, Clone, Default)]
pub struct Select {
    table: String,
    filter: BTreeMap<String, SqlValue>,
    columns: Option<Vec<String>>,
    order_by: Option<String>,
    limit: Option<u64>,
}

impl Select {
    pub fn from(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filter.insert(column.to_string(), value.into());
        self
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, order_by: &str) -> Self {
        self.order_by = Some(order_by.to_string());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn into_request(self, transaction_id: Option<&TransactionId>) -> RpcRequest {
        RpcRequest::Select {
            table: self.table,
            filter: self.filter,
            columns: self.columns,
            order_by: self.order_by,
            limit: self.limit,
            transaction_id: transaction_id.cloned(),
        }
    }
}

pub struct DriverClient {
    base_url: String,
    http: reqwest::blocking::Client,
    retry: RetryPolicy,
    gate: Option<SafeModeGate>,
}

impl DriverClient {
    /// Client with default retries and no request timeout.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_options(base_url, RetryPolicy::default(), None)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::with_options(
            &config.driver_url,
            RetryPolicy::from_config(config),
            config.request_timeout(),
        )
    }

    pub fn with_options(
        base_url: &str,
        retry: RetryPolicy,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| QuarryError::DriverUnavailable(format!("http client setup: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            retry,
            gate: None,
        })
    }

    /// Fail fast on data operations while `gate` reports safe mode.
    pub fn with_gate(mut self, gate: SafeModeGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // Data operations

    pub fn execute(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
        transaction_id: Option<&TransactionId>,
    ) -> Result<QueryOutput> {
        let request = RpcRequest::Execute {
            sql: sql.to_string(),
            params,
            transaction_id: transaction_id.cloned(),
        };
        match self.rpc(request)? {
            RpcResult::Query(output) => Ok(output),
            other => Err(unexpected("execute", &other)),
        }
    }

    pub fn select(&self, select: Select, transaction_id: Option<&TransactionId>) -> Result<QueryOutput> {
        match self.rpc(select.into_request(transaction_id))? {
            RpcResult::Query(output) => Ok(output),
            other => Err(unexpected("select", &other)),
        }
    }

    /// Run `ops` in order. Without a transaction they share one implicit
    /// transaction of their own; results come back in input order.
    pub fn execute_batch(
        &self,
        ops: Vec<Statement>,
        transaction_id: Option<&TransactionId>,
    ) -> Result<Vec<QueryOutput>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let request = RpcRequest::ExecuteBatch {
            ops,
            transaction_id: transaction_id.cloned(),
        };
        match self.rpc(request)? {
            RpcResult::Batch { results } => Ok(results),
            other => Err(unexpected("execute_batch", &other)),
        }
    }

    pub fn begin_transaction(&self) -> Result<TransactionId> {
        match self.rpc(RpcRequest::BeginTransaction)? {
            RpcResult::Transaction { transaction_id } => Ok(transaction_id),
            other => Err(unexpected("begin_transaction", &other)),
        }
    }

    pub fn commit_transaction(&self, transaction_id: &TransactionId) -> Result<()> {
        self.rpc(RpcRequest::CommitTransaction {
            transaction_id: transaction_id.clone(),
        })
        .map(|_| ())
    }

    pub fn rollback_transaction(&self, transaction_id: &TransactionId) -> Result<()> {
        self.rpc(RpcRequest::RollbackTransaction {
            transaction_id: transaction_id.clone(),
        })
        .map(|_| ())
    }

    /// Begin a transaction that rolls back unless committed.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        let id = self.begin_transaction()?;
        Ok(Transaction {
            client: self,
            id,
            finished: false,
        })
    }

    fn rpc(&self, request: RpcRequest) -> Result<RpcResult> {
        if let Some(gate) = &self.gate {
            if !matches!(request, RpcRequest::RollbackTransaction { .. }) {
                gate.check_data_access()?;
            }
        }
        let url = format!("{}/rpc", self.base_url);
        let resp = self.send(|http| http.post(&url).json(&request))?;
        let status = resp.status();
        let body: RpcResponse = resp.json().map_err(|e| QuarryError::Driver {
            code: quarry_core::codes::INTERNAL_ERROR.to_string(),
            message: format!("unreadable rpc response (HTTP {status}): {e}"),
            hint: "Check that the URL points at quarry-driver".to_string(),
        })?;
        match body {
            RpcResponse::Ok { result } => Ok(result),
            RpcResponse::Error { error } => Err(QuarryError::from_envelope(error)),
        }
    }

    // Admin endpoints, allowed in safe mode

    pub fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/health", self.base_url);
        read_json(self.send(|http| http.get(&url))?)
    }

    /// Whether the driver answers at all, without retrying.
    pub fn is_reachable(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .send()
            .is_ok()
    }

    pub fn integrity(&self) -> Result<IntegrityReport> {
        self.post_admin("/admin/integrity", None)
    }

    pub fn backup(&self) -> Result<Vec<PathBuf>> {
        let resp: BackupResponse = self.post_admin("/admin/backup", None)?;
        Ok(resp.backup_paths)
    }

    pub fn recreate(&self) -> Result<Vec<PathBuf>> {
        let resp: BackupResponse = self.post_admin("/admin/recreate", None)?;
        Ok(resp.backup_paths)
    }

    pub fn restore(&self, backup_path: &Path) -> Result<RestoreResponse> {
        let body = serde_json::to_value(RestoreRequest {
            backup_path: backup_path.to_path_buf(),
        })?;
        self.post_admin("/admin/restore", Some(body))
    }

    fn post_admin<T: DeserializeOwned>(&self, path: &str, body: Option<serde_json::Value>) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        read_json(self.send(|http| {
            let req = http.post(&url);
            match &body {
                Some(body) => req.json(body),
                None => req,
            }
        })?)
    }

    // Legacy submit/poll endpoints

    pub(crate) fn submit_job(&self, sql: &str, params: Vec<SqlValue>) -> Result<String> {
        if let Some(gate) = &self.gate {
            gate.check_data_access()?;
        }
        let url = format!("{}/jobs", self.base_url);
        let request = JobSubmitRequest {
            sql: sql.to_string(),
            params,
        };
        let resp: JobSubmitResponse = read_json(self.send(|http| http.post(&url).json(&request))?)?;
        Ok(resp.job_id)
    }

    pub(crate) fn job_status(&self, job_id: &str) -> Result<JobRecord> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        read_json(self.send(|http| http.get(&url))?)
    }

    pub(crate) fn delete_job(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let resp = self.send(|http| http.delete(&url))?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(error_from_response(resp))
    }

    /// Send with retries on connection failures only; those never reached
    /// the driver, so resending cannot apply a write twice.
    fn send(
        &self,
        build: impl Fn(&reqwest::blocking::Client) -> reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response> {
        let mut attempt = 0;
        loop {
            match build(&self.http).send() {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_connect() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "driver unreachable, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(QuarryError::DriverUnavailable(format!(
                        "{} ({})",
                        err,
                        self.base_url
                    )))
                }
            }
        }
    }
}

fn read_json<T: DeserializeOwned>(resp: reqwest::blocking::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp));
    }
    let status = resp.status();
    resp.json().map_err(|e| QuarryError::Driver {
        code: quarry_core::codes::INTERNAL_ERROR.to_string(),
        message: format!("unreadable response (HTTP {status}): {e}"),
        hint: "Unexpected response from driver".to_string(),
    })
}

fn error_from_response(resp: reqwest::blocking::Response) -> QuarryError {
    let status = resp.status();
    match resp.json::<ErrorEnvelope>() {
        Ok(envelope) => QuarryError::from_envelope(envelope),
        Err(_) => QuarryError::Driver {
            code: quarry_core::codes::INTERNAL_ERROR.to_string(),
            message: format!("driver returned HTTP {status}"),
            hint: "Check driver logs for details".to_string(),
        },
    }
}

fn unexpected(op: &str, result: &RpcResult) -> QuarryError {
    QuarryError::Driver {
        code: quarry_core::codes::INTERNAL_ERROR.to_string(),
        message: format!("unexpected {op} result: {result:?}"),
        hint: "Client and driver versions may differ".to_string(),
    }
}

/// An open driver transaction; dropping it uncommitted rolls it back.
pub struct Transaction<'a> {
    client: &'a DriverClient,
    id: TransactionId,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn client(&self) -> &'a DriverClient {
        self.client
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.client.commit_transaction(&self.id)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.client.rollback_transaction(&self.id)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.client.rollback_transaction(&self.id) {
            // A failed statement already rolled the transaction back driver-side.
            tracing::debug!(transaction = %self.id, error = %err, "rollback on drop");
        }
    }
}

/// Submit/poll client for call sites that predate batched RPC.
pub struct JobClient<'a> {
    client: &'a DriverClient,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl<'a> JobClient<'a> {
    pub fn new(client: &'a DriverClient, config: &ClientConfig) -> Self {
        Self {
            client,
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        }
    }

    pub fn with_timing(client: &'a DriverClient, poll_interval: Duration, poll_timeout: Duration) -> Self {
        Self {
            client,
            poll_interval,
            poll_timeout,
        }
    }

    /// Submit one statement, wait for it and delete the job record.
    pub fn run(&self, sql: &str, params: Vec<SqlValue>) -> Result<QueryOutput> {
        let job_id = self.submit_with_backoff(sql, params)?;
        let start = Instant::now();
        loop {
            let record = self.client.job_status(&job_id)?;
            if record.status.is_finished() {
                if let Err(err) = self.client.delete_job(&job_id) {
                    tracing::debug!(job = %job_id, error = %err, "job cleanup failed");
                }
                return match (record.status, record.error) {
                    (JobState::Failed, Some(error)) => Err(QuarryError::from_envelope(error)),
                    (JobState::Failed, None) => Err(QuarryError::Driver {
                        code: quarry_core::codes::INTERNAL_ERROR.to_string(),
                        message: format!("job {job_id} failed"),
                        hint: "Check driver logs for details".to_string(),
                    }),
                    _ => Ok(record.result.unwrap_or_default()),
                };
            }
            if start.elapsed() >= self.poll_timeout {
                return Err(QuarryError::DriverUnavailable(format!(
                    "job {job_id} still {:?} after {:?}",
                    record.status, self.poll_timeout
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn submit_with_backoff(&self, sql: &str, params: Vec<SqlValue>) -> Result<String> {
        let retry = self.client.retry_policy();
        let mut attempt = 0;
        loop {
            match self.client.submit_job(sql, params.clone()) {
                Err(QuarryError::QueueFull(_)) if attempt < retry.max_retries => {
                    let delay = retry.delay(attempt);
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "driver job queue full, backing off");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(700));
        assert_eq!(policy.delay(40), Duration::from_millis(700));
    }

    #[test]
    fn unreachable_driver_is_reported_after_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let client = DriverClient::with_options(&format!("http://{addr}"), policy, None).unwrap();
        let err = client.execute("SELECT 1", vec![], None).unwrap_err();
        assert!(matches!(err, QuarryError::DriverUnavailable(_)));
        assert!(err.is_retryable());
        assert!(!client.is_reachable());
    }

    #[test]
    fn select_builder_fills_request() {
        let tx = TransactionId::from("tx-1");
        let request = Select::from("files")
            .eq("project_id", "p")
            .columns(&["id", "path"])
            .order_by("path")
            .limit(3)
            .into_request(Some(&tx));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["op"], "select");
        assert_eq!(json["filter"]["project_id"], "p");
        assert_eq!(json["columns"], serde_json::json!(["id", "path"]));
        assert_eq!(json["limit"], 3);
        assert_eq!(json["transaction_id"], "tx-1");
    }
}
