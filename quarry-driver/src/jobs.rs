//! Legacy submit/poll protocol on top of the executor.
//!
//! Kept for callers that predate batched RPC. The table is bounded by
//! `max_pending_jobs` unfinished jobs and finished jobs expire after
//! `job_retention`.

use crate::executor::ExecutorHandle;
use quarry_core::protocol::{JobRecord, JobState};
use quarry_core::{QuarryError, Result, RpcRequest, RpcResult, SqlValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct JobEntry {
    record: JobRecord,
    finished_at: Option<Instant>,
}

#[derive(Clone)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<String, JobEntry>>>,
    max_pending: usize,
    retention: Duration,
}

impl JobTable {
    pub fn new(max_pending: usize, retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_pending,
            retention,
        }
    }

    /// Register a job and run it in the background.
    pub fn submit(&self, executor: &ExecutorHandle, sql: String, params: Vec<SqlValue>) -> Result<String> {
        let job_id = uuid::Uuid::new_v4().to_string();
        {
            let mut jobs = self.lock()?;
            self.evict_expired(&mut jobs);
            let pending = jobs
                .values()
                .filter(|e| !e.record.status.is_finished())
                .count();
            if pending >= self.max_pending {
                tracing::warn!(pending, "job queue full");
                return Err(QuarryError::QueueFull(pending));
            }
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    record: JobRecord {
                        job_id: job_id.clone(),
                        status: JobState::Pending,
                        result: None,
                        error: None,
                    },
                    finished_at: None,
                },
            );
        }

        let table = self.clone();
        let executor = executor.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            table.update(&id, |entry| entry.record.status = JobState::Running);
            let request = RpcRequest::Execute {
                sql,
                params,
                transaction_id: None,
            };
            let outcome = executor.rpc(request).await;
            table.update(&id, |entry| {
                match outcome {
                    Ok(RpcResult::Query(output)) => {
                        entry.record.status = JobState::Done;
                        entry.record.result = Some(output);
                    }
                    Ok(_) => entry.record.status = JobState::Done,
                    Err(err) => {
                        entry.record.status = JobState::Failed;
                        entry.record.error = Some(err.to_envelope());
                    }
                }
                entry.finished_at = Some(Instant::now());
            });
        });

        Ok(job_id)
    }

    pub fn get(&self, job_id: &str) -> Result<JobRecord> {
        let mut jobs = self.lock()?;
        self.evict_expired(&mut jobs);
        jobs.get(job_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| QuarryError::JobNotFound(job_id.to_string()))
    }

    pub fn remove(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.lock()?;
        jobs.remove(job_id)
            .map(|_| ())
            .ok_or_else(|| QuarryError::JobNotFound(job_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut JobEntry)) {
        if let Ok(mut jobs) = self.inner.lock() {
            if let Some(entry) = jobs.get_mut(job_id) {
                apply(entry);
            }
        }
    }

    fn evict_expired(&self, jobs: &mut HashMap<String, JobEntry>) {
        let retention = self.retention;
        jobs.retain(|_, e| e.finished_at.map_or(true, |at| at.elapsed() < retention));
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, JobEntry>>> {
        self.inner
            .lock()
            .map_err(|e| QuarryError::Io(std::io::Error::other(format!("job table poisoned: {e}"))))
    }
}
