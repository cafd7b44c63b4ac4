//! # Async Job Store (C10)
//!
//! A concurrent in-memory index of background inference jobs. No
//! durable backing (out of scope); a TTL sweeper reclaims terminal
//! jobs the caller never polled to completion. The store's single
//! invariant: once a job reaches a terminal status, nothing moves it
//! out of that status again.

use crate::models::InferenceResponse;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

struct AsyncJob {
    tenant_id: String,
    status: JobStatus,
    created_at: Instant,
    updated_at: Instant,
    result: Option<InferenceResponse>,
    error: Option<String>,
    cancellation: CancellationToken,
}

/// An owned, point-in-time view of a job, safe to hold across an
/// await point (unlike a `DashMap` entry guard).
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub tenant_id: String,
    pub status: JobStatus,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub result: Option<InferenceResponse>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct JobStoreConfig {
    pub ttl: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(3600) }
    }
}

pub struct JobStore {
    jobs: DashMap<JobId, AsyncJob>,
    config: JobStoreConfig,
}

impl JobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self { jobs: DashMap::new(), config }
    }

    /// Registers a new job in `Pending` and returns its id plus the
    /// cancellation token the dispatcher's async worker should honor.
    pub fn submit(&self, tenant_id: impl Into<String>) -> (JobId, CancellationToken) {
        let id = Uuid::new_v4();
        let now = Instant::now();
        let cancellation = CancellationToken::new();
        self.jobs.insert(
            id,
            AsyncJob {
                tenant_id: tenant_id.into(),
                status: JobStatus::Pending,
                created_at: now,
                updated_at: now,
                result: None,
                error: None,
                cancellation: cancellation.clone(),
            },
        );
        (id, cancellation)
    }

    pub fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        self.jobs.get(id).map(|job| snapshot(*id, &job))
    }

    /// Transitions `Pending -> Running`. No-op if the job is already
    /// terminal or missing.
    pub fn mark_running(&self, id: &JobId) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Running;
                job.updated_at = Instant::now();
            }
        }
    }

    pub fn complete(&self, id: &JobId, response: InferenceResponse) {
        self.finish(id, JobStatus::Completed, Some(response), None);
    }

    pub fn fail(&self, id: &JobId, message: impl Into<String>) {
        self.finish(id, JobStatus::Failed, None, Some(message.into()));
    }

    /// Attempts to cancel a job. A `Pending` job moves straight to
    /// `Cancelled`. A `Running` job only receives the cancellation
    /// signal; the worker transitions it to `Cancelled` once it
    /// observes the token and unwinds. Returns `false` if the job is
    /// already terminal or unknown.
    pub fn cancel(&self, id: &JobId) -> bool {
        let Some(mut job) = self.jobs.get_mut(id) else { return false };
        if job.status.is_terminal() {
            return false;
        }
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Cancelled;
            job.updated_at = Instant::now();
        }
        job.cancellation.cancel();
        true
    }

    /// Called by the worker once it has unwound after observing
    /// cancellation. No-op if the job already reached a terminal
    /// status through another path.
    pub fn mark_cancelled(&self, id: &JobId) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Cancelled;
                job.updated_at = Instant::now();
            }
        }
    }

    pub fn list_by_tenant(&self, tenant_id: &str) -> Vec<JobSnapshot> {
        self.jobs.iter().filter(|e| e.tenant_id == tenant_id).map(|e| snapshot(*e.key(), &e)).collect()
    }

    /// Evicts terminal jobs older than the configured TTL.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.jobs.retain(|_, job| !(job.status.is_terminal() && now.duration_since(job.updated_at) >= self.config.ttl));
    }

    fn finish(&self, id: &JobId, status: JobStatus, result: Option<InferenceResponse>, error: Option<String>) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.result = result;
            job.error = error;
            job.updated_at = Instant::now();
        }
    }
}

fn snapshot(id: JobId, job: &AsyncJob) -> JobSnapshot {
    JobSnapshot {
        id,
        tenant_id: job.tenant_id.clone(),
        status: job.status,
        created_at: job.created_at,
        updated_at: job.updated_at,
        result: job.result.clone(),
        error: job.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FinishReason, Usage};
    use chrono::Utc;

    fn response(id: Uuid) -> InferenceResponse {
        InferenceResponse {
            request_id: id,
            content: "hi".into(),
            model: "m1".into(),
            usage: Usage::default(),
            duration_ms: 1,
            timestamp: Utc::now(),
            finish_reason: FinishReason::Stop,
            tool_calls: vec![],
            metadata: Default::default(),
        }
    }

    #[test]
    fn submitted_job_starts_pending() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id, _) = store.submit("t1");
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn completes_after_running() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id, _) = store.submit("t1");
        store.mark_running(&id);
        store.complete(&id, response(id));
        let snapshot = store.get(&id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert!(snapshot.result.is_some());
    }

    #[test]
    fn terminal_status_never_changes_again() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id, _) = store.submit("t1");
        store.fail(&id, "boom");
        store.complete(&id, response(id));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn cancel_pending_transitions_immediately() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id, token) = store.submit("t1");
        assert!(store.cancel(&id));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Cancelled);
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_running_only_signals_token_until_worker_confirms() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id, token) = store.submit("t1");
        store.mark_running(&id);
        assert!(store.cancel(&id));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Running);
        assert!(token.is_cancelled());

        store.mark_cancelled(&id);
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn cancel_of_terminal_job_is_a_no_op() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id, _) = store.submit("t1");
        store.complete(&id, response(id));
        assert!(!store.cancel(&id));
        assert_eq!(store.get(&id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn list_by_tenant_filters() {
        let store = JobStore::new(JobStoreConfig::default());
        let (id1, _) = store.submit("t1");
        let (_id2, _) = store.submit("t2");
        let jobs = store.list_by_tenant("t1");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id1);
    }

    #[test]
    fn sweep_evicts_only_expired_terminal_jobs() {
        let store = JobStore::new(JobStoreConfig { ttl: Duration::from_millis(0) });
        let (id, _) = store.submit("t1");
        store.complete(&id, response(id));
        store.sweep_expired();
        assert!(store.get(&id).is_none());
    }
}
