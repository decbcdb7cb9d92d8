//! Worker poll/claim/dispatch loop.
//!
//! Claiming a job is a conditional update, not the unconditional write
//! the original implementation used — see spec note in the crate root
//! doc. Two workers racing to claim the same row after reading it in
//! the same poll can both see it as eligible, but only one of their
//! conditional claims succeeds; the other sees [`KvError::ConditionFailed`]
//! and silently skips the job rather than double-processing it.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::collab::ObservabilitySink;
use crate::error::{DispatchError, KvError};
use crate::handler::Dispatcher;
use crate::job::{JobStatus, JobTable, ScheduledJob, JOB_PK};
use crate::key_codec::encode_sk;
use crate::kv::{AttributeValue, Condition, ItemKey, KvStore, UpdateExpr};
use crate::retry::RetryPolicy;

/// Outcome of processing one claimed job, used only for tracing/tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    RetryScheduled,
    DeadLettered,
}

pub struct Worker<S> {
    job_table: JobTable<S>,
    store: S,
    worker_id: String,
    polling_limit: usize,
    lock_timeout: Duration,
    dispatcher: Dispatcher,
    retry_policy: RetryPolicy,
    sink: Option<std::sync::Arc<dyn ObservabilitySink>>,
}

pub struct WorkerConfig {
    pub worker_id: Option<String>,
    pub polling_limit: usize,
    pub lock_timeout_minutes: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            polling_limit: 25,
            lock_timeout_minutes: 10,
        }
    }
}

impl<S: KvStore + Clone> Worker<S> {
    pub fn new(
        store: S,
        dispatcher: Dispatcher,
        retry_policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
        Self {
            job_table: JobTable::new(store.clone()),
            store,
            worker_id,
            polling_limit: config.polling_limit,
            lock_timeout: Duration::minutes(config.lock_timeout_minutes),
            dispatcher,
            retry_policy,
            sink: None,
        }
    }

    pub fn with_observability(mut self, sink: std::sync::Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Fetch due jobs, claim each that is still eligible, dispatch it,
    /// and record the terminal transition. Returns the number of jobs
    /// that reached a terminal transition (completed, retry-scheduled,
    /// or dead-lettered) in this call.
    pub async fn poll_and_process_jobs(&self, now: DateTime<Utc>) -> Result<usize, KvError> {
        let due = self.job_table.get_due_jobs(now, self.polling_limit).await?;

        let mut processed = 0usize;
        for job in due {
            if !is_eligible(&job, now) {
                continue;
            }
            if self.try_claim(&job, now).await? {
                self.process_claimed(job, now).await;
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Conditional claim: requires the row to still be `pending` with
    /// no lock, or a lock that has already expired. A failed condition
    /// is not an error — it means another worker got there first.
    async fn try_claim(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<bool, KvError> {
        let sk = encode_sk(job.scheduled_for, job.job_id);
        let lock_expires_at = now + self.lock_timeout;

        let mut update = UpdateExpr::new();
        update.insert(
            "status".into(),
            Some(AttributeValue::S(JobStatus::InProgress.as_str().into())),
        );
        update.insert(
            "locked_by".into(),
            Some(AttributeValue::S(self.worker_id.clone())),
        );
        update.insert(
            "lock_expires_at".into(),
            Some(AttributeValue::Ts(lock_expires_at)),
        );

        let condition = Condition::Eq(
            "status".into(),
            AttributeValue::S(JobStatus::Pending.as_str().into()),
        )
        .and(
            Condition::AttributeNotExists("lock_expires_at".into())
                .or(Condition::Le("lock_expires_at".into(), AttributeValue::Ts(now))),
        );

        match self
            .store
            .update(ItemKey::new(JOB_PK, sk), update, Some(condition))
            .await
        {
            Ok(()) => Ok(true),
            Err(KvError::ConditionFailed) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn process_claimed(&self, job: ScheduledJob, now: DateTime<Utc>) -> Outcome {
        match self.dispatcher.dispatch(&job).await {
            Ok(()) => {
                let mut extras = UpdateExpr::new();
                extras.insert("completed_at".into(), Some(AttributeValue::Ts(now)));
                extras.insert("locked_by".into(), None);
                extras.insert("lock_expires_at".into(), None);
                if let Err(err) = self
                    .job_table
                    .update_job_status(job.job_id, job.scheduled_for, JobStatus::Completed, extras)
                    .await
                {
                    tracing::error!(job_id = %job.job_id, error = %err, "failed to persist completion");
                }
                Outcome::Completed
            }
            Err(err) => self.handle_failure(job, now, err).await,
        }
    }

    async fn handle_failure(
        &self,
        job: ScheduledJob,
        now: DateTime<Utc>,
        err: DispatchError,
    ) -> Outcome {
        let attempts = job.attempts + 1;
        let message = err.to_string();

        self.report_failure(&job, attempts, &message);

        let mut extras = UpdateExpr::new();
        extras.insert("attempts".into(), Some(AttributeValue::N(attempts as i64)));
        extras.insert("last_error".into(), Some(AttributeValue::S(message.clone())));
        extras.insert("locked_by".into(), None);
        extras.insert("lock_expires_at".into(), None);

        let outcome = if self.retry_policy.should_retry(attempts) {
            if let Err(err) = self
                .job_table
                .update_job_status(job.job_id, job.scheduled_for, JobStatus::Failed, extras)
                .await
            {
                tracing::error!(job_id = %job.job_id, error = %err, "failed to persist failed status");
            }

            let next_run = self.retry_policy.next_run(now, attempts);
            let mut retry_job = ScheduledJob::new(job.job_type.clone(), job.payload.clone(), next_run, job.created_at);
            retry_job.job_id = job.job_id;
            retry_job.attempts = attempts;
            retry_job.last_error = Some(message);

            if let Err(err) = self.job_table.put_job(&retry_job).await {
                tracing::error!(job_id = %job.job_id, error = %err, "failed to persist retry row");
            }
            Outcome::RetryScheduled
        } else {
            if let Err(err) = self
                .job_table
                .update_job_status(job.job_id, job.scheduled_for, JobStatus::DeadLetter, extras)
                .await
            {
                tracing::error!(job_id = %job.job_id, error = %err, "failed to persist dead letter status");
            }
            Outcome::DeadLettered
        };

        outcome
    }

    fn report_failure(&self, job: &ScheduledJob, attempts: u32, message: &str) {
        if let Some(sink) = &self.sink {
            let mut ctx = std::collections::HashMap::new();
            ctx.insert("job_id".into(), job.job_id.to_string());
            ctx.insert("job_type".into(), job.job_type.clone());
            ctx.insert("attempts".into(), attempts.to_string());
            ctx.insert("scheduled_for".into(), job.scheduled_for.to_rfc3339());
            sink.set_context("job", &ctx);
            sink.capture_exception(message);
        }
        tracing::warn!(job_id = %job.job_id, job_type = %job.job_type, attempts, error = message, "job failed");
    }
}

fn is_eligible(job: &ScheduledJob, now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Pending
        && !job.lock_expires_at.is_some_and(|expires| expires > now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerRegistry, JobHandler};
    use crate::mem_kv::MemoryKv;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Deserialize)]
    struct Empty {}

    struct Succeeds;
    #[async_trait]
    impl JobHandler for Succeeds {
        type Payload = Empty;
        async fn handle(&self, _payload: Empty) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysFails(Arc<AtomicUsize>);
    #[async_trait]
    impl JobHandler for AlwaysFails {
        type Payload = Empty;
        async fn handle(&self, _payload: Empty) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err("handler exploded".into())
        }
    }

    fn worker_with(registry: HandlerRegistry, store: MemoryKv, retry: RetryPolicy) -> Worker<MemoryKv> {
        Worker::new(
            store,
            Dispatcher::new(registry),
            retry,
            WorkerConfig {
                worker_id: Some("worker-test".into()),
                polling_limit: 25,
                lock_timeout_minutes: 10,
            },
        )
    }

    #[tokio::test]
    async fn successful_lifecycle_marks_job_completed() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let registry = HandlerRegistry::new();
        registry.register("ok", Succeeds);
        let worker = worker_with(registry, store, RetryPolicy::default());

        let now = Utc::now();
        let job = ScheduledJob::new("ok", serde_json::json!({}), now - Duration::seconds(60), now);
        table.put_job(&job).await.unwrap();

        let processed = worker.poll_and_process_jobs(now).await.unwrap();
        assert_eq!(processed, 1);

        let stored = table.get_job(job.job_id, job.scheduled_for).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.completed_at.unwrap(), now);
        assert!(stored.locked_by.is_none());
    }

    #[tokio::test]
    async fn second_poll_with_no_new_jobs_is_a_no_op() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let registry = HandlerRegistry::new();
        registry.register("ok", Succeeds);
        let worker = worker_with(registry, store, RetryPolicy::default());

        let now = Utc::now();
        let job = ScheduledJob::new("ok", serde_json::json!({}), now - Duration::seconds(60), now);
        table.put_job(&job).await.unwrap();

        assert_eq!(worker.poll_and_process_jobs(now).await.unwrap(), 1);
        assert_eq!(worker.poll_and_process_jobs(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exponential_backoff_creates_retry_rows_then_dead_letters() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("boom", AlwaysFails(calls.clone()));
        let retry = RetryPolicy::new(1, 3);
        let worker = worker_with(registry, store, retry);

        let mut now = Utc::now();
        let job = ScheduledJob::new("boom", serde_json::json!({}), now, now);
        table.put_job(&job).await.unwrap();

        // First failure: original row -> failed (attempts=1), new pending row +1s.
        assert_eq!(worker.poll_and_process_jobs(now).await.unwrap(), 1);
        let original = table.get_job(job.job_id, job.scheduled_for).await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Failed);
        assert_eq!(original.attempts, 1);

        let retry_time_1 = now + Duration::seconds(1);
        let retried = table.get_job(job.job_id, retry_time_1).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);

        // Second failure: attempts=2, next retry +2s.
        now = retry_time_1;
        assert_eq!(worker.poll_and_process_jobs(now).await.unwrap(), 1);
        let retry_time_2 = now + Duration::seconds(2);
        let retried2 = table.get_job(job.job_id, retry_time_2).await.unwrap().unwrap();
        assert_eq!(retried2.status, JobStatus::Pending);
        assert_eq!(retried2.attempts, 2);

        // Third failure: attempts=3 == max_attempts -> dead letter, no new row.
        now = retry_time_2;
        assert_eq!(worker.poll_and_process_jobs(now).await.unwrap(), 1);
        let final_row = table.get_job(job.job_id, retry_time_2).await.unwrap().unwrap();
        assert_eq!(final_row.status, JobStatus::DeadLetter);
        assert_eq!(final_row.attempts, 3);

        let retry_time_3 = now + Duration::seconds(4);
        assert!(table.get_job(job.job_id, retry_time_3).await.unwrap().is_none());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_by_a_different_worker() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());

        let now = Utc::now();
        let mut job = ScheduledJob::new("ok", serde_json::json!({}), now - Duration::seconds(60), now);
        job.status = JobStatus::InProgress;
        job.locked_by = Some("worker-A".into());
        job.lock_expires_at = Some(now - Duration::seconds(1));
        table.put_job(&job).await.unwrap();

        let registry = HandlerRegistry::new();
        registry.register("ok", Succeeds);
        let worker_b = Worker::new(
            store,
            Dispatcher::new(registry),
            RetryPolicy::default(),
            WorkerConfig {
                worker_id: Some("worker-B".into()),
                ..WorkerConfig::default()
            },
        );

        let processed = worker_b.poll_and_process_jobs(now).await.unwrap();
        assert_eq!(processed, 1);

        let stored = table.get_job(job.job_id, job.scheduled_for).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn a_lock_expiring_exactly_at_now_is_reclaimable() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());

        let now = Utc::now();
        let mut job = ScheduledJob::new("ok", serde_json::json!({}), now - Duration::seconds(60), now);
        job.status = JobStatus::InProgress;
        job.locked_by = Some("worker-A".into());
        job.lock_expires_at = Some(now);
        table.put_job(&job).await.unwrap();

        let registry = HandlerRegistry::new();
        registry.register("ok", Succeeds);
        let worker = worker_with(registry, store, RetryPolicy::default());

        assert_eq!(worker.poll_and_process_jobs(now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn two_workers_racing_to_claim_the_same_job_only_one_wins() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let now = Utc::now();
        let job = ScheduledJob::new("ok", serde_json::json!({}), now - Duration::seconds(1), now);
        table.put_job(&job).await.unwrap();

        let registry_a = HandlerRegistry::new();
        registry_a.register("ok", Succeeds);
        let worker_a = Worker::new(
            store.clone(),
            Dispatcher::new(registry_a),
            RetryPolicy::default(),
            WorkerConfig { worker_id: Some("A".into()), ..WorkerConfig::default() },
        );
        let registry_b = HandlerRegistry::new();
        registry_b.register("ok", Succeeds);
        let worker_b = Worker::new(
            store,
            Dispatcher::new(registry_b),
            RetryPolicy::default(),
            WorkerConfig { worker_id: Some("B".into()), ..WorkerConfig::default() },
        );

        let claimed_by_a = worker_a.try_claim(&job, now).await.unwrap();
        let claimed_by_b = worker_b.try_claim(&job, now).await.unwrap();
        assert!(claimed_by_a);
        assert!(!claimed_by_b);
    }
}
