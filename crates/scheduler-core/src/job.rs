//! The scheduled-job data model and CRUD over it.
//!
//! [`JobTable`] is the only component that knows how a [`ScheduledJob`]
//! maps onto KV attributes; everything else in this crate (the worker,
//! the scheduler loop, the dedup index) works with typed `ScheduledJob`
//! values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KvError;
use crate::key_codec::{decode_sk, due_upper_bound, encode_sk};
use crate::kv::{AttributeValue, Condition, Item, ItemKey, KvStore, QuerySpec, SkBound, UpdateExpr};

/// Partition key shared by every job record.
pub const JOB_PK: &str = "job";

/// Lifecycle status of a [`ScheduledJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "in_progress" => JobStatus::InProgress,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "dead_letter" => JobStatus::DeadLetter,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// A brand-new `pending` job with zero attempts, for a caller about
    /// to enqueue it.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            scheduled_for,
            status: JobStatus::Pending,
            locked_by: None,
            lock_expires_at: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn sk(&self) -> String {
        encode_sk(self.scheduled_for, self.job_id)
    }
}

/// CRUD and due-jobs query over the `PK = "job"` keyspace.
#[derive(Clone)]
pub struct JobTable<S> {
    store: S,
}

impl<S: KvStore> JobTable<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Write all persisted fields of `job`, omitting optional fields
    /// that are empty. Unconditional by design — callers that need a
    /// conditioned transition use [`JobTable::update_job_status`] or, for
    /// claiming, the worker's own conditional update.
    pub async fn put_job(&self, job: &ScheduledJob) -> Result<(), KvError> {
        let mut item = Item::new();
        item.insert("PK".into(), AttributeValue::S(JOB_PK.into()));
        item.insert("SK".into(), AttributeValue::S(job.sk()));
        item.insert("job_id".into(), AttributeValue::S(job.job_id.to_string()));
        item.insert("job_type".into(), AttributeValue::S(job.job_type.clone()));
        item.insert("payload".into(), AttributeValue::Json(job.payload.clone()));
        item.insert(
            "scheduled_for".into(),
            AttributeValue::Ts(job.scheduled_for),
        );
        item.insert(
            "status".into(),
            AttributeValue::S(job.status.as_str().into()),
        );
        item.insert("attempts".into(), AttributeValue::N(job.attempts as i64));
        item.insert("created_at".into(), AttributeValue::Ts(job.created_at));

        if let Some(locked_by) = &job.locked_by {
            item.insert("locked_by".into(), AttributeValue::S(locked_by.clone()));
        }
        if let Some(lock_expires_at) = job.lock_expires_at {
            item.insert("lock_expires_at".into(), AttributeValue::Ts(lock_expires_at));
        }
        if let Some(last_error) = &job.last_error {
            item.insert("last_error".into(), AttributeValue::S(last_error.clone()));
        }
        if let Some(completed_at) = job.completed_at {
            item.insert("completed_at".into(), AttributeValue::Ts(completed_at));
        }

        self.store.put(item, None).await
    }

    pub async fn get_job(
        &self,
        job_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>, KvError> {
        let sk = encode_sk(scheduled_for, job_id);
        let item = self.store.get(ItemKey::new(JOB_PK, sk)).await?;
        item.map(|i| item_to_job(&i)).transpose()
    }

    /// Jobs due at or before `now`, ascending by due time then id,
    /// limited to `limit` pending rows.
    pub async fn get_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, KvError> {
        let items = self
            .store
            .query(QuerySpec {
                pk: JOB_PK.into(),
                sk_bound: Some(SkBound::LessOrEqual(due_upper_bound(now))),
                filter: Some((
                    "status".into(),
                    AttributeValue::S(JobStatus::Pending.as_str().into()),
                )),
                limit: Some(limit),
            })
            .await?;

        items.iter().map(item_to_job).collect()
    }

    /// `SET` update over the named attributes. Does not by itself
    /// enforce optimistic concurrency — callers that must condition a
    /// transition on prior state pass `condition` via the lower-level
    /// store directly (see [`crate::worker::Worker::try_claim`]).
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        scheduled_for: DateTime<Utc>,
        status: JobStatus,
        extras: UpdateExpr,
    ) -> Result<(), KvError> {
        let sk = encode_sk(scheduled_for, job_id);
        let mut update = extras;
        update.insert("status".into(), Some(AttributeValue::S(status.as_str().into())));
        self.store
            .update(ItemKey::new(JOB_PK, sk), update, None)
            .await
    }

    /// Delete terminal jobs (`completed`, `failed`, `dead_letter`,
    /// `cancelled`) older than `older_than_days`. Never touches
    /// `pending` or `in_progress` rows regardless of age. Returns the
    /// number deleted; a per-item delete failure is logged and does not
    /// abort the sweep.
    pub async fn cleanup_old_jobs(
        &self,
        now: DateTime<Utc>,
        older_than_days: i64,
    ) -> Result<usize, KvError> {
        let cutoff = now - chrono::Duration::days(older_than_days);
        let items = self
            .store
            .query(QuerySpec {
                pk: JOB_PK.into(),
                sk_bound: Some(SkBound::LessThan(format!(
                    "scheduled#{}#",
                    crate::key_codec::format_iso8601(cutoff)
                ))),
                filter: None,
                limit: None,
            })
            .await?;

        let terminal = [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::DeadLetter,
            JobStatus::Cancelled,
        ];

        let mut deleted = 0usize;
        for item in items {
            let Some(status) = item
                .get("status")
                .and_then(AttributeValue::as_str)
                .and_then(JobStatus::parse)
            else {
                continue;
            };
            if !terminal.contains(&status) {
                continue;
            }
            let Some(sk) = item.get("SK").and_then(AttributeValue::as_str) else {
                continue;
            };
            match self
                .store
                .delete(ItemKey::new(JOB_PK, sk.to_string()), None)
                .await
            {
                Ok(()) => deleted += 1,
                Err(err) => {
                    tracing::warn!(sk, error = %err, "cleanup: failed to delete job row");
                }
            }
        }

        Ok(deleted)
    }
}

fn item_to_job(item: &Item) -> Result<ScheduledJob, KvError> {
    let sk = item
        .get("SK")
        .and_then(AttributeValue::as_str)
        .ok_or_else(|| KvError::InvalidKey("missing SK".into()))?;
    let (sk_scheduled_for, job_id) = decode_sk(sk)?;
    // `scheduled_for` is read from its own attribute, not decoded from
    // the SK: `put_job` stores it at full precision, while the SK's
    // ISO8601 rendering is truncated to microseconds for sort-order
    // purposes, so decoding the SK alone would lose sub-microsecond
    // precision on every round trip.
    let scheduled_for = item
        .get("scheduled_for")
        .and_then(AttributeValue::as_timestamp)
        .unwrap_or(sk_scheduled_for);

    let status = item
        .get("status")
        .and_then(AttributeValue::as_str)
        .and_then(JobStatus::parse)
        .ok_or_else(|| KvError::InvalidKey(format!("missing/invalid status on {sk}")))?;

    Ok(ScheduledJob {
        job_id,
        job_type: item
            .get("job_type")
            .and_then(AttributeValue::as_str)
            .unwrap_or_default()
            .to_string(),
        payload: item
            .get("payload")
            .and_then(AttributeValue::as_json)
            .cloned()
            .unwrap_or(serde_json::Value::Null),
        scheduled_for,
        status,
        locked_by: item
            .get("locked_by")
            .and_then(AttributeValue::as_str)
            .map(str::to_string),
        lock_expires_at: item.get("lock_expires_at").and_then(AttributeValue::as_timestamp),
        attempts: item
            .get("attempts")
            .and_then(AttributeValue::as_i64)
            .unwrap_or(0) as u32,
        last_error: item
            .get("last_error")
            .and_then(AttributeValue::as_str)
            .map(str::to_string),
        created_at: item
            .get("created_at")
            .and_then(AttributeValue::as_timestamp)
            .unwrap_or_else(Utc::now),
        completed_at: item.get("completed_at").and_then(AttributeValue::as_timestamp),
    })
}
