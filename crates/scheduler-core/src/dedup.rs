//! Deduplication index: reserves a `(logical_id, bucket)` slot before a
//! job record is inserted, guaranteeing at-most-one live logical
//! occurrence per bucket.
//!
//! Order matters in [`DeduplicationIndex::schedule_if_needed`]: reserve
//! first, then insert the job. A lost race then leaves no orphan job
//! row behind.

use crate::error::KvError;
use crate::job::{JobTable, ScheduledJob};
use crate::kv::{AttributeValue, Condition, Item, ItemKey, KvStore};

fn reservation_pk(logical_id: &str) -> String {
    format!("scheduled-job#{logical_id}")
}

/// A `(logical_id, bucket)` lock over logical-occurrence scheduling.
#[derive(Clone)]
pub struct DeduplicationIndex<S> {
    store: S,
}

impl<S: KvStore> DeduplicationIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Conditionally put a reservation row. Returns `true` on success,
    /// `false` if a reservation for this `(logical_id, bucket)` already
    /// exists. Any other store error propagates.
    pub async fn try_reserve(
        &self,
        logical_id: &str,
        bucket: &str,
        job_pk: &str,
        job_sk: &str,
    ) -> Result<bool, KvError> {
        let mut item = Item::new();
        item.insert("PK".into(), AttributeValue::S(reservation_pk(logical_id)));
        item.insert("SK".into(), AttributeValue::S(bucket.to_string()));
        item.insert("job_pk".into(), AttributeValue::S(job_pk.to_string()));
        item.insert("job_sk".into(), AttributeValue::S(job_sk.to_string()));

        match self
            .store
            .put(item, Some(Condition::AttributeNotExists("PK".into())))
            .await
        {
            Ok(()) => Ok(true),
            Err(KvError::ConditionFailed) => Ok(false),
            Err(other) => Err(other),
        }
    }

    pub async fn get_reservation(
        &self,
        logical_id: &str,
        bucket: &str,
    ) -> Result<Option<Item>, KvError> {
        self.store
            .get(ItemKey::new(reservation_pk(logical_id), bucket))
            .await
    }

    /// Reserve, then insert `job` only if the reservation succeeded.
    /// Returns `true` if the job was scheduled, `false` if an existing
    /// reservation already claimed this `(logical_id, bucket)`.
    pub async fn schedule_if_needed(
        &self,
        job: &ScheduledJob,
        job_table: &JobTable<S>,
        logical_id: &str,
        bucket: &str,
    ) -> Result<bool, KvError> {
        let job_sk = job.sk();
        if self
            .try_reserve(logical_id, bucket, crate::job::JOB_PK, &job_sk)
            .await?
        {
            job_table.put_job(job).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
