//! The distributed leader lease: a single record in the KV store held
//! by at most one process at a time, with TTL-based staleness.
//!
//! A [`LeaderLease`] is updated only by writes conditioned on the
//! holder's own `process_id` (acquire is conditioned on absence or
//! staleness instead, since nobody holds it yet). No in-memory lock is
//! shared across processes — `acquired` here is purely local
//! bookkeeping, reset to `false` the moment a conditioned write fails.

use chrono::{DateTime, Duration, Utc};

use crate::error::KvError;
use crate::kv::{AttributeValue, Condition, Item, ItemKey, KvStore, UpdateExpr};

pub const LEASE_PK: &str = "system#scheduler";
pub const LEASE_SK: &str = "lock#main";

const TTL_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Unacquired,
    Acquired,
}

/// Read-only view of the current holder, for diagnostics.
#[derive(Debug, Clone)]
pub struct LeaseHolder {
    pub process_id: String,
    pub timestamp: DateTime<Utc>,
    pub ttl: DateTime<Utc>,
    pub instance_info: Option<String>,
}

pub struct LeaderLease<S> {
    store: S,
    process_id: String,
    stale_lease_seconds: i64,
    instance_info: Option<String>,
    state: LeaseState,
}

impl<S: KvStore> LeaderLease<S> {
    pub fn new(store: S, process_id: impl Into<String>, stale_lease_seconds: i64) -> Self {
        Self {
            store,
            process_id: process_id.into(),
            stale_lease_seconds,
            instance_info: None,
            state: LeaseState::Unacquired,
        }
    }

    pub fn with_instance_info(mut self, info: impl Into<String>) -> Self {
        self.instance_info = Some(info.into());
        self
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn is_acquired(&self) -> bool {
        self.state == LeaseState::Acquired
    }

    /// Conditional put: succeeds if the record is absent or its
    /// `timestamp` is older than `now - stale_lease_seconds`.
    pub async fn acquire(&mut self, now: DateTime<Utc>) -> Result<bool, KvError> {
        let stale_cutoff = now - Duration::seconds(self.stale_lease_seconds);

        let mut item = Item::new();
        item.insert("PK".into(), AttributeValue::S(LEASE_PK.into()));
        item.insert("SK".into(), AttributeValue::S(LEASE_SK.into()));
        item.insert("process_id".into(), AttributeValue::S(self.process_id.clone()));
        item.insert("timestamp".into(), AttributeValue::Ts(now));
        item.insert("ttl".into(), AttributeValue::Ts(now + Duration::seconds(TTL_SECONDS)));
        item.insert("lock_type".into(), AttributeValue::S("scheduler".into()));
        if let Some(info) = &self.instance_info {
            item.insert("instance_info".into(), AttributeValue::S(info.clone()));
        }

        let condition = Condition::AttributeNotExists("PK".into())
            .or(Condition::Lt("timestamp".into(), AttributeValue::Ts(stale_cutoff)));

        match self.store.put(item, Some(condition)).await {
            Ok(()) => {
                self.state = LeaseState::Acquired;
                Ok(true)
            }
            Err(KvError::ConditionFailed) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// Conditional update of `timestamp`/`ttl`, only if still acquired
    /// locally and only if this process is still the recorded holder.
    /// On a lost race, clears local state and returns `false`.
    pub async fn refresh(&mut self, now: DateTime<Utc>) -> Result<bool, KvError> {
        if self.state != LeaseState::Acquired {
            return Ok(false);
        }

        let mut update = UpdateExpr::new();
        update.insert("timestamp".into(), Some(AttributeValue::Ts(now)));
        update.insert(
            "ttl".into(),
            Some(AttributeValue::Ts(now + Duration::seconds(TTL_SECONDS))),
        );

        let condition = Condition::Eq(
            "process_id".into(),
            AttributeValue::S(self.process_id.clone()),
        );

        match self
            .store
            .update(ItemKey::new(LEASE_PK, LEASE_SK), update, Some(condition))
            .await
        {
            Ok(()) => Ok(true),
            Err(KvError::ConditionFailed) => {
                self.state = LeaseState::Unacquired;
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Conditional delete on `process_id`. A lost race (someone already
    /// stole the lease) is swallowed, not propagated. Always clears
    /// local state.
    pub async fn release(&mut self) -> Result<(), KvError> {
        let condition = Condition::Eq(
            "process_id".into(),
            AttributeValue::S(self.process_id.clone()),
        );
        let result = self
            .store
            .delete(ItemKey::new(LEASE_PK, LEASE_SK), Some(condition))
            .await;
        self.state = LeaseState::Unacquired;
        match result {
            Ok(()) | Err(KvError::ConditionFailed) => Ok(()),
            Err(other) => Err(other),
        }
    }

    pub async fn get_current_holder(&self) -> Result<Option<LeaseHolder>, KvError> {
        let item = self.store.get(ItemKey::new(LEASE_PK, LEASE_SK)).await?;
        Ok(item.map(|item| LeaseHolder {
            process_id: item
                .get("process_id")
                .and_then(AttributeValue::as_str)
                .unwrap_or_default()
                .to_string(),
            timestamp: item
                .get("timestamp")
                .and_then(AttributeValue::as_timestamp)
                .unwrap_or_else(Utc::now),
            ttl: item
                .get("ttl")
                .and_then(AttributeValue::as_timestamp)
                .unwrap_or_else(Utc::now),
            instance_info: item
                .get("instance_info")
                .and_then(AttributeValue::as_str)
                .map(str::to_string),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_kv::MemoryKv;

    #[tokio::test]
    async fn exactly_one_of_two_concurrent_acquires_succeeds() {
        let kv = MemoryKv::new();
        let mut p1 = LeaderLease::new(kv.clone(), "p1", 60);
        let mut p2 = LeaderLease::new(kv, "p2", 60);

        let now = Utc::now();
        let a = p1.acquire(now).await.unwrap();
        let b = p2.acquire(now).await.unwrap();

        assert!(a);
        assert!(!b);
        assert!(p1.is_acquired());
        assert!(!p2.is_acquired());
    }

    #[tokio::test]
    async fn stale_lease_can_be_stolen_after_61_seconds() {
        let kv = MemoryKv::new();
        let mut p1 = LeaderLease::new(kv.clone(), "p1", 60);
        let mut p2 = LeaderLease::new(kv, "p2", 60);

        let t0 = Utc::now();
        assert!(p1.acquire(t0).await.unwrap());

        let t_later = t0 + Duration::seconds(61);
        assert!(p2.acquire(t_later).await.unwrap());

        let holder = p2.get_current_holder().await.unwrap().unwrap();
        assert_eq!(holder.process_id, "p2");
    }

    #[tokio::test]
    async fn refresh_fails_and_clears_local_state_once_lease_is_lost() {
        let kv = MemoryKv::new();
        let mut p1 = LeaderLease::new(kv.clone(), "p1", 60);
        let mut p2 = LeaderLease::new(kv, "p2", 60);

        let t0 = Utc::now();
        assert!(p1.acquire(t0).await.unwrap());

        let t_later = t0 + Duration::seconds(61);
        assert!(p2.acquire(t_later).await.unwrap());

        let refreshed = p1.refresh(t_later).await.unwrap();
        assert!(!refreshed);
        assert!(!p1.is_acquired());
    }

    #[tokio::test]
    async fn release_swallows_condition_failed_when_already_stolen() {
        let kv = MemoryKv::new();
        let mut p1 = LeaderLease::new(kv.clone(), "p1", 60);
        let mut p2 = LeaderLease::new(kv, "p2", 60);

        let t0 = Utc::now();
        assert!(p1.acquire(t0).await.unwrap());
        assert!(p2.acquire(t0 + Duration::seconds(61)).await.unwrap());

        // p1 releasing after losing the lease to p2 must not error.
        p1.release().await.unwrap();
        assert!(!p1.is_acquired());

        let holder = p2.get_current_holder().await.unwrap().unwrap();
        assert_eq!(holder.process_id, "p2");
    }

    #[tokio::test]
    async fn refresh_extends_ttl_while_still_holder() {
        let kv = MemoryKv::new();
        let mut p1 = LeaderLease::new(kv, "p1", 60);
        let t0 = Utc::now();
        assert!(p1.acquire(t0).await.unwrap());

        let t1 = t0 + Duration::seconds(10);
        assert!(p1.refresh(t1).await.unwrap());

        let holder = p1.get_current_holder().await.unwrap().unwrap();
        assert_eq!(holder.timestamp, t1);
    }
}
