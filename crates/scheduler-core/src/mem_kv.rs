//! In-memory [`KvStore`] for tests and small deployments.
//!
//! Mirrors the role of `MemoryLogStore` in the original Python
//! implementation: a drop-in, non-durable store with the same
//! conditional-write semantics as the real backend, so every invariant
//! in this crate can be exercised without a network dependency.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::KvError;
use crate::kv::{AttributeValue, Condition, Item, ItemKey, KvStore, QuerySpec, SkBound};

/// Cheaply `Clone`able, like a connection pool handle: every clone
/// shares the same underlying table, matching how a real backend's
/// client handle is passed around between components.
#[derive(Default, Clone)]
pub struct MemoryKv {
    items: Arc<Mutex<BTreeMap<(String, String), Item>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn eval(condition: &Condition, existing: Option<&Item>) -> bool {
        match condition {
            Condition::AttributeNotExists(attr) => {
                existing.is_none_or(|item| !item.contains_key(attr))
            }
            Condition::AttributeExists(attr) => {
                existing.is_some_and(|item| item.contains_key(attr))
            }
            Condition::Eq(attr, value) => existing
                .and_then(|item| item.get(attr))
                .is_some_and(|v| v == value),
            Condition::Lt(attr, value) => {
                Self::compare(existing, attr, value, |a, b| a < b)
            }
            Condition::Le(attr, value) => {
                Self::compare(existing, attr, value, |a, b| a <= b)
            }
            Condition::And(a, b) => Self::eval(a, existing) && Self::eval(b, existing),
            Condition::Or(a, b) => Self::eval(a, existing) || Self::eval(b, existing),
        }
    }

    fn compare(
        existing: Option<&Item>,
        attr: &str,
        value: &AttributeValue,
        cmp: impl Fn(&AttributeValue, &AttributeValue) -> bool,
    ) -> bool {
        match existing.and_then(|item| item.get(attr)) {
            Some(actual) => cmp(actual, value),
            // A condition referencing a missing attribute with Lt/Le
            // is vacuously false, matching DynamoDB's treatment of
            // comparisons against attribute_not_exists.
            None => false,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<(), KvError> {
        let pk = item
            .get("PK")
            .and_then(AttributeValue::as_str)
            .ok_or_else(|| KvError::TransientStoreError("item missing PK".into()))?
            .to_string();
        let sk = item
            .get("SK")
            .and_then(AttributeValue::as_str)
            .ok_or_else(|| KvError::TransientStoreError("item missing SK".into()))?
            .to_string();

        let mut items = self.items.lock().expect("mem kv lock poisoned");
        let key = (pk, sk);
        let existing = items.get(&key);
        if let Some(cond) = &condition {
            if !Self::eval(cond, existing) {
                return Err(KvError::ConditionFailed);
            }
        }
        items.insert(key, item);
        Ok(())
    }

    async fn update(
        &self,
        key: ItemKey,
        update: BTreeMap<String, Option<AttributeValue>>,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        let mut items = self.items.lock().expect("mem kv lock poisoned");
        let lookup = (key.pk.clone(), key.sk.clone());
        let existing = items.get(&lookup);
        if let Some(cond) = &condition {
            if !Self::eval(cond, existing) {
                return Err(KvError::ConditionFailed);
            }
        }

        let mut item = existing.cloned().unwrap_or_default();
        item.insert("PK".into(), AttributeValue::S(key.pk));
        item.insert("SK".into(), AttributeValue::S(key.sk));
        for (attr, value) in update {
            match value {
                Some(v) => {
                    item.insert(attr, v);
                }
                None => {
                    item.remove(&attr);
                }
            }
        }
        items.insert(lookup, item);
        Ok(())
    }

    async fn get(&self, key: ItemKey) -> Result<Option<Item>, KvError> {
        let items = self.items.lock().expect("mem kv lock poisoned");
        Ok(items.get(&(key.pk, key.sk)).cloned())
    }

    async fn delete(&self, key: ItemKey, condition: Option<Condition>) -> Result<(), KvError> {
        let mut items = self.items.lock().expect("mem kv lock poisoned");
        let lookup = (key.pk, key.sk);
        let existing = items.get(&lookup);
        if let Some(cond) = &condition {
            if !Self::eval(cond, existing) {
                return Err(KvError::ConditionFailed);
            }
        }
        items.remove(&lookup);
        Ok(())
    }

    async fn query(&self, spec: QuerySpec) -> Result<Vec<Item>, KvError> {
        let items = self.items.lock().expect("mem kv lock poisoned");
        let mut matches: Vec<Item> = items
            .iter()
            .filter(|((pk, sk), _)| {
                pk == &spec.pk
                    && match &spec.sk_bound {
                        Some(SkBound::LessOrEqual(bound)) => sk.as_str() <= bound.as_str(),
                        Some(SkBound::LessThan(bound)) => sk.as_str() < bound.as_str(),
                        None => true,
                    }
            })
            .map(|(_, item)| item.clone())
            .collect();

        matches.sort_by(|a, b| {
            let sa = a.get("SK").and_then(AttributeValue::as_str).unwrap_or("");
            let sb = b.get("SK").and_then(AttributeValue::as_str).unwrap_or("");
            sa.cmp(sb)
        });

        if let Some((attr, value)) = &spec.filter {
            matches.retain(|item| item.get(attr) == Some(value));
        }

        if let Some(limit) = spec.limit {
            matches.truncate(limit);
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(pk: &str, sk: &str) -> Item {
        let mut m = Item::new();
        m.insert("PK".into(), AttributeValue::S(pk.into()));
        m.insert("SK".into(), AttributeValue::S(sk.into()));
        m
    }

    #[tokio::test]
    async fn put_is_rejected_by_attribute_not_exists_condition_on_existing_item() {
        let kv = MemoryKv::new();
        kv.put(item("job", "a"), None).await.unwrap();

        let err = kv
            .put(
                item("job", "a"),
                Some(Condition::AttributeNotExists("PK".into())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::ConditionFailed));
    }

    #[tokio::test]
    async fn put_succeeds_when_item_absent() {
        let kv = MemoryKv::new();
        kv.put(
            item("job", "a"),
            Some(Condition::AttributeNotExists("PK".into())),
        )
        .await
        .unwrap();
        assert!(kv.get(ItemKey::new("job", "a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_merges_into_existing_item_without_clobbering_keys() {
        let kv = MemoryKv::new();
        kv.put(item("job", "a"), None).await.unwrap();

        let mut update = UpdateExpr::new();
        update.insert("status".into(), Some(AttributeValue::S("done".into())));
        kv.update(ItemKey::new("job", "a"), update, None)
            .await
            .unwrap();

        let stored = kv.get(ItemKey::new("job", "a")).await.unwrap().unwrap();
        assert_eq!(stored.get("status").unwrap().as_str(), Some("done"));
        assert_eq!(stored.get("PK").unwrap().as_str(), Some("job"));
    }

    #[tokio::test]
    async fn query_respects_sk_bound_and_filter_and_limit() {
        let kv = MemoryKv::new();
        for sk in ["scheduled#1", "scheduled#2", "scheduled#3"] {
            let mut it = item("job", sk);
            it.insert("status".into(), AttributeValue::S("pending".into()));
            kv.put(it, None).await.unwrap();
        }
        let mut completed = item("job", "scheduled#0");
        completed.insert("status".into(), AttributeValue::S("completed".into()));
        kv.put(completed, None).await.unwrap();

        let results = kv
            .query(QuerySpec {
                pk: "job".into(),
                sk_bound: Some(SkBound::LessOrEqual("scheduled#2".into())),
                filter: Some(("status".into(), AttributeValue::S("pending".into()))),
                limit: Some(10),
            })
            .await
            .unwrap();

        let sks: Vec<&str> = results
            .iter()
            .map(|it| it.get("SK").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(sks, vec!["scheduled#1", "scheduled#2"]);
    }

    #[tokio::test]
    async fn delete_with_condition_swallows_mismatched_holder_as_condition_failed() {
        let kv = MemoryKv::new();
        let mut it = item("system#scheduler", "lock#main");
        it.insert("process_id".into(), AttributeValue::S("p1".into()));
        kv.put(it, None).await.unwrap();

        let err = kv
            .delete(
                ItemKey::new("system#scheduler", "lock#main"),
                Some(Condition::Eq(
                    "process_id".into(),
                    AttributeValue::S("p2".into()),
                )),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::ConditionFailed));
    }

    #[tokio::test]
    async fn stale_lease_condition_allows_steal_after_cutoff() {
        let kv = MemoryKv::new();
        let mut it = item("system#scheduler", "lock#main");
        let old = Utc::now() - chrono::Duration::seconds(120);
        it.insert("timestamp".into(), AttributeValue::Ts(old));
        kv.put(it, None).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        let cond = Condition::AttributeNotExists("PK".into()).or(Condition::Lt(
            "timestamp".into(),
            AttributeValue::Ts(cutoff),
        ));

        kv.put(item("system#scheduler", "lock#main"), Some(cond))
            .await
            .unwrap();
    }
}
