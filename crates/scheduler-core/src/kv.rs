//! Narrow interface over the underlying conditional-write KV store.
//!
//! Every higher component — the job table, the deduplication index, the
//! leader lease — talks to the store only through [`KvStore`]. A
//! concrete backend (e.g. `scheduler-dynamodb`) implements this trait
//! once and every coordination invariant in the crate holds regardless
//! of which store backs it, provided the store honors the condition
//! semantics described below.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::KvError;

/// A scalar value stored in an [`Item`].
///
/// Kept deliberately small: the core only ever needs strings, numbers,
/// and UTC instants. A richer value type belongs in a backend crate,
/// not here.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    S(String),
    N(i64),
    Ts(DateTime<Utc>),
    /// Opaque JSON blob, used for job payloads.
    Json(serde_json::Value),
}

/// Ordered only within the same variant — `Lt`/`Le` conditions never
/// compare across `S`/`N`/`Ts`/`Json`, so cross-variant pairs have no
/// ordering rather than an arbitrary one. `Json` carries no ordering at
/// all since `serde_json::Value` isn't `PartialOrd` and no condition in
/// this crate ever compares payloads.
impl PartialOrd for AttributeValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (AttributeValue::S(a), AttributeValue::S(b)) => a.partial_cmp(b),
            (AttributeValue::N(a), AttributeValue::N(b)) => a.partial_cmp(b),
            (AttributeValue::Ts(a), AttributeValue::Ts(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Ts(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            AttributeValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::S(s) => write!(f, "{s}"),
            AttributeValue::N(n) => write!(f, "{n}"),
            AttributeValue::Ts(t) => write!(f, "{}", t.to_rfc3339()),
            AttributeValue::Json(v) => write!(f, "{v}"),
        }
    }
}

/// An item in the table: an attribute map that always carries at least
/// `PK` and `SK`.
pub type Item = BTreeMap<String, AttributeValue>;

/// The composite primary key identifying an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

/// A small expression language over attribute presence/absence and
/// value comparison, evaluated by the store atomically with the write
/// it guards.
///
/// This is intentionally limited to what every component in this crate
/// actually needs: the worker's claim, the dedup index's reservation,
/// and the leader lease's acquire/refresh/release all reduce to a
/// conjunction of these primitives.
#[derive(Debug, Clone)]
pub enum Condition {
    /// The named attribute must not be present on the existing item
    /// (or the item must not exist at all).
    AttributeNotExists(String),
    /// The named attribute must be present.
    AttributeExists(String),
    /// The named attribute must equal the given value.
    Eq(String, AttributeValue),
    /// The named attribute must be less than the given value.
    Lt(String, AttributeValue),
    /// The named attribute must be less than or equal to the given value.
    Le(String, AttributeValue),
    /// Logical AND of two conditions.
    And(Box<Condition>, Box<Condition>),
    /// Logical OR of two conditions.
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn and(self, other: Condition) -> Condition {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Condition {
        Condition::Or(Box::new(self), Box::new(other))
    }
}

/// A `SET` update: attribute name to new value, or `None` to remove the
/// attribute.
pub type UpdateExpr = BTreeMap<String, Option<AttributeValue>>;

/// An inclusive-or-exclusive bound on the sort key for a range query.
#[derive(Debug, Clone)]
pub enum SkBound {
    LessOrEqual(String),
    LessThan(String),
}

/// Parameters for [`KvStore::query`].
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub pk: String,
    pub sk_bound: Option<SkBound>,
    /// Server-side filter applied after the key-range read. May return
    /// fewer than `limit` matching items even when more exist past the
    /// returned page — this mirrors real DynamoDB `FilterExpression`
    /// semantics and callers must not assume a full page means more
    /// data remains, nor that a short page means none does.
    pub filter: Option<(String, AttributeValue)>,
    pub limit: Option<usize>,
}

/// Conditional put/update/delete/get/range-query over a composite-key
/// KV table.
///
/// Reads used for claim decisions MUST be strongly consistent; an
/// implementation backed by an eventually-consistent read path is not a
/// valid `KvStore` for this crate's purposes.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Put `item`, succeeding only if `condition` holds (or is absent).
    /// A failed condition returns [`KvError::ConditionFailed`], not a
    /// hard error.
    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<(), KvError>;

    /// Apply `update` to the item at `key`, succeeding only if
    /// `condition` holds.
    async fn update(
        &self,
        key: ItemKey,
        update: UpdateExpr,
        condition: Option<Condition>,
    ) -> Result<(), KvError>;

    /// Fetch the item at `key`, or `None` if absent.
    async fn get(&self, key: ItemKey) -> Result<Option<Item>, KvError>;

    /// Delete the item at `key`, succeeding only if `condition` holds.
    /// Deleting an absent item is not an error.
    async fn delete(&self, key: ItemKey, condition: Option<Condition>) -> Result<(), KvError>;

    /// Range query by partition key, optionally bounded by sort key and
    /// filtered server-side. Returns items ascending by sort key.
    async fn query(&self, spec: QuerySpec) -> Result<Vec<Item>, KvError>;
}
