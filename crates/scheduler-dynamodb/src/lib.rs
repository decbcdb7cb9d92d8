//! DynamoDB implementation of `scheduler-core`'s [`KvStore`].
//!
//! # Table layout
//!
//! A single table keyed on a composite `(PK, SK)` primary key, matching
//! every coordination record this crate writes: job rows, dedup
//! reservations, and the one leader-lease row.
//!
//! ```text
//! aws dynamodb create-table \
//!     --table-name CompanionMemory \
//!     --attribute-definitions AttributeName=PK,AttributeType=S \
//!                             AttributeName=SK,AttributeType=S \
//!     --key-schema AttributeName=PK,KeyType=HASH \
//!                  AttributeName=SK,KeyType=RANGE \
//!     --billing-mode PAY_PER_REQUEST
//! ```
//!
//! # Value encoding
//!
//! [`AttributeValue`] is a small ADT with four variants (`S`, `N`,
//! `Ts`, `Json`) and two of them — `S` and `Ts` — are both strings on
//! the wire. Relying on DynamoDB's native type tag alone would make `S`
//! and `Ts` indistinguishable on read, so every non-key attribute is
//! stored as a one-entry DynamoDB `M` tagging which variant it came
//! from (`{"S": ...}`, `{"N": ...}`, `{"TS": ...}`, `{"J": ...}`). `PK`
//! and `SK` are the exception: DynamoDB's key schema requires they be
//! native `S` values, and this crate only ever stores strings in them
//! anyway.
//!
//! # Conditions
//!
//! [`Condition`] is translated into a `ConditionExpression` string with
//! `#name`/`:value` placeholders, generated fresh per call so nested
//! `And`/`Or` trees never collide.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue as Av;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use scheduler_core::error::KvError;
use scheduler_core::kv::{
    AttributeValue, Condition, Item, ItemKey, KvStore, QuerySpec, SkBound, UpdateExpr,
};

/// DynamoDB-backed [`KvStore`].
///
/// Cheaply `Clone`able: `aws_sdk_dynamodb::Client` is itself a thin
/// handle over a shared connection pool, so cloning this struct is the
/// same cost as cloning the client.
#[derive(Clone)]
pub struct DynamoDbKv {
    client: Client,
    table_name: String,
}

impl DynamoDbKv {
    /// Build a store over an already-configured client.
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Load AWS credentials and region from the environment (the
    /// standard SDK default chain: env vars, shared config, IMDS) and
    /// build a store from them.
    pub async fn connect(table_name: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), table_name)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn encode_attr(value: &AttributeValue) -> Av {
    match value {
        AttributeValue::S(s) => Av::M(HashMap::from([("S".to_string(), Av::S(s.clone()))])),
        AttributeValue::N(n) => Av::M(HashMap::from([("N".to_string(), Av::N(n.to_string()))])),
        AttributeValue::Ts(t) => Av::M(HashMap::from([(
            "TS".to_string(),
            Av::S(t.to_rfc3339()),
        )])),
        AttributeValue::Json(v) => Av::M(HashMap::from([(
            "J".to_string(),
            Av::S(v.to_string()),
        )])),
    }
}

fn decode_attr(av: &Av) -> Result<AttributeValue, KvError> {
    let Av::M(tagged) = av else {
        return Err(KvError::InvalidKey(
            "expected a tagged attribute map".to_string(),
        ));
    };
    if let Some(Av::S(s)) = tagged.get("S") {
        return Ok(AttributeValue::S(s.clone()));
    }
    if let Some(Av::N(n)) = tagged.get("N") {
        let n: i64 = n
            .parse()
            .map_err(|_| KvError::InvalidKey(format!("invalid N attribute: {n:?}")))?;
        return Ok(AttributeValue::N(n));
    }
    if let Some(Av::S(s)) = tagged.get("TS") {
        let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(s)
            .map_err(|e| KvError::InvalidKey(format!("invalid TS attribute: {e}")))?
            .with_timezone(&Utc);
        return Ok(AttributeValue::Ts(parsed));
    }
    if let Some(Av::S(s)) = tagged.get("J") {
        let parsed: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| KvError::InvalidKey(format!("invalid J attribute: {e}")))?;
        return Ok(AttributeValue::Json(parsed));
    }
    Err(KvError::InvalidKey("unrecognized tagged attribute".into()))
}

fn item_to_av_map(item: &Item) -> Result<HashMap<String, Av>, KvError> {
    let mut map = HashMap::with_capacity(item.len());
    for (name, value) in item {
        if name == "PK" || name == "SK" {
            let s = value
                .as_str()
                .ok_or_else(|| KvError::InvalidKey(format!("{name} must be a string")))?;
            map.insert(name.clone(), Av::S(s.to_string()));
        } else {
            map.insert(name.clone(), encode_attr(value));
        }
    }
    Ok(map)
}

fn av_map_to_item(map: HashMap<String, Av>) -> Result<Item, KvError> {
    let mut item = Item::new();
    for (name, av) in map {
        if name == "PK" || name == "SK" {
            let Av::S(s) = av else {
                return Err(KvError::InvalidKey(format!("{name} is not a string")));
            };
            item.insert(name, AttributeValue::S(s));
        } else {
            item.insert(name, decode_attr(&av)?);
        }
    }
    Ok(item)
}

/// Accumulates `#name`/`:value` placeholders while rendering a
/// [`Condition`] (or a query key/filter expression) into a string, so
/// nested trees never reuse a placeholder.
#[derive(Default)]
struct ExprBuilder {
    names: HashMap<String, String>,
    values: HashMap<String, Av>,
    next: usize,
}

impl ExprBuilder {
    fn name_placeholder(&mut self, attr: &str) -> String {
        self.next += 1;
        let placeholder = format!("#n{}", self.next);
        self.names.insert(placeholder.clone(), attr.to_string());
        placeholder
    }

    fn value_placeholder(&mut self, value: Av) -> String {
        self.next += 1;
        let placeholder = format!(":v{}", self.next);
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn render_condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::AttributeNotExists(attr) => {
                format!("attribute_not_exists({})", self.name_placeholder(attr))
            }
            Condition::AttributeExists(attr) => {
                format!("attribute_exists({})", self.name_placeholder(attr))
            }
            Condition::Eq(attr, value) => {
                let name = self.name_placeholder(attr);
                let val = self.value_placeholder(encode_attr(value));
                format!("{name} = {val}")
            }
            Condition::Lt(attr, value) => {
                let name = self.name_placeholder(attr);
                let val = self.value_placeholder(encode_attr(value));
                format!("{name} < {val}")
            }
            Condition::Le(attr, value) => {
                let name = self.name_placeholder(attr);
                let val = self.value_placeholder(encode_attr(value));
                format!("{name} <= {val}")
            }
            Condition::And(a, b) => {
                format!("({}) AND ({})", self.render_condition(a), self.render_condition(b))
            }
            Condition::Or(a, b) => {
                format!("({}) OR ({})", self.render_condition(a), self.render_condition(b))
            }
        }
    }

    fn into_parts(self) -> (Option<HashMap<String, String>>, Option<HashMap<String, Av>>) {
        let names = if self.names.is_empty() {
            None
        } else {
            Some(self.names)
        };
        let values = if self.values.is_empty() {
            None
        } else {
            Some(self.values)
        };
        (names, values)
    }
}

fn classify<E>(err: aws_sdk_dynamodb::error::SdkError<E>, is_condition_failed: impl Fn(&E) -> bool) -> KvError
where
    E: std::error::Error + 'static,
{
    match err.as_service_error() {
        Some(service_err) if is_condition_failed(service_err) => KvError::ConditionFailed,
        _ => {
            tracing::warn!(error = %err, "dynamodb request failed");
            KvError::TransientStoreError(err.to_string())
        }
    }
}

#[async_trait]
impl KvStore for DynamoDbKv {
    async fn put(&self, item: Item, condition: Option<Condition>) -> Result<(), KvError> {
        let av_item = item_to_av_map(&item)?;
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(av_item));

        if let Some(condition) = &condition {
            let mut builder = ExprBuilder::default();
            let expr = builder.render_condition(condition);
            let (names, values) = builder.into_parts();
            request = request
                .condition_expression(expr)
                .set_expression_attribute_names(names)
                .set_expression_attribute_values(values);
        }

        request
            .send()
            .await
            .map_err(|e| classify(e, |e| e.is_conditional_check_failed_exception()))?;
        Ok(())
    }

    async fn update(
        &self,
        key: ItemKey,
        update: UpdateExpr,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        let mut builder = ExprBuilder::default();
        let mut sets = Vec::new();
        let mut removes = Vec::new();
        for (attr, value) in &update {
            let name = builder.name_placeholder(attr);
            match value {
                Some(v) => {
                    let val = builder.value_placeholder(encode_attr(v));
                    sets.push(format!("{name} = {val}"));
                }
                None => removes.push(name),
            }
        }

        let mut clauses = Vec::new();
        if !sets.is_empty() {
            clauses.push(format!("SET {}", sets.join(", ")));
        }
        if !removes.is_empty() {
            clauses.push(format!("REMOVE {}", removes.join(", ")));
        }
        let update_expression = clauses.join(" ");

        let condition_expression = condition.as_ref().map(|c| builder.render_condition(c));
        let (names, values) = builder.into_parts();

        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", Av::S(key.pk))
            .key("SK", Av::S(key.sk))
            .update_expression(update_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values);

        if let Some(expr) = condition_expression {
            request = request.condition_expression(expr);
        }

        request
            .send()
            .await
            .map_err(|e| classify(e, |e| e.is_conditional_check_failed_exception()))?;
        Ok(())
    }

    async fn get(&self, key: ItemKey) -> Result<Option<Item>, KvError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", Av::S(key.pk))
            .key("SK", Av::S(key.sk))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| KvError::TransientStoreError(e.to_string()))?;

        match output.item {
            Some(map) => Ok(Some(av_map_to_item(map)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: ItemKey, condition: Option<Condition>) -> Result<(), KvError> {
        let mut request = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", Av::S(key.pk))
            .key("SK", Av::S(key.sk));

        if let Some(condition) = &condition {
            let mut builder = ExprBuilder::default();
            let expr = builder.render_condition(condition);
            let (names, values) = builder.into_parts();
            request = request
                .condition_expression(expr)
                .set_expression_attribute_names(names)
                .set_expression_attribute_values(values);
        }

        match request
            .send()
            .await
            .map_err(|e| classify(e, |e| e.is_conditional_check_failed_exception()))
        {
            Ok(_) => Ok(()),
            Err(KvError::ConditionFailed) if condition.is_none() => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn query(&self, spec: QuerySpec) -> Result<Vec<Item>, KvError> {
        let mut builder = ExprBuilder::default();
        let pk_name = builder.name_placeholder("PK");
        let pk_val = builder.value_placeholder(Av::S(spec.pk.clone()));
        let mut key_condition = format!("{pk_name} = {pk_val}");

        if let Some(bound) = &spec.sk_bound {
            let sk_name = builder.name_placeholder("SK");
            let (op, bound_value) = match bound {
                SkBound::LessOrEqual(v) => ("<=", v),
                SkBound::LessThan(v) => ("<", v),
            };
            let sk_val = builder.value_placeholder(Av::S(bound_value.clone()));
            key_condition.push_str(&format!(" AND {sk_name} {op} {sk_val}"));
        }

        let filter_expression = spec.filter.as_ref().map(|(attr, value)| {
            let name = builder.name_placeholder(attr);
            let val = builder.value_placeholder(encode_attr(value));
            format!("{name} = {val}")
        });

        let (names, values) = builder.into_parts();

        let mut request = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression(key_condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .consistent_read(true);

        if let Some(expr) = filter_expression {
            request = request.filter_expression(expr);
        }
        if let Some(limit) = spec.limit {
            // A FilterExpression is applied after this page is read, so
            // DynamoDB can legitimately return fewer than `limit` items
            // even when more eligible items exist further along the
            // index — the same under-fill QuerySpec already documents.
            request = request.limit(limit as i32);
        }

        let output = request
            .send()
            .await
            .map_err(|e| KvError::TransientStoreError(e.to_string()))?;

        output
            .items
            .unwrap_or_default()
            .into_iter()
            .map(av_map_to_item)
            .collect()
    }
}
