//! Query descriptors and their evaluation.
//!
//! A [`QueryDescriptor`] is plain data: predicates (AND-combined), sort keys,
//! offset/limit, relation includes and an optional aggregate. Evaluation
//! order is always filter, sort, offset, limit. Aggregates see the filtered
//! set before sort and limit.

use crate::adapter::Adapter;
use crate::error::Result;
use crate::record::Record;
use crate::registry::SchemaRegistry;
use crate::schema::RelationKind;
use crate::store::Collection;
use crate::{CollectionName, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
    Between,
    IsNull,
    IsNotNull,
}

/// One filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value.into())
    }

    /// Evaluate against a record. Missing fields behave as null.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.lookup(&self.field).unwrap_or(Value::Null);
        let expected = &self.value;

        match self.op {
            Operator::Eq => loose_eq(&actual, expected),
            Operator::Ne => !loose_eq(&actual, expected),
            Operator::Gt => ordered(&actual, expected) == Some(Ordering::Greater),
            Operator::Lt => ordered(&actual, expected) == Some(Ordering::Less),
            Operator::Gte => matches!(
                ordered(&actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lte => matches!(
                ordered(&actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => in_list(&actual, expected),
            Operator::NotIn => !in_list(&actual, expected),
            Operator::Contains => match (&actual, expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| loose_eq(item, needle)),
                _ => false,
            },
            Operator::StartsWith => match (&actual, expected) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            Operator::Between => match expected.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    matches!(ordered(&actual, low), Some(Ordering::Greater | Ordering::Equal))
                        && matches!(ordered(&actual, high), Some(Ordering::Less | Ordering::Equal))
                }
                _ => false,
            },
            Operator::IsNull => actual.is_null(),
            Operator::IsNotNull => !actual.is_null(),
        }
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn in_list(actual: &Value, list: &Value) -> bool {
    list.as_array()
        .is_some_and(|items| items.iter().any(|item| loose_eq(actual, item)))
}

/// Ordering between two values of the same kind; `None` across kinds.
fn ordered(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values used for sorting.
///
/// Values of different kinds order as null, bool, number, string, array,
/// object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match kind_rank(a).cmp(&kind_rank(b)) {
        Ordering::Equal => ordered(a, b)
            .unwrap_or_else(|| canonical_string(a).cmp(&canonical_string(b))),
        other => other,
    }
}

/// Serialize with object keys sorted at every level.
pub fn canonical_string(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Key used to bucket records in grouped results.
fn group_key(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s,
        Some(other) => canonical_string(&other),
        None => "null".to_string(),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

/// What to aggregate and how to bucket it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSpec {
    pub function: AggregateFn,
    /// Field to aggregate; `Count` without a field counts records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

impl AggregateSpec {
    pub fn new(function: AggregateFn, field: impl Into<String>) -> Self {
        Self {
            function,
            field: Some(field.into()),
            group_by: None,
        }
    }

    pub fn count() -> Self {
        Self {
            function: AggregateFn::Count,
            field: None,
            group_by: None,
        }
    }

    pub fn grouped_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    fn compute(&self, records: &[&Record]) -> Value {
        let values: Vec<Value> = match &self.field {
            Some(field) => records
                .iter()
                .filter_map(|r| r.lookup(field))
                .filter(|v| !v.is_null())
                .collect(),
            None => Vec::new(),
        };

        match self.function {
            AggregateFn::Count => match &self.field {
                Some(_) => Value::from(values.len()),
                None => Value::from(records.len()),
            },
            AggregateFn::Sum => number_value(values.iter().filter_map(Value::as_f64).sum()),
            AggregateFn::Avg => {
                let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
                if nums.is_empty() {
                    Value::Null
                } else {
                    number_value(nums.iter().sum::<f64>() / nums.len() as f64)
                }
            }
            AggregateFn::Min => values
                .into_iter()
                .min_by(compare_values)
                .unwrap_or(Value::Null),
            AggregateFn::Max => values
                .into_iter()
                .max_by(compare_values)
                .unwrap_or(Value::Null),
        }
    }
}

/// Whole-number floats come back as integers.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Output of an aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateResult {
    Value(Value),
    Groups(BTreeMap<String, Value>),
}

/// An immutable read plan for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateSpec>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a record passes the deleted filter and every predicate.
    pub fn matches(&self, record: &Record) -> bool {
        (self.include_deleted || record.is_active())
            && self.predicates.iter().all(|p| p.matches(record))
    }

    /// Filter, then stable-sort, then skip `offset`, then take `limit`.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut matched: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();

        if !self.sort.is_empty() {
            matched.sort_by(|a, b| self.compare(a, b));
        }

        let iter = matched.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.sort {
            let left = a.lookup(&key.field).unwrap_or(Value::Null);
            let right = b.lookup(&key.field).unwrap_or(Value::Null);
            let ord = compare_values(&left, &right);
            let ord = match key.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Count of records passing the filter.
    pub fn count(&self, records: &[Record]) -> usize {
        records.iter().filter(|r| self.matches(r)).count()
    }

    /// Run the aggregate over the filtered set, if one is set.
    pub fn aggregate(&self, records: &[Record]) -> Option<AggregateResult> {
        let spec = self.aggregate.as_ref()?;
        let matched: Vec<&Record> = records.iter().filter(|r| self.matches(r)).collect();

        Some(match &spec.group_by {
            None => AggregateResult::Value(spec.compute(&matched)),
            Some(field) => {
                let mut buckets: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
                for record in matched {
                    buckets
                        .entry(group_key(record.lookup(field)))
                        .or_default()
                        .push(record);
                }
                AggregateResult::Groups(
                    buckets
                        .into_iter()
                        .map(|(key, members)| (key, spec.compute(&members)))
                        .collect(),
                )
            }
        })
    }

    /// Bucket the filtered, sorted records by a field.
    pub fn group(&self, records: Vec<Record>, field: &str) -> BTreeMap<String, Vec<Record>> {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in self.apply(records) {
            groups.entry(group_key(record.lookup(field))).or_default().push(record);
        }
        groups
    }
}

/// Attach related records for every include path.
///
/// Each path like `"project.client"` names one relation per segment. The
/// collections along the path are loaded once each, and attachment runs from
/// the deepest segment up, so a path never expands beyond its own length even
/// when the schema graph has cycles. Shorter paths are applied first so a
/// deeper path on the same relation overrides the shallow attachment.
pub(crate) async fn resolve_includes(
    records: &mut [Record],
    collection: &str,
    paths: &[String],
    registry: &SchemaRegistry,
    adapter: &dyn Adapter,
) -> Result<()> {
    let mut ordered: Vec<&String> = paths.iter().collect();
    ordered.sort_by_key(|p| p.split('.').count());

    let mut loaded: HashMap<CollectionName, Vec<Record>> = HashMap::new();

    for path in ordered {
        // Resolve the chain of (holder collection, relation) for this path.
        let mut chain = Vec::new();
        let mut current = collection.to_string();
        for segment in path.split('.') {
            let schema = registry.get(&current)?;
            let relation = schema
                .relation(segment)
                .cloned()
                .ok_or_else(|| Error::UnknownRelation {
                    collection: current.clone(),
                    relation: segment.to_string(),
                })?;
            current = relation.target.clone();
            chain.push(relation);
        }

        for relation in &chain {
            if !loaded.contains_key(&relation.target) {
                let all = adapter.get_all(&relation.target).await?;
                let active: Vec<Record> = all.into_iter().filter(Record::is_active).collect();
                loaded.insert(relation.target.clone(), active);
            }
        }

        // Bottom-up: the deepest targets are attached raw; each level above
        // attaches the enriched level below it.
        let mut below: Option<Vec<Record>> = None;
        for (depth, relation) in chain.iter().enumerate().rev() {
            let targets = match below.take() {
                Some(enriched) => enriched,
                None => loaded.get(&relation.target).cloned().unwrap_or_default(),
            };

            if depth == 0 {
                for record in records.iter_mut() {
                    attach(record, relation, &targets);
                }
            } else {
                let holder = &chain[depth - 1].target;
                let mut holders = loaded.get(holder).cloned().unwrap_or_default();
                for record in holders.iter_mut() {
                    attach(record, relation, &targets);
                }
                below = Some(holders);
            }
        }
    }

    Ok(())
}

fn attach(record: &mut Record, relation: &crate::schema::Relation, targets: &[Record]) {
    let value = match relation.kind {
        RelationKind::BelongsTo => {
            let key = record.get(&relation.foreign_key).cloned().unwrap_or(Value::Null);
            targets
                .iter()
                .find(|t| loose_eq(&Value::String(t.id.clone()), &key))
                .map(Record::to_value)
                .unwrap_or(Value::Null)
        }
        RelationKind::HasMany => {
            let own_id = Value::String(record.id.clone());
            Value::Array(
                targets
                    .iter()
                    .filter(|t| t.get(&relation.foreign_key).is_some_and(|v| loose_eq(v, &own_id)))
                    .map(Record::to_value)
                    .collect(),
            )
        }
    };
    record.fields.insert(relation.name.clone(), value);
}

/// Fluent query builder bound to a collection.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    collection: Collection,
    descriptor: QueryDescriptor,
}

impl QueryBuilder {
    pub(crate) fn new(collection: Collection) -> Self {
        Self {
            collection,
            descriptor: QueryDescriptor::new(),
        }
    }

    /// Add an AND-combined predicate.
    pub fn where_(mut self, field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        self.descriptor.predicates.push(Predicate::new(field, op, value.into()));
        self
    }

    /// Shorthand for an equality predicate.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_(field, Operator::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.descriptor = self.descriptor.order_by(field, direction);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.descriptor.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.descriptor.offset = offset;
        self
    }

    /// Attach a relation path (dotted for nesting).
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.descriptor.include.push(path.into());
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.descriptor.include_deleted = true;
        self
    }

    pub fn aggregate(mut self, spec: AggregateSpec) -> Self {
        self.descriptor.aggregate = Some(spec);
        self
    }

    /// The plan built so far.
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub async fn execute(self) -> Result<Vec<Record>> {
        self.collection.run_query(&self.descriptor).await
    }

    pub async fn first(mut self) -> Result<Option<Record>> {
        self.descriptor.limit = Some(1);
        Ok(self.execute().await?.into_iter().next())
    }

    /// Count of matching records; ignores offset and limit.
    pub async fn count(self) -> Result<usize> {
        self.collection.run_count(&self.descriptor).await
    }

    /// Run the configured aggregate.
    pub async fn aggregate_result(self) -> Result<Option<AggregateResult>> {
        self.collection.run_aggregate(&self.descriptor).await
    }

    /// Execute and bucket results by a field.
    pub async fn group_by(self, field: &str) -> Result<BTreeMap<String, Vec<Record>>> {
        let records = self.collection.load_all().await?;
        Ok(self.descriptor.group(records, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use serde_json::json;

    fn rec(id: &str, fields: Value) -> Record {
        let map: Fields = fields.as_object().cloned().unwrap();
        Record::new(id, map, 1000)
    }

    fn sample() -> Vec<Record> {
        vec![
            rec("a", json!({"name": "Acme", "amount": 100, "region": "north", "tags": ["steel"]})),
            rec("b", json!({"name": "Beta", "amount": 250.5, "region": "south"})),
            rec("c", json!({"name": "Acorn", "amount": 40, "region": "north", "tags": ["wood", "steel"]})),
            rec("d", json!({"name": "Delta", "region": null})),
        ]
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    fn run(preds: Vec<Predicate>) -> Vec<String> {
        let mut q = QueryDescriptor::new();
        q.predicates = preds;
        q.apply(sample()).into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(run(vec![Predicate::eq("region", "north")]), ["a", "c"]);
        assert_eq!(run(vec![Predicate::new("region", Operator::Ne, json!("north"))]), ["b", "d"]);
        assert_eq!(run(vec![Predicate::new("amount", Operator::Gt, json!(100))]), ["b"]);
        assert_eq!(run(vec![Predicate::new("amount", Operator::Gte, json!(100))]), ["a", "b"]);
        assert_eq!(run(vec![Predicate::new("amount", Operator::Lt, json!(100))]), ["c"]);
        assert_eq!(run(vec![Predicate::new("amount", Operator::Lte, json!(100.0))]), ["a", "c"]);
    }

    #[test]
    fn membership_and_string_operators() {
        assert_eq!(run(vec![Predicate::new("name", Operator::In, json!(["Beta", "Delta"]))]), ["b", "d"]);
        assert_eq!(run(vec![Predicate::new("name", Operator::NotIn, json!(["Beta", "Delta"]))]), ["a", "c"]);
        assert_eq!(run(vec![Predicate::new("name", Operator::StartsWith, json!("Ac"))]), ["a", "c"]);
        assert_eq!(run(vec![Predicate::new("name", Operator::Contains, json!("elt"))]), ["d"]);
        assert_eq!(run(vec![Predicate::new("tags", Operator::Contains, json!("wood"))]), ["c"]);
        assert_eq!(run(vec![Predicate::new("amount", Operator::Between, json!([40, 100]))]), ["a", "c"]);
    }

    #[test]
    fn null_operators() {
        assert_eq!(run(vec![Predicate::new("region", Operator::IsNull, Value::Null)]), ["d"]);
        assert_eq!(run(vec![Predicate::new("amount", Operator::IsNotNull, Value::Null)]), ["a", "b", "c"]);
        // Missing fields compare equal to null.
        assert_eq!(run(vec![Predicate::eq("tags", Value::Null)]), ["b", "d"]);
    }

    #[test]
    fn mixed_types_never_order() {
        assert!(run(vec![Predicate::new("name", Operator::Gt, json!(5))]).is_empty());
    }

    #[test]
    fn predicates_and_combine_regardless_of_order() {
        let p1 = Predicate::eq("region", "north");
        let p2 = Predicate::new("amount", Operator::Gt, json!(50));
        assert_eq!(run(vec![p1.clone(), p2.clone()]), ["a"]);
        assert_eq!(run(vec![p2, p1]), ["a"]);
    }

    #[test]
    fn sort_offset_limit() {
        let q = QueryDescriptor::new()
            .order_by("amount", Direction::Desc)
            .with_offset(1)
            .with_limit(2);
        // d has no amount and sorts last when descending.
        assert_eq!(ids(&q.apply(sample())), ["a", "c"]);
    }

    #[test]
    fn sort_is_stable_for_ties() {
        let q = QueryDescriptor::new().order_by("region", Direction::Asc);
        // null < strings; a and c tie on "north" and keep insertion order.
        assert_eq!(ids(&q.apply(sample())), ["d", "a", "c", "b"]);
    }

    #[test]
    fn deleted_records_excluded_by_default() {
        let mut records = sample();
        records[0].mark_deleted(2000);

        let q = QueryDescriptor::new();
        assert_eq!(ids(&q.apply(records.clone())), ["b", "c", "d"]);

        let q = QueryDescriptor {
            include_deleted: true,
            ..QueryDescriptor::new()
        };
        assert_eq!(ids(&q.apply(records)), ["a", "b", "c", "d"]);
    }

    #[test]
    fn aggregates_run_before_limit() {
        let q = QueryDescriptor {
            aggregate: Some(AggregateSpec::new(AggregateFn::Sum, "amount")),
            limit: Some(1),
            ..QueryDescriptor::new()
        };
        assert_eq!(q.aggregate(&sample()), Some(AggregateResult::Value(json!(390.5))));

        let avg = QueryDescriptor {
            predicates: vec![Predicate::eq("region", "north")],
            aggregate: Some(AggregateSpec::new(AggregateFn::Avg, "amount")),
            ..QueryDescriptor::new()
        };
        assert_eq!(avg.aggregate(&sample()), Some(AggregateResult::Value(json!(70))));
    }

    #[test]
    fn min_max_count() {
        let agg = |spec| QueryDescriptor {
            aggregate: Some(spec),
            ..QueryDescriptor::new()
        }
        .aggregate(&sample());

        assert_eq!(agg(AggregateSpec::new(AggregateFn::Min, "amount")), Some(AggregateResult::Value(json!(40))));
        assert_eq!(agg(AggregateSpec::new(AggregateFn::Max, "name")), Some(AggregateResult::Value(json!("Delta"))));
        assert_eq!(agg(AggregateSpec::count()), Some(AggregateResult::Value(json!(4))));
        assert_eq!(agg(AggregateSpec::new(AggregateFn::Count, "amount")), Some(AggregateResult::Value(json!(3))));
    }

    #[test]
    fn grouped_aggregate() {
        let q = QueryDescriptor {
            aggregate: Some(AggregateSpec::new(AggregateFn::Sum, "amount").grouped_by("region")),
            ..QueryDescriptor::new()
        };
        let mut expected = BTreeMap::new();
        expected.insert("north".to_string(), json!(140));
        expected.insert("south".to_string(), json!(250.5));
        expected.insert("null".to_string(), json!(0));
        assert_eq!(q.aggregate(&sample()), Some(AggregateResult::Groups(expected)));
    }

    #[test]
    fn group_records() {
        let groups = QueryDescriptor::new().group(sample(), "region");
        assert_eq!(ids(&groups["north"]), ["a", "c"]);
        assert_eq!(ids(&groups["null"]), ["d"]);
    }

    #[test]
    fn canonical_string_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1});
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn descriptor_serializes() {
        let q = QueryDescriptor::new()
            .filter(Predicate::new("amount", Operator::Between, json!([1, 2])))
            .order_by("name", Direction::Desc)
            .with_limit(5);
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["predicates"][0]["op"], "between");
        assert_eq!(json["sort"][0]["direction"], "desc");
        let parsed: QueryDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, q);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_sort_is_stable(keys in proptest::collection::vec(0u8..4, 0..40)) {
                let records: Vec<Record> = keys
                    .iter()
                    .enumerate()
                    .map(|(i, k)| rec(&format!("{i:03}"), json!({"k": k})))
                    .collect();

                let sorted = QueryDescriptor::new().order_by("k", Direction::Asc).apply(records);

                for pair in sorted.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    let (ka, kb) = (a.get("k").unwrap().as_u64(), b.get("k").unwrap().as_u64());
                    prop_assert!(ka <= kb);
                    if ka == kb {
                        prop_assert!(a.id < b.id);
                    }
                }
            }

            #[test]
            fn prop_limit_offset_window(len in 0usize..30, offset in 0usize..35, limit in 0usize..35) {
                let records: Vec<Record> = (0..len).map(|i| rec(&i.to_string(), json!({}))).collect();
                let out = QueryDescriptor::new().with_offset(offset).with_limit(limit).apply(records);
                prop_assert_eq!(out.len(), len.saturating_sub(offset).min(limit));
            }
        }
    }
}
