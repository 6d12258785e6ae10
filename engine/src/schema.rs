//! Schema definition and validation.
//!
//! Schemas define the structure of collections and enable validation of
//! records before they are written. Validation collects every violation
//! instead of stopping at the first one.

use crate::record::Fields;
use crate::{CollectionName, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Owner assigned to schemas registered without an explicit owner.
pub const DEFAULT_OWNER: &str = "core";

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    Array,
    Object,
    /// Arbitrary nested JSON
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Array => "Array",
            FieldType::Object => "Object",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Json => true,
        }
    }
}

/// Optional value constraints on a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    /// Allowed values (enum membership)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    /// Inclusive numeric lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Minimum length of strings (chars) and arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Maximum length of strings (chars) and arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Value constraints
    #[serde(default)]
    pub constraints: Constraints,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            constraints: Constraints::default(),
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            constraints: Constraints::default(),
        }
    }

    /// Restrict the field to a fixed set of values.
    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.constraints.one_of = Some(values.into_iter().collect());
        self
    }

    /// Inclusive numeric range.
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.min = min;
        self.constraints.max = max;
        self
    }

    /// Length bounds for strings and arrays.
    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.constraints.min_length = min;
        self.constraints.max_length = max;
        self
    }

    /// Check a value against this definition, appending violations.
    pub fn check(&self, value: Option<&Value>, out: &mut Vec<Violation>) {
        let value = match value {
            None | Some(Value::Null) => {
                if self.required {
                    out.push(Violation::new(
                        &self.name,
                        ViolationKind::Missing,
                        "is required",
                    ));
                }
                return;
            }
            Some(v) => v,
        };

        if !self.field_type.accepts(value) {
            out.push(Violation::new(
                &self.name,
                ViolationKind::TypeMismatch,
                format!("expected {}, got {}", self.field_type, json_type_name(value)),
            ));
            return;
        }

        let c = &self.constraints;
        if let Some(allowed) = &c.one_of {
            if !allowed.contains(value) {
                out.push(Violation::new(
                    &self.name,
                    ViolationKind::NotInEnum,
                    format!("{value} is not one of the allowed values"),
                ));
            }
        }

        if let Some(n) = value.as_f64() {
            let below = c.min.is_some_and(|min| n < min);
            let above = c.max.is_some_and(|max| n > max);
            if below || above {
                out.push(Violation::new(
                    &self.name,
                    ViolationKind::OutOfRange,
                    format!("{n} is outside {}", describe_range(c.min, c.max)),
                ));
            }
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(len) = len {
            let short = c.min_length.is_some_and(|min| len < min);
            let long = c.max_length.is_some_and(|max| len > max);
            if short || long {
                out.push(Violation::new(
                    &self.name,
                    ViolationKind::Length,
                    format!(
                        "length {len} is outside {}",
                        describe_range(c.min_length.map(|v| v as f64), c.max_length.map(|v| v as f64))
                    ),
                ));
            }
        }
    }
}

fn describe_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("[{min}, {max}]"),
        (Some(min), None) => format!("[{min}, ..)"),
        (None, Some(max)) => format!("(.., {max}]"),
        (None, None) => "any range".to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Category of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViolationKind {
    Missing,
    TypeMismatch,
    NotInEnum,
    OutOfRange,
    Length,
    Custom,
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub field: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            kind,
            message: message.into(),
        }
    }
}

/// What happens to referencing records when the referenced record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadePolicy {
    /// Refuse the removal while active references exist
    #[default]
    Restrict,
    /// Soft-delete the referencing records too
    Cascade,
    /// Set the foreign key on referencing records to null
    Nullify,
}

/// Direction of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// `foreign_key` on this record holds the target id
    BelongsTo,
    /// `foreign_key` on target records holds this record's id
    HasMany,
}

/// A declared link between two collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Name under which included records are attached
    pub name: String,
    pub kind: RelationKind,
    pub target: CollectionName,
    pub foreign_key: String,
    #[serde(default)]
    pub on_delete: CascadePolicy,
}

impl Relation {
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<CollectionName>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::BelongsTo,
            target: target.into(),
            foreign_key: foreign_key.into(),
            on_delete: CascadePolicy::Restrict,
        }
    }

    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<CollectionName>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::HasMany,
            target: target.into(),
            foreign_key: foreign_key.into(),
            on_delete: CascadePolicy::Restrict,
        }
    }

    pub fn on_delete(mut self, policy: CascadePolicy) -> Self {
        self.on_delete = policy;
        self
    }
}

type ValidatorFn = dyn Fn(&Fields) -> Result<(), String> + Send + Sync;

/// A custom whole-record validation rule.
#[derive(Clone)]
pub struct Validator {
    /// Field reported on failure
    pub field: String,
    check: Arc<ValidatorFn>,
}

impl Validator {
    pub fn new<F>(field: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Fields) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("field", &self.field)
            .finish_non_exhaustive()
    }
}

/// Schema for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Module that owns the collection
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Current schema version
    #[serde(default = "default_version")]
    pub version: SchemaVersion,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Relations to other collections
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(skip)]
    validators: Vec<Validator>,
}

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

fn default_version() -> SchemaVersion {
    1
}

impl CollectionSchema {
    /// Create a new collection schema at version 1.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            owner: default_owner(),
            version: default_version(),
            fields,
            relations: Vec::new(),
            validators: Vec::new(),
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn at_version(mut self, version: SchemaVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a relation by its attach name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Validate a field map, returning every violation found.
    pub fn validate(&self, fields: &Fields) -> Vec<Violation> {
        validate(fields, self)
    }
}

/// Validate a record's fields against a schema.
///
/// Unknown fields are ignored, never reported.
pub fn validate(fields: &Fields, schema: &CollectionSchema) -> Vec<Violation> {
    let mut violations = Vec::new();
    for def in &schema.fields {
        def.check(fields.get(&def.name), &mut violations);
    }
    for validator in &schema.validators {
        if let Err(message) = (validator.check)(fields) {
            violations.push(Violation::new(
                &validator.field,
                ViolationKind::Custom,
                message,
            ));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn clients() -> CollectionSchema {
        CollectionSchema::new(
            "clients",
            vec![
                FieldDef::required("name", FieldType::String).length(Some(1), Some(40)),
                FieldDef::optional("status", FieldType::String)
                    .one_of([json!("active"), json!("archived")]),
                FieldDef::optional("creditLimit", FieldType::Float).range(Some(0.0), None),
                FieldDef::optional("employees", FieldType::Int),
            ],
        )
    }

    #[test]
    fn valid_payload_has_no_violations() {
        let schema = clients();
        assert!(schema.validate(&fields(json!({"name": "Acme"}))).is_empty());
        assert!(schema
            .validate(&fields(json!({"name": "Acme", "status": "active", "creditLimit": 10})))
            .is_empty());
    }

    #[test]
    fn collects_all_violations() {
        let schema = clients();
        let violations = schema.validate(&fields(json!({
            "status": "on-hold",
            "creditLimit": -5,
            "employees": "many"
        })));

        let kinds: Vec<_> = violations.iter().map(|v| (v.field.as_str(), v.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("name", ViolationKind::Missing),
                ("status", ViolationKind::NotInEnum),
                ("creditLimit", ViolationKind::OutOfRange),
                ("employees", ViolationKind::TypeMismatch),
            ]
        );
    }

    #[test]
    fn null_counts_as_missing_for_required() {
        let violations = clients().validate(&fields(json!({"name": null})));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Missing);
    }

    #[test]
    fn length_bounds() {
        let long = "x".repeat(41);
        let violations = clients().validate(&fields(json!({"name": long})));
        assert_eq!(violations[0].kind, ViolationKind::Length);

        let violations = clients().validate(&fields(json!({"name": ""})));
        assert_eq!(violations[0].kind, ViolationKind::Length);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let violations = clients().validate(&fields(json!({"name": "Acme", "fax": 12})));
        assert!(violations.is_empty());
    }

    #[test]
    fn custom_validator() {
        let schema = CollectionSchema::new(
            "invoices",
            vec![
                FieldDef::required("subtotal", FieldType::Float),
                FieldDef::required("total", FieldType::Float),
            ],
        )
        .with_validator(Validator::new("total", |f| {
            let subtotal = f.get("subtotal").and_then(Value::as_f64).unwrap_or(0.0);
            let total = f.get("total").and_then(Value::as_f64).unwrap_or(0.0);
            if total >= subtotal {
                Ok(())
            } else {
                Err("total must not be below subtotal".into())
            }
        }));

        assert!(schema
            .validate(&fields(json!({"subtotal": 10, "total": 12.5})))
            .is_empty());
        let violations = schema.validate(&fields(json!({"subtotal": 10, "total": 2})));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Custom);
        assert_eq!(violations[0].field, "total");
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Int.to_string(), "Int");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn schema_deserializes_with_defaults() {
        let schema: CollectionSchema = serde_json::from_value(json!({
            "name": "projects",
            "fields": [{"name": "title", "fieldType": "string", "required": true}],
            "relations": [{
                "name": "client",
                "kind": "belongsTo",
                "target": "clients",
                "foreignKey": "clientId"
            }]
        }))
        .unwrap();

        assert_eq!(schema.owner, DEFAULT_OWNER);
        assert_eq!(schema.version, 1);
        assert_eq!(schema.relations[0].on_delete, CascadePolicy::Restrict);
        assert!(schema.relation("client").is_some());
    }

    #[test]
    fn json_field_accepts_any() {
        let schema =
            CollectionSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        for value in [json!("s"), json!(1), json!(true), json!([1]), json!({"a": 1})] {
            assert!(schema.validate(&fields(json!({ "data": value }))).is_empty());
        }
    }
}
