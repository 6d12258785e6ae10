//! Record types for storing data.

use crate::schema::CollectionSchema;
use crate::{RecordId, SchemaVersion, Timestamp, Version};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names owned by the engine. Callers cannot set these through data or
/// patches.
pub const RESERVED_FIELDS: [&str; 6] = [
    "id",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "version",
    "schemaVersion",
];

/// Field map of a record, excluding the metadata envelope.
pub type Fields = Map<String, Value>;

/// A stored record.
///
/// Serializes as one flat JSON object: the metadata envelope plus every field,
/// including fields the collection schema does not know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique, immutable identifier
    pub id: RecordId,
    /// When the record was first inserted (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last mutated
    pub updated_at: Timestamp,
    /// Soft delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
    /// Incremented by exactly one on every mutation
    pub version: Version,
    /// Schema version the fields were written under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<SchemaVersion>,
    /// Domain fields
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    /// Create a new record at version 1.
    pub fn new(id: impl Into<RecordId>, fields: Fields, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            deleted_at: None,
            version: 1,
            schema_version: None,
            fields: strip_reserved(fields),
        }
    }

    /// Check if record is active (not soft-deleted).
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Resolve a field for query evaluation, including envelope fields.
    ///
    /// Dotted paths descend into nested objects.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        match path {
            "id" => return Some(Value::String(self.id.clone())),
            "createdAt" => return Some(self.created_at.into()),
            "updatedAt" => return Some(self.updated_at.into()),
            "deletedAt" => return self.deleted_at.map(Value::from),
            "version" => return Some(self.version.into()),
            _ => {}
        }

        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    /// Merge a patch into the fields and bump metadata.
    pub fn apply_patch(&mut self, patch: &Fields, timestamp: Timestamp) {
        for (key, value) in patch {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
        self.touch(timestamp);
    }

    /// Replace the whole field map and bump metadata.
    pub fn replace_fields(&mut self, fields: Fields, timestamp: Timestamp) {
        self.fields = strip_reserved(fields);
        self.touch(timestamp);
    }

    /// Mark record as deleted.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted_at = Some(timestamp);
        self.touch(timestamp);
    }

    /// Clear the deletion marker.
    pub fn mark_restored(&mut self, timestamp: Timestamp) {
        self.deleted_at = None;
        self.touch(timestamp);
    }

    fn touch(&mut self, timestamp: Timestamp) {
        self.version += 1;
        self.updated_at = timestamp;
    }

    /// Fields present on the record but not declared by the schema.
    pub fn extra_fields(&self, schema: &CollectionSchema) -> Fields {
        self.fields
            .iter()
            .filter(|(name, _)| schema.field(name).is_none())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Deserialize the field map into a domain type.
    pub fn decode<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// The record as a flat JSON object.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Turn arbitrary JSON into a field map, rejecting non-objects.
pub fn fields_from_value(value: Value) -> Option<Fields> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn strip_reserved(mut fields: Fields) -> Fields {
    for key in RESERVED_FIELDS {
        fields.remove(key);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        fields_from_value(value).unwrap()
    }

    #[test]
    fn create_record() {
        let record = Record::new("c-1", fields(json!({"name": "Acme"})), 1000);

        assert_eq!(record.id, "c-1");
        assert_eq!(record.version, 1);
        assert_eq!(record.created_at, 1000);
        assert_eq!(record.updated_at, 1000);
        assert!(record.is_active());
        assert_eq!(record.get("name"), Some(&json!("Acme")));
    }

    #[test]
    fn new_strips_envelope_fields_from_data() {
        let record = Record::new(
            "c-1",
            fields(json!({"name": "Acme", "version": 77, "createdAt": 5})),
            1000,
        );
        assert_eq!(record.version, 1);
        assert_eq!(record.created_at, 1000);
        assert!(!record.fields.contains_key("version"));
    }

    #[test]
    fn patch_bumps_version_and_keeps_other_fields() {
        let mut record = Record::new("c-1", fields(json!({"name": "Acme", "city": "Oslo"})), 1000);
        record.apply_patch(&fields(json!({"name": "Acme Corp", "id": "hijack"})), 2000);

        assert_eq!(record.id, "c-1");
        assert_eq!(record.version, 2);
        assert_eq!(record.updated_at, 2000);
        assert_eq!(record.created_at, 1000);
        assert_eq!(record.get("name"), Some(&json!("Acme Corp")));
        assert_eq!(record.get("city"), Some(&json!("Oslo")));
    }

    #[test]
    fn delete_and_restore() {
        let mut record = Record::new("c-1", fields(json!({"name": "Acme"})), 1000);
        record.mark_deleted(2000);
        assert!(!record.is_active());
        assert_eq!(record.deleted_at, Some(2000));
        assert_eq!(record.version, 2);

        record.mark_restored(3000);
        assert!(record.is_active());
        assert_eq!(record.version, 3);
    }

    #[test]
    fn serializes_flat_and_preserves_unknown_fields() {
        let raw = json!({
            "id": "c-1",
            "createdAt": 1000,
            "updatedAt": 1500,
            "version": 3,
            "name": "Acme",
            "legacyCode": {"nested": [1, 2, 3]}
        });

        let record: Record = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(record.deleted_at, None);
        assert_eq!(record.get("legacyCode"), Some(&json!({"nested": [1, 2, 3]})));

        assert_eq!(serde_json::to_value(&record).unwrap(), raw);
    }

    #[test]
    fn lookup_envelope_and_nested_paths() {
        let record = Record::new(
            "c-1",
            fields(json!({"address": {"city": "Bergen"}})),
            1000,
        );
        assert_eq!(record.lookup("id"), Some(json!("c-1")));
        assert_eq!(record.lookup("version"), Some(json!(1)));
        assert_eq!(record.lookup("address.city"), Some(json!("Bergen")));
        assert_eq!(record.lookup("address.zip"), None);
        assert_eq!(record.lookup("deletedAt"), None);
    }

    #[test]
    fn extra_fields_against_schema() {
        let schema = crate::schema::CollectionSchema::new(
            "clients",
            vec![FieldDef::required("name", FieldType::String)],
        );
        let record = Record::new("c-1", fields(json!({"name": "Acme", "fax": "n/a"})), 1000);

        assert_eq!(record.extra_fields(&schema), fields(json!({"fax": "n/a"})));
    }

    #[test]
    fn decode_into_domain_type() {
        #[derive(Deserialize)]
        struct Client {
            name: String,
        }

        let record = Record::new("c-1", fields(json!({"name": "Acme", "fax": 1})), 1000);
        let client: Client = record.decode().unwrap();
        assert_eq!(client.name, "Acme");
    }
}
