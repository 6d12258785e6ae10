//! Traversal over self-referencing records.
//!
//! Hierarchies such as nested tasks or locations point at their parent
//! through a foreign key on the same collection. [`RecordArena`] indexes a
//! set of records by id and walks those links with a visited set, so bad
//! data with a parent loop fails with `CycleDetected` instead of spinning.

use crate::error::Result;
use crate::store::Collection;
use crate::{Error, Record, RecordId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Records keyed by id, linked through a parent field.
#[derive(Debug, Clone)]
pub struct RecordArena {
    records: HashMap<RecordId, Record>,
    parent_field: String,
}

impl RecordArena {
    pub fn new(records: impl IntoIterator<Item = Record>, parent_field: impl Into<String>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            parent_field: parent_field.into(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Parent id of a record. Null, missing, or dangling links end the walk.
    fn parent_of(&self, record: &Record) -> Option<&Record> {
        let id = match record.get(&self.parent_field)? {
            Value::String(id) => id.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        self.records.get(&id)
    }

    /// Ids from `id` up to its root, starting with `id` itself.
    pub fn path(&self, id: &str) -> Result<Vec<RecordId>> {
        let mut current = self.records.get(id).ok_or_else(|| Error::NotFound {
            collection: String::new(),
            id: id.to_string(),
        })?;

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        loop {
            if !visited.insert(current.id.as_str()) {
                return Err(Error::CycleDetected(current.id.clone()));
            }
            path.push(current.id.clone());
            match self.parent_of(current) {
                Some(parent) => current = parent,
                None => return Ok(path),
            }
        }
    }

    /// Number of ancestors above `id`; roots have depth 0.
    pub fn depth(&self, id: &str) -> Result<usize> {
        Ok(self.path(id)?.len() - 1)
    }

    /// Direct children of `id`, ordered by id.
    pub fn children(&self, id: &str) -> Vec<&Record> {
        let mut children: Vec<&Record> = self
            .records
            .values()
            .filter(|r| self.parent_of(r).is_some_and(|p| p.id == id))
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        children
    }
}

impl Collection {
    /// Live records of this collection arranged along `parent_field`.
    pub async fn arena(&self, parent_field: impl Into<String>) -> Result<RecordArena> {
        Ok(RecordArena::new(self.get_all().await?, parent_field))
    }
}
