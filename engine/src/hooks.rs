//! Mutation hooks and change observers.
//!
//! Hooks are keyed by a typed [`HookPoint`]. A `Before` hook sees the record
//! as it is about to be written and may veto the mutation. An `After` hook
//! runs once the write is committed; its errors are logged and dropped.
//!
//! Observers receive a [`ChangeEvent`] for every committed mutation, in
//! commit order. They are registered through `on_change` and stay active
//! until the returned [`Subscription`] is dropped or unsubscribed.

use crate::record::Record;
use crate::{CollectionName, RecordId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// When a hook runs relative to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Before,
    After,
}

/// Kind of committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Insert,
    Update,
    /// Soft delete
    Delete,
    Restore,
    /// Physical removal, only produced by undoing an insert or by a
    /// replacing import
    Purge,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::Restore => "restore",
            MutationKind::Purge => "purge",
        };
        f.write_str(name)
    }
}

/// Where a hook attaches: phase, operation and collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookPoint {
    pub phase: HookPhase,
    pub op: MutationKind,
    pub collection: CollectionName,
}

impl HookPoint {
    pub fn before(op: MutationKind, collection: impl Into<CollectionName>) -> Self {
        Self {
            phase: HookPhase::Before,
            op,
            collection: collection.into(),
        }
    }

    pub fn after(op: MutationKind, collection: impl Into<CollectionName>) -> Self {
        Self {
            phase: HookPhase::After,
            op,
            collection: collection.into(),
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            HookPhase::Before => "before",
            HookPhase::After => "after",
        };
        write!(f, "{phase}.{}.{}", self.op, self.collection)
    }
}

/// What a hook is told about the mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext<'a> {
    pub collection: &'a str,
    pub record_id: &'a str,
    pub op: MutationKind,
    pub before: Option<&'a Record>,
    pub after: Option<&'a Record>,
    /// Undo or redo replay
    pub replay: bool,
}

type HookFn = dyn for<'a> Fn(&HookContext<'a>) -> Result<(), String> + Send + Sync;

/// Handle returned by [`HookRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

/// Dispatch table from hook point to hooks, in registration order.
#[derive(Default)]
pub struct HookRegistry {
    next_id: AtomicU64,
    table: DashMap<HookPoint, Vec<(HookId, Arc<HookFn>)>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("points", &self.table.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, point: HookPoint, hook: F) -> HookId
    where
        F: for<'a> Fn(&HookContext<'a>) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let hook: Arc<HookFn> = Arc::new(hook);
        self.table.entry(point).or_default().push((id, hook));
        id
    }

    /// Remove a hook. Returns whether it was registered.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut found = false;
        for mut entry in self.table.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|(hook_id, _)| *hook_id != id);
            found |= entry.value().len() != before;
        }
        found
    }

    fn hooks_for(&self, point: &HookPoint) -> Vec<Arc<HookFn>> {
        self.table
            .get(point)
            .map(|hooks| hooks.iter().map(|(_, hook)| Arc::clone(hook)).collect())
            .unwrap_or_default()
    }

    /// Run `before` hooks; the first error vetoes.
    pub(crate) fn run_before(&self, ctx: &HookContext<'_>) -> Result<(), (HookPoint, String)> {
        let point = HookPoint::before(ctx.op, ctx.collection);
        for hook in self.hooks_for(&point) {
            hook(ctx).map_err(|reason| (point.clone(), reason))?;
        }
        Ok(())
    }

    /// Run `after` hooks; errors are logged.
    pub(crate) fn run_after(&self, ctx: &HookContext<'_>) {
        let point = HookPoint::after(ctx.op, ctx.collection);
        for hook in self.hooks_for(&point) {
            if let Err(reason) = hook(ctx) {
                tracing::warn!(hook = %point, id = ctx.record_id, %reason, "after hook failed");
            }
        }
    }
}

/// A committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub operation: MutationKind,
    pub before: Option<Record>,
    pub after: Option<Record>,
    /// Batch the change belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

type ObserverFn = dyn Fn(&ChangeEvent) + Send + Sync;

struct Observer {
    /// Only events from this collection; all when `None`
    collection: Option<CollectionName>,
    handler: Arc<ObserverFn>,
}

/// Registered change observers.
#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    handlers: DashMap<u64, Observer>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.handlers.len())
            .finish()
    }
}

impl Observers {
    pub(crate) fn subscribe<F>(self: &Arc<Self>, collection: Option<CollectionName>, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(
            id,
            Observer {
                collection,
                handler: Arc::new(handler),
            },
        );
        Subscription {
            id,
            observers: Arc::downgrade(self),
            active: true,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver one event to every interested observer, oldest subscription
    /// first. Handlers run without any table lock held, so they may
    /// subscribe or unsubscribe.
    pub(crate) fn emit(&self, event: &ChangeEvent) {
        let mut targets: Vec<(u64, Arc<ObserverFn>)> = self
            .handlers
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .collection
                    .as_ref()
                    .map_or(true, |c| *c == event.collection)
            })
            .map(|entry| (*entry.key(), Arc::clone(&entry.value().handler)))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        for (_, handler) in targets {
            handler(event);
        }
    }
}

/// Keeps an observer registered. Dropping it unsubscribes.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the observer for the lifetime of the store.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(observers) = self.observers.upgrade() {
            observers.handlers.remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
