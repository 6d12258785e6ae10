//! Command stacks for undo and redo.
//!
//! The manager only keeps the stacks. Applying a command is the store's job:
//! it replays [`CommandOp`]s through the normal mutation path with auditing
//! and command recording switched off.
//!
//! State machine reported by [`UndoManager::state`]:
//!
//! ```text
//! Idle --push--> CommandPushed --undo--> Undone <--redo/undo--> Redone
//!                     ^                                           |
//!                     +------------------push---------------------+
//! ```

use crate::record::Record;
use crate::{CollectionName, Error, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// A state transition of one record, with both sides kept so it can be
/// inverted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommandOp {
    Insert { after: Record },
    Update { before: Record, after: Record },
    Remove { before: Record, after: Record },
    Restore { before: Record, after: Record },
    /// Physical removal; only ever the inverse of an insert
    Purge { before: Record },
}

impl CommandOp {
    /// The operation that undoes this one.
    pub fn inverse(&self) -> CommandOp {
        match self {
            CommandOp::Insert { after } => CommandOp::Purge {
                before: after.clone(),
            },
            CommandOp::Purge { before } => CommandOp::Insert {
                after: before.clone(),
            },
            CommandOp::Update { before, after } => CommandOp::Update {
                before: after.clone(),
                after: before.clone(),
            },
            CommandOp::Remove { before, after } => CommandOp::Restore {
                before: after.clone(),
                after: before.clone(),
            },
            CommandOp::Restore { before, after } => CommandOp::Remove {
                before: after.clone(),
                after: before.clone(),
            },
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            CommandOp::Insert { after } => &after.id,
            CommandOp::Purge { before }
            | CommandOp::Update { before, .. }
            | CommandOp::Remove { before, .. }
            | CommandOp::Restore { before, .. } => &before.id,
        }
    }
}

/// A reversible unit of work on one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub collection: CollectionName,
    pub op: CommandOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl Command {
    pub fn new(collection: impl Into<CollectionName>, op: CommandOp, batch_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            collection: collection.into(),
            op,
            batch_id,
        }
    }

    pub fn record_id(&self) -> &str {
        self.op.record_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UndoState {
    #[default]
    Idle,
    CommandPushed,
    Undone,
    Redone,
}

/// Outcome of [`crate::Store::undo_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchUndoReport {
    pub batch_id: String,
    /// Records whose commands were reverted
    pub reverted: Vec<RecordId>,
    /// Records whose commands could not be reverted; they stay on the undo
    /// stack
    pub failed: Vec<(RecordId, Error)>,
}

impl BatchUndoReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Bounded undo stack plus redo stack.
///
/// Both stacks hold steps. A step is every command of one mutation, stored
/// oldest first: consecutive commands sharing a batch id join the same
/// step, so a cascade, a transaction or a bulk operation is undone as one.
/// `max_depth` counts steps, never individual commands.
#[derive(Debug)]
pub struct UndoManager {
    undo: VecDeque<Vec<Command>>,
    redo: Vec<Vec<Command>>,
    max_depth: usize,
    state: UndoState,
}

impl UndoManager {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            max_depth: max_depth.max(1),
            state: UndoState::Idle,
        }
    }

    /// Record a fresh command. Clears the redo stack.
    pub fn push(&mut self, command: Command) {
        self.redo.clear();
        let joins_top = command.batch_id.is_some()
            && self
                .undo
                .back()
                .and_then(|step| step.last())
                .is_some_and(|last| last.batch_id == command.batch_id);
        match self.undo.back_mut() {
            Some(step) if joins_top => step.push(command),
            _ => self.push_step(vec![command]),
        }
        self.state = UndoState::CommandPushed;
    }

    fn push_step(&mut self, step: Vec<Command>) {
        if step.is_empty() {
            return;
        }
        self.undo.push_back(step);
        while self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Vec<Command>> {
        self.undo.pop_back()
    }

    /// Put a step back after a failed undo.
    pub(crate) fn restore_undo(&mut self, step: Vec<Command>) {
        self.push_step(step);
    }

    /// File reverted commands, oldest first, as one redo step.
    pub(crate) fn push_undone(&mut self, step: Vec<Command>) {
        if !step.is_empty() {
            self.redo.push(step);
        }
        self.state = UndoState::Undone;
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Vec<Command>> {
        self.redo.pop()
    }

    /// Put a redo step back after a failed redo.
    pub(crate) fn restore_redo(&mut self, step: Vec<Command>) {
        self.redo.push(step);
    }

    /// Move a re-applied step back onto the undo stack, keeping redo.
    pub(crate) fn push_redone(&mut self, step: Vec<Command>) {
        self.push_step(step);
        self.state = UndoState::Redone;
    }

    /// Commands of a batch, newest first.
    pub(crate) fn batch(&self, batch_id: &str) -> Vec<Command> {
        self.undo
            .iter()
            .rev()
            .flat_map(|step| step.iter().rev())
            .filter(|c| c.batch_id.as_deref() == Some(batch_id))
            .cloned()
            .collect()
    }

    /// Drop commands from the undo stack by id. Emptied steps go too.
    pub(crate) fn remove(&mut self, ids: &[String]) {
        for step in self.undo.iter_mut() {
            step.retain(|c| !ids.contains(&c.id));
        }
        self.undo.retain(|step| !step.is_empty());
    }

    pub fn state(&self) -> UndoState {
        self.state
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Number of undo steps.
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }

    /// Newest command on the undo stack.
    pub fn peek(&self) -> Option<&Command> {
        self.undo.back().and_then(|step| step.last())
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.state = UndoState::Idle;
    }
}
