//! Whiteboard op buffer and document model.
//!
//! Draw/erase ops are relayed immediately by the room actor and queued
//! here. The queue is flushed in one batch when the debounce deadline set by
//! the first queued op passes, on explicit save, and on room teardown.
//! A flush appends the batch to the document, pushes the prior op list onto
//! the bounded undo stack and clears the redo stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tokio::time::{Duration, Instant};

/// One whiteboard operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WhiteboardOp {
    /// Insert or replace an element.
    #[serde(rename_all = "camelCase")]
    Draw {
        element_id: String,
        element: Value,
        user_id: String,
    },
    /// Remove an element.
    #[serde(rename_all = "camelCase")]
    Erase { element_id: String, user_id: String },
}

impl WhiteboardOp {
    #[must_use]
    pub fn element_id(&self) -> &str {
        match self {
            WhiteboardOp::Draw { element_id, .. } | WhiteboardOp::Erase { element_id, .. } => {
                element_id
            }
        }
    }
}

/// Persisted whiteboard document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardDocument {
    pub id: String,
    #[serde(default)]
    pub operations: Vec<WhiteboardOp>,
    /// Element id -> element, derived from `operations`.
    #[serde(default)]
    pub canvas: BTreeMap<String, Value>,
    #[serde(default)]
    pub undo_stack: VecDeque<Vec<WhiteboardOp>>,
    #[serde(default)]
    pub redo_stack: Vec<Vec<WhiteboardOp>>,
    #[serde(default)]
    pub version: u64,
}

impl WhiteboardDocument {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Append a batch. Returns false (and changes nothing) for an empty batch.
    pub fn apply_batch(&mut self, batch: Vec<WhiteboardOp>, undo_limit: usize) -> bool {
        if batch.is_empty() {
            return false;
        }

        self.push_undo(self.operations.clone(), undo_limit);
        self.redo_stack.clear();
        for op in &batch {
            apply(&mut self.canvas, op);
        }
        self.operations.extend(batch);
        self.version += 1;
        true
    }

    /// Restore the previous op list. Returns false when there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(previous) = self.undo_stack.pop_back() else {
            return false;
        };
        let current = std::mem::replace(&mut self.operations, previous);
        self.redo_stack.push(current);
        self.rebuild_canvas();
        self.version += 1;
        true
    }

    /// Re-apply the last undone op list. Returns false when there is nothing to redo.
    pub fn redo(&mut self, undo_limit: usize) -> bool {
        let Some(next) = self.redo_stack.pop() else {
            return false;
        };
        let current = std::mem::replace(&mut self.operations, next);
        self.push_undo(current, undo_limit);
        self.rebuild_canvas();
        self.version += 1;
        true
    }

    fn push_undo(&mut self, snapshot: Vec<WhiteboardOp>, undo_limit: usize) {
        self.undo_stack.push_back(snapshot);
        while self.undo_stack.len() > undo_limit {
            self.undo_stack.pop_front();
        }
    }

    fn rebuild_canvas(&mut self) {
        self.canvas.clear();
        for op in &self.operations {
            apply(&mut self.canvas, op);
        }
    }
}

fn apply(canvas: &mut BTreeMap<String, Value>, op: &WhiteboardOp) {
    match op {
        WhiteboardOp::Draw {
            element_id,
            element,
            ..
        } => {
            canvas.insert(element_id.clone(), element.clone());
        }
        WhiteboardOp::Erase { element_id, .. } => {
            canvas.remove(element_id);
        }
    }
}

/// Pending ops of one room plus the debounce deadline.
#[derive(Debug)]
pub struct WhiteboardBuffer {
    pending: Vec<WhiteboardOp>,
    deadline: Option<Instant>,
    flush_after: Duration,
}

impl WhiteboardBuffer {
    #[must_use]
    pub fn new(flush_after: Duration) -> Self {
        Self {
            pending: Vec::new(),
            deadline: None,
            flush_after,
        }
    }

    /// Queue an op. The first op of a batch arms the deadline; later ops
    /// do not move it.
    pub fn push(&mut self, op: WhiteboardOp) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.flush_after);
        }
        self.pending.push(op);
    }

    /// Put a batch back at the front of the queue after a failed save.
    pub fn requeue(&mut self, mut batch: Vec<WhiteboardOp>) {
        if batch.is_empty() {
            return;
        }
        batch.append(&mut self.pending);
        self.pending = batch;
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.flush_after);
        }
    }

    /// Ops queued but not yet flushed.
    #[must_use]
    pub fn pending(&self) -> &[WhiteboardOp] {
        &self.pending
    }

    /// Take the queued batch and disarm the deadline.
    pub fn take(&mut self) -> Vec<WhiteboardOp> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
