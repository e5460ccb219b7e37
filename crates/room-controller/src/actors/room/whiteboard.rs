//! Whiteboard relay, debounced persistence and chat.

use super::{Caller, RoomActor};
use crate::errors::RcError;
use crate::observability::metrics;
use crate::signaling::protocol::{DrawOp, EraseOp, ServerEvent, WhiteboardView};
use crate::whiteboard::{WhiteboardDocument, WhiteboardOp};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

/// Longest chat message accepted, in characters.
const MAX_CHAT_LENGTH: usize = 2000;

impl RoomActor {
    pub(super) fn whiteboard_draw(&mut self, caller: &Caller, op: DrawOp) {
        self.relay_whiteboard_op(
            caller,
            WhiteboardOp::Draw {
                element_id: op.element_id,
                element: op.element,
                user_id: caller.user_id.clone(),
            },
        );
    }

    pub(super) fn whiteboard_erase(&mut self, caller: &Caller, op: EraseOp) {
        self.relay_whiteboard_op(
            caller,
            WhiteboardOp::Erase {
                element_id: op.element_id,
                user_id: caller.user_id.clone(),
            },
        );
    }

    /// Relay to everyone else now; persist on the next flush.
    fn relay_whiteboard_op(&mut self, caller: &Caller, op: WhiteboardOp) {
        let event = match &op {
            WhiteboardOp::Draw { .. } => ServerEvent::WhiteboardDraw { op: op.clone() },
            WhiteboardOp::Erase { .. } => ServerEvent::WhiteboardErase { op: op.clone() },
        };
        self.broadcast(&event, Some(&caller.connection_id));

        if self.whiteboard_id().is_some() {
            self.whiteboard.push(op);
        }
    }

    fn whiteboard_id(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.whiteboard_id.clone())
    }

    async fn load_document(&mut self, whiteboard_id: &str) -> Result<WhiteboardDocument, RcError> {
        if let Some(document) = self.document.as_ref().filter(|d| d.id == whiteboard_id) {
            return Ok(document.clone());
        }
        let document = self.deps.collaborators.whiteboards.load(whiteboard_id).await?;
        self.document = Some(document.clone());
        Ok(document)
    }

    /// Fold the queued ops into the document as one undo step. A failed
    /// save puts the batch back for the next attempt.
    pub(super) async fn flush_whiteboard(&mut self) -> Result<(), RcError> {
        if self.whiteboard.is_empty() {
            return Ok(());
        }
        let Some(whiteboard_id) = self.whiteboard_id() else {
            self.whiteboard.take();
            return Ok(());
        };

        let batch = self.whiteboard.take();
        let ops = batch.len();
        let result = self.save_batch(&whiteboard_id, batch.clone()).await;
        if let Err(e) = result {
            self.whiteboard.requeue(batch);
            return Err(e);
        }

        metrics::record_whiteboard_flush(ops);
        debug!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            whiteboard_id = %whiteboard_id,
            ops,
            "Whiteboard flushed"
        );
        Ok(())
    }

    async fn save_batch(
        &mut self,
        whiteboard_id: &str,
        batch: Vec<WhiteboardOp>,
    ) -> Result<(), RcError> {
        let mut document = self.load_document(whiteboard_id).await?;
        if !document.apply_batch(batch, self.deps.settings.whiteboard_undo_limit) {
            return Ok(());
        }
        self.deps.collaborators.whiteboards.save(&document).await?;
        self.document = Some(document);
        Ok(())
    }

    /// Undo or redo one flushed batch and push the result to everyone.
    pub(super) async fn whiteboard_history(&mut self, redo: bool) -> Result<(), RcError> {
        let whiteboard_id = self
            .whiteboard_id()
            .ok_or_else(|| RcError::not_found("whiteboard", &self.session_id))?;
        self.flush_whiteboard().await?;

        let mut document = self.load_document(&whiteboard_id).await?;
        let changed = if redo {
            document.redo(self.deps.settings.whiteboard_undo_limit)
        } else {
            document.undo()
        };
        if !changed {
            return Ok(());
        }

        self.deps.collaborators.whiteboards.save(&document).await?;
        let view = view_of(&document, Vec::new());
        self.document = Some(document);

        let event = if redo {
            ServerEvent::WhiteboardRedo(view)
        } else {
            ServerEvent::WhiteboardUndo(view)
        };
        self.broadcast(&event, None);
        Ok(())
    }

    pub(super) async fn whiteboard_save(&mut self) -> Result<ServerEvent, RcError> {
        let whiteboard_id = self
            .whiteboard_id()
            .ok_or_else(|| RcError::not_found("whiteboard", &self.session_id))?;
        self.flush_whiteboard().await?;
        let document = self.load_document(&whiteboard_id).await?;
        Ok(ServerEvent::WhiteboardSaved {
            version: document.version,
        })
    }

    /// Current board for a joining socket: the stored canvas plus ops still
    /// waiting for the next flush.
    pub(super) async fn whiteboard_view(&mut self) -> Option<WhiteboardView> {
        let whiteboard_id = self.whiteboard_id()?;
        match self.load_document(&whiteboard_id).await {
            Ok(document) => Some(view_of(&document, self.whiteboard.pending().to_vec())),
            Err(e) => {
                warn!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    whiteboard_id = %whiteboard_id,
                    error = %e,
                    "Failed to load whiteboard"
                );
                None
            }
        }
    }

    pub(super) fn chat(&mut self, caller: &Caller, text: &str) -> Result<(), RcError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RcError::Validation("Message is empty".to_string()));
        }
        if text.chars().count() > MAX_CHAT_LENGTH {
            return Err(RcError::Validation(format!(
                "Message exceeds {MAX_CHAT_LENGTH} characters"
            )));
        }

        self.broadcast(
            &ServerEvent::ChatMessage {
                user_id: caller.user_id.clone(),
                display_name: caller.display_name.clone(),
                text: text.to_string(),
                sent_at: Utc::now(),
            },
            None,
        );
        Ok(())
    }
}

fn view_of(document: &WhiteboardDocument, pending: Vec<WhiteboardOp>) -> WhiteboardView {
    WhiteboardView {
        whiteboard_id: document.id.clone(),
        canvas: Value::Object(
            document
                .canvas
                .iter()
                .map(|(id, element)| (id.clone(), element.clone()))
                .collect(),
        ),
        version: document.version,
        pending,
    }
}
