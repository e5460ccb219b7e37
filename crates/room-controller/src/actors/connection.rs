//! `ConnectionActor` - per-socket outbound delivery.
//!
//! Each `ConnectionActor`:
//! - Belongs to exactly one joined socket and one room
//! - Forwards frames from the room (broadcasts) and the dispatcher (replies)
//!   to the socket writer in one order
//! - Absorbs a slow client so the room never waits on a socket
//!
//! # Lifecycle
//!
//! 1. Spawned by `RoomActor` when a join is accepted
//! 2. Runs until evicted, the socket writer goes away, or every handle is
//!    dropped
//! 3. Cancellation via child token propagates from `RoomActor`

use crate::errors::RcError;
use crate::signaling::protocol::{OutboundFrame, ServerEvent};

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
    user_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue a frame without waiting. A full mailbox drops the frame.
    ///
    /// Returns whether the frame was queued.
    pub fn deliver(&self, frame: OutboundFrame) -> bool {
        match self.sender.try_send(ConnectionMessage::Deliver { frame }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame, waiting for mailbox space.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), RcError> {
        self.sender
            .send(ConnectionMessage::Deliver { frame })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Notify the client and stop the actor.
    pub fn evict(&self, reason: impl Into<String>) {
        let message = ConnectionMessage::Evict {
            reason: reason.into(),
        };
        if self.sender.try_send(message).is_err() {
            self.cancel_token.cancel();
        }
    }

    pub async fn ping(&self) -> Result<(), RcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ConnectionMessage::Ping { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Frames dropped because this socket fell behind.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.mailbox.messages_dropped()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    user_id: String,
    session_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Socket writer.
    outbound: mpsc::Sender<OutboundFrame>,
    /// Child of the room's token.
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        user_id: String,
        session_id: String,
        outbound: mpsc::Sender<OutboundFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        let actor = Self {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            session_id,
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            user_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "rc.actor.connection",
        fields(
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            session_id = %self.session_id
        )
    )]
    async fn run(mut self) {
        debug!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            session_id = %self.session_id,
            "ConnectionActor started"
        );
        self.metrics.connection_created();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rc.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "rc.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.connection_closed();
        info!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { frame } => !self.forward(frame).await,

            ConnectionMessage::Evict { reason } => {
                debug!(
                    target: "rc.actor.connection",
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Evicting connection"
                );
                self.forward(OutboundFrame::push(ServerEvent::Evicted { reason }))
                    .await;
                true
            }

            ConnectionMessage::Ping { respond_to } => {
                let _ = respond_to.send(());
                false
            }
        }
    }

    /// Hand a frame to the socket writer. Returns false once the writer is
    /// gone or the actor is cancelled mid-send.
    async fn forward(&mut self, frame: OutboundFrame) -> bool {
        tokio::select! {
            result = self.outbound.send(frame) => {
                if result.is_err() {
                    debug!(
                        target: "rc.actor.connection",
                        connection_id = %self.connection_id,
                        "Socket writer closed"
                    );
                    return false;
                }
                true
            }
            () = self.cancel_token.cancelled() => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn(
        buffer: usize,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::Receiver<OutboundFrame>,
        Arc<ActorMetrics>,
    ) {
        let (tx, rx) = mpsc::channel(buffer);
        let metrics = ActorMetrics::new();
        let (handle, task) = ConnectionActor::spawn(
            "conn-1".to_string(),
            "u-1".to_string(),
            "s-1".to_string(),
            tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, task, rx, metrics)
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order() {
        let (handle, _task, mut rx, _metrics) = spawn(16);

        assert!(handle.deliver(OutboundFrame::push(ServerEvent::Pong)));
        handle
            .send(OutboundFrame::reply(
                ServerEvent::Ack { action: "ping" },
                Some("r-1".to_string()),
            ))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().event, ServerEvent::Pong);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.request_id.as_deref(), Some("r-1"));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_evict_sends_notice_then_stops() {
        let (handle, task, mut rx, metrics) = spawn(16);
        handle.ping().await.unwrap();
        assert_eq!(metrics.connection_count(), 1);

        handle.evict("Replaced by a newer connection");

        let frame = rx.recv().await.unwrap();
        assert!(frame.event.is_eviction());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_gone_stops_actor() {
        let (handle, task, rx, _metrics) = spawn(16);
        drop(rx);

        handle.deliver(OutboundFrame::push(ServerEvent::Pong));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.deliver(OutboundFrame::push(ServerEvent::Pong)));
    }

    #[tokio::test]
    async fn test_cancel_stops_actor_blocked_on_writer() {
        let (handle, task, _rx, _metrics) = spawn(1);

        // Writer holds one frame, the actor blocks forwarding the second.
        handle.deliver(OutboundFrame::push(ServerEvent::Pong));
        handle.deliver(OutboundFrame::push(ServerEvent::Pong));
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }
}
