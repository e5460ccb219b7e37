//! Signaling Dispatcher.
//!
//! - [`protocol`] - JSON wire format of inbound and outbound frames
//! - [`dispatcher`] - per-socket routing of frames to the room actors
//! - [`websocket`] - axum `GET /ws` endpoint

pub mod dispatcher;
pub mod protocol;
pub mod websocket;

pub use dispatcher::{SignalingContext, SignalingDispatcher};
pub use websocket::signaling_router;
