//! Actor model for the Room Controller.
//!
//! ```text
//! RoomRegistryActor (singleton per instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live session)
//!         ├── owns room state: participants, permissions, media, recording, whiteboard
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per session**: every mutation of a room runs on its actor task
//! - **CancellationToken propagation**: the registry hands each room a child token
//! - **Bounded fan-out**: room events reach sockets through `try_send`; a stuck
//!   socket loses frames instead of stalling the room
//! - **Message passing**: all inter-actor communication via `tokio::sync::mpsc`
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that supervises rooms
//! - [`room`] - `RoomActor` per live session
//! - [`connection`] - `ConnectionActor` per signaling socket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomDeps, RoomSettings};
