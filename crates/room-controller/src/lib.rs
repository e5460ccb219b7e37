//! Room Controller (RC) Service Library
//!
//! This library provides the core of the Classroom Live room controller - a
//! stateful WebSocket signaling server that turns an unordered stream of
//! client messages into a consistent model of each live session:
//!
//! - Who is in the room, and which socket is the authoritative streamer
//! - What media each participant may send (permission negotiation)
//! - How media is routed through the external SFU and recorded
//! - How whiteboard edits are relayed and persisted
//! - How everything is torn down when the last socket leaves
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton per RC instance)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live session)
//!         ├── owns room state, media handles, recording, whiteboard buffer
//!         └── supervises N ConnectionActors
//!             └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per session**: handlers for one session never interleave
//! - **Closed source tags**: every producer carries a [`media::MediaSource`];
//!   permission and cleanup rules match it exhaustively
//! - **Local media handles**: producers/transports/consumers never leave the
//!   owning process; only presence is mirrored to Redis
//! - **Degrade, don't fail**: recording stop always answers, flagging a
//!   degraded artifact when the transcoder or upload failed
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`signaling`] - Wire protocol, dispatcher and WebSocket endpoint
//! - [`media`] - Media capability provider adapter
//! - [`permissions`] - Permission negotiation state machine
//! - [`recording`] - Recording pipeline
//! - [`whiteboard`] - Whiteboard op buffer and document model
//! - [`collaborators`] - Platform, storage and identity contracts
//! - [`redis`] - Optional presence mirror
//! - [`observability`] - Health endpoints and metrics
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-safe codes

pub mod actors;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod permissions;
pub mod recording;
pub mod redis;
pub mod signaling;
pub mod whiteboard;
