//! # RC Test Utilities
//!
//! Shared test utilities for the Room Controller (RC) service.
//!
//! This crate runs the real actor tree and signaling dispatcher over the
//! in-memory platform, the mock media engine and the mock transcoder, so
//! integration tests exercise whole message flows without a network.
//!
//! ## Modules
//!
//! - `fixtures` - Session records and users
//! - `tokens` - Signed HS256 user access tokens
//! - `harness` - `TestRoomController` and `TestSocket`
//! - `server` - `TestSignalingServer` for real WebSocket clients
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let session = TestSession::new("s-1").build();
//!     let rc = TestRoomController::start(vec![session]);
//!
//!     let mut streamer = rc.connect();
//!     let joined = streamer.join(&TestUser::streamer().token(), "s-1").await;
//!     assert_eq!(joined["event"], "joined_room");
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod server;
pub mod tokens;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use server::*;
pub use tokens::*;
