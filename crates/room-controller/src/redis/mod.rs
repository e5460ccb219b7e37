//! Redis integration.
//!
//! Redis is optional. When `REDIS_URL` is set, every room mirrors its
//! participant presence and media flags so other instances can see them;
//! media handles never leave the owning process.

mod lua_scripts;
pub mod presence;

pub use presence::{FencedWrite, PresenceMirror, RedisPresenceMirror, RoomPresence};
