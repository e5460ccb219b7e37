//! Presence mirror.
//!
//! Rooms are process-local; other instances and the HTTP layer learn who is
//! in a room (and with which media flags) from a JSON document mirrored to
//! Redis after every membership or flag change.
//!
//! # Key Patterns
//!
//! - `rc:presence:{session_id}` - presence document (JSON, expires after
//!   `ttl` unless refreshed)
//! - `rc:presence:{session_id}:generation` - generation of the room that
//!   last wrote the document; older generations are fenced off
//! - `rc:instance:{instance_id}:rooms` - sessions hosted by an instance (SET)

use super::lua_scripts;
use crate::errors::RcError;
use crate::signaling::protocol::ParticipantView;
use chrono::{DateTime, Utc};
use common::types::SessionStatus;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Default lifetime of a presence document without refresh.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(3600);

/// Mirrored state of one room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresence {
    pub status: Option<SessionStatus>,
    pub streamer_connected: bool,
    pub participants: Vec<ParticipantView>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a fenced write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FencedWrite {
    Applied,
    /// A newer room generation owns the document.
    Stale,
}

/// Presence sink. `generation` identifies the room incarnation; writes from
/// a generation older than the stored one are rejected as [`FencedWrite::Stale`].
#[async_trait::async_trait]
pub trait PresenceMirror: Send + Sync {
    async fn publish(
        &self,
        session_id: &str,
        generation: u64,
        presence: &RoomPresence,
    ) -> Result<FencedWrite, RcError>;

    /// Remove a room's document once the room is torn down.
    async fn clear(&self, session_id: &str, generation: u64) -> Result<FencedWrite, RcError>;
}

#[must_use]
pub fn presence_key(session_id: &str) -> String {
    format!("rc:presence:{session_id}")
}

#[must_use]
pub fn presence_generation_key(session_id: &str) -> String {
    format!("rc:presence:{session_id}:generation")
}

#[must_use]
pub fn instance_rooms_key(instance_id: &str) -> String {
    format!("rc:instance:{instance_id}:rooms")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredPresence<'a> {
    instance_id: &'a str,
    generation: u64,
    #[serde(flatten)]
    presence: &'a RoomPresence,
}

/// Redis-backed presence mirror.
///
/// Cheaply cloneable; the multiplexed connection is shared by every room.
#[derive(Clone)]
pub struct RedisPresenceMirror {
    connection: MultiplexedConnection,
    instance_id: String,
    ttl: Duration,
    publish_script: Script,
    clear_script: Script,
}

impl RedisPresenceMirror {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `RcError::Redis` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str, instance_id: impl Into<String>) -> Result<Self, RcError> {
        let client = Client::open(redis_url).map_err(|e| {
            // The URL may carry credentials; log only the error.
            error!(target: "rc.redis", error = %e, "Failed to open Redis client");
            RcError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "rc.redis", error = %e, "Failed to connect to Redis");
                RcError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            instance_id: instance_id.into(),
            ttl: DEFAULT_PRESENCE_TTL,
            publish_script: Script::new(lua_scripts::FENCED_PUBLISH),
            clear_script: Script::new(lua_scripts::FENCED_CLEAR),
        })
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Map a script result onto [`FencedWrite`].
fn fenced_outcome(result: i64, op: &str, session_id: &str) -> Result<FencedWrite, RcError> {
    match result {
        1 => Ok(FencedWrite::Applied),
        0 => {
            debug!(
                target: "rc.redis",
                session_id = %session_id,
                op,
                "Presence write fenced off by a newer room"
            );
            Ok(FencedWrite::Stale)
        }
        other => {
            error!(
                target: "rc.redis",
                session_id = %session_id,
                op,
                result = other,
                "Presence script rejected its arguments"
            );
            Err(RcError::Redis(format!("presence {op} script returned {other}")))
        }
    }
}

#[async_trait::async_trait]
impl PresenceMirror for RedisPresenceMirror {
    #[instrument(skip_all, fields(session_id = %session_id, generation = generation))]
    async fn publish(
        &self,
        session_id: &str,
        generation: u64,
        presence: &RoomPresence,
    ) -> Result<FencedWrite, RcError> {
        let mut conn = self.connection.clone();
        let body = serde_json::to_string(&StoredPresence {
            instance_id: &self.instance_id,
            generation,
            presence,
        })
        .map_err(|e| RcError::Internal(format!("serialize presence: {e}")))?;

        let result: i64 = self
            .publish_script
            .key(presence_generation_key(session_id))
            .key(presence_key(session_id))
            .key(instance_rooms_key(&self.instance_id))
            .arg(generation)
            .arg(body)
            .arg(self.ttl.as_secs())
            .arg(session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "rc.redis", error = %e, session_id = %session_id, "Failed to publish presence");
                RcError::Redis(format!("Failed to publish presence: {e}"))
            })?;

        let outcome = fenced_outcome(result, "publish", session_id)?;
        if outcome == FencedWrite::Applied {
            debug!(
                target: "rc.redis",
                session_id = %session_id,
                participants = presence.participants.len(),
                "Presence published"
            );
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(session_id = %session_id, generation = generation))]
    async fn clear(&self, session_id: &str, generation: u64) -> Result<FencedWrite, RcError> {
        let mut conn = self.connection.clone();

        let result: i64 = self
            .clear_script
            .key(presence_generation_key(session_id))
            .key(presence_key(session_id))
            .key(instance_rooms_key(&self.instance_id))
            .arg(generation)
            .arg(session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "rc.redis", error = %e, session_id = %session_id, "Failed to clear presence");
                RcError::Redis(format!("Failed to clear presence: {e}"))
            })?;

        let outcome = fenced_outcome(result, "clear", session_id)?;
        if outcome == FencedWrite::Applied {
            debug!(target: "rc.redis", session_id = %session_id, "Presence cleared");
        }
        Ok(outcome)
    }
}

/// In-memory presence mirror for tests. Fences by generation like Redis.
pub mod mock {
    use super::{FencedWrite, PresenceMirror, RoomPresence};
    use crate::errors::RcError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};

    #[derive(Debug, Default)]
    struct State {
        rooms: HashMap<String, RoomPresence>,
        generations: HashMap<String, u64>,
        publishes: usize,
        fail: bool,
    }

    impl State {
        fn admit(&mut self, session_id: &str, generation: u64) -> FencedWrite {
            match self.generations.get(session_id) {
                Some(current) if generation < *current => FencedWrite::Stale,
                _ => {
                    self.generations.insert(session_id.to_string(), generation);
                    FencedWrite::Applied
                }
            }
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct InMemoryPresence {
        state: Arc<Mutex<State>>,
    }

    impl InMemoryPresence {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            self.state.lock().unwrap_or_else(PoisonError::into_inner).fail = fail;
        }

        #[must_use]
        pub fn get(&self, session_id: &str) -> Option<RoomPresence> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .rooms
                .get(session_id)
                .cloned()
        }

        /// Generation of the room that last wrote `session_id`.
        #[must_use]
        pub fn generation(&self, session_id: &str) -> Option<u64> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .generations
                .get(session_id)
                .copied()
        }

        #[must_use]
        pub fn publishes(&self) -> usize {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .publishes
        }
    }

    #[async_trait::async_trait]
    impl PresenceMirror for InMemoryPresence {
        async fn publish(
            &self,
            session_id: &str,
            generation: u64,
            presence: &RoomPresence,
        ) -> Result<FencedWrite, RcError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.fail {
                return Err(RcError::Redis("mock presence unavailable".to_string()));
            }
            let outcome = state.admit(session_id, generation);
            if outcome == FencedWrite::Applied {
                state.publishes += 1;
                state.rooms.insert(session_id.to_string(), presence.clone());
            }
            Ok(outcome)
        }

        async fn clear(&self, session_id: &str, generation: u64) -> Result<FencedWrite, RcError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.fail {
                return Err(RcError::Redis("mock presence unavailable".to_string()));
            }
            let outcome = state.admit(session_id, generation);
            if outcome == FencedWrite::Applied {
                state.rooms.remove(session_id);
            }
            Ok(outcome)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ParticipantRole;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn presence() -> RoomPresence {
        RoomPresence {
            status: Some(SessionStatus::Active),
            streamer_connected: true,
            participants: vec![ParticipantView {
                user_id: "v1".to_string(),
                display_name: None,
                role: ParticipantRole::Viewer,
                connected: true,
                has_audio: true,
                has_video: false,
                is_screen_sharing: false,
                permissions: BTreeMap::new(),
            }],
            updated_at: DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_keys() {
        assert_eq!(presence_key("s-1"), "rc:presence:s-1");
        assert_eq!(presence_generation_key("s-1"), "rc:presence:s-1:generation");
        assert_eq!(instance_rooms_key("rc-a"), "rc:instance:rc-a:rooms");
    }

    #[test]
    fn test_stored_document_shape() {
        let presence = presence();
        let value = serde_json::to_value(StoredPresence {
            instance_id: "rc-a",
            generation: 7,
            presence: &presence,
        })
        .unwrap();

        assert_eq!(value["instanceId"], "rc-a");
        assert_eq!(value["generation"], 7);
        assert_eq!(value["status"], "ACTIVE");
        assert_eq!(value["streamerConnected"], true);
        assert_eq!(
            value["participants"][0],
            json!({
                "userId": "v1",
                "role": "VIEWER",
                "connected": true,
                "hasAudio": true,
                "hasVideo": false,
                "isScreenSharing": false
            })
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisPresenceMirror::connect("not-a-redis-url", "rc-a").await;
        assert!(matches!(result, Err(RcError::Redis(_))));
    }

    #[tokio::test]
    async fn test_mock_publish_and_clear() {
        let mirror = mock::InMemoryPresence::new();

        let outcome = mirror.publish("s-1", 1, &presence()).await.unwrap();
        assert_eq!(outcome, FencedWrite::Applied);
        assert_eq!(mirror.publishes(), 1);
        assert!(mirror.get("s-1").is_some());

        assert_eq!(mirror.clear("s-1", 1).await.unwrap(), FencedWrite::Applied);
        assert!(mirror.get("s-1").is_none());
    }

    #[tokio::test]
    async fn test_mock_fences_older_generation() {
        let mirror = mock::InMemoryPresence::new();
        mirror.publish("s-1", 1, &presence()).await.unwrap();
        mirror.publish("s-1", 2, &presence()).await.unwrap();

        // The old room's teardown neither deletes nor overwrites.
        assert_eq!(mirror.clear("s-1", 1).await.unwrap(), FencedWrite::Stale);
        assert!(mirror.get("s-1").is_some());
        assert_eq!(
            mirror.publish("s-1", 1, &presence()).await.unwrap(),
            FencedWrite::Stale
        );
        assert_eq!(mirror.generation("s-1"), Some(2));
        assert_eq!(mirror.publishes(), 2);
    }
}
