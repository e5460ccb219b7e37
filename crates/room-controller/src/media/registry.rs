//! Per-room ledger of live engine resources.
//!
//! Every entry carries its [`MediaTag`], so cleanup by socket, by user or by
//! source is a scan over the tags rather than a reverse index. Removal goes
//! through `take_*`, which yields an entry at most once.

use super::{MediaKind, MediaSource, MediaTag, TransportDirection};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTransport {
    pub id: String,
    pub direction: Option<TransportDirection>,
    pub tag: MediaTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProducer {
    pub id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub tag: MediaTag,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedConsumer {
    pub id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub tag: MediaTag,
}

#[derive(Debug, Default)]
pub struct MediaRegistry {
    transports: HashMap<String, TrackedTransport>,
    producers: HashMap<String, TrackedProducer>,
    consumers: HashMap<String, TrackedConsumer>,
}

impl MediaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_transport(&mut self, transport: TrackedTransport) {
        self.transports.insert(transport.id.clone(), transport);
    }

    pub fn insert_producer(&mut self, producer: TrackedProducer) {
        self.producers.insert(producer.id.clone(), producer);
    }

    pub fn insert_consumer(&mut self, consumer: TrackedConsumer) {
        self.consumers.insert(consumer.id.clone(), consumer);
    }

    #[must_use]
    pub fn transport(&self, id: &str) -> Option<&TrackedTransport> {
        self.transports.get(id)
    }

    #[must_use]
    pub fn producer(&self, id: &str) -> Option<&TrackedProducer> {
        self.producers.get(id)
    }

    pub fn producer_mut(&mut self, id: &str) -> Option<&mut TrackedProducer> {
        self.producers.get_mut(id)
    }

    #[must_use]
    pub fn consumer(&self, id: &str) -> Option<&TrackedConsumer> {
        self.consumers.get(id)
    }

    pub fn take_transport(&mut self, id: &str) -> Option<TrackedTransport> {
        self.transports.remove(id)
    }

    pub fn take_producer(&mut self, id: &str) -> Option<TrackedProducer> {
        self.producers.remove(id)
    }

    pub fn take_consumer(&mut self, id: &str) -> Option<TrackedConsumer> {
        self.consumers.remove(id)
    }

    /// Live producer a user publishes for `source` and `kind`, if any.
    #[must_use]
    pub fn producer_for(
        &self,
        user_id: &str,
        source: MediaSource,
        kind: MediaKind,
    ) -> Option<&TrackedProducer> {
        self.producers
            .values()
            .find(|p| p.source == source && p.kind == kind && p.tag.user_id == user_id)
    }

    /// Streamer video to record: camera first, screen otherwise.
    #[must_use]
    pub fn streamer_video(&self, streamer_id: &str) -> Option<&TrackedProducer> {
        [MediaSource::Camera, MediaSource::Screen]
            .iter()
            .find_map(|source| {
                self.producers.values().find(|p| {
                    p.source == *source
                        && p.kind == MediaKind::Video
                        && p.tag.user_id == streamer_id
                })
            })
    }

    /// Ids of every live audio producer, sorted for stable ordering.
    #[must_use]
    pub fn audio_producer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .producers
            .values()
            .filter(|p| p.kind == MediaKind::Audio)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn producer_ids_for_socket(&self, socket_id: &str) -> Vec<String> {
        self.producers
            .values()
            .filter(|p| p.tag.socket_id == socket_id)
            .map(|p| p.id.clone())
            .collect()
    }

    #[must_use]
    pub fn producer_ids_for_user(&self, user_id: &str) -> Vec<String> {
        self.producers
            .values()
            .filter(|p| p.tag.user_id == user_id)
            .map(|p| p.id.clone())
            .collect()
    }

    #[must_use]
    pub fn consumer_ids_for_socket(&self, socket_id: &str) -> Vec<String> {
        self.consumers
            .values()
            .filter(|c| c.tag.socket_id == socket_id)
            .map(|c| c.id.clone())
            .collect()
    }

    #[must_use]
    pub fn consumer_ids_for_producer(&self, producer_id: &str) -> Vec<String> {
        self.consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect()
    }

    #[must_use]
    pub fn transport_ids_for_socket(&self, socket_id: &str) -> Vec<String> {
        self.transports
            .values()
            .filter(|t| t.tag.socket_id == socket_id)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Transports whose owning socket is not in `live_sockets` and that
    /// carry no producer or consumer.
    #[must_use]
    pub fn orphan_transport_ids(&self, live_sockets: &[&str]) -> Vec<String> {
        self.transports
            .values()
            .filter(|t| !live_sockets.contains(&t.tag.socket_id.as_str()))
            .filter(|t| {
                !self.producers.values().any(|p| p.transport_id == t.id)
                    && !self.consumers.values().any(|c| c.transport_id == t.id)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn producers(&self) -> impl Iterator<Item = &TrackedProducer> {
        self.producers.values()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Drop every entry. Used once the router itself is closed.
    pub fn clear(&mut self) {
        self.transports.clear();
        self.producers.clear();
        self.consumers.clear();
    }
}
