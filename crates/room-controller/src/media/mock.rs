//! In-process media engine for tests and local development.
//!
//! Tracks every resource it hands out so tests can assert on what is still
//! live, and can be told to fail individual operations.

use super::engine::MediaEngine;
use super::{
    ConsumeParams, ConsumerInfo, MediaKind, MediaTag, PlainTransportInfo, PlainTransportOptions,
    RouterInfo, RtpCodecCapability, WebRtcTransportInfo, WebRtcTransportOptions,
};
use crate::errors::RcError;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Engine operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateRouter,
    CreateTransport,
    CreatePlainTransport,
    Connect,
    Produce,
    Consume,
}

#[derive(Debug, Default)]
struct State {
    routers: HashSet<String>,
    /// transport id -> (router id, tag)
    transports: HashMap<String, (String, MediaTag)>,
    /// producer id -> (kind, tag, transport id)
    producers: HashMap<String, (MediaKind, MediaTag, String)>,
    /// consumer id -> (tag, transport id)
    consumers: HashMap<String, (MediaTag, String)>,
    paused_producers: HashSet<String>,
    paused_consumers: HashSet<String>,
    producer_close_calls: HashMap<String, usize>,
    failing: HashSet<MockOp>,
    incompatible: bool,
}

/// Mock media engine.
#[derive(Debug)]
pub struct MockMediaEngine {
    state: Mutex<State>,
    next_id: AtomicUsize,
    next_port: AtomicU16,
    call_count: AtomicUsize,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaEngine {
    /// Create an engine where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicUsize::new(1),
            next_port: AtomicU16::new(40000),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Create an engine where `op` always fails.
    #[must_use]
    pub fn failing(op: MockOp) -> Self {
        let engine = Self::new();
        engine.set_failing(op, true);
        engine
    }

    pub fn set_failing(&self, op: MockOp, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Make `can_consume` answer false.
    pub fn set_incompatible(&self, incompatible: bool) {
        self.lock().incompatible = incompatible;
    }

    /// Total engine calls made.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn live_router_count(&self) -> usize {
        self.lock().routers.len()
    }

    pub fn live_transport_count(&self) -> usize {
        self.lock().transports.len()
    }

    pub fn live_consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn is_producer_live(&self, producer_id: &str) -> bool {
        self.lock().producers.contains_key(producer_id)
    }

    pub fn is_producer_paused(&self, producer_id: &str) -> bool {
        self.lock().paused_producers.contains(producer_id)
    }

    pub fn is_consumer_paused(&self, consumer_id: &str) -> bool {
        self.lock().paused_consumers.contains(consumer_id)
    }

    /// Live producers published by `user_id`.
    pub fn live_producers_for(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .producers
            .iter()
            .filter(|(_, (_, tag, _))| tag.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// How many times `close_producer` was called for `producer_id`.
    pub fn producer_close_calls(&self, producer_id: &str) -> usize {
        self.lock()
            .producer_close_calls
            .get(producer_id)
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, op: Option<MockOp>) -> Result<(), RcError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        match op {
            Some(op) if self.lock().failing.contains(&op) => {
                Err(RcError::Provider(format!("mock engine: {op:?} failed")))
            }
            _ => Ok(()),
        }
    }

    fn id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, RcError> {
        self.begin(Some(MockOp::CreateRouter))?;
        let id = self.id("router");
        self.lock().routers.insert(id.clone());
        Ok(RouterInfo {
            id,
            rtp_capabilities: json!({ "codecs": codecs }),
        })
    }

    async fn close_router(&self, router_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        let mut state = self.lock();
        state.routers.remove(router_id);
        let closed: HashSet<String> = state
            .transports
            .iter()
            .filter(|(_, (router, _))| router == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        state.transports.retain(|id, _| !closed.contains(id));
        state.producers.retain(|_, (_, _, t)| !closed.contains(t.as_str()));
        state.consumers.retain(|_, (_, t)| !closed.contains(t.as_str()));
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        _options: &WebRtcTransportOptions,
        tag: &MediaTag,
    ) -> Result<WebRtcTransportInfo, RcError> {
        self.begin(Some(MockOp::CreateTransport))?;
        if !self.lock().routers.contains(router_id) {
            return Err(RcError::Provider(format!("unknown router {router_id}")));
        }
        let id = self.id("transport");
        self.lock()
            .transports
            .insert(id.clone(), (router_id.to_string(), tag.clone()));
        Ok(WebRtcTransportInfo {
            id,
            ice_parameters: json!({ "usernameFragment": "mock", "password": "mock" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn create_plain_transport(
        &self,
        router_id: &str,
        options: &PlainTransportOptions,
        tag: &MediaTag,
    ) -> Result<PlainTransportInfo, RcError> {
        self.begin(Some(MockOp::CreatePlainTransport))?;
        let id = self.id("plain");
        self.lock()
            .transports
            .insert(id.clone(), (router_id.to_string(), tag.clone()));
        Ok(PlainTransportInfo {
            id,
            ip: options.listen_ip.clone(),
            port: self.next_port.fetch_add(2, Ordering::SeqCst),
        })
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: &Value,
    ) -> Result<(), RcError> {
        self.begin(Some(MockOp::Connect))?;
        if self.lock().transports.contains_key(transport_id) {
            Ok(())
        } else {
            Err(RcError::Provider(format!("unknown transport {transport_id}")))
        }
    }

    async fn connect_plain_transport(
        &self,
        transport_id: &str,
        _ip: &str,
        _port: u16,
    ) -> Result<(), RcError> {
        self.connect_webrtc_transport(transport_id, &Value::Null)
            .await
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        self.lock().transports.remove(transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: &Value,
        tag: &MediaTag,
    ) -> Result<String, RcError> {
        self.begin(Some(MockOp::Produce))?;
        if !self.lock().transports.contains_key(transport_id) {
            return Err(RcError::Provider(format!("unknown transport {transport_id}")));
        }
        let id = self.id("producer");
        self.lock()
            .producers
            .insert(id.clone(), (kind, tag.clone(), transport_id.to_string()));
        Ok(id)
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        self.lock().paused_producers.insert(producer_id.to_string());
        Ok(())
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        self.lock().paused_producers.remove(producer_id);
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        let mut state = self.lock();
        *state
            .producer_close_calls
            .entry(producer_id.to_string())
            .or_insert(0) += 1;
        state.producers.remove(producer_id);
        state.paused_producers.remove(producer_id);
        Ok(())
    }

    async fn can_consume(
        &self,
        _router_id: &str,
        producer_id: &str,
        _rtp_capabilities: &Value,
    ) -> Result<bool, RcError> {
        self.begin(None)?;
        let state = self.lock();
        Ok(!state.incompatible && state.producers.contains_key(producer_id))
    }

    async fn consume(&self, params: &ConsumeParams<'_>) -> Result<ConsumerInfo, RcError> {
        self.begin(Some(MockOp::Consume))?;
        let kind = self
            .lock()
            .producers
            .get(params.producer_id)
            .map(|(kind, _, _)| *kind)
            .ok_or_else(|| RcError::Provider(format!("unknown producer {}", params.producer_id)))?;

        let id = self.id("consumer");
        let mut state = self.lock();
        state.consumers.insert(
            id.clone(),
            (params.app_data.clone(), params.transport_id.to_string()),
        );
        if params.paused {
            state.paused_consumers.insert(id.clone());
        }

        let codec = match kind {
            MediaKind::Audio => json!({
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": { "useinbandfec": 1 }
            }),
            MediaKind::Video => json!({
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
                "parameters": {}
            }),
        };

        Ok(ConsumerInfo {
            id,
            producer_id: params.producer_id.to_string(),
            kind,
            rtp_parameters: json!({ "codecs": [codec] }),
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        self.lock().paused_consumers.remove(consumer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), RcError> {
        self.begin(None)?;
        let mut state = self.lock();
        state.consumers.remove(consumer_id);
        state.paused_consumers.remove(consumer_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{default_media_codecs, MediaSource};

    fn tag() -> MediaTag {
        MediaTag {
            socket_id: "conn-1".to_string(),
            user_id: "user-1".to_string(),
            source: Some(MediaSource::Camera),
        }
    }

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }

    #[tokio::test]
    async fn test_mock_tracks_produce_and_close() {
        let engine = MockMediaEngine::new();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();
        let transport = engine
            .create_webrtc_transport(&router.id, &options(), &tag())
            .await
            .unwrap();
        let producer = engine
            .produce(&transport.id, MediaKind::Video, &json!({}), &tag())
            .await
            .unwrap();

        assert!(engine.is_producer_live(&producer));
        engine.close_producer(&producer).await.unwrap();
        engine.close_producer(&producer).await.unwrap();

        assert!(!engine.is_producer_live(&producer));
        assert_eq!(engine.producer_close_calls(&producer), 2);
    }

    #[tokio::test]
    async fn test_mock_failing_op() {
        let engine = MockMediaEngine::failing(MockOp::CreateRouter);
        let result = engine.create_router(&default_media_codecs()).await;

        assert!(matches!(result, Err(RcError::Provider(_))));
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_incompatible_consumer() {
        let engine = MockMediaEngine::new();
        engine.set_incompatible(true);

        let ok = engine.can_consume("router-1", "producer-1", &json!({})).await.unwrap();
        assert!(!ok);
    }
}
