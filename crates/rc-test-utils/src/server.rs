//! Test server harness for end-to-end WebSocket tests.
//!
//! Provides `TestSignalingServer`, which serves the real signaling router
//! (plus the health endpoints) for a [`TestRoomController`] on a random port.

use crate::harness::TestRoomController;
use room_controller::observability::{health_router, HealthState};
use room_controller::signaling::signaling_router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Live HTTP/WebSocket listener in front of a [`TestRoomController`].
///
/// # Example
/// ```rust,ignore
/// let rc = TestRoomController::start(vec![TestSession::new("s-1").build()]);
/// let server = TestSignalingServer::spawn(&rc).await?;
/// let (ws, _) = tokio_tungstenite::connect_async(server.ws_url()).await?;
/// ```
pub struct TestSignalingServer {
    addr: SocketAddr,
    health: Arc<HealthState>,
    _handle: JoinHandle<()>,
}

impl TestSignalingServer {
    /// Bind to 127.0.0.1:0 and serve `/ws`, `/health` and `/ready`.
    pub async fn spawn(rc: &TestRoomController) -> Result<Self, anyhow::Error> {
        let health = Arc::new(HealthState::new());
        let app = signaling_router(rc.signaling_context()).merge(health_router(Arc::clone(&health)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        health.set_ready();

        Ok(Self {
            addr,
            health,
            _handle: handle,
        })
    }

    /// Base HTTP URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Signaling WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }
}

impl Drop for TestSignalingServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}
