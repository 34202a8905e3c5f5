// Backend connection tracking and the dynamic-port handshake.
//
// The backend binds a port chosen at session start, so the HTTP client must
// first learn that port from the supervisor (with a bounded retry) before
// any request can be addressed. Once resolved, a lightweight tracker follows
// request outcomes so the UI can show a connectivity indicator without
// flooding a still-booting backend with probes.

use crate::backend::DEFAULT_BACKEND_PORT;
use crate::error::Result;
use serde::Serialize;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Minimum spacing between explicit health probes.
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(5);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the resolved port can be read from. The supervisor implements this;
/// outside the desktop shell there is no source at all.
pub trait PortSource: Send + Sync {
    fn backend_port(&self) -> Option<u16>;
}

impl PortSource for crate::backend::BackendManager {
    fn backend_port(&self) -> Option<u16> {
        self.port()
    }
}

/// Poll the bridge for the session port, up to `max_attempts` times with a
/// fixed `delay` between attempts. The first strictly-positive value wins;
/// exhaustion (or no bridge at all) falls back to the static default so the
/// UI is never blocked indefinitely.
pub async fn resolve_backend_port(
    source: Option<&dyn PortSource>,
    max_attempts: u32,
    delay: Duration,
) -> u16 {
    let Some(source) = source else {
        // Plain browser context: no bridge to ask.
        return DEFAULT_BACKEND_PORT;
    };

    for attempt in 1..=max_attempts {
        if let Some(port) = source.backend_port() {
            if port > 0 {
                tracing::debug!("Resolved backend port {} on attempt {}", port, attempt);
                return port;
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
        }
    }

    tracing::warn!(
        "Backend port not resolved after {} attempts; falling back to {}",
        max_attempts,
        DEFAULT_BACKEND_PORT
    );
    DEFAULT_BACKEND_PORT
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Checking,
    Connected,
    Disconnected,
}

/// Tracks reachability of the backend as observed from request outcomes.
/// Any received response counts as reachable; only a network-level failure
/// (no response at all) marks the backend disconnected.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: RwLock<ConnectionState>,
    last_check: RwLock<Option<Instant>>,
    last_probe: Mutex<Option<Instant>>,
    probe_interval: Duration,
}

impl ConnectionTracker {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Unknown),
            last_check: RwLock::new(None),
            last_probe: Mutex::new(None),
            probe_interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn last_check_age(&self) -> Option<Duration> {
        self.last_check.read().unwrap().map(|t| t.elapsed())
    }

    pub fn record_success(&self) {
        *self.state.write().unwrap() = ConnectionState::Connected;
        *self.last_check.write().unwrap() = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        *self.state.write().unwrap() = ConnectionState::Disconnected;
        *self.last_check.write().unwrap() = Some(Instant::now());
    }

    fn mark_checking(&self) {
        *self.state.write().unwrap() = ConnectionState::Checking;
    }

    /// Forget everything; the next request re-evaluates connectivity.
    pub fn reset(&self) {
        *self.state.write().unwrap() = ConnectionState::Unknown;
        *self.last_check.write().unwrap() = None;
        *self.last_probe.lock().unwrap() = None;
    }

    /// Claim the next probe slot. At most one claim per interval; throttled
    /// callers should reuse the cached state instead.
    pub fn try_claim_probe(&self) -> bool {
        let mut last = self.last_probe.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.probe_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub base_url: String,
    pub last_check_age_ms: Option<u64>,
}

/// HTTP client half of the handshake: holds the resolved base address and
/// the connectivity tracker fed by request outcomes.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: RwLock<String>,
    tracker: ConnectionTracker,
}

impl BackendClient {
    pub fn new() -> Self {
        Self::with_probe_interval(HEALTH_PROBE_INTERVAL)
    }

    pub fn with_probe_interval(probe_interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            base_url: RwLock::new(format!("http://127.0.0.1:{}", DEFAULT_BACKEND_PORT)),
            tracker: ConnectionTracker::new(probe_interval),
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.read().unwrap().clone()
    }

    /// Point the client at the resolved port and drop any cached
    /// connectivity verdict.
    pub fn set_port(&self, port: u16) {
        let base = format!("http://127.0.0.1:{}", port);
        tracing::info!("Backend base URL set to {}", base);
        *self.base_url.write().unwrap() = base;
        self.tracker.reset();
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.tracker.state(),
            base_url: self.base_url(),
            last_check_age_ms: self
                .tracker
                .last_check_age()
                .map(|d| d.as_millis() as u64),
        }
    }

    /// Probe `/health`, at most once per probe interval. Throttled calls
    /// return the cached state so a booting backend is not flooded.
    pub async fn check_health(&self) -> ConnectionState {
        if !self.tracker.try_claim_probe() {
            return self.tracker.state();
        }
        self.tracker.mark_checking();

        let url = format!("{}/health", self.base_url());
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => {
                // Any response means the backend is reachable, even while
                // it reports an unhealthy status of its own.
                tracing::trace!("Health probe: {} from {}", response.status(), url);
                self.tracker.record_success();
            }
            Err(e) => {
                tracing::debug!("Health probe failed: {}", e);
                self.tracker.record_failure();
            }
        }
        self.tracker.state()
    }

    /// Issue a GET against the backend and record the outcome on the
    /// tracker, mirroring what the UI's response interceptor does.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url(), path);
        let response = self.http.get(&url).send().await.map_err(|e| {
            self.tracker.record_failure();
            crate::error::NovelMindError::Backend(format!("Request to {} failed: {}", url, e))
        })?;
        self.tracker.record_success();

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(crate::error::NovelMindError::Backend(format!(
                "Request to {} failed ({}): {}",
                url, status, body
            )));
        }
        serde_json::from_str(&body).map_err(|e| {
            crate::error::NovelMindError::Backend(format!(
                "Failed to parse response from {}: {}",
                url, e
            ))
        })
    }
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{allocate_port, BackendManager};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct StubBridge {
        replies: Mutex<VecDeque<Option<u16>>>,
        calls: AtomicU32,
    }

    impl StubBridge {
        fn new(replies: Vec<Option<u16>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PortSource for StubBridge {
        fn backend_port(&self) -> Option<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().unwrap().pop_front().flatten()
        }
    }

    /// Serve `/health` on the given port until the task is aborted.
    async fn spawn_health_server(port: u16) -> tokio::task::JoinHandle<()> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = "{\"status\":\"healthy\"}";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        })
    }

    #[tokio::test]
    async fn resolve_without_bridge_returns_default_immediately() {
        let port = resolve_backend_port(None, 5, Duration::from_millis(500)).await;
        assert_eq!(port, DEFAULT_BACKEND_PORT);
    }

    #[tokio::test]
    async fn resolve_accepts_first_positive_port() {
        let bridge = StubBridge::new(vec![Some(0), Some(0), Some(5173)]);
        let started = Instant::now();
        let port = resolve_backend_port(Some(&bridge), 5, Duration::from_millis(50)).await;
        assert_eq!(port, 5173);
        assert_eq!(bridge.calls(), 3);
        // Two sleeps between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn resolve_exhausts_attempts_then_falls_back() {
        let bridge = StubBridge::new(vec![None; 8]);
        let port = resolve_backend_port(Some(&bridge), 4, Duration::from_millis(10)).await;
        assert_eq!(port, DEFAULT_BACKEND_PORT);
        assert_eq!(bridge.calls(), 4);
    }

    #[test]
    fn tracker_follows_request_outcomes() {
        let tracker = ConnectionTracker::new(Duration::from_secs(5));
        assert_eq!(tracker.state(), ConnectionState::Unknown);
        assert!(tracker.last_check_age().is_none());

        tracker.record_failure();
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        tracker.record_success();
        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert!(tracker.last_check_age().is_some());

        tracker.reset();
        assert_eq!(tracker.state(), ConnectionState::Unknown);
        assert!(tracker.last_check_age().is_none());
    }

    #[test]
    fn probe_claims_are_throttled_within_window() {
        let tracker = ConnectionTracker::new(Duration::from_secs(5));
        assert!(tracker.try_claim_probe());
        assert!(!tracker.try_claim_probe());
        assert!(!tracker.try_claim_probe());
    }

    #[test]
    fn probe_claims_reopen_after_interval() {
        let tracker = ConnectionTracker::new(Duration::from_millis(30));
        assert!(tracker.try_claim_probe());
        assert!(!tracker.try_claim_probe());
        std::thread::sleep(Duration::from_millis(40));
        assert!(tracker.try_claim_probe());
    }

    #[tokio::test]
    async fn throttled_health_check_reuses_cached_state() {
        let client = BackendClient::with_probe_interval(Duration::from_secs(60));
        // First probe runs against a dead port and records Disconnected.
        let port = allocate_port().unwrap();
        client.set_port(port);
        assert_eq!(client.check_health().await, ConnectionState::Disconnected);
        // Within the window no new probe is issued even if the backend came up.
        let _server = spawn_health_server(port).await;
        assert_eq!(client.check_health().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn end_to_end_handshake_probe_and_teardown() {
        // Allocate a session port and pretend the sidecar bound it.
        let manager = BackendManager::new();
        let port = allocate_port().unwrap();
        manager.set_port(port);
        let server = spawn_health_server(port).await;

        // The UI resolves the same port within its retry attempts.
        let resolved =
            resolve_backend_port(Some(&manager), 5, Duration::from_millis(10)).await;
        assert_eq!(resolved, port);

        let client = BackendClient::with_probe_interval(Duration::from_millis(20));
        client.set_port(resolved);
        assert_eq!(client.check_health().await, ConnectionState::Connected);

        // Sidecar goes away; the next probe after the window flips the state.
        server.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.check_health().await, ConnectionState::Disconnected);

        // Terminating the (never-spawned) process is a no-op.
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn get_json_marks_connected_and_parses_body() {
        let port = allocate_port().unwrap();
        let _server = spawn_health_server(port).await;
        let client = BackendClient::with_probe_interval(Duration::from_secs(5));
        client.set_port(port);

        let value = client.get_json("/health").await.unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(client.connection_info().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn get_json_network_failure_marks_disconnected() {
        let client = BackendClient::with_probe_interval(Duration::from_secs(5));
        client.set_port(allocate_port().unwrap());

        assert!(client.get_json("/health").await.is_err());
        assert_eq!(
            client.connection_info().state,
            ConnectionState::Disconnected
        );
    }
}
