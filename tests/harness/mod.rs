//! Test harness: in-process mock backends and relay helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use lp_relay::config::{HttpConfig, HttpOutputConfig};
use lp_relay::http::HttpRelay;
use lp_relay::Relay;

/// One write observed by a mock backend.
#[derive(Clone, Debug)]
pub struct CapturedWrite {
    pub query: String,
    pub auth: Option<String>,
    pub body: Bytes,
}

/// How a mock backend answers writes.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// Answer with a bare status code.
    Status(u16),
    /// Answer with a status code and a fixed JSON body.
    Respond { status: u16, body: &'static str },
    /// Sleep, then answer with a bare status code.
    Delay { delay: Duration, status: u16 },
}

#[derive(Clone)]
struct MockState {
    behavior: Behavior,
    writes: Arc<Mutex<Vec<CapturedWrite>>>,
}

/// A scripted backend bound to a local port.
pub struct MockBackend {
    addr: SocketAddr,
    writes: Arc<Mutex<Vec<CapturedWrite>>>,
}

impl MockBackend {
    pub async fn start(behavior: Behavior) -> MockBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, behavior)
    }

    /// Bind to a specific address, for backends that come up late.
    pub async fn start_on(addr: SocketAddr, behavior: Behavior) -> MockBackend {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self::serve(listener, behavior)
    }

    fn serve(listener: TcpListener, behavior: Behavior) -> MockBackend {
        let addr = listener.local_addr().unwrap();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            behavior,
            writes: Arc::clone(&writes),
        };
        let app = Router::new().fallback(capture).with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockBackend { addr, writes }
    }

    pub fn location(&self) -> String {
        format!("http://{}/write", self.addr)
    }

    pub fn writes(&self) -> Vec<CapturedWrite> {
        self.writes.lock().clone()
    }

    /// Poll until the backend has seen `count` writes or the deadline hits.
    pub async fn wait_for_writes(&self, count: usize, deadline: Duration) -> Vec<CapturedWrite> {
        let start = std::time::Instant::now();
        loop {
            let writes = self.writes();
            if writes.len() >= count || start.elapsed() > deadline {
                return writes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn capture(
    State(state): State<MockState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.writes.lock().push(CapturedWrite {
        query: query.unwrap_or_default(),
        auth: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    match state.behavior {
        Behavior::Status(code) => status(code).into_response(),
        Behavior::Respond { status: code, body } => (
            status(code),
            [(CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response(),
        Behavior::Delay { delay, status: code } => {
            tokio::time::sleep(delay).await;
            status(code).into_response()
        }
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap()
}

/// Shorthand for a plain output pointing at `location`.
pub fn output(location: String) -> HttpOutputConfig {
    HttpOutputConfig {
        location,
        ..Default::default()
    }
}

/// Build and run an HTTP relay on an ephemeral port.
pub async fn start_relay(outputs: Vec<HttpOutputConfig>) -> (Arc<HttpRelay>, SocketAddr) {
    start_relay_with(HttpConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        outputs,
        ..Default::default()
    })
    .await
}

pub async fn start_relay_with(cfg: HttpConfig) -> (Arc<HttpRelay>, SocketAddr) {
    let relay = Arc::new(HttpRelay::new(cfg).unwrap());
    tokio::spawn(Arc::clone(&relay).run());
    let addr = relay.listening().await.expect("relay failed to start");
    (relay, addr)
}

/// Grab an address nothing is listening on yet.
pub async fn reserve_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A client that keeps no idle connections, so relay shutdown is not held
/// open by the connection pool.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}
