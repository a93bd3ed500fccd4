// HTTP write ingress
//
// Terminates the v1 write API, normalizes the body, and fans each write out
// to every configured backend concurrently. The client gets exactly one
// response synthesized from the backend outcomes.

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ALLOW, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use crate::config::{HttpConfig, HttpOutputConfig};
use crate::lp::{self, NormalizeError, Precision};
use crate::pool;
use crate::relay::Relay;
use crate::retry::RetryBuffer;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_DELAY_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_BATCH_SIZE_KB: usize = 512;

pub(crate) const KB: usize = 1024;
pub(crate) const MB: usize = 1024 * KB;

static X_INFLUXDB_VERSION: HeaderName = HeaderName::from_static("x-influxdb-version");

/// A backend's reply to one write, kept verbatim so it can be rendered to
/// the relay client unchanged.
#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl IntoResponse for ResponseData {
    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        if let Some(content_type) = self.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(content_encoding) = self.content_encoding {
            builder = builder.header(CONTENT_ENCODING, content_encoding);
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// One line-protocol POST to one backend.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> anyhow::Result<ResponseData>;
}

/// Posts directly to a backend URL with a per-backend timeout.
pub struct SimplePoster {
    client: reqwest::Client,
    location: Url,
}

impl SimplePoster {
    pub fn new(
        location: &str,
        timeout: Duration,
        skip_tls_verification: bool,
    ) -> anyhow::Result<Self> {
        let location = Url::parse(location)
            .with_context(|| format!("invalid backend location {location:?}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_tls_verification)
            .build()
            .context("failed to build backend http client")?;
        Ok(Self { client, location })
    }
}

#[async_trait]
impl Poster for SimplePoster {
    async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> anyhow::Result<ResponseData> {
        let mut url = self.location.clone();
        url.set_query(if query.is_empty() { None } else { Some(query) });

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .header(reqwest::header::CONTENT_LENGTH, body.len())
            .body(body);
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let content_type = header_string(resp.headers(), CONTENT_TYPE);
        let content_encoding = header_string(resp.headers(), CONTENT_ENCODING);
        let body = resp.bytes().await?;

        Ok(ResponseData {
            status,
            body,
            content_type,
            content_encoding,
        })
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// One configured backend: a poster, optionally wrapped in a retry buffer.
pub struct HttpBackend {
    name: String,
    poster: Arc<dyn Poster>,
    retry: Option<Arc<RetryBuffer>>,
}

impl HttpBackend {
    pub fn new(cfg: &HttpOutputConfig) -> anyhow::Result<Self> {
        let name = if cfg.name.is_empty() {
            cfg.location.clone()
        } else {
            cfg.name.clone()
        };

        let timeout = match cfg.timeout.as_deref() {
            Some(t) => humantime::parse_duration(t)
                .with_context(|| format!("invalid backend timeout {t:?}"))?,
            None => DEFAULT_TIMEOUT,
        };

        let poster: Arc<dyn Poster> =
            Arc::new(SimplePoster::new(&cfg.location, timeout, cfg.skip_tls_verification)?);

        // A retry buffer per backend serializes retries against it.
        let (poster, retry) = if cfg.buffer_size_mb > 0 {
            let max_interval = match cfg.max_delay_interval.as_deref() {
                Some(d) => humantime::parse_duration(d)
                    .with_context(|| format!("invalid max delay interval {d:?}"))?,
                None => DEFAULT_MAX_DELAY_INTERVAL,
            };
            let max_batch = if cfg.max_batch_kb > 0 {
                cfg.max_batch_kb * KB
            } else {
                DEFAULT_BATCH_SIZE_KB * KB
            };
            let buffer =
                RetryBuffer::start(cfg.buffer_size_mb * MB, max_batch, max_interval, poster);
            (Arc::clone(&buffer) as Arc<dyn Poster>, Some(buffer))
        } else {
            (poster, None)
        };

        Ok(Self { name, poster, retry })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn submit(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> anyhow::Result<ResponseData> {
        self.poster.post(body, query, auth).await
    }

    fn stop(&self) {
        if let Some(retry) = &self.retry {
            retry.stop();
        }
    }
}

/// An HTTP listening endpoint fanning writes out to its backends.
pub struct HttpRelay {
    name: String,
    addr: SocketAddr,
    tls_pem: Option<PathBuf>,
    default_retention_policy: Option<String>,
    backends: Vec<Arc<HttpBackend>>,
    handle: Handle,
    closing: AtomicBool,
}

impl HttpRelay {
    pub fn new(cfg: HttpConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address {:?}", cfg.bind_addr))?;

        let scheme = if cfg.ssl_combined_pem.is_some() {
            "https"
        } else {
            "http"
        };
        let name = if cfg.name.is_empty() {
            format!("{scheme}://{}", cfg.bind_addr)
        } else {
            cfg.name
        };

        let backends = cfg
            .outputs
            .iter()
            .map(|output| HttpBackend::new(output).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let default_retention_policy = if cfg.default_retention_policy.is_empty() {
            None
        } else {
            Some(cfg.default_retention_policy)
        };

        Ok(Self {
            name,
            addr,
            tls_pem: cfg.ssl_combined_pem,
            default_retention_policy,
            backends,
            handle: Handle::new(),
            closing: AtomicBool::new(false),
        })
    }

    /// The routes this relay serves, for embedding or testing.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ping", any(handle_ping))
            .route("/write", any(handle_write))
            .fallback(invalid_endpoint)
            .with_state(Arc::clone(self))
    }

    /// Address the listener is bound to, once `run` has opened it.
    pub async fn listening(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    async fn write(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Body,
    ) -> Response {
        let start = SystemTime::now();

        if method == Method::OPTIONS {
            return (StatusCode::NO_CONTENT, [(ALLOW, "POST")]).into_response();
        }
        if method != Method::POST {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(ALLOW, "POST")],
                Json(json!({"error": "invalid write method"})),
            )
                .into_response();
        }

        let mut params: Vec<(String, String)> =
            form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
                .into_owned()
                .collect();

        // fail early if we're missing the database
        if !params.iter().any(|(k, v)| k == "db" && !v.is_empty()) {
            return json_error(StatusCode::BAD_REQUEST, "missing parameter: db");
        }

        if let Some(rp) = &self.default_retention_policy {
            if !params.iter().any(|(k, v)| k == "rp" && !v.is_empty()) {
                params.retain(|(k, _)| k != "rp");
                params.push(("rp".to_string(), rp.clone()));
            }
        }

        let precision = params
            .iter()
            .find(|(k, _)| k == "precision")
            .map(|(_, v)| Precision::parse(v))
            .unwrap_or_default();

        let mut body_buf = pool::get();
        let mut frames = body.into_data_stream();
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(chunk) => body_buf.extend_from_slice(&chunk),
                Err(_) => {
                    return json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "problem reading request body",
                    )
                }
            }
        }

        let gzipped = headers
            .get(CONTENT_ENCODING)
            .is_some_and(|v| v.as_bytes() == b"gzip");
        let input = if gzipped {
            let mut decoded = pool::get();
            let result = GzDecoder::new(&body_buf[..]).read_to_end(&mut decoded);
            drop(body_buf);
            if result.is_err() {
                return json_error(StatusCode::BAD_REQUEST, "unable to decode gzip body");
            }
            decoded
        } else {
            body_buf
        };

        let mut out = pool::get();
        let points = match lp::normalize_into(&input, precision.timestamp(start), &mut *out) {
            Ok(points) => points,
            Err(NormalizeError::Write(_)) => {
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, "problem writing points")
            }
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "unable to parse points"),
        };
        // done with the input bytes
        drop(input);

        counter!("relay.http.requests").increment(1);
        counter!("relay.http.points").increment(points as u64);
        histogram!("relay.http.body_bytes").record(out.len() as f64);

        // normalize the query string so batches can coalesce on it
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&params)
            .finish();

        let auth = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let outgoing = out.freeze();
        let (outcomes, mut results) = mpsc::channel(self.backends.len().max(1));

        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let body = outgoing.clone();
            let query = query.clone();
            let auth = auth.clone();
            let outcomes = outcomes.clone();
            let relay = self.name.clone();

            tokio::spawn(async move {
                match backend.submit(body, &query, auth.as_deref()).await {
                    Ok(resp) => {
                        if resp.status.is_server_error() {
                            warn!(
                                relay = %relay,
                                backend = %backend.name(),
                                status = %resp.status,
                                "backend rejected write"
                            );
                        }
                        let _ = outcomes.send(resp).await;
                    }
                    Err(err) => {
                        warn!(
                            relay = %relay,
                            backend = %backend.name(),
                            error = %err,
                            "backend write failed"
                        );
                    }
                }
            });
        }
        drop(outcomes);
        drop(outgoing);

        // First 2xx wins; a 4xx is a permanent per-request error and is
        // surfaced promptly. Remaining outcomes drain in the background.
        let mut error_response = None;
        while let Some(resp) = results.recv().await {
            if resp.status.is_success() {
                return StatusCode::NO_CONTENT.into_response();
            }
            if resp.status.is_client_error() {
                return resp.into_response();
            }
            error_response = Some(resp);
        }

        match error_response {
            Some(resp) => resp.into_response(),
            // no backend produced an HTTP response at all
            None => json_error(StatusCode::SERVICE_UNAVAILABLE, "unable to write points"),
        }
    }
}

#[async_trait]
impl Relay for HttpRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let app = self.router();
        info!(relay = %self.name, addr = %self.addr, "starting http relay");

        let served = match &self.tls_pem {
            Some(pem) => {
                let tls = RustlsConfig::from_pem_file(pem, pem)
                    .await
                    .with_context(|| format!("failed to load combined pem {}", pem.display()))?;
                axum_server::bind_rustls(self.addr, tls)
                    .handle(self.handle.clone())
                    .serve(app.into_make_service())
                    .await
            }
            None => {
                axum_server::bind(self.addr)
                    .handle(self.handle.clone())
                    .serve(app.into_make_service())
                    .await
            }
        };

        if let Err(err) = served {
            // a listener closed by stop() is a clean exit
            if !self.closing.load(Ordering::Acquire) {
                return Err(err).context("http relay terminated");
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        self.handle.graceful_shutdown(None);
        for backend in &self.backends {
            backend.stop();
        }
    }
}

async fn handle_ping(method: Method) -> Response {
    if method == Method::GET || method == Method::HEAD {
        return (
            StatusCode::NO_CONTENT,
            [(X_INFLUXDB_VERSION.clone(), "relay")],
        )
            .into_response();
    }
    invalid_endpoint().await
}

async fn handle_write(
    State(relay): State<Arc<HttpRelay>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    relay.write(method, uri, headers, body).await
}

async fn invalid_endpoint() -> Response {
    json_error(StatusCode::NOT_FOUND, "invalid write endpoint")
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_name_defaults_to_location() {
        let cfg = HttpOutputConfig {
            location: "http://127.0.0.1:8086/write".to_string(),
            ..Default::default()
        };
        // constructing a retry-less backend needs no runtime
        let backend = HttpBackend::new(&cfg).unwrap();
        assert_eq!(backend.name(), "http://127.0.0.1:8086/write");
    }

    #[test]
    fn invalid_timeout_is_a_config_error() {
        let cfg = HttpOutputConfig {
            location: "http://127.0.0.1:8086/write".to_string(),
            timeout: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(HttpBackend::new(&cfg).is_err());
    }

    #[test]
    fn invalid_location_is_a_config_error() {
        let cfg = HttpOutputConfig {
            location: "not a url".to_string(),
            ..Default::default()
        };
        assert!(HttpBackend::new(&cfg).is_err());
    }

    #[test]
    fn relay_name_defaults_to_scheme_and_addr() {
        let relay = HttpRelay::new(HttpConfig {
            bind_addr: "127.0.0.1:9096".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(relay.name(), "http://127.0.0.1:9096");
    }
}
