// UDP write ingress
//
// Datagrams are parsed, re-serialized, and forwarded to every UDP backend
// in chunks that respect each backend's MTU. There is no buffering and no
// reply.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use anyhow::Context;
use async_trait::async_trait;
use metrics::counter;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{UdpConfig, UdpOutputConfig};
use crate::lp::{self, Precision};
use crate::pool;
use crate::relay::Relay;

pub(crate) const DEFAULT_MTU: usize = 1024;

/// Largest payload a single datagram can carry.
const MAX_DATAGRAM: usize = 64 * 1024;

struct UdpBackend {
    name: String,
    addr: SocketAddr,
    mtu: usize,
}

impl UdpBackend {
    fn new(cfg: &UdpOutputConfig) -> anyhow::Result<Self> {
        let addr = cfg
            .location
            .to_socket_addrs()
            .with_context(|| format!("invalid backend location {:?}", cfg.location))?
            .next()
            .with_context(|| format!("backend location {:?} did not resolve", cfg.location))?;

        let name = if cfg.name.is_empty() {
            cfg.location.clone()
        } else {
            cfg.name.clone()
        };

        Ok(Self {
            name,
            addr,
            mtu: if cfg.mtu > 0 { cfg.mtu } else { DEFAULT_MTU },
        })
    }
}

/// A UDP listening endpoint forwarding datagrams to its backends.
pub struct UdpRelay {
    name: String,
    addr: SocketAddr,
    precision: Precision,
    read_buffer: usize,
    backends: Vec<UdpBackend>,
    bound: OnceLock<SocketAddr>,
    closing: AtomicBool,
    shutdown: Notify,
}

impl UdpRelay {
    pub fn new(cfg: UdpConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address {:?}", cfg.bind_addr))?;

        let name = if cfg.name.is_empty() {
            format!("udp://{}", cfg.bind_addr)
        } else {
            cfg.name
        };

        let backends = cfg
            .outputs
            .iter()
            .map(UdpBackend::new)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            name,
            addr,
            precision: Precision::parse(&cfg.precision),
            read_buffer: cfg.read_buffer,
            backends,
            bound: OnceLock::new(),
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Address the socket is bound to, once `run` has opened it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    fn bind(&self) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(self.addr), Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create udp socket")?;
        if self.read_buffer > 0 {
            socket
                .set_recv_buffer_size(self.read_buffer)
                .with_context(|| format!("invalid read buffer size {}", self.read_buffer))?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&self.addr.into())
            .with_context(|| format!("failed to bind udp {}", self.addr))?;
        UdpSocket::from_std(socket.into()).context("failed to register udp socket")
    }

    async fn forward(&self, socket: &UdpSocket, datagram: &[u8]) {
        let mut out = pool::get();
        let now = self.precision.timestamp(SystemTime::now());
        let points = match lp::normalize_into(datagram, now, &mut *out) {
            Ok(points) => points,
            Err(err) => {
                warn!(relay = %self.name, error = %err, "dropping malformed datagram");
                return;
            }
        };
        if points == 0 {
            return;
        }

        counter!("relay.udp.datagrams").increment(1);
        counter!("relay.udp.points").increment(points as u64);

        for backend in &self.backends {
            for chunk in chunk_lines(&out, backend.mtu) {
                if let Err(err) = socket.send_to(chunk, backend.addr).await {
                    warn!(
                        relay = %self.name,
                        backend = %backend.name,
                        error = %err,
                        "udp forward failed"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Relay for UdpRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let socket = self.bind()?;
        let _ = self.bound.set(socket.local_addr()?);
        info!(relay = %self.name, addr = %self.addr, "starting udp relay");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!(relay = %self.name, "udp relay stopped");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _peer)) => self.forward(&socket, &buf[..len]).await,
                        Err(err) => {
                            if self.closing.load(Ordering::Acquire) {
                                return Ok(());
                            }
                            return Err(err).context("udp relay terminated");
                        }
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }
}

/// Split `body` into chunks of whole lines no larger than `limit`. A single
/// line longer than the limit is returned unsplit.
fn chunk_lines(body: &[u8], limit: usize) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let len = line.len();
        if end > start && end - start + len > limit {
            chunks.push(&body[start..end]);
            start = end;
        }
        end += len;
    }
    if end > start {
        chunks.push(&body[start..end]);
    }
    chunks
}
