// Relay configuration
//
// Loaded from a single TOML file holding ordered lists of HTTP and UDP
// ingress definitions. Unknown keys are startup errors. Duration values use
// humantime strings ("10s", "500ms") and are parsed where the relays are
// constructed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "http")]
    pub http_relays: Vec<HttpConfig>,

    #[serde(default, rename = "udp")]
    pub udp_relays: Vec<UdpConfig>,
}

impl Config {
    /// Parse the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpConfig {
    /// Identifies this relay; defaults to `<scheme>://<bind-addr>`.
    #[serde(default)]
    pub name: String,

    /// Listening host:port.
    pub bind_addr: String,

    /// Combined certificate-and-key PEM; serving switches to HTTPS when set.
    #[serde(default)]
    pub ssl_combined_pem: Option<PathBuf>,

    /// Retention policy injected into requests that carry none.
    #[serde(default)]
    pub default_retention_policy: String,

    /// Backends every write is forwarded to.
    #[serde(default, rename = "output")]
    pub outputs: Vec<HttpOutputConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpOutputConfig {
    /// Identifies the backend; defaults to its location.
    #[serde(default)]
    pub name: String,

    /// URL of the backend's write endpoint.
    pub location: String,

    /// Per-backend request timeout. Default 10s.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Retry-buffer capacity; buffering is enabled when greater than zero.
    #[serde(default)]
    pub buffer_size_mb: usize,

    /// Largest coalesced batch the retry buffer will build. Default 512.
    #[serde(default)]
    pub max_batch_kb: usize,

    /// Longest delay between retry attempts. Default 10s.
    #[serde(default)]
    pub max_delay_interval: Option<String>,

    /// Accept self-signed backend certificates. Development only.
    #[serde(default)]
    pub skip_tls_verification: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct UdpConfig {
    /// Identifies this relay; defaults to `udp://<bind-addr>`.
    #[serde(default)]
    pub name: String,

    /// Listening host:port.
    pub bind_addr: String,

    /// Timestamp precision applied to incoming datagrams.
    #[serde(default)]
    pub precision: String,

    /// Socket receive buffer size in bytes; zero keeps the system default.
    #[serde(default)]
    pub read_buffer: usize,

    /// Backends every datagram is forwarded to.
    #[serde(default, rename = "output")]
    pub outputs: Vec<UdpOutputConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct UdpOutputConfig {
    /// Identifies the backend; defaults to its location.
    #[serde(default)]
    pub name: String,

    /// host:port the datagrams are sent to.
    pub location: String,

    /// Largest payload sent in one datagram. Default 1024.
    #[serde(default)]
    pub mtu: usize,
}
