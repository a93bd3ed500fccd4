// lp-relay - fan-out replicator for line-protocol writes
//
// One listening endpoint (HTTP or UDP) forwards every write to a set of
// database backends in parallel. HTTP backends can buffer and replay failed
// writes so a backend outage does not interrupt ingestion.

pub mod config;
pub mod http;
pub mod lp;
pub mod pool;
pub mod relay;
pub mod retry;
pub mod udp;

pub use config::Config;
pub use relay::{Relay, Service};
