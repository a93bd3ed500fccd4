// Relay lifecycle and supervision
//
// A relay is one listening endpoint. The service owns every configured
// relay by name, runs them concurrently, and stops them together.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::error;

use crate::config::Config;
use crate::http::HttpRelay;
use crate::udp::UdpRelay;

/// One listening endpoint owned by the service.
#[async_trait]
pub trait Relay: Send + Sync {
    fn name(&self) -> &str;

    /// Serve until the listener fails or `stop` is called. Returns `Ok`
    /// after a stop-initiated shutdown.
    async fn run(self: Arc<Self>) -> Result<()>;

    /// Signal the listener to close. In-flight work finishes on its own.
    fn stop(&self);
}

/// The set of configured relays, keyed by name.
pub struct Service {
    relays: HashMap<String, Arc<dyn Relay>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("relays", &self.relays.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// Build every configured relay. Relay names must be unique across the
    /// HTTP and UDP sections.
    pub fn new(config: Config) -> Result<Service> {
        let mut relays: HashMap<String, Arc<dyn Relay>> = HashMap::new();

        for cfg in config.http_relays {
            let relay = Arc::new(HttpRelay::new(cfg)?);
            insert(&mut relays, relay)?;
        }
        for cfg in config.udp_relays {
            let relay = Arc::new(UdpRelay::new(cfg)?);
            insert(&mut relays, relay)?;
        }

        Ok(Service { relays })
    }

    /// Run every relay until all of them have exited. Individual failures
    /// are logged; the service itself fails only when no relay survived.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for relay in self.relays.values() {
            let relay = Arc::clone(relay);
            tasks.spawn(async move {
                let name = relay.name().to_string();
                match relay.run().await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(relay = %name, error = %err, "relay terminated");
                        false
                    }
                }
            });
        }

        let total = tasks.len();
        let mut healthy = 0usize;
        while let Some(exited) = tasks.join_next().await {
            if matches!(exited, Ok(true)) {
                healthy += 1;
            }
        }

        if total > 0 && healthy == 0 {
            bail!("all relays terminated with errors");
        }
        Ok(())
    }

    pub fn stop(&self) {
        for relay in self.relays.values() {
            relay.stop();
        }
    }
}

fn insert(relays: &mut HashMap<String, Arc<dyn Relay>>, relay: Arc<dyn Relay>) -> Result<()> {
    let name = relay.name().to_string();
    if relays.contains_key(&name) {
        bail!("duplicate relay: {name:?}");
    }
    relays.insert(name, relay);
    Ok(())
}
