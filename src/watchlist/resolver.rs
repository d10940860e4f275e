use crate::error_handling::types::WatchError;
use async_trait::async_trait;
use log::trace;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;

/// Turns a watchlist hostname into the addresses it currently points to.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<HashSet<IpAddr>, WatchError>;
}

/// Resolver backed by the system's name service, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, name: &str) -> Result<HashSet<IpAddr>, WatchError> {
        // lookup_host wants a port; it is discarded below
        let query = format!("{}:0", name);
        let addrs = match timeout(self.timeout, lookup_host(query)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => return Err(WatchError::ResolutionFailed(format!("{}: {}", name, e))),
            Err(_) => {
                return Err(WatchError::ResolutionTimeout(format!(
                    "{} after {:?}",
                    name, self.timeout
                )))
            }
        };
        let resolved: HashSet<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        trace!("{} resolved to {:?}", name, resolved);
        Ok(resolved)
    }
}

/// Resolves every name, keeping per-name outcomes apart.
pub async fn resolve_all(
    resolver: &dyn HostResolver,
    names: Vec<String>,
) -> Vec<(String, Result<HashSet<IpAddr>, WatchError>)> {
    let mut results = Vec::with_capacity(names.len());
    for name in names {
        let outcome = resolver.resolve(&name).await;
        results.push((name, outcome));
    }
    results
}
