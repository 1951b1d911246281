//! The `ServerContext` holds the state shared by every worker

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::dns::cache::RecordCache;
use crate::dns::config::ServerConfig;
use crate::dns::overrides::{OverrideDb, OverrideError};
use crate::dns::relay::{DnsRelay, RelayError};

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Override(OverrideError),
    Relay(RelayError),
    BadAddress(std::net::AddrParseError),
}

type Result<T> = std::result::Result<T, ContextError>;

#[derive(Default)]
pub struct ServerStatistics {
    pub query_count: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub upstream_queries: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_query_count(&self) -> usize {
        self.query_count.load(Ordering::Acquire)
    }

    pub fn get_cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Acquire)
    }

    pub fn get_upstream_queries(&self) -> usize {
        self.upstream_queries.load(Ordering::Acquire)
    }
}

/// Everything a worker needs to answer a query: the override table, the
/// cache, the relay, and the knobs taken from the configuration.
pub struct ServerContext {
    pub overrides: OverrideDb,
    pub cache: Arc<RecordCache>,
    pub relay: Arc<DnsRelay>,
    pub local_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    /// TTL for override answers, and the ceiling for upstream TTLs.
    pub cache_ttl: u32,
    pub sweep_interval: Duration,
    pub workers: usize,
    pub blackhole_nxdomain: bool,
    pub statistics: ServerStatistics,
    pub shutdown: Arc<AtomicBool>,
}

impl ServerContext {
    pub fn from_config(config: &ServerConfig) -> Result<ServerContext> {
        let local_ip: IpAddr = config.local_ip.parse()?;
        let upstream_ip: IpAddr = config.upstream.ip.parse()?;
        let upstream_addr = SocketAddr::new(upstream_ip, config.upstream.port);

        let overrides = OverrideDb::load(Path::new(&config.database_file), config.cache_ttl)?;
        let relay = Arc::new(DnsRelay::new(upstream_addr)?);

        Ok(ServerContext {
            overrides,
            cache: Arc::new(RecordCache::new(config.cache_size)),
            relay,
            local_addr: SocketAddr::new(local_ip, config.local_port),
            upstream_addr,
            cache_ttl: config.cache_ttl,
            sweep_interval: Duration::from_secs(config.sweep_interval),
            workers: config.workers,
            blackhole_nxdomain: config.blackhole_nxdomain,
            statistics: ServerStatistics::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
