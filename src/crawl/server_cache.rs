use super::host::CrawlHost;
use super::server::CrawlServer;
use crate::cache::CacheRef;
use crate::core::CacheError;
use crate::facade::{CacheManager, IdentityCache};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::error;

pub const SERVERS_CACHE: &str = "servers";
pub const HOSTS_CACHE: &str = "hosts";

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Got suspicious address 0.0.0.0 for '{hostname}'")]
    UnspecifiedAddress { hostname: String },
}

pub type Result<T> = std::result::Result<T, CrawlError>;

/// Shared lookup of per-server and per-host crawl state.
pub struct ServerCache {
    servers: IdentityCache<CrawlServer>,
    hosts: IdentityCache<CrawlHost>,
}

impl ServerCache {
    pub fn new(servers: IdentityCache<CrawlServer>, hosts: IdentityCache<CrawlHost>) -> Self {
        Self { servers, hosts }
    }

    /// Opens the `servers` and `hosts` caches through `manager`.
    pub fn open(manager: &CacheManager, recycle: bool) -> Result<Self> {
        let servers = manager.object_cache::<CrawlServer>(SERVERS_CACHE, recycle)?;
        let hosts = manager.object_cache::<CrawlHost>(HOSTS_CACHE, recycle)?;
        Ok(Self::new(servers, hosts))
    }

    pub fn servers(&self) -> &IdentityCache<CrawlServer> {
        &self.servers
    }

    pub fn hosts(&self) -> &IdentityCache<CrawlHost> {
        &self.hosts
    }

    pub fn server_for(&self, server_key: &str) -> Result<CacheRef<CrawlServer>> {
        Ok(self
            .servers
            .get_or_create(server_key, || CrawlServer::new(server_key))?)
    }

    /// `None` for an empty hostname.
    pub fn host_for(&self, hostname: &str) -> Result<Option<CacheRef<CrawlHost>>> {
        if hostname.is_empty() {
            return Ok(None);
        }
        let host = self
            .hosts
            .get_or_create(hostname, || CrawlHost::new(hostname))?;
        if host.ip() == Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)) {
            return Err(CrawlError::UnspecifiedAddress {
                hostname: hostname.to_string(),
            });
        }
        Ok(Some(host))
    }

    pub fn contains_server(&self, server_key: &str) -> Result<bool> {
        Ok(self.servers.get(server_key)?.is_some())
    }

    pub fn contains_host(&self, hostname: &str) -> Result<bool> {
        Ok(self.hosts.get(hostname)?.is_some())
    }

    /// Calls `f` for every host ever stored, promoting each in turn.
    pub fn for_all_hosts(&self, mut f: impl FnMut(&CrawlHost)) -> Result<()> {
        for hostname in self.hosts.key_set()? {
            if let Some(host) = self.hosts.get(&hostname)? {
                f(&host);
            }
        }
        Ok(())
    }

    pub fn host_keys(&self) -> Result<Vec<String>> {
        Ok(self.hosts.key_set()?)
    }

    pub fn sync(&self) -> Result<()> {
        self.hosts.sync()?;
        self.servers.sync()?;
        Ok(())
    }

    /// Closes both caches; a failure on one does not stop the other.
    pub fn close(&self) -> Result<()> {
        let hosts = self.hosts.close();
        if let Err(err) = &hosts {
            error!("error closing hosts cache: {}", err);
        }
        let servers = self.servers.close();
        if let Err(err) = &servers {
            error!("error closing servers cache: {}", err);
        }
        hosts?;
        servers?;
        Ok(())
    }
}
