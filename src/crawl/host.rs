use super::stats::FetchStats;
use crate::core::{CacheLink, IdentityCacheable, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::trace;

/// How long a resolved address stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpTtl {
    Never,
    Expires(Duration),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HostState {
    ip: Option<IpAddr>,
    /// `None` until the first lookup (successful or not)
    ip_fetched: Option<DateTime<Utc>>,
    ip_ttl: Option<IpTtl>,
    country_code: Option<String>,
    earliest_next_emit: Option<DateTime<Utc>>,
    stats: FetchStats,
}

/// Per-hostname crawl state.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrawlHost {
    hostname: String,
    state: Mutex<HostState>,
    #[serde(skip)]
    link: CacheLink,
}

impl CrawlHost {
    /// A literal IP address as hostname resolves to itself, permanently.
    pub fn new(hostname: &str) -> Self {
        let mut state = HostState::default();
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            state.ip = Some(ip);
            state.ip_fetched = Some(Utc::now());
            state.ip_ttl = Some(IpTtl::Never);
        }
        Self {
            hostname: hostname.to_string(),
            state: Mutex::new(state),
            link: CacheLink::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.state.lock().ip
    }

    pub fn has_been_looked_up(&self) -> bool {
        self.state.lock().ip_fetched.is_some()
    }

    pub fn ip_fetched(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ip_fetched
    }

    pub fn ip_ttl(&self) -> Option<IpTtl> {
        self.state.lock().ip_ttl
    }

    /// Records a lookup result. `None` records a failed lookup.
    pub fn set_ip(&self, ip: Option<IpAddr>, ttl: IpTtl) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.ip = ip;
            state.ip_fetched = Some(Utc::now());
            state.ip_ttl = Some(ttl);
        }
        trace!(host = %self.hostname, ip = ?ip, "host address set");
        self.make_dirty()
    }

    /// True when the address is missing or its TTL has run out.
    pub fn is_ip_expired(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        match (state.ip_fetched, state.ip_ttl) {
            (Some(_), Some(IpTtl::Never)) => false,
            (Some(fetched), Some(IpTtl::Expires(ttl))) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => fetched + ttl <= now,
                Err(_) => false,
            },
            _ => true,
        }
    }

    pub fn country_code(&self) -> Option<String> {
        self.state.lock().country_code.clone()
    }

    pub fn set_country_code(&self, code: Option<String>) -> Result<()> {
        self.state.lock().country_code = code;
        self.make_dirty()
    }

    pub fn earliest_next_emit(&self) -> Option<DateTime<Utc>> {
        self.state.lock().earliest_next_emit
    }

    pub fn set_earliest_next_emit(&self, at: DateTime<Utc>) -> Result<()> {
        self.state.lock().earliest_next_emit = Some(at);
        self.make_dirty()
    }

    pub fn record_fetch(&self, success: bool, bytes: u64) -> Result<()> {
        self.state.lock().stats.tally(success, bytes);
        self.make_dirty()
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.state.lock().stats.clone()
    }
}

impl IdentityCacheable for CrawlHost {
    fn key(&self) -> &str {
        &self.hostname
    }

    fn cache_link(&self) -> &CacheLink {
        &self.link
    }
}
