use super::stats::FetchStats;
use crate::core::{CacheLink, IdentityCacheable, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HTTPS_DEFAULT_PORT: &str = ":443";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerState {
    robots_fetched: Option<DateTime<Utc>>,
    valid_robots: bool,
    consecutive_connection_errors: u32,
    stats: FetchStats,
}

/// Per-server (`host[:port]`) crawl state.
#[derive(Debug, Serialize, Deserialize)]
pub struct CrawlServer {
    server: String,
    port: Option<u16>,
    state: Mutex<ServerState>,
    #[serde(skip)]
    link: CacheLink,
}

impl CrawlServer {
    pub fn new(server: &str) -> Self {
        let port = server
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok());
        Self {
            server: server.to_string(),
            port,
            state: Mutex::new(ServerState::default()),
            link: CacheLink::new(),
        }
    }

    /// Cache key for a URI's scheme and authority.
    ///
    /// https without an explicit port gets `:443` so it never shares state
    /// with plain http on the same host.
    pub fn key_for(scheme: &str, authority: &str) -> Option<String> {
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        if authority.is_empty() {
            return None;
        }
        let has_port = authority
            .rsplit_once(':')
            .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()));
        if scheme.eq_ignore_ascii_case("https") && !has_port {
            return Some(format!("{}{}", authority, HTTPS_DEFAULT_PORT));
        }
        Some(authority.to_string())
    }

    pub fn name(&self) -> &str {
        &self.server
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Records a robots.txt fetch attempt and whether it yielded usable rules.
    pub fn record_robots(&self, valid: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.robots_fetched = Some(Utc::now());
            state.valid_robots = valid;
        }
        self.make_dirty()
    }

    pub fn is_valid_robots(&self) -> bool {
        self.state.lock().valid_robots
    }

    /// A zero validity means fetched rules never expire.
    pub fn is_robots_expired(&self, validity: Duration, now: DateTime<Utc>) -> bool {
        let Some(fetched) = self.state.lock().robots_fetched else {
            return true;
        };
        if validity.is_zero() {
            return false;
        }
        match chrono::Duration::from_std(validity) {
            Ok(validity) => fetched + validity < now,
            Err(_) => false,
        }
    }

    pub fn increment_connection_errors(&self) -> Result<u32> {
        let errors = {
            let mut state = self.state.lock();
            state.consecutive_connection_errors += 1;
            state.consecutive_connection_errors
        };
        self.make_dirty()?;
        Ok(errors)
    }

    pub fn reset_connection_errors(&self) -> Result<()> {
        self.state.lock().consecutive_connection_errors = 0;
        self.make_dirty()
    }

    pub fn consecutive_connection_errors(&self) -> u32 {
        self.state.lock().consecutive_connection_errors
    }

    pub fn record_fetch(&self, success: bool, bytes: u64) -> Result<()> {
        self.state.lock().stats.tally(success, bytes);
        self.make_dirty()
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.state.lock().stats.clone()
    }
}

impl IdentityCacheable for CrawlServer {
    fn key(&self) -> &str {
        &self.server
    }

    fn cache_link(&self) -> &CacheLink {
        &self.link
    }
}
