use serde::{Deserialize, Serialize};

/// Fetch outcome tallies kept per host and per server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_bytes: u64,
}

impl FetchStats {
    pub fn tally(&mut self, success: bool, bytes: u64) {
        self.attempts += 1;
        if success {
            self.successes += 1;
            self.total_bytes += bytes;
        } else {
            self.failures += 1;
        }
    }
}
