use super::entry::NotApplicable;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of running the page-out protocol for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutOutcome {
    /// This caller was the coordinator; `persisted` tells whether it wrote
    PagedOut { persisted: bool },
    NotApplicable(NotApplicable),
    /// Key has no entry in memory
    NotHot,
    /// Entry had lost its value; removed without writing
    Anomaly,
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub paged_out: usize,
    pub skipped: usize,
    pub failed: usize,
    pub anomalies: usize,
    pub write_throughs: usize,
    pub canary_fired: bool,
}

impl DrainReport {
    pub fn record(&mut self, outcome: PageOutOutcome) {
        match outcome {
            PageOutOutcome::PagedOut { .. } => self.paged_out += 1,
            PageOutOutcome::Anomaly => self.anomalies += 1,
            PageOutOutcome::NotApplicable(_) | PageOutOutcome::NotHot => self.skipped += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Live counters updated on the access and drain paths.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub gets: AtomicU64,
    pub memory_hits: AtomicU64,
    pub disk_hits: AtomicU64,
    pub supplier_uses: AtomicU64,
    pub page_out_puts: AtomicU64,
    pub write_throughs: AtomicU64,
    pub write_through_failures: AtomicU64,
    pub syncs: AtomicU64,
    pub page_outs: AtomicU64,
    pub page_out_failures: AtomicU64,
    pub anomalies: AtomicU64,
    pub await_timeouts: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of an `IdentityCache`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub gets: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub supplier_uses: u64,
    pub page_out_puts: u64,
    pub write_throughs: u64,
    pub write_through_failures: u64,
    pub syncs: u64,
    pub page_outs: u64,
    pub page_out_failures: u64,
    pub anomalies: u64,
    pub await_timeouts: u64,
    pub contention_retries: u64,
    pub canary_firings: u64,

    pub hot_entries: usize,
    pub idle_entries: usize,
    pub pending_page_outs: usize,
    pub dirty_entries: usize,
}

/// Gauges sampled alongside the counters.
pub(crate) struct Gauges {
    pub contention_retries: u64,
    pub canary_firings: u64,
    pub hot_entries: usize,
    pub idle_entries: usize,
    pub pending_page_outs: usize,
    pub dirty_entries: usize,
}

impl CacheStats {
    pub(crate) fn capture(name: &str, counters: &Counters, gauges: Gauges) -> Self {
        Self {
            name: name.to_string(),
            gets: Counters::read(&counters.gets),
            memory_hits: Counters::read(&counters.memory_hits),
            disk_hits: Counters::read(&counters.disk_hits),
            supplier_uses: Counters::read(&counters.supplier_uses),
            page_out_puts: Counters::read(&counters.page_out_puts),
            write_throughs: Counters::read(&counters.write_throughs),
            write_through_failures: Counters::read(&counters.write_through_failures),
            syncs: Counters::read(&counters.syncs),
            page_outs: Counters::read(&counters.page_outs),
            page_out_failures: Counters::read(&counters.page_out_failures),
            anomalies: Counters::read(&counters.anomalies),
            await_timeouts: Counters::read(&counters.await_timeouts),
            contention_retries: gauges.contention_retries,
            canary_firings: gauges.canary_firings,
            hot_entries: gauges.hot_entries,
            idle_entries: gauges.idle_entries,
            pending_page_outs: gauges.pending_page_outs,
            dirty_entries: gauges.dirty_entries,
        }
    }

    /// Share of gets answered from memory, in percent.
    pub fn hit_percent(&self) -> f64 {
        if self.gets == 0 {
            return 0.0;
        }
        self.memory_hits as f64 * 100.0 / self.gets as f64
    }

    /// One-line summary for the periodic log.
    pub fn summary(&self) -> String {
        format!(
            "{}: {:.2}% hit ({} gets, {} memory, {} disk, {} supplier); \
             {} page-out puts, {} write-throughs, {} syncs; {} in memory, {} dirty",
            self.name,
            self.hit_percent(),
            self.gets,
            self.memory_hits,
            self.disk_hits,
            self.supplier_uses,
            self.page_out_puts,
            self.write_throughs,
            self.syncs,
            self.hot_entries,
            self.dirty_entries,
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
