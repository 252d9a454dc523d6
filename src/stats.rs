//! Observable statistics (spec §6): the fixed 37-field array exported to
//! the host process, plus the supplemented high-water-mark and
//! process-scoped global counters (see SPEC_FULL.md "Supplemented
//! features").
//!
//! Exposed as a typed struct rather than a bare array so call sites name
//! fields; `InstanceStats::snapshot` produces the host-facing fixed-order
//! `[u64; 37]` array spec §6 actually asks for. The page-cache-owned
//! counters (`populated_pages`, `committed_pages`, `cache_insertions`,
//! `cache_deletions`, `evictions`, `over_half_dirty_events`,
//! `flushing_pressure_page_deletions`) are not duplicated here: `snapshot`
//! reads them straight out of the `PageCache` that is their single source
//! of truth, so they can never drift out of sync with it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::PageCache;

/// Number of fields in the exported statistics array (spec §6).
pub const STATS_FIELD_COUNT: usize = 37;

/// Per-`Instance` counters not already owned by the `PageCache` (spec §6
/// minus the cache-owned gauges/counters minus the four global mirrors,
/// which live in [`StatsSink`]).
#[derive(Default)]
pub struct InstanceStats {
	pub active_producers: AtomicU64,
	pub active_consumers: AtomicU64,
	pub total_descriptors: AtomicU64,
	pub cache_hits: AtomicU64,
	pub cache_misses: AtomicU64,
	pub backfills: AtomicU64,
	pub pre_compress_bytes: AtomicU64,
	pub post_compress_bytes: AtomicU64,
	pub pre_decompress_bytes: AtomicU64,
	pub post_decompress_bytes: AtomicU64,
	pub io_write_bytes: AtomicU64,
	pub io_write_requests: AtomicU64,
	pub io_read_bytes: AtomicU64,
	pub io_read_requests: AtomicU64,
	pub write_extent_bytes: AtomicU64,
	pub write_extent_count: AtomicU64,
	pub read_extent_bytes: AtomicU64,
	pub read_extent_count: AtomicU64,
	pub datafile_creations: AtomicU64,
	pub datafile_deletions: AtomicU64,
	pub journalfile_creations: AtomicU64,
	pub journalfile_deletions: AtomicU64,
	pub page_cache_descriptor_count: AtomicU64,
	pub io_errors: AtomicU64,
	pub filesystem_errors: AtomicU64,
	pub reserved_fds: AtomicU64,

	/// `metric_API_max_producers`: the highest `active_producers` has ever
	/// reached, tracked outside the 37-field array so its indices stay
	/// stable (supplemented feature 1).
	max_active_producers: AtomicU64,
}

impl InstanceStats {
	pub fn new() -> Self {
		Self::default()
	}

	/// Increments `active_producers` and advances the high-water mark via
	/// a CAS retry loop, mirroring the original's
	/// `ctx->metric_API_max_producers` update.
	pub fn record_producer_started(&self) {
		let current = self.active_producers.fetch_add(1, Ordering::AcqRel) + 1;
		let mut observed = self.max_active_producers.load(Ordering::Acquire);
		while current > observed {
			match self.max_active_producers.compare_exchange_weak(
				observed,
				current,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => break,
				Err(actual) => observed = actual,
			}
		}
	}

	pub fn record_producer_stopped(&self) {
		self.active_producers.fetch_sub(1, Ordering::AcqRel);
	}

	pub fn max_active_producers(&self) -> u64 {
		self.max_active_producers.load(Ordering::Acquire)
	}

	/// Called from `QueryHandle::query_init`/`query_finalize`, mirroring
	/// `record_producer_started`/`_stopped` for the collect side.
	pub fn record_consumer_started(&self) {
		self.active_consumers.fetch_add(1, Ordering::AcqRel);
	}

	pub fn record_consumer_stopped(&self) {
		self.active_consumers.fetch_sub(1, Ordering::AcqRel);
	}

	/// Produces the fixed-order 37-field snapshot (spec §6): the cache's
	/// own gauges/counters come straight from `cache`, the four global
	/// mirrors from `sink`.
	pub fn snapshot(&self, cache: &PageCache, sink: &StatsSink) -> [u64; STATS_FIELD_COUNT] {
		let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
		[
			load(&self.active_producers),
			load(&self.active_consumers),
			load(&self.total_descriptors),
			cache.populated_pages() as u64,
			cache.committed_pages() as u64,
			cache.cache_insertions() as u64,
			cache.cache_deletions() as u64,
			load(&self.cache_hits),
			load(&self.cache_misses),
			load(&self.backfills),
			cache.evictions() as u64,
			load(&self.pre_compress_bytes),
			load(&self.post_compress_bytes),
			load(&self.pre_decompress_bytes),
			load(&self.post_decompress_bytes),
			load(&self.io_write_bytes),
			load(&self.io_write_requests),
			load(&self.io_read_bytes),
			load(&self.io_read_requests),
			load(&self.write_extent_bytes),
			load(&self.write_extent_count),
			load(&self.read_extent_bytes),
			load(&self.read_extent_count),
			load(&self.datafile_creations),
			load(&self.datafile_deletions),
			load(&self.journalfile_creations),
			load(&self.journalfile_deletions),
			load(&self.page_cache_descriptor_count),
			load(&self.io_errors),
			load(&self.filesystem_errors),
			sink.global_io_errors(),
			sink.global_filesystem_errors(),
			load(&self.reserved_fds),
			cache.over_half_dirty_events() as u64,
			sink.global_over_half_dirty_events(),
			cache.flushing_pressure_page_deletions() as u64,
			sink.global_flushing_pressure_page_deletions(),
		]
	}
}

/// Process-scoped registry for the counters spec §6 keeps as global
/// mirrors rather than per-instance (supplemented feature 2). Avoids a
/// hidden singleton: an `Instance` is handed one explicitly at `init`
/// (spec's design note in §9).
#[derive(Default)]
pub struct StatsSink {
	global_io_errors: AtomicU64,
	global_filesystem_errors: AtomicU64,
	global_over_half_dirty_events: AtomicU64,
	global_flushing_pressure_page_deletions: AtomicU64,
}

impl StatsSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_io_error(&self) {
		self.global_io_errors.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_filesystem_error(&self) {
		self.global_filesystem_errors.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_over_half_dirty_event(&self) {
		self.global_over_half_dirty_events.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_flushing_pressure_page_deletion(&self) {
		self.global_flushing_pressure_page_deletions
			.fetch_add(1, Ordering::Relaxed);
	}

	pub fn global_io_errors(&self) -> u64 {
		self.global_io_errors.load(Ordering::Relaxed)
	}

	pub fn global_filesystem_errors(&self) -> u64 {
		self.global_filesystem_errors.load(Ordering::Relaxed)
	}

	pub fn global_over_half_dirty_events(&self) -> u64 {
		self.global_over_half_dirty_events.load(Ordering::Relaxed)
	}

	pub fn global_flushing_pressure_page_deletions(&self) -> u64 {
		self.global_flushing_pressure_page_deletions.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{config::EngineConfig, index::MetricId};

	#[test]
	fn snapshot_has_37_fields_in_order() {
		let stats = InstanceStats::new();
		stats.active_producers.store(3, Ordering::Relaxed);
		let cache = PageCache::new(EngineConfig::default());
		let descriptor = cache.create_page(MetricId::from_bytes([9; 16])).unwrap();
		descriptor.set_info(0, 1);
		let correlation_id = cache.next_correlation_id();
		cache.commit(descriptor, correlation_id);
		cache.invalidate_oldest_dirty();
		let sink = StatsSink::new();
		sink.record_io_error();

		let snapshot = stats.snapshot(&cache, &sink);
		assert_eq!(snapshot.len(), STATS_FIELD_COUNT);
		assert_eq!(snapshot[0], 3); // active_producers
		assert_eq!(snapshot[10], 0); // evictions: none reclaimed, only invalidated
		assert_eq!(snapshot[30], 1); // global_io_errors
		assert_eq!(snapshot[35], 1); // flushing_pressure_page_deletions
	}

	#[test]
	fn high_water_mark_tracks_the_peak_not_the_current_value() {
		let stats = InstanceStats::new();
		stats.record_producer_started();
		stats.record_producer_started();
		stats.record_producer_stopped();
		assert_eq!(stats.active_producers.load(Ordering::Relaxed), 1);
		assert_eq!(stats.max_active_producers(), 2);
	}

	#[test]
	fn global_counters_are_shared_across_instances() {
		let sink = StatsSink::new();
		sink.record_over_half_dirty_event();
		sink.record_over_half_dirty_event();
		assert_eq!(sink.global_over_half_dirty_events(), 2);
	}
}
