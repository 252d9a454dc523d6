//! Collect handle: the append-path state machine (spec §4.4).
//!
//! Grounded on the original `rrdeng_store_metric_init` /
//! `_next` / `_flush_current_page` / `_finalize`, adapted from the
//! original's per-chart C struct into an owned Rust handle that borrows
//! the shared cache, metric index, and statistics it needs.

use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use crate::{
	cache::{BackpressureAction, PageCache},
	consts::{EMPTY_SAMPLE, SAMPLE_SIZE},
	error::Result,
	index::{MetricId, MetricPageIndex},
	page::{PageDescriptor, INVALID_TIME},
	stats::{InstanceStats, StatsSink},
};

/// Externally shared alignment hint for one chart's leading dimension
/// (`chart_page_alignment_hint` in spec §4.4): the byte length of the
/// leading dimension's currently open page. Every dimension's
/// `CollectHandle` reads and, if it is the leading dimension, updates it.
#[derive(Default)]
pub struct ChartAlignment(AtomicUsize);

impl ChartAlignment {
	pub fn new() -> Self {
		Self(AtomicUsize::new(0))
	}

	pub fn get(&self) -> usize {
		self.0.load(Ordering::Acquire)
	}

	pub fn set(&self, length: usize) {
		self.0.store(length, Ordering::Release);
	}
}

/// What a committed page's backpressure verdict obliges the caller to do
/// (spec §4.6); a thin decoupling seam so `collect` never depends on the
/// concrete worker type, mirrored on [`crate::index::PageLoader`].
pub trait BackpressureSink {
	fn request_invalidate_oldest(&self);

	/// Nudges the worker to drain a batch of the commit ring to the codec
	/// (spec §2 data flow "drains the commit ring to the external datafile
	/// writer, then clears DIRTY"). Called after every successful commit,
	/// regardless of backpressure state.
	fn request_flush(&self);
}

/// Per active collector (spec §4.4): at most one per metric, enforced by
/// the metric index's writer count.
pub struct CollectHandle {
	metric_id: MetricId,
	cache: Arc<PageCache>,
	metric_index: Arc<MetricPageIndex>,
	stats: Arc<InstanceStats>,
	stats_sink: Arc<StatsSink>,
	sink: Arc<dyn BackpressureSink + Send + Sync>,
	alignment: Arc<ChartAlignment>,

	current: Option<Arc<PageDescriptor>>,
	/// Kept for state-machine fidelity with the original's `prev_descr`;
	/// deliberately never populated (spec §4.4 design note: pinning a
	/// trailing page deadlocks with eviction).
	prev: Option<Arc<PageDescriptor>>,
	correlation_id: u64,
	unaligned_page: bool,
}

impl CollectHandle {
	/// `collect_init`: registers this handle as the metric's sole writer.
	pub fn collect_init(
		metric_id: MetricId,
		cache: Arc<PageCache>,
		metric_index: Arc<MetricPageIndex>,
		stats: Arc<InstanceStats>,
		stats_sink: Arc<StatsSink>,
		sink: Arc<dyn BackpressureSink + Send + Sync>,
		alignment: Arc<ChartAlignment>,
	) -> Result<Self> {
		metric_index.register_writer()?;
		Ok(Self {
			metric_id,
			cache,
			metric_index,
			stats,
			stats_sink,
			sink,
			alignment,
			current: None,
			prev: None,
			correlation_id: 0,
			unaligned_page: false,
		})
	}

	/// `append`: the core algorithm of spec §4.4.
	pub fn append(&mut self, point_in_time: i64, sample: &[u8; SAMPLE_SIZE]) -> Result<()> {
		let hint = self.alignment.get();
		let mut perfect_alignment = false;
		let mut must_flush_unaligned_page = false;

		if let Some(descr) = &self.current {
			let page_length = descr.page_length();
			if page_length == hint {
				perfect_alignment = true;
			}
			if page_length + SAMPLE_SIZE < hint {
				self.unaligned_page = true;
			}
			if self.unaligned_page && hint <= SAMPLE_SIZE {
				must_flush_unaligned_page = true;
				self.unaligned_page = false;
			}
		}

		let page_size = self.cache.page_size();
		let needs_new_page = match &self.current {
			None => true,
			Some(descr) => descr.page_length() + SAMPLE_SIZE > page_size || must_flush_unaligned_page,
		};

		if needs_new_page {
			self.flush_current_page()?;
			let descriptor = self.cache.create_page(self.metric_id)?;
			self.correlation_id = self.cache.next_correlation_id();
			if hint == 0 {
				perfect_alignment = true;
			}
			self.current = Some(descriptor);
		}

		let descriptor = self.current.clone().expect("just created or already open");
		let was_first_sample = descriptor.start_time() == INVALID_TIME;
		let offset = descriptor.page_length();

		{
			let mut guard = self
				.cache
				.write(&descriptor)
				.expect("freshly admitted or still-resident page must be writable");
			guard[offset..offset + SAMPLE_SIZE].copy_from_slice(sample);
		}
		descriptor.set_info(point_in_time, offset + SAMPLE_SIZE);

		if perfect_alignment {
			self.alignment.set(descriptor.page_length());
		}

		if was_first_sample {
			self.stats.record_producer_started();
			self.metric_index.insert(descriptor)?;
		} else {
			self.metric_index.add_new_metric_time(point_in_time);
		}

		Ok(())
	}

	/// `flush_current_page`: destroys an empty page, punches a hole through
	/// an all-sentinel one, or commits a real one (spec §4.4).
	pub fn flush_current_page(&mut self) -> Result<()> {
		let Some(descriptor) = self.current.take() else {
			return Ok(());
		};

		if descriptor.page_length() == 0 {
			self.cache.discard(&descriptor);
			return Ok(());
		}

		self.stats.record_producer_stopped();
		if let Some(prev) = self.prev.take() {
			prev.unpin();
		}

		let is_empty = {
			let guard = self
				.cache
				.read(&descriptor)
				.expect("committed-bound page must still be resident");
			guard[..descriptor.page_length()]
				.chunks_exact(SAMPLE_SIZE)
				.all(|sample| sample == EMPTY_SAMPLE.as_slice())
		};

		if is_empty {
			self.metric_index.remove(descriptor.start_time());
			self.cache.discard(&descriptor);
			return Ok(());
		}

		match self.cache.commit(descriptor, self.correlation_id) {
			BackpressureAction::None => {}
			BackpressureAction::OverHalfDirty => {
				self.stats_sink.record_over_half_dirty_event();
			}
			BackpressureAction::InvalidateOldest => {
				self.sink.request_invalidate_oldest();
			}
		}
		self.sink.request_flush();
		Ok(())
	}

	/// `collect_finalize`: returns `true` if the metric is now empty and
	/// writer-less, so the caller may drop it.
	pub fn collect_finalize(mut self) -> Result<bool> {
		self.flush_current_page()?;
		if let Some(prev) = self.prev.take() {
			prev.unpin();
		}
		Ok(self.metric_index.unregister_writer())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::EngineConfig;

	struct NoopSink;
	impl BackpressureSink for NoopSink {
		fn request_invalidate_oldest(&self) {}
		fn request_flush(&self) {}
	}

	fn handle(cache: Arc<PageCache>, metric_id: MetricId) -> CollectHandle {
		CollectHandle::collect_init(
			metric_id,
			cache.clone(),
			Arc::new(MetricPageIndex::new(metric_id)),
			Arc::new(InstanceStats::new()),
			Arc::new(StatsSink::new()),
			Arc::new(NoopSink),
			Arc::new(ChartAlignment::new()),
		)
		.unwrap()
	}

	fn id() -> MetricId {
		MetricId::from_bytes([8; 16])
	}

	#[test]
	fn single_sample_opens_a_page_and_tracks_time() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut h = handle(cache, id());
		h.append(100, &[1, 2, 3, 4]).unwrap();
		assert_eq!(h.metric_index.latest_time(), 100);
		assert_eq!(h.metric_index.oldest_time(), 100);
	}

	#[test]
	fn flush_of_empty_page_discards_without_commit() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut h = handle(cache.clone(), id());
		h.current = Some(cache.create_page(id()).unwrap());
		h.flush_current_page().unwrap();
		assert_eq!(cache.committed_pages(), 0);
	}

	#[test]
	fn non_empty_flush_commits_the_page() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut h = handle(cache.clone(), id());
		h.append(1, &[9, 9, 9, 9]).unwrap();
		h.flush_current_page().unwrap();
		assert_eq!(cache.committed_pages(), 1);
	}

	#[test]
	fn all_sentinel_page_is_punched_not_committed() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut h = handle(cache.clone(), id());
		h.append(1, &EMPTY_SAMPLE).unwrap();
		h.flush_current_page().unwrap();
		assert_eq!(cache.committed_pages(), 0);
	}

	#[test]
	fn finalize_reports_deletable_when_empty() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let h = handle(cache, id());
		assert!(h.collect_finalize().unwrap());
	}

	#[test]
	fn finalize_reports_not_deletable_with_committed_pages() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut h = handle(cache, id());
		h.append(1, &[1, 1, 1, 1]).unwrap();
		h.flush_current_page().unwrap();
		assert!(!h.collect_finalize().unwrap());
	}
}
