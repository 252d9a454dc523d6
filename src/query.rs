//! Query handle: the scan-path state machine (spec §4.5).
//!
//! Grounded on the original's `rrdeng_load_page_next`-style sequential
//! decode: preload the range, walk pages in `start_time` order, and
//! interpolate a starting position when the first matching page begins
//! before the requested time.

use std::sync::Arc;

use crate::{
	cache::PageCache,
	consts::{SAMPLE_SIZE, USEC_PER_SEC},
	index::{MetricPageIndex, PageInfo, PageLoader},
	page::{PageDescriptor, INVALID_TIME},
	stats::InstanceStats,
};

/// Per active query (spec §4.5).
pub struct QueryHandle {
	cache: Arc<PageCache>,
	metric_index: Arc<MetricPageIndex>,
	loader: Arc<dyn PageLoader + Send + Sync>,
	stats: Arc<InstanceStats>,
	end_time: i64,
	current: Option<Arc<PageDescriptor>>,
	next_page_time: i64,
	position: usize,
}

impl QueryHandle {
	/// `query_init`: preloads every page intersecting `[start_time,
	/// end_time]`. A range with no matching pages starts exhausted.
	pub fn query_init(
		metric_index: Arc<MetricPageIndex>,
		cache: Arc<PageCache>,
		loader: Arc<dyn PageLoader + Send + Sync>,
		stats: Arc<InstanceStats>,
		start_time: i64,
		end_time: i64,
	) -> Self {
		let matches = metric_index.preload(start_time, end_time, loader.as_ref());
		stats.record_consumer_started();
		Self {
			cache,
			metric_index,
			loader,
			stats,
			end_time,
			current: None,
			next_page_time: if matches.is_empty() { INVALID_TIME } else { start_time },
			position: 0,
		}
	}

	pub fn query_is_finished(&self) -> bool {
		self.next_page_time == INVALID_TIME && self.current.is_none()
	}

	/// `query_next`: the next `(sample, current_time)` pair, or `None` on
	/// exhaustion.
	pub fn query_next(&mut self) -> Option<(Vec<u8>, i64)> {
		if self.next_page_time == INVALID_TIME {
			return None;
		}

		if self.current.is_none() {
			let descriptor =
				self.metric_index
					.lookup_next(self.next_page_time, self.end_time, self.loader.as_ref())?;
			if descriptor.start_time() > self.end_time {
				descriptor.unpin();
				self.next_page_time = INVALID_TIME;
				return None;
			}
			self.position = self.initial_position(&descriptor);
			self.cache.touch(&descriptor);
			self.current = Some(descriptor);
		}

		let descriptor = self.current.clone().expect("checked above");
		let entries = descriptor.page_length() / SAMPLE_SIZE;

		if entries == 0 || self.position >= entries {
			descriptor.unpin();
			self.current = None;
			self.next_page_time = descriptor.end_time() + 1;
			return self.query_next();
		}

		let span = descriptor.span();
		let delta = if entries > 1 {
			(span.end_time - span.start_time) / (entries as i64 - 1)
		} else {
			0
		};
		let current_time = span.start_time + self.position as i64 * delta;
		let sample = self.read_sample(&descriptor, self.position);
		self.position += 1;
		Some((sample, current_time))
	}

	pub fn query_finalize(mut self) {
		if let Some(descriptor) = self.current.take() {
			descriptor.unpin();
		}
		self.stats.record_consumer_stopped();
	}

	fn initial_position(&self, descriptor: &PageDescriptor) -> usize {
		let span = descriptor.span();
		let entries = span.page_length / SAMPLE_SIZE;
		if span.start_time >= self.next_page_time || entries <= 1 {
			return 0;
		}
		let total_span = (span.end_time - span.start_time) as f64;
		if total_span <= 0.0 {
			return 0;
		}
		let frac = (self.next_page_time - span.start_time) as f64 / total_span;
		(((entries - 1) as f64) * frac).round() as usize
	}

	fn read_sample(&self, descriptor: &PageDescriptor, position: usize) -> Vec<u8> {
		let guard = self
			.cache
			.read(descriptor)
			.expect("descriptor pinned by this query must still be resident");
		let offset = position * SAMPLE_SIZE;
		guard[offset..offset + SAMPLE_SIZE].to_vec()
	}
}

/// One contiguous run of pages sharing the same inferred collection
/// interval (spec §4.5 "variable-step boundaries").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
	pub start_time: i64,
	pub points: usize,
	pub update_every_sec: i64,
}

/// Groups `pages` (in `start_time` order, already preloaded) into regions
/// of constant inferred Δt, falling back to the previous page's Δt for a
/// single-entry page and, failing that, to `metric_index`'s own on-disk
/// history via `lookup_filtered_prev` (spec §4.5). Returns the regions and
/// the largest Δt (in seconds) observed.
pub fn variable_step_boundaries(metric_index: &MetricPageIndex, pages: &[PageInfo]) -> (Vec<Region>, i64) {
	let mut regions: Vec<Region> = Vec::new();
	let mut max_delta_sec = 0i64;
	let mut prev_delta_sec: Option<i64> = None;

	for page in pages {
		if page.page_length == 0 {
			continue;
		}

		let delta_usec = page_delta_usec(page.start_time, page.end_time, page.page_length).or_else(|| {
			metric_index.lookup_filtered_prev(page.start_time).and_then(|prev| {
				let span = prev.span();
				page_delta_usec(span.start_time, span.end_time, span.page_length)
			})
		});

		let delta_sec = delta_usec
			.map(round_usec_to_sec)
			.or(prev_delta_sec)
			.unwrap_or(0);
		max_delta_sec = max_delta_sec.max(delta_sec);
		let points = (page.page_length / SAMPLE_SIZE).max(1);

		match regions.last_mut() {
			Some(region) if region.update_every_sec == delta_sec => region.points += points,
			_ => regions.push(Region {
				start_time: page.start_time,
				points,
				update_every_sec: delta_sec,
			}),
		}
		prev_delta_sec = Some(delta_sec);
	}

	(regions, max_delta_sec)
}

fn page_delta_usec(start_time: i64, end_time: i64, page_length: usize) -> Option<i64> {
	let entries = page_length / SAMPLE_SIZE;
	(entries > 1).then(|| (end_time - start_time) / (entries as i64 - 1))
}

fn round_usec_to_sec(usec: i64) -> i64 {
	((usec as f64) / (USEC_PER_SEC as f64)).round() as i64
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{collect::CollectHandle, collect::ChartAlignment, config::EngineConfig, index::MetricId, stats::{InstanceStats, StatsSink}, collect::BackpressureSink};

	struct NoopSink;
	impl BackpressureSink for NoopSink {
		fn request_invalidate_oldest(&self) {}
		fn request_flush(&self) {}
	}
	struct NoopLoader;
	impl PageLoader for NoopLoader {
		fn request_load(&self, _descriptor: &Arc<PageDescriptor>) {}
		fn await_load(&self, _descriptor: &Arc<PageDescriptor>) {}
	}

	fn id() -> MetricId {
		MetricId::from_bytes([11; 16])
	}

	fn populated(cache: Arc<PageCache>, metric_index: Arc<MetricPageIndex>) {
		let mut handle = CollectHandle::collect_init(
			id(),
			cache,
			metric_index,
			Arc::new(InstanceStats::new()),
			Arc::new(StatsSink::new()),
			Arc::new(NoopSink),
			Arc::new(ChartAlignment::new()),
		)
		.unwrap();
		for t in [0, 10, 20, 30] {
			handle.append(t, &[1, 2, 3, 4]).unwrap();
		}
		handle.flush_current_page().unwrap();
	}

	#[test]
	fn scans_every_sample_in_time_order() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let metric_index = Arc::new(MetricPageIndex::new(id()));
		populated(cache.clone(), metric_index.clone());

		let stats = Arc::new(InstanceStats::new());
		let mut query = QueryHandle::query_init(metric_index, cache, Arc::new(NoopLoader), stats.clone(), 0, 30);
		let mut times = Vec::new();
		while let Some((_, time)) = query.query_next() {
			times.push(time);
		}
		assert_eq!(times, vec![0, 10, 20, 30]);
		assert!(query.query_is_finished());
		assert_eq!(stats.active_consumers.load(std::sync::atomic::Ordering::Relaxed), 1);
		query.query_finalize();
		assert_eq!(stats.active_consumers.load(std::sync::atomic::Ordering::Relaxed), 0);
	}

	#[test]
	fn empty_range_is_immediately_finished() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let metric_index = Arc::new(MetricPageIndex::new(id()));
		let stats = Arc::new(InstanceStats::new());
		let mut query = QueryHandle::query_init(metric_index, cache, Arc::new(NoopLoader), stats, 0, 30);
		assert!(query.query_next().is_none());
		assert!(query.query_is_finished());
	}

	#[test]
	fn variable_step_boundaries_groups_constant_delta_pages() {
		let pages = vec![
			PageInfo {
				metric_id: id(),
				start_time: 0,
				end_time: 30_000_000,
				page_length: 4 * SAMPLE_SIZE,
			},
			PageInfo {
				metric_id: id(),
				start_time: 40_000_000,
				end_time: 70_000_000,
				page_length: 4 * SAMPLE_SIZE,
			},
		];
		let metric_index = MetricPageIndex::new(id());
		let (regions, max_delta) = variable_step_boundaries(&metric_index, &pages);
		assert_eq!(regions.len(), 1);
		assert_eq!(regions[0].points, 8);
		assert_eq!(max_delta, 10);
	}
}
