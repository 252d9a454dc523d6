//! Per-metric page index (spec §3, §4.2).

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
	error::{EngineError, Result},
	index::MetricId,
	page::{PageDescriptor, PageSpan, INVALID_TIME},
};

/// Informational snapshot returned by `preload` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
	pub metric_id: MetricId,
	pub start_time: i64,
	pub end_time: i64,
	pub page_length: usize,
}

/// Anything that can fault a non-resident page back into the cache and
/// wake whoever is waiting on it. Implemented by the worker handle; kept
/// as a trait so the index has no compile-time dependency on the worker.
pub trait PageLoader {
	fn request_load(&self, descriptor: &Arc<PageDescriptor>);
	fn await_load(&self, descriptor: &Arc<PageDescriptor>);
}

struct State {
	pages: BTreeMap<i64, Arc<PageDescriptor>>,
	oldest_time: i64,
	latest_time: i64,
	writers: u8,
}

impl State {
	fn new() -> Self {
		Self {
			pages: BTreeMap::new(),
			oldest_time: INVALID_TIME,
			latest_time: INVALID_TIME,
			writers: 0,
		}
	}
}

/// Ordered map of one metric's pages, keyed by `start_time` (spec §4.2).
pub struct MetricPageIndex {
	pub metric_id: MetricId,
	state: RwLock<State>,
}

impl MetricPageIndex {
	pub fn new(metric_id: MetricId) -> Self {
		Self {
			metric_id,
			state: RwLock::new(State::new()),
		}
	}

	pub fn oldest_time(&self) -> i64 {
		self.state.read().oldest_time
	}

	pub fn latest_time(&self) -> i64 {
		self.state.read().latest_time
	}

	pub fn page_count(&self) -> usize {
		self.state.read().pages.len()
	}

	pub fn writer_count(&self) -> u8 {
		self.state.read().writers
	}

	/// Registers a new active collector. Fails the single-writer contract
	/// (spec §4.4) with an `Invariant` error if one is already registered.
	pub fn register_writer(&self) -> Result<()> {
		let mut state = self.state.write();
		if state.writers >= 1 {
			return Err(EngineError::Invariant(
				"metric already has an active collect handle".into(),
			));
		}
		state.writers += 1;
		Ok(())
	}

	/// Returns `true` if the metric is now empty and has no active writers,
	/// so the caller may drop it (spec §4.4 `collect_finalize`).
	pub fn unregister_writer(&self) -> bool {
		let mut state = self.state.write();
		state.writers = state.writers.saturating_sub(1);
		state.writers == 0 && state.pages.is_empty()
	}

	/// `insert`: called on the first sample of a new page. Fails with
	/// `OutOfOrderTime` if `start_time` regresses behind the metric's
	/// current `latest_time` (spec §4.2).
	pub fn insert(&self, descriptor: Arc<PageDescriptor>) -> Result<()> {
		let span = descriptor.span();
		let mut state = self.state.write();
		if state.latest_time != INVALID_TIME && span.start_time < state.latest_time {
			return Err(EngineError::OutOfOrderTime {
				metric: self.metric_id,
			});
		}
		if state.oldest_time == INVALID_TIME || span.start_time < state.oldest_time {
			state.oldest_time = span.start_time;
		}
		if span.end_time > state.latest_time {
			state.latest_time = span.end_time;
		}
		state.pages.insert(span.start_time, descriptor);
		Ok(())
	}

	/// `add_new_metric_time`: extends `latest_time` on every subsequent
	/// sample of the currently-open page.
	pub fn add_new_metric_time(&self, end_time: i64) {
		let mut state = self.state.write();
		if end_time > state.latest_time {
			state.latest_time = end_time;
		}
	}

	/// Removes a descriptor entirely (`punch_hole`, or worker-driven
	/// eviction/backpressure deletion). Recomputes `oldest_time`/
	/// `latest_time` from the remaining pages.
	pub fn remove(&self, start_time: i64) -> Option<Arc<PageDescriptor>> {
		let mut state = self.state.write();
		let removed = state.pages.remove(&start_time)?;
		state.oldest_time = state
			.pages
			.values()
			.next()
			.map(|d| d.span().start_time)
			.unwrap_or(INVALID_TIME);
		state.latest_time = state
			.pages
			.values()
			.map(|d| d.span().end_time)
			.max()
			.unwrap_or(INVALID_TIME);
		Some(removed)
	}

	/// `lookup_exact`: the descriptor whose span contains `point_in_time`,
	/// pinned. `INVALID_TIME` means "the latest populated page".
	pub fn lookup_exact(
		&self,
		point_in_time: i64,
		loader: &dyn PageLoader,
	) -> Option<Arc<PageDescriptor>> {
		let candidate = {
			let state = self.state.read();
			if point_in_time == INVALID_TIME {
				state.pages.values().next_back().cloned()
			} else {
				state
					.pages
					.range(..=point_in_time)
					.next_back()
					.map(|(_, d)| d.clone())
					.filter(|d| d.contains(point_in_time))
			}
		}?;

		self.ensure_populated(&candidate, loader);
		candidate.pin();
		Some(candidate)
	}

	/// `lookup_next`: the first page (ordered by `start_time`) whose span
	/// intersects `[lower_bound_ts, upper_bound_ts]`, pinned.
	pub fn lookup_next(
		&self,
		lower_bound_ts: i64,
		upper_bound_ts: i64,
		loader: &dyn PageLoader,
	) -> Option<Arc<PageDescriptor>> {
		let candidate = {
			let state = self.state.read();
			state
				.pages
				.values()
				.find(|d| d.intersects(lower_bound_ts, upper_bound_ts))
				.cloned()
		}?;

		self.ensure_populated(&candidate, loader);
		candidate.pin();
		Some(candidate)
	}

	/// `preload`: ensures every page intersecting `[from, to]` is
	/// populated and returns snapshots of them.
	pub fn preload(&self, from: i64, to: i64, loader: &dyn PageLoader) -> Vec<PageInfo> {
		let candidates: Vec<_> = {
			let state = self.state.read();
			state
				.pages
				.values()
				.filter(|d| d.intersects(from, to))
				.cloned()
				.collect()
		};

		candidates
			.iter()
			.for_each(|d| self.ensure_populated(d, loader));

		candidates
			.iter()
			.map(|d| {
				let span = d.span();
				PageInfo {
					metric_id: d.metric_id,
					start_time: span.start_time,
					end_time: span.end_time,
					page_length: span.page_length,
				}
			})
			.collect()
	}

	/// `oldest_time_in_range`: smallest `start_time` among pages
	/// intersecting `[from, to]`, or `INVALID_TIME`.
	pub fn oldest_time_in_range(&self, from: i64, to: i64) -> i64 {
		self.state
			.read()
			.pages
			.values()
			.filter(|d| d.intersects(from, to))
			.map(|d| d.span().start_time)
			.min()
			.unwrap_or(INVALID_TIME)
	}

	/// All descriptors in `start_time` order; used by variable-step
	/// boundary inference (spec §4.5).
	pub fn pages_in_order(&self) -> Vec<Arc<PageDescriptor>> {
		self.state.read().pages.values().cloned().collect()
	}

	/// The most recent descriptor with at least two points and a valid
	/// span, searching backwards from (but not including) `before`. Used
	/// to inherit a single-entry page's collection interval (spec §4.5
	/// `lookup_filtered_prev`).
	pub fn lookup_filtered_prev(&self, before: i64) -> Option<Arc<PageDescriptor>> {
		self.state
			.read()
			.pages
			.range(..before)
			.rev()
			.map(|(_, d)| d.clone())
			.find(|d| {
				let span = d.span();
				span.page_length >= 2 * crate::consts::SAMPLE_SIZE && span.start_time != span.end_time
			})
	}

	fn ensure_populated(&self, descriptor: &Arc<PageDescriptor>, loader: &dyn PageLoader) {
		if descriptor.is_populated() {
			return;
		}
		loader.request_load(descriptor);
		loader.await_load(descriptor);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct NoopLoader;
	impl PageLoader for NoopLoader {
		fn request_load(&self, _descriptor: &Arc<PageDescriptor>) {}
		fn await_load(&self, _descriptor: &Arc<PageDescriptor>) {}
	}

	fn id() -> MetricId {
		MetricId::from_bytes([7; 16])
	}

	fn descr(start: i64, end: i64, length: usize) -> Arc<PageDescriptor> {
		let d = Arc::new(PageDescriptor::new_populated(id(), 0));
		d.set_info(start, length);
		d.set_info(end, length);
		d
	}

	#[test]
	fn insert_rejects_out_of_order_start() {
		let index = MetricPageIndex::new(id());
		index.insert(descr(10, 20, 4)).unwrap();
		let err = index.insert(descr(5, 15, 4)).unwrap_err();
		assert!(matches!(err, EngineError::OutOfOrderTime { .. }));
	}

	#[test]
	fn lookup_exact_finds_containing_page() {
		let index = MetricPageIndex::new(id());
		index.insert(descr(10, 20, 4)).unwrap();
		let loader = NoopLoader;
		let found = index.lookup_exact(15, &loader).unwrap();
		assert_eq!(found.span().start_time, 10);
		found.unpin();
	}

	#[test]
	fn lookup_exact_invalid_time_returns_latest() {
		let index = MetricPageIndex::new(id());
		index.insert(descr(10, 20, 4)).unwrap();
		index.insert(descr(21, 30, 4)).unwrap();
		let loader = NoopLoader;
		let found = index.lookup_exact(INVALID_TIME, &loader).unwrap();
		assert_eq!(found.span().start_time, 21);
		found.unpin();
	}

	#[test]
	fn remove_recomputes_oldest_and_latest() {
		let index = MetricPageIndex::new(id());
		index.insert(descr(10, 20, 4)).unwrap();
		index.insert(descr(21, 30, 4)).unwrap();
		assert_eq!(index.oldest_time(), 10);
		index.remove(10);
		assert_eq!(index.oldest_time(), 21);
		assert_eq!(index.latest_time(), 30);
	}

	#[test]
	fn writer_count_enforces_single_writer() {
		let index = MetricPageIndex::new(id());
		index.register_writer().unwrap();
		assert!(index.register_writer().is_err());
		assert!(!index.unregister_writer());
	}
}
