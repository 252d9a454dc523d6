//! Page cache admission, eviction, and backpressure (spec §4.1, §4.6).
//!
//! Grounded on the teacher's `cache/mod.rs` `PageCache<Storage>`: a
//! [`crate::page::buffer::PageSlab`] of fixed slots, an
//! [`eviction::EvictionManager`] approximating LRU over resident slots, and
//! a dirty set — generalized here from a disk-backed, single-storage cache
//! into the shared, codec-agnostic cache the new architecture calls for:
//! dirty tracking moves into [`crate::commit::CommitRing`], and admission
//! gains the half/hard commit-ring backpressure policy from spec §4.6.

pub mod eviction;

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::{
	commit::CommitRing,
	config::EngineConfig,
	error::{EngineError, Result},
	index::MetricId,
	page::{PageDescriptor, PageReadGuard, PageSlab, PageWriteGuard},
};

use self::eviction::EvictionManager;

/// What a caller of [`PageCache::commit`] must do next (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
	/// `committed_pages < half_limit`; nothing to do.
	None,
	/// `committed_pages >= half_limit` but below the hard limit: log and
	/// keep going, the worker is expected to flush soon.
	OverHalfDirty,
	/// `committed_pages >= hard_committed_limit` under
	/// `drop_metrics_under_page_cache_pressure`: the caller must enqueue
	/// `InvalidateOldestMemoryPage` to the worker.
	InvalidateOldest,
}

struct CacheState {
	eviction: EvictionManager<usize>,
	resident: HashMap<usize, Arc<PageDescriptor>>,
}

/// The shared page cache: one slab of buffers, one commit ring, one
/// eviction policy, serving every metric in the instance.
pub struct PageCache {
	state: Mutex<CacheState>,
	slab: PageSlab,
	commit_ring: CommitRing,
	config: EngineConfig,
	next_correlation_id: AtomicU64,
	over_half_dirty_events: AtomicUsize,
	flushing_pressure_page_deletions: AtomicUsize,
	evictions: AtomicUsize,
	cache_insertions: AtomicUsize,
	cache_deletions: AtomicUsize,
}

assert_impl_all!(PageCache: Send, Sync);

impl PageCache {
	pub fn new(config: EngineConfig) -> Self {
		let max_pages = config.max_pages();
		Self {
			state: Mutex::new(CacheState {
				eviction: EvictionManager::new(max_pages),
				resident: HashMap::new(),
			}),
			slab: PageSlab::new(config.page_size, max_pages),
			commit_ring: CommitRing::new(),
			config,
			next_correlation_id: AtomicU64::new(1),
			over_half_dirty_events: AtomicUsize::new(0),
			flushing_pressure_page_deletions: AtomicUsize::new(0),
			evictions: AtomicUsize::new(0),
			cache_insertions: AtomicUsize::new(0),
			cache_deletions: AtomicUsize::new(0),
		}
	}

	#[inline]
	pub fn page_size(&self) -> usize {
		self.slab.page_size()
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.slab.capacity()
	}

	/// `create_page`: admits a new populated, pinned, dirty descriptor
	/// (spec §4.1). Fails with `ResourceExhausted` if the slab is full and
	/// no resident page is currently reclaimable.
	pub fn create_page(&self, metric_id: MetricId) -> Result<Arc<PageDescriptor>> {
		let slot = self.admit_slot()?;
		let descriptor = Arc::new(PageDescriptor::new_populated(metric_id, slot));
		let mut state = self.state.lock();
		state.eviction.access(slot);
		state.resident.insert(slot, descriptor.clone());
		drop(state);
		self.cache_insertions.fetch_add(1, Ordering::Relaxed);
		Ok(descriptor)
	}

	/// Records an access for eviction-recency purposes (spec §4.6); called
	/// on every `lookup_exact`/`lookup_next` hit.
	pub fn touch(&self, descriptor: &PageDescriptor) {
		if let Some(slot) = descriptor.slot() {
			self.state.lock().eviction.access(slot);
		}
	}

	pub fn read(&self, descriptor: &PageDescriptor) -> Option<PageReadGuard> {
		self.slab.read(descriptor.slot()?)
	}

	/// Admits a slot for a page the worker just loaded from the codec and
	/// copies its bytes in, completing a `request_load`/`await_load` cycle
	/// (spec §4.2, §4.9). The descriptor's pin is left untouched — the
	/// caller that triggered the load already holds it.
	pub fn complete_load(&self, descriptor: &Arc<PageDescriptor>, bytes: &[u8]) -> Result<()> {
		let slot = self.admit_slot()?;
		{
			let mut guard = self
				.slab
				.write(slot)
				.expect("freshly admitted slot must be writable");
			let len = guard.len().min(bytes.len());
			guard[..len].copy_from_slice(&bytes[..len]);
		}
		descriptor.set_slot(Some(slot));
		descriptor.set_populated(true);
		let mut state = self.state.lock();
		state.eviction.access(slot);
		state.resident.insert(slot, descriptor.clone());
		drop(state);
		self.cache_insertions.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	pub fn write(&self, descriptor: &PageDescriptor) -> Option<PageWriteGuard> {
		self.slab.write(descriptor.slot()?)
	}

	pub fn next_correlation_id(&self) -> u64 {
		self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
	}

	/// `commit`: inserts into the commit ring and releases the collector's
	/// own pin (spec §4.1), then evaluates the half/hard backpressure
	/// thresholds (spec §4.6) and runs an eviction tick (spec §4.6 "runs on
	/// every commit and eviction tick").
	pub fn commit(&self, descriptor: Arc<PageDescriptor>, correlation_id: u64) -> BackpressureAction {
		debug_assert!(descriptor.page_length() > 0, "committed an empty page");
		descriptor.assign_correlation_id(correlation_id);
		descriptor.set_dirty(true);
		self.commit_ring.insert(descriptor.clone());
		descriptor.unpin();
		let action = self.evaluate_backpressure();
		self.evict_until_watermark();
		action
	}

	fn evaluate_backpressure(&self) -> BackpressureAction {
		let committed = self.commit_ring.len();
		if committed >= self.config.half_limit() {
			if self.config.drop_metrics_under_page_cache_pressure
				&& committed >= self.config.hard_committed_limit()
			{
				return BackpressureAction::InvalidateOldest;
			}
			self.over_half_dirty_events.fetch_add(1, Ordering::Relaxed);
			return BackpressureAction::OverHalfDirty;
		}
		BackpressureAction::None
	}

	/// Services an `InvalidateOldestMemoryPage` command (spec §4.6, §4.9):
	/// drops the oldest dirty page in the commit ring unflushed, freeing its
	/// slot without ever writing it to the codec.
	pub fn invalidate_oldest_dirty(&self) -> Option<Arc<PageDescriptor>> {
		let descriptor = self.commit_ring.oldest()?;
		self.commit_ring.remove(descriptor.correlation_id());
		descriptor.set_dirty(false);
		self.retire_slot(&descriptor);
		self.flushing_pressure_page_deletions.fetch_add(1, Ordering::Relaxed);
		Some(descriptor)
	}

	/// Called by the worker once a flush completes: clears `DIRTY` and
	/// drops the descriptor from the commit ring (spec §4.9).
	pub fn mark_flushed(&self, descriptor: &PageDescriptor) {
		self.commit_ring.remove(descriptor.correlation_id());
		descriptor.set_dirty(false);
	}

	/// A batch of up to `max` oldest dirty descriptors for the worker's
	/// ordinary flush path; peeked, not removed from the ring — entries
	/// leave only once `mark_flushed` confirms a successful write (spec §5,
	/// §7: a write failure must never corrupt in-memory state).
	pub fn peek_commit_batch(&self, max: usize) -> Vec<Arc<PageDescriptor>> {
		self.commit_ring.drain_batch(max)
	}

	/// Retires a descriptor that will never be committed: an empty page at
	/// flush time, or one found to hold only sentinel samples (spec §4.1
	/// `punch_hole`, §4.4 "destroy the descriptor"). Releases the
	/// collector's own pin and frees the slot immediately.
	pub fn discard(&self, descriptor: &Arc<PageDescriptor>) {
		descriptor.set_dirty(false);
		descriptor.unpin();
		self.retire_slot(descriptor);
	}

	/// Evicts refcount-zero, non-dirty populated pages until
	/// `populated_pages <= low_watermark` (spec §4.6 invariant
	/// `populated_pages <= max_pages`).
	pub fn evict_until_watermark(&self) -> usize {
		let mut evicted = 0;
		while self.populated_pages() > self.config.low_watermark() {
			if self.try_reclaim_one().is_none() {
				break;
			}
			evicted += 1;
		}
		evicted
	}

	pub fn populated_pages(&self) -> usize {
		self.state.lock().resident.len()
	}

	pub fn committed_pages(&self) -> usize {
		self.commit_ring.len()
	}

	pub fn over_half_dirty_events(&self) -> usize {
		self.over_half_dirty_events.load(Ordering::Relaxed)
	}

	pub fn flushing_pressure_page_deletions(&self) -> usize {
		self.flushing_pressure_page_deletions.load(Ordering::Relaxed)
	}

	pub fn evictions(&self) -> usize {
		self.evictions.load(Ordering::Relaxed)
	}

	pub fn cache_insertions(&self) -> usize {
		self.cache_insertions.load(Ordering::Relaxed)
	}

	pub fn cache_deletions(&self) -> usize {
		self.cache_deletions.load(Ordering::Relaxed)
	}

	/// Admits a slab slot, reclaiming one via the eviction policy if the
	/// slab is full. `try_reclaim_one` frees the victim's slot back onto
	/// the slab's freelist rather than handing it back occupied, so the
	/// freed index must be re-acquired through `slab.allocate()` before a
	/// new descriptor can bind to it — otherwise the slot would be marked
	/// resident while the slab itself still considers it free.
	fn admit_slot(&self) -> Result<usize> {
		if let Some(slot) = self.slab.allocate() {
			return Ok(slot);
		}
		self.try_reclaim_one().ok_or(EngineError::ResourceExhausted)?;
		self.slab
			.allocate()
			.ok_or(EngineError::ResourceExhausted)
	}

	/// Reclaims one refcount-zero, non-dirty resident slot via the
	/// approximate-LRU policy, freeing it back to the slab. A victim that
	/// turns out to be pinned or dirty is re-admitted to the eviction
	/// queues rather than lost.
	fn try_reclaim_one(&self) -> Option<usize> {
		let mut state = self.state.lock();
		let slot = state.eviction.reclaim()?;
		let descriptor = state.resident.get(&slot)?.clone();
		if descriptor.refcount() != 0 || descriptor.is_dirty() {
			state.eviction.access(slot);
			return None;
		}
		state.resident.remove(&slot);
		drop(state);
		self.retire_slot(&descriptor);
		self.evictions.fetch_add(1, Ordering::Relaxed);
		Some(slot)
	}

	fn retire_slot(&self, descriptor: &PageDescriptor) {
		if let Some(slot) = descriptor.slot() {
			let mut state = self.state.lock();
			state.resident.remove(&slot);
			state.eviction.forget(&slot);
			drop(state);
			self.slab.free(slot);
			descriptor.set_populated(false);
			descriptor.set_slot(None);
			self.cache_deletions.fetch_add(1, Ordering::Relaxed);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(page_cache_mb: usize, page_size: usize) -> EngineConfig {
		EngineConfig {
			page_cache_mb,
			page_size,
			..Default::default()
		}
	}

	fn id() -> MetricId {
		MetricId::from_bytes([3; 16])
	}

	#[test]
	fn create_page_is_pinned_and_dirty() {
		let cache = PageCache::new(config(crate::consts::MIN_PAGE_CACHE_MB, 32));
		let descriptor = cache.create_page(id()).unwrap();
		assert!(descriptor.is_dirty());
		assert!(descriptor.is_populated());
		assert_eq!(descriptor.refcount(), 1);
		assert_eq!(cache.populated_pages(), 1);
	}

	#[test]
	fn exhausted_cache_refuses_admission_while_pinned() {
		let cache = PageCache::new(config(crate::consts::MIN_PAGE_CACHE_MB, 4096));
		let capacity = cache.capacity();
		let mut held = Vec::new();
		for _ in 0..capacity {
			held.push(cache.create_page(id()).unwrap());
		}
		assert!(matches!(
			cache.create_page(id()),
			Err(EngineError::ResourceExhausted)
		));
	}

	#[test]
	fn unpinned_clean_page_is_reclaimed_on_pressure() {
		let cache = PageCache::new(config(crate::consts::MIN_PAGE_CACHE_MB, 4096));
		let capacity = cache.capacity();
		let mut descriptors = Vec::new();
		for _ in 0..capacity {
			let d = cache.create_page(id()).unwrap();
			d.set_dirty(false);
			d.unpin();
			descriptors.push(d);
		}
		let fresh = cache.create_page(id()).unwrap();
		assert!(fresh.is_populated());
		assert_eq!(cache.populated_pages(), capacity);

		{
			let mut guard = cache.write(&fresh).expect("reclaimed slot must be writable");
			guard[..4].copy_from_slice(&[1, 2, 3, 4]);
		}
		let guard = cache.read(&fresh).expect("reclaimed slot must be readable");
		assert_eq!(&guard[..4], &[1, 2, 3, 4]);
	}

	#[test]
	fn commit_crosses_half_then_hard_limit() {
		let cache = PageCache::new(config(crate::consts::MIN_PAGE_CACHE_MB, 4096));
		let half = cache.committed_pages();
		assert_eq!(half, 0);

		let max_pages = cache.capacity();
		let mut last_action = BackpressureAction::None;
		for _ in 0..max_pages {
			let descriptor = cache.create_page(id()).unwrap();
			descriptor.set_info(0, 1);
			let correlation_id = cache.next_correlation_id();
			last_action = cache.commit(descriptor, correlation_id);
		}

		assert_eq!(last_action, BackpressureAction::InvalidateOldest);
		assert!(cache.over_half_dirty_events() >= 1);
	}

	#[test]
	fn invalidate_oldest_dirty_frees_a_slot_without_flushing() {
		let cache = PageCache::new(config(crate::consts::MIN_PAGE_CACHE_MB, 4096));
		let descriptor = cache.create_page(id()).unwrap();
		descriptor.set_info(0, 1);
		let correlation_id = cache.next_correlation_id();
		cache.commit(descriptor, correlation_id);

		assert_eq!(cache.committed_pages(), 1);
		let invalidated = cache.invalidate_oldest_dirty().unwrap();
		assert!(!invalidated.is_dirty());
		assert_eq!(cache.committed_pages(), 0);
		assert_eq!(cache.flushing_pressure_page_deletions(), 1);
	}
}
