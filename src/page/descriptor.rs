//! Page descriptors (spec §3, §4.1).

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::index::MetricId;

/// Sentinel for "no time set yet" (spec §3).
pub const INVALID_TIME: i64 = -1;

/// No dirty page has been assigned a correlation id smaller than 1; `0`
/// marks "not yet committed".
pub const NO_CORRELATION_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flags(u8);

impl Flags {
	pub const DIRTY: Flags = Flags(1 << 0);
	pub const POPULATED: Flags = Flags(1 << 1);
	pub const READ_PENDING: Flags = Flags(1 << 2);
	pub const WRITE_PENDING: Flags = Flags(1 << 3);

	const fn bits(self) -> u8 {
		self.0
	}
}

impl std::ops::BitOr for Flags {
	type Output = Flags;
	fn bitor(self, rhs: Self) -> Self::Output {
		Flags(self.0 | rhs.0)
	}
}

/// A page's time span and committed length, updated together so readers
/// never observe a torn `(end_time, page_length)` pair (spec §4.1
/// `set_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
	pub start_time: i64,
	pub end_time: i64,
	pub page_length: usize,
}

impl PageSpan {
	pub(crate) fn empty() -> Self {
		Self {
			start_time: INVALID_TIME,
			end_time: INVALID_TIME,
			page_length: 0,
		}
	}
}

/// Metadata record for one page (spec §3 "Page descriptor").
///
/// The descriptor outlives the buffer it describes: `slot` is `Some` while
/// the page is populated in the shared [`crate::page::buffer::PageSlab`],
/// and is cleared back to `None` on eviction or punch-hole.
pub struct PageDescriptor {
	pub metric_id: MetricId,
	span: RwLock<PageSpan>,
	correlation_id: AtomicU64,
	refcount: AtomicUsize,
	flags: AtomicU8,
	slot: Mutex<Option<usize>>,
	pub(crate) load_cv: Condvar,
	pub(crate) load_lock: Mutex<()>,
}

impl PageDescriptor {
	/// Creates a descriptor for a freshly allocated, populated page with
	/// `refcount = 1` (the creator's own reference), matching
	/// `create_page`'s postcondition in spec §4.1.
	pub fn new_populated(metric_id: MetricId, slot: usize) -> Self {
		Self {
			metric_id,
			span: RwLock::new(PageSpan::empty()),
			correlation_id: AtomicU64::new(NO_CORRELATION_ID),
			refcount: AtomicUsize::new(1),
			flags: AtomicU8::new((Flags::DIRTY | Flags::POPULATED).bits()),
			slot: Mutex::new(Some(slot)),
			load_cv: Condvar::new(),
			load_lock: Mutex::new(()),
		}
	}

	/// Creates a descriptor for a page known to exist on disk but not
	/// currently resident (used by the query path before a load completes).
	pub fn new_unpopulated(metric_id: MetricId, span: PageSpan) -> Self {
		Self {
			metric_id,
			span: RwLock::new(span),
			correlation_id: AtomicU64::new(NO_CORRELATION_ID),
			refcount: AtomicUsize::new(0),
			flags: AtomicU8::new(0),
			slot: Mutex::new(None),
			load_cv: Condvar::new(),
			load_lock: Mutex::new(()),
		}
	}

	#[inline]
	pub fn span(&self) -> PageSpan {
		*self.span.read()
	}

	#[inline]
	pub fn start_time(&self) -> i64 {
		self.span.read().start_time
	}

	#[inline]
	pub fn end_time(&self) -> i64 {
		self.span.read().end_time
	}

	#[inline]
	pub fn page_length(&self) -> usize {
		self.span.read().page_length
	}

	pub fn contains(&self, point_in_time: i64) -> bool {
		let span = self.span();
		span.page_length > 0 && span.start_time <= point_in_time && point_in_time <= span.end_time
	}

	pub fn intersects(&self, from: i64, to: i64) -> bool {
		let span = self.span();
		span.page_length > 0 && span.start_time <= to && from <= span.end_time
	}

	/// `set_info`: atomically replace `(end_time, page_length)`, setting
	/// `start_time` too if this is the first write to the page.
	pub fn set_info(&self, point_in_time: i64, new_length: usize) {
		let mut span = self.span.write();
		if span.start_time == INVALID_TIME {
			span.start_time = point_in_time;
		}
		span.end_time = point_in_time;
		span.page_length = new_length;
	}

	#[inline]
	pub fn correlation_id(&self) -> u64 {
		self.correlation_id.load(Ordering::Acquire)
	}

	pub(crate) fn assign_correlation_id(&self, id: u64) {
		self.correlation_id.store(id, Ordering::Release);
	}

	#[inline]
	pub fn refcount(&self) -> usize {
		self.refcount.load(Ordering::Acquire)
	}

	/// `pin`: forbidden on a descriptor that isn't `POPULATED`.
	pub fn pin(&self) -> usize {
		debug_assert!(self.is_populated(), "pinned a non-populated descriptor");
		self.refcount.fetch_add(1, Ordering::AcqRel) + 1
	}

	/// `unpin` (`pg_cache_put`): never blocks; the caller is responsible for
	/// noticing a zero result and handing the page to the eviction engine.
	pub fn unpin(&self) -> usize {
		let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prev > 0, "refcount underflow");
		prev - 1
	}

	#[inline]
	pub fn is_dirty(&self) -> bool {
		self.has_flag(Flags::DIRTY)
	}

	#[inline]
	pub fn is_populated(&self) -> bool {
		self.has_flag(Flags::POPULATED)
	}

	pub(crate) fn set_dirty(&self, dirty: bool) {
		self.set_flag(Flags::DIRTY, dirty);
	}

	pub(crate) fn set_populated(&self, populated: bool) {
		self.set_flag(Flags::POPULATED, populated);
	}

	pub(crate) fn has_flag(&self, flag: Flags) -> bool {
		self.flags.load(Ordering::Acquire) & flag.bits() != 0
	}

	fn set_flag(&self, flag: Flags, value: bool) {
		if value {
			self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
		} else {
			self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
		}
	}

	pub(crate) fn mark_read_pending(&self, pending: bool) {
		self.set_flag(Flags::READ_PENDING, pending);
	}

	pub(crate) fn is_read_pending(&self) -> bool {
		self.has_flag(Flags::READ_PENDING)
	}

	pub(crate) fn mark_write_pending(&self, pending: bool) {
		self.set_flag(Flags::WRITE_PENDING, pending);
	}

	#[inline]
	pub fn slot(&self) -> Option<usize> {
		*self.slot.lock()
	}

	pub(crate) fn set_slot(&self, slot: Option<usize>) {
		*self.slot.lock() = slot;
	}

	/// Checks the invariants the spec pins on every commit-ring member
	/// (spec §8): `DIRTY => POPULATED && refcount >= 1`.
	pub fn check_commit_invariant(&self) -> bool {
		!self.is_dirty() || (self.is_populated() && self.refcount() >= 1)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id() -> MetricId {
		MetricId::from_bytes([1; 16])
	}

	#[test]
	fn new_populated_starts_dirty_and_pinned() {
		let descr = PageDescriptor::new_populated(id(), 0);
		assert!(descr.is_dirty());
		assert!(descr.is_populated());
		assert_eq!(descr.refcount(), 1);
		assert_eq!(descr.span().start_time, INVALID_TIME);
	}

	#[test]
	fn set_info_sets_start_time_once() {
		let descr = PageDescriptor::new_populated(id(), 0);
		descr.set_info(100, 4);
		descr.set_info(200, 8);
		let span = descr.span();
		assert_eq!(span.start_time, 100);
		assert_eq!(span.end_time, 200);
		assert_eq!(span.page_length, 8);
	}

	#[test]
	fn pin_unpin_round_trips() {
		let descr = PageDescriptor::new_populated(id(), 0);
		assert_eq!(descr.pin(), 2);
		assert_eq!(descr.unpin(), 1);
		assert_eq!(descr.unpin(), 0);
	}

	#[test]
	fn commit_invariant_holds_for_fresh_page() {
		let descr = PageDescriptor::new_populated(id(), 0);
		assert!(descr.check_commit_invariant());
	}

	#[test]
	fn contains_respects_inclusive_bounds() {
		let descr = PageDescriptor::new_populated(id(), 0);
		descr.set_info(10, 4);
		descr.set_info(20, 8);
		assert!(descr.contains(10));
		assert!(descr.contains(20));
		assert!(!descr.contains(9));
		assert!(!descr.contains(21));
	}
}
