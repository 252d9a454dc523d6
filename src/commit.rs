//! Commit log / dirty ring (spec §3, §4.1, §4.6).
//!
//! Grounded on the teacher's `cache/mod.rs` `dirty: HashSet<PageId>`,
//! generalized from a set into an ordered map so flush and eviction can
//! iterate in strict `correlation_id` order (spec §5).

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::page::PageDescriptor;

/// Ordered map `correlation_id -> descriptor` of every committed dirty
/// page awaiting flush. `len()` is `committed_pages` (spec §3, §8).
pub struct CommitRing {
	entries: RwLock<BTreeMap<u64, Arc<PageDescriptor>>>,
}

impl CommitRing {
	pub fn new() -> Self {
		Self {
			entries: RwLock::new(BTreeMap::new()),
		}
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Inserts a newly committed page. The descriptor must already carry
	/// its `correlation_id` (spec §4.1 `commit`).
	pub fn insert(&self, descriptor: Arc<PageDescriptor>) {
		let correlation_id = descriptor.correlation_id();
		self.entries.write().insert(correlation_id, descriptor);
	}

	/// Removes a descriptor after its flush completes.
	pub fn remove(&self, correlation_id: u64) -> Option<Arc<PageDescriptor>> {
		self.entries.write().remove(&correlation_id)
	}

	/// The oldest (smallest `correlation_id`) dirty descriptor, without
	/// removing it — used both by ordinary flush scheduling and by
	/// `InvalidateOldestMemoryPage` backpressure (spec §4.6, §4.9).
	pub fn oldest(&self) -> Option<Arc<PageDescriptor>> {
		self.entries.read().values().next().cloned()
	}

	/// A batch of up to `max` oldest dirty descriptors, in correlation-id
	/// order, for the worker to hand to the external codec's `write_pages`.
	pub fn drain_batch(&self, max: usize) -> Vec<Arc<PageDescriptor>> {
		self.entries.read().values().take(max).cloned().collect()
	}

	/// All descriptors currently in the ring, in correlation-id order
	/// (spec §5 "commit ring iteration is in strict correlation_id order").
	pub fn iter_ordered(&self) -> Vec<Arc<PageDescriptor>> {
		self.entries.read().values().cloned().collect()
	}
}

impl Default for CommitRing {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::index::MetricId;

	fn descr(correlation_id: u64) -> Arc<PageDescriptor> {
		let d = Arc::new(PageDescriptor::new_populated(MetricId::from_bytes([0; 16]), 0));
		d.assign_correlation_id(correlation_id);
		d
	}

	#[test]
	fn len_tracks_insert_and_remove() {
		let ring = CommitRing::new();
		ring.insert(descr(1));
		ring.insert(descr(2));
		assert_eq!(ring.len(), 2);
		ring.remove(1);
		assert_eq!(ring.len(), 1);
	}

	#[test]
	fn oldest_is_smallest_correlation_id() {
		let ring = CommitRing::new();
		ring.insert(descr(5));
		ring.insert(descr(2));
		ring.insert(descr(9));
		assert_eq!(ring.oldest().unwrap().correlation_id(), 2);
	}

	#[test]
	fn iter_ordered_is_strictly_increasing() {
		let ring = CommitRing::new();
		ring.insert(descr(5));
		ring.insert(descr(2));
		ring.insert(descr(9));
		let ids: Vec<_> = ring.iter_ordered().iter().map(|d| d.correlation_id()).collect();
		assert_eq!(ids, vec![2, 5, 9]);
	}
}
