//! Global metrics index (spec §3, §4.3).

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::index::{MetricId, MetricPageIndex};

struct State {
	by_id: HashMap<MetricId, Arc<MetricPageIndex>>,
	insertion_order: Vec<MetricId>,
}

/// Maps `MetricId -> MetricPageIndex`, plus the insertion-ordered list used
/// for host-wide enumeration (spec §4.3). A UUID is inserted at most once.
pub struct GlobalIndex {
	state: RwLock<State>,
}

impl GlobalIndex {
	pub fn new() -> Self {
		Self {
			state: RwLock::new(State {
				by_id: HashMap::new(),
				insertion_order: Vec::new(),
			}),
		}
	}

	/// `get_or_create`: returns the existing entry, or inserts and returns
	/// a new one under a writer lock.
	pub fn get_or_create(&self, metric_id: MetricId) -> Arc<MetricPageIndex> {
		if let Some(existing) = self.get(metric_id) {
			return existing;
		}
		let mut state = self.state.write();
		if let Some(existing) = state.by_id.get(&metric_id) {
			return existing.clone();
		}
		let entry = Arc::new(MetricPageIndex::new(metric_id));
		state.by_id.insert(metric_id, entry.clone());
		state.insertion_order.push(metric_id);
		entry
	}

	/// `get`: the entry, or `None`, under a reader lock.
	pub fn get(&self, metric_id: MetricId) -> Option<Arc<MetricPageIndex>> {
		self.state.read().by_id.get(&metric_id).cloned()
	}

	/// Removes an empty, writer-less metric (spec §4.4 `can_delete_metric`).
	pub fn remove(&self, metric_id: MetricId) {
		let mut state = self.state.write();
		if state.by_id.remove(&metric_id).is_some() {
			state.insertion_order.retain(|id| *id != metric_id);
		}
	}

	/// Insertion-ordered snapshot of every registered metric.
	pub fn iter_ids(&self) -> Vec<MetricId> {
		self.state.read().insertion_order.clone()
	}

	pub fn len(&self) -> usize {
		self.state.read().by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for GlobalIndex {
	fn default() -> Self {
		Self::new()
	}
}
