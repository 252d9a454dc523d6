use crate::{
	consts::{
		DEFAULT_DISK_QUOTA_MB, DEFAULT_MULTIDB_DISK_QUOTA_MB, DEFAULT_PAGE_CACHE_MB,
		DEFAULT_PAGE_SIZE, FD_BUDGET_PER_INSTANCE, MIN_PAGE_CACHE_MB,
	},
	utils::units::MiB,
};

/// Recognized configuration options (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
	pub page_cache_mb: usize,
	pub disk_quota_mb: usize,
	pub multidb_disk_quota_mb: usize,
	pub drop_metrics_under_page_cache_pressure: bool,
	pub page_size: usize,
	pub fd_budget: usize,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			page_cache_mb: DEFAULT_PAGE_CACHE_MB,
			disk_quota_mb: DEFAULT_DISK_QUOTA_MB,
			multidb_disk_quota_mb: DEFAULT_MULTIDB_DISK_QUOTA_MB,
			drop_metrics_under_page_cache_pressure: true,
			page_size: DEFAULT_PAGE_SIZE,
			fd_budget: FD_BUDGET_PER_INSTANCE,
		}
	}
}

impl EngineConfig {
	/// `max_pages`, clamped up to `MIN_PAGE_CACHE_MB` the way the original
	/// clamps a too-small configured page cache before deriving page counts.
	pub fn max_pages(&self) -> usize {
		let mb = self.page_cache_mb.max(MIN_PAGE_CACHE_MB);
		(mb * MiB) / self.page_size
	}

	pub fn max_disk_bytes(&self) -> usize {
		self.disk_quota_mb * MiB
	}

	pub fn low_watermark(&self) -> usize {
		(self.max_pages() as f64 * 0.95) as usize
	}

	pub fn half_limit(&self) -> usize {
		self.max_pages() / 2
	}

	pub fn hard_committed_limit(&self) -> usize {
		self.max_pages()
	}
}
