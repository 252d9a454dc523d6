//! Instance lifecycle: one engine instance per database root (spec §4.8,
//! module table item 10).
//!
//! Grounded on the teacher's `disk/storage.rs` `Storage::init`/`load`
//! validation style (reject before touching anything durable, translate
//! the first failure into a typed error) generalized here to also spawn
//! and later join the background worker.

use std::{
	fs,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
};

use log::debug;

use crate::{
	cache::PageCache,
	codec::DatafileCodec,
	config::EngineConfig,
	error::{EngineError, Result},
	index::GlobalIndex,
	stats::{InstanceStats, StatsSink},
	worker::{WorkerCommand, WorkerHandle},
};

/// Process-wide count of file descriptors reserved by every live
/// `Instance`, checked against `RLIMIT_NOFILE / 4` on `init` (spec §4.8).
static RESERVED_FDS: AtomicUsize = AtomicUsize::new(0);

/// One running engine instance: the global metric index, the shared page
/// cache, the statistics it reports, and the single background worker
/// that owns its I/O (spec §4.7, §4.8).
pub struct Instance {
	config: EngineConfig,
	database_root: PathBuf,
	global_index: Arc<GlobalIndex>,
	cache: Arc<PageCache>,
	stats: Arc<InstanceStats>,
	stats_sink: Arc<StatsSink>,
	worker: Arc<WorkerHandle>,
	quiesced: AtomicBool,
}

impl Instance {
	/// `init`: reserves the FD budget, creates `database_root`, wires up
	/// the cache/index/statistics, and spawns the worker. `stats_sink` is
	/// handed in rather than constructed, since it is process-scoped and
	/// shared across every instance in the host process (spec §9 design
	/// note; see `StatsSink` supplemented-feature 2).
	pub fn init<C>(
		config: EngineConfig,
		database_root: impl AsRef<Path>,
		codec: Arc<C>,
		stats_sink: Arc<StatsSink>,
	) -> Result<Self>
	where
		C: DatafileCodec + Send + Sync + 'static,
	{
		let database_root = database_root.as_ref().to_path_buf();
		reserve(&RESERVED_FDS, process_fd_ceiling(), config.fd_budget)?;

		if let Err(source) = fs::create_dir_all(&database_root) {
			release(&RESERVED_FDS, config.fd_budget);
			return Err(EngineError::InitFailed(format!(
				"failed to create database root {}: {source}",
				database_root.display()
			)));
		}

		let cache = Arc::new(PageCache::new(config.clone()));
		let worker = Arc::new(WorkerHandle::spawn(cache.clone(), codec, stats_sink.clone()));
		debug!("engine instance initialized at {}", database_root.display());

		Ok(Self {
			config,
			database_root,
			global_index: Arc::new(GlobalIndex::new()),
			cache,
			stats: Arc::new(InstanceStats::new()),
			stats_sink,
			worker,
			quiesced: AtomicBool::new(false),
		})
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn database_root(&self) -> &Path {
		&self.database_root
	}

	pub fn cache(&self) -> &Arc<PageCache> {
		&self.cache
	}

	pub fn global_index(&self) -> &Arc<GlobalIndex> {
		&self.global_index
	}

	pub fn stats(&self) -> &Arc<InstanceStats> {
		&self.stats
	}

	pub fn stats_sink(&self) -> &Arc<StatsSink> {
		&self.stats_sink
	}

	pub fn worker(&self) -> &Arc<WorkerHandle> {
		&self.worker
	}

	/// `true` once `quiesce` has run; collect/query call sites are
	/// expected to check this and return `EngineError::Shutdown` for new
	/// work instead of starting it (spec §4.8 "rejects new commits").
	pub fn is_quiesced(&self) -> bool {
		self.quiesced.load(Ordering::Acquire)
	}

	/// `quiesce`: posts `Quiesce` to the worker and marks the instance so
	/// new collectors are refused; collectors already running are left to
	/// finish their current page.
	pub fn quiesce(&self) {
		self.quiesced.store(true, Ordering::Release);
		self.worker.submit(WorkerCommand::Quiesce);
		debug!("engine instance quiesced at {}", self.database_root.display());
	}

	/// `exit`: posts `Shutdown`, joins the worker, and releases the FD
	/// reservation. Spec §4.8 describes this returning an error only for a
	/// null instance handle; ownership makes that case unrepresentable
	/// here, so `exit` cannot fail.
	pub fn exit(self) {
		self.worker.shutdown();
		release(&RESERVED_FDS, self.config.fd_budget);
		debug!("engine instance exited at {}", self.database_root.display());
	}
}

fn process_fd_ceiling() -> usize {
	unsafe {
		let mut limit: libc::rlimit = std::mem::zeroed();
		if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
			(limit.rlim_cur as usize) / 4
		} else {
			usize::MAX
		}
	}
}

/// CAS retry loop: reserves `budget` against `counter`, refusing if doing
/// so would exceed `ceiling` (spec §4.8 `RLIMIT_NOFILE / 4`).
fn reserve(counter: &AtomicUsize, ceiling: usize, budget: usize) -> Result<()> {
	loop {
		let current = counter.load(Ordering::Acquire);
		let proposed = current + budget;
		if proposed > ceiling {
			return Err(EngineError::ResourceExhausted);
		}
		if counter
			.compare_exchange_weak(current, proposed, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			return Ok(());
		}
	}
}

fn release(counter: &AtomicUsize, budget: usize) {
	counter.fetch_sub(budget, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::MockDatafileCodec;

	#[test]
	fn init_creates_the_database_root_and_spawns_a_worker() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("nested/db");
		let codec = MockDatafileCodec::new();

		let instance = Instance::init(
			EngineConfig::default(),
			&root,
			Arc::new(codec),
			Arc::new(StatsSink::new()),
		)
		.unwrap();

		assert!(root.is_dir());
		assert!(!instance.is_quiesced());
		instance.exit();
	}

	#[test]
	fn quiesce_marks_the_instance_and_rejects_is_checked_by_callers() {
		let dir = tempfile::tempdir().unwrap();
		let codec = MockDatafileCodec::new();
		let instance = Instance::init(
			EngineConfig::default(),
			dir.path(),
			Arc::new(codec),
			Arc::new(StatsSink::new()),
		)
		.unwrap();

		instance.quiesce();
		assert!(instance.is_quiesced());
		instance.exit();
	}

	#[test]
	fn reserve_refuses_once_the_ceiling_is_exceeded() {
		let counter = AtomicUsize::new(0);
		reserve(&counter, 100, 60).unwrap();
		assert!(matches!(
			reserve(&counter, 100, 60),
			Err(EngineError::ResourceExhausted)
		));
		release(&counter, 60);
		reserve(&counter, 100, 60).unwrap();
	}
}
