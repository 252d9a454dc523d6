//! The background worker (spec §4.9).
//!
//! No generation of the teacher owns a dedicated background I/O thread —
//! `acorn`'s own flush path runs inline under the caller's lock. This
//! module is deliberately new: the mpsc-driven command loop is grounded on
//! `harborgrid-justin-rusty-db`'s `enterprise_optimization/dirty_page_flusher.rs`
//! and the WAL background-writer split in `Dicklesworthstone-frankensqlite`,
//! adapted to the teacher's own thread/lock idiom (`parking_lot`, `log`).

use std::{
	sync::{mpsc, Arc},
	thread::{self, JoinHandle},
};

use log::{debug, warn};
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::{
	cache::PageCache,
	codec::{CodecError, DatafileCodec, PendingWrite},
	collect::BackpressureSink,
	consts::FLUSH_BATCH_SIZE,
	index::PageLoader,
	page::PageDescriptor,
	stats::StatsSink,
};

/// Opcodes the worker drains in order (spec §4.9).
pub enum WorkerCommand {
	ReadPage {
		descriptor: Arc<PageDescriptor>,
		start_time: i64,
		end_time: i64,
	},
	/// Flushes up to a batch's worth of the commit ring's oldest dirty
	/// pages to the codec (spec §2 data flow "drains the commit ring to
	/// the external datafile writer, then clears DIRTY"). Carries no
	/// payload: the worker pulls the batch itself, since only it has a
	/// `PageCache` reference.
	FlushCommitRing,
	InvalidateOldestMemoryPage,
	Quiesce,
	Shutdown,
}

/// A handle to the single background thread that owns every disk I/O,
/// flush, and eviction decision (spec §4.9 "never calls collector or query
/// code"). Implements [`PageLoader`] so the per-metric index can fault
/// pages in without depending on the worker's concrete type.
pub struct WorkerHandle {
	sender: Mutex<mpsc::Sender<WorkerCommand>>,
	join: Mutex<Option<JoinHandle<()>>>,
}

assert_impl_all!(WorkerHandle: Send, Sync);

impl WorkerHandle {
	pub fn spawn<C>(cache: Arc<PageCache>, codec: Arc<C>, stats_sink: Arc<StatsSink>) -> Self
	where
		C: DatafileCodec + Send + Sync + 'static,
	{
		let (sender, receiver) = mpsc::channel();
		let join = thread::Builder::new()
			.name("engine-worker".into())
			.spawn(move || run(receiver, cache, codec, stats_sink))
			.expect("failed to spawn background worker thread");

		debug!("background worker started");
		Self {
			sender: Mutex::new(sender),
			join: Mutex::new(Some(join)),
		}
	}

	pub fn submit(&self, command: WorkerCommand) {
		if self.sender.lock().send(command).is_err() {
			warn!("submitted a command to a worker that has already shut down");
		}
	}

	/// Blocks until the worker has drained its queue and exited (spec §4.9
	/// `Shutdown`). Idempotent.
	pub fn shutdown(&self) {
		self.submit(WorkerCommand::Shutdown);
		if let Some(join) = self.join.lock().take() {
			debug!("waiting for background worker to exit");
			let _ = join.join();
		}
	}
}

impl BackpressureSink for WorkerHandle {
	fn request_invalidate_oldest(&self) {
		self.submit(WorkerCommand::InvalidateOldestMemoryPage);
	}

	fn request_flush(&self) {
		self.submit(WorkerCommand::FlushCommitRing);
	}
}

impl PageLoader for WorkerHandle {
	fn request_load(&self, descriptor: &Arc<PageDescriptor>) {
		descriptor.mark_read_pending(true);
		self.submit(WorkerCommand::ReadPage {
			descriptor: descriptor.clone(),
			start_time: descriptor.start_time(),
			end_time: descriptor.end_time(),
		});
	}

	fn await_load(&self, descriptor: &Arc<PageDescriptor>) {
		let mut guard = descriptor.load_lock.lock();
		while descriptor.is_read_pending() {
			descriptor.load_cv.wait(&mut guard);
		}
	}
}

fn run<C: DatafileCodec>(
	receiver: mpsc::Receiver<WorkerCommand>,
	cache: Arc<PageCache>,
	codec: Arc<C>,
	stats_sink: Arc<StatsSink>,
) {
	for command in receiver.iter() {
		match command {
			WorkerCommand::ReadPage {
				descriptor,
				start_time,
				end_time,
			} => service_read(&cache, codec.as_ref(), &descriptor, start_time, end_time),
			WorkerCommand::FlushCommitRing => service_flush(&cache, codec.as_ref()),
			WorkerCommand::InvalidateOldestMemoryPage => {
				if cache.invalidate_oldest_dirty().is_some() {
					stats_sink.record_flushing_pressure_page_deletion();
					debug!("dropped the oldest dirty page under pressure");
				}
			}
			WorkerCommand::Quiesce => {
				service_flush(&cache, codec.as_ref());
				debug!("worker quiescing");
			}
			WorkerCommand::Shutdown => {
				service_flush(&cache, codec.as_ref());
				debug!("background worker shutting down");
				break;
			}
		}
	}
}

fn service_read<C: DatafileCodec>(
	cache: &PageCache,
	codec: &C,
	descriptor: &Arc<PageDescriptor>,
	start_time: i64,
	end_time: i64,
) {
	let result = codec.read_page(descriptor.metric_id, start_time, end_time);
	match result {
		Ok((bytes, _outcome)) => {
			if let Err(err) = cache.complete_load(descriptor, &bytes) {
				warn!("failed to admit a loaded page for {}: {err}", descriptor.metric_id);
			}
		}
		Err(CodecError::NotFound) => {
			warn!("no data found for {} in [{start_time}, {end_time}]", descriptor.metric_id);
		}
		Err(err) => warn!("read_page failed for {}: {err}", descriptor.metric_id),
	}
	descriptor.mark_read_pending(false);
	let _guard = descriptor.load_lock.lock();
	descriptor.load_cv.notify_all();
}

/// Drains the commit ring in `FLUSH_BATCH_SIZE` batches until a pass makes
/// no progress, so `Quiesce`/`Shutdown` flush everything outstanding
/// instead of just one batch, while a repeatedly failing write (codec
/// down) can't spin the worker forever.
fn service_flush<C: DatafileCodec>(cache: &PageCache, codec: &C) {
	loop {
		let before = cache.committed_pages();
		if before == 0 {
			break;
		}
		let batch = cache.peek_commit_batch(FLUSH_BATCH_SIZE);
		service_write(cache, codec, batch);
		cache.evict_until_watermark();
		if cache.committed_pages() >= before {
			break;
		}
	}
}

fn service_write<C: DatafileCodec>(cache: &PageCache, codec: &C, batch: Vec<Arc<PageDescriptor>>) {
	for descriptor in &batch {
		descriptor.mark_write_pending(true);
	}

	let pending: Vec<PendingWrite> = batch
		.iter()
		.map(|descriptor| PendingWrite {
			descriptor: descriptor.clone(),
			bytes: cache
				.read(descriptor)
				.map(|guard| guard.to_vec())
				.unwrap_or_default(),
		})
		.collect();

	match codec.write_pages(pending) {
		Ok(_outcome) => {
			for descriptor in &batch {
				cache.mark_flushed(descriptor);
			}
		}
		Err(err) => warn!("write_pages failed for a batch of {} pages: {err}", batch.len()),
	}

	for descriptor in &batch {
		descriptor.mark_write_pending(false);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{codec::MockDatafileCodec, config::EngineConfig, index::MetricId};

	#[test]
	fn read_page_populates_and_wakes_waiters() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut codec = MockDatafileCodec::new();
		codec
			.expect_read_page()
			.returning(|_, _, _| Ok((vec![7; 4096], Default::default())));
		let worker = WorkerHandle::spawn(cache.clone(), Arc::new(codec), Arc::new(StatsSink::new()));

		let descriptor = Arc::new(PageDescriptor::new_unpopulated(
			MetricId::from_bytes([4; 16]),
			crate::page::PageSpan {
				start_time: 0,
				end_time: 10,
				page_length: 4,
			},
		));
		worker.request_load(&descriptor);
		worker.await_load(&descriptor);

		assert!(descriptor.is_populated());
		worker.shutdown();
	}

	#[test]
	fn invalidate_oldest_memory_page_drops_without_flush() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let codec = MockDatafileCodec::new();
		let stats_sink = Arc::new(StatsSink::new());
		let worker = WorkerHandle::spawn(cache.clone(), Arc::new(codec), stats_sink.clone());

		let descriptor = cache.create_page(MetricId::from_bytes([5; 16])).unwrap();
		descriptor.set_info(0, 1);
		let correlation_id = cache.next_correlation_id();
		cache.commit(descriptor, correlation_id);
		assert_eq!(cache.committed_pages(), 1);

		worker.submit(WorkerCommand::InvalidateOldestMemoryPage);
		worker.shutdown();
		assert_eq!(cache.committed_pages(), 0);
		assert_eq!(stats_sink.global_flushing_pressure_page_deletions(), 1);
	}

	#[test]
	fn flush_commit_ring_writes_then_clears_dirty() {
		let cache = Arc::new(PageCache::new(EngineConfig::default()));
		let mut codec = MockDatafileCodec::new();
		codec
			.expect_write_pages()
			.returning(|batch| Ok(crate::codec::WriteOutcome {
				bytes_written: batch.iter().map(|p| p.bytes.len()).sum(),
				extent_count: 1,
			}));
		let worker = WorkerHandle::spawn(cache.clone(), Arc::new(codec), Arc::new(StatsSink::new()));

		let descriptor = cache.create_page(MetricId::from_bytes([6; 16])).unwrap();
		descriptor.set_info(0, 1);
		let correlation_id = cache.next_correlation_id();
		cache.commit(descriptor, correlation_id);
		assert_eq!(cache.committed_pages(), 1);

		worker.submit(WorkerCommand::FlushCommitRing);
		worker.shutdown();
		assert_eq!(cache.committed_pages(), 0);
	}
}
