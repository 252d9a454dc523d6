//! The external datafile/journal boundary (spec §5).
//!
//! The core never defines a wire or file format; compression, extent
//! packing, and checksums belong to an external codec. This module only
//! pins down the contract to it, grounded on the teacher's
//! `disk/storage.rs` `StorageApi`: a thin trait, mockable with
//! `#[cfg_attr(test, automock)]`, so the rest of the engine never depends
//! on a concrete on-disk format.

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::{index::MetricId, page::PageDescriptor};

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("I/O failure writing page for metric {metric}: {source}")]
	Write {
		metric: MetricId,
		source: std::io::Error,
	},

	#[error("I/O failure reading page for metric {metric}: {source}")]
	Read {
		metric: MetricId,
		source: std::io::Error,
	},

	#[error("no data found for the requested range")]
	NotFound,
}

/// The bytes and extent accounting returned by a successful `write_pages`
/// call, used to update the I/O statistics in spec §6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
	pub bytes_written: usize,
	pub extent_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
	pub bytes_read: usize,
	pub extent_count: usize,
}

/// One page handed to the codec for flushing: its descriptor (for
/// identity and to clear `DIRTY` on success) plus the bytes read out of
/// the page slab while the caller still held it pinned.
pub struct PendingWrite {
	pub descriptor: Arc<PageDescriptor>,
	pub bytes: Vec<u8>,
}

/// The contract the worker drives every flush and load through (spec §5
/// "External codec boundary", §9 "drains the commit ring to the external
/// datafile writer").
#[cfg_attr(test, automock)]
pub trait DatafileCodec {
	/// Accepts an ordered batch of pages, decides compression and extent
	/// packing, and reports the bytes actually written. On success the
	/// caller clears `DIRTY` and removes each page from the commit ring
	/// (spec §5).
	fn write_pages(&self, batch: Vec<PendingWrite>) -> Result<WriteOutcome, CodecError>;

	/// Returns the bytes for the page covering `[start_time, end_time]` on
	/// `metric_id`, or `NotFound` (spec §5 `read_page`).
	fn read_page(
		&self,
		metric_id: MetricId,
		start_time: i64,
		end_time: i64,
	) -> Result<(Vec<u8>, ReadOutcome), CodecError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mock_write_pages_reports_outcome() {
		let mut codec = MockDatafileCodec::new();
		codec.expect_write_pages().returning(|batch| {
			Ok(WriteOutcome {
				bytes_written: batch.iter().map(|p| p.bytes.len()).sum(),
				extent_count: 1,
			})
		});

		let descriptor = Arc::new(PageDescriptor::new_populated(
			MetricId::from_bytes([1; 16]),
			0,
		));
		let outcome = codec
			.write_pages(vec![PendingWrite {
				descriptor,
				bytes: vec![0; 16],
			}])
			.unwrap();
		assert_eq!(outcome.bytes_written, 16);
	}

	#[test]
	fn mock_read_page_not_found() {
		let mut codec = MockDatafileCodec::new();
		codec
			.expect_read_page()
			.returning(|_, _, _| Err(CodecError::NotFound));

		let err = codec
			.read_page(MetricId::from_bytes([2; 16]), 0, 10)
			.unwrap_err();
		assert!(matches!(err, CodecError::NotFound));
	}
}
