use thiserror::Error;

use crate::index::MetricId;

/// Errors surfaced across the public API.
///
/// `Invariant` is reserved for conditions the spec treats as memory
/// corruption (duplicate UUID insertion, refcount underflow, a second
/// writer on a metric). Call sites that detect one return it so tests
/// can assert on the variant, but a real deployment should treat it as
/// fatal rather than attempt to continue.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("failed to initialize engine instance: {0}")]
	InitFailed(String),

	#[error("page cache is exhausted and no page could be admitted")]
	ResourceExhausted,

	#[error("point in time for metric {metric} is not monotonically increasing (dropped)")]
	OutOfOrderTime { metric: MetricId },

	#[error("no data found for the requested range")]
	NotFound,

	#[error("I/O failure in the datafile codec: {0}")]
	IoFailure(String),

	#[error("operation submitted after the instance was quiesced or shut down")]
	Shutdown,

	#[error("internal invariant violated: {0}")]
	Invariant(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
