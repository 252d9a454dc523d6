use std::ops::RangeInclusive;

use thiserror::Error;

use crate::utils::units::*;

/// Design constant: size in bytes of one page's fixed-width sample buffer.
pub const DEFAULT_PAGE_SIZE: usize = 4 * KiB;

pub const PAGE_SIZE_RANGE: RangeInclusive<usize> = (64 * B)..=(1 * MiB);

/// Width in bytes of one fixed-width sample.
pub const SAMPLE_SIZE: usize = 4;

pub const DEFAULT_PAGE_CACHE_MB: usize = 32;
pub const MIN_PAGE_CACHE_MB: usize = 8;
pub const DEFAULT_DISK_QUOTA_MB: usize = 256;
pub const DEFAULT_MULTIDB_DISK_QUOTA_MB: usize = 256;

/// Per-instance file descriptor reservation (design constant, spec §6).
pub const FD_BUDGET_PER_INSTANCE: usize = 50;

/// Sentinel bytes for an unwritten sample slot, used by `flush_current_page`
/// to detect an all-empty page eligible for `punch_hole` (spec §4.4).
pub const EMPTY_SAMPLE: [u8; SAMPLE_SIZE] = [0xff; SAMPLE_SIZE];

/// Microseconds per second, for the variable-step Δt rounding in §4.5.
pub const USEC_PER_SEC: i64 = 1_000_000;

/// Max pages the worker hands the codec in one `write_pages` call (spec
/// §4.9 flush scheduling).
pub const FLUSH_BATCH_SIZE: usize = 64;

#[derive(Debug, Error)]
#[error(
	"page size {0} is invalid; must be a power of two between {} and {}",
	display_size(*PAGE_SIZE_RANGE.start()),
	display_size(*PAGE_SIZE_RANGE.end())
)]
pub struct PageSizeBoundsError(pub(crate) usize);

#[inline]
pub fn validate_page_size(size: usize) -> Result<(), PageSizeBoundsError> {
	if !size.is_power_of_two() || !PAGE_SIZE_RANGE.contains(&size) {
		return Err(PageSizeBoundsError(size));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_non_power_of_two() {
		assert!(validate_page_size(100).is_err());
	}

	#[test]
	fn accepts_default() {
		assert!(validate_page_size(DEFAULT_PAGE_SIZE).is_ok());
	}
}
