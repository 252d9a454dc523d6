mod global;
mod metric;

pub use global::GlobalIndex;
pub use metric::{MetricPageIndex, PageInfo, PageLoader};

use core::fmt;

/// A metric's 16-byte identity (spec §3). Either a legacy or multihost
/// derivation; the index itself is agnostic to which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricId([u8; 16]);

impl MetricId {
	#[inline]
	pub fn from_bytes(bytes: [u8; 16]) -> Self {
		Self(bytes)
	}

	#[inline]
	pub fn as_bytes(&self) -> &[u8; 16] {
		&self.0
	}
}

impl fmt::Display for MetricId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for byte in self.0 {
			write!(f, "{byte:02x}")?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_is_lowercase_hex() {
		let id = MetricId::from_bytes([0xab; 16]);
		assert_eq!(id.to_string(), "ab".repeat(16));
	}
}
