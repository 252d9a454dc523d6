//! Metric identity (spec §3): a 16-byte UUID, with the legacy and
//! multihost derivations Netdata used to bridge single-host and
//! multi-host databases.

use core::fmt;

use sha2::{Digest, Sha256};

use crate::index::MetricId;

/// Derives the legacy per-host UUID: `SHA-256(dim_id || chart_id)[..16]`.
pub fn legacy_uuid(dim_id: &[u8], chart_id: &[u8]) -> MetricId {
	let mut hasher = Sha256::new();
	hasher.update(dim_id);
	hasher.update(chart_id);
	truncate(hasher.finalize().into())
}

/// Derives the multihost UUID: `SHA-256(machine_guid || legacy_uuid)[..16]`.
///
/// Deterministic: calling this twice with the same inputs yields the same
/// bytes (spec §8 round-trip property).
pub fn multihost_uuid(machine_guid: &[u8], legacy: MetricId) -> MetricId {
	let mut hasher = Sha256::new();
	hasher.update(machine_guid);
	hasher.update(legacy.as_bytes());
	truncate(hasher.finalize().into())
}

fn truncate(digest: [u8; 32]) -> MetricId {
	let mut bytes = [0u8; 16];
	bytes.copy_from_slice(&digest[..16]);
	MetricId::from_bytes(bytes)
}

/// Whether a dimension's stored UUID is in the legacy, single-host form or
/// has already been rewritten to the multihost form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
	Legacy,
	Multihost,
}

impl fmt::Display for UuidKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Legacy => write!(f, "legacy"),
			Self::Multihost => write!(f, "multihost"),
		}
	}
}

/// A legacy UUID is only rewritten the first time it is seen under a given
/// machine GUID; a dimension already carrying the multihost form is left
/// alone (supplemented behavior from the original's
/// `rrdeng_convert_legacy_uuid_to_multihost`, see SPEC_FULL.md).
pub fn is_legacy_rewrite_eligible(kind: UuidKind) -> bool {
	matches!(kind, UuidKind::Legacy)
}
