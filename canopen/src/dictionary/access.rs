//! Sub-object access control.

use crate::nmt::NmtState;

/// The access mode of a sub-object.
///
/// `Rwr` and `Rww` are state-dependent: unlike the other four, which are
/// pairs of static read/write bits, whether they permit an access depends on
/// the device's current NMT state, so this is an enum rather than a
/// `{read: bool, write: bool}` pair.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AccessType {
	/// Never writable; always readable.
	Const,
	/// Read-only.
	Ro,
	/// Write-only.
	Wo,
	/// Read-write.
	Rw,
	/// Read-write in `Pre-operational`, read-only once `Operational`.
	Rwr,
	/// Read-write in `Pre-operational`, write-only once `Operational`.
	Rww,
}

impl AccessType {
	/// Whether a read is permitted while the device is in `state`.
	pub fn is_readable(self, state: NmtState) -> bool {
		match self {
			Self::Const | Self::Ro | Self::Rw => true,
			Self::Wo => false,
			Self::Rwr => true,
			Self::Rww => state != NmtState::Operational,
		}
	}

	/// Whether a write is permitted while the device is in `state`.
	pub fn is_writable(self, state: NmtState) -> bool {
		match self {
			Self::Const | Self::Ro => false,
			Self::Wo | Self::Rw => true,
			Self::Rwr => state != NmtState::Operational,
			Self::Rww => true,
		}
	}
}
