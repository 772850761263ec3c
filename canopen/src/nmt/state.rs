//! The wire-visible NMT device state.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A device's NMT state, as carried in the heartbeat/node-guard payload byte.
///
/// Repr values are reused verbatim from the teacher's `NmtState`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NmtState {
	Initialisation = 0x00,
	Stopped = 0x04,
	Operational = 0x05,
	PreOperational = 0x7F,
}

impl NmtState {
	/// Whether PDOs are active while the device is in this state.
	///
	/// Only `Operational` processes PDOs; all other states disable them.
	pub fn pdos_enabled(self) -> bool {
		matches!(self, Self::Operational)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn repr_values_match_wire_bytes() {
		assert_eq!(u8::from(NmtState::Initialisation), 0x00);
		assert_eq!(u8::from(NmtState::Stopped), 0x04);
		assert_eq!(u8::from(NmtState::Operational), 0x05);
		assert_eq!(u8::from(NmtState::PreOperational), 0x7F);
	}

	#[test]
	fn only_operational_enables_pdos() {
		assert!(NmtState::Operational.pdos_enabled());
		assert!(!NmtState::PreOperational.pdos_enabled());
		assert!(!NmtState::Stopped.pdos_enabled());
	}
}
