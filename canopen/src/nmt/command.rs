//! NMT service commands, received on COB-ID 0x000.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::nmt::state::NmtState;

/// A command carried in an NMT service frame: `{command, node_id}` on COB-ID `0x000`.
///
/// `node_id == 0` addresses every node on the network. Repr values are
/// reused verbatim from the teacher's `NmtCommand`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NmtCommand {
	Start = 1,
	Stop = 2,
	GoToPreOperational = 128,
	ResetNode = 129,
	ResetCommunication = 130,
}

impl NmtCommand {
	/// The device state this command drives a receiving node into, when applicable.
	///
	/// `ResetNode`/`ResetCommunication` do not map onto a single [`NmtState`]:
	/// they restart the boot sequence instead of landing in one directly.
	pub fn expected_state(self) -> Option<NmtState> {
		match self {
			Self::Start => Some(NmtState::Operational),
			Self::Stop => Some(NmtState::Stopped),
			Self::GoToPreOperational => Some(NmtState::PreOperational),
			Self::ResetNode | Self::ResetCommunication => None,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn repr_values_match_wire_bytes() {
		assert_eq!(u8::from(NmtCommand::Start), 1);
		assert_eq!(u8::from(NmtCommand::Stop), 2);
		assert_eq!(u8::from(NmtCommand::GoToPreOperational), 128);
		assert_eq!(u8::from(NmtCommand::ResetNode), 129);
		assert_eq!(u8::from(NmtCommand::ResetCommunication), 130);
	}
}
