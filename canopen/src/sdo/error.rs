//! SDO errors.

use thiserror::Error;

use crate::abort::AbortCode;

/// Failure modes of an SDO server or client session.
#[derive(Debug, Error)]
pub enum SdoError {
	/// The peer's request or response did not fit the expected frame shape.
	#[error("malformed SDO frame: {0}")]
	Malformed(&'static str),
	/// The peer sent a command specifier this session did not expect in its current state.
	#[error("unexpected SDO command specifier 0x{0:02X}")]
	UnexpectedCommand(u8),
	/// The toggle bit on a segment did not alternate as required.
	#[error("toggle bit not alternated")]
	ToggleMismatch,
	/// The peer aborted the transfer.
	#[error("transfer aborted by peer: {0}")]
	Aborted(AbortCode),
	/// No response arrived before the session's timeout deadline.
	#[error("SDO session timed out")]
	Timeout,
	/// A block-transfer CRC check failed.
	#[error("block transfer CRC mismatch")]
	CrcMismatch,
	/// A block-transfer segment carried a sequence number outside the active window.
	#[error("invalid block transfer sequence number {0}")]
	InvalidSequenceNumber(u8),
	/// This session already has an active transfer; one-at-a-time per peer.
	#[error("an SDO transfer is already in progress")]
	Busy,
	/// The dispatcher's send callback failed while transmitting an SDO frame.
	#[error("failed to send SDO frame: {0}")]
	Send(#[from] crate::dispatcher::DispatchError),
}
