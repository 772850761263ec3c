//! SDO abort codes.
//!
//! The object dictionary and the SDO server/client share this type: a write
//! rejected by a range check or a download indication reports the same code
//! that eventually rides out on the wire in an abort frame.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The CiA 301 Annex A abort code set, carried as the 4-byte data field of an
/// SDO abort frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum AbortCode {
	ToggleBitNotAlternated = 0x0503_0000,
	SdoProtocolTimedOut = 0x0504_0000,
	InvalidOrUnknownCommandSpecifier = 0x0504_0001,
	InvalidBlockSize = 0x0504_0002,
	InvalidSequenceNumber = 0x0504_0003,
	CrcError = 0x0504_0004,
	OutOfMemory = 0x0504_0005,
	UnsupportedAccess = 0x0601_0000,
	AttemptToReadWriteOnly = 0x0601_0001,
	AttemptToWriteReadOnly = 0x0601_0002,
	ObjectDoesNotExist = 0x0602_0000,
	ObjectCannotBeMappedToPdo = 0x0604_0041,
	PdoLengthExceeded = 0x0604_0042,
	GeneralParameterIncompatibility = 0x0604_0043,
	GeneralInternalIncompatibility = 0x0604_0047,
	AccessFailedDueToHardwareError = 0x0606_0000,
	DataTypeMismatchLengthMismatch = 0x0607_0010,
	DataTypeMismatchLengthTooHigh = 0x0607_0012,
	DataTypeMismatchLengthTooLow = 0x0607_0013,
	SubIndexDoesNotExist = 0x0609_0011,
	ValueRangeExceeded = 0x0609_0030,
	ValueTooHigh = 0x0609_0031,
	ValueTooLow = 0x0609_0032,
	MaxLessThanMin = 0x0609_0036,
	ResourceNotAvailable = 0x060A_0023,
	GeneralError = 0x0800_0000,
	DataCannotBeTransferredOrStored = 0x0800_0020,
	DataCannotBeTransferredLocalControl = 0x0800_0021,
	DataCannotBeTransferredDeviceState = 0x0800_0022,
	NoObjectDictionaryPresent = 0x0800_0023,
	NoDataAvailable = 0x0800_0024,
}

impl AbortCode {
	/// A short human-readable description, as the teacher's `Display` impl provides.
	pub fn description(self) -> &'static str {
		match self {
			Self::ToggleBitNotAlternated => "toggle bit not alternated",
			Self::SdoProtocolTimedOut => "SDO protocol timed out",
			Self::InvalidOrUnknownCommandSpecifier => "client/server command specifier not valid or unknown",
			Self::InvalidBlockSize => "invalid block size in block mode",
			Self::InvalidSequenceNumber => "invalid sequence number in block mode",
			Self::CrcError => "CRC error in block mode",
			Self::OutOfMemory => "out of memory",
			Self::UnsupportedAccess => "unsupported access to an object",
			Self::AttemptToReadWriteOnly => "attempt to read a write only object",
			Self::AttemptToWriteReadOnly => "attempt to write a read only object",
			Self::ObjectDoesNotExist => "object does not exist in the object dictionary",
			Self::ObjectCannotBeMappedToPdo => "object cannot be mapped to the PDO",
			Self::PdoLengthExceeded => "number and length of mapped objects exceeds PDO length",
			Self::GeneralParameterIncompatibility => "general parameter incompatibility reason",
			Self::GeneralInternalIncompatibility => "general internal incompatibility in the device",
			Self::AccessFailedDueToHardwareError => "access failed due to a hardware error",
			Self::DataTypeMismatchLengthMismatch => "data type does not match, length of service parameter does not match",
			Self::DataTypeMismatchLengthTooHigh => "data type does not match, length of service parameter too high",
			Self::DataTypeMismatchLengthTooLow => "data type does not match, length of service parameter too low",
			Self::SubIndexDoesNotExist => "sub-index does not exist",
			Self::ValueRangeExceeded => "value range of parameter exceeded",
			Self::ValueTooHigh => "value of parameter written too high",
			Self::ValueTooLow => "value of parameter written too low",
			Self::MaxLessThanMin => "maximum value is less than minimum value",
			Self::ResourceNotAvailable => "resource not available: SDO connection",
			Self::GeneralError => "general error",
			Self::DataCannotBeTransferredOrStored => "data cannot be transferred or stored to the application",
			Self::DataCannotBeTransferredLocalControl => "data cannot be transferred due to local control",
			Self::DataCannotBeTransferredDeviceState => "data cannot be transferred due to the present device state",
			Self::NoObjectDictionaryPresent => "object dictionary dynamic generation fails or no object dictionary is present",
			Self::NoDataAvailable => "no data available",
		}
	}
}

impl std::fmt::Display for AbortCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "0x{:08X} ({})", u32::from(*self), self.description())
	}
}
