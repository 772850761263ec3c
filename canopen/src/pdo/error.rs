//! PDO configuration and mapping errors.

use thiserror::Error;

use crate::dictionary::DictError;
use crate::dispatcher::DispatchError;

/// A PDO mapping record failed validation before a service could be started.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PdoMappingError {
	/// The mapping's total bit length exceeds the 64-bit PDO payload limit.
	#[error("PDO mapping exceeds 64 bits: {total} bits mapped")]
	TooManyBits {
		/// The total number of bits the mapping record would occupy.
		total: u32,
	},
}

/// The value given for a TPDO's synchronous transmission type is outside `1..=0xF0`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("invalid value for PDO transmission type `nth sync`: value must be between 1 and 240 (inclusive), but got {value}")]
pub struct InvalidSyncInterval {
	pub(crate) value: u8,
}

/// Failure starting an RPDO or TPDO service.
#[derive(Debug, Error)]
pub enum PdoStartError {
	/// The mapping record given to the service was invalid.
	#[error("invalid PDO mapping: {0}")]
	Mapping(#[from] PdoMappingError),
	/// The dispatcher could not register the service's receiver or timer.
	#[error("failed to register with the dispatcher: {0}")]
	Dispatch(#[from] DispatchError),
}

/// Failure applying an inbound RPDO frame to the object dictionary.
#[derive(Debug, Error)]
pub enum PdoError {
	/// A mapped sub-object rejected the decoded value.
	#[error("dictionary rejected mapped value: {0}")]
	Dictionary(#[from] DictError),
}
