//! Object dictionary errors.

use thiserror::Error;

use crate::abort::AbortCode;

/// Failure modes of a dictionary lookup or access.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DictError {
	/// No object exists at the given index.
	#[error("object 0x{index:04X} does not exist")]
	NoObject {
		/// The index that was looked up.
		index: u16,
	},
	/// No sub-object exists at the given (index, sub-index) pair.
	#[error("object 0x{index:04X} sub {sub_index} does not exist")]
	NoSubObject {
		/// The index that was looked up.
		index: u16,
		/// The sub-index that was looked up.
		sub_index: u8,
	},
	/// The access mode of the sub-object forbids the attempted operation.
	#[error("access denied: {0}")]
	AccessDenied(AbortCode),
	/// The supplied bytes did not decode as the sub-object's declared type.
	#[error("type mismatch decoding object: {0}")]
	TypeMismatch(#[from] crate::codec::CodecError),
	/// The value fell outside the sub-object's declared `[min, max]` range.
	#[error("value out of range: {0}")]
	OutOfRange(AbortCode),
	/// A download indication vetoed the write.
	#[error("write rejected by download indication: {0}")]
	DownloadRejected(AbortCode),
	/// An upload indication vetoed the read.
	#[error("read rejected by upload indication: {0}")]
	UploadRejected(AbortCode),
}

impl DictError {
	/// The SDO abort code this error should be reported as.
	pub fn abort_code(&self) -> AbortCode {
		match self {
			Self::NoObject { .. } => AbortCode::ObjectDoesNotExist,
			Self::NoSubObject { .. } => AbortCode::SubIndexDoesNotExist,
			Self::AccessDenied(code) => *code,
			Self::TypeMismatch(_) => AbortCode::DataTypeMismatchLengthMismatch,
			Self::OutOfRange(code) => *code,
			Self::DownloadRejected(code) => *code,
			Self::UploadRejected(code) => *code,
		}
	}
}
