//! Per-sub-object download/upload hooks.
//!
//! Installed by a service at creation and removed at destruction, per the
//! "cross-service object-dictionary callbacks" design note: writes to
//! 0x1016/0x1017/0x1400.../0x1800.../0x1A00... reconfigure the service that
//! owns them instead of being silently accepted as plain data.

use crate::abort::AbortCode;
use crate::codec::Value;

/// Consulted before a sub-object's stored value is replaced.
///
/// Returning `Err` aborts the write before the value is swapped, so a
/// rejected download never leaves a partially-applied value behind.
pub trait DownloadIndication {
	/// Validate (and optionally react to) a pending write of `candidate`.
	fn on_download(&mut self, candidate: &Value) -> Result<(), AbortCode>;
}

/// Consulted before a sub-object's stored value is read back for an upload.
pub trait UploadIndication {
	/// Optionally replace or veto the value that would otherwise be returned.
	fn on_upload(&mut self, current: &Value) -> Result<Value, AbortCode>;
}

impl<F: FnMut(&Value) -> Result<(), AbortCode>> DownloadIndication for F {
	fn on_download(&mut self, candidate: &Value) -> Result<(), AbortCode> {
		self(candidate)
	}
}

impl<F: FnMut(&Value) -> Result<Value, AbortCode>> UploadIndication for F {
	fn on_upload(&mut self, current: &Value) -> Result<Value, AbortCode> {
		self(current)
	}
}
