//! The crate-level error type, composing every module's own error enum.
//!
//! Individual services return their own narrower error (`SdoError`,
//! `PdoStartError`, `DictError`, ...); this type exists for callers who want
//! one `Result` to thread through code that touches more than one service,
//! the way an application's boot/reset-communication path does.

use thiserror::Error;

use crate::dcf::DcfError;
use crate::dictionary::DictError;
use crate::dispatcher::DispatchError;
use crate::nmt::{BootStatus, NmtError};
use crate::pdo::{PdoError, PdoStartError};
use crate::sdo::SdoError;
use crate::service::ServiceSetError;

/// Any error this crate's services can produce.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	#[error(transparent)]
	Dictionary(#[from] DictError),
	#[error(transparent)]
	Nmt(#[from] NmtError),
	#[error(transparent)]
	Sdo(#[from] SdoError),
	#[error(transparent)]
	PdoStart(#[from] PdoStartError),
	#[error(transparent)]
	Pdo(#[from] PdoError),
	#[error(transparent)]
	Service(#[from] ServiceSetError),
	#[error(transparent)]
	Dcf(#[from] DcfError),
	/// A remote slave's master boot-up sequence failed its identity or configuration check.
	#[error("boot failed for node {node_id}: {status:?} (code {code})")]
	Boot {
		/// The slave that failed to boot.
		node_id: u8,
		/// The single-character CiA 302 status code.
		status: BootStatus,
		/// `status.code()`, spelled out for display since `BootStatus` doesn't implement `Display`.
		code: char,
	},
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn dispatch_error_converts_into_crate_error() {
		let err: Error = DispatchError::OutOfMemory.into();
		assert!(matches!(err, Error::Dispatch(DispatchError::OutOfMemory)));
	}

	#[test]
	fn boot_error_displays_its_status_code() {
		let err = Error::Boot { node_id: 9, status: BootStatus::VendorIdMismatch, code: BootStatus::VendorIdMismatch.code() };
		assert_eq!(err.to_string(), "boot failed for node 9: VendorIdMismatch (code C)");
	}
}
