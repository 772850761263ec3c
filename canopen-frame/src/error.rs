//! Error types returned by fallible conversions in this crate.

#[derive(Debug, Clone)]
pub struct InvalidId {
	pub(crate) id: Option<u32>,
	pub(crate) extended: bool,
}

impl std::error::Error for InvalidId {}
impl std::fmt::Display for InvalidId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match (self.id, self.extended) {
			(Some(id), false) => write!(f, "invalid base (non-extended) CAN ID: 0x{:03X}, maximum valid value is 0x7FF", id),
			(None, false) => write!(f, "invalid base (non-extended) CAN ID: allowed values are 0 to 0x7FF"),
			(Some(id), true) => write!(f, "invalid extended CAN ID: 0x{:08X}, maximum valid value is 0x1FFF_FFFF", id),
			(None, true) => write!(f, "invalid extended CAN ID, allowed values are 0 to 0x1FFF_FFFF"),
		}
	}
}

#[derive(Clone, Debug)]
pub struct TryIntoCanDataError {
	pub(crate) len: usize,
}

impl std::error::Error for TryIntoCanDataError {}

impl std::fmt::Display for TryIntoCanDataError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "data too large for CAN frame, expected at most 64 bytes, got {}", self.len)
	}
}

#[derive(Clone)]
pub struct TryNewFrameError {
	inner: TryNewFrameErrorInner,
}

#[derive(Clone, Debug)]
enum TryNewFrameErrorInner {
	InvalidId(InvalidId),
	InvalidData(TryIntoCanDataError),
	InvalidDlc(InvalidDlc),
}

impl std::error::Error for TryNewFrameError {}

impl std::fmt::Display for TryNewFrameError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.inner {
			TryNewFrameErrorInner::InvalidId(e) => e.fmt(f),
			TryNewFrameErrorInner::InvalidData(e) => e.fmt(f),
			TryNewFrameErrorInner::InvalidDlc(e) => e.fmt(f),
		}
	}
}

impl std::fmt::Debug for TryNewFrameError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		std::fmt::Debug::fmt(&self.inner, f)
	}
}

impl From<InvalidId> for TryNewFrameError {
	fn from(value: InvalidId) -> Self {
		Self { inner: TryNewFrameErrorInner::InvalidId(value) }
	}
}

impl From<TryIntoCanDataError> for TryNewFrameError {
	fn from(value: TryIntoCanDataError) -> Self {
		Self { inner: TryNewFrameErrorInner::InvalidData(value) }
	}
}

impl From<InvalidDlc> for TryNewFrameError {
	fn from(value: InvalidDlc) -> Self {
		Self { inner: TryNewFrameErrorInner::InvalidDlc(value) }
	}
}

/// A data length code did not correspond to a valid classic or FD frame payload length.
#[derive(Debug, Clone)]
pub struct InvalidDlc {
	pub(crate) value: u8,
}

impl std::error::Error for InvalidDlc {}

impl std::fmt::Display for InvalidDlc {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "invalid data length code: {}, maximum allowed value is 15", self.value)
	}
}
