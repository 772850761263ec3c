use crate::error::{InvalidDlc, TryIntoCanDataError, TryNewFrameError};
use crate::id::Id;

/// The maximum payload length of a classic CAN frame.
pub const MAX_CLASSIC_LEN: usize = 8;

/// The maximum payload length of a CAN FD frame.
pub const MAX_FD_LEN: usize = 64;

macro_rules! bitflags_like {
	(
		$(#[$meta:meta])*
		pub struct $name:ident: $repr:ty {
			$(
				$(#[$field_meta:meta])*
				const $field:ident = $value:expr;
			)*
		}
	) => {
		$(#[$meta])*
		#[derive(Copy, Clone, Eq, PartialEq, Default)]
		pub struct $name($repr);

		impl $name {
			$(
				$(#[$field_meta])*
				pub const $field: Self = Self($value);
			)*

			/// An empty set of flags.
			pub const fn empty() -> Self {
				Self(0)
			}

			/// Whether `self` contains all bits set in `other`.
			pub const fn contains(self, other: Self) -> bool {
				self.0 & other.0 == other.0
			}
		}

		impl std::ops::BitOr for $name {
			type Output = Self;
			fn bitor(self, rhs: Self) -> Self {
				Self(self.0 | rhs.0)
			}
		}

		impl std::ops::BitOrAssign for $name {
			fn bitor_assign(&mut self, rhs: Self) {
				self.0 |= rhs.0;
			}
		}
	}
}

/// A CAN frame: an identifier, a handful of control flags, and a payload.
///
/// This type carries no transport-specific state. It is produced by a host
/// application from received bus traffic and consumed by a host application
/// to transmit bus traffic; nothing in this crate reads or writes a socket.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Frame {
	id: Id,
	flags: Flags,
	len: u8,
	data: [u8; MAX_FD_LEN],
}

bitflags_like! {
	/// Control flags carried alongside a frame's identifier.
	pub struct Flags: u8 {
		/// Remote transmission request: the frame carries no payload, only a request for data.
		const RTR = 0x01;
		/// FD format indicator: the frame uses the CAN FD wire format.
		const FDF = 0x02;
		/// Bit rate switch: the data phase of an FD frame used a higher bit rate.
		const BRS = 0x04;
		/// Error state indicator, set by the transmitter of an FD frame.
		const ESI = 0x08;
	}
}

impl Frame {
	/// Create a new classic (non-FD) data frame.
	///
	/// `id` is widened to an extended identifier automatically if it doesn't fit in 11 bits;
	/// use [`Id::with_ide`] beforehand to force a particular encoding.
	pub fn new(id: u32, data: &[u8]) -> Result<Self, TryNewFrameError> {
		let id = Id::new(id)?;
		if data.len() > MAX_CLASSIC_LEN {
			return Err(TryIntoCanDataError { len: data.len() }.into());
		}
		Ok(Self::from_raw_parts(id, Flags::empty(), data))
	}

	/// Create a new remote transmission request frame.
	pub fn new_rtr(id: u32, len: u8) -> Result<Self, TryNewFrameError> {
		let id = Id::new(id)?;
		if len as usize > MAX_CLASSIC_LEN {
			return Err(InvalidDlc { value: len }.into());
		}
		Ok(Self { id, flags: Flags::RTR, len, data: [0; MAX_FD_LEN] })
	}

	/// Create a new CAN FD data frame.
	pub fn new_fd(id: u32, data: &[u8], bit_rate_switch: bool) -> Result<Self, TryNewFrameError> {
		let id = Id::new(id)?;
		if data.len() > MAX_FD_LEN {
			return Err(TryIntoCanDataError { len: data.len() }.into());
		}
		let mut flags = Flags::FDF;
		if bit_rate_switch {
			flags |= Flags::BRS;
		}
		Ok(Self::from_raw_parts(id, flags, data))
	}

	fn from_raw_parts(id: Id, flags: Flags, data: &[u8]) -> Self {
		let mut buffer = [0u8; MAX_FD_LEN];
		buffer[..data.len()].copy_from_slice(data);
		Self { id, flags, len: data.len() as u8, data: buffer }
	}

	/// The identifier of the frame.
	pub fn id(&self) -> Id {
		self.id
	}

	/// Whether the frame uses an 29-bit extended identifier.
	pub fn is_extended(&self) -> bool {
		self.id.is_extended()
	}

	/// Whether the frame is a remote transmission request.
	pub fn is_rtr(&self) -> bool {
		self.flags.contains(Flags::RTR)
	}

	/// Whether the frame uses the CAN FD wire format.
	pub fn is_fd(&self) -> bool {
		self.flags.contains(Flags::FDF)
	}

	/// Whether the data phase of an FD frame used the higher bit rate.
	pub fn bit_rate_switch(&self) -> bool {
		self.flags.contains(Flags::BRS)
	}

	/// The error state indicator of an FD frame.
	pub fn error_state_indicator(&self) -> bool {
		self.flags.contains(Flags::ESI)
	}

	/// The payload of the frame.
	///
	/// For a remote transmission request, this is always empty; use [`Self::len`]
	/// to get the requested data length.
	pub fn data(&self) -> &[u8] {
		if self.is_rtr() {
			&[]
		} else {
			&self.data[..self.len as usize]
		}
	}

	/// The data length code of the frame.
	pub fn len(&self) -> u8 {
		self.len
	}

	/// Whether the frame carries an empty payload.
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

impl std::fmt::Debug for Frame {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Frame")
			.field("id", &self.id)
			.field("rtr", &self.is_rtr())
			.field("fd", &self.is_fd())
			.field("data", &self.data())
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn classic_frame_roundtrips_payload() {
		let frame = Frame::new(0x123, &[1, 2, 3]).unwrap();
		assert_eq!(frame.data(), &[1, 2, 3]);
		assert_eq!(frame.len(), 3);
		assert!(!frame.is_fd());
		assert!(!frame.is_rtr());
	}

	#[test]
	fn classic_frame_rejects_oversized_payload() {
		assert!(Frame::new(0x123, &[0; 9]).is_err());
	}

	#[test]
	fn fd_frame_allows_up_to_64_bytes() {
		let data = [7u8; 64];
		let frame = Frame::new_fd(0x123, &data, true).unwrap();
		assert_eq!(frame.data(), &data[..]);
		assert!(frame.is_fd());
		assert!(frame.bit_rate_switch());
	}

	#[test]
	fn rtr_frame_has_no_payload() {
		let frame = Frame::new_rtr(0x123, 4).unwrap();
		assert!(frame.is_rtr());
		assert_eq!(frame.data(), &[]);
		assert_eq!(frame.len(), 4);
	}
}
