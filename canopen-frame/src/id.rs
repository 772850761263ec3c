use crate::error::InvalidId;

/// The highest valid value for a standard CAN ID.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// The highest valid value for an extended CAN ID.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// A CAN ID, either standard (11 bit) or extended (29 bits).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Id {
	/// A standard 11 bit CAN ID.
	Standard(StandardId),

	/// An extended 29 bit CAN ID.
	Extended(ExtendedId),
}

/// A standard 11 bit CAN ID.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct StandardId {
	id: u16,
}

/// An extended 29 bit CAN ID.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ExtendedId {
	id: u32,
}

impl Id {
	/// Create a new CAN ID from a raw value.
	///
	/// If the value fits in a 11 bit standard CAN ID, this returns [`Self::Standard`].
	/// Otherwise, if it fits in 29 bits, this returns [`Self::Extended`].
	pub const fn new(id: u32) -> Result<Self, InvalidId> {
		if id <= MAX_STANDARD_ID as u32 {
			Ok(Self::Standard(StandardId { id: id as u16 }))
		} else {
			match ExtendedId::new(id) {
				Ok(id) => Ok(Self::Extended(id)),
				Err(e) => Err(e),
			}
		}
	}

	/// Create a CAN ID from a raw value with an explicit IDE (extended) flag.
	///
	/// Unlike [`Self::new`], a small value with the IDE flag set stays [`Self::Extended`]
	/// instead of being narrowed to a standard ID.
	pub const fn with_ide(id: u32, extended: bool) -> Result<Self, InvalidId> {
		if extended {
			match ExtendedId::new(id) {
				Ok(id) => Ok(Self::Extended(id)),
				Err(e) => Err(e),
			}
		} else if id <= MAX_STANDARD_ID as u32 {
			Ok(Self::Standard(StandardId { id: id as u16 }))
		} else {
			Err(InvalidId { id: Some(id), extended: false })
		}
	}

	/// Get the raw value as a `u32`.
	pub const fn as_u32(self) -> u32 {
		self.to_extended().as_u32()
	}

	/// Whether this ID is encoded with the IDE (extended) flag set.
	pub const fn is_extended(self) -> bool {
		matches!(self, Self::Extended(_))
	}

	/// Get `self` as a [`StandardId`], or `None` if this is an extended ID.
	pub const fn as_standard(self) -> Option<StandardId> {
		match self {
			Self::Standard(id) => Some(id),
			Self::Extended(_) => None,
		}
	}

	/// Get `self` as an [`ExtendedId`], or `None` if this is a standard ID.
	pub const fn as_extended(self) -> Option<ExtendedId> {
		match self {
			Self::Standard(_) => None,
			Self::Extended(id) => Some(id),
		}
	}

	/// Convert the ID to an extended ID, widening a standard ID if needed.
	pub const fn to_extended(self) -> ExtendedId {
		match self {
			Self::Standard(id) => ExtendedId { id: id.id as u32 },
			Self::Extended(id) => id,
		}
	}
}

impl StandardId {
	/// The maximum valid standard ID.
	pub const MAX: Self = Self { id: MAX_STANDARD_ID };

	/// Try to create a new standard ID from a raw value.
	///
	/// Returns an error if the value doesn't fit in 11 bits.
	pub const fn new(id: u16) -> Result<Self, InvalidId> {
		if id <= MAX_STANDARD_ID {
			Ok(Self { id })
		} else {
			Err(InvalidId { id: Some(id as u32), extended: false })
		}
	}

	/// Create a new standard CAN ID without checking for validity.
	///
	/// # Safety
	/// The given ID must be a valid standard CAN ID (`id <= MAX_STANDARD_ID`).
	pub const unsafe fn new_unchecked(id: u16) -> Self {
		debug_assert!(id <= MAX_STANDARD_ID);
		Self { id }
	}

	/// Get the raw value as a `u16`.
	pub const fn as_u16(self) -> u16 {
		self.id
	}
}

impl ExtendedId {
	/// The maximum valid extended ID.
	pub const MAX: Self = Self { id: MAX_EXTENDED_ID };

	/// Try to create a new extended ID from a raw value.
	///
	/// Returns an error if the value doesn't fit in 29 bits.
	pub const fn new(id: u32) -> Result<Self, InvalidId> {
		if id <= MAX_EXTENDED_ID {
			Ok(Self { id })
		} else {
			Err(InvalidId { id: Some(id), extended: true })
		}
	}

	/// Create a new extended CAN ID without checking for validity.
	///
	/// # Safety
	/// The given ID must be a valid extended CAN ID (`id <= MAX_EXTENDED_ID`).
	pub const unsafe fn new_unchecked(id: u32) -> Self {
		debug_assert!(id <= MAX_EXTENDED_ID);
		Self { id }
	}

	/// Get the raw value as a `u32`.
	pub const fn as_u32(self) -> u32 {
		self.id
	}
}

impl PartialEq<StandardId> for Id {
	fn eq(&self, other: &StandardId) -> bool {
		self.as_standard().is_some_and(|id| id == *other)
	}
}

impl PartialEq<ExtendedId> for Id {
	fn eq(&self, other: &ExtendedId) -> bool {
		self.as_extended().is_some_and(|id| id == *other)
	}
}

impl From<StandardId> for Id {
	fn from(value: StandardId) -> Self {
		Self::Standard(value)
	}
}

impl From<ExtendedId> for Id {
	fn from(value: ExtendedId) -> Self {
		Self::Extended(value)
	}
}

impl TryFrom<u32> for Id {
	type Error = InvalidId;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl TryFrom<u32> for StandardId {
	type Error = InvalidId;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		if value > MAX_STANDARD_ID as u32 {
			Err(InvalidId { id: Some(value), extended: false })
		} else {
			Self::new(value as u16)
		}
	}
}

impl From<u8> for StandardId {
	fn from(value: u8) -> Self {
		Self { id: value.into() }
	}
}

impl From<u8> for Id {
	fn from(value: u8) -> Self {
		Self::Standard(value.into())
	}
}

impl From<u16> for Id {
	fn from(value: u16) -> Self {
		if value <= MAX_STANDARD_ID {
			Self::Standard(StandardId { id: value })
		} else {
			Self::Extended(ExtendedId { id: value as u32 })
		}
	}
}

impl std::fmt::Debug for Id {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Standard(id) => id.fmt(f),
			Self::Extended(id) => id.fmt(f),
		}
	}
}

impl std::fmt::Debug for StandardId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("StandardId").field(&format_args!("0x{:03X}", self.id)).finish()
	}
}

impl std::fmt::Debug for ExtendedId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("ExtendedId").field(&format_args!("0x{:08X}", self.id)).finish()
	}
}
