//! Wire encoding for the CANopen basic and array data types.
//!
//! Every multi-byte quantity is little-endian, including the odd integer
//! widths (24/40/48/56 bit) that only exist in CANopen's type table. Decoding
//! sign-extends signed integers narrower than their Rust storage type.

use thiserror::Error;

/// Errors raised while decoding a value from wire bytes.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CodecError {
	/// The buffer was shorter than the declared type requires.
	#[error("buffer too short for {type_name}: need at least {needed} bytes, got {got}")]
	BufferTooShort {
		/// Name of the data type being decoded.
		type_name: &'static str,
		/// Minimum number of bytes required.
		needed: usize,
		/// Number of bytes actually supplied.
		got: usize,
	},
	/// A boolean byte was neither 0 nor 1.
	#[error("invalid boolean byte: 0x{0:02X}")]
	InvalidBoolean(u8),
}

/// A CANopen basic or array data type tag.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DataType {
	Boolean,
	I8,
	U8,
	I16,
	U16,
	I24,
	U24,
	I32,
	U32,
	I40,
	U40,
	I48,
	U48,
	I56,
	U56,
	I64,
	U64,
	Real32,
	Real64,
	TimeOfDay,
	TimeDifference,
	/// Field width in bytes; the value is zero-padded to this width on read.
	VisibleString(u16),
	OctetString(u16),
	/// Field width in 16-bit code units.
	UnicodeString(u16),
	Domain,
}

impl DataType {
	/// The fixed wire size of this type, or `None` for variable-length array types.
	pub const fn fixed_size(self) -> Option<usize> {
		Some(match self {
			Self::Boolean | Self::I8 | Self::U8 => 1,
			Self::I16 | Self::U16 => 2,
			Self::I24 | Self::U24 => 3,
			Self::I32 | Self::U32 | Self::Real32 => 4,
			Self::I40 | Self::U40 => 5,
			Self::I48 | Self::U48 | Self::TimeOfDay | Self::TimeDifference => 6,
			Self::I56 | Self::U56 => 7,
			Self::I64 | Self::U64 | Self::Real64 => 8,
			Self::VisibleString(_) | Self::OctetString(_) | Self::UnicodeString(_) | Self::Domain => return None,
		})
	}
}

/// A point in CANopen's `TIME_OF_DAY` / `TIME_DIFFERENCE` representation:
/// milliseconds since midnight and a day count.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TimeOfDay {
	/// Milliseconds since midnight, 0..=86_399_999 (28 bits on the wire).
	pub ms: u32,
	/// Days since 1984-01-01.
	pub days: u16,
}

/// A decoded CANopen value, tagged by its originating [`DataType`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Boolean(bool),
	I8(i8),
	U8(u8),
	I16(i16),
	U16(u16),
	I24(i32),
	U24(u32),
	I32(i32),
	U32(u32),
	I40(i64),
	U40(u64),
	I48(i64),
	U48(u64),
	I56(i64),
	U56(u64),
	I64(i64),
	U64(u64),
	Real32(f32),
	Real64(f64),
	TimeOfDay(TimeOfDay),
	TimeDifference(TimeOfDay),
	VisibleString(String),
	OctetString(Vec<u8>),
	UnicodeString(Vec<u16>),
	Domain(Vec<u8>),
}

impl Value {
	/// The data type tag this value was decoded as, or would encode as.
	pub fn data_type(&self) -> DataType {
		match self {
			Self::Boolean(_) => DataType::Boolean,
			Self::I8(_) => DataType::I8,
			Self::U8(_) => DataType::U8,
			Self::I16(_) => DataType::I16,
			Self::U16(_) => DataType::U16,
			Self::I24(_) => DataType::I24,
			Self::U24(_) => DataType::U24,
			Self::I32(_) => DataType::I32,
			Self::U32(_) => DataType::U32,
			Self::I40(_) => DataType::I40,
			Self::U40(_) => DataType::U40,
			Self::I48(_) => DataType::I48,
			Self::U48(_) => DataType::U48,
			Self::I56(_) => DataType::I56,
			Self::U56(_) => DataType::U56,
			Self::I64(_) => DataType::I64,
			Self::U64(_) => DataType::U64,
			Self::Real32(_) => DataType::Real32,
			Self::Real64(_) => DataType::Real64,
			Self::TimeOfDay(_) => DataType::TimeOfDay,
			Self::TimeDifference(_) => DataType::TimeDifference,
			Self::VisibleString(s) => DataType::VisibleString(s.len() as u16),
			Self::OctetString(b) => DataType::OctetString(b.len() as u16),
			Self::UnicodeString(u) => DataType::UnicodeString(u.len() as u16),
			Self::Domain(_) => DataType::Domain,
		}
	}

	/// Encode `self` to its little-endian wire representation.
	pub fn encode(&self) -> Vec<u8> {
		match self {
			Self::Boolean(v) => vec![*v as u8],
			Self::I8(v) => vec![*v as u8],
			Self::U8(v) => vec![*v],
			Self::I16(v) => v.to_le_bytes().to_vec(),
			Self::U16(v) => v.to_le_bytes().to_vec(),
			Self::I24(v) => v.to_le_bytes()[..3].to_vec(),
			Self::U24(v) => v.to_le_bytes()[..3].to_vec(),
			Self::I32(v) => v.to_le_bytes().to_vec(),
			Self::U32(v) => v.to_le_bytes().to_vec(),
			Self::I40(v) => v.to_le_bytes()[..5].to_vec(),
			Self::U40(v) => v.to_le_bytes()[..5].to_vec(),
			Self::I48(v) => v.to_le_bytes()[..6].to_vec(),
			Self::U48(v) => v.to_le_bytes()[..6].to_vec(),
			Self::I56(v) => v.to_le_bytes()[..7].to_vec(),
			Self::U56(v) => v.to_le_bytes()[..7].to_vec(),
			Self::I64(v) => v.to_le_bytes().to_vec(),
			Self::U64(v) => v.to_le_bytes().to_vec(),
			Self::Real32(v) => v.to_le_bytes().to_vec(),
			Self::Real64(v) => v.to_le_bytes().to_vec(),
			Self::TimeOfDay(t) | Self::TimeDifference(t) => encode_time_of_day(*t),
			Self::VisibleString(s) => s.as_bytes().to_vec(),
			Self::OctetString(b) => b.clone(),
			Self::UnicodeString(u) => u.iter().flat_map(|code| code.to_le_bytes()).collect(),
			Self::Domain(b) => b.clone(),
		}
	}

	/// Decode `bytes` as `data_type`.
	///
	/// For `VisibleString`, a buffer shorter than the declared field width is
	/// zero-padded; a buffer equal to or longer than the field width is used
	/// as-is (trailing bytes beyond the width are ignored).
	pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Self, CodecError> {
		if let Some(size) = data_type.fixed_size() {
			if bytes.len() < size {
				return Err(CodecError::BufferTooShort { type_name: type_name(data_type), needed: size, got: bytes.len() });
			}
		}
		Ok(match data_type {
			DataType::Boolean => match bytes[0] {
				0 => Self::Boolean(false),
				1 => Self::Boolean(true),
				other => return Err(CodecError::InvalidBoolean(other)),
			},
			DataType::I8 => Self::I8(bytes[0] as i8),
			DataType::U8 => Self::U8(bytes[0]),
			DataType::I16 => Self::I16(i16::from_le_bytes(bytes[..2].try_into().unwrap())),
			DataType::U16 => Self::U16(u16::from_le_bytes(bytes[..2].try_into().unwrap())),
			DataType::I24 => Self::I24(sign_extend(read_uint(bytes, 3), 24) as i32),
			DataType::U24 => Self::U24(read_uint(bytes, 3) as u32),
			DataType::I32 => Self::I32(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
			DataType::U32 => Self::U32(u32::from_le_bytes(bytes[..4].try_into().unwrap())),
			DataType::I40 => Self::I40(sign_extend(read_uint(bytes, 5), 40)),
			DataType::U40 => Self::U40(read_uint(bytes, 5)),
			DataType::I48 => Self::I48(sign_extend(read_uint(bytes, 6), 48)),
			DataType::U48 => Self::U48(read_uint(bytes, 6)),
			DataType::I56 => Self::I56(sign_extend(read_uint(bytes, 7), 56)),
			DataType::U56 => Self::U56(read_uint(bytes, 7)),
			DataType::I64 => Self::I64(i64::from_le_bytes(bytes[..8].try_into().unwrap())),
			DataType::U64 => Self::U64(u64::from_le_bytes(bytes[..8].try_into().unwrap())),
			DataType::Real32 => Self::Real32(f32::from_le_bytes(bytes[..4].try_into().unwrap())),
			DataType::Real64 => Self::Real64(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
			DataType::TimeOfDay => Self::TimeOfDay(decode_time_of_day(bytes)),
			DataType::TimeDifference => Self::TimeDifference(decode_time_of_day(bytes)),
			DataType::VisibleString(width) => {
				let width = width as usize;
				let mut padded = bytes.to_vec();
				if padded.len() < width {
					padded.resize(width, 0);
				} else if padded.len() > width && width > 0 {
					padded.truncate(width);
				}
				let end = padded.iter().position(|&b| b == 0).unwrap_or(padded.len());
				Self::VisibleString(String::from_utf8_lossy(&padded[..end]).into_owned())
			}
			DataType::OctetString(width) => {
				let width = width as usize;
				let mut data = bytes.to_vec();
				if width > 0 {
					data.truncate(width.max(data.len().min(width)));
				}
				Self::OctetString(data)
			}
			DataType::UnicodeString(width) => {
				let units = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect::<Vec<_>>();
				let width = width as usize;
				let mut units = units;
				if width > 0 && units.len() > width {
					units.truncate(width);
				}
				Self::UnicodeString(units)
			}
			DataType::Domain => Self::Domain(bytes.to_vec()),
		})
	}
}

fn read_uint(bytes: &[u8], len: usize) -> u64 {
	let mut value = 0u64;
	for (i, &byte) in bytes[..len].iter().enumerate() {
		value |= (byte as u64) << (8 * i);
	}
	value
}

fn sign_extend(value: u64, bits: u32) -> i64 {
	let shift = 64 - bits;
	((value << shift) as i64) >> shift
}

fn encode_time_of_day(t: TimeOfDay) -> Vec<u8> {
	let ms = t.ms & 0x0FFF_FFFF;
	let mut out = ms.to_le_bytes().to_vec();
	out.extend_from_slice(&t.days.to_le_bytes());
	out
}

fn decode_time_of_day(bytes: &[u8]) -> TimeOfDay {
	let ms = u32::from_le_bytes(bytes[..4].try_into().unwrap()) & 0x0FFF_FFFF;
	let days = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
	TimeOfDay { ms, days }
}

fn type_name(data_type: DataType) -> &'static str {
	match data_type {
		DataType::Boolean => "BOOLEAN",
		DataType::I8 => "INTEGER8",
		DataType::U8 => "UNSIGNED8",
		DataType::I16 => "INTEGER16",
		DataType::U16 => "UNSIGNED16",
		DataType::I24 => "INTEGER24",
		DataType::U24 => "UNSIGNED24",
		DataType::I32 => "INTEGER32",
		DataType::U32 => "UNSIGNED32",
		DataType::I40 => "INTEGER40",
		DataType::U40 => "UNSIGNED40",
		DataType::I48 => "INTEGER48",
		DataType::U48 => "UNSIGNED48",
		DataType::I56 => "INTEGER56",
		DataType::U56 => "UNSIGNED56",
		DataType::I64 => "INTEGER64",
		DataType::U64 => "UNSIGNED64",
		DataType::Real32 => "REAL32",
		DataType::Real64 => "REAL64",
		DataType::TimeOfDay => "TIME_OF_DAY",
		DataType::TimeDifference => "TIME_DIFFERENCE",
		DataType::VisibleString(_) => "VISIBLE_STRING",
		DataType::OctetString(_) => "OCTET_STRING",
		DataType::UnicodeString(_) => "UNICODE_STRING",
		DataType::Domain => "DOMAIN",
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn u16_round_trips() {
		let value = Value::U16(1000);
		let bytes = value.encode();
		assert_eq!(bytes, [0xE8, 0x03]);
		assert_eq!(Value::decode(DataType::U16, &bytes).unwrap(), value);
	}

	#[test]
	fn i24_sign_extends_negative_value() {
		let bytes = [0xFF, 0xFF, 0xFF];
		let value = Value::decode(DataType::I24, &bytes).unwrap();
		assert_eq!(value, Value::I24(-1));
	}

	#[test]
	fn i40_sign_extends_negative_value() {
		let bytes = [0x00, 0x00, 0x00, 0x00, 0xFF];
		let value = Value::decode(DataType::I40, &bytes).unwrap();
		assert_eq!(value, Value::I40(-0x01_0000_0000));
	}

	#[test]
	fn visible_string_shorter_than_width_is_zero_padded() {
		let value = Value::decode(DataType::VisibleString(8), b"hi").unwrap();
		match &value {
			Value::VisibleString(s) => assert_eq!(s, "hi"),
			_ => panic!("wrong variant"),
		}
		// Encoding does not restore the padding; padding is a read-side convention
		// that terminates at the first zero byte.
		assert_eq!(value.encode(), b"hi");
	}

	#[test]
	fn empty_domain_is_valid() {
		let value = Value::decode(DataType::Domain, &[]).unwrap();
		assert_eq!(value, Value::Domain(Vec::new()));
	}

	#[test]
	fn buffer_too_short_is_rejected() {
		let err = Value::decode(DataType::U32, &[1, 2]).unwrap_err();
		assert!(matches!(err, CodecError::BufferTooShort { .. }));
	}

	#[test]
	fn time_of_day_round_trips() {
		let value = Value::TimeOfDay(TimeOfDay { ms: 12_345, days: 100 });
		let bytes = value.encode();
		assert_eq!(bytes.len(), 6);
		assert_eq!(Value::decode(DataType::TimeOfDay, &bytes).unwrap(), value);
	}
}
