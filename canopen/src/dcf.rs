//! Concise DCF (object 0x1F22): a binary sequence of dictionary writes applied at boot.
//!
//! Layout: a little-endian `u32` entry count, followed by that many entries of
//! `{index: u16, subidx: u8, size: u32, data: size bytes}`. Used both to configure
//! a freshly-booted slave (written by the master to a slave's 0x1F22) and to
//! restore a saved configuration into a local dictionary.

use thiserror::Error;

use crate::dictionary::{DictError, ObjectDictionary};
use crate::nmt::NmtState;

/// Failure decoding or applying a concise DCF buffer.
#[derive(Debug, Error)]
pub enum DcfError {
	/// The buffer ended before a declared field or entry payload was fully read.
	#[error("concise DCF buffer truncated: needed {needed} more bytes, had {available}")]
	Truncated { needed: usize, available: usize },
	/// An entry's write was rejected by the target dictionary.
	#[error("write to {index:#06x}:{subidx:#04x} rejected: {source}")]
	Rejected {
		index: u16,
		subidx: u8,
		#[source]
		source: DictError,
	},
}

/// One decoded concise DCF entry, borrowing its payload from the source buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DcfEntry<'a> {
	pub index: u16,
	pub subidx: u8,
	pub data: &'a [u8],
}

/// Decode every entry in a concise DCF buffer.
///
/// Entries are returned in encounter order (the order the original writer put
/// them in, typically dictionary index order but not guaranteed).
pub fn decode(buffer: &[u8]) -> Result<Vec<DcfEntry<'_>>, DcfError> {
	let mut cursor = 0usize;
	let count = read_u32(buffer, &mut cursor)?;
	let mut entries = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let index = read_u16(buffer, &mut cursor)?;
		let subidx = read_u8(buffer, &mut cursor)?;
		let size = read_u32(buffer, &mut cursor)? as usize;
		let data = take(buffer, &mut cursor, size)?;
		entries.push(DcfEntry { index, subidx, data });
	}
	Ok(entries)
}

/// Decode `buffer` and apply every entry against `dictionary` via [`ObjectDictionary::write_raw`].
///
/// Stops at the first rejected entry, reporting which `(index, subidx)` failed;
/// entries applied before the failure remain applied, matching how a real boot
/// sequence would already have committed them to the wire one SDO download at a time.
pub fn apply(dictionary: &mut ObjectDictionary, buffer: &[u8], state: NmtState) -> Result<usize, DcfError> {
	let entries = decode(buffer)?;
	for entry in entries.iter() {
		if let Err(source) = dictionary.write_raw(entry.index, entry.subidx, entry.data, state) {
			return Err(DcfError::Rejected { index: entry.index, subidx: entry.subidx, source });
		}
	}
	Ok(entries.len())
}

fn read_u32(buffer: &[u8], cursor: &mut usize) -> Result<u32, DcfError> {
	let bytes = take(buffer, cursor, 4)?;
	Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u16(buffer: &[u8], cursor: &mut usize) -> Result<u16, DcfError> {
	let bytes = take(buffer, cursor, 2)?;
	Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u8(buffer: &[u8], cursor: &mut usize) -> Result<u8, DcfError> {
	let bytes = take(buffer, cursor, 1)?;
	Ok(bytes[0])
}

fn take<'a>(buffer: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], DcfError> {
	let available = buffer.len().saturating_sub(*cursor);
	if available < len {
		return Err(DcfError::Truncated { needed: len, available });
	}
	let slice = &buffer[*cursor..*cursor + len];
	*cursor += len;
	Ok(slice)
}

/// Encode a sequence of entries into a concise DCF buffer, the inverse of [`decode`].
pub fn encode<'a>(entries: impl IntoIterator<Item = DcfEntry<'a>>) -> Vec<u8> {
	let entries: Vec<_> = entries.into_iter().collect();
	let mut buffer = Vec::new();
	buffer.extend_from_slice(&(entries.len() as u32).to_le_bytes());
	for entry in entries {
		buffer.extend_from_slice(&entry.index.to_le_bytes());
		buffer.push(entry.subidx);
		buffer.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
		buffer.extend_from_slice(entry.data);
	}
	buffer
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::codec::Value;
	use crate::dictionary::{AccessType, Object, ObjectCode, SubObject};

	#[test]
	fn round_trips_through_encode_decode() {
		let entries = vec![
			DcfEntry { index: 0x1017, subidx: 0, data: &[0xE8, 0x03] },
			DcfEntry { index: 0x6200, subidx: 1, data: &[0x01] },
		];
		let buffer = encode(entries.clone());
		assert_eq!(decode(&buffer).unwrap(), entries);
	}

	#[test]
	fn decode_reports_truncated_buffer() {
		let buffer = encode(vec![DcfEntry { index: 0x1017, subidx: 0, data: &[0xE8, 0x03] }]);
		let err = decode(&buffer[..buffer.len() - 1]).unwrap_err();
		assert!(matches!(err, DcfError::Truncated { .. }));
	}

	#[test]
	fn apply_writes_every_entry_into_the_dictionary() {
		let mut dict = ObjectDictionary::new(5);
		let sub = SubObject::new(AccessType::Rw, Value::U16(0));
		dict.insert(Object::new(0x1017, ObjectCode::Var).insert(0, sub));
		let buffer = encode(vec![DcfEntry { index: 0x1017, subidx: 0, data: &1000u16.to_le_bytes() }]);
		let applied = apply(&mut dict, &buffer, NmtState::PreOperational).unwrap();
		assert_eq!(applied, 1);
		assert_eq!(dict.read(0x1017, 0, NmtState::PreOperational).unwrap(), Value::U16(1000));
	}

	#[test]
	fn apply_reports_rejected_entry_with_its_address() {
		let mut dict = ObjectDictionary::new(5);
		let sub = SubObject::new(AccessType::Ro, Value::U16(0));
		dict.insert(Object::new(0x1017, ObjectCode::Var).insert(0, sub));
		let buffer = encode(vec![DcfEntry { index: 0x1017, subidx: 0, data: &1000u16.to_le_bytes() }]);
		let err = apply(&mut dict, &buffer, NmtState::PreOperational).unwrap_err();
		match err {
			DcfError::Rejected { index, subidx, .. } => {
				assert_eq!(index, 0x1017);
				assert_eq!(subidx, 0);
			}
			_ => panic!("expected Rejected"),
		}
	}
}
