//! PDO mapping records: packing and unpacking mapped sub-objects into an 8-byte payload.

use crate::codec::Value;
use crate::dictionary::{DictError, ObjectDictionary};
use crate::nmt::NmtState;
use crate::pdo::error::PdoMappingError;

/// One entry in a PDO mapping record: `(index, sub-index, bit length)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PdoMapping {
	/// The mapped object's index.
	pub index: u16,
	/// The mapped object's sub-index.
	pub subindex: u8,
	/// The number of bits this entry occupies in the PDO payload.
	pub bit_length: u8,
}

impl PdoMapping {
	/// Parse a mapping entry from a `u32` value as stored in a mapping object
	/// (e.g. 0x1600..0x1603 or 0x1A00..0x1A03 sub-indices 1..8).
	pub fn from_u32(raw: u32) -> Self {
		Self { index: (raw >> 16) as u16, subindex: (raw >> 8) as u8, bit_length: raw as u8 }
	}

	/// Get the `u32` value of this mapping entry as stored in a mapping object.
	pub fn to_u32(self) -> u32 {
		(self.index as u32) << 16 | (self.subindex as u32) << 8 | self.bit_length as u32
	}
}

/// Sum of every entry's bit length.
pub fn total_bits(mapping: &[PdoMapping]) -> u32 {
	mapping.iter().map(|entry| entry.bit_length as u32).sum()
}

/// Check that a mapping record fits within a single PDO payload.
pub fn validate(mapping: &[PdoMapping]) -> Result<(), PdoMappingError> {
	let total = total_bits(mapping);
	if total > 64 {
		return Err(PdoMappingError::TooManyBits { total });
	}
	Ok(())
}

fn mask128(bit_length: u32) -> u128 {
	if bit_length >= 128 {
		u128::MAX
	} else {
		(1u128 << bit_length) - 1
	}
}

fn value_as_bits(value: &Value) -> u64 {
	let encoded = value.encode();
	let mut raw = 0u64;
	for (i, byte) in encoded.iter().enumerate().take(8) {
		raw |= (*byte as u64) << (8 * i);
	}
	raw
}

/// Read every mapped sub-object from `dict` and pack them into a little-endian,
/// LSB-first PDO payload, as a TPDO sends on the wire.
pub fn assemble(dict: &mut ObjectDictionary, mapping: &[PdoMapping], state: NmtState) -> Result<Vec<u8>, DictError> {
	let mut acc: u128 = 0;
	let mut offset = 0u32;
	for entry in mapping {
		let value = dict.read(entry.index, entry.subindex, state)?;
		let bits = value_as_bits(&value) as u128 & mask128(entry.bit_length as u32);
		acc |= bits << offset;
		offset += entry.bit_length as u32;
	}
	let total_bytes = ((offset + 7) / 8) as usize;
	Ok(acc.to_le_bytes()[..total_bytes.min(16)].to_vec())
}

/// Unpack `data` according to `mapping` and apply every entry to `dict`, honoring `state`.
///
/// Every entry is decoded and range-checked against the dictionary before any of them
/// are written, so a rejection anywhere in the mapping leaves the dictionary entirely
/// untouched (the all-or-nothing application an RPDO is expected to provide). A download
/// indication consulted during the commit pass can still veto an individual entry after
/// this validation pass has already accepted it; that rejection is reported but earlier
/// entries in the same frame remain applied, same as the teacher's per-object write path.
pub fn apply(dict: &mut ObjectDictionary, mapping: &[PdoMapping], data: &[u8], state: NmtState) -> Result<(), DictError> {
	let mut buf = [0u8; 16];
	let n = data.len().min(16);
	buf[..n].copy_from_slice(&data[..n]);
	let acc = u128::from_le_bytes(buf);

	let mut writes = Vec::with_capacity(mapping.len());
	let mut offset = 0u32;
	for entry in mapping {
		let data_type = dict
			.object(entry.index)
			.and_then(|object| object.get(entry.subindex))
			.map(|sub| sub.data_type())
			.ok_or(DictError::NoSubObject { index: entry.index, sub_index: entry.subindex })?;
		let width = data_type.fixed_size().unwrap_or(8).min(8);
		let raw = ((acc >> offset) & mask128(entry.bit_length as u32)) as u64;
		let bytes = raw.to_le_bytes()[..width].to_vec();
		dict.validate_write(entry.index, entry.subindex, &bytes, state)?;
		writes.push((entry.index, entry.subindex, bytes));
		offset += entry.bit_length as u32;
	}
	for (index, subindex, bytes) in writes {
		dict.write_raw(index, subindex, &bytes, state)?;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dictionary::{AccessType, Object, ObjectCode, SubObject};

	fn dict_with(entries: &[(u16, u8, Value)]) -> ObjectDictionary {
		let mut dict = ObjectDictionary::new(1);
		let mut objects: std::collections::BTreeMap<u16, Object> = std::collections::BTreeMap::new();
		for &(index, subindex, ref value) in entries {
			let sub = SubObject::new(AccessType::Rw, value.clone()).pdo_mappable(true);
			let object = objects.remove(&index).unwrap_or_else(|| Object::new(index, ObjectCode::Var));
			objects.insert(index, object.insert(subindex, sub));
		}
		for object in objects.into_values() {
			dict.insert(object);
		}
		dict
	}

	#[test]
	fn mapping_round_trips_through_u32() {
		let entry = PdoMapping { index: 0x6000, subindex: 1, bit_length: 16 };
		assert_eq!(PdoMapping::from_u32(entry.to_u32()), entry);
	}

	#[test]
	fn validate_rejects_over_64_bits() {
		let mapping = vec![PdoMapping { index: 0x6000, subindex: 1, bit_length: 40 }, PdoMapping { index: 0x6000, subindex: 2, bit_length: 40 }];
		assert_eq!(validate(&mapping), Err(PdoMappingError::TooManyBits { total: 80 }));
	}

	#[test]
	fn assemble_packs_two_u16_entries_little_endian() {
		let mut dict = dict_with(&[(0x6000, 1, Value::U16(0x1234)), (0x6000, 2, Value::U16(0xABCD))]);
		let mapping = vec![PdoMapping { index: 0x6000, subindex: 1, bit_length: 16 }, PdoMapping { index: 0x6000, subindex: 2, bit_length: 16 }];
		let bytes = assemble(&mut dict, &mapping, NmtState::Operational).unwrap();
		assert_eq!(bytes, vec![0x34, 0x12, 0xCD, 0xAB]);
	}

	#[test]
	fn apply_writes_every_mapped_entry() {
		let mut dict = dict_with(&[(0x6000, 1, Value::U16(0)), (0x6000, 2, Value::U8(0))]);
		let mapping = vec![PdoMapping { index: 0x6000, subindex: 1, bit_length: 16 }, PdoMapping { index: 0x6000, subindex: 2, bit_length: 8 }];
		apply(&mut dict, &mapping, &[0x34, 0x12, 0x42], NmtState::Operational).unwrap();
		assert_eq!(dict.read(0x6000, 1, NmtState::Operational).unwrap(), Value::U16(0x1234));
		assert_eq!(dict.read(0x6000, 2, NmtState::Operational).unwrap(), Value::U8(0x42));
	}

	#[test]
	fn apply_rejects_without_mutating_when_one_entry_is_out_of_range() {
		let mut dict = ObjectDictionary::new(1);
		let low = SubObject::new(AccessType::Rw, Value::U16(0)).pdo_mappable(true);
		let high = SubObject::new(AccessType::Rw, Value::U8(0)).pdo_mappable(true).with_range(Value::U8(0), Value::U8(10));
		let object = Object::new(0x6000, ObjectCode::Var).insert(1, low).insert(2, high);
		dict.insert(object);
		let mapping = vec![PdoMapping { index: 0x6000, subindex: 1, bit_length: 16 }, PdoMapping { index: 0x6000, subindex: 2, bit_length: 8 }];
		let err = apply(&mut dict, &mapping, &[0x34, 0x12, 0xFF], NmtState::Operational).unwrap_err();
		assert_eq!(err.abort_code(), crate::abort::AbortCode::ValueTooHigh);
		assert_eq!(dict.read(0x6000, 1, NmtState::Operational).unwrap(), Value::U16(0));
	}
}
