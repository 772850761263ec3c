//! The object dictionary: a typed, indexed store with access control.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::abort::AbortCode;
use crate::codec::Value;
use crate::dictionary::error::DictError;
use crate::dictionary::object::Object;
use crate::dictionary::sub::SubObject;
use crate::nmt::NmtState;

/// A device's object dictionary.
///
/// Mutated only from dispatcher-invoked callbacks; the core installs no
/// locking of its own, per the single-threaded cooperative scheduling model.
pub struct ObjectDictionary {
	node_id: u8,
	objects: BTreeMap<u16, Object>,
}

impl ObjectDictionary {
	/// Create an empty dictionary for the given node-ID.
	pub fn new(node_id: u8) -> Self {
		Self { node_id, objects: BTreeMap::new() }
	}

	/// The node-ID this dictionary belongs to.
	pub fn node_id(&self) -> u8 {
		self.node_id
	}

	/// Insert or replace an object.
	pub fn insert(&mut self, object: Object) {
		self.objects.insert(object.index(), object);
	}

	/// Look up an object by index.
	pub fn object(&self, index: u16) -> Option<&Object> {
		self.objects.get(&index)
	}

	/// Look up an object by index, mutably.
	pub fn object_mut(&mut self, index: u16) -> Option<&mut Object> {
		self.objects.get_mut(&index)
	}

	/// Iterate over every object in ascending index order.
	pub fn iter(&self) -> impl Iterator<Item = &Object> {
		self.objects.values()
	}

	fn sub(&self, index: u16, sub_index: u8) -> Result<&SubObject, DictError> {
		let object = self.objects.get(&index).ok_or(DictError::NoObject { index })?;
		object.get(sub_index).ok_or(DictError::NoSubObject { index, sub_index })
	}

	fn sub_mut(&mut self, index: u16, sub_index: u8) -> Result<&mut SubObject, DictError> {
		let object = self.objects.get_mut(&index).ok_or(DictError::NoObject { index })?;
		object.get_mut(sub_index).ok_or(DictError::NoSubObject { index, sub_index })
	}

	/// Read a sub-object's value, honoring access control and any upload indication.
	pub fn read(&mut self, index: u16, sub_index: u8, state: NmtState) -> Result<Value, DictError> {
		let sub = self.sub_mut(index, sub_index)?;
		if !sub.access.is_readable(state) {
			return Err(DictError::AccessDenied(AbortCode::AttemptToReadWriteOnly));
		}
		let current = sub.value.clone();
		match sub.upload.as_mut() {
			Some(upload) => upload.on_upload(&current).map_err(DictError::UploadRejected),
			None => Ok(current),
		}
	}

	/// Decode and write `bytes` into a sub-object, applying the full value-set
	/// algorithm: type decode, range check, download indication, atomic swap.
	///
	/// A rejection at any step leaves the stored value untouched.
	pub fn write_raw(&mut self, index: u16, sub_index: u8, bytes: &[u8], state: NmtState) -> Result<(), DictError> {
		let sub = self.sub_mut(index, sub_index)?;
		if !sub.access.is_writable(state) {
			return Err(DictError::AccessDenied(AbortCode::AttemptToWriteReadOnly));
		}
		let candidate = Value::decode(sub.data_type, bytes)?;
		if let Some(min) = &sub.min {
			if compare(&candidate, min) == Some(Ordering::Less) {
				return Err(DictError::OutOfRange(AbortCode::ValueTooLow));
			}
		}
		if let Some(max) = &sub.max {
			if compare(&candidate, max) == Some(Ordering::Greater) {
				return Err(DictError::OutOfRange(AbortCode::ValueTooHigh));
			}
		}
		if let Some(download) = sub.download.as_mut() {
			download.on_download(&candidate).map_err(DictError::DownloadRejected)?;
		}
		sub.value = candidate;
		if sub.pdo_mappable {
			sub.value_changed = true;
		}
		Ok(())
	}

	/// Write an already-decoded value, skipping the wire decode step.
	pub fn write(&mut self, index: u16, sub_index: u8, value: Value, state: NmtState) -> Result<(), DictError> {
		self.write_raw(index, sub_index, &value.encode(), state)
	}

	/// Decode and range-check `bytes` against the sub-object at `(index, sub_index)`,
	/// without invoking indications or mutating the stored value.
	///
	/// Used by RPDO application to validate every mapped entry before committing any
	/// of them, so a rejection partway through a mapping record doesn't leave earlier
	/// entries applied and later ones silently dropped.
	pub(crate) fn validate_write(&self, index: u16, sub_index: u8, bytes: &[u8], state: NmtState) -> Result<(), DictError> {
		let sub = self.sub(index, sub_index)?;
		if !sub.access.is_writable(state) {
			return Err(DictError::AccessDenied(AbortCode::AttemptToWriteReadOnly));
		}
		let candidate = Value::decode(sub.data_type, bytes)?;
		if let Some(min) = &sub.min {
			if compare(&candidate, min) == Some(Ordering::Less) {
				return Err(DictError::OutOfRange(AbortCode::ValueTooLow));
			}
		}
		if let Some(max) = &sub.max {
			if compare(&candidate, max) == Some(Ordering::Greater) {
				return Err(DictError::OutOfRange(AbortCode::ValueTooHigh));
			}
		}
		Ok(())
	}
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
	use Value::*;
	match (a, b) {
		(Boolean(a), Boolean(b)) => Some(a.cmp(b)),
		(I8(a), I8(b)) => Some(a.cmp(b)),
		(U8(a), U8(b)) => Some(a.cmp(b)),
		(I16(a), I16(b)) => Some(a.cmp(b)),
		(U16(a), U16(b)) => Some(a.cmp(b)),
		(I24(a), I24(b)) => Some(a.cmp(b)),
		(U24(a), U24(b)) => Some(a.cmp(b)),
		(I32(a), I32(b)) => Some(a.cmp(b)),
		(U32(a), U32(b)) => Some(a.cmp(b)),
		(I40(a), I40(b)) => Some(a.cmp(b)),
		(U40(a), U40(b)) => Some(a.cmp(b)),
		(I48(a), I48(b)) => Some(a.cmp(b)),
		(U48(a), U48(b)) => Some(a.cmp(b)),
		(I56(a), I56(b)) => Some(a.cmp(b)),
		(U56(a), U56(b)) => Some(a.cmp(b)),
		(I64(a), I64(b)) => Some(a.cmp(b)),
		(U64(a), U64(b)) => Some(a.cmp(b)),
		(Real32(a), Real32(b)) => a.partial_cmp(b),
		(Real64(a), Real64(b)) => a.partial_cmp(b),
		_ => None,
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::codec::DataType;
	use crate::dictionary::access::AccessType;
	use crate::dictionary::object::{Object, ObjectCode};

	fn dict_with_u16(access: AccessType, min: Option<u16>, max: Option<u16>) -> ObjectDictionary {
		let mut sub = SubObject::new(access, Value::U16(0));
		if let (Some(min), Some(max)) = (min, max) {
			sub = sub.with_range(Value::U16(min), Value::U16(max));
		}
		let object = Object::new(0x1017, ObjectCode::Var).insert(0, sub);
		let mut dict = ObjectDictionary::new(1);
		dict.insert(object);
		dict
	}

	#[test]
	fn write_then_read_yields_written_value() {
		let mut dict = dict_with_u16(AccessType::Rw, None, None);
		dict.write(0x1017, 0, Value::U16(1000), NmtState::PreOperational).unwrap();
		assert_eq!(dict.read(0x1017, 0, NmtState::PreOperational).unwrap(), Value::U16(1000));
	}

	#[test]
	fn out_of_range_write_is_rejected_without_mutation() {
		let mut dict = dict_with_u16(AccessType::Rw, Some(10), Some(20));
		let err = dict.write(0x1017, 0, Value::U16(1000), NmtState::PreOperational).unwrap_err();
		assert_eq!(err.abort_code(), AbortCode::ValueTooHigh);
		assert_eq!(dict.read(0x1017, 0, NmtState::PreOperational).unwrap(), Value::U16(0));
	}

	#[test]
	fn write_to_read_only_is_rejected() {
		let mut dict = dict_with_u16(AccessType::Ro, None, None);
		let err = dict.write(0x1017, 0, Value::U16(5), NmtState::PreOperational).unwrap_err();
		assert_eq!(err.abort_code(), AbortCode::AttemptToWriteReadOnly);
	}

	#[test]
	fn read_from_write_only_is_rejected() {
		let mut dict = dict_with_u16(AccessType::Wo, None, None);
		let err = dict.read(0x1017, 0, NmtState::PreOperational).unwrap_err();
		assert_eq!(err.abort_code(), AbortCode::AttemptToReadWriteOnly);
	}

	#[test]
	fn missing_object_reports_does_not_exist() {
		let mut dict = ObjectDictionary::new(1);
		let err = dict.read(0x2000, 0, NmtState::PreOperational).unwrap_err();
		assert_eq!(err.abort_code(), AbortCode::ObjectDoesNotExist);
	}

	#[test]
	fn missing_sub_index_reports_does_not_exist() {
		let mut dict = dict_with_u16(AccessType::Rw, None, None);
		let err = dict.read(0x1017, 1, NmtState::PreOperational).unwrap_err();
		assert_eq!(err.abort_code(), AbortCode::SubIndexDoesNotExist);
	}

	#[test]
	fn download_indication_can_veto_write() {
		let sub = SubObject::new(AccessType::Rw, Value::U16(0))
			.with_download_indication(|_value: &Value| Err(AbortCode::GeneralError));
		let object = Object::new(0x2000, ObjectCode::Var).insert(0, sub);
		let mut dict = ObjectDictionary::new(1);
		dict.insert(object);
		let err = dict.write(0x2000, 0, Value::U16(1), NmtState::PreOperational).unwrap_err();
		assert_eq!(err.abort_code(), AbortCode::GeneralError);
		assert_eq!(dict.read(0x2000, 0, NmtState::PreOperational).unwrap(), Value::U16(0));
	}

	#[test]
	fn pdo_mappable_sub_object_reports_value_changed() {
		let sub = SubObject::new(AccessType::Rw, Value::U16(0)).pdo_mappable(true);
		let object = Object::new(0x2001, ObjectCode::Var).insert(0, sub);
		let mut dict = ObjectDictionary::new(1);
		dict.insert(object);
		dict.write(0x2001, 0, Value::U16(7), NmtState::PreOperational).unwrap();
		assert!(dict.object_mut(0x2001).unwrap().get_mut(0).unwrap().take_value_changed());
	}
}
