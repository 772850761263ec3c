//! An indexed object: a VAR, ARRAY, or RECORD of sub-objects.

use std::collections::BTreeMap;

use crate::dictionary::sub::SubObject;

/// The structural kind of an [`Object`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ObjectCode {
	/// A single value at sub-index 0.
	Var,
	/// A homogeneous array; sub-index 0 holds the highest valid sub-index.
	Array,
	/// A heterogeneous record; sub-index 0 holds the highest valid sub-index.
	Record,
}

/// One entry in the object dictionary, addressed by a 16-bit index.
///
/// Sub-objects are stored in a `BTreeMap` rather than a hash map so that
/// enumeration (used by the SDO sub-index-0 convention and by dictionary
/// dumps) yields them in ascending sub-index order for free.
pub struct Object {
	pub(crate) index: u16,
	pub(crate) code: ObjectCode,
	pub(crate) name: Option<String>,
	pub(crate) subs: BTreeMap<u8, SubObject>,
}

impl Object {
	/// Create an empty object with no sub-objects yet.
	pub fn new(index: u16, code: ObjectCode) -> Self {
		Self { index, code, name: None, subs: BTreeMap::new() }
	}

	/// Attach a human-readable name, as would come from an EDS/DCF (parsed outside this crate).
	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	/// Insert or replace the sub-object at `sub_index`.
	pub fn insert(mut self, sub_index: u8, sub: SubObject) -> Self {
		self.subs.insert(sub_index, sub);
		self
	}

	/// The object's 16-bit index.
	pub fn index(&self) -> u16 {
		self.index
	}

	/// The object's structural kind.
	pub fn code(&self) -> ObjectCode {
		self.code
	}

	/// The object's name, if one was attached.
	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Look up a sub-object by sub-index.
	pub fn get(&self, sub_index: u8) -> Option<&SubObject> {
		self.subs.get(&sub_index)
	}

	/// Look up a sub-object by sub-index, mutably.
	pub fn get_mut(&mut self, sub_index: u8) -> Option<&mut SubObject> {
		self.subs.get_mut(&sub_index)
	}

	/// Iterate over sub-objects in ascending sub-index order.
	pub fn iter(&self) -> impl Iterator<Item = (u8, &SubObject)> {
		self.subs.iter().map(|(&index, sub)| (index, sub))
	}

	/// The highest populated sub-index, as would be reported at sub-index 0
	/// of an ARRAY or RECORD.
	pub fn highest_sub_index(&self) -> u8 {
		self.subs.keys().copied().max().unwrap_or(0)
	}
}
