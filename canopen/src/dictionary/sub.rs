//! A single sub-index entry within an [`super::object::Object`].

use crate::codec::{DataType, Value};
use crate::dictionary::access::AccessType;
use crate::dictionary::indication::{DownloadIndication, UploadIndication};

/// One addressable `(index, sub-index)` slot.
pub struct SubObject {
	pub(crate) data_type: DataType,
	pub(crate) access: AccessType,
	pub(crate) pdo_mappable: bool,
	pub(crate) min: Option<Value>,
	pub(crate) max: Option<Value>,
	pub(crate) value: Value,
	pub(crate) value_changed: bool,
	pub(crate) download: Option<Box<dyn DownloadIndication>>,
	pub(crate) upload: Option<Box<dyn UploadIndication>>,
}

impl SubObject {
	/// Create a sub-object holding `default`, with no range limits and no indications installed.
	pub fn new(access: AccessType, default: Value) -> Self {
		Self {
			data_type: default.data_type(),
			access,
			pdo_mappable: false,
			min: None,
			max: None,
			value: default,
			value_changed: false,
			download: None,
			upload: None,
		}
	}

	/// Mark this sub-object as mappable into a PDO.
	pub fn pdo_mappable(mut self, mappable: bool) -> Self {
		self.pdo_mappable = mappable;
		self
	}

	/// Restrict writes to the closed interval `[min, max]`.
	pub fn with_range(mut self, min: Value, max: Value) -> Self {
		self.min = Some(min);
		self.max = Some(max);
		self
	}

	/// Install a download indication, invoked before each write is applied.
	pub fn with_download_indication(mut self, indication: impl DownloadIndication + 'static) -> Self {
		self.download = Some(Box::new(indication));
		self
	}

	/// Install an upload indication, invoked before each read is returned.
	pub fn with_upload_indication(mut self, indication: impl UploadIndication + 'static) -> Self {
		self.upload = Some(Box::new(indication));
		self
	}

	/// The declared data type of this sub-object.
	pub fn data_type(&self) -> DataType {
		self.data_type
	}

	/// The access mode of this sub-object.
	pub fn access(&self) -> AccessType {
		self.access
	}

	/// Whether this sub-object may be mapped into a PDO.
	pub fn is_pdo_mappable(&self) -> bool {
		self.pdo_mappable
	}

	/// The currently stored value, without invoking the upload indication.
	pub fn value(&self) -> &Value {
		&self.value
	}

	/// Whether the value has changed since the last call to [`Self::take_value_changed`].
	pub fn value_changed(&self) -> bool {
		self.value_changed
	}

	/// Consume the value-changed flag, as a TPDO event trigger does for each scan.
	pub fn take_value_changed(&mut self) -> bool {
		std::mem::replace(&mut self.value_changed, false)
	}
}
