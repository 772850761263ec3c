//! The NMT master's per-slave boot-up sequencer (CiA 302).
//!
//! This models the decision logic of the boot procedure — the comparisons
//! and the resulting status code — independently of how the values being
//! compared were obtained. The service composer drives it by feeding back
//! each SDO upload result as it arrives.

/// A single-character boot outcome, as CiA 302 reports it to the application.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BootStatus {
	/// Slave device type (0x1000) did not match the expected value (0x1F84).
	DeviceTypeMismatch,
	/// Slave vendor-ID (0x1018:1) did not match the expected value (0x1F85).
	VendorIdMismatch,
	/// Slave product code (0x1018:2) did not match the expected value (0x1F86).
	ProductCodeMismatch,
	/// Slave revision number (0x1018:3) did not match the expected value (0x1F87).
	RevisionNumberMismatch,
	/// Slave serial number (0x1018:4) did not match the expected value (0x1F88).
	SerialNumberMismatch,
	/// The slave finished booting and error control has started.
	Booted,
}

impl BootStatus {
	/// The single-character status code CiA 302 assigns to this outcome.
	pub fn code(self) -> char {
		match self {
			Self::DeviceTypeMismatch => 'B',
			Self::VendorIdMismatch => 'C',
			Self::ProductCodeMismatch => 'D',
			Self::RevisionNumberMismatch => 'E',
			Self::SerialNumberMismatch => 'F',
			Self::Booted => 'A',
		}
	}
}

/// The expected identity of a slave, read from object 0x1F84..0x1F88 of the master's dictionary.
///
/// `device_type` is always checked against the actual value. For `vendor_id`,
/// `product_code`, `revision_number`, and `serial_number`, a field of `0` means
/// "don't care", matching CiA 302's convention that an all-zero expected value
/// disables that particular check.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExpectedIdentity {
	pub device_type: u32,
	pub vendor_id: u32,
	pub product_code: u32,
	pub revision_number: u32,
	pub serial_number: u32,
}

/// A slave's actual identity, as read back over SDO during boot.
#[derive(Copy, Clone, Debug, Default)]
pub struct ActualIdentity {
	pub device_type: u32,
	pub vendor_id: u32,
	pub product_code: u32,
	pub revision_number: u32,
	pub serial_number: u32,
}

/// Check a slave's actual identity against the expected one, in CiA 302 order:
/// device type first, then vendor-ID, product code, and revision number.
pub fn check_identity(expected: &ExpectedIdentity, actual: &ActualIdentity) -> Result<(), BootStatus> {
	if expected.device_type != actual.device_type {
		return Err(BootStatus::DeviceTypeMismatch);
	}
	if expected.vendor_id != 0 && expected.vendor_id != actual.vendor_id {
		return Err(BootStatus::VendorIdMismatch);
	}
	if expected.product_code != 0 && expected.product_code != actual.product_code {
		return Err(BootStatus::ProductCodeMismatch);
	}
	if expected.revision_number != 0 && expected.revision_number != actual.revision_number {
		return Err(BootStatus::RevisionNumberMismatch);
	}
	if expected.serial_number != 0 && expected.serial_number != actual.serial_number {
		return Err(BootStatus::SerialNumberMismatch);
	}
	Ok(())
}

/// Whether, per the slave's 0x1F81 entry, the master should send `Start` after boot
/// rather than leave the slave in `Pre-operational`.
pub fn should_start(slave_assignment: u32) -> bool {
	// Bit 2 of the 0x1F81 entry: "do not start this slave" when set.
	slave_assignment & 0x04 == 0
}

/// Tracks one remote slave through steps 2-7 of the master boot-up procedure.
///
/// Step 1 (waiting for the slave's own boot-up indication, or deciding the
/// slave is already up) happens before a `SlaveBoot` is created. Every later
/// step is advanced by the host feeding back the result of an SDO upload or
/// download it performed; this struct only holds the decision state between
/// those calls.
pub struct SlaveBoot {
	node_id: u8,
	expected: ExpectedIdentity,
	start_after_boot: bool,
	status: Option<BootStatus>,
}

impl SlaveBoot {
	/// Begin booting `node_id` against `expected` identity, honoring the
	/// "do not start" bit of its 0x1F81 slave-assignment entry.
	pub fn new(node_id: u8, expected: ExpectedIdentity, slave_assignment: u32) -> Self {
		Self { node_id, expected, start_after_boot: should_start(slave_assignment), status: None }
	}

	/// The slave's node-ID.
	pub fn node_id(&self) -> u8 {
		self.node_id
	}

	/// Whether this boot has already concluded, successfully or not.
	pub fn is_done(&self) -> bool {
		self.status.is_some()
	}

	/// The final status, once the boot has concluded.
	pub fn status(&self) -> Option<BootStatus> {
		self.status
	}

	/// Step 2+3: check the slave's device type and identity against the expected values.
	/// On mismatch the boot concludes here and `status()` reports which check failed.
	pub fn check_identity(&mut self, actual: &ActualIdentity) -> Result<(), BootStatus> {
		match check_identity(&self.expected, actual) {
			Ok(()) => Ok(()),
			Err(status) => {
				log::warn!("boot: node 0x{:02X} failed identity check, status {}", self.node_id, status.code());
				self.status = Some(status);
				Err(status)
			}
		}
	}

	/// Step 6: error control has started for this slave (heartbeat consumer armed
	/// or node-guarding begun); the boot concludes successfully.
	pub fn error_control_started(&mut self) -> BootStatus {
		log::debug!("boot: node 0x{:02X} booted", self.node_id);
		self.status = Some(BootStatus::Booted);
		BootStatus::Booted
	}

	/// Step 7: whether the master should send `Start` to this slave after boot,
	/// rather than leave it in `Pre-operational`.
	pub fn should_start(&self) -> bool {
		self.start_after_boot
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn matching_identity_passes() {
		let expected = ExpectedIdentity { device_type: 0x000F_0191, vendor_id: 0x360, product_code: 1, revision_number: 0, serial_number: 0 };
		let actual = ActualIdentity { device_type: 0x000F_0191, vendor_id: 0x360, product_code: 1, revision_number: 7, serial_number: 0x42 };
		assert!(check_identity(&expected, &actual).is_ok());
	}

	#[test]
	fn device_type_mismatch_is_reported_as_b() {
		let expected = ExpectedIdentity { device_type: 0x0000_0000, ..Default::default() };
		let actual = ActualIdentity { device_type: 0x000F_0191, ..Default::default() };
		let status = check_identity(&expected, &actual).unwrap_err();
		assert_eq!(status, BootStatus::DeviceTypeMismatch);
		assert_eq!(status.code(), 'B');
	}

	#[test]
	fn vendor_mismatch_is_reported_as_c() {
		let expected = ExpectedIdentity { vendor_id: 0x360, ..Default::default() };
		let actual = ActualIdentity { vendor_id: 0x361, ..Default::default() };
		let status = check_identity(&expected, &actual).unwrap_err();
		assert_eq!(status, BootStatus::VendorIdMismatch);
		assert_eq!(status.code(), 'C');
	}

	#[test]
	fn zero_expectation_disables_the_check_for_fields_other_than_device_type() {
		let expected = ExpectedIdentity::default();
		let actual = ActualIdentity { device_type: 0, vendor_id: 0x360, product_code: 9, revision_number: 1, serial_number: 2 };
		assert!(check_identity(&expected, &actual).is_ok());
	}

	#[test]
	fn start_bit_controls_should_start() {
		assert!(should_start(0x00));
		assert!(!should_start(0x04));
	}

	#[test]
	fn slave_boot_concludes_on_identity_mismatch() {
		let expected = ExpectedIdentity { vendor_id: 0x360, ..Default::default() };
		let mut boot = SlaveBoot::new(9, expected, 0x00);
		let actual = ActualIdentity { vendor_id: 0x361, ..Default::default() };
		let err = boot.check_identity(&actual).unwrap_err();
		assert_eq!(err, BootStatus::VendorIdMismatch);
		assert!(boot.is_done());
		assert_eq!(boot.status(), Some(BootStatus::VendorIdMismatch));
	}

	#[test]
	fn slave_boot_reaches_booted_after_error_control_starts() {
		let mut boot = SlaveBoot::new(9, ExpectedIdentity::default(), 0x04);
		let actual = ActualIdentity::default();
		assert!(boot.check_identity(&actual).is_ok());
		assert!(!boot.is_done());
		assert_eq!(boot.error_control_started(), BootStatus::Booted);
		assert!(boot.is_done());
		assert!(!boot.should_start());
	}
}
