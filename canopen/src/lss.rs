//! Layer Setting Services: node-ID and bit-rate configuration without a pre-existing node-ID.
//!
//! Requests travel on [`MASTER_TO_SLAVE_COB_ID`] (0x7E5), responses on
//! [`SLAVE_TO_MASTER_COB_ID`] (0x7E4). Every message is 8 bytes: a command
//! specifier byte followed by up to 7 bytes of parameters.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle};

/// COB-ID carrying LSS requests, master to slave.
pub const MASTER_TO_SLAVE_COB_ID: u32 = 0x7E5;
/// COB-ID carrying LSS responses, slave to master.
pub const SLAVE_TO_MASTER_COB_ID: u32 = 0x7E4;

/// LSS command specifiers, the first byte of every LSS message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LssCommand {
	SwitchModeGlobal = 0x04,
	SwitchModeSelectiveVendorId = 0x40,
	SwitchModeSelectiveProductCode = 0x41,
	SwitchModeSelectiveRevisionNumber = 0x42,
	SwitchModeSelectiveSerialNumber = 0x43,
	SwitchModeSelectiveResponse = 0x44,
	ConfigureNodeId = 0x11,
	ConfigureBitTiming = 0x13,
	ActivateBitTiming = 0x15,
	StoreConfiguration = 0x17,
	InquireVendorId = 0x5A,
	InquireProductCode = 0x5B,
	InquireRevisionNumber = 0x5C,
	InquireSerialNumber = 0x5D,
	InquireNodeId = 0x5E,
	IdentifyRemoteSlaveVendorId = 0x46,
	IdentifyRemoteSlaveProductCode = 0x47,
	IdentifyRemoteSlaveRevisionLow = 0x48,
	IdentifyRemoteSlaveRevisionHigh = 0x49,
	IdentifyRemoteSlaveSerialLow = 0x4A,
	IdentifyRemoteSlaveSerialHigh = 0x4B,
	IdentifySlaveResponse = 0x4F,
	IdentifyNonConfiguredRemoteSlave = 0x4C,
	IdentifyNonConfiguredSlaveResponse = 0x50,
	Fastscan = 0x51,
}

/// Whether an LSS slave is open for node-ID/bit-rate configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LssMode {
	/// Normal operation; only global/selective switch and identify requests are answered.
	Waiting,
	/// Open for configuration: node-ID, bit timing, and store/activate requests are answered.
	Configuration,
}

/// The four identity fields (objects 0x1018) an LSS slave is addressed or scanned by.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct LssIdentity {
	pub vendor_id: u32,
	pub product_code: u32,
	pub revision_number: u32,
	pub serial_number: u32,
}

/// Error codes returned in a configuration response's first data byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LssError {
	Ok = 0,
	OutOfRange = 1,
	ImplementationSpecific = 0xFF,
}

fn frame8(cob_id: u32, cs: u8, data: [u8; 7]) -> Option<Frame> {
	let mut buf = [0u8; 8];
	buf[0] = cs;
	buf[1..].copy_from_slice(&data);
	Frame::new(cob_id, &buf).ok()
}

fn u32_param(data: &[u8]) -> u32 {
	u32::from_le_bytes([data[1], data[2], data[3], data[4]])
}

// --- Slave side -------------------------------------------------------------------

#[derive(Default)]
struct SelectiveProgress {
	vendor_ok: bool,
	product_ok: bool,
	revision_ok: bool,
}

#[derive(Default)]
struct IdentifyProgress {
	vendor_ok: bool,
	product_ok: bool,
	revision_low: u32,
	serial_low: u32,
}

struct SlaveShared {
	identity: LssIdentity,
	mode: LssMode,
	node_id: u8,
	selective: SelectiveProgress,
	identify: IdentifyProgress,
}

/// An LSS slave: answers requests addressed to it by identity, and performs the
/// configuration actions a matched request asks for.
pub struct LssSlave {
	shared: Rc<RefCell<SlaveShared>>,
	receiver: Option<ReceiverHandle>,
}

impl LssSlave {
	/// Start an LSS slave identified by `identity`, initially in [`LssMode::Waiting`]
	/// with the given current `node_id`.
	///
	/// `on_configure_node_id`/`on_store`/`on_activate_bit_timing` surface the actions
	/// a host must actually carry out (persisting the node-ID, committing to non-volatile
	/// storage, switching the bus bit rate); this service only runs the wire protocol.
	pub fn start(
		dispatcher: &mut Dispatcher,
		identity: LssIdentity,
		node_id: u8,
		mut on_configure_node_id: impl FnMut(u8) -> Result<(), ()> + 'static,
		mut on_store: impl FnMut() -> Result<(), ()> + 'static,
		mut on_activate_bit_timing: impl FnMut(u16) + 'static,
	) -> Result<Self, DispatchError> {
		let shared = Rc::new(RefCell::new(SlaveShared {
			identity,
			mode: LssMode::Waiting,
			node_id,
			selective: SelectiveProgress::default(),
			identify: IdentifyProgress::default(),
		}));
		let recv_shared = shared.clone();
		let receiver = dispatcher.register_receiver(MASTER_TO_SLAVE_COB_ID, 0x7FF, false, 0, move |frame, dispatcher| {
			if frame.is_rtr() || frame.len() < 8 {
				return;
			}
			let data = frame.data();
			let Ok(cs) = LssCommand::try_from(data[0]) else { return };
			let mut state = recv_shared.borrow_mut();
			match cs {
				LssCommand::SwitchModeGlobal => {
					state.mode = if data[1] == 1 { LssMode::Configuration } else { LssMode::Waiting };
				}
				LssCommand::SwitchModeSelectiveVendorId => {
					state.selective.vendor_ok = u32_param(data) == state.identity.vendor_id;
				}
				LssCommand::SwitchModeSelectiveProductCode => {
					state.selective.vendor_ok &= u32_param(data) == state.identity.product_code;
					state.selective.product_ok = state.selective.vendor_ok;
				}
				LssCommand::SwitchModeSelectiveRevisionNumber => {
					if state.selective.product_ok {
						state.selective.revision_ok = u32_param(data) == state.identity.revision_number;
					}
				}
				LssCommand::SwitchModeSelectiveSerialNumber => {
					let matched = state.selective.revision_ok && u32_param(data) == state.identity.serial_number;
					state.selective = SelectiveProgress::default();
					if matched {
						state.mode = LssMode::Configuration;
						if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::SwitchModeSelectiveResponse.into(), [0; 7]) {
							let _ = dispatcher.send(frame);
						}
					}
				}
				LssCommand::ConfigureNodeId => {
					if state.mode != LssMode::Configuration {
						return;
					}
					let new_id = data[1];
					let error = if (1..=127).contains(&new_id) {
						drop(state);
						let result = on_configure_node_id(new_id);
						state = recv_shared.borrow_mut();
						match result {
							Ok(()) => {
								state.node_id = new_id;
								LssError::Ok
							}
							Err(()) => LssError::ImplementationSpecific,
						}
					} else {
						LssError::OutOfRange
					};
					if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::ConfigureNodeId.into(), [error.into(), 0, 0, 0, 0, 0, 0]) {
						let _ = dispatcher.send(frame);
					}
				}
				LssCommand::ConfigureBitTiming => {
					if state.mode != LssMode::Configuration {
						return;
					}
					if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::ConfigureBitTiming.into(), [0; 7]) {
						let _ = dispatcher.send(frame);
					}
				}
				LssCommand::ActivateBitTiming => {
					if state.mode != LssMode::Configuration {
						return;
					}
					let delay = u16::from_le_bytes([data[1], data[2]]);
					drop(state);
					on_activate_bit_timing(delay);
				}
				LssCommand::StoreConfiguration => {
					if state.mode != LssMode::Configuration {
						return;
					}
					drop(state);
					let result = on_store();
					let error = if result.is_ok() { LssError::Ok } else { LssError::ImplementationSpecific };
					if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::StoreConfiguration.into(), [error.into(), 0, 0, 0, 0, 0, 0]) {
						let _ = dispatcher.send(frame);
					}
				}
				LssCommand::InquireVendorId => respond_u32(dispatcher, LssCommand::InquireVendorId, state.identity.vendor_id),
				LssCommand::InquireProductCode => respond_u32(dispatcher, LssCommand::InquireProductCode, state.identity.product_code),
				LssCommand::InquireRevisionNumber => respond_u32(dispatcher, LssCommand::InquireRevisionNumber, state.identity.revision_number),
				LssCommand::InquireSerialNumber => respond_u32(dispatcher, LssCommand::InquireSerialNumber, state.identity.serial_number),
				LssCommand::InquireNodeId => {
					if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::InquireNodeId.into(), [state.node_id, 0, 0, 0, 0, 0, 0]) {
						let _ = dispatcher.send(frame);
					}
				}
				LssCommand::IdentifyRemoteSlaveVendorId => {
					state.identify.vendor_ok = u32_param(data) == state.identity.vendor_id;
				}
				LssCommand::IdentifyRemoteSlaveProductCode => {
					state.identify.product_ok = state.identify.vendor_ok && u32_param(data) == state.identity.product_code;
				}
				LssCommand::IdentifyRemoteSlaveRevisionLow => {
					state.identify.revision_low = u32_param(data);
				}
				LssCommand::IdentifyRemoteSlaveRevisionHigh => {
					let in_range = (state.identify.revision_low..=u32_param(data)).contains(&state.identity.revision_number);
					state.identify.product_ok &= in_range;
				}
				LssCommand::IdentifyRemoteSlaveSerialLow => {
					state.identify.serial_low = u32_param(data);
				}
				LssCommand::IdentifyRemoteSlaveSerialHigh => {
					let matched = state.identify.product_ok && (state.identify.serial_low..=u32_param(data)).contains(&state.identity.serial_number);
					state.identify = IdentifyProgress::default();
					if matched {
						if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::IdentifySlaveResponse.into(), [0; 7]) {
							let _ = dispatcher.send(frame);
						}
					}
				}
				LssCommand::IdentifyNonConfiguredRemoteSlave => {
					if state.node_id == 0 {
						if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::IdentifyNonConfiguredSlaveResponse.into(), [0; 7]) {
							let _ = dispatcher.send(frame);
						}
					}
				}
				LssCommand::Fastscan => {
					let id_number = u32_param(data);
					let bit_check = data[5];
					let lss_sub = data[6];
					let field = match lss_sub {
						0 => state.identity.vendor_id,
						1 => state.identity.product_code,
						2 => state.identity.revision_number,
						_ => state.identity.serial_number,
					};
					let mask: u32 = if bit_check >= 32 { u32::MAX } else { !0u32 << bit_check };
					if field & mask == id_number & mask {
						if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, LssCommand::IdentifySlaveResponse.into(), [0; 7]) {
							let _ = dispatcher.send(frame);
						}
						if bit_check >= 32 && lss_sub == 3 {
							state.mode = LssMode::Configuration;
						}
					}
				}
				_ => {}
			}
		})?;
		Ok(Self { shared, receiver: Some(receiver) })
	}

	/// The slave's current mode.
	pub fn mode(&self) -> LssMode {
		self.shared.borrow().mode
	}

	/// The slave's current node-ID (0 means "unconfigured").
	pub fn node_id(&self) -> u8 {
		self.shared.borrow().node_id
	}

	/// Stop the slave, deregistering the underlying receiver.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

fn respond_u32(dispatcher: &mut Dispatcher, command: LssCommand, value: u32) {
	let bytes = value.to_le_bytes();
	if let Some(frame) = frame8(SLAVE_TO_MASTER_COB_ID, command.into(), [bytes[0], bytes[1], bytes[2], bytes[3], 0, 0, 0]) {
		let _ = dispatcher.send(frame);
	}
}

// --- Master side ------------------------------------------------------------------

/// A decoded LSS response.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LssResponse {
	SwitchModeSelectiveConfirmed,
	ConfigureNodeId(LssError),
	ConfigureBitTiming(LssError),
	StoreConfiguration(LssError),
	VendorId(u32),
	ProductCode(u32),
	RevisionNumber(u32),
	SerialNumber(u32),
	NodeId(u8),
	IdentifySlave,
	IdentifyNonConfiguredSlave,
}

/// Sends LSS requests and decodes every response, handing them to a host callback.
pub struct LssMaster {
	receiver: Option<ReceiverHandle>,
}

impl LssMaster {
	/// Start a master, delivering every decoded response to `on_response`.
	pub fn start(dispatcher: &mut Dispatcher, mut on_response: impl FnMut(LssResponse) + 'static) -> Result<Self, DispatchError> {
		let receiver = dispatcher.register_receiver(SLAVE_TO_MASTER_COB_ID, 0x7FF, false, 0, move |frame, _dispatcher| {
			if frame.is_rtr() || frame.len() < 8 {
				return;
			}
			let data = frame.data();
			let Ok(cs) = LssCommand::try_from(data[0]) else { return };
			let response = match cs {
				LssCommand::SwitchModeSelectiveResponse => LssResponse::SwitchModeSelectiveConfirmed,
				LssCommand::ConfigureNodeId => LssError::try_from(data[1]).ok().map(LssResponse::ConfigureNodeId),
				LssCommand::ConfigureBitTiming => LssError::try_from(data[1]).ok().map(LssResponse::ConfigureBitTiming),
				LssCommand::StoreConfiguration => LssError::try_from(data[1]).ok().map(LssResponse::StoreConfiguration),
				LssCommand::InquireVendorId => Some(LssResponse::VendorId(u32::from_le_bytes([data[1], data[2], data[3], data[4]]))),
				LssCommand::InquireProductCode => Some(LssResponse::ProductCode(u32::from_le_bytes([data[1], data[2], data[3], data[4]]))),
				LssCommand::InquireRevisionNumber => Some(LssResponse::RevisionNumber(u32::from_le_bytes([data[1], data[2], data[3], data[4]]))),
				LssCommand::InquireSerialNumber => Some(LssResponse::SerialNumber(u32::from_le_bytes([data[1], data[2], data[3], data[4]]))),
				LssCommand::InquireNodeId => Some(LssResponse::NodeId(data[1])),
				LssCommand::IdentifySlaveResponse => Some(LssResponse::IdentifySlave),
				LssCommand::IdentifyNonConfiguredSlaveResponse => Some(LssResponse::IdentifyNonConfiguredSlave),
				_ => None,
			};
			// `ConfigureNodeId`/`ConfigureBitTiming`/`StoreConfiguration` reuse the `match` arm's
			// `Option` plumbing above for their error-code decode; unwrap it here.
			if let Some(response) = response {
				on_response(response);
			}
		})?;
		Ok(Self { receiver: Some(receiver) })
	}

	/// Broadcast a global mode switch to every slave on the bus.
	pub fn switch_mode_global(&self, dispatcher: &mut Dispatcher, mode: LssMode) {
		let value = if mode == LssMode::Configuration { 1 } else { 0 };
		send(dispatcher, LssCommand::SwitchModeGlobal, [value, 0, 0, 0, 0, 0, 0]);
	}

	/// Address a single slave by its full identity for selective configuration.
	pub fn switch_mode_selective(&self, dispatcher: &mut Dispatcher, identity: LssIdentity) {
		send_u32(dispatcher, LssCommand::SwitchModeSelectiveVendorId, identity.vendor_id);
		send_u32(dispatcher, LssCommand::SwitchModeSelectiveProductCode, identity.product_code);
		send_u32(dispatcher, LssCommand::SwitchModeSelectiveRevisionNumber, identity.revision_number);
		send_u32(dispatcher, LssCommand::SwitchModeSelectiveSerialNumber, identity.serial_number);
	}

	/// Ask the currently selected slave to take `node_id`.
	pub fn configure_node_id(&self, dispatcher: &mut Dispatcher, node_id: u8) {
		send(dispatcher, LssCommand::ConfigureNodeId, [node_id, 0, 0, 0, 0, 0, 0]);
	}

	/// Ask the currently selected slave to persist its pending configuration.
	pub fn store_configuration(&self, dispatcher: &mut Dispatcher) {
		send(dispatcher, LssCommand::StoreConfiguration, [0; 7]);
	}

	/// Ask the currently selected slave to switch to the new bit rate after `delay_ms`.
	pub fn activate_bit_timing(&self, dispatcher: &mut Dispatcher, delay_ms: u16) {
		let bytes = delay_ms.to_le_bytes();
		send(dispatcher, LssCommand::ActivateBitTiming, [bytes[0], bytes[1], 0, 0, 0, 0, 0]);
	}

	/// Ask whether any unconfigured slave is present on the bus.
	pub fn identify_non_configured_remote_slave(&self, dispatcher: &mut Dispatcher) {
		send(dispatcher, LssCommand::IdentifyNonConfiguredRemoteSlave, [0; 7]);
	}

	/// Send one Fastscan probe.
	pub fn fastscan_probe(&self, dispatcher: &mut Dispatcher, probe: FastscanProbe) {
		let bytes = probe.id_number.to_le_bytes();
		send(dispatcher, LssCommand::Fastscan, [bytes[0], bytes[1], bytes[2], bytes[3], probe.bit_check, probe.lss_sub, probe.lss_next]);
	}

	/// Stop the master, deregistering the underlying receiver.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

fn send(dispatcher: &mut Dispatcher, command: LssCommand, data: [u8; 7]) {
	if let Some(frame) = frame8(MASTER_TO_SLAVE_COB_ID, command.into(), data) {
		let _ = dispatcher.send(frame);
	}
}

fn send_u32(dispatcher: &mut Dispatcher, command: LssCommand, value: u32) {
	let bytes = value.to_le_bytes();
	send(dispatcher, command, [bytes[0], bytes[1], bytes[2], bytes[3], 0, 0, 0]);
}

/// One probe of a [`FastscanSession`]: the candidate value and which bit/field it tests.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FastscanProbe {
	pub id_number: u32,
	/// `0..=31` tests a single bit; `>=32` (conventionally `0x80`) asks for an exact match
	/// confirming the field just resolved before moving to the next one.
	pub bit_check: u8,
	pub lss_sub: u8,
	pub lss_next: u8,
}

/// Outcome of advancing a [`FastscanSession`] by one probe/response pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FastscanProgress {
	/// Send the next probe from [`FastscanSession::probe`].
	Continue,
	/// Every field matched; scanning is complete.
	Found(LssIdentity),
	/// No slave answered a confirmation probe; no matching device is present.
	NoDeviceFound,
}

/// Drives the LSS Fastscan protocol: an iterative, bit-wise binary search across the
/// four 32-bit identity fields (vendor-ID, product-code, revision-number, serial-number),
/// narrowing each field from bit 31 down to bit 0 before moving to the next.
#[derive(Debug, Copy, Clone)]
pub struct FastscanSession {
	field: u8,
	bit: i8,
	id_numbers: [u32; 4],
}

impl FastscanSession {
	/// Start a new scan from the top bit of the vendor-ID field.
	pub fn new() -> Self {
		Self { field: 0, bit: 31, id_numbers: [0; 4] }
	}

	/// The next probe to send. Call [`Self::advance`] with whether a slave answered it.
	pub fn probe(&self) -> FastscanProbe {
		if self.bit >= 0 {
			FastscanProbe { id_number: self.id_numbers[self.field as usize], bit_check: self.bit as u8, lss_sub: self.field, lss_next: self.field }
		} else {
			let next_field = if self.field < 3 { self.field + 1 } else { self.field };
			FastscanProbe { id_number: self.id_numbers[self.field as usize], bit_check: 0x80, lss_sub: self.field, lss_next: next_field }
		}
	}

	/// Advance the session with whether a slave answered the last [`Self::probe`].
	pub fn advance(&mut self, responded: bool) -> FastscanProgress {
		if self.bit >= 0 {
			if !responded {
				self.id_numbers[self.field as usize] |= 1 << self.bit;
			}
			self.bit -= 1;
			FastscanProgress::Continue
		} else if responded {
			if self.field == 3 {
				FastscanProgress::Found(LssIdentity {
					vendor_id: self.id_numbers[0],
					product_code: self.id_numbers[1],
					revision_number: self.id_numbers[2],
					serial_number: self.id_numbers[3],
				})
			} else {
				self.field += 1;
				self.bit = 31;
				FastscanProgress::Continue
			}
		} else {
			FastscanProgress::NoDeviceFound
		}
	}
}

impl Default for FastscanSession {
	fn default() -> Self {
		Self::new()
	}
}

/// Drives a Slowscan: a coarser range-binary-search using
/// [`LssMaster::identify_non_configured_remote_slave`]-style exact range checks via
/// repeated [`LssCommand::IdentifyRemoteSlaveVendorId`]..`SerialHigh` probes, halving
/// the candidate range on every step instead of testing one bit at a time.
#[derive(Debug, Copy, Clone)]
pub struct SlowscanSession {
	low: u32,
	high: u32,
	field: u8,
	resolved: [u32; 4],
}

impl SlowscanSession {
	/// Start a Slowscan over the full 32-bit range of the vendor-ID field.
	pub fn new() -> Self {
		Self { low: 0, high: u32::MAX, field: 0, resolved: [0; 4] }
	}

	/// The range currently being bisected for the active field.
	pub fn range(&self) -> (u32, u32) {
		(self.low, self.high)
	}

	/// Midpoint of the current range; the next identify-remote-slave probe uses this
	/// as the upper bound of the low half.
	pub fn midpoint(&self) -> u32 {
		self.low + (self.high - self.low) / 2
	}

	/// Advance the session given whether any slave matched the low half
	/// (`low..=midpoint`) of the current range.
	pub fn advance(&mut self, matched_low_half: bool) -> FastscanProgress {
		let mid = self.midpoint();
		if matched_low_half {
			self.high = mid;
		} else {
			self.low = mid + 1;
		}
		if self.low == self.high {
			self.resolved[self.field as usize] = self.low;
			if self.field == 3 {
				return FastscanProgress::Found(LssIdentity {
					vendor_id: self.resolved[0],
					product_code: self.resolved[1],
					revision_number: self.resolved[2],
					serial_number: self.resolved[3],
				});
			}
			self.field += 1;
			self.low = 0;
			self.high = u32::MAX;
		}
		FastscanProgress::Continue
	}
}

impl Default for SlowscanSession {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dispatcher::Dispatcher;
	use std::cell::RefCell;
	use std::rc::Rc;

	fn identity() -> LssIdentity {
		LssIdentity { vendor_id: 0x1234, product_code: 0x5678, revision_number: 1, serial_number: 0xDEAD_BEEF }
	}

	/// A master and a slave each on their own dispatcher, as two nodes on a bus would be,
	/// with outbound frames captured so the test can manually ferry them to the other side.
	struct Bus {
		master: Dispatcher,
		slave: Dispatcher,
		master_out: Rc<RefCell<Vec<Frame>>>,
		slave_out: Rc<RefCell<Vec<Frame>>>,
	}

	impl Bus {
		fn new() -> Self {
			let mut master = Dispatcher::new();
			let mut slave = Dispatcher::new();
			let master_out = Rc::new(RefCell::new(Vec::new()));
			let slave_out = Rc::new(RefCell::new(Vec::new()));
			let mo = master_out.clone();
			master.set_send_callback(move |frame| {
				mo.borrow_mut().push(frame);
				Ok(())
			});
			let so = slave_out.clone();
			slave.set_send_callback(move |frame| {
				so.borrow_mut().push(frame);
				Ok(())
			});
			Self { master, slave, master_out, slave_out }
		}

		/// Deliver every frame the master has sent to the slave, and vice versa.
		fn exchange(&mut self) {
			for frame in std::mem::take(&mut *self.master_out.borrow_mut()) {
				self.slave.submit_frame(frame);
			}
			for frame in std::mem::take(&mut *self.slave_out.borrow_mut()) {
				self.master.submit_frame(frame);
			}
		}
	}

	#[test]
	fn selective_switch_matches_only_full_identity() {
		let mut bus = Bus::new();
		let _slave = LssSlave::start(&mut bus.slave, identity(), 0, |_| Ok(()), || Ok(()), |_| {}).unwrap();
		let seen = Rc::new(RefCell::new(false));
		let seen2 = seen.clone();
		let master = LssMaster::start(&mut bus.master, move |response| {
			if response == LssResponse::SwitchModeSelectiveConfirmed {
				*seen2.borrow_mut() = true;
			}
		})
		.unwrap();
		master.switch_mode_selective(&mut bus.master, identity());
		bus.exchange();
		bus.exchange();
		assert!(*seen.borrow());
	}

	#[test]
	fn selective_switch_does_not_match_wrong_serial() {
		let mut bus = Bus::new();
		let _slave = LssSlave::start(&mut bus.slave, identity(), 0, |_| Ok(()), || Ok(()), |_| {}).unwrap();
		let master = LssMaster::start(&mut bus.master, |_| {}).unwrap();
		let mut wrong = identity();
		wrong.serial_number ^= 1;
		master.switch_mode_selective(&mut bus.master, wrong);
		bus.exchange();
		assert!(bus.slave_out.borrow().is_empty());
	}

	#[test]
	fn configure_node_id_is_rejected_outside_configuration_mode() {
		let mut bus = Bus::new();
		let _slave = LssSlave::start(&mut bus.slave, identity(), 3, |_| Ok(()), || Ok(()), |_| {}).unwrap();
		let master = LssMaster::start(&mut bus.master, |_| {}).unwrap();
		master.configure_node_id(&mut bus.master, 10);
		bus.exchange();
		assert!(bus.slave_out.borrow().is_empty());
	}

	#[test]
	fn configure_node_id_succeeds_once_selected_and_in_configuration_mode() {
		let mut bus = Bus::new();
		let slave = LssSlave::start(&mut bus.slave, identity(), 3, |_new_id| Ok(()), || Ok(()), |_| {}).unwrap();
		let responses = Rc::new(RefCell::new(Vec::new()));
		let responses2 = responses.clone();
		let master = LssMaster::start(&mut bus.master, move |response| responses2.borrow_mut().push(response)).unwrap();

		master.switch_mode_selective(&mut bus.master, identity());
		bus.exchange();
		bus.exchange();
		master.configure_node_id(&mut bus.master, 10);
		bus.exchange();
		bus.exchange();

		assert!(responses.borrow().contains(&LssResponse::ConfigureNodeId(LssError::Ok)));
		assert_eq!(slave.node_id(), 10);
	}

	#[test]
	fn fastscan_narrows_to_a_single_matching_slave() {
		let mut bus = Bus::new();
		let _slave = LssSlave::start(&mut bus.slave, identity(), 0, |_| Ok(()), || Ok(()), |_| {}).unwrap();
		let responded = Rc::new(RefCell::new(false));
		let responded2 = responded.clone();
		let master = LssMaster::start(&mut bus.master, move |response| {
			if response == LssResponse::IdentifySlave {
				*responded2.borrow_mut() = true;
			}
		})
		.unwrap();

		let mut session = FastscanSession::new();
		loop {
			*responded.borrow_mut() = false;
			let probe = session.probe();
			master.fastscan_probe(&mut bus.master, probe);
			bus.exchange();
			bus.exchange();
			let got_response = *responded.borrow();
			match session.advance(got_response) {
				FastscanProgress::Continue => continue,
				FastscanProgress::Found(found) => {
					assert_eq!(found, identity());
					break;
				}
				FastscanProgress::NoDeviceFound => panic!("expected the slave to be found"),
			}
		}
	}

	#[test]
	fn identify_remote_slave_matches_on_revision_and_serial_range() {
		let mut bus = Bus::new();
		let _slave = LssSlave::start(&mut bus.slave, identity(), 0, |_| Ok(()), || Ok(()), |_| {}).unwrap();
		let responded = Rc::new(RefCell::new(false));
		let responded2 = responded.clone();
		let master = LssMaster::start(&mut bus.master, move |response| {
			if response == LssResponse::IdentifySlave {
				*responded2.borrow_mut() = true;
			}
		})
		.unwrap();

		send_u32(&mut bus.master, LssCommand::IdentifyRemoteSlaveVendorId, identity().vendor_id);
		send_u32(&mut bus.master, LssCommand::IdentifyRemoteSlaveProductCode, identity().product_code);
		send_u32(&mut bus.master, LssCommand::IdentifyRemoteSlaveRevisionLow, 0);
		send_u32(&mut bus.master, LssCommand::IdentifyRemoteSlaveRevisionHigh, identity().revision_number);
		send_u32(&mut bus.master, LssCommand::IdentifyRemoteSlaveSerialLow, 0);
		send_u32(&mut bus.master, LssCommand::IdentifyRemoteSlaveSerialHigh, identity().serial_number);
		bus.exchange();
		bus.exchange();
		assert!(*responded.borrow());
	}
}
