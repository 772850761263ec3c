//! Device: the object dictionary, NMT state machine, and service set bound
//! together into one node, composed and re-composed the way an NMT
//! reset-communication actually happens on the wire.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::DeviceConfig;
use crate::dcf::{self, DcfError};
use crate::dictionary::ObjectDictionary;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::emcy::{EmcyConsumer, EmcyMessage, EmcyProducer};
use crate::nmt::{NmtCommand, NmtService, NmtState};
use crate::pdo::PdoError;
use crate::sdo::SdoServer;
use crate::service::{tpdo_comm_index, rpdo_comm_index, ServiceSet, ServiceSetError, MAX_RPDO, MAX_TPDO};
use crate::sync::{SyncConsumer, SyncProducer};
use crate::time::{Duration, Instant};
use crate::time_stamp::TimeProducer;

const COB_ID_SYNC: u16 = 0x1005;
const COB_ID_TIME: u16 = 0x1012;
const COB_ID_EMCY: u16 = 0x1014;
const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;

fn highest_contiguous_pdo_count(dictionary: &ObjectDictionary, comm_index_of: impl Fn(u16) -> u16, limit: usize) -> u16 {
	let mut count = 0u16;
	while (count as usize) < limit && dictionary.object(comm_index_of(count)).is_some() {
		count += 1;
	}
	count
}

/// One CANopen node: its dictionary, its own NMT state machine, and the
/// communication services built from the dictionary's contents.
///
/// The device owns no thread and reads no clock; every state transition is
/// driven by frames and timer ticks the host feeds into the shared
/// [`Dispatcher`], the same passive model every service in this crate follows.
pub struct Device {
	dictionary: Rc<RefCell<ObjectDictionary>>,
	nmt: NmtService,
	services: ServiceSet,
	config: DeviceConfig,
}

impl Device {
	/// Bring up a device at `node_id`: register the NMT command receiver and
	/// build the initial (empty) service set. Call [`Self::reset_communication`]
	/// to populate SYNC/TIME/EMCY/PDO/SDO services from `dictionary`.
	pub fn new(dispatcher: &mut Dispatcher, node_id: u8, dictionary: ObjectDictionary, config: DeviceConfig) -> Result<Self, DispatchError> {
		let nmt = NmtService::new(dispatcher, node_id, |_cmd, _dispatcher| {})?;
		Ok(Self { dictionary: Rc::new(RefCell::new(dictionary)), nmt, services: ServiceSet::new(), config })
	}

	/// This device's node-ID.
	pub fn node_id(&self) -> u8 {
		self.nmt.node_id()
	}

	/// The device's current NMT state.
	pub fn state(&self) -> NmtState {
		self.nmt.state()
	}

	/// Shared access to the underlying dictionary, e.g. for SDO servers or a
	/// host-side application layer reading/writing process data directly.
	pub fn dictionary(&self) -> Rc<RefCell<ObjectDictionary>> {
		self.dictionary.clone()
	}

	/// The composed service set.
	pub fn services(&self) -> &ServiceSet {
		&self.services
	}

	/// The composed service set, mutably (for `tpdos_mut().notify_event()` after
	/// a dictionary write the host made on the application's behalf).
	pub fn services_mut(&mut self) -> &mut ServiceSet {
		&mut self.services
	}

	/// Apply a concise DCF buffer (object 0x1F22) to this device's dictionary.
	/// Typically called once at boot, before [`Self::reset_communication`].
	pub fn apply_dcf(&mut self, buffer: &[u8]) -> Result<usize, DcfError> {
		let state = self.nmt.state();
		let result = dcf::apply(&mut self.dictionary.borrow_mut(), buffer, state);
		match &result {
			Ok(count) => log::debug!("applied {count} concise DCF entries to node 0x{:02X}", self.node_id()),
			Err(err) => log::warn!("concise DCF apply failed for node 0x{:02X}: {err}", self.node_id()),
		}
		result
	}

	/// Tear down every communication service and rebuild it from the current
	/// dictionary contents, the way an NMT "Reset communication" command does.
	///
	/// Re-enables the heartbeat producer from `DeviceConfig::heartbeat_ms` and
	/// scans for RPDOs, TPDOs, and a single SDO server at this node's own ID.
	pub fn reset_communication(&mut self, dispatcher: &mut Dispatcher, now: Instant) -> Result<(), ServiceSetError> {
		log::debug!("resetting communication for node 0x{:02X}", self.node_id());
		self.services.shutdown(dispatcher);
		self.nmt.disable_heartbeat(dispatcher);

		if self.config.heartbeat_ms != 0 {
			self.nmt.enable_heartbeat(dispatcher, Duration::from_millis(self.config.heartbeat_ms as u64), now)?;
		}

		let state_handle = self.nmt.state_handle();
		let state = self.nmt.state();

		let rpdo_count = highest_contiguous_pdo_count(&self.dictionary.borrow(), rpdo_comm_index, MAX_RPDO);
		self.services.scan_rpdos(dispatcher, rpdo_count, self.dictionary.clone(), state_handle.clone(), |_err: PdoError| {})?;

		let tpdo_count = highest_contiguous_pdo_count(&self.dictionary.borrow(), tpdo_comm_index, MAX_TPDO);
		self.services.scan_tpdos(dispatcher, tpdo_count, self.dictionary.clone(), state_handle, now)?;

		let server = SdoServer::start(dispatcher, self.node_id(), self.dictionary.clone(), self.nmt.state_handle(), Duration::from_millis(self.config.sdo_timeout_ms as u64))?;
		self.services.add_sdo_server(server)?;

		if let Some(cob_id) = self.read_u32(COB_ID_SYNC, 0, state) {
			if cob_id & (1 << 30) != 0 {
				self.services.sync_consumer =
					Some(SyncConsumer::start(dispatcher, cob_id & 0x1FFF_FFFF, Duration::ZERO, |_now, _dispatcher| {})?);
			}
		}

		if let Some(cob_id) = self.read_u32(COB_ID_EMCY, 0, state) {
			let inhibit = Duration::from_100us(self.config.emcy_inhibit_100us);
			self.services.emcy_producer = Some(EmcyProducer::new(cob_id & 0x7FF, inhibit));
		}

		Ok(())
	}

	/// Start producing SYNC on the dictionary's configured COB-ID (0x1005) at
	/// `period`, the overflow counter from `DeviceConfig::sync_overflow`.
	pub fn start_sync_producer(&mut self, dispatcher: &mut Dispatcher, period: Duration, now: Instant) -> Result<(), DispatchError> {
		let state = self.nmt.state();
		let cob_id = self.read_u32(COB_ID_SYNC, 0, state).unwrap_or(0x080) & 0x1FFF_FFFF;
		self.services.sync_producer = Some(SyncProducer::start(dispatcher, cob_id, period, self.config.sync_overflow, now)?);
		Ok(())
	}

	/// Start producing TIME on the dictionary's configured COB-ID (0x1012) at `period`.
	pub fn start_time_producer(
		&mut self,
		dispatcher: &mut Dispatcher,
		period: Duration,
		now: Instant,
		current_time: impl FnMut(Instant) -> crate::time_stamp::TimeOfDay + 'static,
	) -> Result<(), DispatchError> {
		let state = self.nmt.state();
		let cob_id = self.read_u32(COB_ID_TIME, 0, state).unwrap_or(0x100) & 0x1FFF_FFFF;
		self.services.time_producer = Some(TimeProducer::start(dispatcher, cob_id, period, now, current_time)?);
		Ok(())
	}

	/// Start consuming EMCY from every node, handing decoded messages to `on_error`.
	pub fn start_emcy_consumer(&mut self, dispatcher: &mut Dispatcher, cob_id: u32, on_error: impl FnMut(EmcyMessage) + 'static) -> Result<(), DispatchError> {
		self.services.emcy_consumer = Some(EmcyConsumer::start(dispatcher, cob_id, on_error)?);
		Ok(())
	}

	/// Process a received NMT command against this device's own state machine.
	pub fn submit_command(&mut self, command: NmtCommand) {
		if let Some(next) = command.expected_state() {
			self.nmt.set_state(next);
		}
	}

	/// Drive every synchronous TPDO from a received SYNC.
	pub fn on_sync(&mut self, dispatcher: &mut Dispatcher) {
		self.services.on_sync(dispatcher);
	}

	/// Tear down every service, including the NMT command receiver itself.
	pub fn shutdown(&mut self, dispatcher: &mut Dispatcher) {
		self.services.shutdown(dispatcher);
		self.nmt.shutdown(dispatcher);
	}

	fn read_u32(&self, index: u16, sub: u8, state: NmtState) -> Option<u32> {
		let mut dictionary = self.dictionary.borrow_mut();
		match dictionary.read(index, sub, state).ok()? {
			crate::codec::Value::U32(v) => Some(v),
			_ => None,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dictionary::{AccessType, Object, ObjectCode, SubObject};
	use crate::codec::Value;

	fn dictionary_with_sdo_only(node_id: u8) -> ObjectDictionary {
		ObjectDictionary::new(node_id)
	}

	#[test]
	fn new_device_starts_in_initialisation() {
		let mut dispatcher = Dispatcher::new();
		let device = Device::new(&mut dispatcher, 5, dictionary_with_sdo_only(5), DeviceConfig::default()).unwrap();
		assert_eq!(device.state(), NmtState::Initialisation);
		assert_eq!(device.node_id(), 5);
	}

	#[test]
	fn reset_communication_starts_an_sdo_server_and_heartbeat() {
		let mut dispatcher = Dispatcher::new();
		let config = DeviceConfig { heartbeat_ms: 100, ..DeviceConfig::default() };
		let mut device = Device::new(&mut dispatcher, 5, dictionary_with_sdo_only(5), config).unwrap();
		device.submit_command(NmtCommand::GoToPreOperational);
		device.reset_communication(&mut dispatcher, Instant::default()).unwrap();
		assert_eq!(device.services().sdo_servers().len(), 1);

		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		dispatcher.set_time(Instant::from_millis(100));
		assert_eq!(sent.borrow().len(), 1);
	}

	#[test]
	fn reset_communication_scans_rpdos_from_the_dictionary() {
		let mut dispatcher = Dispatcher::new();
		let mut dict = dictionary_with_sdo_only(5);
		let target = SubObject::new(AccessType::Rw, Value::U16(0)).pdo_mappable(true);
		dict.insert(Object::new(0x6200, ObjectCode::Var).insert(1, target));
		let comm = Object::new(rpdo_comm_index(0), ObjectCode::Record)
			.insert(1, SubObject::new(AccessType::Rw, Value::U32(0x201)))
			.insert(2, SubObject::new(AccessType::Rw, Value::U8(0xFF)));
		let mapping = Object::new(0x1600, ObjectCode::Record)
			.insert(0, SubObject::new(AccessType::Rw, Value::U8(1)))
			.insert(1, SubObject::new(AccessType::Rw, Value::U32(crate::pdo::PdoMapping { index: 0x6200, subindex: 1, bit_length: 16 }.to_u32())));
		dict.insert(comm);
		dict.insert(mapping);

		let mut device = Device::new(&mut dispatcher, 5, dict, DeviceConfig::default()).unwrap();
		device.submit_command(NmtCommand::Start);
		device.reset_communication(&mut dispatcher, Instant::default()).unwrap();
		assert_eq!(device.services().rpdos().len(), 1);
	}

	#[test]
	fn apply_dcf_writes_into_the_device_dictionary() {
		let mut dispatcher = Dispatcher::new();
		let mut dict = dictionary_with_sdo_only(5);
		dict.insert(Object::new(HEARTBEAT_PRODUCER_TIME, ObjectCode::Var).insert(0, SubObject::new(AccessType::Rw, Value::U16(0))));
		let mut device = Device::new(&mut dispatcher, 5, dict, DeviceConfig::default()).unwrap();
		let buffer = dcf::encode(vec![dcf::DcfEntry { index: HEARTBEAT_PRODUCER_TIME, subidx: 0, data: &500u16.to_le_bytes() }]);
		let applied = device.apply_dcf(&buffer).unwrap();
		assert_eq!(applied, 1);
		let mut dictionary = device.dictionary();
		assert_eq!(dictionary.borrow_mut().read(HEARTBEAT_PRODUCER_TIME, 0, NmtState::Initialisation).unwrap(), Value::U16(500));
	}
}
