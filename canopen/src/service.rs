//! Service composer: builds RPDO/TPDO/SDO/SYNC/TIME/EMCY/LSS/redundancy services
//! from object dictionary contents and a [`DeviceConfig`], and holds the per-device
//! service set within the cardinality limits CiA 301 allows.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::codec::Value;
use crate::dictionary::ObjectDictionary;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::emcy::{EmcyConsumer, EmcyProducer};
use crate::lss::{LssMaster, LssSlave};
use crate::nmt::NmtState;
use crate::pdo::{PdoError, PdoMapping, PdoStartError, Rpdo, RpdoTransmissionType, Tpdo, TpdoTransmissionType};
use crate::redundancy::RedundancyManager;
use crate::sdo::{SdoClient, SdoServer};
use crate::sync::{SyncConsumer, SyncProducer};
use crate::time::Duration;
use crate::time_stamp::{TimeConsumer, TimeProducer};

/// At most this many RPDOs per device.
pub const MAX_RPDO: usize = 128;
/// At most this many TPDOs per device.
pub const MAX_TPDO: usize = 128;
/// At most this many SDO servers per device.
pub const MAX_SDO_SERVER: usize = 128;
/// At most this many SDO clients per device.
pub const MAX_SDO_CLIENT: usize = 128;

/// Failure adding a service to a [`ServiceSet`].
#[derive(Debug, Error)]
pub enum ServiceSetError {
	/// The cardinality limit for this service kind was already reached.
	#[error("at most {max} {kind} services are supported per device")]
	CapacityExceeded {
		/// The kind of service that hit its limit, for diagnostics.
		kind: &'static str,
		/// The limit that was hit.
		max: usize,
	},
	/// Registering the service with the dispatcher failed.
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	/// Starting a PDO failed.
	#[error(transparent)]
	Pdo(#[from] PdoStartError),
}

/// The first RPDO/TPDO communication parameter object for PDO number `n` (0-based).
pub const fn rpdo_comm_index(n: u16) -> u16 {
	0x1400 + n
}

/// The RPDO mapping object for PDO number `n` (0-based).
pub const fn rpdo_mapping_index(n: u16) -> u16 {
	0x1600 + n
}

/// The TPDO communication parameter object for PDO number `n` (0-based).
pub const fn tpdo_comm_index(n: u16) -> u16 {
	0x1800 + n
}

/// The TPDO mapping object for PDO number `n` (0-based).
pub const fn tpdo_mapping_index(n: u16) -> u16 {
	0x1A00 + n
}

/// An RPDO's communication parameters, read from object `0x1400 + n`.
#[derive(Debug, Copy, Clone)]
pub struct RpdoCommParams {
	pub enabled: bool,
	pub cob_id: u32,
	pub mode: RpdoTransmissionType,
}

/// A TPDO's communication parameters, read from object `0x1800 + n`.
#[derive(Debug, Copy, Clone)]
pub struct TpdoCommParams {
	pub enabled: bool,
	pub cob_id: u32,
	pub rtr_allowed: bool,
	pub mode: TpdoTransmissionType,
	pub inhibit: Duration,
	pub event_timer: Duration,
}

fn read_u32(dict: &mut ObjectDictionary, index: u16, sub: u8, state: NmtState) -> Option<u32> {
	match dict.read(index, sub, state).ok()? {
		Value::U32(v) => Some(v),
		_ => None,
	}
}

fn read_u8(dict: &mut ObjectDictionary, index: u16, sub: u8, state: NmtState) -> Option<u8> {
	match dict.read(index, sub, state).ok()? {
		Value::U8(v) => Some(v),
		_ => None,
	}
}

fn read_u16(dict: &mut ObjectDictionary, index: u16, sub: u8, state: NmtState) -> Option<u16> {
	match dict.read(index, sub, state).ok()? {
		Value::U16(v) => Some(v),
		_ => None,
	}
}

/// Read an RPDO's communication parameters from `comm_index`, if the object exists.
pub fn read_rpdo_comm(dict: &mut ObjectDictionary, comm_index: u16, state: NmtState) -> Option<RpdoCommParams> {
	let cob_id_raw = read_u32(dict, comm_index, 1, state)?;
	let mode_raw = read_u8(dict, comm_index, 2, state).unwrap_or(0);
	Some(RpdoCommParams {
		enabled: cob_id_raw & (1 << 31) == 0,
		cob_id: cob_id_raw & 0x1FFF_FFFF,
		mode: RpdoTransmissionType::from_u8(mode_raw),
	})
}

/// Read a TPDO's communication parameters from `comm_index`, if the object exists.
pub fn read_tpdo_comm(dict: &mut ObjectDictionary, comm_index: u16, state: NmtState) -> Option<TpdoCommParams> {
	let cob_id_raw = read_u32(dict, comm_index, 1, state)?;
	let mode_raw = read_u8(dict, comm_index, 2, state).unwrap_or(0);
	let inhibit_raw = read_u16(dict, comm_index, 3, state).unwrap_or(0);
	let event_raw = read_u16(dict, comm_index, 5, state).unwrap_or(0);
	Some(TpdoCommParams {
		enabled: cob_id_raw & (1 << 31) == 0,
		cob_id: cob_id_raw & 0x1FFF_FFFF,
		rtr_allowed: cob_id_raw & (1 << 30) == 0,
		mode: TpdoTransmissionType::from_u8(mode_raw),
		inhibit: Duration::from_100us(inhibit_raw),
		event_timer: Duration::from_millis(event_raw as u64),
	})
}

/// Read a PDO mapping record from `mapping_index`: sub-index 0 gives the entry
/// count, sub-indices `1..=count` each hold one packed [`PdoMapping`] entry.
pub fn read_mapping(dict: &mut ObjectDictionary, mapping_index: u16, state: NmtState) -> Vec<PdoMapping> {
	let count = read_u8(dict, mapping_index, 0, state).unwrap_or(0);
	(1..=count).filter_map(|sub| read_u32(dict, mapping_index, sub, state).map(PdoMapping::from_u32)).collect()
}

/// The composed set of communication services bound to one device, subject to
/// the CiA 301 service-set cardinality limits.
#[derive(Default)]
pub struct ServiceSet {
	pub sync_producer: Option<SyncProducer>,
	pub sync_consumer: Option<SyncConsumer>,
	pub time_producer: Option<TimeProducer>,
	pub time_consumer: Option<TimeConsumer>,
	pub emcy_producer: Option<EmcyProducer>,
	pub emcy_consumer: Option<EmcyConsumer>,
	pub lss_slave: Option<LssSlave>,
	pub lss_master: Option<LssMaster>,
	pub redundancy: Option<RedundancyManager>,
	rpdos: Vec<Rpdo>,
	tpdos: Vec<Tpdo>,
	sdo_servers: Vec<SdoServer>,
	sdo_clients: Vec<SdoClient>,
}

impl ServiceSet {
	/// An empty service set with no services started.
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a started RPDO, rejecting it once [`MAX_RPDO`] is already in use.
	pub fn add_rpdo(&mut self, rpdo: Rpdo) -> Result<(), ServiceSetError> {
		if self.rpdos.len() >= MAX_RPDO {
			return Err(ServiceSetError::CapacityExceeded { kind: "RPDO", max: MAX_RPDO });
		}
		self.rpdos.push(rpdo);
		Ok(())
	}

	/// Add a started TPDO, rejecting it once [`MAX_TPDO`] is already in use.
	pub fn add_tpdo(&mut self, tpdo: Tpdo) -> Result<(), ServiceSetError> {
		if self.tpdos.len() >= MAX_TPDO {
			return Err(ServiceSetError::CapacityExceeded { kind: "TPDO", max: MAX_TPDO });
		}
		self.tpdos.push(tpdo);
		Ok(())
	}

	/// Add a started SDO server, rejecting it once [`MAX_SDO_SERVER`] is already in use.
	pub fn add_sdo_server(&mut self, server: SdoServer) -> Result<(), ServiceSetError> {
		if self.sdo_servers.len() >= MAX_SDO_SERVER {
			return Err(ServiceSetError::CapacityExceeded { kind: "SDO server", max: MAX_SDO_SERVER });
		}
		self.sdo_servers.push(server);
		Ok(())
	}

	/// Add a started SDO client, rejecting it once [`MAX_SDO_CLIENT`] is already in use.
	pub fn add_sdo_client(&mut self, client: SdoClient) -> Result<(), ServiceSetError> {
		if self.sdo_clients.len() >= MAX_SDO_CLIENT {
			return Err(ServiceSetError::CapacityExceeded { kind: "SDO client", max: MAX_SDO_CLIENT });
		}
		self.sdo_clients.push(client);
		Ok(())
	}

	/// The currently started RPDOs.
	pub fn rpdos(&self) -> &[Rpdo] {
		&self.rpdos
	}

	/// The currently started TPDOs, mutably (for [`Tpdo::notify_event`] after a dictionary write).
	pub fn tpdos_mut(&mut self) -> &mut [Tpdo] {
		&mut self.tpdos
	}

	/// The currently started SDO servers.
	pub fn sdo_servers(&self) -> &[SdoServer] {
		&self.sdo_servers
	}

	/// The currently started SDO clients.
	pub fn sdo_clients(&self) -> &[SdoClient] {
		&self.sdo_clients
	}

	/// Drive every synchronous TPDO from a received SYNC.
	pub fn on_sync(&mut self, dispatcher: &mut Dispatcher) {
		for tpdo in &mut self.tpdos {
			tpdo.on_sync(dispatcher);
		}
	}

	/// Tear down every service in this set, deregistering all receivers and timers.
	///
	/// Called on device shutdown and before rebuilding the PDO/SDO services
	/// across an NMT reset-communication.
	pub fn shutdown(&mut self, dispatcher: &mut Dispatcher) {
		for rpdo in &mut self.rpdos {
			rpdo.stop(dispatcher);
		}
		for tpdo in &mut self.tpdos {
			tpdo.stop(dispatcher);
		}
		for server in &mut self.sdo_servers {
			server.stop(dispatcher);
		}
		for client in &mut self.sdo_clients {
			client.stop(dispatcher);
		}
		self.rpdos.clear();
		self.tpdos.clear();
		self.sdo_servers.clear();
		self.sdo_clients.clear();

		if let Some(mut service) = self.sync_producer.take() {
			service.stop(dispatcher);
		}
		if let Some(mut service) = self.sync_consumer.take() {
			service.stop(dispatcher);
		}
		if let Some(mut service) = self.time_producer.take() {
			service.stop(dispatcher);
		}
		if let Some(mut service) = self.time_consumer.take() {
			service.stop(dispatcher);
		}
		if let Some(mut service) = self.emcy_producer.take() {
			service.stop(dispatcher);
		}
		if let Some(mut service) = self.emcy_consumer.take() {
			service.stop(dispatcher);
		}
		if let Some(mut service) = self.redundancy.take() {
			service.stop(dispatcher);
		}
		self.lss_slave = None;
		self.lss_master = None;
	}

	/// Build and add every enabled RPDO described by communication/mapping object
	/// pairs `0x1400+n`/`0x1600+n` for `n` in `0..count`, reporting per-PDO
	/// dictionary rejections through `on_error`.
	pub fn scan_rpdos(
		&mut self,
		dispatcher: &mut Dispatcher,
		count: u16,
		dictionary: Rc<RefCell<ObjectDictionary>>,
		nmt_state: Rc<RefCell<NmtState>>,
		on_error: impl FnMut(PdoError) + 'static + Clone,
	) -> Result<(), ServiceSetError> {
		let state = *nmt_state.borrow();
		for n in 0..count {
			let comm = {
				let mut dict = dictionary.borrow_mut();
				read_rpdo_comm(&mut dict, rpdo_comm_index(n), state)
			};
			let Some(comm) = comm else { continue };
			if !comm.enabled {
				continue;
			}
			let mapping = {
				let mut dict = dictionary.borrow_mut();
				read_mapping(&mut dict, rpdo_mapping_index(n), state)
			};
			let on_error = on_error.clone();
			let rpdo = Rpdo::start(dispatcher, comm.cob_id, mapping, dictionary.clone(), nmt_state.clone(), on_error)?;
			self.add_rpdo(rpdo)?;
		}
		Ok(())
	}

	/// Build and add every enabled TPDO described by communication/mapping object
	/// pairs `0x1800+n`/`0x1A00+n` for `n` in `0..count`.
	pub fn scan_tpdos(
		&mut self,
		dispatcher: &mut Dispatcher,
		count: u16,
		dictionary: Rc<RefCell<ObjectDictionary>>,
		nmt_state: Rc<RefCell<NmtState>>,
		now: crate::time::Instant,
	) -> Result<(), ServiceSetError> {
		let state = *nmt_state.borrow();
		for n in 0..count {
			let comm = {
				let mut dict = dictionary.borrow_mut();
				read_tpdo_comm(&mut dict, tpdo_comm_index(n), state)
			};
			let Some(comm) = comm else { continue };
			if !comm.enabled {
				continue;
			}
			let mapping = {
				let mut dict = dictionary.borrow_mut();
				read_mapping(&mut dict, tpdo_mapping_index(n), state)
			};
			let tpdo = Tpdo::start(
				dispatcher,
				comm.cob_id,
				mapping,
				comm.mode,
				comm.rtr_allowed,
				comm.inhibit,
				comm.event_timer,
				dictionary.clone(),
				nmt_state.clone(),
				now,
			)?;
			self.add_tpdo(tpdo)?;
		}
		Ok(())
	}
}
