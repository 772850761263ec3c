//! Device- and service-level configuration knobs.
//!
//! Mirrors the split the teacher draws between `RpdoConfiguration` /
//! `TpdoConfiguration` communication parameters and their mapping: defaults
//! live here so the service composer has something to fall back on before
//! the dictionary carries explicit communication parameters.

/// Node-wide defaults consulted by the service composer.
#[derive(Copy, Clone, Debug)]
pub struct DeviceConfig {
	/// Timeout for an outstanding SDO transfer, in milliseconds.
	pub sdo_timeout_ms: u32,
	/// Heartbeat producer interval, in milliseconds. Zero disables the producer.
	pub heartbeat_ms: u16,
	/// Minimum spacing between NMT-master retries toward the same slave, in milliseconds.
	pub nmt_inhibit_ms: u16,
	/// SYNC counter overflow value. `0` means the SYNC payload carries no counter byte.
	pub sync_overflow: u8,
	/// Minimum spacing between two EMCY frames, in 100 microsecond units.
	pub emcy_inhibit_100us: u16,
	/// Minimum spacing between two event-driven TPDO transmissions, in 100 microsecond units.
	pub tpdo_inhibit_100us: u16,
	/// Event-timer period for TPDOs with transmission type 254/255, in milliseconds.
	pub tpdo_event_ms: u16,
}

impl Default for DeviceConfig {
	fn default() -> Self {
		Self {
			sdo_timeout_ms: 1000,
			heartbeat_ms: 0,
			nmt_inhibit_ms: 0,
			sync_overflow: 0,
			emcy_inhibit_100us: 0,
			tpdo_inhibit_100us: 0,
			tpdo_event_ms: 0,
		}
	}
}
