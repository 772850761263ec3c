//! Bus redundancy manager: CAN-A/CAN-B selection driven by a missed heartbeat.
//!
//! This service tracks the redundancy *logic* only. Frames from either physical
//! bus are expected to already be merged onto the one [`Dispatcher`] the host
//! drives; actually energizing a transceiver in response to [`Self::start`]'s
//! `on_switch` callback is the host's job, the same way every other producer
//! here only decides what to send and leaves the write to the host.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::nmt::error_control_cob_id;
use crate::time::{Duration, Instant};

/// One of the two redundant CAN buses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Bus {
	A,
	B,
}

impl Bus {
	/// The other bus.
	pub fn other(self) -> Self {
		match self {
			Bus::A => Bus::B,
			Bus::B => Bus::A,
		}
	}
}

/// The redundancy configuration object: default bus, toggle delay factor, and
/// the number of unsuccessful toggles tolerated before giving up on the master.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RedundancyConfig {
	/// Bus used at startup and reverted to once `ntoggle` is exceeded.
	pub bdefault: Bus,
	/// Toggle timer runs for `master_hb * (ttoggle - 1)` past the missed heartbeat.
	pub ttoggle: u8,
	/// Consecutive unsuccessful switches tolerated before reverting and raising "no master".
	pub ntoggle: u8,
}

fn toggle_delay(master_hb: Duration, ttoggle: u8) -> Duration {
	let factor = ttoggle.saturating_sub(1) as u64;
	Duration::from_nanos(master_hb.as_nanos().saturating_mul(factor))
}

struct Shared {
	config: RedundancyConfig,
	master_node_id: u8,
	master_hb: Duration,
	active: Bus,
	/// Object 0x1F xx style toggle counter, incremented on every successful switch.
	ctoggle: u32,
	unsuccessful_switches: u8,
	heartbeat_timer: Option<TimerHandle>,
	toggle_timer: Option<TimerHandle>,
}

/// Manages the active bus, switching away from it when the redundancy master's
/// heartbeat goes quiet and reverting to the configured default once too many
/// switches in a row fail to restore it.
pub struct RedundancyManager {
	shared: Rc<RefCell<Shared>>,
	receiver: Option<ReceiverHandle>,
}

impl RedundancyManager {
	/// Start managing redundancy for the master at `master_node_id`, consuming its
	/// heartbeat at `master_hb`. `on_switch` reports the newly active bus and the
	/// updated toggle counter after every switch; `on_no_master` fires once
	/// `config.ntoggle` consecutive switches failed to bring the master back.
	pub fn start(
		dispatcher: &mut Dispatcher,
		config: RedundancyConfig,
		master_node_id: u8,
		master_hb: Duration,
		now: Instant,
		on_switch: impl FnMut(Bus, u32, &mut Dispatcher) + 'static,
		on_no_master: impl FnMut(&mut Dispatcher) + 'static,
	) -> Result<Self, DispatchError> {
		let shared = Rc::new(RefCell::new(Shared {
			config,
			master_node_id,
			master_hb,
			active: config.bdefault,
			ctoggle: 0,
			unsuccessful_switches: 0,
			heartbeat_timer: None,
			toggle_timer: None,
		}));
		let on_switch = Rc::new(RefCell::new(on_switch));
		let on_no_master = Rc::new(RefCell::new(on_no_master));

		let timer = Self::arm_heartbeat(dispatcher, &shared, &on_switch, &on_no_master, now)?;
		shared.borrow_mut().heartbeat_timer = Some(timer);

		let cob_id = error_control_cob_id(master_node_id);
		let recv_shared = shared.clone();
		let recv_on_switch = on_switch;
		let recv_on_no_master = on_no_master;
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |_frame, dispatcher| {
			let mut state = recv_shared.borrow_mut();
			if let Some(handle) = state.toggle_timer.take() {
				dispatcher.deregister_timer(handle);
			}
			if let Some(handle) = state.heartbeat_timer.take() {
				dispatcher.deregister_timer(handle);
			}
			state.unsuccessful_switches = 0;
			drop(state);
			let now = dispatcher.now();
			if let Ok(timer) = Self::arm_heartbeat(dispatcher, &recv_shared, &recv_on_switch, &recv_on_no_master, now) {
				recv_shared.borrow_mut().heartbeat_timer = Some(timer);
			}
		})?;

		Ok(Self { shared, receiver: Some(receiver) })
	}

	fn arm_heartbeat(
		dispatcher: &mut Dispatcher,
		shared: &Rc<RefCell<Shared>>,
		on_switch: &Rc<RefCell<impl FnMut(Bus, u32, &mut Dispatcher) + 'static>>,
		on_no_master: &Rc<RefCell<impl FnMut(&mut Dispatcher) + 'static>>,
		now: Instant,
	) -> Result<TimerHandle, DispatchError> {
		let master_hb = shared.borrow().master_hb;
		let shared = shared.clone();
		let on_switch = on_switch.clone();
		let on_no_master = on_no_master.clone();
		let deadline = now.checked_add(master_hb).unwrap_or(now);
		dispatcher.register_timer(deadline, None, move |now, dispatcher| {
			let ttoggle = shared.borrow().config.ttoggle;
			let master_hb = shared.borrow().master_hb;
			let delay = toggle_delay(master_hb, ttoggle);
			shared.borrow_mut().heartbeat_timer = None;
			if let Ok(timer) = Self::arm_toggle(dispatcher, &shared, &on_switch, &on_no_master, now, delay) {
				shared.borrow_mut().toggle_timer = Some(timer);
			}
		})
	}

	fn arm_toggle(
		dispatcher: &mut Dispatcher,
		shared: &Rc<RefCell<Shared>>,
		on_switch: &Rc<RefCell<impl FnMut(Bus, u32, &mut Dispatcher) + 'static>>,
		on_no_master: &Rc<RefCell<impl FnMut(&mut Dispatcher) + 'static>>,
		now: Instant,
		delay: Duration,
	) -> Result<TimerHandle, DispatchError> {
		let shared = shared.clone();
		let on_switch = on_switch.clone();
		let on_no_master = on_no_master.clone();
		let deadline = now.checked_add(delay).unwrap_or(now);
		dispatcher.register_timer(deadline, None, move |now, dispatcher| {
			let mut state = shared.borrow_mut();
			state.toggle_timer = None;
			state.active = state.active.other();
			state.ctoggle = state.ctoggle.wrapping_add(1);
			state.unsuccessful_switches += 1;
			let active = state.active;
			let ctoggle = state.ctoggle;
			let gave_up = state.unsuccessful_switches >= state.config.ntoggle;
			if gave_up {
				state.active = state.config.bdefault;
				state.unsuccessful_switches = 0;
			}
			drop(state);
			log::warn!("redundancy: master heartbeat missed, switching to {active:?} (ctoggle {ctoggle})");
			(on_switch.borrow_mut())(active, ctoggle, dispatcher);
			if gave_up {
				log::error!("redundancy: giving up after repeated failed switches, reverting to default bus");
				(on_no_master.borrow_mut())(dispatcher);
			}
			if let Ok(timer) = Self::arm_heartbeat(dispatcher, &shared, &on_switch, &on_no_master, now) {
				shared.borrow_mut().heartbeat_timer = Some(timer);
			}
		})
	}

	/// The currently active bus.
	pub fn active_bus(&self) -> Bus {
		self.shared.borrow().active
	}

	/// The current toggle counter, object 0x1F xx sub-index `ctoggle`.
	pub fn ctoggle(&self) -> u32 {
		self.shared.borrow().ctoggle
	}

	/// Stop managing redundancy, deregistering the receiver and any pending timers.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
		let mut state = self.shared.borrow_mut();
		if let Some(handle) = state.heartbeat_timer.take() {
			dispatcher.deregister_timer(handle);
		}
		if let Some(handle) = state.toggle_timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dispatcher::Dispatcher;
	use canopen_frame::Frame;

	fn config() -> RedundancyConfig {
		RedundancyConfig { bdefault: Bus::A, ttoggle: 2, ntoggle: 3 }
	}

	#[test]
	fn switches_bus_after_missed_heartbeat_and_toggle_window() {
		let mut dispatcher = Dispatcher::new();
		let switches = Rc::new(RefCell::new(Vec::new()));
		let switches2 = switches.clone();
		let _manager = RedundancyManager::start(
			&mut dispatcher,
			config(),
			9,
			Duration::from_millis(100),
			Instant::default(),
			move |bus, ctoggle, _d| switches2.borrow_mut().push((bus, ctoggle)),
			|_d| panic!("no master should not fire"),
		)
		.unwrap();
		// heartbeat misses at 100ms, toggle window is master_hb*(ttoggle-1) = 100ms, firing at 200ms.
		dispatcher.set_time(Instant::from_millis(200));
		assert_eq!(*switches.borrow(), vec![(Bus::B, 1)]);
	}

	#[test]
	fn heartbeat_reception_cancels_pending_toggle() {
		let mut dispatcher = Dispatcher::new();
		let switches = Rc::new(RefCell::new(Vec::new()));
		let switches2 = switches.clone();
		let _manager = RedundancyManager::start(
			&mut dispatcher,
			config(),
			9,
			Duration::from_millis(100),
			Instant::default(),
			move |bus, ctoggle, _d| switches2.borrow_mut().push((bus, ctoggle)),
			|_d| panic!("no master should not fire"),
		)
		.unwrap();
		dispatcher.set_time(Instant::from_millis(100));
		dispatcher.submit_frame(Frame::new(error_control_cob_id(9), &[0x05]).unwrap());
		dispatcher.set_time(Instant::from_millis(200));
		assert!(switches.borrow().is_empty());
	}

	#[test]
	fn reverts_to_default_and_raises_no_master_after_ntoggle_failures() {
		let mut dispatcher = Dispatcher::new();
		let no_master = Rc::new(RefCell::new(false));
		let no_master2 = no_master.clone();
		let active = Rc::new(RefCell::new(Vec::new()));
		let active2 = active.clone();
		let _manager = RedundancyManager::start(
			&mut dispatcher,
			config(),
			9,
			Duration::from_millis(100),
			Instant::default(),
			move |bus, _ctoggle, _d| active2.borrow_mut().push(bus),
			move |_d| *no_master2.borrow_mut() = true,
		)
		.unwrap();
		// three toggle cycles of 200ms each: 200, 400, 600.
		dispatcher.set_time(Instant::from_millis(200));
		dispatcher.set_time(Instant::from_millis(400));
		dispatcher.set_time(Instant::from_millis(600));
		assert_eq!(*active.borrow(), vec![Bus::B, Bus::A, Bus::B]);
		assert!(*no_master.borrow());
	}
}
