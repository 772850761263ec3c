//! Transmit PDO: mapped values sent on SYNC count, value-change event, event-timer, or RTR.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::dictionary::ObjectDictionary;
use crate::dispatcher::{Dispatcher, ReceiverHandle, TimerHandle};
use crate::nmt::NmtState;
use crate::pdo::error::PdoStartError;
use crate::pdo::mapping::{self, PdoMapping};
use crate::pdo::types::TpdoTransmissionType;
use crate::time::{Duration, Instant};

struct Shared {
	cob_id: u32,
	mapping: Vec<PdoMapping>,
	mode: TpdoTransmissionType,
	dictionary: Rc<RefCell<ObjectDictionary>>,
	nmt_state: Rc<RefCell<NmtState>>,
	inhibit: Duration,
	event_timer_period: Duration,
	sync_counter: u8,
	pending_event: bool,
	last_sent: Option<Instant>,
	event_timer: Option<TimerHandle>,
}

/// A single Transmit PDO.
///
/// Owns no receiver on the SYNC COB-ID itself: a SYNC consumer drives every
/// synchronous TPDO by calling [`Self::on_sync`], the same way one SYNC reception
/// fans out to many PDO counters on a real device.
pub struct Tpdo {
	shared: Rc<RefCell<Shared>>,
	rtr_receiver: Option<ReceiverHandle>,
}

impl Tpdo {
	/// Start a TPDO transmitting `mapping` read from `dictionary` on `cob_id`.
	///
	/// `inhibit` bounds the minimum spacing between two event-driven transmissions.
	/// `event_timer_period` (zero to disable) fires a transmission on schedule when
	/// the PDO is event-driven and otherwise idle. `rtr_allowed` answers a remote
	/// transmission request with the current mapped value regardless of mode.
	#[allow(clippy::too_many_arguments)]
	pub fn start(
		dispatcher: &mut Dispatcher,
		cob_id: u32,
		mapping: Vec<PdoMapping>,
		mode: TpdoTransmissionType,
		rtr_allowed: bool,
		inhibit: Duration,
		event_timer_period: Duration,
		dictionary: Rc<RefCell<ObjectDictionary>>,
		nmt_state: Rc<RefCell<NmtState>>,
		now: Instant,
	) -> Result<Self, PdoStartError> {
		mapping::validate(&mapping)?;
		let shared = Rc::new(RefCell::new(Shared {
			cob_id,
			mapping,
			mode,
			dictionary,
			nmt_state,
			inhibit,
			event_timer_period,
			sync_counter: 0,
			pending_event: false,
			last_sent: None,
			event_timer: None,
		}));

		let rtr_receiver = if rtr_allowed {
			let shared_for_rtr = shared.clone();
			Some(dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |frame, dispatcher| {
				if !frame.is_rtr() {
					return;
				}
				let now = dispatcher.now();
				Self::send_now(&shared_for_rtr, dispatcher, now);
			})?)
		} else {
			None
		};

		if mode.is_event_driven().is_some() && !event_timer_period.is_zero() {
			let timer = Self::arm_event_timer(dispatcher, &shared, now)?;
			shared.borrow_mut().event_timer = Some(timer);
		}

		Ok(Self { shared, rtr_receiver })
	}

	fn arm_event_timer(
		dispatcher: &mut Dispatcher,
		shared: &Rc<RefCell<Shared>>,
		now: Instant,
	) -> Result<TimerHandle, crate::dispatcher::DispatchError> {
		let period = shared.borrow().event_timer_period;
		let deadline = now.checked_add(period).unwrap_or(now);
		let shared = shared.clone();
		dispatcher.register_timer(deadline, Some(period), move |now, dispatcher| {
			Self::send_now(&shared, dispatcher, now);
		})
	}

	/// Drive this TPDO's SYNC-based triggers from a received SYNC frame.
	///
	/// Synchronous-acyclic (`0`) sends once on the first SYNC after a pending event;
	/// synchronous cyclic (`1..240`) sends every `N`-th SYNC.
	pub fn on_sync(&mut self, dispatcher: &mut Dispatcher) {
		let now = dispatcher.now();
		let should_send = {
			let mut state = self.shared.borrow_mut();
			if state.mode.is_sync_acyclic() {
				std::mem::replace(&mut state.pending_event, false)
			} else if let Some(interval) = state.mode.is_sync() {
				state.sync_counter = state.sync_counter.saturating_add(1);
				if state.sync_counter >= interval {
					state.sync_counter = 0;
					true
				} else {
					false
				}
			} else {
				false
			}
		};
		if should_send {
			Self::send_now(&self.shared, dispatcher, now);
		}
	}

	/// Notify this TPDO that a mapped value may have changed.
	///
	/// Event-driven TPDOs transmit immediately (subject to the inhibit window);
	/// synchronous-acyclic TPDOs instead remember the event until the next SYNC.
	pub fn notify_event(&mut self, dispatcher: &mut Dispatcher) {
		let now = dispatcher.now();
		let (event_driven, sync_acyclic) = {
			let state = self.shared.borrow();
			(state.mode.is_event_driven().is_some(), state.mode.is_sync_acyclic())
		};
		if event_driven {
			Self::send_now(&self.shared, dispatcher, now);
		} else if sync_acyclic {
			self.shared.borrow_mut().pending_event = true;
		}
	}

	fn send_now(shared: &Rc<RefCell<Shared>>, dispatcher: &mut Dispatcher, now: Instant) {
		let mut state = shared.borrow_mut();
		if *state.nmt_state.borrow() != NmtState::Operational {
			return;
		}
		if let Some(last) = state.last_sent {
			if now.saturating_duration_since(last) < state.inhibit {
				return;
			}
		}
		let cob_id = state.cob_id;
		let mapping = state.mapping.clone();
		let current_state = *state.nmt_state.borrow();
		let bytes = {
			let mut dict = state.dictionary.borrow_mut();
			match mapping::assemble(&mut dict, &mapping, current_state) {
				Ok(bytes) => bytes,
				Err(_) => return,
			}
		};
		if let Ok(frame) = Frame::new(cob_id, &bytes) {
			let _ = dispatcher.send(frame);
		}
		state.last_sent = Some(now);
		state.pending_event = false;
	}

	/// Stop this TPDO, deregistering its RTR receiver and event timer, if any.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.rtr_receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
		if let Some(handle) = self.shared.borrow_mut().event_timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}
