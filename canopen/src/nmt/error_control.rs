//! Heartbeat and node-guarding: the two (mutually exclusive) liveness mechanisms.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::nmt::error::NmtError;
use crate::nmt::state::NmtState;
use crate::time::{Duration, Instant};

/// The COB-ID used for both the heartbeat/node-guard producer and its consumer, for `node_id`.
pub const fn error_control_cob_id(node_id: u8) -> u32 {
	0x700 + node_id as u32
}

/// Transmits `{state}` on `0x700 + node_id` at a fixed interval.
pub struct HeartbeatProducer {
	timer: Option<TimerHandle>,
}

impl HeartbeatProducer {
	/// Start producing heartbeats for `node_id` reporting `state`'s current value every `interval`.
	pub fn start(
		dispatcher: &mut Dispatcher,
		node_id: u8,
		state: Rc<RefCell<NmtState>>,
		interval: Duration,
		now: Instant,
	) -> Result<Self, DispatchError> {
		let deadline = now.checked_add(interval).unwrap_or(now);
		let cob_id = error_control_cob_id(node_id);
		let timer = dispatcher.register_timer(deadline, Some(interval), move |_now, dispatcher| {
			let byte = u8::from(*state.borrow());
			if let Ok(frame) = Frame::new(cob_id, &[byte]) {
				let _ = dispatcher.send(frame);
			}
		})?;
		Ok(Self { timer: Some(timer) })
	}

	/// Stop producing heartbeats, deregistering the underlying timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}

struct ConsumerState {
	node_id: u8,
	interval: Duration,
	timer: Option<TimerHandle>,
}

/// Watches a remote node's heartbeat producer; calls back if `interval` elapses
/// without a frame.
pub struct HeartbeatConsumer {
	receiver: Option<ReceiverHandle>,
	state: Rc<RefCell<ConsumerState>>,
}

impl HeartbeatConsumer {
	/// Start monitoring `node_id`, invoking `on_failure` if no heartbeat arrives within `interval`.
	pub fn start(
		dispatcher: &mut Dispatcher,
		node_id: u8,
		interval: Duration,
		now: Instant,
		on_failure: impl FnMut(NmtError, &mut Dispatcher) + 'static,
	) -> Result<Self, DispatchError> {
		let state = Rc::new(RefCell::new(ConsumerState { node_id, interval, timer: None }));
		let on_failure = Rc::new(RefCell::new(on_failure));

		let timer = Self::arm(dispatcher, &state, &on_failure, now)?;
		state.borrow_mut().timer = Some(timer);

		let cob_id = error_control_cob_id(node_id);
		let recv_state = state.clone();
		let recv_failure = on_failure;
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |_frame, dispatcher| {
			if let Some(handle) = recv_state.borrow_mut().timer.take() {
				dispatcher.deregister_timer(handle);
			}
			let now = dispatcher.now();
			if let Ok(timer) = Self::arm(dispatcher, &recv_state, &recv_failure, now) {
				recv_state.borrow_mut().timer = Some(timer);
			}
		})?;

		Ok(Self { receiver: Some(receiver), state })
	}

	fn arm(
		dispatcher: &mut Dispatcher,
		state: &Rc<RefCell<ConsumerState>>,
		on_failure: &Rc<RefCell<impl FnMut(NmtError, &mut Dispatcher) + 'static>>,
		now: Instant,
	) -> Result<TimerHandle, DispatchError> {
		let interval = state.borrow().interval;
		let node_id = state.borrow().node_id;
		let on_failure = on_failure.clone();
		let deadline = now.checked_add(interval).unwrap_or(now);
		dispatcher.register_timer(deadline, None, move |_now, dispatcher| {
			(on_failure.borrow_mut())(NmtError::HeartbeatFailed { node_id }, dispatcher);
		})
	}

	/// Stop monitoring, deregistering both the receiver and any pending timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
		if let Some(handle) = self.state.borrow_mut().timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}

/// Answers a node-guarding RTR on `0x700 + node_id` with `{toggle<<7 | state}`,
/// flipping the toggle bit on every reply.
pub struct NodeGuardResponder {
	receiver: Option<ReceiverHandle>,
}

impl NodeGuardResponder {
	/// Start answering guard requests for `node_id`, reporting `state`'s current value.
	pub fn start(dispatcher: &mut Dispatcher, node_id: u8, state: Rc<RefCell<NmtState>>) -> Result<Self, DispatchError> {
		let toggle = Rc::new(RefCell::new(false));
		let cob_id = error_control_cob_id(node_id);
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |frame, dispatcher| {
			if !frame.is_rtr() {
				return;
			}
			let mut toggle_bit = toggle.borrow_mut();
			let byte = u8::from(*state.borrow()) | ((*toggle_bit as u8) << 7);
			*toggle_bit = !*toggle_bit;
			drop(toggle_bit);
			if let Ok(reply) = Frame::new(cob_id, &[byte]) {
				let _ = dispatcher.send(reply);
			}
		})?;
		Ok(Self { receiver: Some(receiver) })
	}

	/// Stop answering guard requests.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

struct GuardMasterState {
	node_id: u8,
	guard_time: Duration,
	life_time_factor: u8,
	misses: u8,
	timer: Option<TimerHandle>,
}

/// Polls a slave with a guarding RTR every `guard_time`; raises "life guarding" after
/// `life_time_factor` consecutive windows pass with no response.
pub struct NodeGuardMaster {
	receiver: Option<ReceiverHandle>,
	state: Rc<RefCell<GuardMasterState>>,
}

impl NodeGuardMaster {
	/// Start guarding `node_id`.
	pub fn start(
		dispatcher: &mut Dispatcher,
		node_id: u8,
		guard_time: Duration,
		life_time_factor: u8,
		now: Instant,
		on_failure: impl FnMut(NmtError, &mut Dispatcher) + 'static,
	) -> Result<Self, DispatchError> {
		let state = Rc::new(RefCell::new(GuardMasterState { node_id, guard_time, life_time_factor, misses: 0, timer: None }));
		let on_failure = Rc::new(RefCell::new(on_failure));

		let cob_id = error_control_cob_id(node_id);
		let recv_state = state.clone();
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |_frame, _dispatcher| {
			recv_state.borrow_mut().misses = 0;
		})?;

		let timer = Self::poll(dispatcher, &state, &on_failure, now)?;
		state.borrow_mut().timer = Some(timer);

		Ok(Self { receiver: Some(receiver), state })
	}

	fn poll(
		dispatcher: &mut Dispatcher,
		state: &Rc<RefCell<GuardMasterState>>,
		on_failure: &Rc<RefCell<impl FnMut(NmtError, &mut Dispatcher) + 'static>>,
		now: Instant,
	) -> Result<TimerHandle, DispatchError> {
		let guard_time = state.borrow().guard_time;
		let state = state.clone();
		let on_failure = on_failure.clone();
		let deadline = now.checked_add(guard_time).unwrap_or(now);
		dispatcher.register_timer(deadline, None, move |now, dispatcher| {
			let node_id = state.borrow().node_id;
			let cob_id = error_control_cob_id(node_id);
			if let Ok(rtr) = Frame::new_rtr(cob_id, 1) {
				let _ = dispatcher.send(rtr);
			}
			let mut inner = state.borrow_mut();
			inner.misses += 1;
			let failed = inner.misses >= inner.life_time_factor;
			drop(inner);
			if failed {
				(on_failure.borrow_mut())(NmtError::LifeGuardingFailed { node_id }, dispatcher);
			}
			if let Ok(next) = Self::poll(dispatcher, &state, &on_failure, now) {
				state.borrow_mut().timer = Some(next);
			}
		})
	}

	/// Stop guarding, deregistering the receiver and any pending timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
		if let Some(handle) = self.state.borrow_mut().timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dispatcher::Dispatcher;

	#[test]
	fn producer_transmits_current_state_on_schedule() {
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let state = Rc::new(RefCell::new(NmtState::PreOperational));
		let _producer =
			HeartbeatProducer::start(&mut dispatcher, 5, state, Duration::from_millis(100), Instant::default()).unwrap();
		dispatcher.set_time(Instant::from_millis(100));
		let frames = sent.borrow();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].id().as_u32(), 0x705);
		assert_eq!(frames[0].data(), &[0x7F]);
	}

	#[test]
	fn consumer_reports_failure_after_missed_interval() {
		let mut dispatcher = Dispatcher::new();
		let failed = Rc::new(RefCell::new(None));
		let failed2 = failed.clone();
		let _consumer = HeartbeatConsumer::start(&mut dispatcher, 5, Duration::from_millis(100), Instant::default(), move |err, _d| {
			*failed2.borrow_mut() = Some(err);
		})
		.unwrap();
		dispatcher.set_time(Instant::from_millis(100));
		assert!(matches!(*failed.borrow(), Some(NmtError::HeartbeatFailed { node_id: 5 })));
	}

	#[test]
	fn consumer_resets_timer_on_received_frame() {
		let mut dispatcher = Dispatcher::new();
		let failed = Rc::new(RefCell::new(false));
		let failed2 = failed.clone();
		let _consumer = HeartbeatConsumer::start(&mut dispatcher, 5, Duration::from_millis(100), Instant::default(), move |_node, _d| {
			*failed2.borrow_mut() = true;
		})
		.unwrap();
		dispatcher.set_time(Instant::from_millis(60));
		dispatcher.submit_frame(Frame::new(0x705, &[0x05]).unwrap());
		dispatcher.set_time(Instant::from_millis(150));
		assert!(!*failed.borrow());
		dispatcher.set_time(Instant::from_millis(161));
		assert!(*failed.borrow());
	}
}
