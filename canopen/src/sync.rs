//! SYNC producer and consumer.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::time::{Duration, Instant};

/// Default COB-ID carrying the SYNC message.
pub const DEFAULT_SYNC_COB_ID: u32 = 0x080;

/// Transmits SYNC on `cob_id` every `period`.
pub struct SyncProducer {
	timer: Option<TimerHandle>,
}

impl SyncProducer {
	/// Start producing SYNC. `overflow` of `0` sends a zero-length payload;
	/// `1..=240` sends a one-byte counter incrementing (wrapping to `1`) on every send.
	pub fn start(dispatcher: &mut Dispatcher, cob_id: u32, period: Duration, overflow: u8, now: Instant) -> Result<Self, DispatchError> {
		let counter = Rc::new(RefCell::new(0u8));
		let deadline = now.checked_add(period).unwrap_or(now);
		let timer = dispatcher.register_timer(deadline, Some(period), move |_now, dispatcher| {
			let frame = if overflow == 0 {
				Frame::new(cob_id, &[])
			} else {
				let mut value = counter.borrow_mut();
				*value = if *value >= overflow { 1 } else { *value + 1 };
				Frame::new(cob_id, &[*value])
			};
			if let Ok(frame) = frame {
				let _ = dispatcher.send(frame);
			}
		})?;
		Ok(Self { timer: Some(timer) })
	}

	/// Stop producing SYNC, deregistering the underlying timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}

struct ConsumerState {
	window: Duration,
	last_sync: Option<Instant>,
}

/// Watches for SYNC on `cob_id`, invoking `on_sync` to drive every synchronous PDO.
///
/// `window` (zero disables the check) bounds how long after a SYNC a synchronous
/// TPDO transmission remains valid. Since `on_sync` fans out to every driven PDO
/// inline with SYNC reception, the window is only meaningful for code that defers
/// a synchronous send past the reception callback and wants to consult
/// [`Self::within_window`] before transmitting late.
pub struct SyncConsumer {
	receiver: Option<ReceiverHandle>,
	state: Rc<RefCell<ConsumerState>>,
}

impl SyncConsumer {
	/// Start consuming SYNC on `cob_id`.
	pub fn start(
		dispatcher: &mut Dispatcher,
		cob_id: u32,
		window: Duration,
		mut on_sync: impl FnMut(Instant, &mut Dispatcher) + 'static,
	) -> Result<Self, DispatchError> {
		let state = Rc::new(RefCell::new(ConsumerState { window, last_sync: None }));
		let recv_state = state.clone();
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |_frame, dispatcher| {
			let now = dispatcher.now();
			recv_state.borrow_mut().last_sync = Some(now);
			on_sync(now, dispatcher);
		})?;
		Ok(Self { receiver: Some(receiver), state })
	}

	/// The time of the last received SYNC, if any.
	pub fn last_sync(&self) -> Option<Instant> {
		self.state.borrow().last_sync
	}

	/// Whether `now` still falls within the configured window of the last SYNC.
	///
	/// Always `true` when no window was configured or no SYNC has been seen yet.
	pub fn within_window(&self, now: Instant) -> bool {
		let state = self.state.borrow();
		if state.window.is_zero() {
			return true;
		}
		match state.last_sync {
			Some(last) => now.saturating_duration_since(last) <= state.window,
			None => true,
		}
	}

	/// Stop consuming SYNC, deregistering the underlying receiver.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::dispatcher::Dispatcher;

	fn capture(dispatcher: &mut Dispatcher) -> Rc<RefCell<Vec<Frame>>> {
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		sent
	}

	#[test]
	fn producer_sends_zero_length_frame_without_overflow() {
		let mut dispatcher = Dispatcher::new();
		let sent = capture(&mut dispatcher);
		let _producer = SyncProducer::start(&mut dispatcher, DEFAULT_SYNC_COB_ID, Duration::from_millis(10), 0, Instant::default()).unwrap();
		dispatcher.set_time(Instant::from_millis(10));
		assert_eq!(sent.borrow()[0].data(), &[] as &[u8]);
	}

	#[test]
	fn producer_counter_wraps_at_overflow() {
		let mut dispatcher = Dispatcher::new();
		let sent = capture(&mut dispatcher);
		let _producer = SyncProducer::start(&mut dispatcher, DEFAULT_SYNC_COB_ID, Duration::from_millis(10), 2, Instant::default()).unwrap();
		dispatcher.set_time(Instant::from_millis(10));
		dispatcher.set_time(Instant::from_millis(20));
		dispatcher.set_time(Instant::from_millis(30));
		let frames = sent.borrow();
		assert_eq!(frames[0].data(), &[1]);
		assert_eq!(frames[1].data(), &[2]);
		assert_eq!(frames[2].data(), &[1]);
	}

	#[test]
	fn consumer_invokes_callback_and_tracks_last_sync() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(0u32));
		let seen2 = seen.clone();
		let consumer =
			SyncConsumer::start(&mut dispatcher, DEFAULT_SYNC_COB_ID, Duration::ZERO, move |_now, _d| *seen2.borrow_mut() += 1).unwrap();
		dispatcher.submit_frame(Frame::new(DEFAULT_SYNC_COB_ID, &[]).unwrap());
		assert_eq!(*seen.borrow(), 1);
		assert_eq!(consumer.last_sync(), Some(Instant::default()));
	}

	#[test]
	fn within_window_reports_false_once_elapsed() {
		let mut dispatcher = Dispatcher::new();
		let consumer = SyncConsumer::start(&mut dispatcher, DEFAULT_SYNC_COB_ID, Duration::from_millis(5), |_now, _d| {}).unwrap();
		dispatcher.submit_frame(Frame::new(DEFAULT_SYNC_COB_ID, &[]).unwrap());
		assert!(consumer.within_window(Instant::from_millis(3)));
		assert!(!consumer.within_window(Instant::from_millis(10)));
	}
}
