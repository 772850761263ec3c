//! EMCY producer, consumer, and the pre-defined error history ring buffer (object 0x1003).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::time::{Duration, Instant};

/// A decoded 8-byte EMCY message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EmcyMessage {
	/// The CiA 301 Annex B error code.
	pub error_code: u16,
	/// The error register, object 0x1001.
	pub error_register: u8,
	/// Manufacturer-specific additional data.
	pub manufacturer: [u8; 5],
}

impl EmcyMessage {
	/// Decode an `EmcyMessage` from its 8-byte wire representation.
	pub fn decode(data: &[u8; 8]) -> Self {
		let mut manufacturer = [0u8; 5];
		manufacturer.copy_from_slice(&data[3..8]);
		Self { error_code: u16::from_le_bytes([data[0], data[1]]), error_register: data[2], manufacturer }
	}

	/// Encode this message to its 8-byte wire representation.
	pub fn encode(self) -> [u8; 8] {
		let code = self.error_code.to_le_bytes();
		let mut data = [0u8; 8];
		data[0] = code[0];
		data[1] = code[1];
		data[2] = self.error_register;
		data[3..8].copy_from_slice(&self.manufacturer);
		data
	}

	/// The pre-defined error field entry (object 0x1003) this message contributes:
	/// the error code in the low 16 bits, the first two manufacturer bytes in the high 16.
	pub fn error_field(self) -> u32 {
		let additional = u16::from_le_bytes([self.manufacturer[0], self.manufacturer[1]]);
		(self.error_code as u32) | (additional as u32) << 16
	}
}

/// Bounded ring buffer of recent error field entries, backing object 0x1003.
///
/// Sub-index 0 reports the number of entries; sub-indices `1..=capacity` report
/// entries newest-first, matching the CiA 301 "pre-defined error field" layout.
pub struct EmcyHistory {
	entries: VecDeque<u32>,
	capacity: usize,
}

impl EmcyHistory {
	/// Create a history with room for `capacity` entries.
	pub fn new(capacity: usize) -> Self {
		Self { entries: VecDeque::with_capacity(capacity), capacity }
	}

	/// Record a new error, evicting the oldest entry if the history is full.
	pub fn push(&mut self, field: u32) {
		if self.entries.len() == self.capacity {
			self.entries.pop_back();
		}
		self.entries.push_front(field);
	}

	/// Clear the history, as object 0x1003 sub-index 0 being written `0` requests.
	pub fn clear(&mut self) {
		self.entries.clear();
	}

	/// The number of recorded entries.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the history is empty.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Entries newest-first, as read back through sub-indices `1..=len()`.
	pub fn entries(&self) -> impl Iterator<Item = u32> + '_ {
		self.entries.iter().copied()
	}
}

struct Shared {
	cob_id: u32,
	inhibit: Duration,
	last_sent: Option<Instant>,
	pending: VecDeque<EmcyMessage>,
	retry: Option<TimerHandle>,
}

/// Transmits EMCY on `cob_id`, pacing transmissions by an inhibit time.
///
/// Messages queued faster than the inhibit time allows are held and sent in order
/// once the window reopens, rather than dropped. A blocked queue rearms its own
/// one-shot timer to retry, the same way a TPDO's event timer re-drives itself.
pub struct EmcyProducer {
	shared: Rc<RefCell<Shared>>,
}

impl EmcyProducer {
	/// Create a producer transmitting on `cob_id`, pacing sends by `inhibit` (100us units).
	pub fn new(cob_id: u32, inhibit: Duration) -> Self {
		Self { shared: Rc::new(RefCell::new(Shared { cob_id, inhibit, last_sent: None, pending: VecDeque::new(), retry: None })) }
	}

	/// Queue an error for transmission, sending immediately if the inhibit window allows.
	pub fn queue(&mut self, dispatcher: &mut Dispatcher, message: EmcyMessage, now: Instant) {
		self.shared.borrow_mut().pending.push_back(message);
		Self::flush(&self.shared, dispatcher, now);
	}

	/// Drop any messages not yet sent.
	pub fn clear_pending(&mut self) {
		self.shared.borrow_mut().pending.clear();
	}

	/// Stop producing, deregistering any pending inhibit-retry timer and dropping the queue.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		let mut state = self.shared.borrow_mut();
		if let Some(handle) = state.retry.take() {
			dispatcher.deregister_timer(handle);
		}
		state.pending.clear();
	}

	fn flush(shared: &Rc<RefCell<Shared>>, dispatcher: &mut Dispatcher, now: Instant) {
		loop {
			let mut state = shared.borrow_mut();
			let message = match state.pending.front().copied() {
				Some(message) => message,
				None => return,
			};
			if let Some(last) = state.last_sent {
				if !state.inhibit.is_zero() && now.saturating_duration_since(last) < state.inhibit {
					if state.retry.is_none() {
						let deadline = last.checked_add(state.inhibit).unwrap_or(last);
						let retry_shared = shared.clone();
						drop(state);
						if let Ok(handle) = dispatcher.register_timer(deadline, None, move |now, dispatcher| {
							retry_shared.borrow_mut().retry = None;
							Self::flush(&retry_shared, dispatcher, now);
						}) {
							shared.borrow_mut().retry = Some(handle);
						}
					}
					return;
				}
			}
			let frame = Frame::new(state.cob_id, &message.encode());
			state.pending.pop_front();
			state.last_sent = Some(now);
			drop(state);
			if let Ok(frame) = frame {
				let _ = dispatcher.send(frame);
			}
		}
	}
}

/// Watches for EMCY on `cob_id`, handing every decoded message to a host callback.
pub struct EmcyConsumer {
	receiver: Option<ReceiverHandle>,
}

impl EmcyConsumer {
	/// Start consuming EMCY on `cob_id`.
	pub fn start(dispatcher: &mut Dispatcher, cob_id: u32, mut on_error: impl FnMut(EmcyMessage) + 'static) -> Result<Self, DispatchError> {
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |frame, _dispatcher| {
			if frame.is_rtr() || frame.len() < 8 {
				return;
			}
			let mut buf = [0u8; 8];
			buf.copy_from_slice(&frame.data()[..8]);
			on_error(EmcyMessage::decode(&buf));
		})?;
		Ok(Self { receiver: Some(receiver) })
	}

	/// Stop consuming EMCY, deregistering the underlying receiver.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn msg(code: u16) -> EmcyMessage {
		EmcyMessage { error_code: code, error_register: 0x01, manufacturer: [0; 5] }
	}

	#[test]
	fn message_round_trips() {
		let message = EmcyMessage { error_code: 0x1000, error_register: 0x04, manufacturer: [1, 2, 3, 4, 5] };
		assert_eq!(EmcyMessage::decode(&message.encode()), message);
	}

	#[test]
	fn history_evicts_oldest_when_full() {
		let mut history = EmcyHistory::new(2);
		history.push(1);
		history.push(2);
		history.push(3);
		assert_eq!(history.entries().collect::<Vec<_>>(), vec![3, 2]);
	}

	#[test]
	fn producer_sends_immediately_without_inhibit() {
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let mut producer = EmcyProducer::new(0x081, Duration::ZERO);
		producer.queue(&mut dispatcher, msg(0x2310), Instant::default());
		assert_eq!(sent.borrow().len(), 1);
	}

	#[test]
	fn producer_defers_second_message_until_inhibit_elapses() {
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let mut producer = EmcyProducer::new(0x081, Duration::from_millis(10));
		producer.queue(&mut dispatcher, msg(0x2310), Instant::from_millis(0));
		producer.queue(&mut dispatcher, msg(0x2320), Instant::from_millis(5));
		assert_eq!(sent.borrow().len(), 1);
		dispatcher.set_time(Instant::from_millis(10));
		assert_eq!(sent.borrow().len(), 2);
	}

	#[test]
	fn stop_cancels_pending_retry_and_clears_queue() {
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let mut producer = EmcyProducer::new(0x081, Duration::from_millis(10));
		producer.queue(&mut dispatcher, msg(0x2310), Instant::from_millis(0));
		producer.queue(&mut dispatcher, msg(0x2320), Instant::from_millis(5));
		assert_eq!(sent.borrow().len(), 1);
		producer.stop(&mut dispatcher);
		dispatcher.set_time(Instant::from_millis(10));
		assert_eq!(sent.borrow().len(), 1);
	}

	#[test]
	fn consumer_decodes_message() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(None));
		let seen2 = seen.clone();
		let _consumer = EmcyConsumer::start(&mut dispatcher, 0x081, move |message| *seen2.borrow_mut() = Some(message)).unwrap();
		dispatcher.submit_frame(Frame::new(0x081, &msg(0x5000).encode()).unwrap());
		assert_eq!(*seen.borrow(), Some(msg(0x5000)));
	}
}
