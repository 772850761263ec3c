//! TIME producer and consumer: the 6-byte CANopen TIME_OF_DAY message.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::time::{Duration, Instant};

/// Default COB-ID carrying the TIME message.
pub const DEFAULT_TIME_COB_ID: u32 = 0x100;

/// Number of days between the CANopen time epoch (1984-01-01) and the Unix epoch.
pub const CANOPEN_EPOCH_OFFSET_DAYS: u32 = 5113;

/// A CANopen TIME_OF_DAY value: milliseconds since local midnight and days since 1984-01-01.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimeOfDay {
	/// Milliseconds since midnight, `0..=0x05265C00` (28 bits).
	pub ms_since_midnight: u32,
	/// Days since 1984-01-01.
	pub days: u16,
}

impl TimeOfDay {
	/// Decode a `TimeOfDay` from its 6-byte wire representation.
	pub fn decode(data: &[u8; 6]) -> Self {
		let ms = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & 0x0FFF_FFFF;
		let days = u16::from_le_bytes([data[4], data[5]]);
		Self { ms_since_midnight: ms, days }
	}

	/// Encode this value to its 6-byte wire representation.
	pub fn encode(self) -> [u8; 6] {
		let ms = self.ms_since_midnight & 0x0FFF_FFFF;
		let ms_bytes = ms.to_le_bytes();
		let day_bytes = self.days.to_le_bytes();
		[ms_bytes[0], ms_bytes[1], ms_bytes[2], ms_bytes[3], day_bytes[0], day_bytes[1]]
	}
}

/// Transmits TIME on `cob_id` every `period`, deriving each message's value from a
/// host-supplied callback rather than reading a clock itself.
pub struct TimeProducer {
	timer: Option<TimerHandle>,
}

impl TimeProducer {
	/// Start producing TIME, calling `current_time` for the value of each message.
	pub fn start(
		dispatcher: &mut Dispatcher,
		cob_id: u32,
		period: Duration,
		now: Instant,
		mut current_time: impl FnMut(Instant) -> TimeOfDay + 'static,
	) -> Result<Self, DispatchError> {
		let deadline = now.checked_add(period).unwrap_or(now);
		let timer = dispatcher.register_timer(deadline, Some(period), move |now, dispatcher| {
			let value = current_time(now);
			if let Ok(frame) = Frame::new(cob_id, &value.encode()) {
				let _ = dispatcher.send(frame);
			}
		})?;
		Ok(Self { timer: Some(timer) })
	}

	/// Stop producing TIME, deregistering the underlying timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}
}

/// Watches for TIME on `cob_id`, handing every decoded value to a host callback.
///
/// The host is responsible for anything it wants to do with the value (correcting
/// a local clock, logging drift, and so on); this service only decodes the frame.
pub struct TimeConsumer {
	receiver: Option<ReceiverHandle>,
	last: Rc<RefCell<Option<TimeOfDay>>>,
}

impl TimeConsumer {
	/// Start consuming TIME on `cob_id`.
	pub fn start(dispatcher: &mut Dispatcher, cob_id: u32, mut on_time: impl FnMut(TimeOfDay) + 'static) -> Result<Self, DispatchError> {
		let last = Rc::new(RefCell::new(None));
		let last2 = last.clone();
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |frame, _dispatcher| {
			if frame.is_rtr() || frame.len() < 6 {
				return;
			}
			let mut buf = [0u8; 6];
			buf.copy_from_slice(&frame.data()[..6]);
			let value = TimeOfDay::decode(&buf);
			*last2.borrow_mut() = Some(value);
			on_time(value);
		})?;
		Ok(Self { receiver: Some(receiver), last })
	}

	/// The last value received, if any.
	pub fn last(&self) -> Option<TimeOfDay> {
		*self.last.borrow()
	}

	/// Stop consuming TIME, deregistering the underlying receiver.
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

	#[test]
	fn time_of_day_round_trips() {
		let value = TimeOfDay { ms_since_midnight: 12_345_678, days: 14_000 };
		assert_eq!(TimeOfDay::decode(&value.encode()), value);
	}

	#[test]
	fn producer_sends_callback_value_every_period() {
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let _producer = TimeProducer::start(&mut dispatcher, DEFAULT_TIME_COB_ID, Duration::from_millis(1000), Instant::default(), |now| {
			TimeOfDay { ms_since_midnight: now.as_nanos() as u32 / 1_000_000, days: 0 }
		})
		.unwrap();
		dispatcher.set_time(Instant::from_millis(1000));
		let frames = sent.borrow();
		let data: [u8; 6] = frames[0].data().try_into().unwrap();
		assert_eq!(TimeOfDay::decode(&data).ms_since_midnight, 1000);
	}

	#[test]
	fn consumer_decodes_and_reports_value() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(None));
		let seen2 = seen.clone();
		let consumer = TimeConsumer::start(&mut dispatcher, DEFAULT_TIME_COB_ID, move |value| *seen2.borrow_mut() = Some(value)).unwrap();
		let value = TimeOfDay { ms_since_midnight: 500, days: 1 };
		dispatcher.submit_frame(Frame::new(DEFAULT_TIME_COB_ID, &value.encode()).unwrap());
		assert_eq!(*seen.borrow(), Some(value));
		assert_eq!(consumer.last(), Some(value));
	}

	#[test]
	fn consumer_ignores_short_frame() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(false));
		let seen2 = seen.clone();
		let _consumer = TimeConsumer::start(&mut dispatcher, DEFAULT_TIME_COB_ID, move |_value| *seen2.borrow_mut() = true).unwrap();
		dispatcher.submit_frame(Frame::new(DEFAULT_TIME_COB_ID, &[1, 2, 3]).unwrap());
		assert!(!*seen.borrow());
	}
}
