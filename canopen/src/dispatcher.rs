//! CAN frame dispatch and timer scheduling.
//!
//! The dispatcher is the one piece of the core that touches every inbound
//! frame and every clock tick. It owns no socket and reads no clock itself;
//! the host calls [`Dispatcher::submit_frame`] and [`Dispatcher::set_time`].
//! Everything else in this crate is a receiver or a timer registered here.
//!
//! Receiver and timer callbacks are handed `&mut Dispatcher`, so a service
//! can register further receivers/timers or emit frames from within its own
//! callback. New registrations take effect immediately for anything dispatched
//! afterwards; deregistration of the slot currently being invoked is instead
//! deferred until the current dispatch pass finishes, so a callback can never
//! invalidate the slot the dispatcher is presently iterating over.

use std::collections::BinaryHeap;

use canopen_frame::Frame;
use thiserror::Error;

use crate::time::{Duration, Instant};

/// Errors the dispatcher itself can report.
#[derive(Debug, Error)]
pub enum DispatchError {
	/// The host's send callback refused or failed to transmit a frame.
	#[error("bus send failed: {0}")]
	Send(String),
	/// A receiver or timer could not be registered because the allocator refused the request.
	#[error("out of memory registering a receiver or timer")]
	OutOfMemory,
}

/// An opaque handle to a registered receiver, returned by [`Dispatcher::register_receiver`].
///
/// Carries a generation so that deregistering a stale handle after its slot
/// has been reused is a silent no-op rather than touching the wrong receiver.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ReceiverHandle {
	index: usize,
	generation: u32,
}

/// An opaque handle to a registered timer, returned by [`Dispatcher::register_timer`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TimerHandle {
	index: usize,
	generation: u32,
}

type ReceiverCallback = Box<dyn FnMut(&Frame, &mut Dispatcher)>;
type TimerCallback = Box<dyn FnMut(Instant, &mut Dispatcher)>;

struct ReceiverSlot {
	generation: u32,
	entry: Option<ReceiverEntry>,
}

struct ReceiverEntry {
	id: u32,
	mask: u32,
	extended: bool,
	priority: i32,
	callback: ReceiverCallback,
}

struct TimerSlot {
	generation: u32,
	entry: Option<TimerEntry>,
}

struct TimerEntry {
	deadline: Instant,
	period: Option<Duration>,
	insertion_seq: u64,
	callback: TimerCallback,
}

#[derive(Copy, Clone, Eq, PartialEq)]
struct HeapKey {
	deadline: Instant,
	insertion_seq: u64,
	index: usize,
	generation: u32,
}

impl Ord for HeapKey {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		// BinaryHeap is a max-heap; we want the earliest deadline first, so reverse.
		other.deadline.cmp(&self.deadline).then_with(|| other.insertion_seq.cmp(&self.insertion_seq))
	}
}

impl PartialOrd for HeapKey {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

enum Mutation {
	RemoveReceiver(ReceiverHandle),
	RemoveTimer(TimerHandle),
}

/// Routes inbound frames to registered receivers and fires due timers.
pub struct Dispatcher {
	receivers: Vec<ReceiverSlot>,
	free_receivers: Vec<usize>,
	timers: Vec<TimerSlot>,
	free_timers: Vec<usize>,
	timer_heap: BinaryHeap<HeapKey>,
	now: Instant,
	next_insertion_seq: u64,
	send: Option<Box<dyn FnMut(Frame) -> Result<(), DispatchError>>>,
	on_next_timer: Option<Box<dyn FnMut(Option<Instant>)>>,
	dispatching: bool,
	pending: Vec<Mutation>,
}

impl Default for Dispatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl Dispatcher {
	/// Create an empty dispatcher with no registered receivers or timers.
	pub fn new() -> Self {
		Self {
			receivers: Vec::new(),
			free_receivers: Vec::new(),
			timers: Vec::new(),
			free_timers: Vec::new(),
			timer_heap: BinaryHeap::new(),
			now: Instant::default(),
			next_insertion_seq: 0,
			send: None,
			on_next_timer: None,
			dispatching: false,
			pending: Vec::new(),
		}
	}

	/// Install the callback used to transmit outbound frames.
	pub fn set_send_callback(&mut self, callback: impl FnMut(Frame) -> Result<(), DispatchError> + 'static) {
		self.send = Some(Box::new(callback));
	}

	/// Install the callback notified whenever the earliest pending timer deadline changes.
	pub fn set_next_timer_callback(&mut self, callback: impl FnMut(Option<Instant>) + 'static) {
		self.on_next_timer = Some(Box::new(callback));
	}

	/// Register a frame receiver matching `(frame.id XOR id) & mask == 0` with the given IDE sense.
	///
	/// Lower `priority` values are invoked first when several receivers match the same frame.
	pub fn register_receiver(
		&mut self,
		id: u32,
		mask: u32,
		extended: bool,
		priority: i32,
		callback: impl FnMut(&Frame, &mut Dispatcher) + 'static,
	) -> Result<ReceiverHandle, DispatchError> {
		let entry = ReceiverEntry { id, mask, extended, priority, callback: Box::new(callback) };
		if let Some(index) = self.free_receivers.pop() {
			let slot = &mut self.receivers[index];
			slot.entry = Some(entry);
			return Ok(ReceiverHandle { index, generation: slot.generation });
		}
		self.receivers.try_reserve(1).map_err(|_| DispatchError::OutOfMemory)?;
		let index = self.receivers.len();
		self.receivers.push(ReceiverSlot { generation: 0, entry: Some(entry) });
		Ok(ReceiverHandle { index, generation: 0 })
	}

	/// Remove a previously registered receiver.
	///
	/// A no-op if `handle` refers to an already-removed or stale slot. Called
	/// from within a dispatch pass, the removal is applied after the pass
	/// completes.
	pub fn deregister_receiver(&mut self, handle: ReceiverHandle) {
		if self.dispatching {
			self.pending.push(Mutation::RemoveReceiver(handle));
		} else {
			self.remove_receiver_now(handle);
		}
	}

	fn remove_receiver_now(&mut self, handle: ReceiverHandle) {
		if let Some(slot) = self.receivers.get_mut(handle.index) {
			if slot.generation == handle.generation && slot.entry.is_some() {
				slot.entry = None;
				slot.generation = slot.generation.wrapping_add(1);
				self.free_receivers.push(handle.index);
			}
		}
	}

	/// Register a one-shot or periodic timer.
	///
	/// `period` of `None` makes the timer fire exactly once.
	pub fn register_timer(
		&mut self,
		deadline: Instant,
		period: Option<Duration>,
		callback: impl FnMut(Instant, &mut Dispatcher) + 'static,
	) -> Result<TimerHandle, DispatchError> {
		self.timer_heap.try_reserve(1).map_err(|_| DispatchError::OutOfMemory)?;
		let insertion_seq = self.next_insertion_seq;
		self.next_insertion_seq += 1;
		let entry = TimerEntry { deadline, period, insertion_seq, callback: Box::new(callback) };
		let handle = if let Some(index) = self.free_timers.pop() {
			let slot = &mut self.timers[index];
			slot.entry = Some(entry);
			TimerHandle { index, generation: slot.generation }
		} else {
			self.timers.try_reserve(1).map_err(|_| DispatchError::OutOfMemory)?;
			let index = self.timers.len();
			self.timers.push(TimerSlot { generation: 0, entry: Some(entry) });
			TimerHandle { index, generation: 0 }
		};
		self.timer_heap.push(HeapKey { deadline, insertion_seq, index: handle.index, generation: handle.generation });
		self.notify_next_timer();
		Ok(handle)
	}

	/// Remove a previously registered timer.
	pub fn deregister_timer(&mut self, handle: TimerHandle) {
		if self.dispatching {
			self.pending.push(Mutation::RemoveTimer(handle));
		} else {
			self.remove_timer_now(handle);
		}
	}

	fn remove_timer_now(&mut self, handle: TimerHandle) {
		if let Some(slot) = self.timers.get_mut(handle.index) {
			if slot.generation == handle.generation && slot.entry.is_some() {
				slot.entry = None;
				slot.generation = slot.generation.wrapping_add(1);
				self.free_timers.push(handle.index);
			}
		}
		self.notify_next_timer();
	}

	/// The dispatcher's current notion of time, as of the last [`Self::set_time`] call.
	pub fn now(&self) -> Instant {
		self.now
	}

	/// Submit a received frame for dispatch to matching receivers.
	///
	/// Receivers are invoked in ascending priority order among those that
	/// match; the IDE sense of the frame's identifier must agree with the
	/// receiver's registered sense.
	pub fn submit_frame(&mut self, frame: Frame) {
		let frame_id = frame.id().as_u32();
		let frame_extended = frame.is_extended();
		log::trace!("dispatching frame 0x{frame_id:04X} ({} bytes)", frame.len());

		let mut matches: Vec<(usize, u32)> = self
			.receivers
			.iter()
			.enumerate()
			.filter_map(|(index, slot)| {
				let entry = slot.entry.as_ref()?;
				if entry.extended == frame_extended && (frame_id ^ entry.id) & entry.mask == 0 {
					Some((index, slot.generation))
				} else {
					None
				}
			})
			.collect();
		matches.sort_by_key(|&(index, _)| self.receivers[index].entry.as_ref().map(|e| e.priority).unwrap_or(i32::MAX));

		self.dispatching = true;
		for (index, generation) in matches {
			let slot = &mut self.receivers[index];
			if slot.generation != generation || slot.entry.is_none() {
				continue;
			}
			let mut entry = slot.entry.take().unwrap();
			(entry.callback)(&frame, self);
			let slot = &mut self.receivers[index];
			if slot.generation == generation {
				slot.entry = Some(entry);
			}
		}
		self.dispatching = false;
		self.apply_pending();
	}

	/// Advance the dispatcher's clock, firing every timer whose deadline has passed.
	pub fn set_time(&mut self, now: Instant) {
		self.now = now;
		self.dispatching = true;
		loop {
			let due = match self.timer_heap.peek() {
				Some(key) if key.deadline <= now => self.timer_heap.pop().unwrap(),
				_ => break,
			};
			let slot = &mut self.timers[due.index];
			if slot.generation != due.generation || slot.entry.is_none() {
				continue;
			}
			// Take the callback out so a re-entrant registration can't alias it, then call it.
			let mut entry = slot.entry.take().unwrap();
			(entry.callback)(now, self);
			match entry.period {
				Some(period) if !period.is_zero() => {
					let mut deadline = entry.deadline;
					loop {
						deadline = match deadline.checked_add(period) {
							Some(next) => next,
							None => break,
						};
						if deadline > now {
							break;
						}
					}
					entry.deadline = deadline;
					let insertion_seq = self.next_insertion_seq;
					self.next_insertion_seq += 1;
					entry.insertion_seq = insertion_seq;
					self.timer_heap.push(HeapKey { deadline, insertion_seq, index: due.index, generation: due.generation });
					self.timers[due.index].entry = Some(entry);
				}
				_ => {
					self.timers[due.index].entry = None;
					self.timers[due.index].generation = due.generation.wrapping_add(1);
					self.free_timers.push(due.index);
				}
			}
		}
		self.dispatching = false;
		self.apply_pending();
		self.notify_next_timer();
	}

	/// Emit a frame through the host send callback, if one is installed.
	pub fn send(&mut self, frame: Frame) -> Result<(), DispatchError> {
		match self.send.take() {
			Some(mut send) => {
				let result = send(frame);
				self.send = Some(send);
				if let Err(ref err) = result {
					log::warn!("bus send failed: {err}");
				}
				result
			}
			None => Ok(()),
		}
	}

	fn apply_pending(&mut self) {
		if self.pending.is_empty() {
			return;
		}
		let pending = std::mem::take(&mut self.pending);
		for mutation in pending {
			match mutation {
				Mutation::RemoveReceiver(handle) => self.remove_receiver_now(handle),
				Mutation::RemoveTimer(handle) => self.remove_timer_now(handle),
			}
		}
	}

	fn notify_next_timer(&mut self) {
		// Skip over stale heap entries without popping them permanently: they are
		// dropped lazily the next time `set_time` walks past their deadline.
		let mut deadline = None;
		for key in self.timer_heap.iter() {
			let slot = &self.timers[key.index];
			if slot.generation == key.generation && slot.entry.is_some() {
				deadline = Some(match deadline {
					Some(current) if current < key.deadline => current,
					_ => key.deadline,
				});
			}
		}
		if let Some(mut callback) = self.on_next_timer.take() {
			callback(deadline);
			self.on_next_timer = Some(callback);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::cell::RefCell;
	use std::rc::Rc;

	#[test]
	fn matching_receiver_sees_frame() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(false));
		let seen2 = seen.clone();
		dispatcher.register_receiver(0x181, 0x7FF, false, 0, move |_frame, _d| *seen2.borrow_mut() = true).unwrap();
		dispatcher.submit_frame(Frame::new(0x181, &[1, 2, 3]).unwrap());
		assert!(*seen.borrow());
	}

	#[test]
	fn non_matching_receiver_is_skipped() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(false));
		let seen2 = seen.clone();
		dispatcher.register_receiver(0x181, 0x7FF, false, 0, move |_frame, _d| *seen2.borrow_mut() = true).unwrap();
		dispatcher.submit_frame(Frame::new(0x182, &[]).unwrap());
		assert!(!*seen.borrow());
	}

	#[test]
	fn receivers_fire_in_priority_order() {
		let mut dispatcher = Dispatcher::new();
		let order = Rc::new(RefCell::new(Vec::new()));
		let o1 = order.clone();
		let o2 = order.clone();
		dispatcher.register_receiver(0x181, 0x7FF, false, 5, move |_, _d| o1.borrow_mut().push(5)).unwrap();
		dispatcher.register_receiver(0x181, 0x7FF, false, 1, move |_, _d| o2.borrow_mut().push(1)).unwrap();
		dispatcher.submit_frame(Frame::new(0x181, &[]).unwrap());
		assert_eq!(*order.borrow(), vec![1, 5]);
	}

	#[test]
	fn deregistered_receiver_no_longer_fires() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(RefCell::new(false));
		let seen2 = seen.clone();
		let handle = dispatcher.register_receiver(0x181, 0x7FF, false, 0, move |_, _d| *seen2.borrow_mut() = true).unwrap();
		dispatcher.deregister_receiver(handle);
		dispatcher.submit_frame(Frame::new(0x181, &[]).unwrap());
		assert!(!*seen.borrow());
	}

	#[test]
	fn receiver_can_register_a_timer_from_within_its_callback() {
		let mut dispatcher = Dispatcher::new();
		let fired = Rc::new(RefCell::new(false));
		let fired2 = fired.clone();
		dispatcher
			.register_receiver(0x181, 0x7FF, false, 0, move |_frame, dispatcher| {
				let fired3 = fired2.clone();
				dispatcher.register_timer(Instant::from_millis(10), None, move |_, _d| *fired3.borrow_mut() = true).unwrap();
			})
			.unwrap();
		dispatcher.submit_frame(Frame::new(0x181, &[]).unwrap());
		dispatcher.set_time(Instant::from_millis(10));
		assert!(*fired.borrow());
	}

	#[test]
	fn timer_fires_once_at_deadline() {
		let mut dispatcher = Dispatcher::new();
		let count = Rc::new(RefCell::new(0));
		let c2 = count.clone();
		dispatcher.register_timer(Instant::from_millis(10), None, move |_, _d| *c2.borrow_mut() += 1).unwrap();
		dispatcher.set_time(Instant::from_millis(5));
		assert_eq!(*count.borrow(), 0);
		dispatcher.set_time(Instant::from_millis(10));
		assert_eq!(*count.borrow(), 1);
		dispatcher.set_time(Instant::from_millis(20));
		assert_eq!(*count.borrow(), 1);
	}

	#[test]
	fn periodic_timer_reinserts() {
		let mut dispatcher = Dispatcher::new();
		let count = Rc::new(RefCell::new(0));
		let c2 = count.clone();
		dispatcher
			.register_timer(Instant::from_millis(10), Some(Duration::from_millis(10)), move |_, _d| *c2.borrow_mut() += 1)
			.unwrap();
		dispatcher.set_time(Instant::from_millis(35));
		assert_eq!(*count.borrow(), 3);
	}

	#[test]
	fn timers_due_simultaneously_fire_in_insertion_order() {
		let mut dispatcher = Dispatcher::new();
		let order = Rc::new(RefCell::new(Vec::new()));
		let o1 = order.clone();
		let o2 = order.clone();
		dispatcher.register_timer(Instant::from_millis(10), None, move |_, _d| o1.borrow_mut().push(1)).unwrap();
		dispatcher.register_timer(Instant::from_millis(10), None, move |_, _d| o2.borrow_mut().push(2)).unwrap();
		dispatcher.set_time(Instant::from_millis(10));
		assert_eq!(*order.borrow(), vec![1, 2]);
	}
}
