//! Receive PDO: applies an inbound frame's mapped values to the object dictionary.

use std::cell::RefCell;
use std::rc::Rc;

use crate::dictionary::ObjectDictionary;
use crate::dispatcher::{Dispatcher, ReceiverHandle};
use crate::nmt::NmtState;
use crate::pdo::error::{PdoError, PdoStartError};
use crate::pdo::mapping::{self, PdoMapping};

/// A single Receive PDO.
///
/// Only applies the mapping while the device is `Operational`; pre-operational and
/// stopped devices ignore matching frames entirely.
pub struct Rpdo {
	receiver: Option<ReceiverHandle>,
}

impl Rpdo {
	/// Start receiving on `cob_id`, applying `mapping` to `dictionary` on every
	/// matching non-RTR frame while `nmt_state` reports `Operational`.
	///
	/// `on_error` is invoked with any dictionary rejection instead of silently
	/// dropping the frame.
	pub fn start(
		dispatcher: &mut Dispatcher,
		cob_id: u32,
		mapping: Vec<PdoMapping>,
		dictionary: Rc<RefCell<ObjectDictionary>>,
		nmt_state: Rc<RefCell<NmtState>>,
		mut on_error: impl FnMut(PdoError) + 'static,
	) -> Result<Self, PdoStartError> {
		mapping::validate(&mapping)?;
		let receiver = dispatcher.register_receiver(cob_id, 0x7FF, false, 0, move |frame, _dispatcher| {
			if frame.is_rtr() {
				return;
			}
			let state = *nmt_state.borrow();
			if state != NmtState::Operational {
				return;
			}
			let mut dict = dictionary.borrow_mut();
			if let Err(err) = mapping::apply(&mut dict, &mapping, frame.data(), state) {
				on_error(PdoError::Dictionary(err));
			}
		})?;
		Ok(Self { receiver: Some(receiver) })
	}

	/// Stop receiving, deregistering the underlying receiver.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use canopen_frame::Frame;
	use crate::codec::Value;
	use crate::dictionary::{AccessType, Object, ObjectCode, SubObject};
	use crate::dispatcher::Dispatcher;

	fn dict_with_u16(index: u16, subindex: u8) -> Rc<RefCell<ObjectDictionary>> {
		let mut dict = ObjectDictionary::new(5);
		let sub = SubObject::new(AccessType::Rw, Value::U16(0)).pdo_mappable(true);
		dict.insert(Object::new(index, ObjectCode::Var).insert(subindex, sub));
		Rc::new(RefCell::new(dict))
	}

	#[test]
	fn applies_mapped_value_while_operational() {
		let mut dispatcher = Dispatcher::new();
		let dict = dict_with_u16(0x6200, 1);
		let state = Rc::new(RefCell::new(NmtState::Operational));
		let mapping = vec![PdoMapping { index: 0x6200, subindex: 1, bit_length: 16 }];
		let _rpdo = Rpdo::start(&mut dispatcher, 0x201, mapping, dict.clone(), state, |_| panic!("unexpected error")).unwrap();
		dispatcher.submit_frame(Frame::new(0x201, &[0x34, 0x12]).unwrap());
		assert_eq!(dict.borrow_mut().read(0x6200, 1, NmtState::Operational).unwrap(), Value::U16(0x1234));
	}

	#[test]
	fn ignores_frame_while_not_operational() {
		let mut dispatcher = Dispatcher::new();
		let dict = dict_with_u16(0x6200, 1);
		let state = Rc::new(RefCell::new(NmtState::PreOperational));
		let mapping = vec![PdoMapping { index: 0x6200, subindex: 1, bit_length: 16 }];
		let _rpdo = Rpdo::start(&mut dispatcher, 0x201, mapping, dict.clone(), state, |_| panic!("unexpected error")).unwrap();
		dispatcher.submit_frame(Frame::new(0x201, &[0x34, 0x12]).unwrap());
		assert_eq!(dict.borrow_mut().read(0x6200, 1, NmtState::Operational).unwrap(), Value::U16(0));
	}

	#[test]
	fn reports_error_on_rejected_write() {
		let mut dispatcher = Dispatcher::new();
		let mut dict = ObjectDictionary::new(5);
		let sub = SubObject::new(AccessType::Rw, Value::U16(0)).pdo_mappable(true).with_range(Value::U16(0), Value::U16(10));
		dict.insert(Object::new(0x6200, ObjectCode::Var).insert(1, sub));
		let dict = Rc::new(RefCell::new(dict));
		let state = Rc::new(RefCell::new(NmtState::Operational));
		let mapping = vec![PdoMapping { index: 0x6200, subindex: 1, bit_length: 16 }];
		let seen = Rc::new(RefCell::new(false));
		let seen2 = seen.clone();
		let _rpdo = Rpdo::start(&mut dispatcher, 0x201, mapping, dict, state, move |_err| *seen2.borrow_mut() = true).unwrap();
		dispatcher.submit_frame(Frame::new(0x201, &[0xFF, 0xFF]).unwrap());
		assert!(*seen.borrow());
	}
}
