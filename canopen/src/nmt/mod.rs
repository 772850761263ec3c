//! Network management: device state machine, error control, and master boot-up.

pub mod boot;
mod command;
mod error;
mod error_control;
mod state;

pub use boot::{check_identity, should_start, ActualIdentity, BootStatus, ExpectedIdentity, SlaveBoot};
pub use command::NmtCommand;
pub use error::NmtError;
pub use error_control::{error_control_cob_id, HeartbeatConsumer, HeartbeatProducer, NodeGuardMaster, NodeGuardResponder};
pub use state::NmtState;

use std::cell::RefCell;
use std::rc::Rc;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle};
use crate::time::{Duration, Instant};

/// COB-ID carrying NMT service commands, addressed to all nodes or one in particular.
pub const NMT_COMMAND_COB_ID: u32 = 0x000;

/// A device's own NMT state machine: receives commands on [`NMT_COMMAND_COB_ID`]
/// and optionally produces heartbeats or answers node-guarding requests.
pub struct NmtService {
	node_id: u8,
	state: Rc<RefCell<NmtState>>,
	command_receiver: Option<ReceiverHandle>,
	heartbeat: Option<HeartbeatProducer>,
	node_guard: Option<NodeGuardResponder>,
}

impl NmtService {
	/// Register the command receiver for `node_id`, starting in `Initialisation`.
	///
	/// `on_command` is invoked after the device's own state has already
	/// transitioned, so it sees the post-transition state via [`Self::state`]
	/// if given a handle back to this service.
	pub fn new(
		dispatcher: &mut Dispatcher,
		node_id: u8,
		on_command: impl FnMut(NmtCommand, &mut Dispatcher) + 'static,
	) -> Result<Self, DispatchError> {
		let state = Rc::new(RefCell::new(NmtState::Initialisation));
		let state_for_recv = state.clone();
		let on_command = RefCell::new(on_command);
		let receiver = dispatcher.register_receiver(NMT_COMMAND_COB_ID, 0x7FF, false, 0, move |frame, dispatcher| {
			if frame.data().len() < 2 {
				return;
			}
			let cs = frame.data()[0];
			let target = frame.data()[1];
			if target != 0 && target != node_id {
				return;
			}
			if let Ok(command) = NmtCommand::try_from(cs) {
				if let Some(next) = command.expected_state() {
					*state_for_recv.borrow_mut() = next;
				}
				(on_command.borrow_mut())(command, dispatcher);
			}
		})?;
		Ok(Self { node_id, state, command_receiver: Some(receiver), heartbeat: None, node_guard: None })
	}

	/// This device's node-ID.
	pub fn node_id(&self) -> u8 {
		self.node_id
	}

	/// The device's current NMT state.
	pub fn state(&self) -> NmtState {
		*self.state.borrow()
	}

	/// A shared handle to the device's state, for services that gate behavior on it
	/// (PDO processing, `rwr`/`rww` sub-objects).
	pub fn state_handle(&self) -> Rc<RefCell<NmtState>> {
		self.state.clone()
	}

	/// Force the device into `state`, e.g. after completing a reset sequence.
	pub fn set_state(&mut self, state: NmtState) {
		*self.state.borrow_mut() = state;
	}

	/// Start producing heartbeats every `interval`. Mutually exclusive with node-guarding.
	pub fn enable_heartbeat(&mut self, dispatcher: &mut Dispatcher, interval: Duration, now: Instant) -> Result<(), DispatchError> {
		self.node_guard = None;
		let producer = HeartbeatProducer::start(dispatcher, self.node_id, self.state.clone(), interval, now)?;
		self.heartbeat = Some(producer);
		Ok(())
	}

	/// Stop producing heartbeats.
	pub fn disable_heartbeat(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(mut producer) = self.heartbeat.take() {
			producer.stop(dispatcher);
		}
	}

	/// Start answering node-guarding RTRs. Mutually exclusive with the heartbeat producer.
	pub fn enable_node_guarding(&mut self, dispatcher: &mut Dispatcher) -> Result<(), DispatchError> {
		self.disable_heartbeat(dispatcher);
		let responder = NodeGuardResponder::start(dispatcher, self.node_id, self.state.clone())?;
		self.node_guard = Some(responder);
		Ok(())
	}

	/// Tear down this service: command receiver, heartbeat producer, and node-guard responder.
	pub fn shutdown(&mut self, dispatcher: &mut Dispatcher) {
		self.disable_heartbeat(dispatcher);
		if let Some(mut responder) = self.node_guard.take() {
			responder.stop(dispatcher);
		}
		if let Some(handle) = self.command_receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use canopen_frame::Frame;
	use std::cell::RefCell as Cell;

	#[test]
	fn start_command_transitions_device_to_operational() {
		let mut dispatcher = Dispatcher::new();
		let service = NmtService::new(&mut dispatcher, 5, |_cmd, _d| {}).unwrap();
		assert_eq!(service.state(), NmtState::Initialisation);
		dispatcher.submit_frame(Frame::new(NMT_COMMAND_COB_ID, &[1, 5]).unwrap());
		assert_eq!(service.state(), NmtState::Operational);
	}

	#[test]
	fn broadcast_command_targets_every_node() {
		let mut dispatcher = Dispatcher::new();
		let service = NmtService::new(&mut dispatcher, 5, |_cmd, _d| {}).unwrap();
		dispatcher.submit_frame(Frame::new(NMT_COMMAND_COB_ID, &[2, 0]).unwrap());
		assert_eq!(service.state(), NmtState::Stopped);
	}

	#[test]
	fn command_for_a_different_node_is_ignored() {
		let mut dispatcher = Dispatcher::new();
		let service = NmtService::new(&mut dispatcher, 5, |_cmd, _d| {}).unwrap();
		dispatcher.submit_frame(Frame::new(NMT_COMMAND_COB_ID, &[1, 6]).unwrap());
		assert_eq!(service.state(), NmtState::Initialisation);
	}

	#[test]
	fn on_command_callback_runs_after_state_update() {
		let mut dispatcher = Dispatcher::new();
		let seen = Rc::new(Cell::new(None));
		let seen2 = seen.clone();
		let _service = NmtService::new(&mut dispatcher, 5, move |cmd, _d| *seen2.borrow_mut() = Some(cmd)).unwrap();
		dispatcher.submit_frame(Frame::new(NMT_COMMAND_COB_ID, &[1, 5]).unwrap());
		assert_eq!(*seen.borrow(), Some(NmtCommand::Start));
	}
}
