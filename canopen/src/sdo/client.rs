//! SDO client: issues download/upload requests to a remote server.
//!
//! Mirrors [`super::server::SdoServer`]'s state machine from the other side of
//! the wire. One request is outstanding at a time; a second call to
//! [`SdoClient::request`] while a transfer is in flight is rejected with
//! [`SdoError::Busy`].

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::sdo::error::SdoError;
use crate::sdo::server::{server_request_cob_id, server_response_cob_id};
use crate::sdo::wire::{self, ClientCommand, Multiplexer, ServerCommand};
use crate::time::Duration;

/// Threshold below which a download is sent expedited rather than segmented.
const EXPEDITED_MAX_LEN: usize = 4;

/// A read (`write: None`) or write (`write: Some(bytes)`) addressed to `(index, subindex)`.
pub struct SdoRequest {
	/// The object index to access.
	pub index: u16,
	/// The sub-index to access.
	pub subindex: u8,
	/// `Some(bytes)` to download `bytes`, `None` to upload the current value.
	pub write: Option<Vec<u8>>,
	/// Request block transfer instead of expedited/segmented, when the peer supports it.
	pub block: bool,
}

type CompletionCallback = Box<dyn FnOnce(Result<Vec<u8>, SdoError>, &mut Dispatcher)>;

enum State {
	Idle,
	AwaitingInitiateDownload { remaining: Vec<u8> },
	AwaitingSegmentDownloadAck { toggle: bool, remaining: Vec<u8> },
	AwaitingInitiateUpload,
	AwaitingSegmentUploadAck { toggle: bool, buffer: Vec<u8> },
	AwaitingBlockDownloadInit { remaining: Vec<u8> },
	AwaitingBlockDownloadAck { blksize: u8, remaining: Vec<u8>, crc_enabled: bool, sent: Vec<u8> },
	AwaitingBlockDownloadEnd,
	AwaitingBlockUploadInit,
	AwaitingBlockUploadEnd { buffer: Vec<u8>, crc_enabled: bool, awaiting_end: bool },
}

struct Session {
	mux: Multiplexer,
	state: State,
	timer: Option<TimerHandle>,
	on_complete: Option<CompletionCallback>,
}

/// One SDO client instance, addressing a single remote node.
pub struct SdoClient {
	node_id: u8,
	timeout: Duration,
	session: Rc<RefCell<Session>>,
	receiver: Option<ReceiverHandle>,
}

impl SdoClient {
	/// Start a client targeting `node_id`'s default SDO server COB-IDs.
	pub fn start(dispatcher: &mut Dispatcher, node_id: u8, timeout: Duration) -> Result<Self, DispatchError> {
		let session = Rc::new(RefCell::new(Session {
			mux: Multiplexer { index: 0, subindex: 0 },
			state: State::Idle,
			timer: None,
			on_complete: None,
		}));

		// The client sends on the server's *request* COB-ID and listens on its *response* one.
		let request_cob_id = server_request_cob_id(node_id);
		let response_cob_id = server_response_cob_id(node_id);
		let recv_session = session.clone();
		let receiver = dispatcher.register_receiver(response_cob_id, 0x7FF, false, 0, move |frame, dispatcher| {
			Self::handle_frame(&recv_session, request_cob_id, timeout, frame, dispatcher);
		})?;

		Ok(Self { node_id, timeout, session, receiver: Some(receiver) })
	}

	/// This client's target node-ID.
	pub fn node_id(&self) -> u8 {
		self.node_id
	}

	/// Whether a request is currently in flight.
	pub fn is_busy(&self) -> bool {
		!matches!(self.session.borrow().state, State::Idle)
	}

	/// Issue `request`, invoking `on_complete` with the uploaded bytes (empty for a
	/// successful download) once the transfer finishes, aborts, or times out.
	pub fn request(
		&mut self,
		dispatcher: &mut Dispatcher,
		request: SdoRequest,
		on_complete: impl FnOnce(Result<Vec<u8>, SdoError>, &mut Dispatcher) + 'static,
	) -> Result<(), SdoError> {
		if self.is_busy() {
			return Err(SdoError::Busy);
		}
		let mux = Multiplexer { index: request.index, subindex: request.subindex };
		let request_cob_id = server_request_cob_id(self.node_id);

		let (state, frame) = match request.write {
			Some(bytes) if !request.block && bytes.len() <= EXPEDITED_MAX_LEN => {
				(State::AwaitingInitiateDownload { remaining: Vec::new() }, wire::initiate_download_expedited(mux, &bytes))
			}
			Some(bytes) if !request.block => {
				let size = bytes.len() as u32;
				(State::AwaitingInitiateDownload { remaining: bytes }, wire::initiate_download_segmented(mux, size))
			}
			Some(bytes) => {
				let size = bytes.len() as u32;
				(State::AwaitingBlockDownloadInit { remaining: bytes }, wire::initiate_block_download_request(mux, true, Some(size)))
			}
			None if !request.block => (State::AwaitingInitiateUpload, wire::initiate_upload_request(mux)),
			None => (State::AwaitingBlockUploadInit, wire::initiate_block_upload_request(mux, true, 127)),
		};

		{
			let mut session = self.session.borrow_mut();
			session.mux = mux;
			session.state = state;
			session.on_complete = Some(Box::new(on_complete));
		}
		let frame = Frame::new(request_cob_id, &frame).map_err(|_| SdoError::Malformed("request frame"))?;
		dispatcher.send(frame)?;
		Self::rearm_timeout(&self.session, dispatcher, request_cob_id, self.timeout);
		Ok(())
	}

	/// Stop this client, deregistering its response receiver and any pending timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
		if let Some(handle) = self.session.borrow_mut().timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}

	fn handle_frame(session: &Rc<RefCell<Session>>, request_cob_id: u32, timeout: Duration, frame: &Frame, dispatcher: &mut Dispatcher) {
		let data = frame.data();
		if data.len() < 8 {
			return;
		}

		// While a block upload's data phase is in progress, every inbound frame is a
		// raw numbered segment with no command specifier; route those before treating
		// `data[0]` as a `ServerCommand`.
		let in_block_segment_phase = matches!(session.borrow().state, State::AwaitingBlockUploadEnd { awaiting_end: false, .. });
		if in_block_segment_phase {
			Self::on_block_upload_segment(session, request_cob_id, data, dispatcher);
			Self::rearm_timeout(session, dispatcher, request_cob_id, timeout);
			return;
		}

		let cs = data[0] >> 5;
		let Ok(command) = ServerCommand::try_from(cs) else {
			Self::finish(session, dispatcher, Err(SdoError::UnexpectedCommand(cs)));
			return;
		};

		if command == ServerCommand::AbortTransfer {
			let code = wire::parse_abort_code(data);
			Self::finish(session, dispatcher, Err(SdoError::Aborted(code)));
			return;
		}

		let result = Self::advance(session, request_cob_id, command, data, dispatcher);
		match result {
			Ok(None) => {
				Self::rearm_timeout(session, dispatcher, request_cob_id, timeout);
			}
			Ok(Some(payload)) => Self::finish(session, dispatcher, Ok(payload)),
			Err(err) => Self::finish(session, dispatcher, Err(err)),
		}
	}

	/// Drive the session one step forward. Returns `Ok(Some(bytes))` once the
	/// transfer is complete, `Ok(None)` if another round-trip is needed.
	fn advance(
		session: &Rc<RefCell<Session>>,
		request_cob_id: u32,
		command: ServerCommand,
		data: &[u8],
		dispatcher: &mut Dispatcher,
	) -> Result<Option<Vec<u8>>, SdoError> {
		let mut guard = session.borrow_mut();

		match (&mut guard.state, command) {
			(State::AwaitingInitiateDownload { remaining }, ServerCommand::InitiateDownload) => {
				if remaining.is_empty() {
					return Ok(Some(Vec::new()));
				}
				let remaining = std::mem::take(remaining);
				let toggle = false;
				let (chunk, rest) = split_segment(&remaining);
				let complete = rest.is_empty();
				guard.state = State::AwaitingSegmentDownloadAck { toggle, remaining: rest };
				drop(guard);
				Self::send(dispatcher, request_cob_id, &wire::segment_download_request(toggle, complete, &chunk))?;
				Ok(None)
			}
			(State::AwaitingSegmentDownloadAck { toggle, remaining }, ServerCommand::SegmentDownload) => {
				let peer_toggle = data[0] & 0x10 != 0;
				if peer_toggle != *toggle {
					return Err(SdoError::ToggleMismatch);
				}
				if remaining.is_empty() {
					return Ok(Some(Vec::new()));
				}
				let remaining = std::mem::take(remaining);
				let next_toggle = !*toggle;
				let (chunk, rest) = split_segment(&remaining);
				let complete = rest.is_empty();
				guard.state = State::AwaitingSegmentDownloadAck { toggle: next_toggle, remaining: rest };
				drop(guard);
				Self::send(dispatcher, request_cob_id, &wire::segment_download_request(next_toggle, complete, &chunk))?;
				Ok(None)
			}
			(State::AwaitingInitiateUpload, ServerCommand::InitiateUpload) => {
				let e = data[0] & 0x02 != 0;
				let s = data[0] & 0x01 != 0;
				if e {
					let n = (data[0] >> 2) & 0x03;
					let len = if s { 4 - n as usize } else { 4 };
					Ok(Some(data[4..4 + len].to_vec()))
				} else {
					guard.state = State::AwaitingSegmentUploadAck { toggle: false, buffer: Vec::new() };
					drop(guard);
					Self::send(dispatcher, request_cob_id, &wire::segment_upload_request(false))?;
					Ok(None)
				}
			}
			(State::AwaitingSegmentUploadAck { toggle, buffer }, ServerCommand::SegmentUpload) => {
				let peer_toggle = data[0] & 0x10 != 0;
				if peer_toggle != *toggle {
					return Err(SdoError::ToggleMismatch);
				}
				let n = (data[0] >> 1) & 0x07;
				let complete = data[0] & 0x01 != 0;
				let len = 7 - n as usize;
				buffer.extend_from_slice(&data[1..1 + len]);
				if complete {
					let State::AwaitingSegmentUploadAck { buffer, .. } = std::mem::replace(&mut guard.state, State::Idle) else {
						unreachable!()
					};
					return Ok(Some(buffer));
				}
				let next_toggle = !*toggle;
				*toggle = next_toggle;
				drop(guard);
				Self::send(dispatcher, request_cob_id, &wire::segment_upload_request(next_toggle))?;
				Ok(None)
			}
			(State::AwaitingBlockDownloadInit { remaining }, ServerCommand::BlockDownload) => {
				let blksize = data[4];
				let crc_enabled = data[0] & 0x04 != 0;
				let remaining = std::mem::take(remaining);
				guard.state = State::AwaitingBlockDownloadAck { blksize, remaining, crc_enabled, sent: Vec::new() };
				drop(guard);
				Self::send_block_segments(session, request_cob_id, dispatcher)?;
				Ok(None)
			}
			(State::AwaitingBlockDownloadAck { sent, crc_enabled, .. }, ServerCommand::BlockDownload) if data[0] & 0x03 == 0x02 => {
				let crc_enabled = *crc_enabled;
				let sent = std::mem::take(sent);
				guard.state = State::AwaitingBlockDownloadEnd;
				drop(guard);
				let crc = if crc_enabled { crate::sdo::crc::crc16(&sent) } else { 0 };
				let last_len = sent.len() % 7;
				let n = if last_len == 0 { 0 } else { 7 - last_len as u8 };
				Self::send(dispatcher, request_cob_id, &wire::end_block_download_request(n, crc))?;
				Ok(None)
			}
			(State::AwaitingBlockDownloadEnd, ServerCommand::BlockDownload) if data[0] & 0x03 == 0x01 => Ok(Some(Vec::new())),
			(State::AwaitingBlockUploadInit, ServerCommand::BlockUpload) => {
				let crc_enabled = data[0] & 0x04 != 0;
				guard.state = State::AwaitingBlockUploadEnd { buffer: Vec::new(), crc_enabled, awaiting_end: false };
				drop(guard);
				Self::send(dispatcher, request_cob_id, &wire::start_block_upload())?;
				Ok(None)
			}
			(State::AwaitingBlockUploadEnd { awaiting_end: true, crc_enabled, .. }, ServerCommand::BlockUpload) if data[0] & 0x03 == 0x01 => {
				let crc_enabled = *crc_enabled;
				let n = (data[0] >> 2) & 0x07;
				let crc = u16::from_le_bytes([data[1], data[2]]);
				let State::AwaitingBlockUploadEnd { mut buffer, .. } = std::mem::replace(&mut guard.state, State::Idle) else {
					unreachable!()
				};
				drop(guard);
				let valid_len = buffer.len().saturating_sub(n as usize);
				buffer.truncate(valid_len);
				if crc_enabled && crate::sdo::crc::crc16(&buffer) != crc {
					return Err(SdoError::CrcMismatch);
				}
				Self::send(dispatcher, request_cob_id, &wire::end_block_upload_request())?;
				Ok(Some(buffer))
			}
			_ => Err(SdoError::UnexpectedCommand(u8::from(command))),
		}
	}

	/// Feed one raw block-transfer segment (seqno-tagged, no command specifier) into
	/// an in-progress block upload, acking once the sub-block of 127 segments (or
	/// the final segment) has arrived.
	fn on_block_upload_segment(session: &Rc<RefCell<Session>>, request_cob_id: u32, data: &[u8], dispatcher: &mut Dispatcher) {
		let seqno = data[0] & 0x7F;
		let last = data[0] & 0x80 != 0;
		let mut guard = session.borrow_mut();
		let State::AwaitingBlockUploadEnd { buffer, awaiting_end, .. } = &mut guard.state else { return };
		buffer.extend_from_slice(&data[1..8]);
		let ack = last || seqno % 127 == 0;
		if last {
			*awaiting_end = true;
		}
		drop(guard);
		if ack {
			let _ = Self::send(dispatcher, request_cob_id, &wire::block_upload_ack(seqno, 127));
		}
	}

	fn send_block_segments(session: &Rc<RefCell<Session>>, request_cob_id: u32, dispatcher: &mut Dispatcher) -> Result<(), DispatchError> {
		let mut guard = session.borrow_mut();
		let State::AwaitingBlockDownloadAck { remaining, sent, .. } = &mut guard.state else { return Ok(()) };
		let mut seqno = 1u8;
		while !remaining.is_empty() {
			let (chunk, rest) = split_segment(remaining);
			let last = rest.is_empty();
			sent.extend_from_slice(&chunk);
			let frame = wire::block_segment(seqno, last, &chunk);
			drop(guard);
			Self::send(dispatcher, request_cob_id, &frame)?;
			guard = session.borrow_mut();
			*remaining = rest;
			seqno += 1;
		}
		Ok(())
	}

	fn send(dispatcher: &mut Dispatcher, cob_id: u32, data: &[u8]) -> Result<(), DispatchError> {
		let frame = Frame::new(cob_id, data).map_err(|_| DispatchError::Send("invalid SDO frame".to_string()))?;
		dispatcher.send(frame)
	}

	fn finish(session: &Rc<RefCell<Session>>, dispatcher: &mut Dispatcher, result: Result<Vec<u8>, SdoError>) {
		let (on_complete, timer) = {
			let mut guard = session.borrow_mut();
			guard.state = State::Idle;
			(guard.on_complete.take(), guard.timer.take())
		};
		if let Some(handle) = timer {
			dispatcher.deregister_timer(handle);
		}
		if let Some(on_complete) = on_complete {
			on_complete(result, dispatcher);
		}
	}

	fn rearm_timeout(session: &Rc<RefCell<Session>>, dispatcher: &mut Dispatcher, request_cob_id: u32, timeout: Duration) {
		if let Some(handle) = session.borrow_mut().timer.take() {
			dispatcher.deregister_timer(handle);
		}
		if matches!(session.borrow().state, State::Idle) {
			return;
		}
		let now = dispatcher.now();
		let deadline = now.checked_add(timeout).unwrap_or(now);
		let timeout_session = session.clone();
		if let Ok(handle) = dispatcher.register_timer(deadline, None, move |_now, dispatcher| {
			let mux = timeout_session.borrow().mux;
			let _ = Self::send(dispatcher, request_cob_id, &wire::abort_transfer(mux, crate::abort::AbortCode::SdoProtocolTimedOut));
			Self::finish(&timeout_session, dispatcher, Err(SdoError::Timeout));
		}) {
			session.borrow_mut().timer = Some(handle);
		}
	}
}

fn split_segment(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
	if data.len() <= 7 {
		(data.to_vec(), Vec::new())
	} else {
		(data[..7].to_vec(), data[7..].to_vec())
	}
}
