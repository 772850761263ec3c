//! SDO server: answers download/upload requests addressed to this node.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_frame::Frame;

use crate::abort::AbortCode;
use crate::dictionary::ObjectDictionary;
use crate::dispatcher::{DispatchError, Dispatcher, ReceiverHandle, TimerHandle};
use crate::nmt::NmtState;
use crate::sdo::crc::crc16;
use crate::sdo::wire::{self, ClientCommand, Multiplexer, ServerCommand};
use crate::time::Duration;

/// Default COB-ID the server receives client requests on, for `node_id`.
pub const fn server_request_cob_id(node_id: u8) -> u32 {
	0x600 + node_id as u32
}

/// Default COB-ID the server transmits responses on, for `node_id`.
pub const fn server_response_cob_id(node_id: u8) -> u32 {
	0x580 + node_id as u32
}

enum State {
	Idle,
	Downloading { mux: Multiplexer, toggle: bool, buffer: Vec<u8> },
	Uploading { toggle: bool, buffer: Vec<u8>, offset: usize },
	BlockDownloading { mux: Multiplexer, crc_enabled: bool, buffer: Vec<u8>, awaiting_end: bool },
	BlockUploading { mux: Multiplexer, crc_enabled: bool, buffer: Vec<u8>, offset: usize, blksize: u8 },
}

impl State {
	fn mux(&self) -> Multiplexer {
		match self {
			Self::Downloading { mux, .. } | Self::BlockDownloading { mux, .. } | Self::BlockUploading { mux, .. } => *mux,
			_ => Multiplexer { index: 0, subindex: 0 },
		}
	}
}

struct Session {
	state: State,
	timer: Option<TimerHandle>,
}

/// One SDO server instance, bound to a single node-ID.
pub struct SdoServer {
	node_id: u8,
	session: Rc<RefCell<Session>>,
	receiver: Option<ReceiverHandle>,
}

impl SdoServer {
	/// Start a server for `node_id`, servicing requests against `dictionary` while it
	/// observes `nmt_state` for access control.
	pub fn start(
		dispatcher: &mut Dispatcher,
		node_id: u8,
		dictionary: Rc<RefCell<ObjectDictionary>>,
		nmt_state: Rc<RefCell<NmtState>>,
		timeout: Duration,
	) -> Result<Self, DispatchError> {
		let session = Rc::new(RefCell::new(Session { state: State::Idle, timer: None }));
		let request_cob_id = server_request_cob_id(node_id);
		let response_cob_id = server_response_cob_id(node_id);

		let recv_session = session.clone();
		let receiver = dispatcher.register_receiver(request_cob_id, 0x7FF, false, 0, move |frame, dispatcher| {
			Self::handle_frame(&recv_session, &dictionary, *nmt_state.borrow(), response_cob_id, timeout, frame, dispatcher);
		})?;

		Ok(Self { node_id, session, receiver: Some(receiver) })
	}

	/// This server's node-ID.
	pub fn node_id(&self) -> u8 {
		self.node_id
	}

	/// Stop serving, deregistering the client-request receiver and any pending timeout timer.
	pub fn stop(&mut self, dispatcher: &mut Dispatcher) {
		if let Some(handle) = self.receiver.take() {
			dispatcher.deregister_receiver(handle);
		}
		if let Some(handle) = self.session.borrow_mut().timer.take() {
			dispatcher.deregister_timer(handle);
		}
	}

	fn handle_frame(
		session: &Rc<RefCell<Session>>,
		dictionary: &Rc<RefCell<ObjectDictionary>>,
		state: NmtState,
		response_cob_id: u32,
		timeout: Duration,
		frame: &Frame,
		dispatcher: &mut Dispatcher,
	) {
		let data = frame.data();
		if data.len() < 8 {
			return;
		}

		// While a block download's data phase is in progress, every inbound frame is a
		// raw numbered segment with no command specifier; route those before treating
		// `data[0]` as a `ClientCommand`.
		let in_block_segment_phase = matches!(session.borrow().state, State::BlockDownloading { awaiting_end: false, .. });
		if in_block_segment_phase {
			Self::on_block_segment(session, response_cob_id, data, dispatcher);
			Self::rearm_timeout(session, dispatcher, response_cob_id, timeout);
			return;
		}

		let cs = data[0] >> 5;
		let Ok(command) = ClientCommand::try_from(cs) else {
			let mux = session.borrow().state.mux();
			Self::abort(dispatcher, response_cob_id, mux, AbortCode::InvalidOrUnknownCommandSpecifier);
			return;
		};

		if command == ClientCommand::AbortTransfer {
			session.borrow_mut().state = State::Idle;
			if let Some(handle) = session.borrow_mut().timer.take() {
				dispatcher.deregister_timer(handle);
			}
			return;
		}

		// A block upload's "start" and per-sub-block "ack" carry the same command
		// specifier as its initiate request; once a transfer is under way they drive
		// segment transmission directly instead of the single-reply-frame path below.
		if command == ClientCommand::BlockUpload && data[0] & 0x03 != 0x00 {
			let in_progress = matches!(session.borrow().state, State::BlockUploading { .. });
			if in_progress {
				Self::on_block_upload_control(session, response_cob_id, data[0] & 0x03, dispatcher);
				Self::rearm_timeout(session, dispatcher, response_cob_id, timeout);
				return;
			}
		}

		let result = match command {
			ClientCommand::InitiateDownload => Self::on_initiate_download(session, dictionary, state, data),
			ClientCommand::SegmentDownload => Self::on_segment_download(session, dictionary, state, data),
			ClientCommand::InitiateUpload => Self::on_initiate_upload(session, dictionary, state, data),
			ClientCommand::SegmentUpload => Self::on_segment_upload(session, data),
			ClientCommand::BlockDownload => Self::on_block_download(session, dictionary, state, data),
			ClientCommand::BlockUpload => Self::on_block_upload(session, dictionary, state, data),
			ClientCommand::AbortTransfer => unreachable!(),
		};

		match result {
			Ok(reply) => {
				if let Ok(frame) = Frame::new(response_cob_id, &reply) {
					let _ = dispatcher.send(frame);
				}
				Self::rearm_timeout(session, dispatcher, response_cob_id, timeout);
			}
			Err((mux, code)) => {
				session.borrow_mut().state = State::Idle;
				if let Some(handle) = session.borrow_mut().timer.take() {
					dispatcher.deregister_timer(handle);
				}
				Self::abort(dispatcher, response_cob_id, mux, code);
			}
		}
	}

	fn rearm_timeout(session: &Rc<RefCell<Session>>, dispatcher: &mut Dispatcher, response_cob_id: u32, timeout: Duration) {
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
			let mux = timeout_session.borrow().state.mux();
			timeout_session.borrow_mut().state = State::Idle;
			Self::abort(dispatcher, response_cob_id, mux, AbortCode::SdoProtocolTimedOut);
		}) {
			session.borrow_mut().timer = Some(handle);
		}
	}

	fn abort(dispatcher: &mut Dispatcher, response_cob_id: u32, mux: Multiplexer, code: AbortCode) {
		if let Ok(frame) = Frame::new(response_cob_id, &wire::abort_transfer(mux, code)) {
			let _ = dispatcher.send(frame);
		}
	}

	fn on_initiate_download(
		session: &Rc<RefCell<Session>>,
		dictionary: &Rc<RefCell<ObjectDictionary>>,
		state: NmtState,
		data: &[u8],
	) -> Result<[u8; 8], (Multiplexer, AbortCode)> {
		let mux = wire::parse_multiplexer(data);
		let e = data[0] & 0x02 != 0;
		let s = data[0] & 0x01 != 0;

		if e {
			let n = (data[0] >> 2) & 0x03;
			let len = if s { 4 - n as usize } else { 4 };
			dictionary.borrow_mut().write_raw(mux.index, mux.subindex, &data[4..4 + len], state).map_err(|e| (mux, e.abort_code()))?;
			session.borrow_mut().state = State::Idle;
		} else {
			session.borrow_mut().state = State::Downloading { mux, toggle: false, buffer: Vec::new() };
		}
		Ok(wire::initiate_download_response(mux))
	}

	fn on_segment_download(
		session: &Rc<RefCell<Session>>,
		dictionary: &Rc<RefCell<ObjectDictionary>>,
		state: NmtState,
		data: &[u8],
	) -> Result<[u8; 8], (Multiplexer, AbortCode)> {
		let toggle = data[0] & 0x10 != 0;
		let n = (data[0] >> 1) & 0x07;
		let complete = data[0] & 0x01 != 0;
		let len = 7 - n as usize;

		let mut guard = session.borrow_mut();
		let State::Downloading { mux, toggle: expected, buffer } = &mut guard.state else {
			return Err((Multiplexer { index: 0, subindex: 0 }, AbortCode::InvalidOrUnknownCommandSpecifier));
		};
		if toggle != *expected {
			return Err((*mux, AbortCode::ToggleBitNotAlternated));
		}
		buffer.extend_from_slice(&data[1..1 + len]);
		*expected = !*expected;

		if complete {
			let State::Downloading { mux, buffer, .. } = std::mem::replace(&mut guard.state, State::Idle) else { unreachable!() };
			drop(guard);
			dictionary.borrow_mut().write_raw(mux.index, mux.subindex, &buffer, state).map_err(|e| (mux, e.abort_code()))?;
		}
		Ok(wire::segment_download_response(toggle))
	}

	fn on_initiate_upload(
		session: &Rc<RefCell<Session>>,
		dictionary: &Rc<RefCell<ObjectDictionary>>,
		state: NmtState,
		data: &[u8],
	) -> Result<[u8; 8], (Multiplexer, AbortCode)> {
		let mux = wire::parse_multiplexer(data);
		let value = dictionary.borrow_mut().read(mux.index, mux.subindex, state).map_err(|e| (mux, e.abort_code()))?;
		let bytes = value.encode();
		if bytes.len() <= 4 {
			session.borrow_mut().state = State::Idle;
			Ok(wire::initiate_upload_response_expedited(mux, &bytes))
		} else {
			let size = bytes.len() as u32;
			session.borrow_mut().state = State::Uploading { toggle: false, buffer: bytes, offset: 0 };
			Ok(wire::initiate_upload_response_segmented(mux, size))
		}
	}

	fn on_segment_upload(session: &Rc<RefCell<Session>>, data: &[u8]) -> Result<[u8; 8], (Multiplexer, AbortCode)> {
		let toggle = data[0] & 0x10 != 0;
		let mut guard = session.borrow_mut();
		let State::Uploading { toggle: expected, buffer, offset } = &mut guard.state else {
			return Err((Multiplexer { index: 0, subindex: 0 }, AbortCode::InvalidOrUnknownCommandSpecifier));
		};
		if toggle != *expected {
			return Err((Multiplexer { index: 0, subindex: 0 }, AbortCode::ToggleBitNotAlternated));
		}
		let chunk_len = (buffer.len() - *offset).min(7);
		let chunk = buffer[*offset..*offset + chunk_len].to_vec();
		*offset += chunk_len;
		let complete = *offset >= buffer.len();
		*expected = !*expected;
		if complete {
			guard.state = State::Idle;
		}
		Ok(wire::segment_upload_response(toggle, complete, &chunk))
	}

	fn on_block_download(
		session: &Rc<RefCell<Session>>,
		dictionary: &Rc<RefCell<ObjectDictionary>>,
		state: NmtState,
		data: &[u8],
	) -> Result<[u8; 8], (Multiplexer, AbortCode)> {
		let subcommand = data[0] & 0x03;
		let mut guard = session.borrow_mut();

		if matches!(guard.state, State::Idle) && subcommand == 0x00 {
			let mux = wire::parse_multiplexer(data);
			let crc_enabled = data[0] & 0x04 != 0;
			let blksize = 127;
			guard.state = State::BlockDownloading { mux, crc_enabled, buffer: Vec::new(), awaiting_end: false };
			return Ok(wire::initiate_block_download_response(mux, crc_enabled, blksize));
		}

		if matches!(guard.state, State::BlockDownloading { awaiting_end: true, .. }) && subcommand == 0x01 {
			let n = (data[0] >> 2) & 0x07;
			let crc = u16::from_le_bytes([data[1], data[2]]);
			let State::BlockDownloading { mux, crc_enabled, mut buffer, .. } = std::mem::replace(&mut guard.state, State::Idle) else {
				unreachable!()
			};
			drop(guard);
			let valid_len = buffer.len().saturating_sub(n as usize);
			buffer.truncate(valid_len);
			if crc_enabled && crc16(&buffer) != crc {
				return Err((mux, AbortCode::CrcError));
			}
			dictionary.borrow_mut().write_raw(mux.index, mux.subindex, &buffer, state).map_err(|e| (mux, e.abort_code()))?;
			return Ok(wire::end_block_download_response());
		}

		Err((guard.state.mux(), AbortCode::InvalidOrUnknownCommandSpecifier))
	}

	/// Feed one raw block-transfer segment (seqno-tagged, no command specifier) into
	/// an in-progress block download, sending an ack once the sub-block of 127
	/// segments (or the final segment) has been received.
	fn on_block_segment(session: &Rc<RefCell<Session>>, response_cob_id: u32, data: &[u8], dispatcher: &mut Dispatcher) {
		let seqno = data[0] & 0x7F;
		let last = data[0] & 0x80 != 0;
		let mut guard = session.borrow_mut();
		let State::BlockDownloading { buffer, awaiting_end, .. } = &mut guard.state else { return };
		buffer.extend_from_slice(&data[1..8]);
		let ack = last || seqno % 127 == 0;
		if last {
			*awaiting_end = true;
		}
		drop(guard);
		if ack {
			if let Ok(frame) = Frame::new(response_cob_id, &wire::block_download_ack(seqno, 127)) {
				let _ = dispatcher.send(frame);
			}
		}
	}

	fn on_block_upload(
		session: &Rc<RefCell<Session>>,
		dictionary: &Rc<RefCell<ObjectDictionary>>,
		state: NmtState,
		data: &[u8],
	) -> Result<[u8; 8], (Multiplexer, AbortCode)> {
		if data[0] & 0x03 != 0x00 {
			return Err((session.borrow().state.mux(), AbortCode::InvalidOrUnknownCommandSpecifier));
		}
		let mux = wire::parse_multiplexer(data);
		let crc_enabled = data[0] & 0x04 != 0;
		let blksize = data[4].max(1);
		let value = dictionary.borrow_mut().read(mux.index, mux.subindex, state).map_err(|e| (mux, e.abort_code()))?;
		let buffer = value.encode();
		let size = buffer.len() as u32;
		session.borrow_mut().state = State::BlockUploading { mux, crc_enabled, buffer, offset: 0, blksize };
		Ok(wire::initiate_block_upload_response(mux, crc_enabled, Some(size)))
	}

	/// Drive an in-progress block upload's "start" (`sub = 11`) and per-sub-block
	/// "ack" (`sub = 10`) from the client, or tear the session down on the client's
	/// final "end ack" (`sub = 01`).
	fn on_block_upload_control(session: &Rc<RefCell<Session>>, response_cob_id: u32, subcommand: u8, dispatcher: &mut Dispatcher) {
		if subcommand == 0x01 {
			session.borrow_mut().state = State::Idle;
			return;
		}
		if Self::block_upload_done(session) {
			Self::send_end_upload_response(session, response_cob_id, dispatcher);
		} else {
			Self::send_upload_segments(session, response_cob_id, dispatcher);
		}
	}

	fn block_upload_done(session: &Rc<RefCell<Session>>) -> bool {
		match &session.borrow().state {
			State::BlockUploading { buffer, offset, .. } => *offset >= buffer.len(),
			_ => false,
		}
	}

	/// Send one sub-block of raw, unnumbered-command segments. The client acks
	/// every sub-block, including the final one; only on that last ack does
	/// [`Self::on_block_upload_control`] send the end-of-transfer response.
	fn send_upload_segments(session: &Rc<RefCell<Session>>, response_cob_id: u32, dispatcher: &mut Dispatcher) {
		let mut seqno = 1u8;
		loop {
			let mut guard = session.borrow_mut();
			let State::BlockUploading { buffer, offset, blksize, .. } = &mut guard.state else { return };
			if *offset >= buffer.len() || seqno > *blksize {
				return;
			}
			let end = (*offset + 7).min(buffer.len());
			let chunk = buffer[*offset..end].to_vec();
			let last = end >= buffer.len();
			*offset = end;
			let frame_data = wire::block_segment(seqno, last, &chunk);
			drop(guard);
			if let Ok(frame) = Frame::new(response_cob_id, &frame_data) {
				let _ = dispatcher.send(frame);
			}
			if last {
				return;
			}
			seqno += 1;
		}
	}

	fn send_end_upload_response(session: &Rc<RefCell<Session>>, response_cob_id: u32, dispatcher: &mut Dispatcher) {
		let guard = session.borrow();
		let State::BlockUploading { buffer, crc_enabled, .. } = &guard.state else { return };
		let crc = if *crc_enabled { crc16(buffer) } else { 0 };
		let n = match buffer.len() % 7 {
			0 => 0,
			r => 7 - r as u8,
		};
		drop(guard);
		if let Ok(frame) = Frame::new(response_cob_id, &wire::end_block_upload_response(n, crc)) {
			let _ = dispatcher.send(frame);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::codec::Value;
	use crate::dictionary::{AccessType, Object, ObjectCode, SubObject};

	fn dict_with_u32(index: u16, value: u32) -> Rc<RefCell<ObjectDictionary>> {
		let mut dict = ObjectDictionary::new(5);
		let object = Object::new(index, ObjectCode::Var).insert(0, SubObject::new(AccessType::Rw, Value::U32(value)));
		dict.insert(object);
		Rc::new(RefCell::new(dict))
	}

	fn started(dict: Rc<RefCell<ObjectDictionary>>) -> (Dispatcher, Rc<RefCell<Vec<Frame>>>, SdoServer) {
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let state = Rc::new(RefCell::new(NmtState::PreOperational));
		let server = SdoServer::start(&mut dispatcher, 5, dict, state, Duration::from_millis(1000)).unwrap();
		(dispatcher, sent, server)
	}

	#[test]
	fn expedited_upload_returns_value_in_one_frame() {
		let (mut dispatcher, sent, _server) = started(dict_with_u32(0x2000, 0xDEADBEEF));
		let mux = Multiplexer { index: 0x2000, subindex: 0 };
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::initiate_upload_request(mux)).unwrap());

		let frames = sent.borrow();
		assert_eq!(frames.len(), 1);
		let data = frames[0].data();
		assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 0xDEADBEEF);
	}

	#[test]
	fn expedited_download_writes_value() {
		let dict = dict_with_u32(0x2000, 0);
		let dict_check = dict.clone();
		let (mut dispatcher, _sent, _server) = started(dict);
		let mux = Multiplexer { index: 0x2000, subindex: 0 };
		dispatcher.submit_frame(
			Frame::new(server_request_cob_id(5), &wire::initiate_download_expedited(mux, &42u32.to_le_bytes())).unwrap(),
		);

		assert_eq!(dict_check.borrow_mut().read(0x2000, 0, NmtState::PreOperational).unwrap(), Value::U32(42));
	}

	#[test]
	fn unknown_object_aborts_with_object_does_not_exist() {
		let (mut dispatcher, sent, _server) = started(Rc::new(RefCell::new(ObjectDictionary::new(5))));
		let mux = Multiplexer { index: 0x3000, subindex: 0 };
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::initiate_upload_request(mux)).unwrap());

		let frames = sent.borrow();
		let data = frames[0].data();
		assert_eq!(data[0] >> 5, u8::from(ServerCommand::AbortTransfer));
		assert_eq!(wire::parse_abort_code(data), AbortCode::ObjectDoesNotExist);
	}

	#[test]
	fn segmented_download_writes_after_final_segment() {
		let mut dict = ObjectDictionary::new(5);
		let object = Object::new(0x2001, ObjectCode::Var)
			.insert(0, SubObject::new(AccessType::Rw, Value::VisibleString(String::new())));
		dict.insert(object);
		let dict = Rc::new(RefCell::new(dict));
		let dict_check = dict.clone();
		let (mut dispatcher, _sent, _server) = started(dict);

		let mux = Multiplexer { index: 0x2001, subindex: 0 };
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::initiate_download_segmented(mux, 10)).unwrap());
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::segment_download_request(false, false, b"hello, ")).unwrap());
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::segment_download_request(true, true, b"abc")).unwrap());

		let Value::VisibleString(s) = dict_check.borrow_mut().read(0x2001, 0, NmtState::PreOperational).unwrap() else {
			panic!("wrong type")
		};
		assert_eq!(s, "hello, abc");
	}

	#[test]
	fn access_denied_while_operational_on_rwr_object() {
		let mut dict = ObjectDictionary::new(5);
		let object = Object::new(0x2002, ObjectCode::Var).insert(0, SubObject::new(AccessType::Rwr, Value::U32(1)));
		dict.insert(object);
		let dict = Rc::new(RefCell::new(dict));
		let mut dispatcher = Dispatcher::new();
		let sent = Rc::new(RefCell::new(Vec::new()));
		let sent2 = sent.clone();
		dispatcher.set_send_callback(move |frame| {
			sent2.borrow_mut().push(frame);
			Ok(())
		});
		let state = Rc::new(RefCell::new(NmtState::Operational));
		let _server = SdoServer::start(&mut dispatcher, 5, dict, state, Duration::from_millis(1000)).unwrap();

		let mux = Multiplexer { index: 0x2002, subindex: 0 };
		dispatcher.submit_frame(
			Frame::new(server_request_cob_id(5), &wire::initiate_download_expedited(mux, &7u32.to_le_bytes())).unwrap(),
		);
		let frames = sent.borrow();
		assert_eq!(wire::parse_abort_code(frames[0].data()), AbortCode::AttemptToWriteReadOnly);
	}

	#[test]
	fn block_upload_sends_segments_and_end_response() {
		let mut dict = ObjectDictionary::new(5);
		let object = Object::new(0x2003, ObjectCode::Var)
			.insert(0, SubObject::new(AccessType::Rw, Value::VisibleString(String::new())));
		dict.insert(object);
		let dict = Rc::new(RefCell::new(dict));
		dict.borrow_mut().write_raw(0x2003, 0, b"0123456789abcde", NmtState::PreOperational).unwrap();
		let (mut dispatcher, sent, _server) = started(dict);

		let mux = Multiplexer { index: 0x2003, subindex: 0 };
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::initiate_block_upload_request(mux, true, 127)).unwrap());
		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::start_block_upload()).unwrap());

		// 15 bytes split across three 7-byte raw segments (initiate response, then the segments).
		assert_eq!(sent.borrow().len(), 4);
		let segments: Vec<_> = sent.borrow()[1..4].to_vec();
		assert_eq!(segments[0].data()[0] & 0x7F, 1);
		assert_eq!(segments[2].data()[0] & 0x80, 0x80);

		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::block_upload_ack(3, 127)).unwrap());
		assert_eq!(sent.borrow().len(), 5);
		let end_response = sent.borrow()[4].clone();
		assert_eq!(end_response.data()[0] >> 5, u8::from(ServerCommand::BlockUpload));
		assert_eq!(end_response.data()[0] & 0x03, 0x01);

		dispatcher.submit_frame(Frame::new(server_request_cob_id(5), &wire::end_block_upload_request()).unwrap());
	}
}
