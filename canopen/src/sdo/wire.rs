//! SDO multiplexer header and command-byte encoding.
//!
//! Bit placements for expedited/segmented transfer are ported verbatim from
//! the teacher's `make_sdo_expedited_download_command`/`make_sdo_segment_download_command`;
//! block transfer is generalized from the same CiA 301 command-specifier scheme.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::abort::AbortCode;

/// Command specifier sent by an SDO client.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ClientCommand {
	SegmentDownload = 0,
	InitiateDownload = 1,
	InitiateUpload = 2,
	SegmentUpload = 3,
	AbortTransfer = 4,
	BlockUpload = 5,
	BlockDownload = 6,
}

/// Command specifier sent by an SDO server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ServerCommand {
	SegmentUpload = 0,
	SegmentDownload = 1,
	InitiateUpload = 2,
	InitiateDownload = 3,
	AbortTransfer = 4,
	BlockDownload = 5,
	BlockUpload = 6,
}

/// The `(index, subindex)` pair addressed by an SDO request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Multiplexer {
	pub index: u16,
	pub subindex: u8,
}

pub fn parse_multiplexer(data: &[u8]) -> Multiplexer {
	Multiplexer { index: u16::from_le_bytes([data[1], data[2]]), subindex: data[3] }
}

fn put_multiplexer(buf: &mut [u8; 8], mux: Multiplexer) {
	let index = mux.index.to_le_bytes();
	buf[1] = index[0];
	buf[2] = index[1];
	buf[3] = mux.subindex;
}

/// `ccs<<5 | n<<2 | e<<1 | s` initiate-download request, expedited (`data.len() <= 4`).
pub fn initiate_download_expedited(mux: Multiplexer, data: &[u8]) -> [u8; 8] {
	debug_assert!(data.len() <= 4);
	let n = 4 - data.len() as u8;
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::InitiateDownload) << 5) | (n << 2) | 0x03;
	put_multiplexer(&mut buf, mux);
	buf[4..4 + data.len()].copy_from_slice(data);
	buf
}

/// Initiate-download request, segmented (size known up front, payload follows in segments).
pub fn initiate_download_segmented(mux: Multiplexer, size: u32) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::InitiateDownload) << 5) | 0x01;
	put_multiplexer(&mut buf, mux);
	buf[4..8].copy_from_slice(&size.to_le_bytes());
	buf
}

/// Initiate-download response: server acknowledges the multiplexer, no data bits.
pub fn initiate_download_response(mux: Multiplexer) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = u8::from(ServerCommand::InitiateDownload) << 5;
	put_multiplexer(&mut buf, mux);
	buf
}

/// `ccs<<5 | t<<4 | n<<1 | c` download-segment request.
pub fn segment_download_request(toggle: bool, complete: bool, data: &[u8]) -> [u8; 8] {
	debug_assert!(data.len() <= 7);
	let n = 7 - data.len() as u8;
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::SegmentDownload) << 5) | ((toggle as u8) << 4) | (n << 1) | (complete as u8);
	buf[1..1 + data.len()].copy_from_slice(data);
	buf
}

/// Download-segment response, toggled to match the request it acknowledges.
pub fn segment_download_response(toggle: bool) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::SegmentDownload) << 5) | ((toggle as u8) << 4);
	buf
}

/// Initiate-upload request: just the multiplexer.
pub fn initiate_upload_request(mux: Multiplexer) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = u8::from(ClientCommand::InitiateUpload) << 5;
	put_multiplexer(&mut buf, mux);
	buf
}

/// Initiate-upload response, expedited: the whole value fits in bytes 4..8.
pub fn initiate_upload_response_expedited(mux: Multiplexer, data: &[u8]) -> [u8; 8] {
	debug_assert!(data.len() <= 4);
	let n = 4 - data.len() as u8;
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::InitiateUpload) << 5) | (n << 2) | 0x03;
	put_multiplexer(&mut buf, mux);
	buf[4..4 + data.len()].copy_from_slice(data);
	buf
}

/// Initiate-upload response, segmented: size announced, payload follows in segments.
pub fn initiate_upload_response_segmented(mux: Multiplexer, size: u32) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::InitiateUpload) << 5) | 0x01;
	put_multiplexer(&mut buf, mux);
	buf[4..8].copy_from_slice(&size.to_le_bytes());
	buf
}

/// Upload-segment request, carrying only the expected toggle bit.
pub fn segment_upload_request(toggle: bool) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::SegmentUpload) << 5) | ((toggle as u8) << 4);
	buf
}

/// Upload-segment response: `n` in bits 1..3 gives `7 - data.len()`, bit 0 marks completion.
pub fn segment_upload_response(toggle: bool, complete: bool, data: &[u8]) -> [u8; 8] {
	debug_assert!(data.len() <= 7);
	let n = 7 - data.len() as u8;
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::SegmentUpload) << 5) | ((toggle as u8) << 4) | (n << 1) | (complete as u8);
	buf[1..1 + data.len()].copy_from_slice(data);
	buf
}

/// Abort-transfer frame; valid from either client or server since both share `cs = 4`.
pub fn abort_transfer(mux: Multiplexer, code: AbortCode) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = u8::from(ClientCommand::AbortTransfer) << 5;
	put_multiplexer(&mut buf, mux);
	buf[4..8].copy_from_slice(&u32::from(code).to_le_bytes());
	buf
}

pub fn parse_abort_code(data: &[u8]) -> AbortCode {
	let raw = u32::from_le_bytes(data[4..8].try_into().unwrap());
	AbortCode::try_from(raw).unwrap_or(AbortCode::GeneralError)
}

// --- block transfer ---

/// Initiate-block-download request (`ccs = 6`, sub-command `00`).
pub fn initiate_block_download_request(mux: Multiplexer, client_crc_support: bool, size: Option<u32>) -> [u8; 8] {
	let mut buf = [0u8; 8];
	let s = size.is_some() as u8;
	buf[0] = (u8::from(ClientCommand::BlockDownload) << 5) | ((client_crc_support as u8) << 2) | (s << 1);
	put_multiplexer(&mut buf, mux);
	if let Some(size) = size {
		buf[4..8].copy_from_slice(&size.to_le_bytes());
	}
	buf
}

/// Initiate-block-download response (`scs = 5`, sub-command `00`).
pub fn initiate_block_download_response(mux: Multiplexer, server_crc_support: bool, blksize: u8) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::BlockDownload) << 5) | ((server_crc_support as u8) << 2);
	put_multiplexer(&mut buf, mux);
	buf[4] = blksize;
	buf
}

/// One 7-byte block-transfer segment: `seqno` in bits 0..6, `last` in bit 7.
pub fn block_segment(seqno: u8, last: bool, data: &[u8]) -> [u8; 8] {
	debug_assert!(data.len() <= 7);
	let mut buf = [0u8; 8];
	buf[0] = (seqno & 0x7F) | ((last as u8) << 7);
	buf[1..1 + data.len()].copy_from_slice(data);
	buf
}

/// Block-download acknowledgement (`scs = 5`, sub-command `10`): last good `seqno`, next `blksize`.
pub fn block_download_ack(ackseq: u8, blksize: u8) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::BlockDownload) << 5) | 0x02;
	buf[1] = ackseq;
	buf[2] = blksize;
	buf
}

/// End-block-download request (`ccs = 6`, sub-command `01`): `n` = bytes in the final
/// segment that do not carry data, and the block's CRC-16.
pub fn end_block_download_request(n: u8, crc: u16) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::BlockDownload) << 5) | (n << 2) | 0x01;
	buf[1..3].copy_from_slice(&crc.to_le_bytes());
	buf
}

/// End-block-download response (`scs = 5`, sub-command `01`).
pub fn end_block_download_response() -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::BlockDownload) << 5) | 0x01;
	buf
}

/// Initiate-block-upload request (`ccs = 5`, sub-command `00`).
pub fn initiate_block_upload_request(mux: Multiplexer, client_crc_support: bool, blksize: u8) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::BlockUpload) << 5) | ((client_crc_support as u8) << 2);
	put_multiplexer(&mut buf, mux);
	buf[4] = blksize;
	buf
}

/// Initiate-block-upload response (`scs = 6`, sub-command `00`).
pub fn initiate_block_upload_response(mux: Multiplexer, server_crc_support: bool, size: Option<u32>) -> [u8; 8] {
	let mut buf = [0u8; 8];
	let s = size.is_some() as u8;
	buf[0] = (u8::from(ServerCommand::BlockUpload) << 5) | ((server_crc_support as u8) << 2) | (s << 1);
	put_multiplexer(&mut buf, mux);
	if let Some(size) = size {
		buf[4..8].copy_from_slice(&size.to_le_bytes());
	}
	buf
}

/// Start-block-upload (`ccs = 5`, sub-command `11`): tells the server to begin sending segments.
pub fn start_block_upload() -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::BlockUpload) << 5) | 0x03;
	buf
}

/// Block-upload acknowledgement (`ccs = 5`, sub-command `10`), same shape as the download ack.
pub fn block_upload_ack(ackseq: u8, blksize: u8) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::BlockUpload) << 5) | 0x02;
	buf[1] = ackseq;
	buf[2] = blksize;
	buf
}

/// End-block-upload (`scs = 6`, sub-command `01`).
pub fn end_block_upload_response(n: u8, crc: u16) -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ServerCommand::BlockUpload) << 5) | (n << 2) | 0x01;
	buf[1..3].copy_from_slice(&crc.to_le_bytes());
	buf
}

/// End-block-upload acknowledgement (`ccs = 5`, sub-command `01`).
pub fn end_block_upload_request() -> [u8; 8] {
	let mut buf = [0u8; 8];
	buf[0] = (u8::from(ClientCommand::BlockUpload) << 5) | 0x01;
	buf
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn expedited_download_sets_n_for_short_payload() {
		let mux = Multiplexer { index: 0x1018, subindex: 1 };
		let frame = initiate_download_expedited(mux, &[1, 2]);
		assert_eq!(frame[0], (1 << 5) | (2 << 2) | 0x03);
		assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 0x1018);
		assert_eq!(frame[3], 1);
		assert_eq!(&frame[4..6], &[1, 2]);
	}

	#[test]
	fn segment_download_toggle_and_completion_bits_round_trip() {
		let frame = segment_download_request(true, true, &[9, 9, 9]);
		assert_eq!(frame[0] & 0x10, 0x10);
		assert_eq!(frame[0] & 0x01, 0x01);
		assert_eq!((frame[0] >> 1) & 0x07, 4);
	}

	#[test]
	fn block_segment_encodes_seqno_and_last_flag() {
		let frame = block_segment(5, true, &[1, 2, 3]);
		assert_eq!(frame[0], 5 | 0x80);
		assert_eq!(&frame[1..4], &[1, 2, 3]);
	}

	#[test]
	fn abort_frame_round_trips_code() {
		let mux = Multiplexer { index: 0x2000, subindex: 0 };
		let frame = abort_transfer(mux, AbortCode::ObjectDoesNotExist);
		assert_eq!(parse_abort_code(&frame), AbortCode::ObjectDoesNotExist);
	}
}
