//! CAN identifiers and frames, independent of any transport.
//!
//! This crate holds only value types: [`Id`]/[`StandardId`]/[`ExtendedId`] for
//! addressing, and [`Frame`] for a classic or FD payload. Nothing here reads or
//! writes a socket; that is left entirely to the host application.

mod error;
mod frame;
mod id;

pub use error::{InvalidDlc, InvalidId, TryIntoCanDataError, TryNewFrameError};
pub use frame::{Flags, Frame, MAX_CLASSIC_LEN, MAX_FD_LEN};
pub use id::{ExtendedId, Id, StandardId, MAX_EXTENDED_ID, MAX_STANDARD_ID};
