//! Service Data Object transfer: expedited, segmented, and block upload/download.

mod client;
mod crc;
mod error;
mod server;
mod wire;

pub use client::{SdoClient, SdoRequest};
pub use error::SdoError;
pub use server::{server_request_cob_id, server_response_cob_id, SdoServer};
pub use wire::{ClientCommand, Multiplexer, ServerCommand};
