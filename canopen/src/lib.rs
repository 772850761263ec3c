//! A passive, single-threaded CANopen protocol engine.
//!
//! This crate implements no I/O of its own. A host feeds received frames
//! into a [`dispatcher::Dispatcher`] through [`dispatcher::Dispatcher::submit_frame`]
//! and advances its notion of time through [`dispatcher::Dispatcher::set_time`];
//! every service (NMT, SDO, PDO, SYNC/TIME/EMCY, LSS, bus redundancy) is built
//! on top of that one dispatcher and only ever emits frames back through it.
//! There is no thread, no socket, and no clock read anywhere in this crate.

pub mod abort;
pub mod codec;
pub mod config;
pub mod dcf;
pub mod device;
pub mod dictionary;
pub mod dispatcher;
pub mod emcy;
pub mod error;
pub mod lss;
pub mod nmt;
pub mod pdo;
pub mod redundancy;
pub mod sdo;
pub mod service;
pub mod sync;
pub mod time;
pub mod time_stamp;

pub use device::Device;
pub use dispatcher::Dispatcher;
pub use error::Error;

/// This crate's `Result` alias, for code that threads the composed [`Error`] through.
pub type Result<T> = std::result::Result<T, Error>;
