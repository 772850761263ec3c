//! Process Data Object transfer: mapped, unacknowledged broadcast of process values.

mod error;
mod mapping;
mod rpdo;
mod tpdo;
mod types;

pub use error::{InvalidSyncInterval, PdoError, PdoMappingError, PdoStartError};
pub use mapping::{assemble, apply, total_bits, validate, PdoMapping};
pub use rpdo::Rpdo;
pub use tpdo::Tpdo;
pub use types::{RpdoTransmissionType, TpdoTransmissionType};
