//! The object dictionary: typed, indexed, access-controlled value store.

mod access;
mod dict;
mod error;
mod indication;
mod object;
mod sub;

pub use access::AccessType;
pub use dict::ObjectDictionary;
pub use error::DictError;
pub use indication::{DownloadIndication, UploadIndication};
pub use object::{Object, ObjectCode};
pub use sub::SubObject;
