//! Data model consumed by the injector: addresses, annotations, and the
//! parsed-message tree.

pub mod address;
pub mod annotation;
pub mod ingest;
pub mod message;

pub use address::Address;
pub use annotation::Annotation;
pub use message::{Bodypart, ContentType, FieldType, Header, HeaderField, Message, UNKNOWN_FIELD};
