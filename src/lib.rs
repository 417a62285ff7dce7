//! mailstore: the message-injection subsystem of a PostgreSQL-backed
//! IMAP/SMTP mail server.
//!
//! The center of the crate is [`inject::Injector`], which persists one
//! parsed message into any number of mailboxes in a single database
//! transaction: body parts are deduplicated by content hash, addresses and
//! flag/annotation/field names are interned into shared id tables, every
//! target mailbox gets a freshly allocated UID and modseq under a row lock,
//! and live IMAP sessions are notified after commit.
//!
//! Protocol handling and message parsing live elsewhere; [`model`] defines
//! the parsed-message tree the injector consumes, and [`model::ingest`]
//! adapts raw RFC 822 bytes onto it for tools and tests.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod inject;
pub mod mailbox;
pub mod model;
pub mod runtime;
pub mod test_support;

pub use error::InjectError;
pub use inject::Injector;
pub use runtime::InjectorRuntime;
