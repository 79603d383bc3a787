// ABOUTME: Wire protocol between the backing store's trigger and the listener
// ABOUTME: Envelopes, naming convention and the MessageBag reassembler

pub mod bag;
pub mod envelope;

pub use bag::{BagStatus, ClosedRecord, MessageBag};
pub use envelope::{ChangeKind, ColumnTag, Envelope, NamingConvention};
