// ABOUTME: Library root for change-notifier
// ABOUTME: Typed row-change events for a watched table, reassembled from a trigger-fed queue

pub mod backend;
pub mod config;
pub mod error;
pub mod marshal;
pub mod model;
pub mod notifier;
pub mod protocol;
pub mod utils;

pub use backend::{Backend, MemoryBackend, PostgresBackend, Transport};
pub use config::{NotifierConfig, StartOptions};
pub use error::{FaultCategory, NotifierError, Severity};
pub use model::{ChangeEntity, Property, Record, Value, ValueKind};
pub use notifier::{ChangeEvent, ChangeNotifier, EngineStatus, ErrorInfo};
pub use protocol::ChangeKind;
