// ABOUTME: The change-feed engine: status machine, subscribers, diagnostics and the listener loop
// ABOUTME: ChangeNotifier is the entry point

pub mod diagnostics;
pub mod engine;
pub mod events;
mod listener;
pub mod status;

pub use diagnostics::{DiagnosticsSnapshot, FaultRecord, TRACE_CAPACITY};
pub use engine::ChangeNotifier;
pub use events::{ChangeEvent, ErrorInfo};
pub use status::EngineStatus;
