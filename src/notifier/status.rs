// ABOUTME: Engine status state machine held in an atomic cell
// ABOUTME: Readable from any task while the listener loop drives transitions

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a notifier.
///
/// `None → WaitingForStart → Starting → Started → WaitingForNotification`,
/// ending in `StoppedDueToCancellation` or `StoppedDueToError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineStatus {
    None = 0,
    WaitingForStart = 1,
    Starting = 2,
    Started = 3,
    WaitingForNotification = 4,
    StoppedDueToCancellation = 5,
    StoppedDueToError = 6,
}

impl EngineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineStatus::WaitingForStart,
            2 => EngineStatus::Starting,
            3 => EngineStatus::Started,
            4 => EngineStatus::WaitingForNotification,
            5 => EngineStatus::StoppedDueToCancellation,
            6 => EngineStatus::StoppedDueToError,
            _ => EngineStatus::None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineStatus::StoppedDueToCancellation | EngineStatus::StoppedDueToError
        )
    }

    /// True while a listener loop is (or is about to be) live.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EngineStatus::Started | EngineStatus::WaitingForNotification
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(EngineStatus::None as u8))
    }

    pub(crate) fn load(&self) -> EngineStatus {
        EngineStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store a status and return the previous one.
    pub(crate) fn swap(&self, status: EngineStatus) -> EngineStatus {
        EngineStatus::from_u8(self.0.swap(status as u8, Ordering::AcqRel))
    }
}
