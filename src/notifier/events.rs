// ABOUTME: Change and error events plus the subscriber lists that receive them
// ABOUTME: Callbacks run synchronously on the listener task in registration order

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{NotifierError, Severity};
use crate::protocol::ChangeKind;

use super::status::EngineStatus;

/// One reassembled row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<E> {
    pub entity: E,
    pub kind: ChangeKind,
    /// Kind text exactly as the start sentinel carried it
    pub raw_kind: String,
}

/// A fault raised while the notifier runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub severity: Severity,
    pub error: NotifierError,
    /// Status at the time the fault was raised
    pub status: EngineStatus,
}

type ChangedHandler<E> = Box<dyn Fn(&ChangeEvent<E>) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&ErrorInfo) + Send + Sync>;
type StatusHandler = Box<dyn Fn(EngineStatus) + Send + Sync>;

pub(crate) struct Subscribers<E> {
    changed: RwLock<Vec<ChangedHandler<E>>>,
    errors: RwLock<Vec<ErrorHandler>>,
    statuses: RwLock<Vec<StatusHandler>>,
    frozen: AtomicBool,
}

impl<E> Subscribers<E> {
    pub(crate) fn new() -> Self {
        Self {
            changed: RwLock::new(Vec::new()),
            errors: RwLock::new(Vec::new()),
            statuses: RwLock::new(Vec::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// No further registrations once the first start begins.
    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), NotifierError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(NotifierError::SubscribersFrozen);
        }
        Ok(())
    }

    pub(crate) fn add_changed(&self, handler: ChangedHandler<E>) -> Result<(), NotifierError> {
        self.ensure_open()?;
        write(&self.changed).push(handler);
        Ok(())
    }

    pub(crate) fn add_error(&self, handler: ErrorHandler) -> Result<(), NotifierError> {
        self.ensure_open()?;
        write(&self.errors).push(handler);
        Ok(())
    }

    pub(crate) fn add_status(&self, handler: StatusHandler) -> Result<(), NotifierError> {
        self.ensure_open()?;
        write(&self.statuses).push(handler);
        Ok(())
    }

    pub(crate) fn emit_changed(&self, event: &ChangeEvent<E>) {
        for handler in read(&self.changed).iter() {
            guarded("change", || handler(event));
        }
    }

    pub(crate) fn emit_error(&self, info: &ErrorInfo) {
        for handler in read(&self.errors).iter() {
            guarded("error", || handler(info));
        }
    }

    pub(crate) fn emit_status(&self, status: EngineStatus) {
        for handler in read(&self.statuses).iter() {
            guarded("status", || handler(status));
        }
    }
}

/// A panicking subscriber must not take the listener loop down with it.
fn guarded(kind: &str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::error!(subscriber = kind, "Subscriber panicked; event skipped for it");
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
