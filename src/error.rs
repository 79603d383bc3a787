// ABOUTME: Error taxonomy for the change-feed engine
// ABOUTME: Classifies every fault as setup, protocol, transport or conversion

use thiserror::Error;

use crate::protocol::ChangeKind;

/// Broad class of a fault, which decides how the engine reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCategory {
    /// Returned from `start()`; the engine never reaches `Started`.
    Setup,
    /// Reassembly violation; the current bag is discarded and the loop continues.
    Protocol,
    /// Backing-store transport failure, transient or terminal.
    Transport,
    /// A payload could not be converted into its property type.
    Conversion,
}

/// Severity attached to an error notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Error,
    /// The loop has ended because of this fault.
    Fatal,
}

/// All faults raised by the engine.
///
/// Collaborator failures arrive as `anyhow::Error` and are flattened into
/// the string-carrying variants, so the error stays `Clone` and can be handed
/// to every error subscriber.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifierError {
    #[error("notifier is already started")]
    AlreadyStarted,

    #[error("subscribers must be registered before start")]
    SubscribersFrozen,

    #[error("missing permissions to set up change notifications on '{table}'")]
    PermissionDenied { table: String },

    #[error("permission check failed: {0}")]
    PermissionCheck(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read columns of '{table}': {reason}")]
    Schema { table: String, reason: String },

    #[error("table '{table}' has no columns or does not exist")]
    TableNotFound { table: String },

    #[error("column '{column}' of table '{table}' has unsupported type '{type_name}'")]
    ColumnTypeNotSupported {
        table: String,
        column: String,
        type_name: String,
    },

    #[error("no column of table '{table}' matches identity property '{property}'")]
    NoMatchBetweenModelAndColumn { table: String, property: String },

    #[error("property '{property}' does not exist on the model")]
    UnknownProperty { property: String },

    #[error("property '{property}' is already mapped")]
    DuplicateMapping { property: String },

    #[error("column '{column}' is already mapped to property '{property}'")]
    ColumnAlreadyMapped { column: String, property: String },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("message '{tag}' does not belong to the open {expected} record")]
    MessageMisaligned { tag: String, expected: String },

    #[error("message '{tag}' arrived after the record was closed")]
    BagAlreadyClosed { tag: String },

    #[error("end message for {end} does not match the open {open} record")]
    DataMisaligned { open: String, end: ChangeKind },

    #[error("malformed message type '{0}'")]
    MalformedTypeTag(String),

    #[error("unknown change kind '{0}'")]
    UnknownChangeKind(String),

    #[error("cannot convert column '{column}' ({type_name}) into property '{property}': {reason}")]
    Conversion {
        property: String,
        column: String,
        type_name: String,
        reason: String,
    },

    #[error("failed to build entity: {0}")]
    Mapping(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("reconnect failed after {attempts} attempts: {reason}")]
    ReconnectFailed { attempts: u32, reason: String },

    #[error("no notification received for {elapsed_secs:.1}s (watchdog {limit_secs:.1}s)")]
    WatchdogTimeout { elapsed_secs: f64, limit_secs: f64 },
}

impl NotifierError {
    /// The category that drives the engine's reaction to this fault.
    pub fn category(&self) -> FaultCategory {
        match self {
            NotifierError::MessageMisaligned { .. }
            | NotifierError::BagAlreadyClosed { .. }
            | NotifierError::DataMisaligned { .. }
            | NotifierError::MalformedTypeTag(_)
            | NotifierError::UnknownChangeKind(_) => FaultCategory::Protocol,
            NotifierError::Conversion { .. } | NotifierError::Mapping(_) => {
                FaultCategory::Conversion
            }
            NotifierError::Transport(_)
            | NotifierError::ReconnectFailed { .. }
            | NotifierError::WatchdogTimeout { .. } => FaultCategory::Transport,
            _ => FaultCategory::Setup,
        }
    }

    pub(crate) fn provisioning(err: anyhow::Error) -> Self {
        NotifierError::Provisioning(format!("{:#}", err))
    }

    pub(crate) fn teardown(err: anyhow::Error) -> Self {
        NotifierError::Teardown(format!("{:#}", err))
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        NotifierError::Transport(format!("{:#}", err))
    }
}

pub type Result<T, E = NotifierError> = std::result::Result<T, E>;
