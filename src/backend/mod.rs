// ABOUTME: Capability traits every backing store implements once
// ABOUTME: Permission check, schema introspection, provisioning and the envelope transport

pub mod memory;
pub mod postgres;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{Culture, TextEncoding};
use crate::marshal::{ColumnType, Dialect};
use crate::model::{ColumnBinding, ColumnDescriptor};
use crate::protocol::{ChangeKind, Envelope, NamingConvention};

pub use memory::{MemoryBackend, MemoryTransport};
pub use postgres::{PostgresBackend, PostgresTransport};

/// A column the provisioned trigger must put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionColumn {
    pub name: String,
    pub type_name: String,
    pub column_type: ColumnType,
}

impl From<&ColumnBinding> for ProvisionColumn {
    fn from(binding: &ColumnBinding) -> Self {
        Self {
            name: binding.column.name.clone(),
            type_name: binding.column.type_name.clone(),
            column_type: binding.column_type,
        }
    }
}

/// Everything the store needs to set up a conversation for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ProvisionColumn>,
    /// Opaque, already-compiled filter clause
    pub filter: Option<String>,
    pub listen_on: Vec<ChangeKind>,
    pub update_of: Vec<String>,
    /// Encoding the trigger must render text payloads in
    pub encoding: TextEncoding,
    /// Number format the trigger must render numeric payloads in
    pub culture: Culture,
}

/// A provisioned conversation: its naming convention and the endpoint to listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub naming: NamingConvention,
    pub schema: String,
    pub table: String,
    pub endpoint: String,
}

/// Setup side of a backing store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Transport: Transport;

    /// Declared-type table and temporal formats of this store.
    fn dialect(&self) -> Dialect;

    async fn has_required_permissions(&self, schema: &str, table: &str) -> Result<bool>;

    /// Columns of the table in ordinal order; empty when the table does not exist.
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>>;

    async fn provision(&self, request: &ProvisionRequest) -> Result<Conversation>;

    async fn teardown(&self, conversation: &Conversation) -> Result<()>;

    /// Bind a transport to the conversation endpoint. Also used to reconnect.
    async fn connect(&self, conversation: &Conversation) -> Result<Self::Transport>;
}

/// Delivers envelopes of one conversation.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Wait up to `timeout` for the next envelope. `Ok(None)` means nothing arrived.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Envelope>>;

    /// Ask the store to send a heartbeat cycle through the conversation.
    async fn request_heartbeat(&mut self) -> Result<()> {
        Ok(())
    }
}
