// ABOUTME: In-process backing store for embedding and for driving the engine in tests
// ABOUTME: Envelopes are pushed through a shared handle; failures can be scripted

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::TextEncoding;
use crate::marshal::{encode_text, Dialect};
use crate::model::ColumnDescriptor;
use crate::protocol::{ChangeKind, Envelope, NamingConvention};

use super::{Backend, Conversation, ProvisionRequest, Transport};

#[derive(Debug, Default)]
struct State {
    tables: HashMap<(String, String), Vec<ColumnDescriptor>>,
    queue: VecDeque<Envelope>,
    naming: Option<NamingConvention>,
    last_request: Option<ProvisionRequest>,
    permissions_denied: bool,
    provisioning_failure: Option<String>,
    failing_receives: u32,
    failing_connects: u32,
    heartbeats_disabled: bool,
    provision_count: u32,
    teardown_count: u32,
    connect_count: u32,
    heartbeat_requests: u32,
}

#[derive(Debug)]
struct Inner {
    dialect: Dialect,
    encoding: TextEncoding,
    state: Mutex<State>,
    notify: Notify,
}

/// A cloneable handle; every clone sees the same queue and counters.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::POSTGRES, TextEncoding::Utf8)
    }

    pub fn with_dialect(dialect: Dialect, encoding: TextEncoding) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialect,
                encoding,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner)
    }

    /// Declare a table and its columns.
    pub fn add_table(&self, schema: &str, table: &str, columns: Vec<ColumnDescriptor>) {
        self.state()
            .tables
            .insert((schema.to_string(), table.to_string()), columns);
    }

    pub fn deny_permissions(&self) {
        self.state().permissions_denied = true;
    }

    pub fn fail_provisioning(&self, reason: impl Into<String>) {
        self.state().provisioning_failure = Some(reason.into());
    }

    /// The next `count` receives fail with a transport error.
    pub fn fail_next_receives(&self, count: u32) {
        self.state().failing_receives = count;
        self.inner.notify.notify_one();
    }

    /// The next `count` connects fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// Behave like a store that cannot emit heartbeat cycles.
    pub fn disable_heartbeats(&self) {
        self.state().heartbeats_disabled = true;
    }

    pub fn push_envelope(&self, envelope: Envelope) {
        self.state().queue.push_back(envelope);
        self.inner.notify.notify_one();
    }

    /// Push a complete start/columns/end cycle for the provisioned conversation.
    /// A `None` column value travels as an empty payload, like SQL NULL does.
    pub fn push_change(&self, kind: ChangeKind, columns: &[(&str, Option<&str>)]) -> Result<()> {
        let naming = self.require_naming()?;
        let mut envelopes = vec![self.sentinel(naming.start_signature(), kind)?];
        for (column, value) in columns {
            let payload = match value {
                Some(text) => Some(encode_text(text, self.inner.encoding)?),
                None => None,
            };
            envelopes.push(Envelope::new(naming.column_tag(kind, column), payload));
        }
        envelopes.push(self.sentinel(naming.end_signature(), kind)?);

        self.state().queue.extend(envelopes);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Push an empty `None` cycle.
    pub fn push_heartbeat(&self) -> Result<()> {
        self.push_change(ChangeKind::None, &[])
    }

    fn sentinel(&self, tag: String, kind: ChangeKind) -> Result<Envelope> {
        Ok(Envelope::new(
            tag,
            Some(encode_text(kind.as_str(), self.inner.encoding)?),
        ))
    }

    fn require_naming(&self) -> Result<NamingConvention> {
        match &self.state().naming {
            Some(naming) => Ok(naming.clone()),
            None => bail!("no conversation is provisioned"),
        }
    }

    /// Naming convention of the currently provisioned conversation.
    pub fn naming(&self) -> Option<NamingConvention> {
        self.state().naming.clone()
    }

    pub fn last_request(&self) -> Option<ProvisionRequest> {
        self.state().last_request.clone()
    }

    pub fn provision_count(&self) -> u32 {
        self.state().provision_count
    }

    pub fn teardown_count(&self) -> u32 {
        self.state().teardown_count
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connect_count
    }

    pub fn heartbeat_requests(&self) -> u32 {
        self.state().heartbeat_requests
    }

    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }
}

fn lock(inner: &Inner) -> MutexGuard<'_, State> {
    inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Backend for MemoryBackend {
    type Transport = MemoryTransport;

    fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    async fn has_required_permissions(&self, _schema: &str, _table: &str) -> Result<bool> {
        Ok(!self.state().permissions_denied)
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut columns = self
            .state()
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default();
        columns.sort_by_key(|c| c.ordinal);
        Ok(columns)
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Conversation> {
        let mut state = self.state();
        if let Some(reason) = &state.provisioning_failure {
            bail!("{}", reason);
        }

        let naming = NamingConvention::generate(&request.table);
        state.naming = Some(naming.clone());
        state.last_request = Some(request.clone());
        state.queue.clear();
        state.provision_count += 1;

        Ok(Conversation {
            endpoint: naming.name().to_string(),
            naming,
            schema: request.schema.clone(),
            table: request.table.clone(),
        })
    }

    async fn teardown(&self, conversation: &Conversation) -> Result<()> {
        let mut state = self.state();
        if state.naming.as_ref() == Some(&conversation.naming) {
            state.naming = None;
            state.queue.clear();
        }
        state.teardown_count += 1;
        Ok(())
    }

    async fn connect(&self, conversation: &Conversation) -> Result<MemoryTransport> {
        let mut state = self.state();
        state.connect_count += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            bail!("connection to '{}' refused", conversation.endpoint);
        }
        Ok(MemoryTransport {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Transport side of a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    fn poll(&self) -> Result<Option<Envelope>> {
        let mut state = lock(&self.inner);
        if state.failing_receives > 0 {
            state.failing_receives -= 1;
            bail!("conversation endpoint unavailable");
        }
        Ok(state.queue.pop_front())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.poll()? {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, self.inner.notify.notified())
                .await
                .is_err()
            {
                return self.poll();
            }
        }
    }

    async fn request_heartbeat(&mut self) -> Result<()> {
        let naming = {
            let mut state = lock(&self.inner);
            state.heartbeat_requests += 1;
            if state.heartbeats_disabled {
                return Ok(());
            }
            state.naming.clone()
        };
        let Some(naming) = naming else {
            bail!("no conversation is provisioned");
        };

        let encode = |kind: ChangeKind| encode_text(kind.as_str(), self.inner.encoding);
        let start = Envelope::new(naming.start_signature(), Some(encode(ChangeKind::None)?));
        let end = Envelope::new(naming.end_signature(), Some(encode(ChangeKind::None)?));
        {
            let mut state = lock(&self.inner);
            state.queue.push_back(start);
            state.queue.push_back(end);
        }
        self.inner.notify.notify_one();
        Ok(())
    }
}
