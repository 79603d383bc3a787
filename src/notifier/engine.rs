// ABOUTME: ChangeNotifier: the public engine tying model, marshaler, backend and listener together
// ABOUTME: start() validates and provisions, stop() cancels the loop and tears the conversation down

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{Backend, Conversation, ProvisionColumn, ProvisionRequest};
use crate::config::{NotifierConfig, StartOptions};
use crate::error::{NotifierError, Result, Severity};
use crate::marshal::Marshaler;
use crate::model::{ChangeEntity, ColumnBinding, ModelMapper};
use crate::protocol::MessageBag;
use crate::utils::sanitize_identifier;

use super::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use super::events::{ChangeEvent, ErrorInfo, Subscribers};
use super::listener::Listener;
use super::status::{EngineStatus, StatusCell};

/// State shared between the notifier handle and its listener task.
pub(crate) struct Shared<E> {
    pub(crate) table: String,
    status: StatusCell,
    pub(crate) subscribers: Subscribers<E>,
    pub(crate) diagnostics: Diagnostics,
    torn_down: AtomicBool,
}

impl<E> Shared<E> {
    fn new(table: String) -> Self {
        Self {
            table,
            status: StatusCell::new(),
            subscribers: Subscribers::new(),
            diagnostics: Diagnostics::default(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> EngineStatus {
        self.status.load()
    }

    /// Store a status; subscribers only hear about actual changes.
    pub(crate) fn set_status(&self, status: EngineStatus) {
        let previous = self.status.swap(status);
        if previous == status {
            return;
        }
        tracing::debug!(table = %self.table, from = %previous, to = %status, "Status changed");
        self.subscribers.emit_status(status);
    }

    /// Count, log and publish a runtime fault.
    pub(crate) fn report(&self, severity: Severity, error: NotifierError) {
        self.diagnostics.record(&error, severity);
        let category = error.category();
        match severity {
            Severity::Warning => {
                tracing::warn!(table = %self.table, ?category, "{}", error)
            }
            Severity::Error => {
                tracing::error!(table = %self.table, ?category, "{}", error)
            }
            Severity::Fatal => {
                tracing::error!(table = %self.table, ?category, fatal = true, "{}", error)
            }
        }
        let info = ErrorInfo {
            severity,
            error,
            status: self.status(),
        };
        self.subscribers.emit_error(&info);
    }

    /// Setup faults go to diagnostics and logs only; `start()` returns them.
    fn setup_failed(&self, error: NotifierError) -> NotifierError {
        self.diagnostics.record(&error, Severity::Error);
        tracing::error!(table = %self.table, "Failed to start change notifier: {}", error);
        self.set_status(EngineStatus::StoppedDueToError);
        error
    }
}

/// Remove the store-side objects of a conversation, at most once per run.
pub(crate) async fn teardown_once<E, B: Backend>(
    shared: &Shared<E>,
    backend: &B,
    conversation: &Conversation,
) {
    if shared.torn_down.swap(true, Ordering::AcqRel) {
        return;
    }
    tracing::info!(table = %shared.table, conversation = %conversation.naming, "Tearing down conversation");
    if let Err(err) = backend.teardown(conversation).await {
        shared.report(Severity::Warning, NotifierError::teardown(err));
    }
}

struct Running {
    conversation: Conversation,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
}

/// Watches one table and raises a typed event for every committed row change.
///
/// ```no_run
/// # use change_notifier::backend::MemoryBackend;
/// # use change_notifier::config::{NotifierConfig, StartOptions};
/// # use change_notifier::model::{ChangeEntity, Property, Record, ValueKind};
/// # use change_notifier::notifier::ChangeNotifier;
/// struct Order { id: i64 }
///
/// impl ChangeEntity for Order {
///     fn properties() -> &'static [Property] {
///         const PROPS: &[Property] = &[Property::identity("id", ValueKind::I64)];
///         PROPS
///     }
///     fn from_record(record: &Record) -> anyhow::Result<Self> {
///         Ok(Order { id: record.require("id")? })
///     }
/// }
///
/// # async fn example() -> change_notifier::error::Result<()> {
/// let notifier = ChangeNotifier::<Order, _>::new(
///     MemoryBackend::new(),
///     NotifierConfig::new("public", "orders"),
/// )?;
/// notifier.on_changed(|event| println!("order {} {}", event.entity.id, event.kind))?;
/// notifier.start(StartOptions::default()).await?;
/// // ...
/// notifier.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ChangeNotifier<E: ChangeEntity, B: Backend> {
    backend: Arc<B>,
    config: NotifierConfig,
    mapper: ModelMapper,
    shared: Arc<Shared<E>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<E: ChangeEntity, B: Backend> ChangeNotifier<E, B> {
    /// Build a notifier, applying the configured property -> column overrides.
    pub fn new(backend: B, config: NotifierConfig) -> Result<Self> {
        let mut mapper = ModelMapper::for_entity::<E>();
        for (property, column) in &config.mappings {
            mapper.add_mapping(property.clone(), column.clone())?;
        }
        let table = config.qualified_table();

        Ok(Self {
            backend: Arc::new(backend),
            config,
            mapper,
            shared: Arc::new(Shared::new(table)),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Register an explicit property -> column override.
    pub fn add_mapping(
        &mut self,
        property: impl Into<String>,
        column: impl Into<String>,
    ) -> Result<()> {
        if self.is_active() {
            return Err(NotifierError::AlreadyStarted);
        }
        self.mapper.add_mapping(property, column)
    }

    pub fn on_changed<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&ChangeEvent<E>) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_changed(Box::new(handler))
    }

    pub fn on_error<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&ErrorInfo) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_error(Box::new(handler))
    }

    pub fn on_status_changed<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(EngineStatus) + Send + Sync + 'static,
    {
        self.shared.subscribers.add_status(Box::new(handler))
    }

    fn is_active(&self) -> bool {
        !matches!(
            self.status(),
            EngineStatus::None
                | EngineStatus::StoppedDueToCancellation
                | EngineStatus::StoppedDueToError
        )
    }

    /// Provision the conversation and spawn the listener.
    ///
    /// Returns once the listener is running. Any setup failure is returned
    /// here and leaves the notifier in `StoppedDueToError` with nothing
    /// provisioned.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_active() {
            return Err(NotifierError::AlreadyStarted);
        }
        // A previous run that ended on a fatal fault has already torn down
        if let Some(previous) = lifecycle.running.take() {
            if let Err(err) = previous.handle.await {
                tracing::error!(table = %self.shared.table, "Listener task failed: {}", err);
            }
        }

        self.shared.subscribers.freeze();
        self.shared.torn_down.store(false, Ordering::Release);
        self.shared.set_status(EngineStatus::WaitingForStart);

        let (bindings, request) = match self.prepare(&options).await {
            Ok(prepared) => prepared,
            Err(error) => return Err(self.shared.setup_failed(error)),
        };

        self.shared.set_status(EngineStatus::Starting);
        tracing::info!(
            table = %self.shared.table,
            columns = bindings.len(),
            "Provisioning change notification objects"
        );
        let conversation = match self.backend.provision(&request).await {
            Ok(conversation) => conversation,
            Err(err) => {
                return Err(self
                    .shared
                    .setup_failed(NotifierError::provisioning(err)))
            }
        };

        let transport = match self.backend.connect(&conversation).await {
            Ok(transport) => transport,
            Err(err) => {
                teardown_once(&self.shared, self.backend.as_ref(), &conversation).await;
                return Err(self.shared.setup_failed(NotifierError::transport(err)));
            }
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let listener = Listener {
            shared: Arc::clone(&self.shared),
            backend: Arc::clone(&self.backend),
            bag: MessageBag::new(&conversation.naming, self.config.encoding),
            conversation: conversation.clone(),
            transport,
            bindings,
            marshaler: Marshaler::new(
                self.backend.dialect(),
                self.config.encoding,
                self.config.culture.clone(),
            ),
            options,
            identity_policy: self.config.identity_conversion,
            reconnect: self.config.reconnect.clone(),
            heartbeat: self.config.heartbeat,
            cancel: cancel_rx,
            entity: PhantomData,
        };

        self.shared.set_status(EngineStatus::Started);
        tracing::info!(
            table = %self.shared.table,
            conversation = %conversation.naming,
            timeout = ?options.timeout,
            watchdog_timeout = ?options.watchdog_timeout,
            "Change notifier started"
        );
        let handle = tokio::spawn(listener.run());
        lifecycle.running = Some(Running {
            conversation,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Everything before provisioning: validation, permissions, schema and bindings.
    async fn prepare(
        &self,
        options: &StartOptions,
    ) -> Result<(Vec<ColumnBinding>, ProvisionRequest)> {
        self.config
            .validate()
            .map_err(|e| NotifierError::Config(format!("{:#}", e)))?;
        options
            .validate()
            .map_err(|e| NotifierError::Config(format!("{:#}", e)))?;

        let schema = self.config.schema.as_str();
        let table = self.config.table.as_str();
        let qualified = self.config.qualified_table();

        let permitted = self
            .backend
            .has_required_permissions(schema, table)
            .await
            .map_err(|e| NotifierError::PermissionCheck(format!("{:#}", e)))?;
        if !permitted {
            return Err(NotifierError::PermissionDenied { table: qualified });
        }

        let columns = self
            .backend
            .columns(schema, table)
            .await
            .map_err(|e| NotifierError::Schema {
                table: qualified.clone(),
                reason: format!("{:#}", e),
            })?;
        if columns.is_empty() {
            return Err(NotifierError::TableNotFound { table: qualified });
        }
        tracing::debug!(table = %qualified, columns = columns.len(), "Read table columns");

        let dialect = self.backend.dialect();
        let bindings = self.mapper.bind(&qualified, &columns, &dialect)?;

        for wanted in &self.config.update_of {
            if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(wanted)) {
                return Err(NotifierError::Config(format!(
                    "update_of column '{}' does not exist on '{}'",
                    sanitize_identifier(wanted),
                    qualified
                )));
            }
        }

        let request = ProvisionRequest {
            schema: schema.to_string(),
            table: table.to_string(),
            columns: bindings.iter().map(ProvisionColumn::from).collect(),
            filter: self.config.filter.clone(),
            listen_on: self.config.listen_on.clone(),
            update_of: self.config.update_of.clone(),
            encoding: self.config.encoding,
            culture: self.config.culture.clone(),
        };
        Ok((bindings, request))
    }

    /// Cancel the listener, wait for it to finish and tear the conversation down.
    ///
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.running.take() else {
            return;
        };

        tracing::info!(table = %self.shared.table, "Stopping change notifier");
        // Fails only when the listener has already exited
        let _ = running.cancel.send(true);
        if let Err(err) = running.handle.await {
            tracing::error!(table = %self.shared.table, "Listener task failed: {}", err);
        }

        teardown_once(&self.shared, self.backend.as_ref(), &running.conversation).await;
        if self.status() != EngineStatus::StoppedDueToError {
            self.shared.set_status(EngineStatus::StoppedDueToCancellation);
        }
    }
}

impl<E: ChangeEntity, B: Backend> Drop for ChangeNotifier<E, B> {
    fn drop(&mut self) {
        let Ok(lifecycle) = self.lifecycle.try_lock() else {
            return;
        };
        if let Some(running) = &lifecycle.running {
            let _ = running.cancel.send(true);
            if !self.shared.torn_down.load(Ordering::Acquire) {
                tracing::warn!(
                    table = %self.shared.table,
                    "Change notifier dropped without stop(); conversation objects were left in place"
                );
            }
        }
    }
}
