// ABOUTME: The listening loop: receive, reassemble, convert, dispatch
// ABOUTME: Owns the bag, the watchdog clock and the transport for one run

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::backend::{Backend, Conversation, Transport};
use crate::config::{IdentityConversionPolicy, ReconnectPolicy, StartOptions};
use crate::error::{NotifierError, Severity};
use crate::marshal::Marshaler;
use crate::model::{assemble, ChangeEntity, ColumnBinding};
use crate::protocol::{BagStatus, ClosedRecord, Envelope, MessageBag};
use crate::utils::retry_with_backoff;

use super::engine::{teardown_once, Shared};
use super::events::ChangeEvent;
use super::status::EngineStatus;

/// Why the loop ended.
#[derive(Debug)]
pub(crate) enum Exit {
    Cancelled,
    Fatal(NotifierError),
}

pub(crate) struct Listener<E: ChangeEntity, B: Backend> {
    pub(crate) shared: Arc<Shared<E>>,
    pub(crate) backend: Arc<B>,
    pub(crate) conversation: Conversation,
    pub(crate) transport: B::Transport,
    pub(crate) bag: MessageBag,
    pub(crate) bindings: Vec<ColumnBinding>,
    pub(crate) marshaler: Marshaler,
    pub(crate) options: StartOptions,
    pub(crate) identity_policy: IdentityConversionPolicy,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) heartbeat: bool,
    /// Set by `stop()`; read at every loop boundary
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) entity: PhantomData<fn() -> E>,
}

impl<E: ChangeEntity, B: Backend> Listener<E, B> {
    /// Run until cancelled or a fatal fault; a fatal exit tears the conversation down.
    pub(crate) async fn run(mut self) {
        tracing::info!(
            table = %self.shared.table,
            conversation = %self.conversation.naming,
            "Listening for changes"
        );

        match self.listen().await {
            Exit::Cancelled => {
                tracing::info!(table = %self.shared.table, "Listener cancelled");
            }
            Exit::Fatal(error) => {
                self.shared.report(Severity::Fatal, error);
                teardown_once(&self.shared, self.backend.as_ref(), &self.conversation).await;
                self.shared.set_status(EngineStatus::StoppedDueToError);
            }
        }
    }

    async fn listen(&mut self) -> Exit {
        let mut last_notification = Instant::now();

        loop {
            if self.is_cancelled() {
                return Exit::Cancelled;
            }

            let quiet = last_notification.elapsed();
            if quiet >= self.options.watchdog_timeout {
                return Exit::Fatal(NotifierError::WatchdogTimeout {
                    elapsed_secs: quiet.as_secs_f64(),
                    limit_secs: self.options.watchdog_timeout.as_secs_f64(),
                });
            }
            let wait = self.options.timeout.min(self.options.watchdog_timeout - quiet);

            self.shared.set_status(EngineStatus::WaitingForNotification);
            // Cancellation is observed once the bounded receive returns
            match self.transport.receive(wait).await {
                Ok(Some(envelope)) => {
                    last_notification = Instant::now();
                    self.shared.diagnostics.envelope_received();
                    self.handle(envelope);
                }
                Ok(None) => {
                    if !self.heartbeat || self.is_cancelled() {
                        continue;
                    }
                    tracing::trace!(table = %self.shared.table, "Receive timed out, requesting heartbeat");
                    if let Err(err) = self.transport.request_heartbeat().await {
                        if let Err(exit) = self.recover(err).await {
                            return exit;
                        }
                    }
                }
                Err(err) => {
                    if let Err(exit) = self.recover(err).await {
                        return exit;
                    }
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn handle(&mut self, envelope: Envelope) {
        tracing::trace!(tag = %envelope.type_tag, "Envelope received");
        match self
            .bag
            .add_message(&envelope.type_tag, envelope.payload.as_deref())
        {
            Ok(BagStatus::Closed) => {
                if let Some(closed) = self.bag.take_closed() {
                    self.dispatch(closed);
                }
            }
            Ok(_) => {}
            // The bag has already discarded the record
            Err(error) => self.shared.report(Severity::Error, error),
        }
    }

    fn dispatch(&mut self, closed: ClosedRecord) {
        if closed.kind.is_heartbeat() {
            self.shared.diagnostics.heartbeat();
            tracing::trace!(table = %self.shared.table, "Heartbeat cycle closed");
            return;
        }

        let assembled = match assemble(
            &self.bindings,
            &closed,
            &self.marshaler,
            self.identity_policy,
        ) {
            Ok(assembled) => assembled,
            Err(error) => {
                self.shared.report(Severity::Error, error);
                return;
            }
        };
        for fault in assembled.faults {
            self.shared.report(Severity::Warning, fault);
        }

        let entity = match E::from_record(&assembled.record) {
            Ok(entity) => entity,
            Err(err) => {
                self.shared
                    .report(Severity::Error, NotifierError::Mapping(format!("{:#}", err)));
                return;
            }
        };

        let event = ChangeEvent {
            entity,
            kind: closed.kind,
            raw_kind: closed.raw_kind,
        };
        self.shared.subscribers.emit_changed(&event);
        self.shared.diagnostics.event_dispatched();
        tracing::debug!(table = %self.shared.table, kind = %event.kind, "Change dispatched");
    }

    /// Bounded reconnect after a transport fault.
    async fn recover(&mut self, cause: anyhow::Error) -> Result<(), Exit> {
        self.shared
            .report(Severity::Warning, NotifierError::transport(cause));
        // Envelopes of the record in flight went down with the old transport
        self.bag.reset();

        let max_attempts = self.reconnect.max_attempts;
        if max_attempts == 0 {
            return Err(Exit::Fatal(NotifierError::ReconnectFailed {
                attempts: 0,
                reason: "reconnect is disabled".to_string(),
            }));
        }

        let shared = Arc::clone(&self.shared);
        let backend = Arc::clone(&self.backend);
        let conversation = self.conversation.clone();
        let cancel = self.cancel.clone();
        let (shared, backend, conversation, cancel) = (&shared, &backend, &conversation, &cancel);

        let result = retry_with_backoff(
            |attempt| async move {
                if *cancel.borrow() {
                    return Ok(None);
                }
                shared.diagnostics.reconnect_attempt();
                tracing::info!(table = %shared.table, attempt, "Reconnecting transport");
                match backend.connect(conversation).await {
                    Ok(transport) => Ok(Some(transport)),
                    Err(err) => {
                        shared.report(
                            Severity::Warning,
                            NotifierError::Transport(format!(
                                "reconnect attempt {} failed: {:#}",
                                attempt, err
                            )),
                        );
                        Err(err)
                    }
                }
            },
            max_attempts - 1,
            self.reconnect.initial_delay(),
        )
        .await;

        match result {
            Ok(Some(transport)) => {
                tracing::info!(table = %self.shared.table, "Transport reconnected");
                self.transport = transport;
                Ok(())
            }
            Ok(None) => Err(Exit::Cancelled),
            Err(err) => Err(Exit::Fatal(NotifierError::ReconnectFailed {
                attempts: max_attempts,
                reason: format!("{:#}", err),
            })),
        }
    }
}
