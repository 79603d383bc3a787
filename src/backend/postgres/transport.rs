// ABOUTME: LISTEN/NOTIFY transport that dequeues one record per queue row
// ABOUTME: Notifications only wake the reader; the queue table is the source of truth

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client};

use crate::backend::Transport;
use crate::protocol::Envelope;
use crate::utils::strip_password;

use super::ddl::ConversationObjects;
use super::make_tls;

/// Dedicated connection listening on one conversation channel.
pub struct PostgresTransport {
    client: Client,
    notifications: mpsc::UnboundedReceiver<String>,
    connection_task: JoinHandle<()>,
    dequeue_sql: String,
    heartbeat_sql: String,
    channel: String,
    pending: VecDeque<Envelope>,
}

impl PostgresTransport {
    pub(crate) async fn connect(
        connection_string: &str,
        accept_invalid_certs: bool,
        objects: &ConversationObjects,
    ) -> Result<Self> {
        let tls = make_tls(accept_invalid_certs)?;
        let (client, mut connection) = tokio_postgres::connect(connection_string, tls)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect listener to {}",
                    strip_password(connection_string)
                )
            })?;

        let (tx, notifications) = mpsc::unbounded_channel();
        let channel = objects.channel().to_string();
        let connection_task = tokio::spawn(async move {
            let stream = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            futures::pin_mut!(stream);
            while let Some(message) = stream.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification.channel().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!("Listener notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Listener connection error: {}", e);
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&objects.listen_sql())
            .await
            .with_context(|| format!("Failed to LISTEN on channel '{}'", channel))?;

        tracing::debug!(channel = %channel, "Listening for change notifications");

        Ok(Self {
            client,
            notifications,
            connection_task,
            dequeue_sql: objects.dequeue_sql(),
            heartbeat_sql: objects.heartbeat_sql(),
            channel,
            pending: VecDeque::new(),
        })
    }

    /// Move the oldest queued record into the pending buffer. Returns false when the queue is empty.
    async fn dequeue(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_opt(&self.dequeue_sql, &[])
            .await
            .with_context(|| format!("Failed to dequeue from channel '{}'", self.channel))?;
        let Some(row) = row else {
            return Ok(false);
        };

        let types: Vec<String> = row.get(0);
        let bodies: Vec<Option<Vec<u8>>> = row.get(1);
        if types.len() != bodies.len() {
            bail!(
                "Queue row has {} message types but {} bodies",
                types.len(),
                bodies.len()
            );
        }
        self.pending.extend(
            types
                .into_iter()
                .zip(bodies)
                .map(|(type_tag, payload)| Envelope::new(type_tag, payload)),
        );
        Ok(true)
    }
}

#[async_trait]
impl Transport for PostgresTransport {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.pending.pop_front() {
                return Ok(Some(envelope));
            }
            if self.dequeue().await? {
                continue;
            }

            match tokio::time::timeout_at(deadline, self.notifications.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => bail!("Listener connection for '{}' closed", self.channel),
                Ok(Some(_)) => {
                    // One dequeue pass serves every notification already received
                    while self.notifications.try_recv().is_ok() {}
                }
            }
        }
    }

    async fn request_heartbeat(&mut self) -> Result<()> {
        self.client
            .batch_execute(&self.heartbeat_sql)
            .await
            .with_context(|| format!("Failed to request heartbeat on '{}'", self.channel))
    }
}

impl Drop for PostgresTransport {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}
