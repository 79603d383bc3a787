// ABOUTME: PostgreSQL backing store: trigger + queue table + LISTEN/NOTIFY
// ABOUTME: Connection helpers and the Backend implementation

pub mod ddl;
pub mod privileges;
pub mod schema;
pub mod transport;

use anyhow::{Context, Result};
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::Client;

use crate::backend::{Backend, Conversation, ProvisionRequest};
use crate::marshal::Dialect;
use crate::model::ColumnDescriptor;
use crate::protocol::NamingConvention;
use crate::utils::{strip_password, validate_identifier};

pub use ddl::ConversationObjects;
pub use privileges::{check_trigger_privileges, TriggerPrivilegeCheck};
pub use schema::get_table_columns;
pub use transport::PostgresTransport;

pub(crate) fn make_tls(accept_invalid_certs: bool) -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect to PostgreSQL, driving the connection on a background task.
pub async fn connect(connection_string: &str, accept_invalid_certs: bool) -> Result<Client> {
    let tls = make_tls(accept_invalid_certs)?;
    let (client, connection) = tokio_postgres::connect(connection_string, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", strip_password(connection_string)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    Ok(client)
}

/// Backing store on a PostgreSQL database.
///
/// Setup calls open a short-lived connection each; every transport holds its own.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    connection_string: String,
    accept_invalid_certs: bool,
}

impl PostgresBackend {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            accept_invalid_certs: false,
        }
    }

    /// Skip server certificate verification.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    async fn client(&self) -> Result<Client> {
        connect(&self.connection_string, self.accept_invalid_certs).await
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    type Transport = PostgresTransport;

    fn dialect(&self) -> Dialect {
        Dialect::POSTGRES
    }

    async fn has_required_permissions(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let check = check_trigger_privileges(&client, schema, table).await?;
        if !check.table_exists {
            // Introspection reports the missing table with a better error
            return Ok(true);
        }
        if !check.is_sufficient() {
            tracing::warn!(
                schema = %schema,
                table = %table,
                has_trigger = check.has_trigger,
                has_schema_create = check.has_schema_create,
                "User lacks privileges to provision change notifications"
            );
        }
        Ok(check.is_sufficient())
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let client = self.client().await?;
        get_table_columns(&client, schema, table).await
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Conversation> {
        validate_identifier(&request.schema)?;
        validate_identifier(&request.table)?;
        for column in &request.update_of {
            validate_identifier(column)?;
        }

        let naming = NamingConvention::generate(&request.table);
        let objects = ConversationObjects::new(&naming, &request.schema, &request.table);
        let sql = objects.provision_sql(request, &self.dialect())?;

        let client = self.client().await?;
        // A multi-statement simple query runs as one implicit transaction
        client.batch_execute(&sql).await.with_context(|| {
            format!(
                "Failed to provision change notifications on {}.{}",
                request.schema, request.table
            )
        })?;

        tracing::info!(
            table = %format!("{}.{}", request.schema, request.table),
            conversation = %naming,
            columns = request.columns.len(),
            "Provisioned change notification objects"
        );

        Ok(Conversation {
            endpoint: objects.channel().to_string(),
            naming,
            schema: request.schema.clone(),
            table: request.table.clone(),
        })
    }

    async fn teardown(&self, conversation: &Conversation) -> Result<()> {
        let objects =
            ConversationObjects::new(&conversation.naming, &conversation.schema, &conversation.table);
        let client = self.client().await?;
        client
            .batch_execute(&objects.teardown_sql())
            .await
            .with_context(|| format!("Failed to tear down conversation '{}'", conversation.naming))?;

        tracing::info!(conversation = %conversation.naming, "Removed change notification objects");
        Ok(())
    }

    async fn connect(&self, conversation: &Conversation) -> Result<PostgresTransport> {
        let objects =
            ConversationObjects::new(&conversation.naming, &conversation.schema, &conversation.table);
        PostgresTransport::connect(&self.connection_string, self.accept_invalid_certs, &objects).await
    }
}
