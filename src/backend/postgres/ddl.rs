// ABOUTME: SQL text for the objects backing one PostgreSQL conversation
// ABOUTME: Queue table, trigger function, trigger, heartbeat function and their teardown

use anyhow::{bail, Result};

use crate::backend::{ProvisionColumn, ProvisionRequest};
use crate::config::{Culture, TextEncoding};
use crate::marshal::dialect::OFFSET_SEPARATOR;
use crate::marshal::{ColumnType, Dialect};
use crate::protocol::{ChangeKind, NamingConvention};
use crate::utils::{quote_ident, quote_literal};

const BODY_TAG: &str = "$cn_body$";

/// Names of every object created for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationObjects {
    pub naming: NamingConvention,
    pub schema: String,
    pub table: String,
    pub queue: String,
    pub notify_function: String,
    pub trigger: String,
    pub heartbeat_function: String,
}

impl ConversationObjects {
    pub fn new(naming: &NamingConvention, schema: &str, table: &str) -> Self {
        let name = naming.name();
        Self {
            naming: naming.clone(),
            schema: schema.to_string(),
            table: table.to_string(),
            queue: format!("{}_queue", name),
            notify_function: format!("{}_notify", name),
            trigger: format!("{}_trigger", name),
            heartbeat_function: format!("{}_heartbeat", name),
        }
    }

    /// LISTEN/NOTIFY channel of the conversation.
    pub fn channel(&self) -> &str {
        self.naming.name()
    }

    fn qualified(&self, object: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(object))
    }

    pub fn qualified_table(&self) -> String {
        self.qualified(&self.table)
    }

    pub fn qualified_queue(&self) -> String {
        self.qualified(&self.queue)
    }

    pub fn qualified_heartbeat(&self) -> String {
        self.qualified(&self.heartbeat_function)
    }

    /// One queue row per record; the arrays hold its envelopes in wire order.
    pub fn create_queue_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                 id BIGSERIAL PRIMARY KEY,\n    \
                 message_types TEXT[] NOT NULL,\n    \
                 message_bodies BYTEA[] NOT NULL,\n    \
                 enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
             )",
            self.qualified_queue()
        )
    }

    pub fn create_notify_function_sql(
        &self,
        request: &ProvisionRequest,
        dialect: &Dialect,
    ) -> Result<String> {
        let charset = charset(request.encoding)?;
        let mut body = String::new();

        if let Some(filter) = request.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            if filter.contains(BODY_TAG) {
                bail!("filter clause must not contain {}", BODY_TAG);
            }
            body.push_str(&format!(
                "    IF NOT EXISTS (SELECT 1 FROM (SELECT (rec).*) AS t WHERE {}) THEN\n        \
                         RETURN NULL;\n    \
                     END IF;\n",
                filter
            ));
        }

        body.push_str(&format!(
            "    types := ARRAY[{}::text];\n    \
                 bodies := ARRAY[convert_to(kind, {})];\n",
            quote_literal(&self.naming.start_signature()),
            charset
        ));
        let prefix = quote_literal(&format!("{}/", self.naming.name()));
        for column in &request.columns {
            body.push_str(&format!(
                "    types := array_append(types, {} || kind || {});\n    \
                     bodies := array_append(bodies, {});\n",
                prefix,
                quote_literal(&format!("/{}", column.name)),
                column_payload(column, dialect, &request.culture, &charset)
            ));
        }
        body.push_str(&format!(
            "    types := array_append(types, {}::text);\n    \
                 bodies := array_append(bodies, convert_to(kind, {}));\n\
             \n    \
                 INSERT INTO {} (message_types, message_bodies) VALUES (types, bodies);\n    \
                 PERFORM pg_notify({}, '');\n    \
                 RETURN NULL;\n",
            quote_literal(&self.naming.end_signature()),
            charset,
            self.qualified_queue(),
            quote_literal(self.channel())
        ));

        Ok(format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger\n\
             LANGUAGE plpgsql AS {tag}\n\
             DECLARE\n    \
                 rec {table}%ROWTYPE;\n    \
                 kind TEXT;\n    \
                 types TEXT[];\n    \
                 bodies BYTEA[];\n\
             BEGIN\n    \
                 IF TG_OP = 'DELETE' THEN\n        \
                     rec := OLD;\n        \
                     kind := 'Delete';\n    \
                 ELSIF TG_OP = 'UPDATE' THEN\n        \
                     rec := NEW;\n        \
                     kind := 'Update';\n    \
                 ELSE\n        \
                     rec := NEW;\n        \
                     kind := 'Insert';\n    \
                 END IF;\n\
             {body}\
             END;\n\
             {tag}",
            function = self.qualified(&self.notify_function),
            table = self.qualified_table(),
            tag = BODY_TAG,
            body = body,
        ))
    }

    pub fn create_trigger_sql(&self, request: &ProvisionRequest) -> Result<String> {
        let mut events = Vec::new();
        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            if !request.listen_on.contains(&kind) {
                continue;
            }
            let event = match kind {
                ChangeKind::Update if !request.update_of.is_empty() => format!(
                    "UPDATE OF {}",
                    request
                        .update_of
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                other => other.as_str().to_uppercase(),
            };
            events.push(event);
        }
        if events.is_empty() {
            bail!("trigger needs at least one of INSERT, UPDATE or DELETE");
        }

        Ok(format!(
            "DROP TRIGGER IF EXISTS {trigger} ON {table};\n\
             CREATE TRIGGER {trigger} AFTER {events} ON {table}\n    \
                 FOR EACH ROW EXECUTE FUNCTION {function}()",
            trigger = quote_ident(&self.trigger),
            table = self.qualified_table(),
            events = events.join(" OR "),
            function = self.qualified(&self.notify_function),
        ))
    }

    /// Function that enqueues an empty `None` cycle.
    pub fn create_heartbeat_function_sql(&self, encoding: TextEncoding) -> Result<String> {
        let charset = charset(encoding)?;
        let none = quote_literal(ChangeKind::None.as_str());
        Ok(format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS void\n\
             LANGUAGE plpgsql AS {tag}\n\
             BEGIN\n    \
                 INSERT INTO {queue} (message_types, message_bodies) VALUES (\n        \
                     ARRAY[{start}::text, {end}::text],\n        \
                     ARRAY[convert_to({none}, {charset}), convert_to({none}, {charset})]\n    \
                 );\n    \
                 PERFORM pg_notify({channel}, '');\n\
             END;\n\
             {tag}",
            function = self.qualified_heartbeat(),
            tag = BODY_TAG,
            queue = self.qualified_queue(),
            start = quote_literal(&self.naming.start_signature()),
            end = quote_literal(&self.naming.end_signature()),
            none = none,
            charset = charset,
            channel = quote_literal(self.channel()),
        ))
    }

    /// All provisioning statements, run as one implicit transaction.
    pub fn provision_sql(&self, request: &ProvisionRequest, dialect: &Dialect) -> Result<String> {
        Ok([
            self.create_queue_sql(),
            self.create_notify_function_sql(request, dialect)?,
            self.create_heartbeat_function_sql(request.encoding)?,
            self.create_trigger_sql(request)?,
        ]
        .join(";\n")
            + ";")
    }

    pub fn teardown_sql(&self) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {trigger} ON {table};\n\
             DROP FUNCTION IF EXISTS {notify}();\n\
             DROP FUNCTION IF EXISTS {heartbeat}();\n\
             DROP TABLE IF EXISTS {queue};",
            trigger = quote_ident(&self.trigger),
            table = self.qualified_table(),
            notify = self.qualified(&self.notify_function),
            heartbeat = self.qualified_heartbeat(),
            queue = self.qualified_queue(),
        )
    }

    /// Take the oldest record off the queue.
    pub fn dequeue_sql(&self) -> String {
        let queue = self.qualified_queue();
        format!(
            "DELETE FROM {queue} WHERE id = (\n    \
                 SELECT id FROM {queue} ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED\n\
             ) RETURNING message_types, message_bodies",
            queue = queue
        )
    }

    pub fn listen_sql(&self) -> String {
        format!("LISTEN {}", quote_ident(self.channel()))
    }

    pub fn heartbeat_sql(&self) -> String {
        format!("SELECT {}()", self.qualified_heartbeat())
    }
}

fn charset(encoding: TextEncoding) -> Result<String> {
    match encoding {
        TextEncoding::Utf8 => Ok(quote_literal("UTF8")),
        TextEncoding::Latin1 => Ok(quote_literal("LATIN1")),
        TextEncoding::Utf16Le => bail!("PostgreSQL cannot encode payloads as UTF-16"),
    }
}

/// Expression rendering one column of `rec` into its wire payload.
fn column_payload(
    column: &ProvisionColumn,
    dialect: &Dialect,
    culture: &Culture,
    charset: &str,
) -> String {
    let field = format!("rec.{}", quote_ident(&column.name));
    let text = match column.column_type {
        ColumnType::Binary => return field,
        ColumnType::Boolean => format!(
            "CASE WHEN {field} IS NULL THEN NULL WHEN {field} THEN '1' ELSE '0' END",
            field = field
        ),
        ColumnType::Decimal => localized_number(format!("{}::numeric::text", field), culture),
        ColumnType::Real | ColumnType::Double => {
            localized_number(format!("{}::text", field), culture)
        }
        column_type => match dialect.temporal_format(column_type) {
            Some(format) => {
                let source = match format.offset_source {
                    Some(offset) => format!("{}{}{}", format.source, OFFSET_SEPARATOR, offset),
                    None => format.source.to_string(),
                };
                format!("to_char({}, {})", field, quote_literal(&source))
            }
            None => format!("{}::text", field),
        },
    };
    format!("convert_to({}, {})", text, charset)
}

/// Swap the decimal point for the culture's separator; PostgreSQL never groups digits in `::text`.
fn localized_number(text: String, culture: &Culture) -> String {
    if culture.decimal_separator == '.' {
        return text;
    }
    format!(
        "replace({}, '.', {})",
        text,
        quote_literal(&culture.decimal_separator.to_string())
    )
}
