// ABOUTME: Column introspection through information_schema
// ABOUTME: Reports user-defined and array columns by their udt name

use anyhow::{Context, Result};
use tokio_postgres::Client;

use crate::model::ColumnDescriptor;

/// Extract column metadata from a PostgreSQL table.
///
/// Returns an empty list when the table does not exist.
pub async fn get_table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> Result<Vec<ColumnDescriptor>> {
    let rows = client
        .query(
            "SELECT column_name::text,
                    CASE WHEN data_type IN ('USER-DEFINED', 'ARRAY')
                         THEN udt_name::text
                         ELSE data_type::text
                    END,
                    ordinal_position::int4,
                    is_nullable = 'YES'
             FROM information_schema.columns
             WHERE table_schema = $1::text AND table_name = $2::text
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    Ok(rows
        .iter()
        .map(|row| {
            let ordinal: i32 = row.get(2);
            ColumnDescriptor {
                name: row.get(0),
                type_name: row.get(1),
                ordinal: u32::try_from(ordinal).unwrap_or_default(),
                nullable: row.get(3),
            }
        })
        .collect())
}
