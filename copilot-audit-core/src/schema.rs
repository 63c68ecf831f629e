//! Audit schema: what the pipeline expects to find, and the opt-in DDL that
//! creates it.

use sqlx::PgPool;

use crate::error::AuditError;

/// DDL for the five audit tables and their indexes.
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_audit_schema.sql");

/// Serialises concurrent `provision_schema` calls against one database.
const PROVISION_LOCK_KEY: i64 = 0x6175_6469_7473_6368;

/// Tables in parent-before-child order, each with the columns the writer and
/// the sweeper depend on.
pub const AUDIT_TABLES: &[(&str, &[&str])] = &[
    (
        "sessions",
        &["session_id", "user_id", "client_ip", "user_agent", "created_at"],
    ),
    (
        "interactions",
        &[
            "interaction_id",
            "session_id",
            "question",
            "model_name",
            "provider",
            "base_url",
            "cluster",
            "final_answer",
            "status",
            "created_at",
            "total_duration_ms",
            "assistant_duration_ms",
            "parse_duration_ms",
        ],
    ),
    ("thoughts", &["interaction_id", "thought", "created_at"]),
    (
        "tool_calls",
        &[
            "interaction_id",
            "tool_name",
            "tool_input",
            "tool_observation",
            "sequence_number",
            "duration_ms",
            "created_at",
        ],
    ),
    (
        "performance_metrics",
        &["interaction_id", "metric_name", "duration_ms", "created_at"],
    ),
];

/// Columns found for one audit table.
#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: &'static str,
    pub columns: Vec<String>,
}

/// Confirm that every audit table exists in the current schema with every
/// required column. Returns what was found so callers can log it.
pub async fn verify_schema(pool: &PgPool) -> Result<Vec<TableReport>, AuditError> {
    let mut reports = Vec::with_capacity(AUDIT_TABLES.len());

    for (table, required) in AUDIT_TABLES {
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(*table)
        .fetch_all(pool)
        .await?;

        if columns.is_empty() {
            return Err(AuditError::SchemaMissing(format!("table '{}' does not exist", table)));
        }

        let missing = missing_columns(required, &columns);
        if !missing.is_empty() {
            return Err(AuditError::SchemaMissing(format!(
                "table '{}' is missing columns: {}",
                table,
                missing.join(", ")
            )));
        }

        tracing::debug!(table = *table, columns = %columns.join(", "), "Audit table verified");
        reports.push(TableReport { table: *table, columns });
    }

    Ok(reports)
}

/// Create the audit tables and indexes if they are absent. Idempotent.
pub async fn provision_schema(pool: &PgPool) -> Result<(), AuditError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PROVISION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    sqlx::raw_sql(SCHEMA_SQL).execute(&mut *tx).await?;
    tx.commit().await?;

    tracing::info!("Audit schema provisioned");
    Ok(())
}

fn missing_columns<'a>(required: &[&'a str], found: &[String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|col| !found.iter().any(|f| f == *col))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_columns_reports_only_absent() {
        let found = vec!["session_id".to_string(), "created_at".to_string()];
        let missing = missing_columns(&["session_id", "user_id", "created_at"], &found);
        assert_eq!(missing, vec!["user_id"]);
    }

    #[test]
    fn test_ddl_covers_every_required_column() {
        for (table, columns) in AUDIT_TABLES {
            let create = format!("CREATE TABLE IF NOT EXISTS {} (", table);
            let start = SCHEMA_SQL
                .find(&create)
                .unwrap_or_else(|| panic!("no DDL for {}", table));
            let body = &SCHEMA_SQL[start..];
            let end = body.find(");").expect("unterminated CREATE TABLE");
            let body = &body[..end];
            for column in *columns {
                assert!(body.contains(column), "{} DDL lacks {}", table, column);
            }
        }
    }

    #[test]
    fn test_tables_listed_parent_first() {
        let names: Vec<&str> = AUDIT_TABLES.iter().map(|(t, _)| *t).collect();
        assert_eq!(
            names,
            vec!["sessions", "interactions", "thoughts", "tool_calls", "performance_metrics"]
        );
    }
}
