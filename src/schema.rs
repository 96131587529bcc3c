//! Postgres identifier helpers shared by the DSN rewrite and the migration runner.

use indoc::formatdoc;

use crate::{Error, Result};

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENT_LEN: usize = 63;

/// Name of the per-namespace bookkeeping table.
pub const REVISIONS_TABLE: &str = "tenantry_schema_revisions";

/// Schema names travel unquoted inside DSNs, so only plain identifiers are accepted.
pub fn validate_schema_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IDENT_LEN {
        return Err(Error::Configuration(format!(
            "schema name `{name}` must be 1-{MAX_IDENT_LEN} bytes"
        )));
    }
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Configuration(format!(
            "schema name `{name}` must match [A-Za-z_][A-Za-z0-9_]*"
        )));
    }
    if name.to_ascii_lowercase().starts_with("pg_") {
        return Err(Error::Configuration(format!(
            "schema name `{name}` uses the reserved pg_ prefix"
        )));
    }
    Ok(())
}

/// Unquoted identifiers fold to lower case; a DSN `search_path=TenantA`
/// selects `tenanta`, so statements issued by the runner must agree.
pub fn fold_ident(name: &str) -> String {
    name.to_ascii_lowercase()
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

pub(crate) fn create_schema_sql(schema: &str) -> String {
    format!(
        "create schema if not exists {}",
        quote_ident(&fold_ident(schema))
    )
}

pub(crate) fn set_search_path_sql(schema: &str) -> String {
    format!("set search_path to {}", quote_ident(&fold_ident(schema)))
}

pub(crate) fn revisions_table_sql() -> String {
    formatdoc!(
        "create table if not exists {table} (
            version bigint primary key,
            name text not null,
            checksum text not null,
            applied_at timestamptz not null default now()
        )",
        table = REVISIONS_TABLE,
    )
}
