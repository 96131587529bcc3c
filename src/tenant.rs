//! Per-tenant database configuration records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How a tenant's data is separated from other tenants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// The tenant owns a whole database; its DSNs point at it directly.
    #[default]
    #[serde(alias = "dedicated-database")]
    Database,
    /// Tenants share a database and are separated by Postgres schema.
    #[serde(alias = "shared-schema")]
    Schema,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::Database => "database",
            IsolationMode::Schema => "schema",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            // the admin table defaults the column to '' on some legacy rows
            "database" | "dedicated-database" | "" => Ok(IsolationMode::Database),
            "schema" | "shared-schema" => Ok(IsolationMode::Schema),
            other => Err(Error::Configuration(format!(
                "unknown isolation mode `{other}`"
            ))),
        }
    }
}

/// Connection settings for one tenant, as stored by the administrative database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDbConfig {
    pub tenant_code: String,
    #[serde(default, alias = "mode")]
    pub isolation_mode: IsolationMode,
    pub primary_dsn: String,
    #[serde(default)]
    pub replica_dsns: Vec<String>,
    #[serde(default, alias = "schema")]
    pub schema_name: Option<String>,
}

impl TenantDbConfig {
    pub fn dedicated(tenant_code: impl Into<String>, primary_dsn: impl Into<String>) -> Self {
        Self {
            tenant_code: tenant_code.into(),
            isolation_mode: IsolationMode::Database,
            primary_dsn: primary_dsn.into(),
            replica_dsns: Vec::new(),
            schema_name: None,
        }
    }

    pub fn shared(
        tenant_code: impl Into<String>,
        primary_dsn: impl Into<String>,
        schema_name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_code: tenant_code.into(),
            isolation_mode: IsolationMode::Schema,
            primary_dsn: primary_dsn.into(),
            replica_dsns: Vec::new(),
            schema_name: Some(schema_name.into()),
        }
    }

    pub fn with_replicas<I, S>(mut self, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replica_dsns = replicas.into_iter().map(Into::into).collect();
        self
    }

    /// Reject records that cannot produce a working handle.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_code.trim().is_empty() {
            return Err(Error::Configuration("tenant code is empty".into()));
        }
        if self.primary_dsn.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "tenant {} has no primary DSN",
                self.tenant_code
            )));
        }
        if self.replica_dsns.iter().any(|dsn| dsn.trim().is_empty()) {
            return Err(Error::Configuration(format!(
                "tenant {} has an empty replica DSN",
                self.tenant_code
            )));
        }
        if self.isolation_mode == IsolationMode::Schema {
            match self.schema_name.as_deref().map(str::trim) {
                Some(schema) if !schema.is_empty() => crate::schema::validate_schema_name(schema)?,
                _ => {
                    return Err(Error::Configuration(format!(
                        "tenant {} uses schema isolation but has no schema name",
                        self.tenant_code
                    )));
                }
            }
        }
        Ok(())
    }

    /// Schema the tenant's sessions must be bound to, if any.
    ///
    /// Always `None` for dedicated databases, even when a schema name is set.
    pub fn schema_override(&self) -> Option<&str> {
        match self.isolation_mode {
            IsolationMode::Database => None,
            IsolationMode::Schema => self
                .schema_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        }
    }

    /// Decode the JSON array stored in the admin table's `replica_dsns` column.
    pub fn parse_replica_list(raw: Option<&str>) -> Result<Vec<String>> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Vec::new()),
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .map_err(|e| Error::Configuration(format!("parse replica DSNs: {e}"))),
        }
    }
}

// DSNs carry credentials; keep them out of logs.
impl fmt::Debug for TenantDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantDbConfig")
            .field("tenant_code", &self.tenant_code)
            .field("isolation_mode", &self.isolation_mode)
            .field("primary_dsn", &"<redacted>")
            .field("replica_count", &self.replica_dsns.len())
            .field("schema_name", &self.schema_name)
            .finish()
    }
}

/// Row shape of the admin database's `tenant_db_configs` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TenantDbConfigRow {
    pub tenant_code: String,
    pub mode: String,
    pub primary_dsn: String,
    pub replica_dsns: Option<String>,
    pub schema: Option<String>,
}

impl TryFrom<TenantDbConfigRow> for TenantDbConfig {
    type Error = Error;

    fn try_from(row: TenantDbConfigRow) -> Result<Self> {
        let isolation_mode = row.mode.parse()?;
        let replica_dsns = TenantDbConfig::parse_replica_list(row.replica_dsns.as_deref())?;
        Ok(TenantDbConfig {
            tenant_code: row.tenant_code,
            isolation_mode,
            primary_dsn: row.primary_dsn,
            replica_dsns,
            schema_name: row.schema.filter(|s| !s.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_schema_requires_schema_name() {
        let mut cfg = TenantDbConfig::shared("acme", "postgres://h/db", "");
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        cfg.schema_name = None;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        cfg.schema_name = Some("tenant_acme".into());
        cfg.validate().unwrap();
        assert_eq!(cfg.schema_override(), Some("tenant_acme"));
    }

    #[test]
    fn dedicated_ignores_schema_name() {
        let mut cfg = TenantDbConfig::dedicated("acme", "postgres://h/acme");
        cfg.schema_name = Some("ignored".into());
        cfg.validate().unwrap();
        assert_eq!(cfg.schema_override(), None);
    }

    #[test]
    fn parses_modes_and_aliases() {
        assert_eq!("schema".parse::<IsolationMode>().unwrap(), IsolationMode::Schema);
        assert_eq!(
            "shared-schema".parse::<IsolationMode>().unwrap(),
            IsolationMode::Schema
        );
        assert_eq!(
            "dedicated-database".parse::<IsolationMode>().unwrap(),
            IsolationMode::Database
        );
        assert!("sharded".parse::<IsolationMode>().is_err());
    }

    #[test]
    fn replica_list_is_json() {
        assert!(TenantDbConfig::parse_replica_list(None).unwrap().is_empty());
        assert!(TenantDbConfig::parse_replica_list(Some(" ")).unwrap().is_empty());
        let parsed =
            TenantDbConfig::parse_replica_list(Some(r#"["postgres://r1/db","postgres://r2/db"]"#))
                .unwrap();
        assert_eq!(parsed.len(), 2);
        let err = TenantDbConfig::parse_replica_list(Some("postgres://r1/db")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn row_conversion_rejects_bad_replicas() {
        let row = TenantDbConfigRow {
            tenant_code: "acme".into(),
            mode: "schema".into(),
            primary_dsn: "postgres://h/db".into(),
            replica_dsns: Some("not json".into()),
            schema: Some("acme".into()),
        };
        assert!(matches!(
            TenantDbConfig::try_from(row),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn debug_redacts_dsns() {
        let cfg = TenantDbConfig::dedicated("acme", "postgres://user:secret@h/acme");
        let out = format!("{cfg:?}");
        assert!(!out.contains("secret"));
        assert!(out.contains("acme"));
    }

    #[test]
    fn deserializes_admin_style_keys() {
        let cfg: TenantDbConfig = serde_json::from_value(serde_json::json!({
            "tenant_code": "acme",
            "mode": "schema",
            "primary_dsn": "postgres://h/db",
            "schema": "acme"
        }))
        .unwrap();
        assert_eq!(cfg.isolation_mode, IsolationMode::Schema);
        assert_eq!(cfg.schema_override(), Some("acme"));
    }
}
