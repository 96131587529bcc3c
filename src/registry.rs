//! Sources of tenant configuration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    Error, Result,
    tenant::{TenantDbConfig, TenantDbConfigRow},
};

/// Authoritative list of tenant database configurations.
///
/// Owned by the administrative side of the system; this crate only reads it.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Every registered tenant, ordered by tenant code.
    async fn list_all(&self) -> Result<Vec<TenantDbConfig>>;

    /// Codes of every registered tenant, ordered.
    ///
    /// Only the codes are read, so one malformed record does not hide the
    /// rest of the fleet. The record itself fails later, in
    /// [`find_by_code`](Self::find_by_code).
    async fn list_codes(&self) -> Result<Vec<String>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .map(|t| t.tenant_code)
            .collect())
    }

    /// Fails with [`Error::TenantNotFound`] when the code is unknown.
    async fn find_by_code(&self, tenant_code: &str) -> Result<TenantDbConfig>;
}

/// Reads `tenant_db_configs` from the administrative database.
#[derive(Clone, Debug)]
pub struct PgTenantRegistry {
    pool: PgPool,
    table: String,
}

impl PgTenantRegistry {
    pub const DEFAULT_TABLE: &'static str = "tenant_db_configs";

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: Self::DEFAULT_TABLE.to_string(),
        }
    }

    /// Read from a differently named (optionally schema-qualified) table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified_table(&self) -> String {
        self.table
            .split('.')
            .map(crate::schema::quote_ident)
            .collect::<Vec<_>>()
            .join(".")
    }

    fn select_sql(&self) -> String {
        format!(
            "select tenant_code, coalesce(mode, 'database') as mode, primary_dsn, \
             replica_dsns, schema from {}",
            self.qualified_table()
        )
    }
}

#[async_trait]
impl TenantRegistry for PgTenantRegistry {
    async fn list_all(&self) -> Result<Vec<TenantDbConfig>> {
        let sql = format!("{} order by tenant_code", self.select_sql());
        let rows: Vec<TenantDbConfigRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TenantDbConfig::try_from).collect()
    }

    async fn list_codes(&self) -> Result<Vec<String>> {
        let sql = format!(
            "select tenant_code from {} order by tenant_code",
            self.qualified_table()
        );
        Ok(sqlx::query_scalar(&sql).fetch_all(&self.pool).await?)
    }

    async fn find_by_code(&self, tenant_code: &str) -> Result<TenantDbConfig> {
        let sql = format!("{} where tenant_code = $1", self.select_sql());
        let row: Option<TenantDbConfigRow> = sqlx::query_as(&sql)
            .bind(tenant_code)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row.try_into(),
            None => Err(Error::TenantNotFound(tenant_code.to_string())),
        }
    }
}

/// Fixed tenant list, e.g. from the `[[tenants]]` section of the config file.
#[derive(Clone, Debug, Default)]
pub struct StaticTenantRegistry {
    tenants: BTreeMap<String, TenantDbConfig>,
}

impl StaticTenantRegistry {
    pub fn new<I>(tenants: I) -> Self
    where
        I: IntoIterator<Item = TenantDbConfig>,
    {
        Self {
            tenants: tenants
                .into_iter()
                .map(|t| (t.tenant_code.clone(), t))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[async_trait]
impl TenantRegistry for StaticTenantRegistry {
    async fn list_all(&self) -> Result<Vec<TenantDbConfig>> {
        Ok(self.tenants.values().cloned().collect())
    }

    async fn list_codes(&self) -> Result<Vec<String>> {
        Ok(self.tenants.keys().cloned().collect())
    }

    async fn find_by_code(&self, tenant_code: &str) -> Result<TenantDbConfig> {
        self.tenants
            .get(tenant_code)
            .cloned()
            .ok_or_else(|| Error::TenantNotFound(tenant_code.to_string()))
    }
}
