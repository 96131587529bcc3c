//! Runtime configuration: a TOML file overlaid with `TENANTRY_*` environment variables.
//!
//! ```toml
//! [admin]
//! database_url = "postgres://admin@db/admin"
//! pool = { max_connections = 5 }
//!
//! [migrations]
//! tenant_dir = "db/tenant"
//!
//! [tenant_pool]
//! max_connections = 4
//! statement_timeout_ms = 30000
//!
//! [[tenants]]
//! tenant_code = "acme"
//! isolation_mode = "schema"
//! primary_dsn = "postgres://app@db/shared"
//! schema_name = "acme"
//! ```
//!
//! `TENANTRY_ADMIN__DATABASE_URL=...` overrides `admin.database_url`.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, builder::PoolSettings, tenant::TenantDbConfig};

pub const DEFAULT_CONFIG_FILE: &str = "tenantry.toml";
pub const ENV_PREFIX: &str = "TENANTRY_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub admin: AdminConfig,
    pub migrations: MigrationsConfig,
    pub log: LogConfig,
    /// Pool sizing for every tenant primary and replica.
    pub tenant_pool: PoolSettings,
    /// Fixed tenant list. When non-empty it replaces the admin registry table.
    pub tenants: Vec<TenantDbConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub database_url: Option<String>,
    pub pool: PoolSettings,
    /// Registry table, optionally schema-qualified.
    pub registry_table: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub admin_dir: PathBuf,
    pub tenant_dir: PathBuf,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            admin_dir: PathBuf::from("migrations/admin"),
            tenant_dir: PathBuf::from("migrations/tenant"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Layered sources: the TOML file, then the environment. Missing keys take defaults.
    ///
    /// An explicitly named file must exist; the default `tenantry.toml` is optional.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::new();
        match path {
            Some(path) if !path.exists() => {
                return Err(Error::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            Some(path) => {
                tracing::debug!(config_path = %path.display(), "loading configuration file");
                figment = figment.merge(Toml::file(path));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path)?)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenants {
            tenant.validate()?;
            if !seen.insert(tenant.tenant_code.as_str()) {
                return Err(Error::Configuration(format!(
                    "tenant {} is listed more than once",
                    tenant.tenant_code
                )));
            }
        }
        Ok(())
    }

    pub fn admin_database_url(&self) -> Result<&str> {
        self.admin
            .database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Error::Configuration(
                    "no admin database URL; set admin.database_url, \
                     TENANTRY_ADMIN__DATABASE_URL or DATABASE_URL"
                        .into(),
                )
            })
    }

    pub fn has_static_tenants(&self) -> bool {
        !self.tenants.is_empty()
    }
}
