//! Turning tenant configuration into live connection handles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, info};

use crate::{
    Error, Result, dsn,
    handle::TenantHandle,
    tenant::TenantDbConfig,
};

/// Constructs a [`TenantHandle`] from a [`TenantDbConfig`].
///
/// [`crate::cache::TenantConnectionCache`] calls this at most once per tenant
/// until the entry is invalidated.
#[async_trait]
pub trait HandleBuilder: Send + Sync {
    async fn build(&self, config: &TenantDbConfig) -> Result<TenantHandle>;
}

/// Pool sizing applied to every tenant pool (primary and replicas).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Server-side `statement_timeout`, applied as a startup option.
    pub statement_timeout_ms: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 30,
            statement_timeout_ms: None,
        }
    }
}

impl PoolSettings {
    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs.max(1)))
    }

    fn apply(&self, opts: PgConnectOptions) -> PgConnectOptions {
        match self.statement_timeout_ms {
            Some(ms) => opts.options([("statement_timeout", format!("{ms}ms"))]),
            None => opts,
        }
    }

    /// Open a pool for a database that is not a tenant, such as the admin database.
    pub async fn connect(&self, dsn: &str, target: &str) -> Result<PgPool> {
        let opts = self.apply(dsn::connect_options(dsn)?);
        self.pool_options()
            .connect_with(opts)
            .await
            .map_err(|e| Error::connect(target, e))
    }
}

/// Parsed, search-path-bound options for a tenant's primary and replicas.
pub(crate) struct ResolvedEndpoints {
    pub primary: PgConnectOptions,
    pub replicas: Vec<PgConnectOptions>,
}

/// Validate `config`, bind shared-schema tenants to their schema, and parse every DSN.
pub(crate) fn resolve_endpoints(config: &TenantDbConfig) -> Result<ResolvedEndpoints> {
    config.validate()?;
    let bind = |raw: &str| -> Result<PgConnectOptions> {
        let bound = match config.schema_override() {
            Some(schema) => dsn::with_search_path(raw, schema),
            None => Ok(raw.to_string()),
        };
        bound
            .and_then(|dsn| dsn::connect_options(&dsn))
            .map_err(|e| match e {
                Error::Configuration(msg) => Error::Configuration(format!(
                    "tenant {}: {msg}",
                    config.tenant_code
                )),
                other => other,
            })
    };

    let primary = bind(&config.primary_dsn)?;
    let replicas = config
        .replica_dsns
        .iter()
        .map(|raw| bind(raw))
        .collect::<Result<Vec<_>>>()?;
    Ok(ResolvedEndpoints { primary, replicas })
}

/// Opens real Postgres pools.
///
/// The primary is connected eagerly so an unreachable tenant fails here; replicas
/// are created lazily and only report connectivity problems on their first read.
#[derive(Clone, Debug, Default)]
pub struct PgHandleBuilder {
    settings: PoolSettings,
}

impl PgHandleBuilder {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn into_shared(self) -> Arc<dyn HandleBuilder> {
        Arc::new(self)
    }
}

#[async_trait]
impl HandleBuilder for PgHandleBuilder {
    async fn build(&self, config: &TenantDbConfig) -> Result<TenantHandle> {
        let endpoints = resolve_endpoints(config)?;
        let code = &config.tenant_code;

        let primary = self
            .settings
            .pool_options()
            .connect_with(self.settings.apply(endpoints.primary))
            .await
            .map_err(|e| Error::connect(format!("tenant {code} primary"), e))?;

        let replicas: Vec<_> = endpoints
            .replicas
            .into_iter()
            .map(|opts| {
                self.settings
                    .pool_options()
                    .connect_lazy_with(self.settings.apply(opts))
            })
            .collect();

        if replicas.is_empty() {
            debug!(tenant_code = %code, "no read replicas configured; reads use primary");
        }
        info!(
            tenant_code = %code,
            mode = %config.isolation_mode,
            schema = config.schema_override().unwrap_or("-"),
            replicas = replicas.len(),
            "opened tenant connection"
        );

        Ok(TenantHandle::new(
            code.clone(),
            config.isolation_mode,
            config.schema_override().map(str::to_string),
            primary,
            replicas,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tenants_bind_primary_and_replicas() {
        let cfg = TenantDbConfig::shared("acme", "postgres://primary/shared", "tenant_acme")
            .with_replicas(["postgres://r1/shared?sslmode=disable", "host=r2 dbname=shared"]);
        let endpoints = resolve_endpoints(&cfg).unwrap();

        let bound = |o: &PgConnectOptions| {
            o.get_options()
                .is_some_and(|s| s.contains("search_path=tenant_acme"))
        };
        assert!(bound(&endpoints.primary));
        assert_eq!(endpoints.replicas.len(), 2);
        assert!(endpoints.replicas.iter().all(bound));
    }

    #[test]
    fn dedicated_tenants_are_not_rewritten() {
        let mut cfg = TenantDbConfig::dedicated("acme", "postgres://primary/acme");
        cfg.schema_name = Some("ignored".into());
        let endpoints = resolve_endpoints(&cfg).unwrap();
        assert!(endpoints.primary.get_options().is_none());
    }

    #[test]
    fn malformed_replica_is_a_configuration_error() {
        let cfg = TenantDbConfig::dedicated("acme", "postgres://primary/acme")
            .with_replicas(["host=r1 port=nope"]);
        let err = resolve_endpoints(&cfg).err().unwrap();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("acme")));
    }

    #[test]
    fn dsn_bound_to_another_schema_is_rejected() {
        let cfg = TenantDbConfig::shared(
            "acme",
            "postgres://primary/shared?search_path=tenant_other",
            "tenant_acme",
        );
        let Err(Error::Configuration(msg)) = resolve_endpoints(&cfg) else {
            panic!("conflicting search_path was accepted");
        };
        assert!(msg.contains("acme") && msg.contains("tenant_other"), "{msg}");

        let agreeing = TenantDbConfig::shared(
            "acme",
            "postgres://primary/shared?search_path=tenant_acme",
            "tenant_acme",
        );
        assert!(resolve_endpoints(&agreeing).is_ok());
    }

    #[test]
    fn missing_schema_is_rejected_before_connecting() {
        let mut cfg = TenantDbConfig::shared("acme", "postgres://primary/shared", "x");
        cfg.schema_name = None;
        assert!(matches!(resolve_endpoints(&cfg), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn unreachable_primary_fails_fast() {
        let builder = PgHandleBuilder::new(PoolSettings {
            acquire_timeout_secs: 2,
            ..PoolSettings::default()
        });
        // nothing listens on port 1
        let cfg = TenantDbConfig::dedicated("acme", "postgres://postgres@127.0.0.1:1/acme");
        let err = builder.build(&cfg).await.unwrap_err();
        assert!(err.is_retryable(), "expected connectivity error, got {err}");
    }

    #[test]
    fn statement_timeout_is_a_startup_option() {
        let settings = PoolSettings {
            statement_timeout_ms: Some(1500),
            ..PoolSettings::default()
        };
        let opts = settings.apply(dsn::connect_options("postgres://h/db").unwrap());
        assert!(opts.get_options().is_some_and(|o| o.contains("statement_timeout=1500ms")));
    }
}
