//! Migrating every registered tenant in one pass.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    Error, Result,
    cache::TenantConnectionCache,
    metrics::{self, metrics},
    migrate::{MigrationRunner, MigrationSet},
};

#[derive(Debug)]
pub struct TenantFailure {
    pub tenant_code: String,
    pub error: Error,
}

/// Outcome of a fleet run. Every enumerated tenant appears in exactly one list.
#[derive(Debug, Default)]
pub struct FleetMigrationResult {
    pub attempted: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<TenantFailure>,
}

impl FleetMigrationResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_codes(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.tenant_code.clone()).collect()
    }

    /// Number of migrated tenants, or [`Error::FleetFailed`] naming every failure.
    pub fn into_result(self) -> Result<usize> {
        if self.failed.is_empty() {
            Ok(self.succeeded.len())
        } else {
            Err(Error::FleetFailed {
                failed: self.failed_codes(),
            })
        }
    }
}

/// Applies the tenant migration set to each tenant in turn, resolving
/// connections through the shared cache.
pub struct FleetMigrationCoordinator {
    cache: Arc<TenantConnectionCache>,
    set: MigrationSet,
    cancel: CancellationToken,
}

impl FleetMigrationCoordinator {
    pub fn new(cache: Arc<TenantConnectionCache>, set: MigrationSet) -> Self {
        Self {
            cache,
            set,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn migration_set(&self) -> &MigrationSet {
        &self.set
    }

    /// Migrate one tenant. Returns the number of steps applied.
    pub async fn apply_to_tenant(&self, tenant_code: &str) -> Result<usize> {
        let handle = self.cache.get_with_cancel(tenant_code, &self.cancel).await?;
        MigrationRunner::new(&self.set)
            .apply_to_handle(&handle, Some(&self.cancel))
            .await
    }

    /// Migrate every registered tenant, sequentially, in registry order.
    ///
    /// Only a failure to enumerate tenants is returned as `Err`; per-tenant
    /// failures, including a tenant whose stored record is malformed, are
    /// collected and the loop moves on.
    pub async fn apply_to_all_tenants(&self) -> Result<FleetMigrationResult> {
        let codes = self.cache.registry().list_codes().await?;
        let mut result = FleetMigrationResult {
            attempted: codes.len(),
            ..Default::default()
        };
        info!(tenants = codes.len(), source = self.set.label(), "migrating tenant fleet");

        for code in codes {
            if self.cancel.is_cancelled() {
                result.failed.push(TenantFailure {
                    error: Error::Cancelled(format!("tenant {code} was not attempted")),
                    tenant_code: code,
                });
                continue;
            }

            match self.apply_to_tenant(&code).await {
                Ok(applied) => {
                    metrics::incr(&metrics().fleet_tenants_succeeded_total);
                    info!(tenant_code = %code, applied, "tenant migrated");
                    result.succeeded.push(code);
                }
                Err(error) => {
                    metrics::incr(&metrics().fleet_tenants_failed_total);
                    warn!(tenant_code = %code, error = %error, "tenant migration failed");
                    result.failed.push(TenantFailure {
                        tenant_code: code,
                        error,
                    });
                }
            }
        }

        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "tenant fleet migration finished"
        );
        Ok(result)
    }
}
