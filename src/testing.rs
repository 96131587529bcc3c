//! Test doubles for code that routes through [`crate::TenantConnectionCache`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;

use crate::{
    Error, Result,
    builder::{HandleBuilder, resolve_endpoints},
    handle::TenantHandle,
    tenant::TenantDbConfig,
};

/// Per-tenant tally of builder invocations.
#[derive(Clone, Debug, Default)]
pub struct BuildCounter {
    started: Arc<Mutex<HashMap<String, usize>>>,
    completed: Arc<Mutex<HashMap<String, usize>>>,
}

impl BuildCounter {
    /// Builds started for `tenant_code`, including ones that failed or were cancelled.
    pub fn get(&self, tenant_code: &str) -> usize {
        self.started.lock().get(tenant_code).copied().unwrap_or(0)
    }

    /// Builds that produced a handle.
    pub fn completed(&self, tenant_code: &str) -> usize {
        self.completed.lock().get(tenant_code).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.started.lock().values().sum()
    }

    fn start(&self, tenant_code: &str) {
        *self.started.lock().entry(tenant_code.to_string()).or_default() += 1;
    }

    fn complete(&self, tenant_code: &str) {
        *self.completed.lock().entry(tenant_code.to_string()).or_default() += 1;
    }
}

/// Builds handles whose pools connect lazily, so no server is needed until a
/// query runs. Applies the same validation and search-path binding as
/// [`crate::PgHandleBuilder`].
#[derive(Clone, Debug, Default)]
pub struct LazyHandleBuilder {
    counter: BuildCounter,
    delay: Option<Duration>,
    failures: Arc<Mutex<HashMap<String, usize>>>,
}

impl LazyHandleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every build, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` builds of `tenant_code` with a connectivity error.
    pub fn fail_next(self, tenant_code: impl Into<String>, times: usize) -> Self {
        self.failures.lock().insert(tenant_code.into(), times);
        self
    }

    pub fn counter(&self) -> BuildCounter {
        self.counter.clone()
    }

    fn take_failure(&self, tenant_code: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(tenant_code) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl HandleBuilder for LazyHandleBuilder {
    async fn build(&self, config: &TenantDbConfig) -> Result<TenantHandle> {
        let code = config.tenant_code.as_str();
        self.counter.start(code);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure(code) {
            return Err(Error::Connectivity {
                target: format!("tenant {code} primary"),
                source: sqlx::Error::PoolTimedOut,
            });
        }

        let endpoints = resolve_endpoints(config)?;
        let primary = PgPoolOptions::new().connect_lazy_with(endpoints.primary);
        let replicas = endpoints
            .replicas
            .into_iter()
            .map(|opts| PgPoolOptions::new().connect_lazy_with(opts))
            .collect();

        self.counter.complete(code);
        Ok(TenantHandle::new(
            code,
            config.isolation_mode,
            config.schema_override().map(str::to_string),
            primary,
            replicas,
        ))
    }
}
