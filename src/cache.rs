//! Per-tenant connection cache.
//!
//! ```text
//! TenantConnectionCache
//!        │
//!        ├── TenantRegistry   (consulted on miss only)
//!        ├── HandleBuilder    (invoked at most once per tenant per entry)
//!        │
//!        └── slots: tenant_code → OnceCell<Arc<TenantHandle>>
//! ```
//!
//! Warm lookups take a read lock and clone an `Arc`. Cold lookups for the same
//! tenant queue on that tenant's cell, so concurrent first requests trigger a
//! single construction and all observe the same handle. A failed construction
//! leaves the cell empty and the next caller tries again.
//!
//! Entries never expire. [`TenantConnectionCache::invalidate`] drops the entry
//! without closing the handle: callers still holding the old `Arc` keep using it
//! until they let go, after which its pools close. A `get` racing an
//! `invalidate` may return either handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    builder::HandleBuilder,
    handle::TenantHandle,
    metrics::{self, metrics},
    registry::TenantRegistry,
};

type Slot = Arc<OnceCell<Arc<TenantHandle>>>;

pub struct TenantConnectionCache {
    registry: Arc<dyn TenantRegistry>,
    builder: Arc<dyn HandleBuilder>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl std::fmt::Debug for TenantConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnectionCache")
            .field("entries", &self.slots.read().len())
            .finish()
    }
}

impl TenantConnectionCache {
    pub fn new(registry: Arc<dyn TenantRegistry>, builder: Arc<dyn HandleBuilder>) -> Self {
        Self {
            registry,
            builder,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn TenantRegistry> {
        &self.registry
    }

    /// Resolve the handle for `tenant_code`, building it on first use.
    ///
    /// Errors: [`Error::TenantNotFound`] for unknown codes, [`Error::Configuration`]
    /// for unusable records, [`Error::Connectivity`] when the primary is unreachable.
    /// None of them are cached.
    pub async fn get(&self, tenant_code: &str) -> Result<Arc<TenantHandle>> {
        let slot = self.slot(tenant_code);
        if let Some(handle) = slot.get() {
            metrics::incr(&metrics().cache_hits_total);
            return Ok(handle.clone());
        }

        metrics::incr(&metrics().cache_misses_total);
        debug!(tenant_code, "tenant connection cache miss");

        let result = slot
            .get_or_try_init(|| self.construct(tenant_code))
            .await
            .cloned();

        match &result {
            Ok(_) => metrics::set_cached_handles(constructed(&self.slots.read())),
            Err(_) => self.discard_empty_slot(tenant_code, &slot),
        }
        result
    }

    /// [`Self::get`], aborting with [`Error::Cancelled`] once `cancel` fires.
    ///
    /// A construction interrupted this way is not cached, and its slot is
    /// dropped unless another caller is still waiting on it.
    pub async fn get_with_cancel(
        &self,
        tenant_code: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<TenantHandle>> {
        let slot = self.slot(tenant_code);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.get(tenant_code) => Some(result),
        };
        match outcome {
            Some(result) => result,
            None => {
                self.discard_empty_slot(tenant_code, &slot);
                Err(Error::Cancelled(format!(
                    "resolving connection for tenant {tenant_code}"
                )))
            }
        }
    }

    /// Forget the cached handle so the next `get` rebuilds it from the registry.
    ///
    /// Returns whether an entry existed. The old handle is not closed here.
    pub fn invalidate(&self, tenant_code: &str) -> bool {
        let removed = {
            let mut slots = self.slots.write();
            let removed = slots.remove(tenant_code);
            metrics::set_cached_handles(constructed(&slots));
            removed
        };
        match removed {
            Some(_) => {
                metrics::incr(&metrics().cache_invalidations_total);
                info!(tenant_code, "invalidated cached tenant connection");
                true
            }
            None => false,
        }
    }

    pub fn is_cached(&self, tenant_code: &str) -> bool {
        self.slots
            .read()
            .get(tenant_code)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of tenants with a constructed handle.
    pub fn len(&self) -> usize {
        constructed(&self.slots.read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and close its pools. The cache stays usable afterwards.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Slot)> = {
            let mut slots = self.slots.write();
            let drained = slots.drain().collect();
            metrics::set_cached_handles(0);
            drained
        };
        for (tenant_code, slot) in drained {
            if let Some(handle) = slot.get() {
                handle.close().await;
                debug!(tenant_code = %tenant_code, "closed tenant connection");
            }
        }
    }

    fn slot(&self, tenant_code: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(tenant_code) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(tenant_code.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Drop a slot left empty by a failed construction, unless someone else
    /// is still waiting on it. Keeps lookups of unknown codes from piling up.
    fn discard_empty_slot(&self, tenant_code: &str, slot: &Slot) {
        let mut slots = self.slots.write();
        let stale = slots.get(tenant_code).is_some_and(|current| {
            // the map and `slot` are the only owners
            Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(slot) == 2
        });
        if stale {
            slots.remove(tenant_code);
        }
    }

    async fn construct(&self, tenant_code: &str) -> Result<Arc<TenantHandle>> {
        let config = self.registry.find_by_code(tenant_code).await?;
        metrics::incr(&metrics().handle_builds_total);
        match self.builder.build(&config).await {
            Ok(handle) => Ok(Arc::new(handle)),
            Err(err) => {
                metrics::incr(&metrics().handle_build_failures_total);
                warn!(tenant_code, error = %err, "failed to build tenant connection");
                Err(err)
            }
        }
    }
}

/// Slots holding a handle. Slots still being built are not counted.
fn constructed(slots: &HashMap<String, Slot>) -> usize {
    slots.values().filter(|slot| slot.initialized()).count()
}
