use std::fmt;

use rand::seq::SliceRandom;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{Result, tenant::IsolationMode};

/// Which side of the read/write split a statement belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Live connection bundle for one tenant: a primary pool plus optional read replicas.
///
/// Handles are shared as `Arc<TenantHandle>`; the pools close once the last
/// clone is dropped or [`TenantHandle::close`] is called.
pub struct TenantHandle {
    id: Uuid,
    tenant_code: String,
    isolation_mode: IsolationMode,
    schema: Option<String>,
    primary: PgPool,
    replicas: Vec<PgPool>,
}

impl TenantHandle {
    pub fn new(
        tenant_code: impl Into<String>,
        isolation_mode: IsolationMode,
        schema: Option<String>,
        primary: PgPool,
        replicas: Vec<PgPool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_code: tenant_code.into(),
            isolation_mode,
            schema,
            primary,
            replicas,
        }
    }

    /// Unique per construction; two handles for the same tenant never share an id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant_code(&self) -> &str {
        &self.tenant_code
    }

    pub fn isolation_mode(&self) -> IsolationMode {
        self.isolation_mode
    }

    /// Schema every session of this handle is bound to (shared-schema tenants only).
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    pub fn replicas(&self) -> &[PgPool] {
        &self.replicas
    }

    /// Pool for writes. Always the primary.
    pub fn writer(&self) -> &PgPool {
        &self.primary
    }

    /// Pool for a read-only statement: a uniformly random replica, or the
    /// primary when none are configured. Replica health is not considered.
    pub fn reader(&self) -> &PgPool {
        self.replicas
            .choose(&mut rand::thread_rng())
            .unwrap_or(&self.primary)
    }

    pub fn route(&self, access: Access) -> &PgPool {
        match access {
            Access::Read => self.reader(),
            Access::Write => self.writer(),
        }
    }

    /// Transactions always run on the primary.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.primary.begin().await?)
    }

    /// Lightweight liveness check against the primary.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("select 1").execute(&self.primary).await?;
        Ok(())
    }

    /// Close every pool. Outstanding connections finish their current work first.
    pub async fn close(&self) {
        self.primary.close().await;
        for replica in &self.replicas {
            replica.close().await;
        }
    }
}

impl fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantHandle")
            .field("id", &self.id)
            .field("tenant_code", &self.tenant_code)
            .field("isolation_mode", &self.isolation_mode)
            .field("schema", &self.schema)
            .field("replicas", &self.replicas.len())
            .finish()
    }
}
