//! Tenantry — per-tenant Postgres connection routing and schema migrations.
//!
//! Tenants either own a dedicated database or share one and live in their own
//! schema. [`TenantConnectionCache`] turns a tenant code into a shared
//! [`TenantHandle`] (primary pool plus read replicas), building it at most once.
//! [`MigrationRunner`] applies a versioned [`MigrationSet`] to the admin
//! database or a tenant namespace, and [`FleetMigrationCoordinator`] walks
//! every registered tenant.

pub mod builder;
pub mod cache;
pub mod config;
pub mod dsn;
mod error;
pub mod fleet;
pub mod handle;
pub mod metrics;
pub mod migrate;
pub mod registry;
pub mod schema;
pub mod tenant;
pub mod testing;

pub use builder::{HandleBuilder, PgHandleBuilder, PoolSettings};
pub use cache::TenantConnectionCache;
pub use config::Config;
pub use error::{Error, ErrorKind, Result, WithContext};
pub use fleet::{FleetMigrationCoordinator, FleetMigrationResult, TenantFailure};
pub use handle::{Access, TenantHandle};
pub use migrate::{MigrationRunner, MigrationSet, MigrationStatus, MigrationStep};
pub use registry::{PgTenantRegistry, StaticTenantRegistry, TenantRegistry};
pub use tenant::{IsolationMode, TenantDbConfig};

pub mod prelude {
    pub use crate::{
        Access, FleetMigrationCoordinator, MigrationRunner, MigrationSet, Result,
        TenantConnectionCache, TenantDbConfig, TenantHandle, TenantRegistry,
    };
}
