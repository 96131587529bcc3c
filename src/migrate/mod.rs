//! Versioned SQL migrations for the administrative database and tenant namespaces.

pub mod runner;
pub mod source;

pub use runner::{AppliedRevision, MigrationPhase, MigrationRunner, MigrationStatus, plan_pending};
pub use source::{MigrationSet, MigrationStep, MigrationVersion, split_statements};
