use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("tenant {0} is not registered")]
    TenantNotFound(String),
    #[error("cannot reach {target}: {source}")]
    Connectivity {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration {version} ({name}) failed: {source}")]
    MigrationFailed {
        version: i64,
        name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("recorded migration history is not a prefix of the migration set: {0}")]
    MigrationHistory(String),
    #[error("migration {version} changed after it was applied ({recorded} != {found})")]
    MigrationChecksum {
        version: i64,
        recorded: String,
        found: String,
    },
    #[error("invalid migration source `{path}`: {reason}")]
    MigrationSource { path: String, reason: String },
    #[error("migrations failed for tenants: {}", .failed.join(", "))]
    FleetFailed { failed: Vec<String> },
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Coarse classification used by callers that map errors to responses
/// ("unknown tenant" vs "tenant temporarily unavailable") or exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Lookup,
    Connectivity,
    Migration,
    Cancelled,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::TenantNotFound(_) => ErrorKind::Lookup,
            Error::Connectivity { .. } => ErrorKind::Connectivity,
            Error::Db(err) if is_connectivity(err) => ErrorKind::Connectivity,
            Error::MigrationFailed { .. }
            | Error::MigrationHistory(_)
            | Error::MigrationChecksum { .. }
            | Error::MigrationSource { .. }
            | Error::FleetFailed { .. } => ErrorKind::Migration,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Context { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// Connectivity failures and cancellations may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connectivity | ErrorKind::Cancelled)
    }

    /// Wrap a failure to open a connection, keeping configuration problems
    /// distinct from unreachable endpoints.
    pub(crate) fn connect(target: impl Into<String>, source: sqlx::Error) -> Self {
        match source {
            sqlx::Error::Configuration(inner) => Error::Configuration(inner.to_string()),
            source => Error::Connectivity {
                target: target.into(),
                source,
            },
        }
    }
}

pub(crate) fn is_connectivity(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
