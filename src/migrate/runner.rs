use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{MigrationSet, MigrationStep, MigrationVersion};
use crate::{
    Error, Result,
    handle::TenantHandle,
    metrics::{self, metrics},
    schema::{
        REVISIONS_TABLE, create_schema_sql, revisions_table_sql, set_search_path_sql,
        validate_schema_name,
    },
};

/// Where a run currently is. Logged at `debug` on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationPhase {
    Start,
    SchemaSelected,
    DriverOpened,
    PendingDiff,
    Applying { index: usize, total: usize },
    Done,
    Failed,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Start => f.write_str("start"),
            MigrationPhase::SchemaSelected => f.write_str("schema-selected"),
            MigrationPhase::DriverOpened => f.write_str("driver-opened"),
            MigrationPhase::PendingDiff => f.write_str("pending-diff"),
            MigrationPhase::Applying { index, total } => write!(f, "applying {index}/{total}"),
            MigrationPhase::Done => f.write_str("done"),
            MigrationPhase::Failed => f.write_str("failed"),
        }
    }
}

/// One row of the bookkeeping table.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct AppliedRevision {
    pub version: MigrationVersion,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedRevision>,
    pub pending: Vec<MigrationStep>,
}

impl MigrationStatus {
    pub fn current_version(&self) -> Option<MigrationVersion> {
        self.applied.last().map(|r| r.version)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Applies a [`MigrationSet`] to one database or schema.
///
/// Each step and its bookkeeping row commit in one transaction. Runs against
/// the same target must not overlap; no lock is taken here.
#[derive(Clone, Copy, Debug)]
pub struct MigrationRunner<'a> {
    set: &'a MigrationSet,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(set: &'a MigrationSet) -> Self {
        Self { set }
    }

    pub fn set(&self) -> &MigrationSet {
        self.set
    }

    /// Apply every pending step. Returns how many were applied; 0 when the
    /// target is already current.
    pub async fn apply(&self, target: &PgPool, schema_override: Option<&str>) -> Result<usize> {
        self.run(target, schema_override, None).await
    }

    /// [`Self::apply`], stopping with [`Error::Cancelled`] once `cancel` fires.
    /// A step interrupted mid-flight is rolled back and not recorded.
    pub async fn apply_with_cancel(
        &self,
        target: &PgPool,
        schema_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.run(target, schema_override, Some(cancel)).await
    }

    /// Migrate a tenant through its primary, scoped to its schema when shared.
    pub async fn apply_to_handle(
        &self,
        handle: &TenantHandle,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        self.run(handle.writer(), handle.schema(), cancel).await
    }

    /// Recorded history and pending steps, without changing anything.
    pub async fn status(
        &self,
        target: &PgPool,
        schema_override: Option<&str>,
    ) -> Result<MigrationStatus> {
        let mut conn = open(target, schema_override).await?;
        if let Some(schema) = schema_override {
            sqlx::query(&set_search_path_sql(schema))
                .execute(&mut *conn)
                .await?;
        }
        let exists: bool = sqlx::query_scalar("select to_regclass($1) is not null")
            .bind(REVISIONS_TABLE)
            .fetch_one(&mut *conn)
            .await?;
        let applied = if exists {
            fetch_recorded(&mut conn).await?
        } else {
            Vec::new()
        };
        let pending = plan_pending(self.set, &applied)?.to_vec();
        Ok(MigrationStatus { applied, pending })
    }

    async fn run(
        &self,
        target: &PgPool,
        schema_override: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let namespace = schema_override.unwrap_or("default");
        let source = self.set.label();
        let mut phase = MigrationPhase::Start;
        debug!(namespace, source, %phase, "migration run");

        let result = self
            .run_phases(target, schema_override, cancel, &mut phase)
            .await;
        match &result {
            Ok(applied) => {
                debug!(namespace, source, applied, phase = %MigrationPhase::Done, "migration run");
            }
            Err(err) => {
                metrics::incr(&metrics().migration_failures_total);
                warn!(
                    namespace,
                    source,
                    last_phase = %phase,
                    phase = %MigrationPhase::Failed,
                    error = %err,
                    "migration run failed"
                );
            }
        }
        result
    }

    async fn run_phases(
        &self,
        target: &PgPool,
        schema_override: Option<&str>,
        cancel: Option<&CancellationToken>,
        phase: &mut MigrationPhase,
    ) -> Result<usize> {
        let not_started = || {
            Error::Cancelled(format!(
                "migration run on {} was not started",
                schema_override.unwrap_or("default")
            ))
        };
        let mut conn = until_cancelled(cancel, not_started, open(target, schema_override)).await?;

        let recorded = until_cancelled(cancel, not_started, async {
            if let Some(schema) = schema_override {
                sqlx::query(&create_schema_sql(schema))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&set_search_path_sql(schema))
                    .execute(&mut *conn)
                    .await?;
                advance(phase, MigrationPhase::SchemaSelected);
            }

            sqlx::query(&revisions_table_sql())
                .execute(&mut *conn)
                .await?;
            advance(phase, MigrationPhase::DriverOpened);

            fetch_recorded(&mut conn).await
        })
        .await?;
        let pending = plan_pending(self.set, &recorded)?;
        advance(phase, MigrationPhase::PendingDiff);

        let total = pending.len();
        if total == 0 {
            debug!(source = self.set.label(), "no pending migrations");
            return Ok(0);
        }

        for (index, step) in pending.iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(cancelled(step));
            }
            advance(phase, MigrationPhase::Applying { index: index + 1, total });
            apply_step(&mut conn, step, cancel).await?;
            metrics::incr(&metrics().migrations_applied_total);
            info!(
                version = step.version(),
                name = step.name(),
                schema = schema_override,
                "applied migration"
            );
        }
        Ok(total)
    }
}

fn advance(phase: &mut MigrationPhase, next: MigrationPhase) {
    *phase = next;
    debug!(phase = %next, "migration run");
}

/// Race `work` against the token, if any. Cancellation wins ties, and the
/// dropped future releases whatever it held.
async fn until_cancelled<T>(
    cancel: Option<&CancellationToken>,
    on_cancel: impl FnOnce() -> Error,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(on_cancel()),
            result = work => result,
        },
        None => work.await,
    }
}

fn cancelled(step: &MigrationStep) -> Error {
    Error::Cancelled(format!(
        "migration {} ({}) was not applied",
        step.version(),
        step.name()
    ))
}

/// Dedicated connection for a run. It is closed on drop so a session-level
/// `search_path` never reaches other pool users.
async fn open(target: &PgPool, schema_override: Option<&str>) -> Result<PoolConnection<Postgres>> {
    if let Some(schema) = schema_override {
        validate_schema_name(schema)?;
    }
    let mut conn = target
        .acquire()
        .await
        .map_err(|e| Error::connect("migration target", e))?;
    conn.close_on_drop();
    Ok(conn)
}

async fn fetch_recorded(conn: &mut PoolConnection<Postgres>) -> Result<Vec<AppliedRevision>> {
    let sql = format!(
        "select version, name, checksum, applied_at from {REVISIONS_TABLE} order by version"
    );
    Ok(sqlx::query_as(&sql).fetch_all(&mut **conn).await?)
}

async fn apply_step(
    conn: &mut PoolConnection<Postgres>,
    step: &MigrationStep,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    let failed = |source: sqlx::Error| Error::MigrationFailed {
        version: step.version(),
        name: step.name().to_string(),
        source,
    };

    let mut tx = conn.begin().await?;
    let work = async {
        for stmt in step.statements() {
            sqlx::query(&stmt).execute(&mut *tx).await.map_err(failed)?;
        }
        let insert =
            format!("insert into {REVISIONS_TABLE} (version, name, checksum) values ($1, $2, $3)");
        sqlx::query(&insert)
            .bind(step.version())
            .bind(step.name())
            .bind(step.checksum())
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
        Ok::<_, Error>(())
    };

    // dropping `tx` rolls the step back
    until_cancelled(cancel, || cancelled(step), work).await?;

    tx.commit().await.map_err(failed)
}

/// Steps still to apply given the recorded history.
///
/// The history must match the head of the set version for version and
/// checksum for checksum; any divergence is reported without applying anything.
pub fn plan_pending<'s>(
    set: &'s MigrationSet,
    recorded: &[AppliedRevision],
) -> Result<&'s [MigrationStep]> {
    let steps = set.steps();
    for (position, applied) in recorded.iter().enumerate() {
        let Some(step) = steps.get(position) else {
            return Err(Error::MigrationHistory(format!(
                "version {} is recorded but `{}` has only {} migrations",
                applied.version,
                set.label(),
                steps.len()
            )));
        };
        if step.version() != applied.version {
            return Err(Error::MigrationHistory(format!(
                "expected version {} at position {} but found {} recorded",
                step.version(),
                position + 1,
                applied.version
            )));
        }
        if step.checksum() != applied.checksum {
            return Err(Error::MigrationChecksum {
                version: applied.version,
                recorded: applied.checksum.clone(),
                found: step.checksum().to_string(),
            });
        }
    }
    Ok(&steps[recorded.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(versions: &[i64]) -> MigrationSet {
        MigrationSet::new(
            "mem",
            versions
                .iter()
                .map(|v| MigrationStep::new(*v, format!("step_{v}"), format!("select {v}")))
                .collect(),
        )
        .unwrap()
    }

    fn recorded(set: &MigrationSet, versions: &[i64]) -> Vec<AppliedRevision> {
        versions
            .iter()
            .map(|v| {
                let step = MigrationStep::new(*v, format!("step_{v}"), format!("select {v}"));
                let checksum = set
                    .get(*v)
                    .map(|s| s.checksum().to_string())
                    .unwrap_or_else(|| step.checksum().to_string());
                AppliedRevision {
                    version: *v,
                    name: step.name().to_string(),
                    checksum,
                    applied_at: Utc::now(),
                }
            })
            .collect()
    }

    #[test]
    fn fresh_target_gets_everything() {
        let set = set(&[1, 2, 3]);
        assert_eq!(plan_pending(&set, &[]).unwrap().len(), 3);
    }

    #[test]
    fn prefix_history_applies_only_the_suffix() {
        let set = set(&[1, 2, 3]);
        let history = recorded(&set, &[1, 2]);
        let pending = plan_pending(&set, &history).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version(), 3);
    }

    #[test]
    fn fully_applied_set_is_a_no_op() {
        let set = set(&[1, 2]);
        let history = recorded(&set, &[1, 2]);
        assert!(plan_pending(&set, &history).unwrap().is_empty());
    }

    #[test]
    fn gap_in_history_is_rejected() {
        let full = set(&[1, 2, 3]);
        let history = recorded(&full, &[1, 3]);
        let err = plan_pending(&full, &history).unwrap_err();
        assert!(matches!(err, Error::MigrationHistory(_)));
    }

    #[test]
    fn history_longer_than_set_is_rejected() {
        let short = set(&[1]);
        let history = recorded(&set(&[1, 2]), &[1, 2]);
        assert!(matches!(
            plan_pending(&short, &history),
            Err(Error::MigrationHistory(_))
        ));
    }

    #[test]
    fn edited_step_is_checksum_drift() {
        let original = set(&[1, 2]);
        let history = recorded(&original, &[1, 2]);
        let edited = MigrationSet::new(
            "mem",
            vec![
                MigrationStep::new(1, "step_1", "select 1"),
                MigrationStep::new(2, "step_2", "select 'edited'"),
            ],
        )
        .unwrap();
        let err = plan_pending(&edited, &history).unwrap_err();
        assert!(matches!(err, Error::MigrationChecksum { version: 2, .. }));
    }

    #[test]
    fn phases_render() {
        assert_eq!(
            MigrationPhase::Applying { index: 2, total: 5 }.to_string(),
            "applying 2/5"
        );
        assert_eq!(MigrationPhase::PendingDiff.to_string(), "pending-diff");
    }

    #[tokio::test]
    async fn cancelled_run_does_not_wait_for_a_connection() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_lazy("postgres://127.0.0.1:1/nothing")
            .unwrap();
        let set = set(&[1]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let err = MigrationRunner::new(&set)
            .apply_with_cancel(&pool, Some("tenant_a"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)), "got {err}");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn invalid_schema_is_rejected_before_connecting() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/nothing")
            .unwrap();
        let set = set(&[1]);
        let err = MigrationRunner::new(&set)
            .apply(&pool, Some("bad-name"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
