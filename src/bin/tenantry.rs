use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use tenantry::{
    Config, FleetMigrationCoordinator, FleetMigrationResult, MigrationRunner, MigrationSet,
    MigrationStatus, PgHandleBuilder, PgTenantRegistry, StaticTenantRegistry,
    TenantConnectionCache, TenantRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tenantry", version, about = "Apply admin and tenant database migrations")]
struct Cli {
    /// Config file (default: ./tenantry.toml if present)
    #[arg(long, env = "TENANTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Admin database connection string. Falls back to DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Directory of admin migrations
    #[arg(long)]
    admin_dir: Option<PathBuf>,

    /// Directory of tenant migrations
    #[arg(long)]
    tenant_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply admin migrations to the admin database
    Admin,

    /// Apply tenant migrations for one tenant
    Tenant {
        #[arg(long)]
        code: String,
    },

    /// Apply tenant migrations for every registered tenant
    AllTenants,

    /// Show applied and pending migrations (admin database unless --code is given)
    Status {
        #[arg(long)]
        code: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };
    if let Some(url) = cli.database_url {
        config.admin.database_url = Some(url);
    }
    if let Some(dir) = cli.admin_dir {
        config.migrations.admin_dir = dir;
    }
    if let Some(dir) = cli.tenant_dir {
        config.migrations.tenant_dir = dir;
    }

    init_tracing(&config.log.level);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping after the current statement");
            on_signal.cancel();
        }
    });

    match run(cli.command, &config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: Commands, config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    match command {
        Commands::Admin => {
            let set = MigrationSet::load(&config.migrations.admin_dir)?;
            let pool = admin_pool(config).await?;
            println!("Applying admin migrations...");
            let applied = MigrationRunner::new(&set)
                .apply_with_cancel(&pool, None, &cancel)
                .await?;
            println!("Admin migrations applied successfully ({applied} new).");
            pool.close().await;
        }
        Commands::Tenant { code } => {
            let set = MigrationSet::load(&config.migrations.tenant_dir)?;
            let cache = tenant_cache(config).await?;
            let fleet = FleetMigrationCoordinator::new(cache.clone(), set).with_cancel(cancel);
            println!("Applying tenant migrations for {code:?} ...");
            let outcome = fleet.apply_to_tenant(&code).await;
            cache.shutdown().await;
            let applied = outcome.with_context(|| format!("tenant {code:?}"))?;
            println!("Tenant {code:?} migrations applied successfully ({applied} new).");
        }
        Commands::AllTenants => {
            let set = MigrationSet::load(&config.migrations.tenant_dir)?;
            let cache = tenant_cache(config).await?;
            let fleet = FleetMigrationCoordinator::new(cache.clone(), set).with_cancel(cancel);
            let result = fleet.apply_to_all_tenants().await;
            cache.shutdown().await;
            let result = result.context("list tenant DB configs")?;

            print_fleet_outcome(&result);
            let attempted = result.attempted;
            result.into_result()?;
            println!("All {attempted} tenant migrations applied successfully.");
        }
        Commands::Status { code: None } => {
            let set = MigrationSet::load(&config.migrations.admin_dir)?;
            let pool = admin_pool(config).await?;
            let status = MigrationRunner::new(&set).status(&pool, None).await?;
            print_status("admin", &status);
            pool.close().await;
        }
        Commands::Status { code: Some(code) } => {
            let set = MigrationSet::load(&config.migrations.tenant_dir)?;
            let cache = tenant_cache(config).await?;
            let status = async {
                let handle = cache.get_with_cancel(&code, &cancel).await?;
                MigrationRunner::new(&set)
                    .status(handle.writer(), handle.schema())
                    .await
            }
            .await;
            cache.shutdown().await;
            print_status(&format!("tenant {code}"), &status?);
        }
    }
    Ok(())
}

async fn admin_pool(config: &Config) -> anyhow::Result<PgPool> {
    let url = config.admin_database_url()?;
    let pool = config.admin.pool.connect(url, "admin database").await?;
    Ok(pool)
}

async fn tenant_cache(config: &Config) -> anyhow::Result<Arc<TenantConnectionCache>> {
    let registry: Arc<dyn TenantRegistry> = if config.has_static_tenants() {
        tracing::debug!(tenants = config.tenants.len(), "using tenants from configuration");
        Arc::new(StaticTenantRegistry::new(config.tenants.iter().cloned()))
    } else {
        let pool = admin_pool(config).await.context("connect admin DB")?;
        let registry = PgTenantRegistry::new(pool);
        match &config.admin.registry_table {
            Some(table) => Arc::new(registry.with_table(table.clone())),
            None => Arc::new(registry),
        }
    };
    let builder = PgHandleBuilder::new(config.tenant_pool.clone()).into_shared();
    Ok(Arc::new(TenantConnectionCache::new(registry, builder)))
}

fn print_fleet_outcome(result: &FleetMigrationResult) {
    let mut lines: Vec<(&str, String)> = result
        .succeeded
        .iter()
        .map(|code| (code.as_str(), "ok".to_string()))
        .chain(
            result
                .failed
                .iter()
                .map(|f| (f.tenant_code.as_str(), format!("ERROR: {}", f.error))),
        )
        .collect();
    lines.sort_by(|a, b| a.0.cmp(b.0));
    for (code, outcome) in lines {
        println!("  → tenant {code} ... {outcome}");
    }
}

fn print_status(target: &str, status: &MigrationStatus) {
    match status.current_version() {
        Some(version) => println!("{target}: at version {version}"),
        None => println!("{target}: no migrations applied"),
    }
    for revision in &status.applied {
        println!(
            "  applied  {} {} ({})",
            revision.version,
            revision.name,
            revision.applied_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    for step in &status.pending {
        println!("  pending  {} {}", step.version(), step.name());
    }
    if status.is_up_to_date() {
        println!("  up to date");
    }
}
