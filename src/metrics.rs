use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    // Connection cache
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    pub handle_builds_total: AtomicU64,
    pub handle_build_failures_total: AtomicU64,
    pub cache_invalidations_total: AtomicU64,
    pub cached_handles_gauge: AtomicU64,

    // Migrations
    pub migrations_applied_total: AtomicU64,
    pub migration_failures_total: AtomicU64,

    // Fleet runs
    pub fleet_tenants_succeeded_total: AtomicU64,
    pub fleet_tenants_failed_total: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn set_cached_handles(n: usize) {
    metrics()
        .cached_handles_gauge
        .store(n as u64, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let series: [(&str, &str, &AtomicU64); 10] = [
        ("tenant_cache_hits_total", "counter", &m.cache_hits_total),
        ("tenant_cache_misses_total", "counter", &m.cache_misses_total),
        ("tenant_handle_builds_total", "counter", &m.handle_builds_total),
        (
            "tenant_handle_build_failures_total",
            "counter",
            &m.handle_build_failures_total,
        ),
        (
            "tenant_cache_invalidations_total",
            "counter",
            &m.cache_invalidations_total,
        ),
        ("tenant_cached_handles", "gauge", &m.cached_handles_gauge),
        ("migrations_applied_total", "counter", &m.migrations_applied_total),
        ("migration_failures_total", "counter", &m.migration_failures_total),
        (
            "fleet_tenants_succeeded_total",
            "counter",
            &m.fleet_tenants_succeeded_total,
        ),
        (
            "fleet_tenants_failed_total",
            "counter",
            &m.fleet_tenants_failed_total,
        ),
    ];
    for (name, kind, value) in series {
        let _ = writeln!(
            s,
            "# TYPE {name} {kind}\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}
