use crate::cache::{SectionChange, SectionUpdate};
use crate::collectors::MetricSnapshot;
use crate::scan::PassSummary;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub sentinel_cpu_usage_percent: Gauge,
    pub sentinel_cpu_core_usage_percent: GaugeVec,
    pub sentinel_ram_used_bytes: Gauge,
    pub sentinel_ram_total_bytes: Gauge,
    pub sentinel_ram_usage_percent: Gauge,
    pub sentinel_gpu_count: Gauge,
    pub sentinel_disk_count: Gauge,
    pub sentinel_critical_fields: Gauge,
    pub sentinel_uptime_seconds: Gauge,
    pub sentinel_last_collect_timestamp_seconds: Gauge,
    pub sentinel_scrape_count_total: Counter,
    pub sentinel_collect_errors_total: CounterVec,
    pub sentinel_cache_rebuilds_total: CounterVec,
    pub sentinel_scan_passes_total: Counter,
    pub sentinel_scan_checks_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let sentinel_cpu_usage_percent = Gauge::with_opts(opts!(
            "sentinel_cpu_usage_percent",
            "Overall CPU usage in percent (0..100)"
        ))?;
        let sentinel_cpu_core_usage_percent = GaugeVec::new(
            opts!(
                "sentinel_cpu_core_usage_percent",
                "Per logical core CPU usage in percent"
            ),
            &["core"],
        )?;
        let sentinel_ram_used_bytes =
            Gauge::with_opts(opts!("sentinel_ram_used_bytes", "Used RAM in bytes"))?;
        let sentinel_ram_total_bytes =
            Gauge::with_opts(opts!("sentinel_ram_total_bytes", "Total RAM in bytes"))?;
        let sentinel_ram_usage_percent =
            Gauge::with_opts(opts!("sentinel_ram_usage_percent", "RAM usage in percent"))?;
        let sentinel_gpu_count =
            Gauge::with_opts(opts!("sentinel_gpu_count", "Number of detected GPUs"))?;
        let sentinel_disk_count =
            Gauge::with_opts(opts!("sentinel_disk_count", "Number of mounted partitions"))?;
        let sentinel_critical_fields = Gauge::with_opts(opts!(
            "sentinel_critical_fields",
            "Displayed fields currently at critical alert level"
        ))?;
        let sentinel_uptime_seconds =
            Gauge::with_opts(opts!("sentinel_uptime_seconds", "Service uptime in seconds"))?;
        let sentinel_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "sentinel_last_collect_timestamp_seconds",
            "Unix time of the latest snapshot"
        ))?;
        let sentinel_scrape_count_total = Counter::with_opts(opts!(
            "sentinel_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let sentinel_collect_errors_total = CounterVec::new(
            opts!(
                "sentinel_collect_errors_total",
                "Metric acquisition failures by category"
            ),
            &["category"],
        )?;
        let sentinel_cache_rebuilds_total = CounterVec::new(
            opts!(
                "sentinel_cache_rebuilds_total",
                "Differential cache full rebuilds by section"
            ),
            &["section"],
        )?;
        let sentinel_scan_passes_total = Counter::with_opts(opts!(
            "sentinel_scan_passes_total",
            "Completed full scan passes"
        ))?;
        let sentinel_scan_checks_total = CounterVec::new(
            opts!(
                "sentinel_scan_checks_total",
                "Finished scan checks by outcome"
            ),
            &["outcome"],
        )?;

        register(&registry, &sentinel_cpu_usage_percent)?;
        register(&registry, &sentinel_cpu_core_usage_percent)?;
        register(&registry, &sentinel_ram_used_bytes)?;
        register(&registry, &sentinel_ram_total_bytes)?;
        register(&registry, &sentinel_ram_usage_percent)?;
        register(&registry, &sentinel_gpu_count)?;
        register(&registry, &sentinel_disk_count)?;
        register(&registry, &sentinel_critical_fields)?;
        register(&registry, &sentinel_uptime_seconds)?;
        register(&registry, &sentinel_last_collect_timestamp_seconds)?;
        register(&registry, &sentinel_scrape_count_total)?;
        register(&registry, &sentinel_collect_errors_total)?;
        register(&registry, &sentinel_cache_rebuilds_total)?;
        register(&registry, &sentinel_scan_passes_total)?;
        register(&registry, &sentinel_scan_checks_total)?;

        Ok(Arc::new(Self {
            registry,
            sentinel_cpu_usage_percent,
            sentinel_cpu_core_usage_percent,
            sentinel_ram_used_bytes,
            sentinel_ram_total_bytes,
            sentinel_ram_usage_percent,
            sentinel_gpu_count,
            sentinel_disk_count,
            sentinel_critical_fields,
            sentinel_uptime_seconds,
            sentinel_last_collect_timestamp_seconds,
            sentinel_scrape_count_total,
            sentinel_collect_errors_total,
            sentinel_cache_rebuilds_total,
            sentinel_scan_passes_total,
            sentinel_scan_checks_total,
        }))
    }

    /// Gauges keep their previous value when a category failed this tick.
    pub fn update_from_snapshot(&self, snapshot: &MetricSnapshot, started_at_unix: i64) {
        if let Ok(percent) = snapshot.cpu_overall_percent {
            self.sentinel_cpu_usage_percent.set(percent);
        }
        if let Ok(loads) = &snapshot.cpu_per_core {
            self.sentinel_cpu_core_usage_percent.reset();
            for (core, load) in loads.iter().enumerate() {
                self.sentinel_cpu_core_usage_percent
                    .with_label_values(&[&core.to_string()])
                    .set(*load);
            }
        }
        if let Ok(ram) = &snapshot.ram {
            self.sentinel_ram_used_bytes.set(ram.used_bytes as f64);
            self.sentinel_ram_total_bytes.set(ram.total_bytes as f64);
            self.sentinel_ram_usage_percent.set(ram.percent);
        }
        if let Ok(gpus) = &snapshot.gpus {
            self.sentinel_gpu_count.set(gpus.len() as f64);
        }
        if let Ok(disks) = &snapshot.disks {
            self.sentinel_disk_count.set(disks.len() as f64);
        }
        for failure in snapshot.errors() {
            self.inc_collect_error(failure.category);
        }

        self.sentinel_last_collect_timestamp_seconds
            .set(snapshot.captured_at_unix as f64);
        let uptime = snapshot.captured_at_unix.saturating_sub(started_at_unix).max(0) as f64;
        self.sentinel_uptime_seconds.set(uptime);
    }

    pub fn record_cache_updates(&self, updates: &[SectionUpdate], critical_fields: usize) {
        for update in updates {
            if matches!(update.change, SectionChange::Rebuild(_)) {
                self.sentinel_cache_rebuilds_total
                    .with_label_values(&[update.section.as_str()])
                    .inc();
            }
        }
        self.sentinel_critical_fields.set(critical_fields as f64);
    }

    pub fn record_scan_pass(&self, summary: &PassSummary) {
        self.sentinel_scan_passes_total.inc();
        for check in &summary.checks {
            self.sentinel_scan_checks_total
                .with_label_values(&[check.outcome.label()])
                .inc();
        }
    }

    pub fn inc_scrape_count(&self) {
        self.sentinel_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, category: &str) {
        self.sentinel_collect_errors_total
            .with_label_values(&[category])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DifferentialCache;
    use crate::collectors::tests::FakeSource;
    use crate::collectors::AcquisitionError;
    use crate::scan::{CheckOutcome, CheckStatus};

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8")
    }

    #[test]
    fn snapshot_sets_gauges_and_counts_errors() {
        let metrics = Metrics::new().expect("metrics init");
        let mut source = FakeSource {
            gpus: Err(AcquisitionError::new("gpu", "nvidia-smi missing")),
            ..FakeSource::default()
        };
        let snapshot = MetricSnapshot::capture(&mut source, 100);
        metrics.update_from_snapshot(&snapshot, 40);

        assert_eq!(metrics.sentinel_ram_usage_percent.get(), 50.0);
        assert_eq!(metrics.sentinel_disk_count.get(), 1.0);
        assert_eq!(metrics.sentinel_uptime_seconds.get(), 60.0);
        assert_eq!(
            metrics
                .sentinel_collect_errors_total
                .with_label_values(&["gpu"])
                .get(),
            1.0
        );
        let text = encoded(&metrics);
        assert!(text.contains("sentinel_cpu_core_usage_percent{core=\"1\"} 20"));
    }

    #[test]
    fn rebuilds_counted_per_section() {
        let metrics = Metrics::new().expect("metrics init");
        let mut cache = DifferentialCache::new(90.0);
        let snapshot = MetricSnapshot::capture(&mut FakeSource::default(), 0);
        metrics.record_cache_updates(&cache.apply(&snapshot), 0);
        metrics.record_cache_updates(&cache.apply(&snapshot), 0);

        assert_eq!(
            metrics
                .sentinel_cache_rebuilds_total
                .with_label_values(&["gpu"])
                .get(),
            1.0
        );
    }

    #[test]
    fn scan_pass_counts_outcomes() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.record_scan_pass(&PassSummary {
            checks: vec![
                CheckStatus::new("a", CheckOutcome::Succeeded("OK".into())),
                CheckStatus::new("b", CheckOutcome::Failed("Invalid Parameter".into())),
                CheckStatus::new("c", CheckOutcome::SkippedNoConsent),
            ],
            elapsed_ms: 1,
        });
        assert_eq!(metrics.sentinel_scan_passes_total.get(), 1.0);
        let text = encoded(&metrics);
        assert!(text.contains("sentinel_scan_checks_total{outcome=\"failed\"} 1"));
        assert!(text.contains("sentinel_scan_checks_total{outcome=\"skipped_no_consent\"} 1"));
    }
}
