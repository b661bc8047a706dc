use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Last observed value per named metric. Values are also traced at debug level.
pub struct MetricsCollector {
    values: Mutex<BTreeMap<String, f64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { values: Mutex::new(BTreeMap::new()) }
    }

    /// Track a simple metric value
    pub fn track_metric(&self, name: &str, value: f64) {
        tracing::debug!("Metric {}: {}", name, value);
        self.values.lock().insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.lock().get(name).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values.lock().clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics collector instance
pub static METRICS_COLLECTOR: std::sync::OnceLock<MetricsCollector> = std::sync::OnceLock::new();

/// Get the global metrics collector
pub fn get_metrics_collector() -> &'static MetricsCollector {
    METRICS_COLLECTOR.get_or_init(MetricsCollector::new)
}

/// Records `<name>_duration_ms` when the returned guard is dropped.
#[macro_export]
macro_rules! measure_operation {
    ($operation_name:expr) => {{
        struct OperationTimer {
            start: std::time::Instant,
            name: &'static str,
        }
        impl Drop for OperationTimer {
            fn drop(&mut self) {
                let duration = self.start.elapsed().as_secs_f64() * 1000.0;
                $crate::metrics::get_metrics_collector()
                    .track_metric(&format!("{}_duration_ms", self.name), duration);
            }
        }
        OperationTimer { start: std::time::Instant::now(), name: $operation_name }
    }};
}
