use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationMetrics>,
    pub resolves: u64,
    pub applies: u64,
    pub skipped_empty_display: u64,
    pub skipped_unsized_frame: u64,
    pub layouts_coalesced: u64,
    pub engine_starts: u64,
    pub engine_stops: u64,
    pub fatal_errors: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct OperationMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Resolve,
    Apply,
    SkippedEmptyDisplay,
    SkippedUnsizedFrame,
    LayoutCoalesced,
    EngineStart,
    EngineStop,
    FatalError,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_operation(&self, operation: &str) -> OperationTimer {
        OperationTimer {
            operation: operation.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
        }
    }

    pub fn increment(&self, counter: Counter) {
        if let Ok(mut guard) = self.inner.lock() {
            let slot = match counter {
                Counter::Resolve => &mut guard.resolves,
                Counter::Apply => &mut guard.applies,
                Counter::SkippedEmptyDisplay => &mut guard.skipped_empty_display,
                Counter::SkippedUnsizedFrame => &mut guard.skipped_unsized_frame,
                Counter::LayoutCoalesced => &mut guard.layouts_coalesced,
                Counter::EngineStart => &mut guard.engine_starts,
                Counter::EngineStop => &mut guard.engine_stops,
                Counter::FatalError => &mut guard.fatal_errors,
            };
            *slot += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct OperationTimer {
    operation: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.operations.entry(self.operation.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            operation = self.operation.as_str(),
            duration_ms, "Coordinator operation recorded"
        );
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        resolves = snapshot.resolves,
        applies = snapshot.applies,
        skipped_empty_display = snapshot.skipped_empty_display,
        skipped_unsized_frame = snapshot.skipped_unsized_frame,
        layouts_coalesced = snapshot.layouts_coalesced,
        engine_starts = snapshot.engine_starts,
        engine_stops = snapshot.engine_stops,
        fatal_errors = snapshot.fatal_errors,
        "Coordinator metrics summary"
    );
    for (operation, metrics) in &snapshot.operations {
        info!(
            operation = operation.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Operation metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters = [
            ("resolves", "Geometry resolutions attempted", self.resolves),
            ("applies", "Layouts written to surfaces", self.applies),
            (
                "skipped_empty_display",
                "Layouts skipped for an empty display area",
                self.skipped_empty_display,
            ),
            (
                "skipped_unsized_frame",
                "Layouts skipped before the frame geometry was known",
                self.skipped_unsized_frame,
            ),
            (
                "layouts_coalesced",
                "Display area notifications folded into a later one",
                self.layouts_coalesced,
            ),
            ("engine_starts", "Engine start calls", self.engine_starts),
            ("engine_stops", "Engine stop calls", self.engine_stops),
            ("fatal_errors", "Fatal engine failures", self.fatal_errors),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP surface_sync_{name}_total {help}\n"));
            output.push_str(&format!("# TYPE surface_sync_{name}_total counter\n"));
            output.push_str(&format!("surface_sync_{name}_total {value}\n"));
        }
        output.push_str("# HELP surface_sync_operation_calls_total Coordinator operation count\n");
        output.push_str("# TYPE surface_sync_operation_calls_total counter\n");
        output.push_str(
            "# HELP surface_sync_operation_duration_seconds_max Slowest coordinator operation\n",
        );
        output.push_str("# TYPE surface_sync_operation_duration_seconds_max gauge\n");
        for (operation, metrics) in &self.operations {
            output.push_str(&format!(
                "surface_sync_operation_calls_total{{operation=\"{}\"}} {}\n",
                operation, metrics.calls
            ));
            output.push_str(&format!(
                "surface_sync_operation_duration_seconds_max{{operation=\"{}\"}} {:.6}\n",
                operation,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}
