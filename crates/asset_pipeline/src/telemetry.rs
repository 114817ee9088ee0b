/// Telemetry utilities for formatting and emitting pipeline status.
/// Kept independent of `Pipeline` internals; callers pass in snapshots explicitly.
use log::info;

use crate::monitor::PerformanceCounters;
use crate::pipeline::PipelineStatus;

/// One-line JSON rendering of the monitor counters.
pub fn counters_json(counters: &PerformanceCounters) -> String {
    serde_json::to_string(counters).unwrap_or_else(|_| String::from("{}"))
}

/// One-line JSON rendering of a status snapshot.
pub fn status_json(status: &PipelineStatus) -> String {
    serde_json::to_string(status).unwrap_or_else(|_| String::from("{}"))
}

pub fn maybe_emit(enabled: bool, json_line: &str) {
    if enabled {
        info!(target: "telemetry", "{json_line}");
    }
}
