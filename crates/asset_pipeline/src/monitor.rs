//! Runtime performance monitor.
//!
//! Consumes performance entries, memory readings and instrumented handler
//! timings, keeps counters and an append-only sample log, and returns the
//! corrective action the pipeline should run when a threshold is exceeded.
//! Scoring is a pure function of the counters.

use core::time::Duration;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::MonitorThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Reflow,
    Paint,
    LongTask,
    Memory,
    /// Handler timed with an [`InstrumentedTimer`]
    Script,
}

/// Per-kind signal state.
///
/// `Idle` until the first sample, `Sampling` while one is being evaluated,
/// then the outcome of the most recent evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    #[default]
    Idle,
    Sampling,
    ThresholdOk,
    ThresholdExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// `performance.measure` entries; only names containing "reflow" count
    Measure,
    Paint,
    LongTask,
}

/// A performance timeline entry as delivered by the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceEntry {
    pub entry_type: EntryType,
    pub name: String,
    pub start_time_ms: f64,
    pub duration_ms: f64,
}

impl PerformanceEntry {
    #[must_use]
    pub fn new(entry_type: EntryType, name: &str, start_time_ms: f64, duration_ms: f64) -> Self {
        Self {
            entry_type,
            name: name.to_owned(),
            start_time_ms,
            duration_ms,
        }
    }

    fn key(&self) -> EntryKey {
        EntryKey {
            entry_type: self.entry_type,
            name: self.name.clone(),
            start: self.start_time_ms.to_bits(),
            duration: self.duration_ms.to_bits(),
        }
    }
}

/// Identity of an entry; the same entry delivered twice is counted once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    entry_type: EntryType,
    name: String,
    start: u64,
    duration: u64,
}

/// Heap reading from a [`MemorySource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub limit_bytes: u64,
}

/// Source of periodic heap readings.
pub trait MemorySource {
    /// Current heap usage, or `None` when unavailable.
    fn sample(&mut self) -> Option<MemoryInfo>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub timestamp_ms: f64,
    pub kind: SampleKind,
    /// Zero for memory samples
    pub duration_ms: f64,
    pub threshold_exceeded: bool,
}

/// Remedies the pipeline runs in response to exceeded thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    /// Batch layout-affecting writes into the next animation frame.
    BatchLayout,
    /// Postpone remaining work to a zero-delay continuation.
    YieldLongTask,
    /// Drop watch targets that can no longer fire usefully.
    ReleaseUnusedListeners,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceCounters {
    pub reflow_count: u64,
    pub slow_reflows: u64,
    pub paint_count: u64,
    pub slow_paints: u64,
    pub long_tasks: u64,
    pub script_time_ms: f64,
    pub slow_handlers: u64,
    pub memory_pressure_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub used_mb: u64,
    pub total_mb: u64,
    pub limit_mb: u64,
}

impl From<MemoryInfo> for MemoryUsage {
    fn from(info: MemoryInfo) -> Self {
        const MEGABYTE: u64 = 1024 * 1024;
        Self {
            used_mb: info.used_bytes / MEGABYTE,
            total_mb: info.total_bytes / MEGABYTE,
            limit_mb: info.limit_bytes / MEGABYTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    #[serde(flatten)]
    pub counters: PerformanceCounters,
    pub memory_usage: Option<MemoryUsage>,
    pub performance_score: u8,
}

/// Score in `[0, 100]`: 100 minus fixed penalties for too many reflows,
/// too many long tasks and too much instrumented script time.
#[must_use]
pub fn performance_score(counters: &PerformanceCounters) -> u8 {
    let mut score: u8 = 100;
    if counters.reflow_count > 10 {
        score = score.saturating_sub(20);
    }
    if counters.long_tasks > 5 {
        score = score.saturating_sub(30);
    }
    if counters.script_time_ms > 1000.0 {
        score = score.saturating_sub(25);
    }
    score
}

pub struct PerformanceMonitor {
    thresholds: MonitorThresholds,
    counters: PerformanceCounters,
    samples: Vec<PerformanceSample>,
    signals: BTreeMap<SampleKind, SignalState>,
    seen: HashSet<EntryKey>,
    last_memory: Option<MemoryInfo>,
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new(thresholds: MonitorThresholds) -> Self {
        Self {
            thresholds,
            counters: PerformanceCounters::default(),
            samples: Vec::new(),
            signals: BTreeMap::new(),
            seen: HashSet::new(),
            last_memory: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn counters(&self) -> &PerformanceCounters {
        &self.counters
    }

    #[must_use]
    pub fn samples(&self) -> &[PerformanceSample] {
        &self.samples
    }

    #[must_use]
    pub fn signal_state(&self, kind: SampleKind) -> SignalState {
        self.signals.get(&kind).copied().unwrap_or_default()
    }

    /// Evaluates one sample and appends it to the log.
    fn record(&mut self, kind: SampleKind, now: Duration, duration_ms: f64, exceeded: bool) {
        self.signals.insert(kind, SignalState::Sampling);
        self.samples.push(PerformanceSample {
            timestamp_ms: now.as_secs_f64() * 1000.0,
            kind,
            duration_ms,
            threshold_exceeded: exceeded,
        });
        let state = if exceeded {
            SignalState::ThresholdExceeded
        } else {
            SignalState::ThresholdOk
        };
        self.signals.insert(kind, state);
    }

    /// Processes a timeline entry. Entries already seen are ignored.
    ///
    /// # Returns
    /// The corrective action to run, if the entry exceeded its threshold.
    pub fn observe_entry(&mut self, entry: &PerformanceEntry, now: Duration) -> Option<CorrectiveAction> {
        if !self.seen.insert(entry.key()) {
            debug!("Ignoring duplicate {:?} entry {}", entry.entry_type, entry.name);
            return None;
        }
        let duration = entry.duration_ms;
        match entry.entry_type {
            EntryType::Measure => {
                if !entry.name.contains("reflow") {
                    return None;
                }
                self.counters.reflow_count += 1;
                let exceeded = duration > self.thresholds.reflow_ms;
                self.record(SampleKind::Reflow, now, duration, exceeded);
                if !exceeded {
                    return None;
                }
                self.counters.slow_reflows += 1;
                warn!("Slow reflow detected: {duration:.2}ms");
                Some(CorrectiveAction::BatchLayout)
            }
            EntryType::Paint => {
                self.counters.paint_count += 1;
                info!("Paint: {} - {:.2}ms", entry.name, entry.start_time_ms);
                let exceeded = duration > self.thresholds.paint_ms;
                self.record(SampleKind::Paint, now, duration, exceeded);
                if exceeded {
                    self.counters.slow_paints += 1;
                    warn!("Slow paint detected: {duration:.2}ms");
                }
                None
            }
            EntryType::LongTask => {
                let exceeded = duration > self.thresholds.long_task_ms;
                self.record(SampleKind::LongTask, now, duration, exceeded);
                if !exceeded {
                    return None;
                }
                self.counters.long_tasks += 1;
                warn!("Long task detected: {duration:.2}ms");
                Some(CorrectiveAction::YieldLongTask)
            }
        }
    }

    /// Processes a heap reading.
    pub fn observe_memory(&mut self, info: MemoryInfo, now: Duration) -> Option<CorrectiveAction> {
        self.last_memory = Some(info);
        if info.total_bytes == 0 {
            return None;
        }
        let ratio = info.used_bytes as f64 / info.total_bytes as f64;
        let exceeded = ratio > self.thresholds.memory_ratio;
        self.record(SampleKind::Memory, now, 0.0, exceeded);
        if !exceeded {
            return None;
        }
        self.counters.memory_pressure_events += 1;
        let usage = MemoryUsage::from(info);
        warn!("High memory usage: {}MB / {}MB", usage.used_mb, usage.total_mb);
        Some(CorrectiveAction::ReleaseUnusedListeners)
    }

    /// Adds the duration of an instrumented handler to the script time.
    pub fn record_script(&mut self, label: &str, elapsed: Duration, now: Duration) {
        let duration = elapsed.as_secs_f64() * 1000.0;
        self.counters.script_time_ms += duration;
        let exceeded = duration > self.thresholds.script_ms;
        self.record(SampleKind::Script, now, duration, exceeded);
        if exceeded {
            self.counters.slow_handlers += 1;
            warn!("Slow handler {label}: {duration:.2}ms");
        }
    }

    /// Runs `handler` under an [`InstrumentedTimer`].
    pub fn instrument<R, F>(&mut self, label: &str, now: Duration, handler: F) -> R
    where
        F: FnOnce() -> R,
    {
        let timer = InstrumentedTimer::start(label);
        let result = handler();
        timer.finish(self, now);
        result
    }

    /// Recomputes the report from the current counters.
    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        PerformanceReport {
            counters: self.counters,
            memory_usage: self.last_memory.map(MemoryUsage::from),
            performance_score: performance_score(&self.counters),
        }
    }
}

/// Opt-in wall-clock timer for a handler; feeds the monitor's script time.
#[derive(Debug)]
pub struct InstrumentedTimer {
    label: String,
    started: Instant,
}

impl InstrumentedTimer {
    #[must_use]
    pub fn start(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stops the timer and records the elapsed time.
    pub fn finish(self, monitor: &mut PerformanceMonitor, now: Duration) -> Duration {
        let elapsed = self.elapsed();
        monitor.record_script(&self.label, elapsed, now);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorThresholds::default())
    }

    #[test]
    fn duplicate_long_task_yields_once() {
        let mut monitor = monitor();
        let entry = PerformanceEntry::new(EntryType::LongTask, "self", 250.0, 120.0);
        assert_eq!(
            monitor.observe_entry(&entry, Duration::ZERO),
            Some(CorrectiveAction::YieldLongTask)
        );
        assert_eq!(monitor.observe_entry(&entry, Duration::ZERO), None);
        assert_eq!(monitor.counters().long_tasks, 1);
        assert_eq!(monitor.samples().len(), 1);
        assert_eq!(
            monitor.signal_state(SampleKind::LongTask),
            SignalState::ThresholdExceeded
        );
    }

    #[test]
    fn only_reflow_measures_count() {
        let mut monitor = monitor();
        let other = PerformanceEntry::new(EntryType::Measure, "hydrate", 0.0, 40.0);
        let fast = PerformanceEntry::new(EntryType::Measure, "reflow-sidebar", 1.0, 4.0);
        let slow = PerformanceEntry::new(EntryType::Measure, "reflow-table", 2.0, 30.0);
        assert_eq!(monitor.observe_entry(&other, Duration::ZERO), None);
        assert_eq!(monitor.observe_entry(&fast, Duration::ZERO), None);
        assert_eq!(monitor.signal_state(SampleKind::Reflow), SignalState::ThresholdOk);
        assert_eq!(
            monitor.observe_entry(&slow, Duration::ZERO),
            Some(CorrectiveAction::BatchLayout)
        );
        assert_eq!(monitor.counters().reflow_count, 2);
        assert_eq!(monitor.counters().slow_reflows, 1);
        assert_eq!(monitor.signal_state(SampleKind::Paint), SignalState::Idle);
    }

    #[test]
    fn paints_are_counted_without_action() {
        let mut monitor = monitor();
        let paint = PerformanceEntry::new(EntryType::Paint, "first-contentful-paint", 420.0, 0.0);
        assert_eq!(monitor.observe_entry(&paint, Duration::ZERO), None);
        assert_eq!(monitor.counters().paint_count, 1);
    }

    #[test]
    fn memory_pressure_releases_listeners() {
        let mut monitor = monitor();
        let calm = MemoryInfo {
            used_bytes: 50 << 20,
            total_bytes: 100 << 20,
            limit_bytes: 2048 << 20,
        };
        assert_eq!(monitor.observe_memory(calm, Duration::ZERO), None);
        let pressed = MemoryInfo {
            used_bytes: 90 << 20,
            ..calm
        };
        assert_eq!(
            monitor.observe_memory(pressed, Duration::from_secs(5)),
            Some(CorrectiveAction::ReleaseUnusedListeners)
        );
        assert_eq!(
            monitor.report().memory_usage,
            Some(MemoryUsage {
                used_mb: 90,
                total_mb: 100,
                limit_mb: 2048
            })
        );
    }

    #[test]
    fn score_applies_fixed_penalties() {
        let mut counters = PerformanceCounters::default();
        assert_eq!(performance_score(&counters), 100);
        counters.reflow_count = 11;
        assert_eq!(performance_score(&counters), 80);
        counters.long_tasks = 6;
        assert_eq!(performance_score(&counters), 50);
        counters.script_time_ms = 1000.5;
        assert_eq!(performance_score(&counters), 25);
    }

    #[test]
    fn instrumented_handlers_add_script_time() {
        let mut monitor = monitor();
        let value = monitor.instrument("init-widgets", Duration::ZERO, || 7);
        assert_eq!(value, 7);
        monitor.record_script("chart", Duration::from_millis(80), Duration::ZERO);
        assert!(monitor.counters().script_time_ms >= 80.0);
        assert_eq!(monitor.counters().slow_handlers, 1);
        assert_eq!(monitor.samples().len(), 2);
    }
}
