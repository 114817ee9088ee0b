//! Configuration settings for the asset pipeline.
//!
//! This module defines the block-list, visibility tuning, on-demand asset
//! groups and performance thresholds. Configuration can be loaded from
//! environment variables or constructed programmatically.

use core::time::Duration;
use std::env;

use log::warn;

use crate::geometry::RootMargin;
use crate::registry::{AssetKind, asset_name};

/// A secondary bundle loaded the first time one of its trigger elements
/// becomes visible.
#[derive(Clone, Debug, PartialEq)]
pub struct LazyGroup {
    /// Either [`AssetKind::Style`] or [`AssetKind::Script`]
    pub kind: AssetKind,
    /// URL attached to the document when the group fires
    pub url: String,
    /// Selector list of elements whose visibility triggers the group
    pub triggers: String,
    /// Only load when the document element has `dir="rtl"`
    pub requires_rtl: bool,
}

impl LazyGroup {
    /// Creates a stylesheet group.
    #[must_use]
    pub fn stylesheet(url: &str, triggers: &str) -> Self {
        Self {
            kind: AssetKind::Style,
            url: url.to_owned(),
            triggers: triggers.to_owned(),
            requires_rtl: false,
        }
    }

    /// Creates a script bundle group.
    #[must_use]
    pub fn script(url: &str, triggers: &str) -> Self {
        Self {
            kind: AssetKind::Script,
            url: url.to_owned(),
            triggers: triggers.to_owned(),
            requires_rtl: false,
        }
    }

    /// Registry key of the group's asset.
    #[must_use]
    pub fn name(&self) -> String {
        asset_name(&self.url)
    }
}

/// Thresholds above which a performance sample counts as exceeded.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorThresholds {
    /// Reflow measure duration in milliseconds
    pub reflow_ms: f64,
    /// Paint duration in milliseconds
    pub paint_ms: f64,
    /// Long task duration in milliseconds
    pub long_task_ms: f64,
    /// Instrumented handler duration in milliseconds
    pub script_ms: f64,
    /// Fraction of the heap in use before memory pressure is reported
    pub memory_ratio: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            reflow_ms: 16.0,
            paint_ms: 16.0,
            long_task_ms: 50.0,
            script_ms: 50.0,
            memory_ratio: 0.8,
        }
    }
}

/// Runtime configuration for the asset pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// URL fragments of heavy assets removed at startup
    pub block_list: Vec<String>,
    /// Script URL fragments that must keep their blocking load order
    pub defer_exempt: Vec<String>,
    /// Resources that receive a `<link rel="preload">` hint
    pub critical_resources: Vec<String>,
    /// Minimum visible fraction of an element before it counts as visible
    pub visibility_threshold: f32,
    /// Margin added around the viewport when testing visibility
    pub root_margin: RootMargin,
    /// Bundles loaded on demand
    pub groups: Vec<LazyGroup>,
    /// Performance thresholds
    pub thresholds: MonitorThresholds,
    /// Delay before a failed on-demand load is retried
    pub retry_backoff_ms: u64,
    /// Number of retries after the first failed attempt
    pub max_retries: u32,
    /// Animation frame interval in milliseconds
    pub frame_interval_ms: u64,
    /// Memory polling interval in milliseconds
    pub memory_poll_ms: u64,
    /// Interval of the periodic report check in milliseconds
    pub report_interval_ms: u64,
    /// Score below which the periodic report check logs a warning
    pub report_warn_score: u8,
    /// Spacing between batched layout hints in milliseconds
    pub layout_hint_spacing_ms: u64,
    /// Scroll offset past which `#appHeader` becomes sticky
    pub sticky_threshold_px: f32,
    /// Scroll changes up to this many pixels are ignored
    pub scroll_hysteresis_px: f32,
    /// Whether the periodic report check also emits a telemetry line
    pub telemetry_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_list: to_strings(&[
                "remixicon.svg",
                "remixicon.symbol.svg",
                "remixicon.eot",
                "remixicon.ttf",
                "icons.min.css",
                "bootstrap-rtl.min.css",
            ]),
            defer_exempt: to_strings(&["ultra-performance", "cleanup-scripts", "asset-optimizer"]),
            critical_resources: to_strings(&[
                "assets/css/app.min.css",
                "assets/css/bootstrap.min.css",
                "assets/js/app.js",
            ]),
            visibility_threshold: 0.01,
            root_margin: RootMargin::new(50.0, 0.0, 50.0, 0.0),
            groups: vec![
                LazyGroup::stylesheet(
                    "assets/css/icons.min.css",
                    ".ri-icon, .icon, [class*=\"ri-\"]",
                ),
                LazyGroup {
                    requires_rtl: true,
                    ..LazyGroup::stylesheet(
                        "assets/css/bootstrap-rtl.min.css",
                        ".card, .table, .form-control, .btn",
                    )
                },
                LazyGroup::script("assets/js/chartjs.init.js", ".chart"),
                LazyGroup::script("assets/js/table.init.js", ".table"),
                LazyGroup::script("assets/js/advanced-form.init.js", ".form"),
            ],
            thresholds: MonitorThresholds::default(),
            retry_backoff_ms: 1000,
            max_retries: 1,
            frame_interval_ms: 16,
            memory_poll_ms: 5000,
            report_interval_ms: 10_000,
            report_warn_score: 80,
            layout_hint_spacing_ms: 5,
            sticky_threshold_px: 100.0,
            scroll_hysteresis_px: 10.0,
            telemetry_enabled: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads the following environment variables on top of the defaults:
    /// - `ASSET_PIPELINE_BLOCK_LIST`: comma-separated heavy asset fragments
    /// - `ASSET_PIPELINE_DEFER_EXEMPT`: comma-separated script fragments left blocking
    /// - `ASSET_PIPELINE_VISIBILITY_THRESHOLD`: visible fraction in `[0, 1]` (default: 0.01)
    /// - `ASSET_PIPELINE_ROOT_MARGIN`: CSS margin shorthand in px (default: "50px 0px")
    /// - `ASSET_PIPELINE_RETRY_BACKOFF_MS`: retry delay in milliseconds (default: 1000)
    /// - `ASSET_PIPELINE_FRAME_INTERVAL_MS`: frame interval in milliseconds (default: 16)
    /// - `ASSET_PIPELINE_STICKY_THRESHOLD_PX`: header sticky offset in px (default: 100)
    /// - `ASSET_PIPELINE_TELEMETRY`: set to "1" to emit telemetry lines
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an injectable variable source.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(list) = lookup("ASSET_PIPELINE_BLOCK_LIST") {
            config.block_list = split_list(&list);
        }
        if let Some(list) = lookup("ASSET_PIPELINE_DEFER_EXEMPT") {
            config.defer_exempt = split_list(&list);
        }
        if let Some(threshold) = lookup("ASSET_PIPELINE_VISIBILITY_THRESHOLD")
            .and_then(|val| val.trim().parse::<f32>().ok())
            .filter(|val| val.is_finite())
        {
            config.visibility_threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(margin) = lookup("ASSET_PIPELINE_ROOT_MARGIN") {
            match margin.parse::<RootMargin>() {
                Ok(parsed) => config.root_margin = parsed,
                Err(err) => warn!("Ignoring ASSET_PIPELINE_ROOT_MARGIN={margin:?}: {err}"),
            }
        }
        if let Some(backoff) = lookup("ASSET_PIPELINE_RETRY_BACKOFF_MS")
            .and_then(|val| val.trim().parse::<u64>().ok())
        {
            config.retry_backoff_ms = backoff;
        }
        if let Some(interval) = lookup("ASSET_PIPELINE_FRAME_INTERVAL_MS")
            .and_then(|val| val.trim().parse::<u64>().ok())
        {
            config.frame_interval_ms = interval.max(1);
        }
        if let Some(offset) = lookup("ASSET_PIPELINE_STICKY_THRESHOLD_PX")
            .and_then(|val| val.trim().parse::<f32>().ok())
            .filter(|val| val.is_finite())
        {
            config.sticky_threshold_px = offset.max(0.0);
        }
        config.telemetry_enabled =
            lookup("ASSET_PIPELINE_TELEMETRY").as_deref() == Some("1");
        config
    }

    #[inline]
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[inline]
    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    #[inline]
    #[must_use]
    pub const fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_ms)
    }

    #[inline]
    #[must_use]
    pub const fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    #[inline]
    #[must_use]
    pub const fn layout_hint_spacing(&self) -> Duration {
        Duration::from_millis(self.layout_hint_spacing_ms)
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, val)| ((*key).to_owned(), (*val).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert!((config.visibility_threshold - 0.01).abs() < f32::EPSILON);
        assert_eq!(config.root_margin, RootMargin::new(50.0, 0.0, 50.0, 0.0));
        assert!(config.block_list.iter().any(|item| item == "remixicon.symbol.svg"));
        assert!(config.block_list.iter().any(|item| item == "bootstrap-rtl.min.css"));
        assert_eq!(config.retry_backoff(), Duration::from_millis(1000));
        assert_eq!(config.groups[0].name(), "icons.min.css");
        assert!((config.sticky_threshold_px - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn environment_overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("ASSET_PIPELINE_BLOCK_LIST", "huge.css, , fonts.woff2"),
            ("ASSET_PIPELINE_VISIBILITY_THRESHOLD", "3.5"),
            ("ASSET_PIPELINE_ROOT_MARGIN", "10px"),
            ("ASSET_PIPELINE_FRAME_INTERVAL_MS", "0"),
            ("ASSET_PIPELINE_TELEMETRY", "1"),
            ("ASSET_PIPELINE_STICKY_THRESHOLD_PX", "240"),
        ]));
        assert!((config.sticky_threshold_px - 240.0).abs() < f32::EPSILON);
        assert_eq!(config.block_list, vec!["huge.css", "fonts.woff2"]);
        assert!((config.visibility_threshold - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.root_margin, RootMargin::new(10.0, 10.0, 10.0, 10.0));
        assert_eq!(config.frame_interval_ms, 1);
        assert!(config.telemetry_enabled);
    }

    #[test]
    fn invalid_margin_keeps_default() {
        let config =
            PipelineConfig::from_lookup(lookup_from(&[("ASSET_PIPELINE_ROOT_MARGIN", "10%")]));
        assert_eq!(config.root_margin, RootMargin::new(50.0, 0.0, 50.0, 0.0));
    }
}
