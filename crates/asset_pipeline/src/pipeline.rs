//! The pipeline context: owns the document and every component, sequences
//! startup, routes visibility and performance signals, and runs deferred
//! work on the cooperative event loop.

use core::time::Duration;
use std::collections::VecDeque;

use anyhow::Error;
use html::{Document, NodeId};
use log::{debug, info, warn};
use serde::Serialize;
use tracing::info_span;

use crate::config::PipelineConfig;
use crate::event_loop::EventLoop;
use crate::geometry::Viewport;
use crate::layout::LayoutProvider;
use crate::loader::{FetchRequest, LazyResourceLoader, LoaderStats, SettleOutcome, WatchAction};
use crate::monitor::{
    CorrectiveAction, MemoryInfo, MemorySource, PerformanceEntry, PerformanceMonitor,
    PerformanceReport,
};
use crate::pruner::{AssetPruner, PruneReport};
use crate::registry::{AssetDescriptor, ResourceRegistry};
use crate::restorer::{self, RestoreReport};
use crate::telemetry;
use crate::visibility::{IntersectionEntry, VisibilityScheduler, WatchTarget};

const STICKY_HEADER_ID: &str = "appHeader";
const STICKY_CLASS: &str = "sticky-scroll";
const DYNAMIC_CONTENT_ID: &str = "dynamic-content";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    Retry(String),
    ResumeDispatch,
    BatchLayout,
    LayoutHint(NodeId),
    StickyHeader,
    MemoryPoll,
    ReportCheck,
}

/// What [`Pipeline::start`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupSummary {
    pub restored: RestoreReport,
    pub pruned: PruneReport,
    pub watched: usize,
    /// Preload hints handed to the loader as fetches
    pub preloads: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub yields: u64,
    pub batched_layouts: u64,
    pub layout_hints: u64,
    pub released_watches: u64,
    pub retries: u64,
    pub failed_components: u64,
}

/// Read-only snapshot for external tooling.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub now_ms: u64,
    pub assets: Vec<AssetDescriptor>,
    pub loaded_assets: Vec<String>,
    pub pending_watches: usize,
    pub pending_fetches: usize,
    pub frames: u64,
    pub loader: LoaderStats,
    pub stats: PipelineStats,
    pub report: PerformanceReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    document: Document,
    registry: ResourceRegistry,
    scheduler: VisibilityScheduler<WatchAction>,
    loader: LazyResourceLoader,
    monitor: PerformanceMonitor,
    event_loop: EventLoop<Task>,
    layout: Option<Box<dyn LayoutProvider>>,
    memory_source: Option<Box<dyn MemorySource>>,
    viewport: Viewport,
    /// Scroll offset the sticky header last reacted to.
    last_scroll_y: f32,
    /// Fired targets whose actions have not run yet.
    dispatch_queue: VecDeque<WatchTarget<WatchAction>>,
    /// Dispatch is postponed until the zero-delay continuation runs.
    yield_pending: bool,
    batch_layout_pending: bool,
    sticky_pending: bool,
    started: bool,
    stats: PipelineStats,
}

impl Pipeline {
    /// Creates a pipeline over `document`. Nothing is mutated until
    /// [`Pipeline::start`].
    ///
    /// # Errors
    /// Returns an error if a configured lazy group has an invalid selector.
    pub fn new(document: Document, config: PipelineConfig) -> Result<Self, Error> {
        let loader = LazyResourceLoader::new(&config)?;
        Ok(Self {
            scheduler: VisibilityScheduler::new(config.visibility_threshold, config.root_margin),
            monitor: PerformanceMonitor::new(config.thresholds.clone()),
            event_loop: EventLoop::new(config.frame_interval()),
            loader,
            config,
            document,
            registry: ResourceRegistry::new(),
            layout: None,
            memory_source: None,
            viewport: Viewport::default(),
            last_scroll_y: 0.0,
            dispatch_queue: VecDeque::new(),
            yield_pending: false,
            batch_layout_pending: false,
            sticky_pending: false,
            started: false,
            stats: PipelineStats::default(),
        })
    }

    /// Uses `layout` to evaluate visibility on every viewport change.
    #[must_use]
    pub fn with_layout(mut self, layout: Box<dyn LayoutProvider>) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Polls `source` every memory interval once started.
    #[must_use]
    pub fn with_memory_source(mut self, source: Box<dyn MemorySource>) -> Self {
        self.memory_source = Some(source);
        self
    }

    pub fn set_layout(&mut self, layout: Box<dyn LayoutProvider>) {
        self.layout = Some(layout);
    }

    /// Restores appearance, prunes heavy assets and arms the visibility
    /// scheduler, in that order. Later calls do nothing and return an empty
    /// summary.
    pub fn start(&mut self) -> StartupSummary {
        if self.started {
            debug!("Pipeline already started");
            return StartupSummary::default();
        }
        let span = info_span!("pipeline_start");
        let _guard = span.enter();

        let restored = restorer::restore(&mut self.document);
        let pruned = AssetPruner::new(&self.config).prune(&mut self.document, &mut self.registry);
        let preloads = self.loader.track_preloads(&self.document, &mut self.registry);
        let watched = self.loader.arm(&self.document, &mut self.scheduler);
        if self.memory_source.is_some() {
            self.event_loop
                .set_timeout(self.config.memory_poll_interval(), Task::MemoryPoll);
        }
        self.event_loop
            .set_timeout(self.config.report_interval(), Task::ReportCheck);
        self.started = true;
        info!(
            "Asset pipeline started: {} assets pruned, {watched} elements watched",
            pruned.pruned.len()
        );
        StartupSummary {
            restored,
            pruned,
            watched,
            preloads,
        }
    }

    /// Moves the viewport, evaluates visibility through the layout provider
    /// and schedules the sticky header update when the scroll offset moved
    /// by more than the configured hysteresis.
    ///
    /// # Returns
    /// The number of watch targets that fired.
    pub fn set_viewport(&mut self, viewport: Viewport) -> usize {
        self.viewport = viewport;
        if (viewport.scroll_y - self.last_scroll_y).abs() > self.config.scroll_hysteresis_px {
            self.last_scroll_y = viewport.scroll_y;
            self.schedule_sticky_header();
        }
        let Some(layout) = self.layout.as_deref() else {
            return 0;
        };
        let fired = self.scheduler.observe(&self.document, layout, &self.viewport);
        self.enqueue(fired)
    }

    /// Delivers intersection entries computed by the host.
    ///
    /// # Returns
    /// The number of watch targets that fired.
    pub fn deliver_intersections(&mut self, entries: &[IntersectionEntry]) -> usize {
        let fired = self.scheduler.deliver(entries);
        self.enqueue(fired)
    }

    fn enqueue(&mut self, fired: Vec<WatchTarget<WatchAction>>) -> usize {
        let count = fired.len();
        self.dispatch_queue.extend(fired);
        self.drain_dispatch();
        count
    }

    fn drain_dispatch(&mut self) {
        if self.dispatch_queue.is_empty() {
            return;
        }
        let span = info_span!("visibility_dispatch", queued = self.dispatch_queue.len());
        let _guard = span.enter();
        while !self.yield_pending {
            let Some(target) = self.dispatch_queue.pop_front() else {
                break;
            };
            self.loader
                .on_visible(&mut self.document, &mut self.registry, &target);
        }
    }

    /// Reports the outcome of a fetch previously returned by
    /// [`Pipeline::drain_fetches`]. Failures are retried once after the
    /// configured backoff.
    pub fn resource_settled(&mut self, name: &str, success: bool) -> SettleOutcome {
        let outcome = self
            .loader
            .settle(&mut self.document, &mut self.registry, name, success);
        if outcome == SettleOutcome::RetryScheduled {
            self.event_loop
                .set_timeout(self.config.retry_backoff(), Task::Retry(name.to_owned()));
        }
        outcome
    }

    /// Manually re-attempts a deferred asset.
    pub fn retrigger(&mut self, name: &str) -> bool {
        self.loader
            .retry(&mut self.document, &mut self.registry, name)
    }

    /// Takes the fetches the host must now perform.
    pub fn drain_fetches(&mut self) -> Vec<FetchRequest> {
        self.loader.drain_fetches()
    }

    /// Feeds a performance timeline entry to the monitor.
    pub fn observe_performance(&mut self, entry: &PerformanceEntry) {
        let now = self.event_loop.now();
        if let Some(action) = self.monitor.observe_entry(entry, now) {
            self.apply(action);
        }
    }

    /// Feeds a heap reading to the monitor.
    pub fn observe_memory(&mut self, info: MemoryInfo) {
        let now = self.event_loop.now();
        if let Some(action) = self.monitor.observe_memory(info, now) {
            self.apply(action);
        }
    }

    /// Runs `handler` with its wall-clock time added to the script time.
    pub fn instrument<R, F>(&mut self, label: &str, handler: F) -> R
    where
        F: FnOnce() -> R,
    {
        let now = self.event_loop.now();
        self.monitor.instrument(label, now, handler)
    }

    fn apply(&mut self, action: CorrectiveAction) {
        match action {
            CorrectiveAction::BatchLayout => {
                if !self.batch_layout_pending {
                    self.batch_layout_pending = true;
                    self.event_loop.request_animation_frame(Task::BatchLayout);
                }
            }
            CorrectiveAction::YieldLongTask => {
                self.stats.yields += 1;
                if !self.yield_pending {
                    self.yield_pending = true;
                    self.event_loop
                        .set_timeout(Duration::ZERO, Task::ResumeDispatch);
                }
            }
            CorrectiveAction::ReleaseUnusedListeners => {
                let document = &self.document;
                let released = self.scheduler.release(|node| {
                    !document.is_attached(node) || document.has_attr(node, "data-cleanup")
                });
                self.stats.released_watches += released as u64;
                info!("Released {released} unused watch targets");
            }
        }
    }

    /// Advances virtual time by `by`, running every task that falls due.
    pub fn advance(&mut self, by: Duration) {
        let until = self.event_loop.now().saturating_add(by);
        while let Some(task) = self.event_loop.pop_due(until) {
            self.run_task(task);
        }
        self.event_loop.advance_to(until);
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Retry(name) => {
                if self
                    .loader
                    .retry(&mut self.document, &mut self.registry, &name)
                {
                    self.stats.retries += 1;
                }
            }
            Task::ResumeDispatch => {
                self.yield_pending = false;
                self.drain_dispatch();
            }
            Task::BatchLayout => self.batch_layout(),
            Task::LayoutHint(node) => {
                if !self.document.is_attached(node) {
                    return;
                }
                match self
                    .document
                    .set_style_property(node, "transform", "translateZ(0)")
                {
                    Ok(()) => self.stats.layout_hints += 1,
                    Err(err) => debug!("Skipping layout hint: {err}"),
                }
            }
            Task::StickyHeader => {
                self.sticky_pending = false;
                self.update_sticky_header();
            }
            Task::MemoryPoll => {
                let reading = self.memory_source.as_mut().and_then(|source| source.sample());
                if let Some(info) = reading {
                    self.observe_memory(info);
                }
                self.event_loop
                    .set_timeout(self.config.memory_poll_interval(), Task::MemoryPoll);
            }
            Task::ReportCheck => {
                self.check_report();
                self.event_loop
                    .set_timeout(self.config.report_interval(), Task::ReportCheck);
            }
        }
    }

    /// Spreads compositing hints over `[data-optimize]` elements.
    fn batch_layout(&mut self) {
        self.batch_layout_pending = false;
        self.stats.batched_layouts += 1;
        let targets = self.document.query("[data-optimize]").unwrap_or_default();
        let spacing = self.config.layout_hint_spacing();
        for (index, node) in targets.into_iter().enumerate() {
            let delay = spacing.saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
            self.event_loop.set_timeout(delay, Task::LayoutHint(node));
        }
    }

    fn check_report(&self) {
        let report = self.monitor.report();
        if report.performance_score < self.config.report_warn_score {
            warn!(
                "Performance issues detected: {}",
                serde_json::to_string(&report).unwrap_or_default()
            );
        }
        telemetry::maybe_emit(
            self.config.telemetry_enabled,
            &telemetry::status_json(&self.status()),
        );
    }

    fn schedule_sticky_header(&mut self) {
        if !self.sticky_pending {
            self.sticky_pending = true;
            self.event_loop.request_animation_frame(Task::StickyHeader);
        }
    }

    fn update_sticky_header(&mut self) {
        let Some(header) = self.document.element_by_id(STICKY_HEADER_ID) else {
            return;
        };
        if self.last_scroll_y > self.config.sticky_threshold_px {
            if let Err(err) = self.document.add_class(header, STICKY_CLASS) {
                debug!("Sticky header not updated: {err}");
            }
        } else {
            self.document.remove_class(header, STICKY_CLASS);
        }
    }

    /// Constructs one component per element matching `selector`. A failing
    /// constructor is logged and its element skipped.
    ///
    /// # Errors
    /// Returns an error only if `selector` cannot be parsed.
    pub fn initialize_components<C, F>(&mut self, selector: &str, mut factory: F) -> Result<Vec<C>, Error>
    where
        F: FnMut(&Document, NodeId) -> Result<C, Error>,
    {
        let nodes = self.document.query(selector)?;
        let mut components = Vec::with_capacity(nodes.len());
        for node in nodes {
            match factory(&self.document, node) {
                Ok(component) => components.push(component),
                Err(err) => {
                    self.stats.failed_components += 1;
                    warn!("Component initialization failed for {selector}: {err}");
                }
            }
        }
        Ok(components)
    }

    /// Appends parsed `html` into `#dynamic-content`, or `<body>` when the
    /// container is absent. Returns the inserted top-level nodes; a document
    /// with neither is left untouched.
    ///
    /// # Errors
    /// Returns an error if the fragment cannot be parsed or inserted.
    pub fn write_dynamic_content(&mut self, html: &str) -> Result<Vec<NodeId>, Error> {
        let Some(container) = self
            .document
            .element_by_id(DYNAMIC_CONTENT_ID)
            .or_else(|| self.document.body())
        else {
            debug!("No container for dynamic content");
            return Ok(Vec::new());
        };
        self.document.append_fragment(container, html)
    }

    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        self.monitor.report()
    }

    #[must_use]
    pub fn loaded_assets(&self) -> Vec<String> {
        self.registry.loaded_assets()
    }

    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            now_ms: u64::try_from(self.event_loop.now().as_millis()).unwrap_or(u64::MAX),
            assets: self.registry.descriptors().cloned().collect(),
            loaded_assets: self.registry.loaded_assets(),
            pending_watches: self.scheduler.len(),
            pending_fetches: self.loader.pending_fetches(),
            frames: self.event_loop.frames_run(),
            loader: self.loader.stats(),
            stats: self.stats,
            report: self.monitor.report(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn document(&self) -> &Document {
        &self.document
    }

    #[inline]
    #[must_use]
    pub const fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    #[inline]
    #[must_use]
    pub const fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> PipelineStats {
        self.stats
    }

    #[inline]
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.event_loop.now()
    }

    #[must_use]
    pub fn pending_watches(&self) -> usize {
        self.scheduler.len()
    }

    /// Consumes the pipeline, returning the optimized document.
    #[must_use]
    pub fn into_document(self) -> Document {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::EntryType;
    use crate::registry::AssetState;
    use anyhow::anyhow;

    fn header_pipeline() -> Result<(Pipeline, NodeId), Error> {
        let doc = html::parse("<body><header id=appHeader></header><main></main></body>")?;
        let header = doc.element_by_id("appHeader").ok_or_else(|| anyhow!("missing header"))?;
        let mut pipeline = Pipeline::new(doc, PipelineConfig::default())?;
        pipeline.start();
        Ok((pipeline, header))
    }

    fn scroll(pipeline: &mut Pipeline, offset: f32) {
        pipeline.set_viewport(Viewport::new(1000.0, 800.0).scrolled_to(offset));
        pipeline.advance(Duration::from_millis(16));
    }

    #[test]
    fn sticky_header_waits_for_threshold() -> Result<(), Error> {
        let (mut pipeline, header) = header_pipeline()?;
        scroll(&mut pipeline, 50.0);
        assert!(!pipeline.document().has_class(header, "sticky-scroll"));
        scroll(&mut pipeline, 150.0);
        assert!(pipeline.document().has_class(header, "sticky-scroll"));
        scroll(&mut pipeline, 40.0);
        assert!(!pipeline.document().has_class(header, "sticky-scroll"));
        Ok(())
    }

    #[test]
    fn small_scroll_changes_are_ignored() -> Result<(), Error> {
        let (mut pipeline, header) = header_pipeline()?;
        scroll(&mut pipeline, 95.0);
        assert!(!pipeline.document().has_class(header, "sticky-scroll"));
        // 105px is past the threshold but within 10px of the last handled offset.
        scroll(&mut pipeline, 105.0);
        assert!(!pipeline.document().has_class(header, "sticky-scroll"));
        scroll(&mut pipeline, 106.0);
        assert!(pipeline.document().has_class(header, "sticky-scroll"));
        Ok(())
    }

    #[test]
    fn missing_header_is_ignored() -> Result<(), Error> {
        let mut pipeline = Pipeline::new(html::parse("<body></body>")?, PipelineConfig::default())?;
        pipeline.start();
        pipeline.set_viewport(Viewport::new(800.0, 600.0).scrolled_to(500.0));
        pipeline.advance(Duration::from_millis(32));
        assert_eq!(pipeline.status().frames, 1);
        Ok(())
    }

    #[test]
    fn slow_reflow_batches_layout_hints() -> Result<(), Error> {
        let doc = html::parse(
            "<body><div id=a data-optimize></div><div id=b data-optimize></div></body>",
        )?;
        let mut pipeline = Pipeline::new(doc, PipelineConfig::default())?;
        pipeline.start();
        pipeline.observe_performance(&PerformanceEntry::new(
            EntryType::Measure,
            "reflow",
            1.0,
            40.0,
        ));
        pipeline.observe_performance(&PerformanceEntry::new(
            EntryType::Measure,
            "reflow",
            2.0,
            35.0,
        ));
        pipeline.advance(Duration::from_millis(16));
        let second = pipeline.document().element_by_id("b").ok_or_else(|| anyhow!("missing b"))?;
        assert!(pipeline.document().style_property(second, "transform").is_none());
        pipeline.advance(Duration::from_millis(5));
        assert_eq!(
            pipeline.document().style_property(second, "transform").as_deref(),
            Some("translateZ(0)")
        );
        assert_eq!(pipeline.stats().batched_layouts, 1);
        assert_eq!(pipeline.stats().layout_hints, 2);
        Ok(())
    }

    #[test]
    fn layout_hint_keeps_inline_data_background() -> Result<(), Error> {
        let doc = html::parse(
            r#"<body><div id=hero data-optimize data-bg="data:image/png;base64,iVBORw0KGgo="></div></body>"#,
        )?;
        let hero = doc.element_by_id("hero").ok_or_else(|| anyhow!("missing hero"))?;
        let mut pipeline = Pipeline::new(doc, PipelineConfig::default())?;
        pipeline.start();
        pipeline.deliver_intersections(&[IntersectionEntry::visible(hero, 1.0)]);
        let loaded = pipeline.document().style_property(hero, "background-image");
        assert_eq!(
            loaded.as_deref(),
            Some(r#"url("data:image/png;base64,iVBORw0KGgo=")"#)
        );

        pipeline.observe_performance(&PerformanceEntry::new(EntryType::Measure, "reflow", 1.0, 40.0));
        pipeline.advance(Duration::from_millis(50));
        assert_eq!(pipeline.stats().layout_hints, 1);
        let document = pipeline.document();
        assert_eq!(document.style_property(hero, "background-image"), loaded);
        assert_eq!(
            document.style_property(hero, "transform").as_deref(),
            Some("translateZ(0)")
        );
        Ok(())
    }

    #[test]
    fn critical_preload_becomes_stylesheet_once_fetched() -> Result<(), Error> {
        let doc = html::parse(
            r#"<head><link rel="stylesheet" href="assets/css/bootstrap.min.css"><script src="assets/js/app.js"></script></head><body></body>"#,
        )?;
        let mut pipeline = Pipeline::new(doc, PipelineConfig::default())?;
        assert_eq!(pipeline.start().preloads, 1);
        let fetches = pipeline.drain_fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].name, "app.min.css");
        assert_eq!(fetches[0].url, "assets/css/app.min.css");
        assert_eq!(pipeline.registry().state("app.min.css"), Some(AssetState::Loading));

        let hint = pipeline
            .document()
            .query("link[data-asset='app.min.css']")?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("missing hint"))?;
        assert_eq!(pipeline.document().attr(hint, "rel"), Some("preload"));
        assert_eq!(pipeline.resource_settled("app.min.css", true), SettleOutcome::Loaded);
        assert_eq!(pipeline.document().attr(hint, "rel"), Some("stylesheet"));
        assert!(!pipeline.document().has_attr(hint, "as"));
        assert_eq!(pipeline.loaded_assets(), vec!["app.min.css"]);
        Ok(())
    }

    struct FullHeap;

    impl MemorySource for FullHeap {
        fn sample(&mut self) -> Option<MemoryInfo> {
            Some(MemoryInfo {
                used_bytes: 95 * 1024 * 1024,
                total_bytes: 100 * 1024 * 1024,
                limit_bytes: 200 * 1024 * 1024,
            })
        }
    }

    #[test]
    fn memory_poll_releases_cleanup_targets() -> Result<(), Error> {
        let doc = html::parse(
            r#"<body><img id=keep data-src="a.jpg"><img id=drop data-src="b.jpg" data-cleanup></body>"#,
        )?;
        let mut pipeline =
            Pipeline::new(doc, PipelineConfig::default())?.with_memory_source(Box::new(FullHeap));
        pipeline.start();
        assert_eq!(pipeline.pending_watches(), 2);
        pipeline.advance(Duration::from_millis(4999));
        assert_eq!(pipeline.stats().released_watches, 0);
        pipeline.advance(Duration::from_millis(1));
        assert_eq!(pipeline.stats().released_watches, 1);
        assert_eq!(pipeline.pending_watches(), 1);
        assert_eq!(pipeline.report().counters.memory_pressure_events, 1);
        Ok(())
    }

    #[test]
    fn components_that_fail_are_skipped() -> Result<(), Error> {
        let doc = html::parse(
            "<body><div class=widget id=ok></div><div class=widget id=bad></div></body>",
        )?;
        let mut pipeline = Pipeline::new(doc, PipelineConfig::default())?;
        let built = pipeline.initialize_components(".widget", |document, node| {
            match document.attr(node, "id") {
                Some("bad") => Err(anyhow!("constructor threw")),
                other => Ok(other.unwrap_or_default().to_owned()),
            }
        })?;
        assert_eq!(built, vec!["ok"]);
        assert_eq!(pipeline.stats().failed_components, 1);
        assert!(pipeline.initialize_components("div > p", |_, _| Ok(())).is_err());
        Ok(())
    }

    #[test]
    fn dynamic_content_goes_to_its_container() -> Result<(), Error> {
        let doc = html::parse("<body><p>static</p><div id=dynamic-content></div></body>")?;
        let mut pipeline = Pipeline::new(doc, PipelineConfig::default())?;
        let inserted = pipeline.write_dynamic_content("<span>live</span>")?;
        assert_eq!(inserted.len(), 1);
        let container = pipeline
            .document()
            .element_by_id("dynamic-content")
            .ok_or_else(|| anyhow!("missing container"))?;
        assert_eq!(pipeline.document().text_content(container), "live");
        Ok(())
    }
}
