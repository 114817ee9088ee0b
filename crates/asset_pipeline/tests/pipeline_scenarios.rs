use core::time::Duration;

use anyhow::{Error, anyhow};
use asset_pipeline::{
    AssetState, EntryType, FlowLayout, IntersectionEntry, PerformanceEntry, Pipeline,
    PipelineConfig, SettleOutcome, Viewport,
};
use asset_pipeline::telemetry::status_json;
use html::NodeId;

const DASHBOARD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <link rel="stylesheet" href="assets/css/bootstrap.min.css">
    <link rel="stylesheet" href="assets/css/icons.min.css">
    <link rel="stylesheet" href="assets/css/app.min.css">
    <link rel="preload" href="assets/fonts/remixicon.symbol.svg">
    <link rel="preload" href="assets/fonts/remixicon.ttf">
    <script src="assets/js/ultra-performance.js"></script>
    <script src="assets/js/app.js"></script>
</head>
<body>
    <header id="appHeader" style="height: 60px"></header>
    <div id="hero" style="height: 1200px"></div>
    <img id="photo" data-src="photo.jpg" width="400" height="300">
    <i id="icon-a" class="ri-home-line"></i>
    <i id="icon-b" class="ri-user-line"></i>
    <div id="spacer" style="height: 2000px"></div>
    <div id="chart" class="chart" style="height: 300px"></div>
</body>
</html>"#;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn started(html: &str) -> Result<Pipeline, Error> {
    let document = html::parse(html)?;
    let layout = FlowLayout::compute(&document, 1280.0);
    let mut pipeline = Pipeline::new(document, PipelineConfig::default())?.with_layout(Box::new(layout));
    pipeline.start();
    Ok(pipeline)
}

fn element(pipeline: &Pipeline, id: &str) -> Result<NodeId, Error> {
    pipeline
        .document()
        .element_by_id(id)
        .ok_or_else(|| anyhow!("missing #{id}"))
}

#[test]
fn block_listed_assets_are_pruned_and_deferred() -> Result<(), Error> {
    init_logging();
    let pipeline = started(DASHBOARD)?;
    let config = PipelineConfig::default();
    let markup = pipeline.document().to_html();
    for blocked in &config.block_list {
        assert!(!markup.contains(blocked.as_str()), "{blocked} still referenced");
    }
    for name in ["icons.min.css", "remixicon.symbol.svg", "remixicon.ttf"] {
        assert_eq!(pipeline.registry().state(name), Some(AssetState::Deferred), "{name}");
    }
    assert!(markup.contains("data-fallback-styles"));
    Ok(())
}

#[test]
fn image_near_viewport_is_loaded() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    let photo = element(&pipeline, "photo")?;

    // The image starts at y = 1260; a 1220px tall viewport plus the 50px
    // margin reaches it.
    assert_eq!(pipeline.set_viewport(Viewport::new(1280.0, 1100.0)), 0);
    assert!(pipeline.document().has_attr(photo, "data-src"));
    pipeline.set_viewport(Viewport::new(1280.0, 1220.0));

    let document = pipeline.document();
    assert_eq!(document.attr(photo, "src"), Some("photo.jpg"));
    assert!(!document.has_attr(photo, "data-src"));
    assert!(document.has_class(photo, "loaded"));
    Ok(())
}

#[test]
fn icons_stylesheet_is_attached_once_for_many_icons() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    assert!(!pipeline.document().to_html().contains("remixicon.symbol.svg"));

    pipeline.set_viewport(Viewport::new(1280.0, 800.0).scrolled_to(900.0));
    let fetches = pipeline.drain_fetches();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].url, "assets/css/icons.min.css");
    let attached = pipeline
        .document()
        .query("link[href='assets/css/icons.min.css']")?;
    assert_eq!(attached.len(), 1);

    assert_eq!(pipeline.resource_settled("icons.min.css", true), SettleOutcome::Loaded);
    assert_eq!(pipeline.loaded_assets(), vec!["icons.min.css", "photo.jpg"]);

    // Scrolling again never brings the block-listed stylesheet back twice.
    pipeline.set_viewport(Viewport::new(1280.0, 800.0).scrolled_to(3000.0));
    let later: Vec<String> = pipeline.drain_fetches().into_iter().map(|fetch| fetch.name).collect();
    assert_eq!(later, vec!["chartjs.init.js"]);
    assert_eq!(
        pipeline
            .document()
            .query("link[href='assets/css/icons.min.css']")?
            .len(),
        1
    );
    Ok(())
}

#[test]
fn duplicate_visibility_events_issue_one_request() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    let first = element(&pipeline, "icon-a")?;
    let second = element(&pipeline, "icon-b")?;
    let entries = [
        IntersectionEntry::visible(first, 1.0),
        IntersectionEntry::visible(second, 1.0),
        IntersectionEntry::visible(first, 1.0),
    ];
    assert_eq!(pipeline.deliver_intersections(&entries), 2);
    assert_eq!(pipeline.deliver_intersections(&entries), 0);
    assert_eq!(pipeline.drain_fetches().len(), 1);
    Ok(())
}

#[test]
fn failed_bundle_is_retried_after_backoff() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    let chart = element(&pipeline, "chart")?;
    pipeline.deliver_intersections(&[IntersectionEntry::visible(chart, 0.5)]);
    assert_eq!(pipeline.drain_fetches().len(), 1);

    assert_eq!(
        pipeline.resource_settled("chartjs.init.js", false),
        SettleOutcome::RetryScheduled
    );
    assert_eq!(
        pipeline.registry().state("chartjs.init.js"),
        Some(AssetState::Deferred)
    );
    pipeline.advance(Duration::from_millis(999));
    assert!(pipeline.drain_fetches().is_empty());
    pipeline.advance(Duration::from_millis(1));
    let retry = pipeline.drain_fetches();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].attempt, 2);

    assert_eq!(pipeline.resource_settled("chartjs.init.js", false), SettleOutcome::GaveUp);
    pipeline.advance(Duration::from_secs(5));
    assert!(pipeline.drain_fetches().is_empty());
    assert!(pipeline.retrigger("chartjs.init.js"));
    assert_eq!(pipeline.drain_fetches().len(), 1);
    Ok(())
}

#[test]
fn repeated_long_task_entry_yields_once() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    let entry = PerformanceEntry::new(EntryType::LongTask, "self", 1500.0, 120.0);
    pipeline.observe_performance(&entry);
    pipeline.observe_performance(&entry);
    assert_eq!(pipeline.stats().yields, 1);
    assert_eq!(pipeline.report().counters.long_tasks, 1);

    // Visibility work is postponed until the continuation runs.
    let photo = element(&pipeline, "photo")?;
    pipeline.deliver_intersections(&[IntersectionEntry::visible(photo, 1.0)]);
    assert!(pipeline.document().has_attr(photo, "data-src"));
    pipeline.advance(Duration::ZERO);
    assert!(!pipeline.document().has_attr(photo, "data-src"));
    Ok(())
}

#[test]
fn score_stays_in_range_and_never_rises() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    let mut previous = pipeline.report().performance_score;
    assert_eq!(previous, 100);
    for index in 0..40_u32 {
        let start = f64::from(index) * 100.0;
        pipeline.observe_performance(&PerformanceEntry::new(EntryType::LongTask, "self", start, 60.0));
        pipeline.observe_performance(&PerformanceEntry::new(EntryType::Measure, "reflow", start, 20.0));
        pipeline.instrument("handler", || ());
        let score = pipeline.report().performance_score;
        assert!(score <= previous);
        assert!(score <= 100);
        previous = score;
    }
    assert_eq!(previous, 50);
    Ok(())
}

#[test]
fn restart_and_status_are_stable() -> Result<(), Error> {
    init_logging();
    let mut pipeline = started(DASHBOARD)?;
    let before = pipeline.document().to_html();
    let again = pipeline.start();
    assert!(again.pruned.pruned.is_empty());
    assert_eq!(pipeline.document().to_html(), before);
    assert_eq!(before.matches("data-fallback-styles").count(), 1);

    let status = status_json(&pipeline.status());
    let parsed: serde_json::Value = serde_json::from_str(&status)?;
    assert_eq!(parsed["report"]["performance_score"], 100);
    assert!(parsed["pending_watches"].as_u64().unwrap_or_default() > 0);
    Ok(())
}
