//! Runs the asset pipeline over a page on disk or on the network.
//!
//! The page is parsed, laid out at the requested viewport width and
//! scrolled from top to bottom one viewport at a time. Every fetch the
//! pipeline requests is performed for real and reported back, so failed
//! bundles go through the same retry path a browser session would.
#![allow(
    clippy::missing_inline_in_public_items,
    reason = "Inlining decisions left to compiler for this crate"
)]

pub mod fetch;
pub mod source;

use core::time::Duration;
use std::path::PathBuf;

use anyhow::{Error, anyhow, bail};
use asset_pipeline::{FlowLayout, Pipeline, PipelineConfig, PipelineStatus, StartupSummary, Viewport};
use log::info;
use serde::Serialize;
use tokio::fs::write as tokio_fs_write;
use url::Url;

use crate::fetch::{FetchOutcome, fetch_all};

/// Command line options for one run.
#[derive(Debug, Clone)]
pub struct Options {
    pub input: Url,
    /// Where to write the optimized markup
    pub out: Option<PathBuf>,
    /// Where to write the JSON run report
    pub report: Option<PathBuf>,
    pub viewport_width: f32,
    pub viewport_height: f32,
}

impl Options {
    /// Parses `page [--out=PATH] [--report=PATH] [--viewport=WxH]`.
    ///
    /// # Errors
    /// Returns `Err` on a missing page argument, an unknown flag or a
    /// malformed viewport.
    pub fn from_args<I>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = String>,
    {
        let mut input = None;
        let mut out = None;
        let mut report = None;
        let default_viewport = Viewport::default();
        let mut viewport_width = default_viewport.width;
        let mut viewport_height = default_viewport.height;
        for arg in args {
            if let Some(rest) = arg.strip_prefix("--out=") {
                out = Some(PathBuf::from(rest));
            } else if let Some(rest) = arg.strip_prefix("--report=") {
                report = Some(PathBuf::from(rest));
            } else if let Some(rest) = arg.strip_prefix("--viewport=") {
                (viewport_width, viewport_height) = parse_viewport(rest)?;
            } else if arg.starts_with("--") {
                bail!("Unknown option {arg}");
            } else if input.is_none() {
                input = Some(source::resolve_input(&arg)?);
            } else {
                bail!("Unexpected argument {arg}");
            }
        }
        let input = input.ok_or_else(|| {
            anyhow!("usage: page_optimizer <page> [--out=PATH] [--report=PATH] [--viewport=WxH]")
        })?;
        Ok(Self {
            input,
            out,
            report,
            viewport_width,
            viewport_height,
        })
    }

    #[must_use]
    pub const fn viewport(&self) -> Viewport {
        Viewport::new(self.viewport_width, self.viewport_height)
    }
}

fn parse_viewport(value: &str) -> Result<(f32, f32), Error> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| anyhow!("Viewport must look like 1280x800, got {value}"))?;
    let width: f32 = width.trim().parse()?;
    let height: f32 = height.trim().parse()?;
    if width < 1.0 || height < 1.0 {
        bail!("Viewport dimensions must be positive, got {value}");
    }
    Ok((width, height))
}

/// Everything written to the `--report` file.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub input: String,
    pub content_height: f32,
    pub scroll_positions: usize,
    pub startup: StartupSummary,
    pub fetches: Vec<FetchOutcome>,
    pub status: PipelineStatus,
}

/// Loads, optimizes and scrolls through a page.
///
/// # Errors
/// Returns `Err` if the page cannot be loaded or parsed, the pipeline
/// configuration is invalid, or an output file cannot be written.
pub async fn run(options: &Options) -> Result<RunReport, Error> {
    let markup = source::read_text(&options.input).await?;
    let document = html::parse(&markup)?;
    let viewport = options.viewport();
    let layout = FlowLayout::compute(&document, viewport.width);
    let content_height = layout.content_height();

    let config = PipelineConfig::from_env();
    let frame = config.frame_interval();
    let backoff = config.retry_backoff();
    let retry_rounds = config.max_retries;
    let mut pipeline = Pipeline::new(document, config)?.with_layout(Box::new(layout));
    let startup = pipeline.start();
    info!(
        "Pruned {} assets, watching {} elements",
        startup.pruned.pruned.len(),
        startup.watched
    );

    let mut fetches = Vec::new();
    let mut scroll = 0.0_f32;
    let mut scroll_positions = 0;
    loop {
        scroll_positions += 1;
        pipeline.set_viewport(viewport.scrolled_to(scroll));
        pipeline.advance(frame);
        settle_pending(&mut pipeline, &options.input, &mut fetches).await;
        if scroll + viewport.height >= content_height {
            break;
        }
        scroll += viewport.height;
    }
    for _ in 0..retry_rounds {
        pipeline.advance(backoff);
        settle_pending(&mut pipeline, &options.input, &mut fetches).await;
    }
    // Let pending layout hints and report checks run.
    pipeline.advance(Duration::from_millis(100));

    if let Some(path) = &options.out {
        tokio_fs_write(path, pipeline.document().to_html())
            .await
            .map_err(|err| anyhow!("Failed to write {}: {err}", path.display()))?;
    }
    let report = RunReport {
        input: options.input.to_string(),
        content_height,
        scroll_positions,
        startup,
        fetches,
        status: pipeline.status(),
    };
    if let Some(path) = &options.report {
        let json = serde_json::to_vec_pretty(&report)?;
        tokio_fs_write(path, json)
            .await
            .map_err(|err| anyhow!("Failed to write {}: {err}", path.display()))?;
    }
    Ok(report)
}

/// Performs requested fetches until the pipeline stops asking for more.
/// Retries are timer driven, so this loop never spins on a failing asset.
async fn settle_pending(pipeline: &mut Pipeline, base: &Url, log: &mut Vec<FetchOutcome>) {
    loop {
        let requests = pipeline.drain_fetches();
        if requests.is_empty() {
            return;
        }
        for outcome in fetch_all(base, requests).await {
            pipeline.resource_settled(&outcome.name, outcome.success);
            log.push(outcome);
        }
    }
}
