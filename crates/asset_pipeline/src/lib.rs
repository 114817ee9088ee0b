//! Client-side asset optimization over an owned HTML document.
//!
//! The [`Pipeline`] prunes heavy assets at startup, restores fallback
//! styling, loads deferred images, scripts and stylesheets as their
//! elements scroll into view, and monitors runtime performance signals.
//! It is sans-IO: network fetches are handed to the host as
//! [`FetchRequest`]s and reported back with [`Pipeline::resource_settled`],
//! and time only moves when the host calls [`Pipeline::advance`].
#![allow(
    clippy::missing_inline_in_public_items,
    reason = "Inlining decisions left to compiler for this crate"
)]

pub mod config;
pub mod event_loop;
pub mod geometry;
pub mod layout;
pub mod loader;
pub mod monitor;
pub mod pipeline;
pub mod pruner;
pub mod registry;
pub mod restorer;
pub mod telemetry;
pub mod visibility;

pub use config::{LazyGroup, MonitorThresholds, PipelineConfig};
pub use geometry::{Rect, RootMargin, Viewport};
pub use layout::{FlowLayout, LayoutProvider};
pub use loader::{FetchRequest, SettleOutcome, WatchAction};
pub use monitor::{
    CorrectiveAction, EntryType, InstrumentedTimer, MemoryInfo, MemorySource, PerformanceEntry,
    PerformanceReport,
};
pub use pipeline::{Pipeline, PipelineStatus, StartupSummary};
pub use registry::{AssetDescriptor, AssetKind, AssetState, ResourceRegistry};
pub use visibility::{IntersectionEntry, VisibilityScheduler};
