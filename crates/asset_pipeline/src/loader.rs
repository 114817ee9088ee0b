//! Lazy resource loader: materializes deferred images, backgrounds, script
//! placeholders and on-demand bundles when their elements become visible.
//!
//! Scripts and stylesheets go through [`ResourceRegistry::begin_load`]
//! before any element is created, so two triggers firing in the same frame
//! produce one element and one [`FetchRequest`]. The loader never performs
//! I/O: the host drains the fetch requests and reports back through
//! [`LazyResourceLoader::settle`].

use core::mem::take;
use std::collections::HashMap;

use anyhow::{Error, anyhow};
use html::{Document, NodeId, Selector};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{LazyGroup, PipelineConfig};
use crate::registry::{AssetKind, AssetState, ResourceRegistry, asset_name};
use crate::visibility::{VisibilityScheduler, WatchTarget};

/// Attribute linking an attached element to its registry name.
pub const ASSET_ATTR: &str = "data-asset";

/// What to do when a watched element becomes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchAction {
    /// `img[data-src]`
    LoadImage,
    /// `[data-bg]`
    LoadBackground,
    /// `script[data-src]` placeholder
    LoadScript,
    /// Index into the configured lazy groups
    LoadGroup(usize),
}

/// A network fetch the host must perform and later settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    pub name: String,
    pub kind: AssetKind,
    pub url: String,
    /// 1 for the first attempt, incremented per retry
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Loaded,
    /// Failed; a retry should be scheduled after the backoff.
    RetryScheduled,
    /// Failed and out of retries; the asset stays deferred.
    GaveUp,
    /// The asset was not loading.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoaderStats {
    pub images: usize,
    pub backgrounds: usize,
    pub attached: usize,
}

#[derive(Debug, Clone)]
struct Attempt {
    kind: AssetKind,
    url: String,
    node: Option<NodeId>,
    count: u32,
}

pub struct LazyResourceLoader {
    groups: Vec<(LazyGroup, Selector)>,
    max_retries: u32,
    attempts: HashMap<String, Attempt>,
    outbox: Vec<FetchRequest>,
    stats: LoaderStats,
}

impl LazyResourceLoader {
    /// Builds a loader for the configured lazy groups.
    ///
    /// # Errors
    /// Returns an error if a group's trigger selector cannot be parsed.
    pub fn new(config: &PipelineConfig) -> Result<Self, Error> {
        let groups = config
            .groups
            .iter()
            .map(|group| {
                Selector::parse(&group.triggers)
                    .map(|selector| (group.clone(), selector))
                    .map_err(|err| anyhow!("Invalid triggers for {}: {err}", group.url))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            groups,
            max_retries: config.max_retries,
            attempts: HashMap::new(),
            outbox: Vec::new(),
            stats: LoaderStats::default(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Scans `document` for lazy markers and group triggers and registers a
    /// watch target for each.
    ///
    /// # Returns
    /// The number of targets registered.
    pub fn arm(&self, document: &Document, scheduler: &mut VisibilityScheduler<WatchAction>) -> usize {
        let mut armed = 0;
        let markers = [
            ("img[data-src]", WatchAction::LoadImage),
            ("[data-bg]", WatchAction::LoadBackground),
            ("script[data-src]", WatchAction::LoadScript),
        ];
        for (selector, action) in markers {
            for node in document.query(selector).unwrap_or_default() {
                scheduler.watch(node, action);
                armed += 1;
            }
        }
        for (index, (_, selector)) in self.groups.iter().enumerate() {
            for node in document.select(selector) {
                scheduler.watch(node, WatchAction::LoadGroup(index));
                armed += 1;
            }
        }
        debug!("Armed {armed} visibility targets");
        armed
    }

    /// Runs the action of a fired watch target. Best effort: failures are
    /// logged and the element is skipped.
    pub fn on_visible(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        target: &WatchTarget<WatchAction>,
    ) {
        if !document.is_attached(target.element) {
            debug!("Skipping detached element {:?}", target.element);
            return;
        }
        let result = match target.action {
            WatchAction::LoadImage => self.load_image(document, registry, target.element),
            WatchAction::LoadBackground => self.load_background(document, registry, target.element),
            WatchAction::LoadScript => self.load_placeholder(document, registry, target.element),
            WatchAction::LoadGroup(index) => self.load_group(document, registry, index),
        };
        if let Err(err) = result {
            warn!("Lazy load of {:?} failed: {err}", target.action);
        }
    }

    fn load_image(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        element: NodeId,
    ) -> Result<(), Error> {
        let Some(src) = document.remove_attr(element, "data-src") else {
            return Ok(());
        };
        record_immediate(registry, &src);
        document.set_attr(element, "src", &src)?;
        document.add_class(element, "loaded")?;
        self.stats.images += 1;
        debug!("Image loaded: {src}");
        Ok(())
    }

    fn load_background(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        element: NodeId,
    ) -> Result<(), Error> {
        let Some(url) = document.remove_attr(element, "data-bg") else {
            return Ok(());
        };
        record_immediate(registry, &url);
        let escaped = url.replace('\\', "\\\\").replace('"', "\\\"");
        document.set_style_property(element, "background-image", &format!("url(\"{escaped}\")"))?;
        document.add_class(element, "loaded")?;
        self.stats.backgrounds += 1;
        debug!("Background loaded: {url}");
        Ok(())
    }

    fn load_placeholder(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        placeholder: NodeId,
    ) -> Result<(), Error> {
        let Some(url) = document.attr(placeholder, "data-src").map(str::to_owned) else {
            return Ok(());
        };
        let name = asset_name(&url);
        registry.register(&name, AssetKind::Script, &url);
        if !registry.begin_load(&name) {
            debug!("Script {name} already requested; leaving placeholder");
            return Ok(());
        }
        self.start_attempt(document, registry, &name, AssetKind::Script, &url, Some(placeholder))
    }

    fn load_group(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        index: usize,
    ) -> Result<(), Error> {
        let Some((group, _)) = self.groups.get(index) else {
            return Err(anyhow!("Unknown lazy group {index}"));
        };
        if group.requires_rtl && !is_rtl(document) {
            debug!("Skipping {}: document is not right-to-left", group.url);
            return Ok(());
        }
        let (name, kind) = (group.name(), group.kind);
        // A pruned asset keeps the URL it was removed with.
        let url = registry
            .get(&name)
            .map(|descriptor| descriptor.url.clone())
            .filter(|recorded| !recorded.is_empty())
            .unwrap_or_else(|| group.url.clone());
        registry.register(&name, kind, &url);
        if !registry.begin_load(&name) {
            return Ok(());
        }
        self.start_attempt(document, registry, &name, kind, &url, None)
    }

    /// Takes over the preload hints the pruner injected: every hint still
    /// `Pending` in the registry becomes an in-flight load with a fetch
    /// request. A successful settle turns a stylesheet hint into
    /// `rel="stylesheet"`.
    ///
    /// # Returns
    /// The number of hints now loading.
    pub fn track_preloads(&mut self, document: &Document, registry: &mut ResourceRegistry) -> usize {
        let hints = document
            .query(&format!("link[rel=preload][{ASSET_ATTR}]"))
            .unwrap_or_default();
        let mut tracked = 0;
        for node in hints {
            let Some(name) = document.attr(node, ASSET_ATTR).map(str::to_owned) else {
                continue;
            };
            let Some((kind, url)) = registry
                .get(&name)
                .filter(|descriptor| descriptor.state == AssetState::Pending)
                .map(|descriptor| (descriptor.kind, descriptor.url.clone()))
            else {
                continue;
            };
            if !registry.begin_load(&name) {
                continue;
            }
            self.attempts.insert(
                name.clone(),
                Attempt {
                    kind,
                    url: url.clone(),
                    node: Some(node),
                    count: 1,
                },
            );
            debug!("Tracking preload hint {name}");
            self.outbox.push(FetchRequest {
                name,
                kind,
                url,
                attempt: 1,
            });
            tracked += 1;
        }
        tracked
    }

    /// Attaches the element for an asset whose `begin_load` just succeeded
    /// and queues its fetch.
    fn start_attempt(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        name: &str,
        kind: AssetKind,
        url: &str,
        placeholder: Option<NodeId>,
    ) -> Result<(), Error> {
        let node = match attach(document, name, kind, url, placeholder) {
            Ok(node) => node,
            Err(err) => {
                registry.complete(name, false);
                return Err(err);
            }
        };
        let attempt = self
            .attempts
            .entry(name.to_owned())
            .or_insert_with(|| Attempt {
                kind,
                url: url.to_owned(),
                node: None,
                count: 0,
            });
        attempt.node = Some(node);
        attempt.count += 1;
        self.stats.attached += 1;
        self.outbox.push(FetchRequest {
            name: name.to_owned(),
            kind,
            url: url.to_owned(),
            attempt: attempt.count,
        });
        info!("Requested {name} on demand (attempt {})", attempt.count);
        Ok(())
    }

    /// Records the outcome of a fetch for `name`.
    ///
    /// On failure the attached element is removed and the descriptor returns
    /// to `Deferred`; [`SettleOutcome::RetryScheduled`] tells the caller to
    /// call [`LazyResourceLoader::retry`] after the backoff.
    pub fn settle(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        name: &str,
        success: bool,
    ) -> SettleOutcome {
        if !registry.complete(name, success) {
            return SettleOutcome::Ignored;
        }
        if success {
            self.apply_preloaded_style(document, name);
            match registry.get(name).map(|descriptor| descriptor.kind) {
                Some(AssetKind::Script) => info!("Script loaded: {name}"),
                _ => info!("Loaded on demand: {name}"),
            }
            return SettleOutcome::Loaded;
        }
        if let Some(node) = self.attempts.get_mut(name).and_then(|attempt| attempt.node.take()) {
            document.remove_node(node);
        }
        let failures = registry.get(name).map_or(0, |descriptor| descriptor.failures);
        if failures <= self.max_retries {
            warn!("Failed to load {name}; retrying");
            SettleOutcome::RetryScheduled
        } else {
            warn!("Failed to load {name} after {failures} attempts; leaving it deferred");
            SettleOutcome::GaveUp
        }
    }

    fn apply_preloaded_style(&self, document: &mut Document, name: &str) {
        let Some(node) = self
            .attempts
            .get(name)
            .filter(|attempt| attempt.kind == AssetKind::Style)
            .and_then(|attempt| attempt.node)
        else {
            return;
        };
        if document.attr(node, "rel") != Some("preload") {
            return;
        }
        match document.set_attr(node, "rel", "stylesheet") {
            Ok(()) => {
                document.remove_attr(node, "as");
                debug!("Preloaded stylesheet {name} applied");
            }
            Err(err) => debug!("Could not apply preloaded {name}: {err}"),
        }
    }

    /// Re-attempts a deferred asset, using the URL of its last attempt or,
    /// for assets never requested, the URL the registry recorded.
    ///
    /// # Returns
    /// `false` when the asset is unknown or not in a loadable state.
    pub fn retry(
        &mut self,
        document: &mut Document,
        registry: &mut ResourceRegistry,
        name: &str,
    ) -> bool {
        let source = self
            .attempts
            .get(name)
            .map(|attempt| (attempt.kind, attempt.url.clone()))
            .or_else(|| {
                registry
                    .get(name)
                    .map(|descriptor| (descriptor.kind, descriptor.url.clone()))
            });
        let Some((kind, url)) = source else {
            debug!("Nothing to retry for {name}");
            return false;
        };
        if url.is_empty() || !registry.begin_load(name) {
            return false;
        }
        match self.start_attempt(document, registry, name, kind, &url, None) {
            Ok(()) => true,
            Err(err) => {
                warn!("Retry of {name} failed: {err}");
                false
            }
        }
    }

    /// Takes the fetch requests queued since the last call.
    pub fn drain_fetches(&mut self) -> Vec<FetchRequest> {
        take(&mut self.outbox)
    }

    #[must_use]
    pub fn pending_fetches(&self) -> usize {
        self.outbox.len()
    }
}

/// Images and backgrounds load with the element itself; the registry only
/// keeps a record of them.
fn record_immediate(registry: &mut ResourceRegistry, url: &str) {
    let name = asset_name(url);
    registry.register(&name, AssetKind::Image, url);
    if registry.begin_load(&name) {
        registry.complete(&name, true);
    }
}

fn is_rtl(document: &Document) -> bool {
    document
        .document_element()
        .and_then(|html| document.attr(html, "dir"))
        .is_some_and(|dir| dir.eq_ignore_ascii_case("rtl"))
}

/// Creates the element for an asset and puts it in the document.
fn attach(
    document: &mut Document,
    name: &str,
    kind: AssetKind,
    url: &str,
    placeholder: Option<NodeId>,
) -> Result<NodeId, Error> {
    let node = match kind {
        AssetKind::Script => {
            let script = document.create_element("script");
            document.set_attr(script, "src", url)?;
            document.set_attr(script, "async", "")?;
            script
        }
        AssetKind::Style => {
            let link = document.create_element("link");
            document.set_attr(link, "rel", "stylesheet")?;
            document.set_attr(link, "href", url)?;
            link
        }
        AssetKind::Font | AssetKind::Icon | AssetKind::Image => {
            let link = document.create_element("link");
            document.set_attr(link, "rel", "preload")?;
            document.set_attr(link, "href", url)?;
            document.set_attr(link, "as", kind.preload_destination())?;
            link
        }
    };
    document.set_attr(node, ASSET_ATTR, name)?;
    match placeholder.filter(|old| document.is_attached(*old)) {
        Some(old) => document.replace_node(old, node)?,
        None => {
            let parent = document
                .head()
                .or_else(|| document.body())
                .or_else(|| document.document_element())
                .unwrap_or_else(|| document.root());
            document.append_child(parent, node)?;
        }
    }
    Ok(node)
}
