//! Asset pruner: strips heavy assets from the initial document and records
//! them in the registry for on-demand reintroduction.

use html::{Document, NodeId};
use log::{debug, info};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::loader::ASSET_ATTR;
use crate::registry::{AssetKind, AssetState, ResourceRegistry, asset_name};

/// Registry name prefix for removed inline `document.write` scripts.
const INLINE_SCRIPT_PREFIX: &str = "inline-script-";

/// What one prune pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Names of block-listed assets removed from the document
    pub pruned: Vec<String>,
    pub deferred_scripts: usize,
    pub removed_inline_scripts: usize,
    pub lazy_images: usize,
    /// Images with no source at all that got placeholder styling
    pub placeholders: usize,
    pub preload_hints: usize,
}

pub struct AssetPruner<'cfg> {
    block_list: &'cfg [String],
    defer_exempt: &'cfg [String],
    critical_resources: &'cfg [String],
}

impl<'cfg> AssetPruner<'cfg> {
    #[must_use]
    pub fn new(config: &'cfg PipelineConfig) -> Self {
        Self {
            block_list: &config.block_list,
            defer_exempt: &config.defer_exempt,
            critical_resources: &config.critical_resources,
        }
    }

    /// Runs every pruning step over `document`.
    ///
    /// Repeated calls are safe: elements are only pruned while the registry
    /// still allows it, and attributes/hints already present are left alone.
    pub fn prune(&self, document: &mut Document, registry: &mut ResourceRegistry) -> PruneReport {
        let mut report = PruneReport {
            pruned: self.remove_blocked(document, registry),
            ..PruneReport::default()
        };
        report.removed_inline_scripts = strip_document_write(document, registry);
        report.deferred_scripts = self.defer_scripts(document);
        report.lazy_images = lazy_images(document);
        report.placeholders = placeholder_images(document);
        report.preload_hints = self.inject_preloads(document, registry);
        info!(
            "Pruned {} heavy assets, deferred {} scripts",
            report.pruned.len(),
            report.deferred_scripts
        );
        report
    }

    fn is_blocked(&self, url: &str) -> bool {
        self.block_list
            .iter()
            .any(|fragment| !fragment.is_empty() && url.contains(fragment.as_str()))
    }

    fn remove_blocked(&self, document: &mut Document, registry: &mut ResourceRegistry) -> Vec<String> {
        let candidates: Vec<(NodeId, String, String)> = document
            .elements()
            .into_iter()
            .filter_map(|node| {
                let tag = document.tag(node)?;
                let url = match tag {
                    "link" => document.attr(node, "href")?,
                    "script" => document.attr(node, "src")?,
                    _ => return None,
                };
                self.is_blocked(url)
                    .then(|| (node, tag.to_owned(), url.to_owned()))
            })
            .collect();

        let mut pruned = Vec::new();
        for (node, tag, url) in candidates {
            let name = asset_name(&url);
            match registry.state(&name) {
                Some(AssetState::Loading | AssetState::Loaded) => {
                    debug!("Keeping {name}: already brought back on demand");
                    continue;
                }
                Some(AssetState::Removed) => {
                    document.remove_node(node);
                    continue;
                }
                Some(AssetState::Pending | AssetState::Deferred) | None => {}
            }
            registry.register(&name, AssetKind::infer(&tag, &url), &url);
            registry.mark_deferred(&name);
            if document.remove_node(node) {
                info!("Removing heavy asset: {name}");
                if !pruned.contains(&name) {
                    pruned.push(name);
                }
            }
        }
        pruned
    }

    /// Adds `defer` to blocking external scripts outside the exemption list.
    fn defer_scripts(&self, document: &mut Document) -> usize {
        let blocking: Vec<NodeId> = document
            .query("script[src]:not([defer]):not([async])")
            .unwrap_or_default()
            .into_iter()
            .filter(|node| document.attr(*node, "type") != Some("module"))
            .filter(|node| {
                let src = document.attr(*node, "src").unwrap_or_default();
                !self
                    .defer_exempt
                    .iter()
                    .any(|exempt| src.contains(exempt.as_str()))
            })
            .collect();
        blocking
            .into_iter()
            .filter(|node| document.set_attr(*node, "defer", "").is_ok())
            .count()
    }

    /// Adds `<link rel="preload">` for critical resources the page does not
    /// already reference. Each hint is registered as `Pending` and tagged
    /// with its registry name so the loader can take it over.
    fn inject_preloads(&self, document: &mut Document, registry: &mut ResourceRegistry) -> usize {
        let Some(head) = document.head() else {
            return 0;
        };
        let mut injected = 0;
        for resource in self.critical_resources {
            let referenced = document.elements().into_iter().any(|node| {
                document.attr(node, "href") == Some(resource.as_str())
                    || document.attr(node, "src") == Some(resource.as_str())
            });
            if referenced {
                continue;
            }
            let name = asset_name(resource);
            if registry.get(&name).is_some() {
                debug!("Skipping preload hint for {name}: already tracked");
                continue;
            }
            let tag = if resource.ends_with(".js") { "script" } else { "link" };
            let kind = AssetKind::infer(tag, resource);
            let link = document.create_element("link");
            let attached = document
                .set_attr(link, "rel", "preload")
                .and_then(|()| document.set_attr(link, "href", resource))
                .and_then(|()| document.set_attr(link, "as", kind.preload_destination()))
                .and_then(|()| document.set_attr(link, ASSET_ATTR, &name))
                .and_then(|()| document.append_child(head, link));
            match attached {
                Ok(()) => {
                    registry.register(&name, kind, resource);
                    injected += 1;
                }
                Err(err) => debug!("Skipping preload hint for {resource}: {err}"),
            }
        }
        injected
    }
}

/// Removes inline scripts that call `document.write`.
fn strip_document_write(document: &mut Document, registry: &mut ResourceRegistry) -> usize {
    let inline: Vec<NodeId> = document
        .query("script:not([src])")
        .unwrap_or_default()
        .into_iter()
        .filter(|node| document.text_content(*node).contains("document.write"))
        .collect();
    let mut removed = 0;
    for node in inline {
        let index = registry
            .descriptors()
            .filter(|descriptor| descriptor.name.starts_with(INLINE_SCRIPT_PREFIX))
            .count();
        let name = format!("{INLINE_SCRIPT_PREFIX}{index}");
        registry.register(&name, AssetKind::Script, "");
        registry.mark_removed(&name);
        if document.remove_node(node) {
            info!("Removed inline document.write script {name}");
            removed += 1;
        }
    }
    removed
}

/// Gives images with neither `src` nor `data-src` a visible placeholder box.
fn placeholder_images(document: &mut Document) -> usize {
    let empty = document
        .query("img:not([src]):not([data-src])")
        .unwrap_or_default();
    let mut styled = 0;
    for node in empty {
        if document.style_property(node, "min-height").is_some() {
            continue;
        }
        let applied = document
            .set_style_property(node, "background", "#f0f0f0")
            .and_then(|()| document.set_style_property(node, "min-height", "200px"));
        match applied {
            Ok(()) => styled += 1,
            Err(err) => debug!("Skipping image placeholder: {err}"),
        }
    }
    styled
}

/// Marks images without a `loading` attribute as lazily loaded.
fn lazy_images(document: &mut Document) -> usize {
    let images = document.query("img:not([loading])").unwrap_or_default();
    images
        .into_iter()
        .filter(|node| document.set_attr(*node, "loading", "lazy").is_ok())
        .count()
}
