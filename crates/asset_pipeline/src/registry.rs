//! Resource registry: the single source of truth for asset lifecycle state.
//!
//! Every asset the pipeline prunes, defers or loads on demand has exactly
//! one descriptor keyed by its name. Lifecycle transitions are:
//!
//! ```text
//! Pending -> Deferred | Removed
//! Deferred -> Loading | Removed
//! Loading -> Loaded | Deferred (on failure)
//! ```
//!
//! `begin_load` is the check-and-set that guarantees at most one in-flight
//! load per asset; callers that lose the race get `false` and must not
//! start another fetch.

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Style,
    Script,
    Font,
    Icon,
    Image,
}

impl AssetKind {
    /// Infers the kind of a `<link>`/`<script>` asset from its tag and URL.
    #[must_use]
    pub fn infer(tag: &str, url: &str) -> Self {
        let name = asset_name(url).to_ascii_lowercase();
        let extension = name.rsplit_once('.').map_or("", |(_, ext)| ext);
        match extension {
            "woff" | "woff2" | "ttf" | "eot" | "otf" => Self::Font,
            "svg" => Self::Icon,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" => Self::Image,
            _ if tag.eq_ignore_ascii_case("script") => Self::Script,
            _ => Self::Style,
        }
    }

    /// The `as` value of a preload hint for this kind.
    #[must_use]
    pub const fn preload_destination(self) -> &'static str {
        match self {
            Self::Style => "style",
            Self::Script => "script",
            Self::Font => "font",
            Self::Icon | Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Pending,
    Deferred,
    Loading,
    Loaded,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetDescriptor {
    pub name: String,
    pub kind: AssetKind,
    pub url: String,
    pub state: AssetState,
    /// Number of failed load attempts
    pub failures: u32,
}

/// Keyed store of asset descriptors.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    assets: BTreeMap<String, AssetDescriptor>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an asset in `Pending`. Registering an existing name is a
    /// no-op that returns the current descriptor.
    pub fn register(&mut self, name: &str, kind: AssetKind, url: &str) -> &AssetDescriptor {
        self.assets
            .entry(name.to_owned())
            .or_insert_with(|| AssetDescriptor {
                name: name.to_owned(),
                kind,
                url: url.to_owned(),
                state: AssetState::Pending,
                failures: 0,
            })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AssetDescriptor> {
        self.assets.get(name)
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<AssetState> {
        self.get(name).map(|descriptor| descriptor.state)
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.state(name) == Some(AssetState::Loaded)
    }

    /// `Pending -> Deferred`. Returns `false` for any other state.
    pub fn mark_deferred(&mut self, name: &str) -> bool {
        self.transition(name, &[AssetState::Pending], AssetState::Deferred)
    }

    /// `Pending | Deferred -> Removed`. Returns `false` for any other state.
    pub fn mark_removed(&mut self, name: &str) -> bool {
        self.transition(
            name,
            &[AssetState::Pending, AssetState::Deferred],
            AssetState::Removed,
        )
    }

    /// Atomically moves an asset from `Pending` or `Deferred` to `Loading`.
    ///
    /// # Returns
    /// `true` for exactly one caller per load cycle; `false` when the asset is
    /// unknown, already loading, loaded or removed.
    pub fn begin_load(&mut self, name: &str) -> bool {
        self.transition(
            name,
            &[AssetState::Pending, AssetState::Deferred],
            AssetState::Loading,
        )
    }

    /// Settles an in-flight load: `Loaded` on success, back to `Deferred`
    /// on failure so it can be re-triggered.
    ///
    /// # Returns
    /// `false` when the asset was not `Loading`; the call is then ignored.
    pub fn complete(&mut self, name: &str, success: bool) -> bool {
        let Some(descriptor) = self.assets.get_mut(name) else {
            warn!("Completion reported for unknown asset {name}");
            return false;
        };
        if descriptor.state != AssetState::Loading {
            warn!(
                "Ignoring completion of {name}: expected loading, found {:?}",
                descriptor.state
            );
            return false;
        }
        if success {
            descriptor.state = AssetState::Loaded;
        } else {
            descriptor.state = AssetState::Deferred;
            descriptor.failures += 1;
        }
        true
    }

    fn transition(&mut self, name: &str, from: &[AssetState], to: AssetState) -> bool {
        let Some(descriptor) = self.assets.get_mut(name) else {
            return false;
        };
        if !from.contains(&descriptor.state) {
            debug!("{name}: {:?} -> {to:?} rejected", descriptor.state);
            return false;
        }
        descriptor.state = to;
        true
    }

    /// All descriptors ordered by name.
    pub fn descriptors(&self) -> impl Iterator<Item = &AssetDescriptor> + '_ {
        self.assets.values()
    }

    /// Names of assets in `Loaded`, ordered by name.
    #[must_use]
    pub fn loaded_assets(&self) -> Vec<String> {
        self.descriptors()
            .filter(|descriptor| descriptor.state == AssetState::Loaded)
            .map(|descriptor| descriptor.name.clone())
            .collect()
    }

    #[must_use]
    pub fn count_in(&self, state: AssetState) -> usize {
        self.descriptors()
            .filter(|descriptor| descriptor.state == state)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Registry key for a URL: its last path segment without query or fragment.
///
/// Relative URLs are resolved against a placeholder origin. Falls back to
/// the raw input when no segment can be extracted.
#[must_use]
pub fn asset_name(url: &str) -> String {
    let trimmed = url.trim();
    let resolved = Url::parse(trimmed).or_else(|_| {
        Url::parse("http://localhost/").and_then(|base| base.join(trimmed))
    });
    let segment = resolved.ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_owned))
    });
    match segment {
        Some(name) if !name.is_empty() => name,
        _ => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_come_from_the_last_path_segment() {
        assert_eq!(asset_name("assets/css/icons.min.css"), "icons.min.css");
        assert_eq!(asset_name("/assets/fonts/remixicon.ttf?v=3#iefix"), "remixicon.ttf");
        assert_eq!(asset_name("https://cdn.example.com/lib/app.js"), "app.js");
        assert_eq!(asset_name(""), "");
    }

    #[test]
    fn kinds_follow_extensions() {
        assert_eq!(AssetKind::infer("link", "fonts/remixicon.woff2"), AssetKind::Font);
        assert_eq!(AssetKind::infer("link", "fonts/remixicon.symbol.svg"), AssetKind::Icon);
        assert_eq!(AssetKind::infer("link", "css/icons.min.css"), AssetKind::Style);
        assert_eq!(AssetKind::infer("script", "js/app.js"), AssetKind::Script);
    }

    #[test]
    fn register_is_idempotent() {
        let mut registry = ResourceRegistry::new();
        registry.register("app.js", AssetKind::Script, "js/app.js");
        assert!(registry.mark_deferred("app.js"));
        let again = registry.register("app.js", AssetKind::Style, "other.css");
        assert_eq!(again.state, AssetState::Deferred);
        assert_eq!(again.kind, AssetKind::Script);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn begin_load_succeeds_once_per_cycle() {
        let mut registry = ResourceRegistry::new();
        registry.register("icons.min.css", AssetKind::Style, "css/icons.min.css");
        assert!(registry.mark_deferred("icons.min.css"));
        assert!(registry.begin_load("icons.min.css"));
        assert!(!registry.begin_load("icons.min.css"));
        assert!(registry.complete("icons.min.css", false));
        assert_eq!(registry.state("icons.min.css"), Some(AssetState::Deferred));
        assert!(registry.begin_load("icons.min.css"));
        assert!(registry.complete("icons.min.css", true));
        assert!(!registry.begin_load("icons.min.css"));
        assert_eq!(registry.loaded_assets(), vec!["icons.min.css"]);
        assert_eq!(registry.get("icons.min.css").map(|desc| desc.failures), Some(1));
    }

    #[test]
    fn removal_and_completion_respect_state() {
        let mut registry = ResourceRegistry::new();
        assert!(!registry.begin_load("missing.js"));
        registry.register("a.js", AssetKind::Script, "a.js");
        assert!(!registry.complete("a.js", true));
        assert!(registry.mark_removed("a.js"));
        assert!(!registry.begin_load("a.js"));
        assert!(!registry.mark_deferred("a.js"));
        assert_eq!(registry.count_in(AssetState::Removed), 1);
    }
}
