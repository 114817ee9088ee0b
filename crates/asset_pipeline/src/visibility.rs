//! Visibility scheduler: watches elements and fires each target once, the
//! first time its element enters the (margin-extended) viewport.
//!
//! Targets are unregistered before they are handed back to the caller, so
//! a duplicate or stale intersection entry can never fire the same target
//! twice.

use std::collections::{BTreeMap, HashSet};

use html::{Document, NodeId};
use log::debug;

use crate::geometry::{RootMargin, Viewport, intersection_ratio};
use crate::layout::LayoutProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

/// A registered `(element, action)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget<A> {
    pub id: WatchId,
    pub element: NodeId,
    pub action: A,
}

/// One observation of an element against the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntersectionEntry {
    pub element: NodeId,
    pub intersection_ratio: f32,
    pub is_intersecting: bool,
}

impl IntersectionEntry {
    #[inline]
    #[must_use]
    pub const fn visible(element: NodeId, intersection_ratio: f32) -> Self {
        Self {
            element,
            intersection_ratio,
            is_intersecting: true,
        }
    }
}

pub struct VisibilityScheduler<A> {
    threshold: f32,
    root_margin: RootMargin,
    /// Ordered by registration so firing order is deterministic.
    targets: BTreeMap<WatchId, WatchTarget<A>>,
    next_id: u64,
    fired: u64,
}

impl<A> VisibilityScheduler<A> {
    #[must_use]
    pub fn new(threshold: f32, root_margin: RootMargin) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            root_margin,
            targets: BTreeMap::new(),
            next_id: 0,
            fired: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn root_margin(&self) -> RootMargin {
        self.root_margin
    }

    /// Registers `action` to fire when `element` becomes visible.
    pub fn watch(&mut self, element: NodeId, action: A) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.targets.insert(
            id,
            WatchTarget {
                id,
                element,
                action,
            },
        );
        id
    }

    /// Drops a single registration. Returns `false` if it already fired.
    pub fn unwatch(&mut self, id: WatchId) -> bool {
        self.targets.remove(&id).is_some()
    }

    #[must_use]
    pub fn is_watching(&self, element: NodeId) -> bool {
        self.targets.values().any(|target| target.element == element)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Total targets fired since creation.
    #[inline]
    #[must_use]
    pub const fn fired_count(&self) -> u64 {
        self.fired
    }

    fn qualifies(&self, entry: &IntersectionEntry) -> bool {
        entry.is_intersecting && entry.intersection_ratio >= self.threshold
    }

    /// Processes a batch of intersection entries.
    ///
    /// # Returns
    /// The targets that fired, already unregistered, in entry order and then
    /// registration order.
    pub fn deliver(&mut self, entries: &[IntersectionEntry]) -> Vec<WatchTarget<A>> {
        let mut fired = Vec::new();
        for entry in entries {
            if !self.qualifies(entry) {
                continue;
            }
            let ids: Vec<WatchId> = self
                .targets
                .values()
                .filter(|target| target.element == entry.element)
                .map(|target| target.id)
                .collect();
            if ids.is_empty() {
                debug!("Ignoring entry for unwatched element {:?}", entry.element);
            }
            for id in ids {
                if let Some(target) = self.targets.remove(&id) {
                    fired.push(target);
                }
            }
        }
        self.fired += fired.len() as u64;
        fired
    }

    /// Delivers `entries` and invokes `callback` once per fired target.
    pub fn dispatch<F>(&mut self, entries: &[IntersectionEntry], mut callback: F) -> usize
    where
        F: FnMut(&WatchTarget<A>),
    {
        let fired = self.deliver(entries);
        for target in &fired {
            callback(target);
        }
        fired.len()
    }

    /// Computes entries for every watched element from `layout` and delivers
    /// them. Detached elements and elements without a box are skipped.
    pub fn observe(
        &mut self,
        document: &Document,
        layout: &dyn LayoutProvider,
        viewport: &Viewport,
    ) -> Vec<WatchTarget<A>> {
        let root = viewport.root_rect(&self.root_margin);
        let mut seen = HashSet::new();
        let entries: Vec<IntersectionEntry> = self
            .targets
            .values()
            .map(|target| target.element)
            .filter(|element| seen.insert(*element))
            .filter(|element| document.is_attached(*element))
            .filter_map(|element| {
                let rect = layout.bounding_box(document, element)?;
                let ratio = intersection_ratio(&rect, &root);
                Some(IntersectionEntry {
                    element,
                    intersection_ratio: ratio,
                    is_intersecting: rect.intersection(&root).is_some(),
                })
            })
            .collect();
        self.deliver(&entries)
    }

    /// Unregisters every target whose element satisfies `should_release`.
    ///
    /// # Returns
    /// The number of targets dropped.
    pub fn release<F>(&mut self, mut should_release: F) -> usize
    where
        F: FnMut(NodeId) -> bool,
    {
        let before = self.targets.len();
        self.targets.retain(|_, target| !should_release(target.element));
        before - self.targets.len()
    }
}
