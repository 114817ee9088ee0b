//! Element geometry for visibility evaluation.
//!
//! The pipeline never computes real layout; it asks a [`LayoutProvider`]
//! for border boxes. [`FlowLayout`] is a block-flow estimator good enough
//! to decide which parts of a static page sit above or below the fold.

use std::collections::HashMap;

use html::{Document, NodeId, NodeKind};

use crate::geometry::Rect;

/// Source of element bounding boxes in document coordinates.
pub trait LayoutProvider {
    /// Border box of `node`, or `None` when the element is not rendered.
    fn bounding_box(&self, document: &Document, node: NodeId) -> Option<Rect>;
}

/// Elements that never produce a box.
const NON_RENDERED: &[&str] = &[
    "head", "script", "style", "link", "meta", "title", "template", "noscript", "base",
];

/// Replaced elements sized from their attributes.
const REPLACED: &[&str] = &["img", "iframe", "video", "canvas", "svg", "embed", "object"];

/// Inline elements that get a glyph-sized box when empty (icon fonts).
const ICON_HOSTS: &[&str] = &["i", "span", "em"];

const LINE_HEIGHT: f32 = 20.0;
const CHAR_WIDTH: f32 = 8.0;
const ICON_SIZE: f32 = 16.0;
const REPLACED_DEFAULT_WIDTH: f32 = 300.0;
const REPLACED_DEFAULT_HEIGHT: f32 = 150.0;

/// Block-flow estimate: every rendered element stacks vertically under its
/// parent, text wraps at a fixed character width, and replaced elements use
/// their `width`/`height` attributes.
#[derive(Debug, Default)]
pub struct FlowLayout {
    boxes: HashMap<NodeId, Rect>,
    content_height: f32,
}

impl FlowLayout {
    /// Lays out the attached tree of `document` for a viewport `width` wide.
    #[must_use]
    pub fn compute(document: &Document, width: f32) -> Self {
        let mut layout = Self::default();
        let root = document.root();
        let mut cursor = 0.0;
        for child in document.children(root) {
            cursor += layout.place(document, child, 0.0, cursor, width);
        }
        layout.content_height = cursor;
        layout
    }

    /// Total height of the laid-out document.
    #[inline]
    #[must_use]
    pub const fn content_height(&self) -> f32 {
        self.content_height
    }

    /// Number of elements that received a box.
    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Places `node` at `(x, y)` and returns the height it occupies.
    fn place(&mut self, document: &Document, node: NodeId, x: f32, y: f32, width: f32) -> f32 {
        let Some(dom_node) = document.node(node) else {
            return 0.0;
        };
        let tag = match &dom_node.kind {
            NodeKind::Text { text } => return text_height(text, width),
            NodeKind::Element { tag } => tag.as_str(),
            NodeKind::Document | NodeKind::Doctype { .. } | NodeKind::Comment { .. } => {
                return 0.0;
            }
        };
        if NON_RENDERED.contains(&tag) || is_hidden(document, node) {
            return 0.0;
        }
        if REPLACED.contains(&tag) {
            let box_width = dimension(document, node, "width").unwrap_or(REPLACED_DEFAULT_WIDTH);
            let box_height =
                dimension(document, node, "height").unwrap_or(REPLACED_DEFAULT_HEIGHT);
            self.boxes
                .insert(node, Rect::new(x, y, box_width.min(width), box_height));
            return box_height;
        }
        let icon_host = ICON_HOSTS.contains(&tag);
        let mut cursor = y;
        let children: Vec<NodeId> = document.children(node).collect();
        for child in children {
            cursor += self.place(document, child, x, cursor, width);
        }
        let mut height = cursor - y;
        if height <= 0.0 && icon_host {
            height = ICON_SIZE;
        }
        if let Some(explicit) = dimension(document, node, "height") {
            height = height.max(explicit);
        }
        self.boxes.insert(node, Rect::new(x, y, width, height));
        height
    }
}

impl LayoutProvider for FlowLayout {
    fn bounding_box(&self, document: &Document, node: NodeId) -> Option<Rect> {
        if !document.is_attached(node) {
            return None;
        }
        self.boxes.get(&node).copied()
    }
}

fn text_height(text: &str, width: f32) -> f32 {
    let chars = text.split_whitespace().map(|word| word.chars().count() + 1).sum::<usize>();
    if chars == 0 {
        return 0.0;
    }
    let per_line = (width / CHAR_WIDTH).max(1.0);
    (chars as f32 / per_line).ceil() * LINE_HEIGHT
}

fn is_hidden(document: &Document, node: NodeId) -> bool {
    document.has_attr(node, "hidden")
        || document
            .style_property(node, "display")
            .is_some_and(|display| display.eq_ignore_ascii_case("none"))
}

/// Pixel size from a `style` declaration or a presentational attribute.
fn dimension(document: &Document, node: NodeId, property: &str) -> Option<f32> {
    document
        .style_property(node, property)
        .and_then(|value| parse_pixels(&value))
        .or_else(|| document.attr(node, property).and_then(parse_pixels))
}

fn parse_pixels(value: &str) -> Option<f32> {
    let trimmed = value.trim();
    let number = trimmed.strip_suffix("px").unwrap_or(trimmed);
    number
        .parse::<f32>()
        .ok()
        .filter(|parsed| parsed.is_finite() && *parsed >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Error, anyhow};

    #[test]
    fn blocks_stack_and_replaced_elements_use_attributes() -> Result<(), Error> {
        let doc = html::parse(
            r#"<head><script src=a.js></script></head><body>
                <div id=hero style="height: 900px"></div>
                <img id=photo data-src=p.jpg width=200 height=120>
                <i id=icon class=ri-home-line></i>
                <div id=gone style="display: none; height: 50px"></div>
            </body>"#,
        )?;
        let layout = FlowLayout::compute(&doc, 1000.0);
        let hero = doc.element_by_id("hero").ok_or_else(|| anyhow!("missing hero"))?;
        let photo = doc.element_by_id("photo").ok_or_else(|| anyhow!("missing img"))?;
        let icon = doc.element_by_id("icon").ok_or_else(|| anyhow!("missing icon"))?;
        let gone = doc.element_by_id("gone").ok_or_else(|| anyhow!("missing div"))?;
        assert_eq!(layout.bounding_box(&doc, hero), Some(Rect::new(0.0, 0.0, 1000.0, 900.0)));
        assert_eq!(layout.bounding_box(&doc, photo), Some(Rect::new(0.0, 900.0, 200.0, 120.0)));
        assert_eq!(layout.bounding_box(&doc, icon), Some(Rect::new(0.0, 1020.0, 1000.0, 16.0)));
        assert_eq!(layout.bounding_box(&doc, gone), None);
        assert!((layout.content_height() - 1036.0).abs() < f32::EPSILON);
        Ok(())
    }
}
