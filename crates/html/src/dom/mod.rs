//! Arena-backed DOM with the mutation surface the asset pipeline needs.

mod printing;
pub mod selector;

use anyhow::{Error, anyhow};
use indextree::{Arena, Node, NodeId};
use smallvec::SmallVec;

use self::selector::Selector;
use crate::parser::parse;

/// Attribute storage; most elements carry only a handful of attributes.
pub type Attributes = SmallVec<(String, String), 4>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeKind {
    #[default]
    Document,
    Doctype {
        name: String,
    },
    Element {
        tag: String,
    },
    Text {
        text: String,
    },
    Comment {
        text: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DomNode {
    pub kind: NodeKind,
    pub attrs: Attributes,
}

impl DomNode {
    fn element(tag: &str) -> Self {
        Self {
            kind: NodeKind::Element {
                tag: tag.to_ascii_lowercase(),
            },
            attrs: Attributes::new(),
        }
    }
}

/// An owned HTML document.
///
/// Removing a node only detaches it: its id stays valid, so callers can
/// still read the attributes of an element they pruned, or reattach it.
pub struct Document {
    arena: Arena<DomNode>,
    root: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates an empty document containing only the document node.
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let root = arena.new_node(DomNode::default());
        Self { arena, root }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub(crate) const fn arena(&self) -> &Arena<DomNode> {
        &self.arena
    }

    #[inline]
    pub(crate) const fn arena_mut(&mut self) -> &mut Arena<DomNode> {
        &mut self.arena
    }

    #[must_use]
    pub fn node(&self, node: NodeId) -> Option<&DomNode> {
        self.arena.get(node).map(Node::get)
    }

    fn node_mut(&mut self, node: NodeId) -> Option<&mut DomNode> {
        self.arena.get_mut(node).map(Node::get_mut)
    }

    fn element_mut(&mut self, node: NodeId) -> Result<&mut DomNode, Error> {
        match self.node_mut(node) {
            Some(dom_node) if matches!(dom_node.kind, NodeKind::Element { .. }) => Ok(dom_node),
            Some(_) => Err(anyhow!("Node {node:?} is not an element")),
            None => Err(anyhow!("Unknown node {node:?}")),
        }
    }

    /// Lowercase tag name of an element node.
    #[must_use]
    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.node(node)?.kind {
            NodeKind::Element { tag } => Some(tag.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_element(&self, node: NodeId) -> bool {
        self.tag(node).is_some()
    }

    #[must_use]
    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.node(node)?
            .attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn has_attr(&self, node: NodeId, name: &str) -> bool {
        self.attr(node, name).is_some()
    }

    /// Sets (or overwrites) an attribute on an element.
    ///
    /// # Errors
    /// Returns an error if `node` is unknown or not an element.
    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), Error> {
        let element = self.element_mut(node)?;
        if let Some(slot) = element
            .attrs
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            value.clone_into(&mut slot.1);
        } else {
            element
                .attrs
                .push((name.to_ascii_lowercase(), value.to_owned()));
        }
        Ok(())
    }

    /// Removes an attribute, returning its previous value.
    pub fn remove_attr(&mut self, node: NodeId, name: &str) -> Option<String> {
        let dom_node = self.node_mut(node)?;
        let index = dom_node
            .attrs
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(dom_node.attrs.remove(index).1)
    }

    /// Whitespace-separated tokens of the `class` attribute.
    pub fn classes(&self, node: NodeId) -> impl Iterator<Item = &str> + '_ {
        self.attr(node, "class")
            .unwrap_or_default()
            .split_ascii_whitespace()
    }

    #[must_use]
    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.classes(node).any(|token| token == class)
    }

    /// Adds a class token. Returns `false` when the token was already present.
    ///
    /// # Errors
    /// Returns an error if `node` is unknown or not an element.
    pub fn add_class(&mut self, node: NodeId, class: &str) -> Result<bool, Error> {
        if self.has_class(node, class) {
            return Ok(false);
        }
        let mut value = self.attr(node, "class").unwrap_or_default().trim().to_owned();
        if !value.is_empty() {
            value.push(' ');
        }
        value.push_str(class);
        self.set_attr(node, "class", &value)?;
        Ok(true)
    }

    /// Removes a class token. Returns `false` when the token was absent.
    pub fn remove_class(&mut self, node: NodeId, class: &str) -> bool {
        if !self.has_class(node, class) {
            return false;
        }
        let remaining: Vec<&str> = self.classes(node).filter(|token| *token != class).collect();
        let joined = remaining.join(" ");
        self.set_attr(node, "class", &joined).is_ok()
    }

    /// Creates a detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.arena.new_node(DomNode::element(tag))
    }

    /// Creates a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.arena.new_node(DomNode {
            kind: NodeKind::Text {
                text: text.to_owned(),
            },
            attrs: Attributes::new(),
        })
    }

    /// Creates a detached comment node.
    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.arena.new_node(DomNode {
            kind: NodeKind::Comment {
                text: text.to_owned(),
            },
            attrs: Attributes::new(),
        })
    }

    /// Appends `child` as the last child of `parent`, detaching it first.
    ///
    /// # Errors
    /// Returns an error if the append would create a cycle or a node is removed.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), Error> {
        child.detach(&mut self.arena);
        parent
            .checked_append(child, &mut self.arena)
            .map_err(|err| anyhow!("Failed to append {child:?} to {parent:?}: {err:?}"))
    }

    /// Inserts `new_node` immediately before `sibling`.
    ///
    /// # Errors
    /// Returns an error if the insertion is structurally invalid.
    pub fn insert_before(&mut self, sibling: NodeId, new_node: NodeId) -> Result<(), Error> {
        new_node.detach(&mut self.arena);
        sibling
            .checked_insert_before(new_node, &mut self.arena)
            .map_err(|err| anyhow!("Failed to insert {new_node:?} before {sibling:?}: {err:?}"))
    }

    /// Puts `replacement` where `old` was and detaches `old`.
    ///
    /// # Errors
    /// Returns an error if `old` has no parent.
    pub fn replace_node(&mut self, old: NodeId, replacement: NodeId) -> Result<(), Error> {
        if self.parent(old).is_none() {
            return Err(anyhow!("Cannot replace detached node {old:?}"));
        }
        self.insert_before(old, replacement)?;
        old.detach(&mut self.arena);
        Ok(())
    }

    /// Detaches a node from its parent. Returns `false` if it had no parent.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        if self.parent(node).is_none() {
            return false;
        }
        node.detach(&mut self.arena);
        true
    }

    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.arena.get(node).and_then(Node::parent)
    }

    pub fn children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        node.children(&self.arena)
    }

    /// Whether the node is reachable from the document root.
    #[must_use]
    pub fn is_attached(&self, node: NodeId) -> bool {
        if self.arena.get(node).is_none_or(Node::is_removed) {
            return false;
        }
        node.ancestors(&self.arena).any(|ancestor| ancestor == self.root)
    }

    /// Attached elements in document order.
    #[must_use]
    pub fn elements(&self) -> Vec<NodeId> {
        self.root
            .descendants(&self.arena)
            .filter(|node| self.is_element(*node))
            .collect()
    }

    /// Attached elements matching `selector`, in document order.
    #[must_use]
    pub fn select(&self, selector: &Selector) -> Vec<NodeId> {
        self.root
            .descendants(&self.arena)
            .filter(|node| selector.matches(self, *node))
            .collect()
    }

    /// Parses `selectors` and returns the matching attached elements.
    ///
    /// # Errors
    /// Returns an error if the selector list cannot be parsed.
    pub fn query(&self, selectors: &str) -> Result<Vec<NodeId>, Error> {
        Ok(self.select(&Selector::parse(selectors)?))
    }

    fn first_with_tag(&self, tag: &str) -> Option<NodeId> {
        self.root
            .descendants(&self.arena)
            .find(|node| self.tag(*node) == Some(tag))
    }

    /// The `<html>` element.
    #[must_use]
    pub fn document_element(&self) -> Option<NodeId> {
        self.children(self.root).find(|node| self.is_element(*node))
    }

    #[must_use]
    pub fn head(&self) -> Option<NodeId> {
        self.first_with_tag("head")
    }

    #[must_use]
    pub fn body(&self) -> Option<NodeId> {
        self.first_with_tag("body")
    }

    #[must_use]
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.root
            .descendants(&self.arena)
            .find(|node| self.is_element(*node) && self.attr(*node, "id") == Some(id))
    }

    /// Concatenated text of all descendant text nodes.
    #[must_use]
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        for descendant in node.descendants(&self.arena) {
            if let Some(DomNode {
                kind: NodeKind::Text { text },
                ..
            }) = self.node(descendant)
            {
                out.push_str(text);
            }
        }
        out
    }

    /// Replaces all children of `node` with a single text node.
    ///
    /// # Errors
    /// Returns an error if the text node cannot be appended.
    pub fn set_text_content(&mut self, node: NodeId, text: &str) -> Result<(), Error> {
        let existing: Vec<NodeId> = node.children(&self.arena).collect();
        for child in existing {
            child.detach(&mut self.arena);
        }
        let text_node = self.create_text(text);
        self.append_child(node, text_node)
    }

    /// Reads one declaration from the inline `style` attribute.
    #[must_use]
    pub fn style_property(&self, node: NodeId, property: &str) -> Option<String> {
        parse_declarations(self.attr(node, "style")?)
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(property))
            .map(|(_, value)| value)
    }

    /// Sets one declaration in the inline `style` attribute, keeping the others.
    ///
    /// # Errors
    /// Returns an error if `node` is not an element.
    pub fn set_style_property(
        &mut self,
        node: NodeId,
        property: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut declarations = parse_declarations(self.attr(node, "style").unwrap_or_default());
        if let Some(slot) = declarations
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(property))
        {
            value.clone_into(&mut slot.1);
        } else {
            declarations.push((property.to_owned(), value.to_owned()));
        }
        let style = declarations
            .iter()
            .map(|(name, val)| format!("{name}: {val}"))
            .collect::<Vec<_>>()
            .join("; ");
        self.set_attr(node, "style", &style)
    }

    /// Parses `html` as a fragment and appends its nodes under `parent`.
    ///
    /// Metadata content the tree builder hoists into `<head>` (links,
    /// scripts, styles) comes first, followed by the body content.
    ///
    /// # Errors
    /// Returns an error if parsing fails or the nodes cannot be appended.
    pub fn append_fragment(&mut self, parent: NodeId, html: &str) -> Result<Vec<NodeId>, Error> {
        let fragment = parse(html)?;
        let sources: Vec<NodeId> = fragment
            .head()
            .into_iter()
            .chain(fragment.body())
            .flat_map(|section| fragment.children(section).collect::<Vec<_>>())
            .collect();
        let mut imported = Vec::with_capacity(sources.len());
        for source in sources {
            let copy = self.import_subtree(&fragment, source)?;
            self.append_child(parent, copy)?;
            imported.push(copy);
        }
        Ok(imported)
    }

    /// Deep-copies a subtree of another document into this arena, detached.
    fn import_subtree(&mut self, other: &Self, source: NodeId) -> Result<NodeId, Error> {
        let data = other
            .node(source)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown source node {source:?}"))?;
        let copy = self.arena.new_node(data);
        let children: Vec<NodeId> = other.children(source).collect();
        for child in children {
            let child_copy = self.import_subtree(other, child)?;
            self.append_child(copy, child_copy)?;
        }
        Ok(copy)
    }
}

/// Splits an inline style attribute into `(property, value)` pairs.
fn parse_declarations(style: &str) -> Vec<(String, String)> {
    split_top_level(style, ';')
        .into_iter()
        .filter_map(|declaration| {
            let (name, value) = declaration.split_once(':')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// Splits `input` on `separator` where it appears outside parentheses and
/// quoted strings, so `url(data:image/png;base64,...)` stays whole.
fn split_top_level(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (index, current) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match quote {
            _ if current == '\\' => escaped = true,
            Some(open) => {
                if current == open {
                    quote = None;
                }
            }
            None => match current {
                '"' | '\'' => quote = Some(current),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if current == separator && depth == 0 => {
                    parts.push(&input[start..index]);
                    start = index + current.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&input[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn class_tokens_are_set_like() -> Result<(), Error> {
        let mut doc = parse("<div id=a class='card  wide'></div>")?;
        let div = doc.element_by_id("a").ok_or_else(|| anyhow!("missing div"))?;
        assert!(!doc.add_class(div, "card")?);
        assert!(doc.add_class(div, "loaded")?);
        assert_eq!(doc.attr(div, "class"), Some("card  wide loaded"));
        assert!(doc.remove_class(div, "wide"));
        assert_eq!(doc.attr(div, "class"), Some("card loaded"));
        Ok(())
    }

    #[test]
    fn removed_nodes_keep_their_attributes() -> Result<(), Error> {
        let mut doc = parse("<head><link id=l href='a.css'></head><body></body>")?;
        let link = doc.element_by_id("l").ok_or_else(|| anyhow!("missing link"))?;
        assert!(doc.remove_node(link));
        assert!(!doc.is_attached(link));
        assert!(!doc.remove_node(link));
        assert_eq!(doc.attr(link, "href"), Some("a.css"));
        assert!(doc.element_by_id("l").is_none());
        Ok(())
    }

    #[test]
    fn style_properties_merge() -> Result<(), Error> {
        let mut doc = parse("<div id=d style='color: red'></div>")?;
        let div = doc.element_by_id("d").ok_or_else(|| anyhow!("missing div"))?;
        doc.set_style_property(div, "background-image", "url(bg.png)")?;
        doc.set_style_property(div, "color", "blue")?;
        assert_eq!(
            doc.attr(div, "style"),
            Some("color: blue; background-image: url(bg.png)")
        );
        assert_eq!(doc.style_property(div, "COLOR").as_deref(), Some("blue"));
        Ok(())
    }

    #[test]
    fn data_urls_survive_later_style_writes() -> Result<(), Error> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut doc = parse("<div id=d></div>")?;
        let div = doc.element_by_id("d").ok_or_else(|| anyhow!("missing div"))?;
        let image = r#"url("data:image/png;base64,iVBORw0KGgo=")"#;
        doc.set_style_property(div, "background-image", image)?;
        doc.set_style_property(div, "transform", "translateZ(0)")?;
        assert_eq!(doc.style_property(div, "background-image").as_deref(), Some(image));
        assert_eq!(doc.style_property(div, "transform").as_deref(), Some("translateZ(0)"));
        assert_eq!(
            split_top_level("a: url(x;y); b: 'c;d'; e: f", ';'),
            vec!["a: url(x;y)", " b: 'c;d'", " e: f"]
        );
        Ok(())
    }

    #[test]
    fn replace_swaps_position() -> Result<(), Error> {
        let mut doc = parse("<body><p id=a></p><script id=s data-src='x.js'></script><p id=b></p></body>")?;
        let placeholder = doc.element_by_id("s").ok_or_else(|| anyhow!("missing script"))?;
        let script = doc.create_element("script");
        doc.set_attr(script, "src", "x.js")?;
        doc.replace_node(placeholder, script)?;
        let body = doc.body().ok_or_else(|| anyhow!("missing body"))?;
        let tags: Vec<_> = doc
            .children(body)
            .filter_map(|child| doc.attr(child, "id").or_else(|| doc.attr(child, "src")))
            .collect();
        assert_eq!(tags, vec!["a", "x.js", "b"]);
        Ok(())
    }

    #[test]
    fn fragments_are_imported_under_parent() -> Result<(), Error> {
        let mut doc = parse("<body><div id=dynamic-content></div></body>")?;
        let container = doc
            .element_by_id("dynamic-content")
            .ok_or_else(|| anyhow!("missing container"))?;
        let nodes = doc.append_fragment(container, "<b>hi</b> there")?;
        assert_eq!(nodes.len(), 2);
        assert_eq!(doc.text_content(container), "hi there");
        Ok(())
    }
}
