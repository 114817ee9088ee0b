use alloc::borrow::Cow;
use alloc::rc::Rc;
use core::cell::RefCell;

use html5ever::tendril::StrTendril;
use html5ever::tree_builder::{ElementFlags, NodeOrText, QuirksMode, TreeSink};
use html5ever::{Attribute, ExpandedName, QualName, local_name, namespace_url, ns};
use indextree::{Node, NodeId};
use log::debug;

use crate::dom::{Document, DomNode, NodeKind};

/// Handle given to html5ever for every node it creates.
#[derive(Debug)]
pub(super) struct SinkNode {
    id: NodeId,
    /// Element name; `None` for the document, comments and text.
    name: Option<QualName>,
}

type Handle = Rc<SinkNode>;

/// Tree sink that writes straight into a [`Document`].
pub(super) struct DocumentSink {
    document: RefCell<Document>,
    document_handle: Handle,
    /// Returned by `elem_name` for non-element handles.
    anonymous: QualName,
}

impl DocumentSink {
    pub(super) fn new() -> Self {
        let document = Document::new();
        let document_handle = Rc::new(SinkNode {
            id: document.root(),
            name: None,
        });
        Self {
            document: RefCell::new(document),
            document_handle,
            anonymous: QualName::new(None, ns!(), local_name!("")),
        }
    }

    fn new_handle(&self, data: DomNode, name: Option<QualName>) -> Handle {
        let id = self.document.borrow_mut().arena_mut().new_node(data);
        Rc::new(SinkNode { id, name })
    }

    /// Appends text to `parent`, merging with a trailing text node.
    fn append_text(&self, parent: NodeId, text: &str) {
        let mut document = self.document.borrow_mut();
        let arena = document.arena_mut();
        let last = arena.get(parent).and_then(Node::last_child);
        if let Some(last_id) = last {
            if let Some(NodeKind::Text { text: existing }) =
                arena.get_mut(last_id).map(|node| &mut node.get_mut().kind)
            {
                existing.push_str(text);
                return;
            }
        }
        let node = document.create_text(text);
        if let Err(err) = document.append_child(parent, node) {
            debug!("Dropping text node: {err}");
        }
    }

    fn append_node(&self, parent: NodeId, child: NodeId) {
        if let Err(err) = self.document.borrow_mut().append_child(parent, child) {
            debug!("Dropping node: {err}");
        }
    }
}

impl TreeSink for DocumentSink {
    type Handle = Handle;
    type Output = Document;
    type ElemName<'a> = ExpandedName<'a>;

    fn finish(self) -> Self::Output {
        self.document.into_inner()
    }

    fn parse_error(&self, msg: Cow<'static, str>) {
        debug!("HTML parse error: {msg}");
    }

    fn get_document(&self) -> Self::Handle {
        Rc::clone(&self.document_handle)
    }

    fn elem_name<'a>(&'a self, target: &'a Self::Handle) -> ExpandedName<'a> {
        target.name.as_ref().unwrap_or(&self.anonymous).expanded()
    }

    fn create_element(
        &self,
        name: QualName,
        attrs: Vec<Attribute>,
        _flags: ElementFlags,
    ) -> Self::Handle {
        let mut data = DomNode {
            kind: NodeKind::Element {
                tag: name.local.to_string(),
            },
            ..DomNode::default()
        };
        for attr in attrs {
            data.attrs
                .push((attr.name.local.to_string(), attr.value.to_string()));
        }
        self.new_handle(data, Some(name))
    }

    fn create_comment(&self, text: StrTendril) -> Self::Handle {
        self.new_handle(
            DomNode {
                kind: NodeKind::Comment {
                    text: text.to_string(),
                },
                ..DomNode::default()
            },
            None,
        )
    }

    fn create_pi(&self, _target: StrTendril, data: StrTendril) -> Self::Handle {
        // Processing instructions only occur in foreign content; keep them as comments.
        self.create_comment(data)
    }

    fn append(&self, parent: &Self::Handle, child: NodeOrText<Self::Handle>) {
        match child {
            NodeOrText::AppendNode(node) => self.append_node(parent.id, node.id),
            NodeOrText::AppendText(text) => self.append_text(parent.id, &text),
        }
    }

    fn append_based_on_parent_node(
        &self,
        element: &Self::Handle,
        prev_element: &Self::Handle,
        child: NodeOrText<Self::Handle>,
    ) {
        let has_parent = self.document.borrow().parent(element.id).is_some();
        if has_parent {
            self.append_before_sibling(element, child);
        } else {
            self.append(prev_element, child);
        }
    }

    fn append_doctype_to_document(
        &self,
        name: StrTendril,
        _public_id: StrTendril,
        _system_id: StrTendril,
    ) {
        let doctype = self.new_handle(
            DomNode {
                kind: NodeKind::Doctype {
                    name: name.to_string(),
                },
                ..DomNode::default()
            },
            None,
        );
        self.append_node(self.document_handle.id, doctype.id);
    }

    fn get_template_contents(&self, target: &Self::Handle) -> Self::Handle {
        // Template contents live directly under the template element so they serialize in place.
        Rc::clone(target)
    }

    fn same_node(&self, x: &Self::Handle, y: &Self::Handle) -> bool {
        x.id == y.id
    }

    fn set_quirks_mode(&self, _mode: QuirksMode) {}

    fn append_before_sibling(&self, sibling: &Self::Handle, new_node: NodeOrText<Self::Handle>) {
        let mut document = self.document.borrow_mut();
        let node = match new_node {
            NodeOrText::AppendNode(node) => node.id,
            NodeOrText::AppendText(text) => {
                let previous = document
                    .arena()
                    .get(sibling.id)
                    .and_then(Node::previous_sibling);
                if let Some(prev_id) = previous {
                    if let Some(NodeKind::Text { text: existing }) = document
                        .arena_mut()
                        .get_mut(prev_id)
                        .map(|node| &mut node.get_mut().kind)
                    {
                        existing.push_str(&text);
                        return;
                    }
                }
                document.create_text(&text)
            }
        };
        if let Err(err) = document.insert_before(sibling.id, node) {
            debug!("Dropping node inserted before sibling: {err}");
        }
    }

    fn add_attrs_if_missing(&self, target: &Self::Handle, attrs: Vec<Attribute>) {
        let mut document = self.document.borrow_mut();
        for attr in attrs {
            let name = attr.name.local.to_string();
            if !document.has_attr(target.id, &name) {
                if let Err(err) = document.set_attr(target.id, &name, &attr.value) {
                    debug!("Ignoring attribute {name}: {err}");
                }
            }
        }
    }

    fn remove_from_parent(&self, target: &Self::Handle) {
        self.document.borrow_mut().remove_node(target.id);
    }

    fn reparent_children(&self, node: &Self::Handle, new_parent: &Self::Handle) {
        let mut document = self.document.borrow_mut();
        let children: Vec<NodeId> = document.children(node.id).collect();
        for child in children {
            if let Err(err) = document.append_child(new_parent.id, child) {
                debug!("Failed to reparent child: {err}");
            }
        }
    }
}
