use core::fmt;

use super::{Document, DomNode, NodeKind};
use indextree::NodeId;

use serde_json::{Map, Value, json};

/// Elements that never have an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Elements whose text children are emitted verbatim.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

fn escape_text(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(ch),
        }
    }
}

fn serialize_node(doc: &Document, id: NodeId, raw_text: bool, out: &mut String) {
    let Some(DomNode { kind, attrs }) = doc.node(id) else {
        return;
    };
    match kind {
        NodeKind::Document => {
            for child in doc.children(id) {
                serialize_node(doc, child, false, out);
            }
        }
        NodeKind::Doctype { name } => {
            out.push_str("<!DOCTYPE ");
            out.push_str(name);
            out.push('>');
        }
        NodeKind::Element { tag } => {
            out.push('<');
            out.push_str(tag);
            for (name, value) in attrs {
                out.push(' ');
                out.push_str(name);
                if !value.is_empty() {
                    out.push_str("=\"");
                    escape_attr(value, out);
                    out.push('"');
                }
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&tag.as_str()) {
                return;
            }
            let raw = RAW_TEXT_ELEMENTS.contains(&tag.as_str());
            for child in doc.children(id) {
                serialize_node(doc, child, raw, out);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        NodeKind::Text { text } => {
            if raw_text {
                out.push_str(text);
            } else {
                escape_text(text, out);
            }
        }
        NodeKind::Comment { text } => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
    }
}

fn node_to_json(doc: &Document, id: NodeId) -> Value {
    let Some(DomNode { kind, attrs }) = doc.node(id) else {
        return Value::Null;
    };
    let children: Vec<Value> = doc
        .children(id)
        .map(|child| node_to_json(doc, child))
        .filter(|value| !value.is_null())
        .collect();
    match kind {
        NodeKind::Document => json!({ "type": "document", "children": children }),
        NodeKind::Element { tag } => {
            // Sort attributes for deterministic snapshots
            let mut pairs: Vec<&(String, String)> = attrs.iter().collect();
            pairs.sort_by(|left, right| left.0.cmp(&right.0));
            let mut attrs_obj = Map::new();
            for (key, value) in pairs {
                attrs_obj.insert(key.clone(), Value::String(value.clone()));
            }
            json!({
                "type": "element",
                "tag": tag,
                "attrs": Value::Object(attrs_obj),
                "children": children,
            })
        }
        NodeKind::Text { text } if !text.trim().is_empty() => {
            json!({ "type": "text", "text": text })
        }
        NodeKind::Doctype { .. } | NodeKind::Text { .. } | NodeKind::Comment { .. } => Value::Null,
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_indent(formatter: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
            for _ in 0..depth {
                formatter.write_str("  ")?;
            }
            Ok(())
        }

        fn fmt_node(
            doc: &Document,
            id: NodeId,
            formatter: &mut fmt::Formatter<'_>,
            depth: usize,
        ) -> fmt::Result {
            let Some(DomNode { kind, attrs }) = doc.node(id) else {
                return Ok(());
            };
            match kind {
                NodeKind::Document => {
                    writeln!(formatter, "#document")?;
                }
                NodeKind::Doctype { name } => {
                    write_indent(formatter, depth)?;
                    writeln!(formatter, "<!DOCTYPE {name}>")?;
                }
                NodeKind::Element { tag } => {
                    write_indent(formatter, depth)?;
                    write!(formatter, "<{tag}")?;
                    for (key, value) in attrs {
                        write!(formatter, " {key}={value:?}")?;
                    }
                    writeln!(formatter, ">")?;
                }
                NodeKind::Text { text } => {
                    // Skip pure-whitespace text nodes for cleaner output
                    if text.chars().all(char::is_whitespace) {
                        return Ok(());
                    }
                    write_indent(formatter, depth)?;
                    writeln!(formatter, "{text:?}")?;
                }
                NodeKind::Comment { text } => {
                    write_indent(formatter, depth)?;
                    writeln!(formatter, "<!--{text}-->")?;
                }
            }
            for child in doc.children(id) {
                fmt_node(doc, child, formatter, depth + 1)?;
            }
            Ok(())
        }

        fmt_node(self, self.root, formatter, 0)
    }
}

impl Document {
    /// Serializes the attached tree back to HTML.
    #[must_use]
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        serialize_node(self, self.root, false, &mut out);
        out
    }

    /// Serializes one element (including itself) to HTML.
    #[must_use]
    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        serialize_node(self, node, false, &mut out);
        out
    }

    /// Deterministic JSON snapshot of the document.
    /// Schema:
    /// - Document: { "type":"document", "children":[ ... ] }
    /// - Element: { "type":"element", "tag": "div", "attrs": {..}, "children":[ ... ] }
    /// - Text: { "type":"text", "text":"..." }
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        node_to_json(self, self.root)
    }
}
