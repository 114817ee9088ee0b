//! HTML5 parsing into [`Document`] using html5ever.
//!
//! The sink builds directly into the document arena; html5ever handles are
//! reference-counted wrappers holding the arena id and the element name so
//! that `elem_name` can hand out borrowed names without touching the arena.

mod sink;

use crate::dom::Document;
use anyhow::{Error, anyhow};
use html5ever::tendril::TendrilSink as _;
use html5ever::{ParseOpts, parse_document};
use sink::DocumentSink;

/// Parses a complete HTML document.
///
/// Fragments are accepted too; the tree builder wraps them in the implied
/// `<html>`, `<head>` and `<body>` elements.
///
/// # Errors
/// Returns an error if the input cannot be read by the parser.
pub fn parse(html: &str) -> Result<Document, Error> {
    let parser = parse_document(DocumentSink::new(), ParseOpts::default());
    parser
        .from_utf8()
        .read_from(&mut html.as_bytes())
        .map_err(|err| anyhow!("Failed to parse HTML: {err}"))
}
