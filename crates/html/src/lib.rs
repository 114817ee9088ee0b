//! Owned HTML document model for the asset pipeline.
//!
//! Pages are parsed with html5ever into an indextree arena. The arena keeps
//! node ids stable across detach/reattach, which lets other subsystems hold
//! on to element handles while the document is mutated underneath them.
#![allow(
    clippy::missing_inline_in_public_items,
    reason = "Inlining decisions left to compiler for this crate"
)]

extern crate alloc;

pub mod dom;
pub mod parser;

pub use dom::selector::Selector;
pub use dom::{Document, DomNode, NodeKind};
pub use indextree::NodeId;
pub use parser::parse;
