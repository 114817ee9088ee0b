//! Appearance restorer: keeps the page presentable while pruned stylesheets
//! are still deferred.

use html::{Document, NodeId};
use log::{debug, info};
use serde::Serialize;

/// Marker attribute identifying the injected fallback `<style>` element.
pub const FALLBACK_MARKER: &str = "data-fallback-styles";

/// Base rules for the classes whose real CSS may have been pruned.
pub const FALLBACK_CSS: &str = "\
.ri-icon,.icon{display:inline-block;width:1em;height:1em;vertical-align:middle}\
.btn{display:inline-block;padding:.375rem .75rem;font-size:1rem;font-weight:400;line-height:1.5;\
text-align:center;text-decoration:none;vertical-align:middle;cursor:pointer;\
border:1px solid transparent;border-radius:.375rem}\
.btn-primary{color:#fff;background-color:#0d6efd;border-color:#0d6efd}\
.btn-primary:hover{color:#fff;background-color:#0b5ed7;border-color:#0a58ca}\
.form-control{display:block;width:100%;padding:.375rem .75rem;font-size:1rem;line-height:1.5;\
color:#212529;background-color:#fff;background-clip:padding-box;border:1px solid #ced4da;\
border-radius:.375rem}\
.form-control:focus{border-color:#86b7fe;outline:0;box-shadow:0 0 0 .25rem rgba(13,110,253,.25)}\
.card{position:relative;display:flex;flex-direction:column;min-width:0;word-wrap:break-word;\
background-color:#fff;background-clip:border-box;border:1px solid rgba(0,0,0,.125);\
border-radius:.375rem}\
.card-body{flex:1 1 auto;padding:1rem}\
.table{width:100%;margin-bottom:1rem;color:#212529;border-collapse:collapse}\
.table th,.table td{padding:.75rem;vertical-align:top;border-top:1px solid #dee2e6}\
.table thead th{vertical-align:bottom;border-bottom:2px solid #dee2e6}";

/// What one restore pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub injected_styles: bool,
    pub forms: usize,
    pub navs: usize,
}

/// Injects the fallback stylesheet and the structural classes the pruned
/// CSS relied on. Does not consult the registry, so it can run before or
/// after pruning; running it again changes nothing.
pub fn restore(document: &mut Document) -> RestoreReport {
    let report = RestoreReport {
        injected_styles: inject_fallback_styles(document),
        forms: add_class_to(document, "form", "needs-validation"),
        navs: add_class_to(document, ".navbar, .nav", "navbar-expand-lg"),
    };
    info!("Appearance restored: {report:?}");
    report
}

fn style_target(document: &Document) -> Option<NodeId> {
    document
        .head()
        .or_else(|| document.body())
        .or_else(|| document.document_element())
}

fn inject_fallback_styles(document: &mut Document) -> bool {
    let selector = format!("style[{FALLBACK_MARKER}]");
    if !document.query(&selector).unwrap_or_default().is_empty() {
        return false;
    }
    let Some(target) = style_target(document) else {
        debug!("No element to hold fallback styles");
        return false;
    };
    let style = document.create_element("style");
    let injected = document
        .set_attr(style, FALLBACK_MARKER, "")
        .and_then(|()| document.set_text_content(style, FALLBACK_CSS))
        .and_then(|()| document.append_child(target, style));
    match injected {
        Ok(()) => true,
        Err(err) => {
            debug!("Fallback styles not injected: {err}");
            false
        }
    }
}

/// Adds `class` to every element matching `selectors`; returns how many
/// elements gained it.
fn add_class_to(document: &mut Document, selectors: &str, class: &str) -> usize {
    let nodes = document.query(selectors).unwrap_or_default();
    nodes
        .into_iter()
        .filter(|node| document.add_class(*node, class).unwrap_or(false))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Error;

    #[test]
    fn second_restore_is_a_no_op() -> Result<(), Error> {
        let mut doc = html::parse(
            "<head></head><body><form id=f></form><nav class=navbar></nav><ul class=nav></ul></body>",
        )?;
        let first = restore(&mut doc);
        assert_eq!(
            first,
            RestoreReport {
                injected_styles: true,
                forms: 1,
                navs: 2
            }
        );
        let after_first = doc.to_html();
        assert_eq!(restore(&mut doc), RestoreReport::default());
        assert_eq!(doc.to_html(), after_first);
        assert_eq!(after_first.matches(FALLBACK_CSS).count(), 1);
        Ok(())
    }

    #[test]
    fn empty_document_is_left_alone() {
        let mut doc = Document::new();
        assert_eq!(restore(&mut doc), RestoreReport::default());
    }
}
