//! Plain-text renderer: the source with every computed value filled in.

use core::fmt::Write;

use livedoc::{Document, Rendered, SyntaxKind, Token};

/// Renders `doc`, replacing each value with its evaluated form and
/// unresolved or failed ones with their markers. Prose is copied verbatim.
pub fn render_plain<C>(doc: &Document<C>) -> String {
    let text = doc.text();
    let mut out = String::with_capacity(text.len());
    for (token, rendered) in doc.render() {
        let source = text.get(token.span.start..token.span.end).unwrap_or("");
        match token.kind {
            SyntaxKind::Element | SyntaxKind::ListItem | SyntaxKind::Embed => {
                if token.kind == SyntaxKind::ListItem {
                    out.push_str("- ");
                }
                if let Some(name) = name_of(token) {
                    // Writing into a String cannot fail.
                    let _ = write!(out, "{name}: ");
                }
                let _ = write!(out, "{rendered}");
                push_newline(&mut out, source);
            }
            SyntaxKind::TableRow => {
                let _ = write!(out, "{rendered}");
                push_newline(&mut out, source);
            }
            _ => {
                debug_assert!(matches!(rendered, Rendered::Structural));
                out.push_str(source);
            }
        }
    }
    out
}

fn name_of(token: &Token) -> Option<String> {
    token.param("name").map(|v| v.to_string())
}

fn push_newline(out: &mut String, source: &str) {
    if source.ends_with('\n') {
        out.push('\n');
    }
}
