//! Read-only view of a propagated document, in token order.
//!
//! A [`RenderPass`] pairs every token with what a renderer should show for
//! it. Elements yield their evaluated value or a marker; table rows yield
//! one entry per column of the table's shape; everything else is
//! [`Rendered::Structural`].

use core::fmt;

use crate::queue::TokenSequence;
use crate::symbols::QualifiedName;
use crate::token::Token;
use crate::traits::Value;
use crate::tree::{EvalState, NodeId, Owner, Tree};

/// What to show for one token.
#[derive(Debug, Clone)]
pub enum Rendered {
    Value(Value),
    /// Names the element is still waiting on. Empty when the element has
    /// not been evaluated yet.
    Unresolved(Vec<QualifiedName>),
    Failed(String),
    Cycle,
    /// Cells of a table row, padded with `None` to the table's width.
    Row(Vec<Option<Rendered>>),
    /// Text, headings, container delimiters.
    Structural,
}

impl Rendered {
    #[inline]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Rendered::Value(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn is_structural(&self) -> bool {
        matches!(self, Rendered::Structural)
    }
}

impl PartialEq for Rendered {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Rendered::Value(a), Rendered::Value(b)) => crate::traits::same_value(a, b),
            (Rendered::Unresolved(a), Rendered::Unresolved(b)) => a == b,
            (Rendered::Failed(a), Rendered::Failed(b)) => a == b,
            (Rendered::Row(a), Rendered::Row(b)) => a == b,
            (Rendered::Cycle, Rendered::Cycle) | (Rendered::Structural, Rendered::Structural) => {
                true
            }
            _ => false,
        }
    }
}

/// Spreadsheet-style markers for values that could not be computed.
impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rendered::Value(value) => write!(f, "{value}"),
            Rendered::Unresolved(names) => {
                f.write_str("#REF!(")?;
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}")?;
                }
                f.write_str(")")
            }
            Rendered::Failed(reason) => write!(f, "#ERR!({reason})"),
            Rendered::Cycle => f.write_str("#CYCLE!"),
            Rendered::Row(cells) => {
                f.write_str("|")?;
                for cell in cells {
                    match cell {
                        Some(cell) => write!(f, " {cell} |")?,
                        None => f.write_str(" |")?,
                    }
                }
                Ok(())
            }
            Rendered::Structural => Ok(()),
        }
    }
}

/// Iterator over `(token, rendered)` pairs.
#[derive(Debug, Clone)]
pub struct RenderPass<'a> {
    tree: &'a Tree,
    tokens: std::iter::Enumerate<std::slice::Iter<'a, Token>>,
}

impl<'a> RenderPass<'a> {
    pub fn new(tree: &'a Tree, tokens: &'a TokenSequence) -> Self {
        Self {
            tree,
            tokens: tokens.as_slice().iter().enumerate(),
        }
    }

    fn element(&self, id: NodeId) -> Rendered {
        let Some(element) = self.tree.element(id) else {
            return Rendered::Structural;
        };
        match &element.state {
            EvalState::Ready(value) => Rendered::Value(value.clone()),
            EvalState::Pending(names) => Rendered::Unresolved(names.clone()),
            EvalState::Waiting(definers) => Rendered::Unresolved(
                definers
                    .iter()
                    .map(|&d| self.tree.qualified_name(d))
                    .collect(),
            ),
            EvalState::Dirty => Rendered::Unresolved(Vec::new()),
            EvalState::Failed(reason) => Rendered::Failed(reason.clone()),
            EvalState::Cycle => Rendered::Cycle,
        }
    }
}

impl<'a> Iterator for RenderPass<'a> {
    type Item = (&'a Token, Rendered);

    fn next(&mut self) -> Option<Self::Item> {
        let (index, token) = self.tokens.next()?;
        let rendered = match self.tree.owner(index) {
            Some(Owner::Node(id)) if self.tree.element(*id).is_some() => self.element(*id),
            Some(Owner::Row { table, cells }) => {
                let width = self.tree.shape(*table).map_or(cells.len(), |s| s.cols);
                let mut row: Vec<Option<Rendered>> =
                    cells.iter().map(|&c| Some(self.element(c))).collect();
                row.resize(width.max(cells.len()), None);
                Rendered::Row(row)
            }
            _ => Rendered::Structural,
        };
        Some((token, rendered))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.tokens.size_hint()
    }
}

impl ExactSizeIterator for RenderPass<'_> {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::token::tests::Lit;

    #[test]
    fn test_marker_display() {
        let unresolved = Rendered::Unresolved(vec![
            QualifiedName::parse("A"),
            QualifiedName::parse("Sec.b"),
        ]);
        assert_eq!(unresolved.to_string(), "#REF!(A, Sec.b)");
        assert_eq!(Rendered::Cycle.to_string(), "#CYCLE!");
        assert_eq!(Rendered::Failed("boom".into()).to_string(), "#ERR!(boom)");
    }

    #[test]
    fn test_row_display_pads() {
        let row = Rendered::Row(vec![
            Some(Rendered::Value(Arc::new(Lit("d")))),
            Some(Rendered::Value(Arc::new(Lit("e")))),
            None,
        ]);
        assert_eq!(row.to_string(), "| d | e | |");
    }

    #[test]
    fn test_values_compare_by_serialization() {
        let a = Rendered::Value(Arc::new(Lit("1")));
        let b = Rendered::Value(Arc::new(Lit("1")));
        assert_eq!(a, b);
        assert_ne!(a, Rendered::Cycle);
    }
}
