//! Tokens, syntactic kinds and the sink grammar callbacks write into.

use core::fmt;
use std::sync::Arc;

use crate::traits::{same_value, Span, Value};

/// The closed set of syntactic kinds a grammar may emit.
///
/// Structural kinds open or close a container. Like a chunk boundary's
/// depth model, each kind carries a depth delta: openers are `+1`, closers
/// are `-1`, everything else is `0`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyntaxKind {
    /// Prose with no value semantics.
    Text,
    /// Opens a section. Its level is carried in [`Token::level`].
    Heading,
    /// Closes the innermost section.
    SectionEnd,
    /// A named value definition.
    Element,
    ListStart,
    ListItem,
    ListEnd,
    TableStart,
    /// One table row; each parameter is a cell.
    TableRow,
    TableEnd,
    /// A reference to a value defined elsewhere, rendered in place.
    Embed,
}

impl SyntaxKind {
    #[inline]
    pub const fn depth_delta(self) -> i32 {
        match self {
            SyntaxKind::Heading | SyntaxKind::ListStart | SyntaxKind::TableStart => 1,
            SyntaxKind::SectionEnd | SyntaxKind::ListEnd | SyntaxKind::TableEnd => -1,
            _ => 0,
        }
    }

    #[inline]
    pub const fn is_open(self) -> bool {
        self.depth_delta() > 0
    }

    #[inline]
    pub const fn is_close(self) -> bool {
        self.depth_delta() < 0
    }

    #[inline]
    pub const fn is_structural(self) -> bool {
        self.depth_delta() != 0
    }

    /// The closer matching an opener, if `self` is one.
    #[inline]
    pub const fn closer(self) -> Option<SyntaxKind> {
        match self {
            SyntaxKind::Heading => Some(SyntaxKind::SectionEnd),
            SyntaxKind::ListStart => Some(SyntaxKind::ListEnd),
            SyntaxKind::TableStart => Some(SyntaxKind::TableEnd),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SyntaxKind::Text => "Text",
            SyntaxKind::Heading => "Heading",
            SyntaxKind::SectionEnd => "SectionEnd",
            SyntaxKind::Element => "Element",
            SyntaxKind::ListStart => "ListStart",
            SyntaxKind::ListItem => "ListItem",
            SyntaxKind::ListEnd => "ListEnd",
            SyntaxKind::TableStart => "TableStart",
            SyntaxKind::TableRow => "TableRow",
            SyntaxKind::TableEnd => "TableEnd",
            SyntaxKind::Embed => "Embed",
        }
    }
}

impl fmt::Display for SyntaxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named token parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A tagged, positioned unit of lexical structure.
///
/// Tokens are immutable once emitted. Cloning is cheap: parameters are
/// shared.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: SyntaxKind,
    pub span: Span,
    /// Nesting level for headings; zero elsewhere.
    pub level: u8,
    params: Arc<[Param]>,
}

impl Token {
    pub fn new(kind: SyntaxKind, span: Span) -> Self {
        Self {
            kind,
            span,
            level: 0,
            params: Arc::from(Vec::new()),
        }
    }

    /// An opaque text token with no parameters.
    #[inline]
    pub fn text(span: Span) -> Self {
        Self::new(SyntaxKind::Text, span)
    }

    #[inline]
    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = Arc::from(params);
        self
    }

    #[inline]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Looks up a parameter by name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    /// Diff key equality: same kind, level and parameter names.
    ///
    /// Values and positions are ignored so a value edit aligns with the
    /// token it replaces.
    pub fn key_eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.level == other.level
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|(a, b)| a.name == b.name)
    }

    /// True if every parameter value serializes identically.
    ///
    /// Only meaningful when [`key_eq`](Self::key_eq) holds.
    pub fn same_values(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.params, &other.params)
            || self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|(a, b)| same_value(&a.value, &b.value))
    }

    /// The same token moved by `delta` bytes.
    #[inline]
    pub fn shifted(&self, delta: isize) -> Self {
        Self {
            span: self.span.shifted(delta),
            ..self.clone()
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.span == other.span && self.key_eq(other) && self.same_values(other)
    }
}

impl Eq for Token {}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.span)?;
        for param in self.params.iter() {
            write!(f, " {}={}", param.name, param.value)?;
        }
        Ok(())
    }
}

/// Output sink handed to grammar callbacks.
///
/// The tokenizer checkpoints the sink before each callback and rolls back
/// whatever the callback wrote if its result is rejected.
#[derive(Debug, Default)]
pub struct TokenSink {
    tokens: Vec<Token>,
}

impl TokenSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn emit(&mut self, token: Token) {
        self.tokens.push(token);
    }

    #[inline]
    pub fn checkpoint(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn rollback(&mut self, checkpoint: usize) {
        self.tokens.truncate(checkpoint);
    }

    /// Tokens emitted after `checkpoint`.
    #[inline]
    pub fn since(&self, checkpoint: usize) -> &[Token] {
        self.tokens.get(checkpoint..).unwrap_or(&[])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[inline]
    pub fn last(&self) -> Option<&Token> {
        self.tokens.last()
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::traits::{Environment, EvalError, Evaluable, TypeTag};

    /// Minimal text value for unit tests.
    #[derive(Debug)]
    pub(crate) struct Lit(pub &'static str);

    impl fmt::Display for Lit {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Evaluable for Lit {
        fn type_tag(&self) -> TypeTag {
            TypeTag("lit")
        }

        fn eval(&self, _env: &dyn Environment) -> Result<Value, EvalError> {
            Ok(Arc::new(Lit(self.0)))
        }

        fn serialize(&self) -> Vec<u8> {
            self.0.as_bytes().to_vec()
        }
    }

    pub(crate) fn element(start: usize, end: usize, name: &'static str, value: &'static str) -> Token {
        Token::new(SyntaxKind::Element, Span::new(start, end)).with_params(vec![
            Param::new("name", Arc::new(Lit(name))),
            Param::new("value", Arc::new(Lit(value))),
        ])
    }

    #[test]
    fn test_key_eq_ignores_values_and_position() {
        let a = element(0, 5, "A", "1");
        let b = element(10, 15, "A", "5");
        assert!(a.key_eq(&b));
        assert!(!a.same_values(&b));
        assert_ne!(a, b);
        assert_eq!(a, a.shifted(10).shifted(-10));
    }

    #[test]
    fn test_depth_delta() {
        assert_eq!(SyntaxKind::Heading.depth_delta(), 1);
        assert_eq!(SyntaxKind::TableEnd.depth_delta(), -1);
        assert_eq!(SyntaxKind::Embed.depth_delta(), 0);
        assert_eq!(SyntaxKind::ListStart.closer(), Some(SyntaxKind::ListEnd));
        assert_eq!(SyntaxKind::ListEnd.closer(), None);
    }

    #[test]
    fn test_sink_rollback() {
        let mut sink = TokenSink::new();
        sink.emit(Token::text(Span::new(0, 3)));
        let cp = sink.checkpoint();
        sink.emit(Token::text(Span::new(3, 4)));
        sink.emit(Token::text(Span::new(4, 5)));
        assert_eq!(sink.since(cp).len(), 2);
        sink.rollback(cp);
        assert_eq!(sink.len(), 1);
        assert!(sink.since(cp).is_empty());
    }
}
