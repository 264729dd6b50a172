//! The token queue: one document version's lexical record.

use crate::error::{Diagnostic, Error};
use crate::token::Token;

/// An ordered, position-addressable sequence of tokens plus a write cursor.
///
/// The cursor marks the last write position. [`insert`](Self::insert)
/// places a token at the cursor and advances past it;
/// [`delete`](Self::delete) removes the token at the cursor and closes the
/// gap. Neither re-checks ordering; call [`validate`](Self::validate) once a
/// batch of writes is complete.
///
/// # Example
/// ```ignore
/// let mut seq = TokenSequence::new();
/// seq.push(heading);
/// seq.push(element);
///
/// seq.seek(1);
/// seq.insert(list_start); // now at index 1, cursor == 2
/// seq.validate()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TokenSequence {
    tokens: Vec<Token>,
    cursor: usize,
    diagnostics: Vec<Diagnostic>,
}

impl TokenSequence {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Builds a sequence from already-ordered tokens.
    ///
    /// The cursor is placed at `cursor`, clamped to the length.
    pub fn from_parts(tokens: Vec<Token>, cursor: usize, diagnostics: Vec<Diagnostic>) -> Self {
        let cursor = cursor.min(tokens.len());
        Self {
            tokens,
            cursor,
            diagnostics,
        }
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
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor.
    ///
    /// # Clamping Behavior
    ///
    /// Positions past the end clamp to the length, so `seek(usize::MAX)`
    /// moves to the append position.
    #[inline]
    pub fn seek(&mut self, index: usize) {
        self.cursor = index.min(self.tokens.len());
    }

    /// Inserts at the cursor, splitting head and tail, and advances the
    /// cursor past the inserted token.
    pub fn insert(&mut self, token: Token) {
        self.tokens.insert(self.cursor, token);
        self.cursor += 1;
    }

    /// Removes exactly one token at the cursor. The cursor stays put, now
    /// addressing what used to be the next token.
    pub fn delete(&mut self) -> Option<Token> {
        if self.cursor < self.tokens.len() {
            Some(self.tokens.remove(self.cursor))
        } else {
            None
        }
    }

    /// Appends and moves the cursor to the end.
    #[inline]
    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
        self.cursor = self.tokens.len();
    }

    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) {
        self.tokens.extend(tokens);
        self.cursor = self.tokens.len();
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Token> {
        self.tokens.get(index)
    }

    #[inline]
    pub fn as_slice(&self) -> &[Token] {
        &self.tokens
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.tokens.iter()
    }

    /// Index of the first token whose span contains or starts at `offset`.
    pub fn index_at(&self, offset: usize) -> usize {
        self.tokens.partition_point(|t| t.span.end <= offset && t.span.start < offset)
    }

    #[inline]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[inline]
    pub fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Checks that no two tokens overlap and positions never decrease.
    pub fn validate(&self) -> Result<(), Error> {
        let mut prev_end = 0;
        for (index, token) in self.tokens.iter().enumerate() {
            if token.span.end < token.span.start || (index > 0 && token.span.start < prev_end) {
                return Err(Error::Overlap { index });
            }
            prev_end = token.span.end;
        }
        Ok(())
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }
}

impl AsRef<[Token]> for TokenSequence {
    #[inline]
    fn as_ref(&self) -> &[Token] {
        &self.tokens
    }
}

impl<'a> IntoIterator for &'a TokenSequence {
    type Item = &'a Token;
    type IntoIter = std::slice::Iter<'a, Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.tokens.iter()
    }
}
