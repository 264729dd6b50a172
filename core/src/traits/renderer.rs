use core::ops::Range;

use crate::token::{SyntaxKind, TokenSink};

/// A container that is open at the current scan position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenContainer {
    /// The opening kind: `Heading`, `ListStart` or `TableStart`.
    pub kind: SyntaxKind,
    pub level: u8,
}

/// A construct located by [`RendererCapability::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Construct {
    pub kind: SyntaxKind,
    /// Byte range of the match. Closers may be zero-width.
    pub range: Range<usize>,
    /// Heading level; ignored for other kinds.
    pub level: u8,
}

impl Construct {
    pub fn new(kind: SyntaxKind, range: Range<usize>) -> Self {
        Self {
            kind,
            range,
            level: 0,
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }
}

/// Structural callbacks supplied by a grammar.
///
/// The tokenizer asks [`scan`](Self::scan) for the next construct, then
/// dispatches the matched bytes to the callback for that construct's kind.
/// Every callback receives the output sink, the matched bytes and the
/// absolute offset of the match, must emit exactly one token covering the
/// match, and returns the offset just past it. All callbacks are required,
/// so a grammar cannot be handed to the tokenizer with part of the set
/// missing.
///
/// `scan` must be a function of `buffer[offset..]` and `open` only, and may
/// look ahead at most into the construct following the one it returns. The
/// incremental tokenizer relies on both to rejoin a previous token sequence
/// after an edit.
///
/// A callback whose result is invalid (range out of bounds, wrong offset,
/// wrong token count or span) is rolled back and the match is emitted as
/// opaque text instead.
pub trait RendererCapability: Send + Sync {
    /// Locates the next construct at or after `offset`.
    ///
    /// Bytes between `offset` and the construct's start become opaque text.
    /// Returning `None` ends the scan; the remainder of the buffer becomes
    /// text and open containers are closed.
    fn scan(&self, buffer: &[u8], offset: usize, open: &[OpenContainer]) -> Option<Construct>;

    fn heading(&self, out: &mut TokenSink, matched: &[u8], offset: usize, level: u8) -> usize;

    fn section_end(&self, out: &mut TokenSink, matched: &[u8], offset: usize, level: u8) -> usize;

    fn element(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn list_start(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn list_item(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn list_end(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn table_start(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn table_row(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn table_end(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn embed(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;

    fn text(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize;
}

macro_rules! forward_capability {
    ($($ty:ty),*) => {$(
        impl<R: RendererCapability + ?Sized> RendererCapability for $ty {
            #[inline]
            fn scan(&self, buffer: &[u8], offset: usize, open: &[OpenContainer]) -> Option<Construct> {
                (**self).scan(buffer, offset, open)
            }

            #[inline]
            fn heading(&self, out: &mut TokenSink, matched: &[u8], offset: usize, level: u8) -> usize {
                (**self).heading(out, matched, offset, level)
            }

            #[inline]
            fn section_end(&self, out: &mut TokenSink, matched: &[u8], offset: usize, level: u8) -> usize {
                (**self).section_end(out, matched, offset, level)
            }

            #[inline]
            fn element(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).element(out, matched, offset)
            }

            #[inline]
            fn list_start(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).list_start(out, matched, offset)
            }

            #[inline]
            fn list_item(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).list_item(out, matched, offset)
            }

            #[inline]
            fn list_end(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).list_end(out, matched, offset)
            }

            #[inline]
            fn table_start(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).table_start(out, matched, offset)
            }

            #[inline]
            fn table_row(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).table_row(out, matched, offset)
            }

            #[inline]
            fn table_end(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).table_end(out, matched, offset)
            }

            #[inline]
            fn embed(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).embed(out, matched, offset)
            }

            #[inline]
            fn text(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
                (**self).text(out, matched, offset)
            }
        }
    )*};
}

forward_capability!(&R, std::sync::Arc<R>, Box<R>);
