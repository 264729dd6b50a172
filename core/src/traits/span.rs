use core::fmt;
use core::ops::Range;

/// Anything with a byte range into a document buffer.
///
/// Tokens, edits and diagnostics all carry one.
pub trait SpanLike: Clone {
    fn start(&self) -> usize;

    /// Exclusive.
    fn end(&self) -> usize;

    fn new(start: usize, end: usize) -> Self;

    /// Byte length; an inverted range counts as empty.
    #[inline]
    fn len(&self) -> usize {
        self.end().saturating_sub(self.start())
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest range covering both.
    #[inline]
    fn join(&self, other: &Self) -> Self {
        let start = self.start().min(other.start());
        Self::new(start, self.end().max(other.end()))
    }

    /// Overlapping or adjacent. An insertion at a token's boundary
    /// touches that token.
    #[inline]
    fn touches(&self, other: &Self) -> bool {
        self.start() <= other.end() && other.start() <= self.end()
    }
}

/// Concrete byte span used throughout the pipeline.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A zero-width span at `offset`.
    #[inline]
    pub const fn empty(offset: usize) -> Self {
        Self::new(offset, offset)
    }

    #[inline]
    pub const fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Moves both ends by `delta`, saturating at zero.
    #[inline]
    pub const fn shifted(self, delta: isize) -> Self {
        Self {
            start: self.start.saturating_add_signed(delta),
            end: self.end.saturating_add_signed(delta),
        }
    }
}

impl SpanLike for Span {
    #[inline]
    fn start(&self) -> usize {
        self.start
    }

    #[inline]
    fn end(&self) -> usize {
        self.end
    }

    #[inline]
    fn new(start: usize, end: usize) -> Self {
        Span::new(start, end)
    }
}

impl From<Range<usize>> for Span {
    #[inline]
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
