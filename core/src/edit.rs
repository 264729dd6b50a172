//! Byte-range text edits.

use crate::error::Error;
use crate::traits::Span;

/// Replace `range` (old-buffer offsets) with `replacement`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub range: Span,
    pub replacement: String,
}

impl TextEdit {
    pub fn new(range: impl Into<Span>, replacement: impl Into<String>) -> Self {
        Self {
            range: range.into(),
            replacement: replacement.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(Span::empty(offset), text)
    }

    pub fn delete(range: impl Into<Span>) -> Self {
        Self::new(range, String::new())
    }

    /// Change in buffer length caused by this edit.
    #[inline]
    pub fn delta(&self) -> isize {
        self.replacement.len() as isize - (self.range.end - self.range.start) as isize
    }

    /// Span of the replacement in new-buffer offsets.
    #[inline]
    pub fn new_range(&self) -> Span {
        Span::new(self.range.start, self.range.start + self.replacement.len())
    }

    /// Checks that the edit lies within `text` on character boundaries.
    pub fn check(&self, text: &str) -> Result<(), Error> {
        let Span { start, end } = self.range;
        if start > end
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            return Err(Error::InvalidEdit {
                start,
                end,
                len: text.len(),
            });
        }
        Ok(())
    }

    /// Applies the edit to `text` in place.
    pub fn apply(&self, text: &mut String) -> Result<(), Error> {
        self.check(text)?;
        text.replace_range(self.range.range(), &self.replacement);
        Ok(())
    }

    /// The smallest single edit turning `old` into `new`.
    ///
    /// Strips the common prefix and suffix, snapping both to character
    /// boundaries.
    pub fn between(old: &str, new: &str) -> Self {
        let (a, b) = (old.as_bytes(), new.as_bytes());
        let mut prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
        while !old.is_char_boundary(prefix) || !new.is_char_boundary(prefix) {
            prefix -= 1;
        }

        let max_suffix = a.len().min(b.len()) - prefix;
        let mut suffix = a
            .iter()
            .rev()
            .zip(b.iter().rev())
            .take(max_suffix)
            .take_while(|(x, y)| x == y)
            .count();
        while !old.is_char_boundary(a.len() - suffix) || !new.is_char_boundary(b.len() - suffix) {
            suffix -= 1;
        }

        Self {
            range: Span::new(prefix, a.len() - suffix),
            replacement: new[prefix..b.len() - suffix].to_owned(),
        }
    }
}
