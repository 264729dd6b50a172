//! Tokenizer driving a grammar's [`RendererCapability`] callbacks.
//!
//! Tokens tile the buffer: every byte belongs to exactly one token, with
//! opaque [`SyntaxKind::Text`] tokens filling whatever the grammar skips.
//! Zero-width tokens are allowed only for structural constructs.
//!
//! A callback whose result is invalid is rolled back and its match is
//! emitted as opaque text; the run continues and the problem is recorded
//! as a [`Diagnostic::MalformedConstruct`].
//!
//! [`Tokenizer::retokenize`] re-lexes only the region around an edit and
//! splices the rest of the previous sequence back in. Its output is
//! identical to a full [`Tokenizer::tokenize`] of the edited buffer.

use crate::config::PipelineConfig;
use crate::edit::TextEdit;
use crate::error::{Diagnostic, Error, Malformed};
use crate::queue::TokenSequence;
use crate::token::{SyntaxKind, Token, TokenSink};
use crate::traits::{Construct, OpenContainer, RendererCapability, Span};

/// Tokenizes `buffer` from `start` with a default configuration.
pub fn tokenize<C>(buffer: &[u8], start: usize, caps: &C) -> Result<TokenSequence, Error>
where
    C: RendererCapability + ?Sized,
{
    Tokenizer::new(caps).tokenize(buffer, start)
}

/// A grammar paired with resource limits.
#[derive(Debug, Clone)]
pub struct Tokenizer<C> {
    caps: C,
    config: PipelineConfig,
}

impl<C: RendererCapability> Tokenizer<C> {
    pub fn new(caps: C) -> Self {
        Self::with_config(caps, PipelineConfig::DEFAULT)
    }

    pub fn with_config(caps: C, config: PipelineConfig) -> Self {
        Self { caps, config }
    }

    #[inline]
    pub fn caps(&self) -> &C {
        &self.caps
    }

    /// Tokenizes `buffer[start..]` with no containers open.
    pub fn tokenize(&self, buffer: &[u8], start: usize) -> Result<TokenSequence, Error> {
        let mut lexer = Lexer::new(&self.caps, buffer, Vec::new(), 0, self.config.max_tokens);
        lexer.run(start.min(buffer.len()), |_, _| None)?;

        log::debug!(
            "tokenized {} bytes into {} tokens ({} diagnostics)",
            buffer.len(),
            lexer.sink.len(),
            lexer.diagnostics.len()
        );
        let tokens = lexer.sink.into_tokens();
        let cursor = tokens.len();
        Ok(TokenSequence::from_parts(tokens, cursor, lexer.diagnostics))
    }

    /// Re-lexes `buffer` (already edited) after `edit` was applied to the
    /// buffer `prev` was produced from.
    ///
    /// Lexing restarts one construct before the first token the edit
    /// touches and stops as soon as it reaches a previous token's shifted
    /// start, past the edit, with the same containers open. The cursor of
    /// the result marks the end of the re-lexed run.
    pub fn retokenize(
        &self,
        prev: &TokenSequence,
        buffer: &[u8],
        edit: &TextEdit,
    ) -> Result<TokenSequence, Error> {
        let old = prev.as_slice();
        let delta = edit.delta();
        let restart = resync_start(old, edit.range);
        let restart_offset = old.get(restart).map_or(0, |t| t.span.start);
        let open = open_before(&old[..restart]);
        let new_edit_end = edit.new_range().end;

        let mut follower = Follower::new(old, restart, open.clone());
        let mut lexer = Lexer::new(&self.caps, buffer, open, restart, self.config.max_tokens);
        let rejoin = lexer.run(restart_offset.min(buffer.len()), |offset, stack| {
            if offset < new_edit_end {
                return None;
            }
            let old_offset = offset.checked_add_signed(-delta)?;
            follower.find(old_offset, stack)
        })?;

        let relexed = lexer.sink.len();
        let mut tokens = Vec::with_capacity(old.len().saturating_add(relexed));
        tokens.extend_from_slice(&old[..restart]);
        tokens.extend(lexer.sink.into_tokens());
        let cursor = tokens.len();

        let mut diagnostics: Vec<Diagnostic> = prev
            .diagnostics()
            .iter()
            .filter(|d| diagnostic_start(d).is_none_or(|s| s < restart_offset))
            .cloned()
            .collect();
        diagnostics.extend(lexer.diagnostics);

        if let Some(index) = rejoin {
            let rejoin_offset = old.get(index).map_or(usize::MAX, |t| t.span.start);
            tokens.extend(old[index..].iter().map(|t| t.shifted(delta)));
            diagnostics.extend(
                prev.diagnostics()
                    .iter()
                    .filter(|d| diagnostic_start(d).is_some_and(|s| s >= rejoin_offset))
                    .map(|d| shift_diagnostic(d, delta)),
            );
            log::debug!(
                "retokenized tokens {}..{} ({} re-lexed, rejoined at old token {})",
                restart,
                cursor,
                relexed,
                index
            );
        } else {
            log::debug!("retokenized from token {} to end of buffer", restart);
        }

        if tokens.len() > self.config.max_tokens {
            return Err(Error::TokenLimitExceeded {
                produced: tokens.len(),
                limit: self.config.max_tokens,
            });
        }
        Ok(TokenSequence::from_parts(tokens, cursor, diagnostics))
    }
}

/// Index of the token lexing restarts from for an edit of `range`.
pub(crate) fn resync_start(old: &[Token], range: Span) -> usize {
    let first = old
        .iter()
        .position(|t| t.span.start <= range.end && range.start <= t.span.end)
        .unwrap_or(old.len());

    // Step back over one real construct; its classification may depend on
    // the construct that follows it.
    let mut restart = first;
    while restart > 0 {
        restart -= 1;
        if old[restart].span.start != old[restart].span.end {
            break;
        }
    }
    while restart > 0 && old[restart - 1].span.start == old.get(restart).map_or(0, |t| t.span.start)
    {
        restart -= 1;
    }
    restart
}

fn open_before(tokens: &[Token]) -> Vec<OpenContainer> {
    let mut open = Vec::new();
    for token in tokens {
        apply_structure(&mut open, token);
    }
    open
}

#[inline]
fn apply_structure(open: &mut Vec<OpenContainer>, token: &Token) {
    if token.kind.is_open() {
        open.push(OpenContainer {
            kind: token.kind,
            level: token.level,
        });
    } else if token.kind.is_close() {
        open.pop();
    }
}

fn diagnostic_start(diagnostic: &Diagnostic) -> Option<usize> {
    match diagnostic {
        Diagnostic::MalformedConstruct { span, .. } => Some(span.start),
        Diagnostic::DuplicateDefinition { .. } => None,
    }
}

fn shift_diagnostic(diagnostic: &Diagnostic, delta: isize) -> Diagnostic {
    match diagnostic {
        Diagnostic::MalformedConstruct { kind, span, reason } => Diagnostic::MalformedConstruct {
            kind: *kind,
            span: span.shifted(delta),
            reason: *reason,
        },
        other => other.clone(),
    }
}

/// Walks the previous sequence alongside the new run, tracking the
/// containers open before each old token.
struct Follower<'a> {
    old: &'a [Token],
    index: usize,
    open: Vec<OpenContainer>,
}

impl<'a> Follower<'a> {
    fn new(old: &'a [Token], index: usize, open: Vec<OpenContainer>) -> Self {
        Self { old, index, open }
    }

    /// First old token starting at `offset` with exactly `stack` open.
    fn find(&mut self, offset: usize, stack: &[OpenContainer]) -> Option<usize> {
        while let Some(token) = self.old.get(self.index) {
            if token.span.start >= offset {
                break;
            }
            apply_structure(&mut self.open, token);
            self.index += 1;
        }

        let mut probe = self.open.clone();
        let mut index = self.index;
        while let Some(token) = self.old.get(index) {
            if token.span.start != offset {
                return None;
            }
            if probe == stack {
                return Some(index);
            }
            apply_structure(&mut probe, token);
            index += 1;
        }
        None
    }
}

struct Lexer<'a, C: ?Sized> {
    caps: &'a C,
    buffer: &'a [u8],
    sink: TokenSink,
    open: Vec<OpenContainer>,
    diagnostics: Vec<Diagnostic>,
    /// Tokens already counted toward the limit.
    base: usize,
    limit: usize,
    /// Offset of the last zero-width opener, to stop a grammar that keeps
    /// opening empty containers at one position.
    zero_open_at: Option<usize>,
}

impl<'a, C: RendererCapability + ?Sized> Lexer<'a, C> {
    fn new(
        caps: &'a C,
        buffer: &'a [u8],
        open: Vec<OpenContainer>,
        base: usize,
        limit: usize,
    ) -> Self {
        Self {
            caps,
            buffer,
            sink: TokenSink::new(),
            open,
            diagnostics: Vec::new(),
            base,
            limit,
            zero_open_at: None,
        }
    }

    /// Lexes from `offset` to the end of the buffer, or until `rejoin`
    /// returns an index into the previous sequence.
    fn run<F>(&mut self, mut offset: usize, mut rejoin: F) -> Result<Option<usize>, Error>
    where
        F: FnMut(usize, &[OpenContainer]) -> Option<usize>,
    {
        let len = self.buffer.len();
        loop {
            if let Some(index) = rejoin(offset, &self.open) {
                return Ok(Some(index));
            }
            let Some(construct) = self.caps.scan(self.buffer, offset, &self.open) else {
                break;
            };
            let range = construct.range.clone();
            if range.start < offset || range.end < range.start || range.end > len {
                match self.recover(construct.kind, range.start..range.end, offset, Malformed::OutOfBounds)? {
                    Some(next) => offset = next,
                    None => break,
                }
                continue;
            }
            if range.start > offset {
                self.opaque(offset, range.start)?;
                offset = range.start;
            }
            match self.dispatch(&construct)? {
                Ok(next) => offset = next,
                Err(reason) => match self.recover(construct.kind, range, offset, reason)? {
                    Some(next) => offset = next,
                    None => break,
                },
            }
        }

        if offset < len {
            self.opaque(offset, len)?;
        }
        while let Some(container) = self.open.pop() {
            if let Some(closer) = container.kind.closer() {
                self.push(Token::new(closer, Span::empty(len)).with_level(container.level))?;
            }
        }
        Ok(None)
    }

    /// Runs one callback. The outer error is fatal; the inner one means
    /// the construct was rejected and nothing was emitted.
    fn dispatch(&mut self, construct: &Construct) -> Result<Result<usize, Malformed>, Error> {
        let Construct { kind, range, level } = construct.clone();
        let start = range.start;

        if range.is_empty()
            && (!kind.is_structural() || (kind.is_open() && self.zero_open_at == Some(start)))
        {
            return Ok(Err(Malformed::Stalled));
        }
        let in_table = self.open.last().map(|top| top.kind) == Some(SyntaxKind::TableStart);
        let misplaced = match kind {
            SyntaxKind::TableRow => !in_table,
            SyntaxKind::Text => false,
            k => in_table && !k.is_close(),
        };
        if misplaced {
            return Ok(Err(Malformed::Misplaced));
        }
        if kind.is_close() {
            let matches = self
                .open
                .last()
                .and_then(|top| top.kind.closer())
                .is_some_and(|closer| closer == kind);
            if !matches {
                return Ok(Err(Malformed::Unbalanced));
            }
        }

        let checkpoint = self.sink.checkpoint();
        let buffer = self.buffer;
        let matched = &buffer[range.clone()];
        let out = &mut self.sink;
        let caps = self.caps;
        let next = match kind {
            SyntaxKind::Text => caps.text(out, matched, start),
            SyntaxKind::Heading => caps.heading(out, matched, start, level),
            SyntaxKind::SectionEnd => caps.section_end(out, matched, start, level),
            SyntaxKind::Element => caps.element(out, matched, start),
            SyntaxKind::ListStart => caps.list_start(out, matched, start),
            SyntaxKind::ListItem => caps.list_item(out, matched, start),
            SyntaxKind::ListEnd => caps.list_end(out, matched, start),
            SyntaxKind::TableStart => caps.table_start(out, matched, start),
            SyntaxKind::TableRow => caps.table_row(out, matched, start),
            SyntaxKind::TableEnd => caps.table_end(out, matched, start),
            SyntaxKind::Embed => caps.embed(out, matched, start),
        };

        let verdict = match self.sink.since(checkpoint) {
            _ if next != range.end => Err(Malformed::BadOffset),
            [token] if token.kind == kind && token.span == Span::from(range.clone()) => Ok(()),
            [_] => Err(Malformed::TokenSpan),
            _ => Err(Malformed::TokenCount),
        };
        if let Err(reason) = verdict {
            self.sink.rollback(checkpoint);
            return Ok(Err(reason));
        }

        if let Some(token) = self.sink.last() {
            let token = token.clone();
            apply_structure(&mut self.open, &token);
        }
        if range.is_empty() && kind.is_open() {
            self.zero_open_at = Some(start);
        }
        self.check_limit()?;
        Ok(Ok(next))
    }

    /// Records a rejected construct and emits its bytes as opaque text.
    ///
    /// Returns the offset to continue from, or `None` at end of buffer.
    fn recover(
        &mut self,
        kind: SyntaxKind,
        range: core::ops::Range<usize>,
        offset: usize,
        reason: Malformed,
    ) -> Result<Option<usize>, Error> {
        let span = Span::new(range.start, range.end);
        log::warn!("malformed {kind} at {span}: {}", reason.describe());
        self.diagnostics.push(Diagnostic::MalformedConstruct { kind, span, reason });

        let len = self.buffer.len();
        let in_bounds = range.start >= offset && range.end <= len && range.start < range.end;
        let end = if in_bounds {
            range.end
        } else {
            line_end(self.buffer, offset)
        };
        if end <= offset {
            return Ok(None);
        }
        let start = if in_bounds { range.start } else { offset };
        if start > offset {
            self.opaque(offset, start)?;
        }
        self.opaque(start, end)?;
        Ok(Some(end))
    }

    fn opaque(&mut self, start: usize, end: usize) -> Result<(), Error> {
        self.push(Token::text(Span::new(start, end)))
    }

    fn push(&mut self, token: Token) -> Result<(), Error> {
        self.sink.emit(token);
        self.check_limit()
    }

    fn check_limit(&self) -> Result<(), Error> {
        let produced = self.base.saturating_add(self.sink.len());
        if produced > self.limit {
            return Err(Error::TokenLimitExceeded {
                produced,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// Offset just past the next newline at or after `offset`.
fn line_end(buffer: &[u8], offset: usize) -> usize {
    buffer
        .get(offset..)
        .and_then(|rest| rest.iter().position(|&b| b == b'\n'))
        .map_or(buffer.len(), |i| offset + i + 1)
}
