//! Core error types for livedoc.
//!
//! Fatal conditions are [`Error`] values returned through `Result`.
//! Recoverable grammar problems are recorded as [`Diagnostic`]s on the token
//! sequence and never abort a pipeline run. Propagation has its own error
//! type, [`PropagateError`](crate::propagate::PropagateError), because its
//! failures are soft: the tree stays renderable.

use crate::symbols::QualifiedName;
use crate::token::SyntaxKind;
use crate::traits::Span;

/// Core livedoc error type.
///
/// Grammar crates built on livedoc usually wrap this in their own error
/// enum with `#[from]`:
///
/// ```ignore
/// #[derive(thiserror::Error, Debug)]
/// pub enum CalcError {
///     #[error(transparent)]
///     Pipeline(#[from] livedoc::Error),
///
///     #[error("division by zero")]
///     DivisionByZero,
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A name is already bound in the same scope.
    #[error("`{name}` is already defined in scope `{scope}`")]
    DuplicateDefinition { scope: QualifiedName, name: String },

    /// No enclosing scope binds the name.
    #[error("unresolved reference `{0}`")]
    NotFound(QualifiedName),

    /// A scope id was used after the scope was closed.
    #[error("scope is not open")]
    UnknownScope,

    /// Two tokens overlap or appear out of order.
    ///
    /// This is an internal-consistency fault; it is surfaced rather than
    /// patched over.
    #[error("token {index} overlaps its predecessor")]
    Overlap { index: usize },

    /// The tree and the token sequence disagree.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    /// The tokenizer produced more tokens than the configured maximum.
    #[error("token limit exceeded: produced {produced} > limit {limit}")]
    TokenLimitExceeded { produced: usize, limit: usize },

    /// The tree ran out of 32-bit node ids.
    #[error("node limit exceeded: more than {limit} nodes")]
    CapacityExceeded { limit: usize },

    /// Container nesting exceeded the configured maximum depth.
    #[error("recursion limit exceeded: depth {depth} > limit {limit}")]
    RecursionLimitExceeded { depth: usize, limit: usize },

    /// A text edit does not fit the buffer it is applied to.
    #[error("edit {start}..{end} is out of bounds for a buffer of {len} bytes")]
    InvalidEdit { start: usize, end: usize, len: usize },

    /// A symbol region lock was poisoned by a panicking writer.
    #[error("symbol region lock poisoned")]
    Poisoned,

    #[error("no open document named `{0}`")]
    UnknownDocument(String),

    #[error("document `{0}` is already open")]
    DocumentExists(String),
}

/// Why a grammar callback invocation was rejected.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Malformed {
    /// The construct range lies outside the buffer or behind the cursor.
    OutOfBounds,
    /// The callback returned an offset other than the end of its range.
    BadOffset,
    /// The callback emitted no token, or more than one.
    TokenCount,
    /// The emitted token does not cover the construct range.
    TokenSpan,
    /// A closing construct does not match the innermost open container.
    Unbalanced,
    /// The scanner reported an empty construct that would not advance.
    Stalled,
    /// A table row outside a table, or a non-row construct inside one.
    Misplaced,
}

impl Malformed {
    pub const fn describe(self) -> &'static str {
        match self {
            Malformed::OutOfBounds => "construct range outside buffer",
            Malformed::BadOffset => "callback returned wrong offset",
            Malformed::TokenCount => "callback must emit exactly one token",
            Malformed::TokenSpan => "token does not cover construct",
            Malformed::Unbalanced => "unbalanced container",
            Malformed::Stalled => "empty construct",
            Malformed::Misplaced => "construct not allowed here",
        }
    }
}

/// A recoverable problem found while processing a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("malformed {kind} at {span}: {}", .reason.describe())]
    MalformedConstruct {
        kind: SyntaxKind,
        span: Span,
        reason: Malformed,
    },

    #[error("duplicate definition of `{name}`; later definition ignored")]
    DuplicateDefinition { name: QualifiedName },
}
