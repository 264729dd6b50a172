pub mod arena;
pub mod config;
pub mod diff;
pub mod document;
pub mod edit;
mod error;
pub mod forest;
pub mod propagate;
mod queue;
pub mod render;
pub mod symbols;
pub mod token;
pub mod tokenizer;
pub mod traits;
pub mod tree;

#[cfg(feature = "tokio")]
pub mod session;

pub use config::{PipelineConfig, RecursionGuard};
pub use diff::{diff, diff_tokens, Change, ChangeOp, ChangeSet};
pub use document::{Document, PipelineReport};
pub use edit::TextEdit;
pub use error::{Diagnostic, Error, Malformed};
pub use forest::{Forest, ForestEdit, Registry};
pub use propagate::{
    propagate, CancelToken, CycleError, ForeignRead, ForeignResolver, PendingNode, PropagateError,
    Propagation,
};
pub use queue::TokenSequence;
pub use render::{RenderPass, Rendered};
pub use symbols::{Binding, QualifiedName, Region, ScopeId, SymbolTable};
pub use token::{Param, SyntaxKind, Token, TokenSink};
pub use tokenizer::{tokenize, Tokenizer};
pub use traits::{
    same_value, Construct, EmptyEnvironment, Environment, EvalError, Evaluable, Lookup,
    OpenContainer, RendererCapability, Span, SpanLike, TypeTag, Value,
};
pub use tree::{rebuild, EvalState, Node, NodeData, NodeId, Owner, RebuildReport, Shape, Tree};

#[cfg(feature = "tokio")]
pub use session::{RegionChanged, SessionError, SessionHandle, Snapshot, Workspace};
