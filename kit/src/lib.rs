#![deny(
    unsafe_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro
)]
//! Incremental pipeline for live, self-referencing documents.
//!
//! A document is tokenized through a grammar's
//! [`RendererCapability`](livedoc_core::RendererCapability), diffed against
//! its previous tokens, rebuilt into an arena tree with a scoped symbol
//! table, and propagated to a fixpoint through the values'
//! [`Evaluable`](livedoc_core::Evaluable) contract. Only the parts of the
//! tree an edit touches are rebuilt.
//!
//! - [`Document`](livedoc_core::Document) runs the pipeline for one buffer.
//! - [`Forest`](livedoc_core::Forest) connects documents that reference
//!   each other.
//! - `Workspace` (feature `tokio`) runs one task per document.
pub use livedoc_core::*;
