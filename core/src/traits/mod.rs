//! Collaborator contracts and span primitives.
//!
//! The pipeline is generic over two external collaborators:
//!
//! ```text
//! RendererCapability (grammar)
//!     ├── scan()            locate the next construct
//!     └── heading() .. text()   emit one token per construct
//!
//! Evaluable (values)
//!     ├── type_tag() / Display
//!     ├── eval(&dyn Environment)
//!     ├── serialize()       change detection
//!     └── references()      dependency edges
//! ```
//!
//! # Feature Flags
//!
//! - `serde`: Enables serialization for span types

mod evaluable;
mod renderer;
mod span;

pub use evaluable::{
    same_value, EmptyEnvironment, Environment, EvalError, Evaluable, Lookup, TypeTag, Value,
};
pub use renderer::{Construct, OpenContainer, RendererCapability};
pub use span::{Span, SpanLike};
