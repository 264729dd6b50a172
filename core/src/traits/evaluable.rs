use core::fmt;
use std::sync::Arc;

use crate::symbols::QualifiedName;

/// Type tag reported by a value, e.g. `"number"` or `"text"`.
///
/// The pipeline never interprets tags; they exist for renderers and
/// diagnostics.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub &'static str);

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Shared handle to a value. Tokens, nodes and bindings all hold these.
pub type Value = Arc<dyn Evaluable>;

/// Capability every terminal payload provides.
///
/// The propagator and the symbol table depend only on this contract: a type
/// tag, evaluation against an [`Environment`], a byte serialization used to
/// decide whether a value changed, and the string form via [`fmt::Display`].
///
/// # Example
///
/// ```ignore
/// #[derive(Debug)]
/// struct Number(f64);
///
/// impl Evaluable for Number {
///     fn type_tag(&self) -> TypeTag {
///         TypeTag("number")
///     }
///
///     fn eval(&self, _env: &dyn Environment) -> Result<Value, EvalError> {
///         Ok(Arc::new(Number(self.0)))
///     }
///
///     fn serialize(&self) -> Vec<u8> {
///         self.0.to_le_bytes().to_vec()
///     }
/// }
/// ```
pub trait Evaluable: fmt::Debug + fmt::Display + Send + Sync {
    /// Returns the type tag of this value.
    fn type_tag(&self) -> TypeTag;

    /// Evaluates the payload, looking up referenced names in `env`.
    fn eval(&self, env: &dyn Environment) -> Result<Value, EvalError>;

    /// Serializes the value. Two values are equal for propagation purposes
    /// iff their serializations are equal.
    fn serialize(&self) -> Vec<u8>;

    /// Names this payload reads during [`eval`](Self::eval).
    #[inline]
    fn references(&self) -> Vec<QualifiedName> {
        Vec::new()
    }
}

/// Result of looking a name up in an [`Environment`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// The name is bound and evaluated.
    Value(Value),
    /// The name is bound but its definer has no value yet.
    Unevaluated,
    /// No enclosing scope binds the name.
    Missing,
}

/// Name resolution available to [`Evaluable::eval`].
pub trait Environment {
    fn lookup(&self, name: &QualifiedName) -> Lookup;
}

/// An environment with nothing in it; useful for evaluating literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyEnvironment;

impl Environment for EmptyEnvironment {
    #[inline]
    fn lookup(&self, _name: &QualifiedName) -> Lookup {
        Lookup::Missing
    }
}

/// Evaluation failure reported by a value collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("unresolved reference `{0}`")]
    Unresolved(QualifiedName),

    #[error("`{0}` has no value yet")]
    Unevaluated(QualifiedName),

    #[error("{0}")]
    Failed(String),
}

/// Compares two values by serialization, short-circuiting on identity.
#[inline]
pub fn same_value(a: &Value, b: &Value) -> bool {
    Arc::ptr_eq(a, b) || (a.type_tag() == b.type_tag() && a.serialize() == b.serialize())
}
