//! Values carried by element tokens.
//!
//! Literals evaluate to themselves. A [`Formula`] keeps its source and
//! syntax tree; evaluating it yields a [`Number`] or a [`Text`].

use core::fmt;
use std::sync::Arc;

use livedoc::{Environment, EvalError, Evaluable, QualifiedName, TypeTag, Value};

use crate::expr::Expr;
use crate::lexer::{lex, Tok};

pub const NUMBER: TypeTag = TypeTag("number");
pub const TEXT: TypeTag = TypeTag("text");
pub const FORMULA: TypeTag = TypeTag("formula");

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Number(pub f64);

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
            write!(f, "{}", n as i64)
        } else {
            write!(f, "{n}")
        }
    }
}

impl Evaluable for Number {
    fn type_tag(&self) -> TypeTag {
        NUMBER
    }

    fn eval(&self, _env: &dyn Environment) -> Result<Value, EvalError> {
        Ok(Arc::new(*self))
    }

    fn serialize(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Evaluable for Text {
    fn type_tag(&self) -> TypeTag {
        TEXT
    }

    fn eval(&self, _env: &dyn Environment) -> Result<Value, EvalError> {
        Ok(Arc::new(self.clone()))
    }

    fn serialize(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

/// An expression over numbers, strings and `{name}` references.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    expr: Expr,
    refs: Vec<QualifiedName>,
}

impl Formula {
    pub fn new(source: impl Into<String>, expr: Expr) -> Self {
        let refs = expr.references();
        Self {
            source: source.into(),
            expr,
            refs,
        }
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Evaluable for Formula {
    fn type_tag(&self) -> TypeTag {
        FORMULA
    }

    fn eval(&self, env: &dyn Environment) -> Result<Value, EvalError> {
        Ok(self.expr.eval(env)?.into_value())
    }

    fn serialize(&self) -> Vec<u8> {
        self.source.as_bytes().to_vec()
    }

    fn references(&self) -> Vec<QualifiedName> {
        self.refs.clone()
    }
}

/// An evaluated operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Reads a value through its tag and serialization only. Anything that
    /// is not a number is treated as its display string.
    pub fn from_value(value: &Value) -> Self {
        if value.type_tag() == NUMBER {
            if let Ok(bytes) = <[u8; 8]>::try_from(value.serialize().as_slice()) {
                return Scalar::Number(f64::from_le_bytes(bytes));
            }
        }
        Scalar::Text(value.to_string())
    }

    pub fn into_value(self) -> Value {
        match self {
            Scalar::Number(n) => Arc::new(Number(n)),
            Scalar::Text(s) => Arc::new(Text(s)),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Number(n) => Number(*n).fmt(f),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// Classifies the text after an element's `:`.
///
/// A lone number (optionally negated) is a [`Number`], a lone string
/// literal is a [`Text`], anything else that parses as an expression is a
/// [`Formula`], and the rest is plain [`Text`].
pub fn parse_value(source: &str) -> Value {
    let source = source.trim();
    let Ok(toks) = lex(source) else {
        return Arc::new(Text(source.to_owned()));
    };
    match toks.as_slice() {
        [] => return Arc::new(Text(String::new())),
        [Tok::Number(n)] => return Arc::new(Number(*n)),
        [Tok::Minus, Tok::Number(n)] => return Arc::new(Number(-n)),
        [Tok::Str(s)] => return Arc::new(Text(s.clone())),
        _ => {}
    }
    match Expr::parse(&toks) {
        Ok(expr) => Arc::new(Formula::new(source, expr)),
        Err(err) => {
            log::trace!("`{source}` is not a formula: {err}");
            Arc::new(Text(source.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use livedoc::EmptyEnvironment;
    use test_case::test_case;

    use super::*;

    #[test_case("42", "number", "42"; "integer")]
    #[test_case("-2.5", "number", "-2.5"; "negative")]
    #[test_case("\"hi\"", "text", "hi"; "string literal")]
    #[test_case("hello there", "text", "hello there"; "prose")]
    #[test_case("{A}+1", "formula", "{A}+1"; "formula")]
    #[test_case("1 +", "text", "1 +"; "broken formula")]
    fn test_parse_value(source: &str, tag: &str, display: &str) {
        let value = parse_value(source);
        assert_eq!(value.type_tag().0, tag);
        assert_eq!(value.to_string(), display);
    }

    #[test]
    fn test_number_display_and_scalar() {
        assert_eq!(Number(6.0).to_string(), "6");
        assert_eq!(Number(0.5).to_string(), "0.5");
        let value: Value = Arc::new(Number(3.0));
        assert_eq!(Scalar::from_value(&value), Scalar::Number(3.0));
    }

    #[test]
    fn test_constant_formula_evaluates() {
        let value = parse_value("(1+2)*4");
        let out = value.eval(&EmptyEnvironment).unwrap();
        assert_eq!(out.to_string(), "12");
        assert!(value.references().is_empty());
    }
}
