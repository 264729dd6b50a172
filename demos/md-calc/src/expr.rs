//! Formula syntax tree, parser and evaluator.
//!
//! ```text
//! expr   := term (("+" | "-") term)*
//! term   := unary (("*" | "/") unary)*
//! unary  := "-" unary | atom
//! atom   := number | string | "{" name "}" | "(" expr ")"
//! ```

use core::fmt;

use livedoc::{Environment, EvalError, Lookup, QualifiedName, RecursionGuard};

use crate::lexer::Tok;
use crate::value::Scalar;
use crate::CalcError;

/// Deepest formula tree the parser builds. Evaluation, display and drop
/// all recurse over it.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Ref(QualifiedName),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parses a lexed formula. The whole input must be consumed.
    pub fn parse(toks: &[Tok]) -> Result<Self, CalcError> {
        let mut parser = Parser {
            toks,
            pos: 0,
            nesting: RecursionGuard::with_limit(MAX_DEPTH),
        };
        let expr = parser.expr()?;
        match parser.toks.get(parser.pos) {
            None => Ok(expr),
            Some(tok) => Err(CalcError::Expected {
                expect: "end of formula",
                found: tok.describe().to_owned(),
            }),
        }
    }

    /// Referenced names in source order, without duplicates.
    pub fn references(&self) -> Vec<QualifiedName> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<QualifiedName>) {
        match self {
            Expr::Ref(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Bin(_, lhs, rhs) => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Num(_) | Expr::Str(_) => {}
        }
    }

    pub fn eval(&self, env: &dyn Environment) -> Result<Scalar, EvalError> {
        match self {
            Expr::Num(n) => Ok(Scalar::Number(*n)),
            Expr::Str(s) => Ok(Scalar::Text(s.clone())),
            Expr::Ref(name) => match env.lookup(name) {
                Lookup::Value(value) => Ok(Scalar::from_value(&value)),
                Lookup::Unevaluated => Err(EvalError::Unevaluated(name.clone())),
                Lookup::Missing => Err(EvalError::Unresolved(name.clone())),
            },
            Expr::Neg(inner) => match inner.eval(env)? {
                Scalar::Number(n) => Ok(Scalar::Number(-n)),
                Scalar::Text(_) => Err(EvalError::Failed("cannot negate text".into())),
            },
            Expr::Bin(op, lhs, rhs) => apply(*op, lhs.eval(env)?, rhs.eval(env)?),
        }
    }
}

fn apply(op: BinOp, lhs: Scalar, rhs: Scalar) -> Result<Scalar, EvalError> {
    match (op, lhs, rhs) {
        (BinOp::Add, Scalar::Number(a), Scalar::Number(b)) => Ok(Scalar::Number(a + b)),
        (BinOp::Sub, Scalar::Number(a), Scalar::Number(b)) => Ok(Scalar::Number(a - b)),
        (BinOp::Mul, Scalar::Number(a), Scalar::Number(b)) => Ok(Scalar::Number(a * b)),
        (BinOp::Div, Scalar::Number(_), Scalar::Number(b)) if b == 0.0 => {
            Err(EvalError::Failed("division by zero".into()))
        }
        (BinOp::Div, Scalar::Number(a), Scalar::Number(b)) => Ok(Scalar::Number(a / b)),
        (BinOp::Add, a, b) => Ok(Scalar::Text(format!("{a}{b}"))),
        (op, _, _) => Err(EvalError::Failed(format!("cannot apply `{op}` to text"))),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(n) => write!(f, "{}", Scalar::Number(*n)),
            Expr::Str(s) => write!(f, "{s:?}"),
            Expr::Ref(name) => write!(f, "{{{name}}}"),
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Bin(op, lhs, rhs) => write!(f, "({lhs} {op} {rhs})"),
        }
    }
}

struct Parser<'a> {
    toks: &'a [Tok],
    pos: usize,
    /// Counts every level the tree grows by, chained operators included.
    nesting: RecursionGuard,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Tok> {
        let tok = self.toks.get(self.pos);
        self.pos += 1;
        tok
    }

    fn enter(&mut self) -> Result<(), CalcError> {
        self.nesting
            .enter()
            .map_err(|_| CalcError::TooDeep { limit: MAX_DEPTH })
    }

    fn leave(&mut self, levels: usize) {
        for _ in 0..levels {
            self.nesting.leave();
        }
    }

    fn expr(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.term()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        self.leave(levels);
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.unary()?;
        let mut levels = 0;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            self.enter()?;
            levels += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        self.leave(levels);
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CalcError> {
        if self.peek() == Some(&Tok::Minus) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.leave(1);
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, CalcError> {
        match self.bump().cloned() {
            Some(Tok::Number(n)) => Ok(Expr::Num(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ref(name)) => Ok(Expr::Ref(QualifiedName::parse(&name))),
            Some(Tok::LParen) => {
                self.enter()?;
                let inner = self.expr()?;
                self.leave(1);
                match self.bump() {
                    Some(Tok::RParen) => Ok(inner),
                    Some(tok) => Err(CalcError::Expected {
                        expect: "`)`",
                        found: tok.describe().to_owned(),
                    }),
                    None => Err(CalcError::Empty { expect: "`)`" }),
                }
            }
            Some(tok) => Err(CalcError::Expected {
                expect: "operand",
                found: tok.describe().to_owned(),
            }),
            None => Err(CalcError::Empty { expect: "operand" }),
        }
    }
}
