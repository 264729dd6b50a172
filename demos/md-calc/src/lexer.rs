//! Formula lexer.

use logos::Logos;

use crate::CalcError;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = CalcError)]
#[logos(skip r"[ \t]+")]
pub enum Tok {
    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("/")]
    Slash,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    /// `{name}` or `{Doc.Section.name}`.
    #[regex(r"\{[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*\}", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Ref(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),
}

impl Tok {
    pub fn describe(&self) -> &'static str {
        match self {
            Tok::Plus => "`+`",
            Tok::Minus => "`-`",
            Tok::Star => "`*`",
            Tok::Slash => "`/`",
            Tok::LParen => "`(`",
            Tok::RParen => "`)`",
            Tok::Number(_) => "number",
            Tok::Ref(_) => "reference",
            Tok::Str(_) => "string",
        }
    }
}

/// Lexes a whole formula, failing on the first unrecognized byte.
pub fn lex(source: &str) -> Result<Vec<Tok>, CalcError> {
    Tok::lexer(source).collect()
}
