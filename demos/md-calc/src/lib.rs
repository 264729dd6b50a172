#![deny(
    unsafe_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro
)]

//! md-calc: a small calculating markdown dialect on top of livedoc.
//!
//! It supports:
//! - Sections (`#` headings) that scope the names defined inside them
//! - Elements (`name: value`) whose values may be numbers, text or
//!   formulas referencing other elements as `{name}` / `{Sec.name}`
//! - Lists (`- value`) and tables (`| a | b |`)
//! - Embeds (`![[Doc.name]]`) that show a value from elsewhere
//!
//! ```ignore
//! let (doc, _) = md_calc::open("Doc", "A: 1\nB: {A}+1\n")?;
//! assert_eq!(md_calc::render_plain(&doc), "A: 1\nB: 2\n");
//! ```

use livedoc::{Document, Error, PipelineConfig, PipelineReport};
use thiserror::Error;

pub mod expr;
pub mod grammar;
pub mod lexer;
pub mod plain;
pub mod value;

pub use grammar::MdCalc;
pub use plain::render_plain;
pub use value::{parse_value, Formula, Number, Scalar, Text};

#[derive(Error, Debug, Clone, Default, PartialEq)]
pub enum CalcError {
    #[default]
    #[error("unrecognized character in formula")]
    Unknown,

    #[error("expected {expect}, found {found}")]
    Expected { expect: &'static str, found: String },

    #[error("expected {expect}, found end of formula")]
    Empty { expect: &'static str },

    #[error("formula nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Opens an md-calc document with the default configuration.
pub fn open(
    name: impl Into<String>,
    text: impl Into<String>,
) -> Result<(Document<MdCalc>, PipelineReport), Error> {
    Document::open(name, text, MdCalc, PipelineConfig::DEFAULT)
}
