//! A small grammar shared by the integration tests.
//!
//! `# Title` opens a section, `name: body` defines an element, anything
//! else is prose. A body is `+`-separated integers and `{name}`
//! references; any other body is a word.

#![allow(dead_code)]

use core::fmt;
use std::sync::Arc;

use livedoc::{
    Construct, Environment, EvalError, Evaluable, Lookup, OpenContainer, Param, QualifiedName,
    RendererCapability, Span, SyntaxKind, Token, TokenSink, TypeTag, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int(pub i64);

impl fmt::Display for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Evaluable for Int {
    fn type_tag(&self) -> TypeTag {
        TypeTag("int")
    }

    fn eval(&self, _env: &dyn Environment) -> Result<Value, EvalError> {
        Ok(Arc::new(*self))
    }

    fn serialize(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word(pub String);

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Evaluable for Word {
    fn type_tag(&self) -> TypeTag {
        TypeTag("word")
    }

    fn eval(&self, _env: &dyn Environment) -> Result<Value, EvalError> {
        Ok(Arc::new(self.clone()))
    }

    fn serialize(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

#[derive(Debug, Clone)]
pub struct Sum {
    source: String,
    base: i64,
    refs: Vec<QualifiedName>,
}

impl fmt::Display for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Evaluable for Sum {
    fn type_tag(&self) -> TypeTag {
        TypeTag("sum")
    }

    fn eval(&self, env: &dyn Environment) -> Result<Value, EvalError> {
        let mut total = self.base;
        for name in &self.refs {
            let value = match env.lookup(name) {
                Lookup::Value(value) => value,
                Lookup::Unevaluated => return Err(EvalError::Unevaluated(name.clone())),
                Lookup::Missing => return Err(EvalError::Unresolved(name.clone())),
            };
            let bytes = <[u8; 8]>::try_from(value.serialize().as_slice())
                .map_err(|_| EvalError::Failed(format!("`{name}` is not a number")))?;
            total += i64::from_le_bytes(bytes);
        }
        Ok(Arc::new(Int(total)))
    }

    fn serialize(&self) -> Vec<u8> {
        self.source.as_bytes().to_vec()
    }

    fn references(&self) -> Vec<QualifiedName> {
        self.refs.clone()
    }
}

pub fn parse_body(body: &str) -> Value {
    let body = body.trim();
    let mut base = 0i64;
    let mut refs = Vec::new();
    for piece in body.split('+').map(str::trim) {
        if let Some(name) = piece.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            refs.push(QualifiedName::parse(name));
        } else if let Ok(n) = piece.parse::<i64>() {
            base += n;
        } else {
            return Arc::new(Word(body.to_owned()));
        }
    }
    if refs.is_empty() {
        Arc::new(Int(base))
    } else {
        Arc::new(Sum {
            source: body.to_owned(),
            base,
            refs,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sheet;

fn line_end(buffer: &[u8], offset: usize) -> usize {
    buffer[offset..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(buffer.len(), |i| offset + i + 1)
}

fn split(line: &[u8]) -> Option<(String, String)> {
    let line = core::str::from_utf8(line).ok()?.trim_end();
    let (name, body) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((name.to_owned(), body.to_owned()))
}

fn level(line: &[u8]) -> Option<u8> {
    let hashes = line.iter().take_while(|&&b| b == b'#').count();
    (hashes > 0 && line.get(hashes) == Some(&b' ')).then(|| hashes as u8)
}

impl RendererCapability for Sheet {
    fn scan(&self, buffer: &[u8], offset: usize, open: &[OpenContainer]) -> Option<Construct> {
        let mut at = offset;
        while at < buffer.len() {
            let end = line_end(buffer, at);
            let line = &buffer[at..end];
            if let Some(n) = level(line) {
                if let Some(top) = open.last() {
                    if top.level >= n {
                        return Some(Construct::new(SyntaxKind::SectionEnd, at..at).with_level(top.level));
                    }
                }
                return Some(Construct::new(SyntaxKind::Heading, at..end).with_level(n));
            }
            if split(line).is_some() {
                return Some(Construct::new(SyntaxKind::Element, at..end));
            }
            at = end;
        }
        None
    }

    fn heading(&self, out: &mut TokenSink, matched: &[u8], offset: usize, level: u8) -> usize {
        let title = String::from_utf8_lossy(matched);
        let title = title.trim_start_matches('#').trim();
        out.emit(
            Token::new(SyntaxKind::Heading, Span::new(offset, offset + matched.len()))
                .with_level(level)
                .with_params(vec![Param::new("name", Arc::new(Word(title.to_owned())))]),
        );
        offset + matched.len()
    }

    fn section_end(&self, out: &mut TokenSink, _: &[u8], offset: usize, level: u8) -> usize {
        out.emit(Token::new(SyntaxKind::SectionEnd, Span::empty(offset)).with_level(level));
        offset
    }

    fn element(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        let mut token = Token::new(SyntaxKind::Element, Span::new(offset, offset + matched.len()));
        if let Some((name, body)) = split(matched) {
            token = token.with_params(vec![
                Param::new("name", Arc::new(Word(name))),
                Param::new("value", parse_body(&body)),
            ]);
        }
        out.emit(token);
        offset + matched.len()
    }

    fn list_start(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn list_item(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn list_end(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn table_start(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn table_row(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn table_end(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn embed(&self, _: &mut TokenSink, _: &[u8], offset: usize) -> usize {
        offset
    }

    fn text(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        out.emit(Token::text(Span::new(offset, offset + matched.len())));
        offset + matched.len()
    }
}

/// Rendered value of `name` in `doc`, as a string.
pub fn shown<C>(doc: &livedoc::Document<C>, name: &str) -> Option<String> {
    doc.value(name).map(|v| v.to_string())
}

/// The element whose qualified name is `name`.
pub fn node<C>(doc: &livedoc::Document<C>, name: &str) -> Option<livedoc::NodeId> {
    let name = QualifiedName::parse(name);
    let tree = doc.tree();
    tree.elements()
        .into_iter()
        .find(|&id| tree.qualified_name(id) == name)
}

/// Every binding of `doc` with its rendered value, sorted.
pub fn values<C>(doc: &livedoc::Document<C>) -> Vec<(String, Option<String>)> {
    let table = doc.region().read().unwrap();
    let mut out: Vec<_> = table
        .bindings()
        .into_iter()
        .map(|(name, binding)| {
            (
                name.to_string(),
                binding.value.as_ref().map(|v| v.to_string()),
            )
        })
        .collect();
    // Same-named sibling sections give equal names in no fixed order.
    out.sort();
    out
}
