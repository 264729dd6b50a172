//! Line-oriented markdown-like grammar.
//!
//! | Line | Construct |
//! |------|-----------|
//! | `## Title` | heading, level = number of `#` |
//! | `name: value` | element |
//! | `- value` / `- name: value` | list item, opening a list if needed |
//! | `\| a \| b \|` | table row, opening a table if needed |
//! | `\|---\|---\|` | separator inside a table (text) |
//! | `![[Doc.name]]` | embed |
//!
//! Any other line is prose. Lists and tables end at the first line that
//! does not continue them; a section ends before the next heading of the
//! same or a shallower level.

use std::sync::Arc;

use livedoc::{
    Construct, OpenContainer, Param, RendererCapability, Span, SyntaxKind, Token, TokenSink,
};

use crate::expr::Expr;
use crate::value::{parse_value, Formula, Text};

/// The md-calc grammar. Stateless; every decision is a function of the
/// buffer and the open containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdCalc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Heading(u8),
    Element,
    Item,
    Row,
    Separator,
    Embed,
    Prose,
}

fn line_end(buffer: &[u8], offset: usize) -> usize {
    buffer[offset..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(buffer.len(), |i| offset + i + 1)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Splits `name: value`. The name must be an identifier.
fn split_element(line: &[u8]) -> Option<(&str, &str)> {
    let line = core::str::from_utf8(trim_newline(line)).ok()?;
    let (name, value) = line.split_once(':')?;
    let name = name.trim_end();
    let mut bytes = name.bytes();
    if !bytes.next().is_some_and(is_ident_start) || !bytes.all(is_ident) {
        return None;
    }
    Some((name, value))
}

fn heading_level(line: &[u8]) -> Option<u8> {
    let hashes = line.iter().take_while(|&&b| b == b'#').count();
    if (1..=6).contains(&hashes) && matches!(line.get(hashes), Some(b' ') | Some(b'\t')) {
        u8::try_from(hashes).ok()
    } else {
        None
    }
}

fn classify(line: &[u8]) -> Line {
    let content = trim_newline(line);
    if let Some(level) = heading_level(content) {
        return Line::Heading(level);
    }
    if content.starts_with(b"- ") || content == b"-" {
        return Line::Item;
    }
    if content.starts_with(b"|") {
        let separator = content
            .iter()
            .all(|b| matches!(b, b'|' | b'-' | b':' | b' '))
            && content.contains(&b'-');
        return if separator { Line::Separator } else { Line::Row };
    }
    let trimmed = content.trim_ascii();
    if trimmed.starts_with(b"![[") && trimmed.ends_with(b"]]") {
        return Line::Embed;
    }
    if split_element(content).is_some() {
        return Line::Element;
    }
    Line::Prose
}

/// The closer for `top` if `line` does not continue it.
fn closer_for(top: Option<&OpenContainer>, line: Line) -> Option<SyntaxKind> {
    let top = top?;
    let kind = match (top.kind, line) {
        (SyntaxKind::ListStart, Line::Item) => return None,
        (SyntaxKind::ListStart, _) => SyntaxKind::ListEnd,
        (SyntaxKind::TableStart, Line::Row | Line::Separator) => return None,
        (SyntaxKind::TableStart, _) => SyntaxKind::TableEnd,
        (SyntaxKind::Heading, Line::Heading(level)) if top.level >= level => {
            SyntaxKind::SectionEnd
        }
        _ => return None,
    };
    Some(kind)
}

fn cells(line: &[u8]) -> Vec<String> {
    let line = String::from_utf8_lossy(trim_newline(line)).into_owned();
    let inner = line.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|c| c.trim().to_owned()).collect()
}

fn element_params(name: &str, value: &str) -> Vec<Param> {
    vec![
        Param::new("name", Arc::new(Text(name.to_owned()))),
        Param::new("value", parse_value(value)),
    ]
}

fn span(offset: usize, matched: &[u8]) -> Span {
    Span::new(offset, offset + matched.len())
}

impl MdCalc {
    fn zero_width(&self, out: &mut TokenSink, kind: SyntaxKind, offset: usize, level: u8) -> usize {
        out.emit(Token::new(kind, Span::empty(offset)).with_level(level));
        offset
    }
}

impl RendererCapability for MdCalc {
    fn scan(&self, buffer: &[u8], offset: usize, open: &[OpenContainer]) -> Option<Construct> {
        let top = open.last();
        let mut at = offset;
        while at < buffer.len() {
            let end = line_end(buffer, at);
            let line = classify(&buffer[at..end]);
            if let Some(closer) = closer_for(top, line) {
                let level = top.map_or(0, |t| t.level);
                return Some(Construct::new(closer, at..at).with_level(level));
            }
            let in_list = top.is_some_and(|t| t.kind == SyntaxKind::ListStart);
            let in_table = top.is_some_and(|t| t.kind == SyntaxKind::TableStart);
            let construct = match line {
                Line::Heading(level) => Construct::new(SyntaxKind::Heading, at..end).with_level(level),
                Line::Element => Construct::new(SyntaxKind::Element, at..end),
                Line::Item if in_list => Construct::new(SyntaxKind::ListItem, at..end),
                Line::Item => Construct::new(SyntaxKind::ListStart, at..at),
                Line::Row if in_table => Construct::new(SyntaxKind::TableRow, at..end),
                Line::Row => Construct::new(SyntaxKind::TableStart, at..at),
                Line::Separator if in_table => Construct::new(SyntaxKind::Text, at..end),
                Line::Embed => Construct::new(SyntaxKind::Embed, at..end),
                Line::Separator | Line::Prose => {
                    at = end;
                    continue;
                }
            };
            return Some(construct);
        }
        None
    }

    fn heading(&self, out: &mut TokenSink, matched: &[u8], offset: usize, level: u8) -> usize {
        let content = String::from_utf8_lossy(trim_newline(matched)).into_owned();
        let title = content.trim_start_matches('#').trim();
        let mut token = Token::new(SyntaxKind::Heading, span(offset, matched)).with_level(level);
        if !title.is_empty() {
            token = token.with_params(vec![Param::new("name", Arc::new(Text(title.to_owned())))]);
        }
        out.emit(token);
        offset + matched.len()
    }

    fn section_end(&self, out: &mut TokenSink, _matched: &[u8], offset: usize, level: u8) -> usize {
        self.zero_width(out, SyntaxKind::SectionEnd, offset, level)
    }

    fn element(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        let mut token = Token::new(SyntaxKind::Element, span(offset, matched));
        if let Some((name, value)) = split_element(matched) {
            token = token.with_params(element_params(name, value));
        }
        out.emit(token);
        offset + matched.len()
    }

    fn list_start(&self, out: &mut TokenSink, _matched: &[u8], offset: usize) -> usize {
        self.zero_width(out, SyntaxKind::ListStart, offset, 0)
    }

    fn list_item(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        let content = trim_newline(matched);
        let body = content.strip_prefix(b"-").unwrap_or(content).trim_ascii_start();
        let params = match split_element(body) {
            Some((name, value)) => element_params(name, value),
            None => vec![Param::new(
                "value",
                parse_value(&String::from_utf8_lossy(body)),
            )],
        };
        out.emit(Token::new(SyntaxKind::ListItem, span(offset, matched)).with_params(params));
        offset + matched.len()
    }

    fn list_end(&self, out: &mut TokenSink, _matched: &[u8], offset: usize) -> usize {
        self.zero_width(out, SyntaxKind::ListEnd, offset, 0)
    }

    fn table_start(&self, out: &mut TokenSink, _matched: &[u8], offset: usize) -> usize {
        self.zero_width(out, SyntaxKind::TableStart, offset, 0)
    }

    fn table_row(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        let params = cells(matched)
            .iter()
            .map(|cell| Param::new("cell", parse_value(cell)))
            .collect();
        out.emit(Token::new(SyntaxKind::TableRow, span(offset, matched)).with_params(params));
        offset + matched.len()
    }

    fn table_end(&self, out: &mut TokenSink, _matched: &[u8], offset: usize) -> usize {
        self.zero_width(out, SyntaxKind::TableEnd, offset, 0)
    }

    fn embed(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        let content = String::from_utf8_lossy(trim_newline(matched)).into_owned();
        let target = content
            .trim()
            .trim_start_matches("![[")
            .trim_end_matches("]]")
            .trim();
        let name = livedoc::QualifiedName::parse(target);
        let formula = Formula::new(format!("{{{name}}}"), Expr::Ref(name));
        out.emit(
            Token::new(SyntaxKind::Embed, span(offset, matched))
                .with_params(vec![Param::new("value", Arc::new(formula))]),
        );
        offset + matched.len()
    }

    fn text(&self, out: &mut TokenSink, matched: &[u8], offset: usize) -> usize {
        out.emit(Token::text(span(offset, matched)));
        offset + matched.len()
    }
}
