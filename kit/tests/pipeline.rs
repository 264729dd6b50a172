//! End-to-end properties of the tokenize, diff, rebuild and propagate
//! pipeline.

mod common;

use common::{node, shown, Sheet};
use livedoc::{
    diff, tokenize, ChangeOp, CycleError, Document, PipelineConfig, PropagateError, QualifiedName,
    SyntaxKind, TextEdit,
};

fn open(text: &str) -> Document<Sheet> {
    Document::open("Doc", text, Sheet, PipelineConfig::DEFAULT)
        .unwrap()
        .0
}

#[test]
fn test_tokenize_is_deterministic() {
    let text = b"# Intro\nsome prose\na: 1\n## Deep\nb: {a}+2\n";
    let first = tokenize(text, 0, &Sheet).unwrap();
    let second = tokenize(text, 0, &Sheet).unwrap();
    assert_eq!(first.as_slice(), second.as_slice());
}

#[test]
fn test_token_dump() {
    let tokens = tokenize(b"# S\na: 1\nprose\nb: {a}\n", 0, &Sheet).unwrap();
    let dump: Vec<String> = tokens.iter().map(ToString::to_string).collect();
    insta::assert_snapshot!(dump.join("\n"), @r"
    Heading@0..4 name=S
    Element@4..9 name=a value=1
    Text@9..15
    Element@15..22 name=b value={a}
    SectionEnd@22..22
    ");
}

#[test]
fn test_diff_of_identical_sequences_is_empty() {
    let tokens = tokenize(b"# S\na: 1\nb: 2\n", 0, &Sheet).unwrap();
    assert!(diff(&tokens, &tokens, None).is_empty());
}

#[test]
fn test_two_line_scenario() {
    let (mut doc, report) =
        Document::open("Doc", "A: 1\nB: {A}+1\n", Sheet, PipelineConfig::DEFAULT).unwrap();
    let kinds: Vec<_> = doc.tokens().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![SyntaxKind::Element, SyntaxKind::Element]);
    assert!(report.propagation.is_ok());
    assert_eq!(shown(&doc, "A").as_deref(), Some("1"));
    assert_eq!(shown(&doc, "B").as_deref(), Some("2"));

    let a = node(&doc, "Doc.A").unwrap();
    let b = node(&doc, "Doc.B").unwrap();
    let report = doc.edit(TextEdit::new(3..4, "5")).unwrap();

    assert_eq!(report.changes.len(), 1);
    assert_eq!(report.changes.as_slice()[0].op, ChangeOp::Update);
    assert_eq!(report.rebuilt.updated, vec![a]);
    assert!(report.rebuilt.created.is_empty());
    assert!(report.rebuilt.removed.is_empty());
    // The second line was spliced back in, not re-lexed.
    assert_eq!(doc.tokens().cursor(), 1);
    assert_eq!(node(&doc, "Doc.B"), Some(b));
    assert_eq!(shown(&doc, "B").as_deref(), Some("6"));
}

#[test]
fn test_edits_keep_untouched_nodes() {
    let text = "# S\na: 1\nb: 2\n# T\nc: 3\nd: {S.b}\n";
    let mut doc = open(text);
    let before: Vec<_> = ["Doc.S.a", "Doc.S.b", "Doc.T.c", "Doc.T.d"]
        .iter()
        .map(|n| node(&doc, n).unwrap())
        .collect();

    // Replace `a`'s line with two lines.
    let report = doc.edit(TextEdit::new(4..9, "a: 7\nz: 0\n")).unwrap();
    assert_eq!(report.rebuilt.created.len(), 1);
    assert!(report.rebuilt.removed.is_empty());

    let after: Vec<_> = ["Doc.S.a", "Doc.S.b", "Doc.T.c", "Doc.T.d"]
        .iter()
        .map(|n| node(&doc, n).unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(shown(&doc, "S.a").as_deref(), Some("7"));
    assert_eq!(shown(&doc, "T.d").as_deref(), Some("2"));
}

#[test]
fn test_nested_scopes_shadow_and_qualify() {
    let doc = open(
        "# A\nx: 1\ny: {x}\n## B\nx: 2\n### C\nx: 3\nz: {x}\nw: {A.x}\nv: {B.x}\n",
    );
    assert_eq!(shown(&doc, "A.y").as_deref(), Some("1"));
    assert_eq!(shown(&doc, "A.B.C.z").as_deref(), Some("3"));
    assert_eq!(shown(&doc, "A.B.C.w").as_deref(), Some("1"));
    assert_eq!(shown(&doc, "A.B.C.v").as_deref(), Some("2"));
}

#[test]
fn test_acyclic_chain_reaches_fixpoint() {
    // Each element reads the one defined after it: the worst order.
    const N: usize = 12;
    let mut text = String::new();
    for i in (1..N).rev() {
        text.push_str(&format!("n{i}: {{n{}}}+1\n", i - 1));
    }
    text.push_str("n0: 0\n");

    let (mut doc, report) = Document::open("Doc", text, Sheet, PipelineConfig::DEFAULT).unwrap();
    let summary = report.propagation.unwrap();
    assert!(summary.passes <= N + 1, "took {} passes", summary.passes);
    assert!(summary.pending.is_empty());
    assert!(doc.tree().converged());
    assert_eq!(shown(&doc, &format!("n{}", N - 1)), Some((N - 1).to_string()));

    let again = doc.settle(&()).unwrap();
    assert_eq!(again.changed, 0);
}

#[test]
fn test_mutual_references_are_a_cycle() {
    let (doc, report) =
        Document::open("Doc", "x: {y}\ny: {x}\nz: 5\n", Sheet, PipelineConfig::DEFAULT).unwrap();
    assert_eq!(
        report.propagation,
        Err(PropagateError::Cycle(CycleError {
            members: vec![QualifiedName::parse("Doc.x"), QualifiedName::parse("Doc.y")],
        }))
    );
    assert_eq!(shown(&doc, "z").as_deref(), Some("5"));
    assert_eq!(shown(&doc, "x"), None);
}

#[test]
fn test_cycle_introduced_by_an_edit_is_detected() {
    let (mut doc, report) =
        Document::open("Doc", "x: 1\ny: {x}\n", Sheet, PipelineConfig::DEFAULT).unwrap();
    assert!(report.propagation.is_ok());
    assert_eq!(shown(&doc, "y").as_deref(), Some("1"));

    // `x: 1` -> `x: {y}`; both still hold 1 from before the edit.
    let report = doc.edit(TextEdit::new(3..4, "{y}")).unwrap();
    assert_eq!(
        report.propagation,
        Err(PropagateError::Cycle(CycleError {
            members: vec![QualifiedName::parse("Doc.x"), QualifiedName::parse("Doc.y")],
        }))
    );
    assert_eq!(shown(&doc, "x"), None);
    assert_eq!(shown(&doc, "y"), None);
}

#[test]
fn test_breaking_a_cycle_recovers() {
    let (mut doc, _) =
        Document::open("Doc", "x: {y}\ny: {x}\n", Sheet, PipelineConfig::DEFAULT).unwrap();
    // `y: {x}` -> `y: 4`
    let report = doc.edit(TextEdit::new(10..13, "4")).unwrap();
    assert!(report.propagation.is_ok());
    assert_eq!(shown(&doc, "x").as_deref(), Some("4"));
    assert_eq!(shown(&doc, "y").as_deref(), Some("4"));
}

#[test]
fn test_render_pass_follows_token_order() {
    let doc = open("# S\nprose\na: 2\nb: {a}+{missing}\n");
    let shown: Vec<String> = doc
        .render()
        .filter(|(token, _)| token.kind == SyntaxKind::Element)
        .map(|(_, rendered)| rendered.to_string())
        .collect();
    assert_eq!(shown, vec!["2", "#REF!(missing)"]);
    assert_eq!(doc.render().len(), doc.tokens().len());
}
