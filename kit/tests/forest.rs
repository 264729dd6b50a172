//! Documents reading each other through a shared registry.

mod common;

use common::Sheet;
use livedoc::{Error, Forest, PipelineConfig, TextEdit};

fn shown(forest: &Forest<Sheet>, document: &str, name: &str) -> Option<String> {
    forest.value(document, name).map(|v| v.to_string())
}

#[test]
fn test_reads_across_documents() {
    let mut forest = Forest::new(Sheet, PipelineConfig::DEFAULT);
    forest.open("A", "x: 1\n").unwrap();
    forest.open("B", "y: {A.x}+1\n").unwrap();
    assert_eq!(shown(&forest, "B", "y").as_deref(), Some("2"));

    let version = forest.registry().version("A").unwrap();
    assert_eq!(
        forest.get("B").unwrap().reference_set(),
        vec![("A".to_owned(), version)]
    );
}

#[test]
fn test_editing_a_source_retriggers_readers() {
    let mut forest = Forest::new(Sheet, PipelineConfig::DEFAULT);
    forest.open("A", "x: 1\n").unwrap();
    forest.open("B", "y: {A.x}+1\n").unwrap();
    forest.open("C", "unrelated: 3\n").unwrap();

    let edit = forest.edit("A", TextEdit::new(3..4, "5")).unwrap();
    assert!(edit.report.propagation.is_ok());
    assert_eq!(edit.retriggered, vec!["B".to_owned()]);
    assert_eq!(shown(&forest, "B", "y").as_deref(), Some("6"));
}

#[test]
fn test_reader_opened_first_waits_for_its_source() {
    let mut forest = Forest::new(Sheet, PipelineConfig::DEFAULT);
    forest.open("B", "y: {A.x}+1\n").unwrap();
    assert!(forest.get("B").unwrap().has_pending());
    assert_eq!(shown(&forest, "B", "y"), None);

    forest.open("A", "x: 10\n").unwrap();
    assert!(!forest.get("B").unwrap().has_pending());
    assert_eq!(shown(&forest, "B", "y").as_deref(), Some("11"));
}

#[test]
fn test_closing_a_source_unbinds_its_readers() {
    let mut forest = Forest::new(Sheet, PipelineConfig::DEFAULT);
    forest.open("A", "x: 1\n").unwrap();
    forest.open("B", "y: {A.x}+1\n").unwrap();
    forest.close("A").unwrap();

    assert_eq!(forest.len(), 1);
    assert!(!forest.registry().contains("A"));
    assert_eq!(shown(&forest, "B", "y"), None);
    assert!(forest.get("B").unwrap().has_pending());
}

#[test]
fn test_names_are_unique() {
    let mut forest = Forest::new(Sheet, PipelineConfig::DEFAULT);
    forest.open("A", "x: 1\n").unwrap();
    assert_eq!(
        forest.open("A", "x: 2\n").unwrap_err(),
        Error::DocumentExists("A".into())
    );
    assert_eq!(
        forest.edit("Z", TextEdit::insert(0, "q")).unwrap_err(),
        Error::UnknownDocument("Z".into())
    );
    assert_eq!(forest.names().collect::<Vec<_>>(), vec!["A"]);
}
