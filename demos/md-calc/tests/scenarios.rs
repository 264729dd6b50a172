use livedoc::{Document, Owner, PipelineConfig, Rendered, Shape, SyntaxKind, TextEdit};
use md_calc::{open, MdCalc};

fn shown(doc: &Document<MdCalc>, name: &str) -> Option<String> {
    doc.value(name).map(|v| v.to_string())
}

#[test]
fn test_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<MdCalc>();
    assert_send_sync::<Document<MdCalc>>();
    assert_send_sync::<md_calc::Formula>();
}

#[test]
fn test_budget_recomputes_on_edit() {
    let src = "# Budget\nrent: 900\nfood: 300\ntotal: {rent}+{food}\n";
    let (mut doc, report) = open("Home", src).unwrap();
    assert!(report.propagation.is_ok());
    assert_eq!(shown(&doc, "Budget.total").as_deref(), Some("1200"));

    // 900 -> 950
    let at = src.find("900").unwrap();
    let report = doc.edit(TextEdit::new(at..at + 3, "950")).unwrap();
    assert_eq!(report.rebuilt.updated.len(), 1);
    assert_eq!(shown(&doc, "Budget.total").as_deref(), Some("1250"));
}

#[test]
fn test_table_is_a_matrix_with_ragged_rows() {
    let (doc, _) = open("T", "| a | b | c |\n| d | e |\n").unwrap();
    let tree = doc.tree();
    let table = tree
        .owners()
        .iter()
        .find_map(|owner| match owner {
            Owner::Row { table, .. } => Some(*table),
            _ => None,
        })
        .unwrap();

    assert_eq!(tree.shape(table), Some(Shape::new(2, 3)));
    assert_eq!(tree.cell(table, 1, 2), None);
    let e = tree.cell(table, 1, 1).unwrap();
    let value = tree.element(e).and_then(|el| el.state.value()).unwrap();
    assert_eq!(value.to_string(), "e");
}

#[test]
fn test_list_items_are_elements() {
    let (doc, _) = open("L", "- 1\n- n: 2\n- {n}*3\n").unwrap();
    let rendered: Vec<String> = doc
        .render()
        .filter(|(token, _)| token.kind == SyntaxKind::ListItem)
        .map(|(_, r)| r.to_string())
        .collect();
    assert_eq!(rendered, vec!["1", "2", "6"]);
    // Names defined inside a list are scoped to it.
    assert_eq!(shown(&doc, "n"), None);
}

#[test]
fn test_embeds_show_values_without_defining_them() {
    let (doc, _) = open("E", "# S\nx: 4\n![[S.x]]\n").unwrap();
    let embeds: Vec<Rendered> = doc
        .render()
        .filter(|(token, _)| token.kind == SyntaxKind::Embed)
        .map(|(_, r)| r)
        .collect();
    assert_eq!(embeds.len(), 1);
    assert_eq!(embeds[0].to_string(), "4");
    assert_eq!(doc.tree().elements().len(), 2);
}

#[test]
fn test_text_concatenation() {
    let (doc, _) = open("S", "first: \"Ada\"\nlast: \"Lovelace\"\nfull: {first} + \" \" + {last}\n")
        .unwrap();
    assert_eq!(shown(&doc, "full").as_deref(), Some("Ada Lovelace"));
}

#[test]
fn test_moving_an_element_between_sections() {
    let src = "# A\nx: 1\n# B\ny: {x}\n";
    let (mut doc, _) = open("M", src).unwrap();
    assert_eq!(shown(&doc, "B.y"), None);

    // Pull `y` up into section A.
    let at = src.find("# B\n").unwrap();
    doc.edit(TextEdit::delete(at..at + 4)).unwrap();
    assert_eq!(shown(&doc, "A.y").as_deref(), Some("1"));
}

#[test]
fn test_cross_document_values_through_a_forest() {
    let mut forest = livedoc::Forest::new(MdCalc, PipelineConfig::DEFAULT);
    forest.open("Rates", "tax: 0.5\n").unwrap();
    forest.open("Bill", "net: 10\ngross: {net} * (1 + {Rates.tax})\n").unwrap();
    assert_eq!(
        forest.value("Bill", "gross").map(|v| v.to_string()).as_deref(),
        Some("15")
    );

    forest.edit("Rates", TextEdit::new(5..8, "0.25")).unwrap();
    assert_eq!(
        forest.value("Bill", "gross").map(|v| v.to_string()).as_deref(),
        Some("12.5")
    );
}

#[test]
fn test_failure_found_in_a_later_pass_is_an_error_not_unresolved() {
    // `y` only fails once `z` has a value, a pass after `x` read it.
    let (doc, report) = open("P", "x: {y}\ny: {z}*2\nz: a\n").unwrap();
    assert!(report.propagation.is_ok());
    let rendered: Vec<Rendered> = doc.render().map(|(_, r)| r).collect();
    assert_eq!(
        rendered[..2],
        [
            Rendered::Failed("`y` has no value".to_owned()),
            Rendered::Failed("cannot apply `*` to text".to_owned()),
        ]
    );
    assert!(!doc.has_pending());
}
