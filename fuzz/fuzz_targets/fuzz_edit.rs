#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use livedoc::{Document, PipelineConfig, TextEdit, Tokenizer};
use md_calc::MdCalc;

fn values(doc: &Document<MdCalc>) -> Vec<(String, Option<Vec<u8>>)> {
    let Ok(table) = doc.region().read() else {
        return Vec::new();
    };
    let mut out: Vec<_> = table
        .bindings()
        .into_iter()
        .map(|(name, b)| (name.to_string(), b.value.as_ref().map(|v| v.serialize())))
        .collect();
    out.sort();
    out
}

#[derive(Debug, Arbitrary)]
struct Input {
    text: String,
    edits: Vec<(u16, u16, String)>,
}

fuzz_target!(|input: Input| {
    let config = PipelineConfig::DEFAULT.with_max_passes(64);
    let Ok((mut doc, _)) = Document::open("Fuzz", input.text, MdCalc, config) else {
        return;
    };
    let tokenizer = Tokenizer::new(MdCalc);

    for (a, b, replacement) in input.edits.into_iter().take(8) {
        let len = doc.text().len();
        let start = usize::from(a) % (len + 1);
        let end = (start + usize::from(b) % 16).min(len);
        if !doc.text().is_char_boundary(start) || !doc.text().is_char_boundary(end) {
            continue;
        }
        if doc.edit(TextEdit::new(start..end, replacement)).is_err() {
            return;
        }
        // Incremental tokens must match a fresh tokenization.
        let full = tokenizer.tokenize(doc.text().as_bytes(), 0).unwrap();
        assert_eq!(doc.tokens().as_slice(), full.as_slice());

        // And incremental bindings must match a fresh open, unless either
        // run gave up on convergence.
        let Ok((fresh, report)) = Document::open("Fuzz", doc.text(), MdCalc, config) else {
            return;
        };
        if report.propagation.is_ok() && doc.tree().converged() {
            assert_eq!(values(&doc), values(&fresh));
        }
    }
});
