#![no_main]

use libfuzzer_sys::fuzz_target;
use livedoc::{Tokenizer, diff};
use md_calc::MdCalc;

fuzz_target!(|data: &[u8]| {
    let tokenizer = Tokenizer::new(MdCalc);
    let Ok(first) = tokenizer.tokenize(data, 0) else {
        return;
    };
    first.validate().unwrap();

    // Deterministic, and tiles the whole buffer.
    let second = tokenizer.tokenize(data, 0).unwrap();
    assert_eq!(first.as_slice(), second.as_slice());
    let end = first.iter().map(|t| t.span.end).max().unwrap_or(0);
    assert_eq!(end, data.len());

    assert!(diff(&first, &second, None).is_empty());
});
