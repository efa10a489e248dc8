//! Exercises real file-based `include` resolution end to end: `main.wisp` includes `lib.wisp`
//! twice, so `greet` must be defined exactly once and called exactly once.

use std::path::Path;

#[test]
fn duplicate_include_is_spliced_exactly_once() {
    let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/main.wisp"));

    let mut out = Vec::new();
    wisp::compile_and_run(path, &mut out).expect("demos/main.wisp should compile and run");

    assert_eq!(String::from_utf8(out).unwrap(), "hi\n");
}
