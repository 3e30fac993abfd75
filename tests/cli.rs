//! Integration tests for the command-line entry point.

use blockgraph_core::cli::Args;
use blockgraph_core::run_cli;
use clap::Parser;
use std::fs;
use tempfile::tempdir;

const DOC: &str = r#"<xml><block type="text_print" id="p" x="0" y="0"><value name="TEXT"><block type="text" id="t"><field name="TEXT">hello</field></block></value></block></xml>"#;

#[test]
fn input_defaults_to_input_xml() {
    let args = Args::parse_from(["blockgraph"]);
    assert_eq!(args.input.to_str(), Some("input.xml"));
    assert!(!args.json);
    assert!(!args.strict_types);
}

#[test]
fn emits_xml_and_json_copies() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.xml");
    let xml_out = dir.path().join("out.xml");
    let json_out = dir.path().join("out.json");
    fs::write(&input, DOC).unwrap();

    let args = Args::parse_from([
        "blockgraph",
        input.to_str().unwrap(),
        "--emit-xml",
        xml_out.to_str().unwrap(),
        "--emit-json",
        json_out.to_str().unwrap(),
    ]);
    run_cli(&args).unwrap();

    let xml = fs::read_to_string(&xml_out).unwrap();
    assert!(xml.contains("text_print"));
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&json_out).unwrap()).unwrap();
    assert_eq!(json["blocks"]["blocks"][0]["id"], "p");

    let again = Args::parse_from(["blockgraph", json_out.to_str().unwrap(), "--json"]);
    run_cli(&again).unwrap();
}

#[test]
fn missing_input_is_an_error() {
    let dir = tempdir().unwrap();
    let args = Args::parse_from(["blockgraph", dir.path().join("nope.xml").to_str().unwrap()]);
    let err = run_cli(&args).unwrap_err();
    assert!(err.to_string().contains("Input file not found"));
}

#[test]
fn strict_types_rejects_unknown_blocks() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.xml");
    fs::write(&input, r#"<xml><block type="mystery"/></xml>"#).unwrap();
    let lenient = Args::parse_from(["blockgraph", input.to_str().unwrap()]);
    run_cli(&lenient).unwrap();
    let strict = Args::parse_from(["blockgraph", input.to_str().unwrap(), "--strict-types"]);
    assert!(run_cli(&strict).is_err());
}
