/// Compiler integration tests: source files to IR.

use bard_engine::core::compiler::{compile, compile_file, CompileErrorKind, Compiler};
use bard_engine::schema::story::{ContentItem, StoryIr};
use std::path::Path;

fn fixture(name: &str) -> StoryIr {
    compile_file(&Path::new("tests/fixtures").join(name)).unwrap()
}

#[test]
fn door_fixture_compiles_with_metadata_and_tags() {
    let story = fixture("door.bard");
    assert_eq!(story.initial_passage, "Intro");
    assert_eq!(story.metadata.title.as_deref(), Some("The Locked Door"));
    assert_eq!(story.metadata.identity(), "locked_door");
    assert_eq!(story.passages.len(), 5);

    let start = story.passage("Start").unwrap();
    assert_eq!(start.tags, vec!["HALL"]);

    let door = story.passage("Door").unwrap();
    assert_eq!(door.choices.len(), 2);
    assert_eq!(door.choices[0].guard.as_deref(), Some("hasKey == True"));
    assert_eq!(door.choices[0].tags, vec!["UNLOCK"]);
    assert_eq!(door.choices[0].key, "Door#0");
    assert!(matches!(door.content[0], ContentItem::Conditional { ref branches } if branches.len() == 2));
}

#[test]
fn includes_resolve_relative_to_the_including_file() {
    let story = fixture("tarot.bard");
    for id in ["Start", "Table", "Draw", "Leave"] {
        assert!(story.passage(id).is_some(), "missing passage {}", id);
    }
    assert_eq!(story.imports.len(), 1);
    assert_eq!(story.imports[0].module, "tarot");
    assert_eq!(story.imports[0].names.len(), 2);
    assert_eq!(story.initial_passage, "Start");
}

#[test]
fn duplicate_passages_last_write_wins() {
    let mut compiler = Compiler::new();
    let story = compiler
        .compile_file(Path::new("tests/fixtures/includes/dup_main.bard"))
        .unwrap();
    assert_eq!(
        story.passage("Start").unwrap().content,
        vec![ContentItem::Text("Second version.\n".to_string())]
    );
    assert!(compiler.warnings().iter().any(|w| w.contains("redefined")));
}

#[test]
fn circular_includes_are_errors() {
    let errors = compile_file(Path::new("tests/fixtures/includes/cycle_a.bard")).unwrap_err();
    assert!(errors.has_kind(CompileErrorKind::Include));
    assert!(errors.iter().any(|e| e.message.contains("circular include")));
}

#[test]
fn errors_are_collected_and_sorted() {
    let errors = compile_file(Path::new("tests/fixtures/broken.bard")).unwrap_err();
    let lines: Vec<usize> = errors.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![2, 3, 5, 6, 7, 10]);
    assert!(errors.has_kind(CompileErrorKind::Syntax));
    assert!(errors.has_kind(CompileErrorKind::Block));
    assert!(errors.has_kind(CompileErrorKind::UnknownTarget));
    assert!(errors.has_kind(CompileErrorKind::Arity));

    let source = std::fs::read_to_string("tests/fixtures/broken.bard").unwrap();
    let report = errors.0[1].render_context(&source);
    assert!(report.contains("   3 | @if ready"));
    assert!(report.contains("Hint:"));
}

#[test]
fn format_specs_are_split_only_when_valid() {
    let story = fixture("formatting.bard");
    let mut expressions = Vec::new();
    story.passage("Start").unwrap().walk(|item| {
        if let ContentItem::Expression { code, format } = item {
            expressions.push((code.clone(), format.clone()));
        }
    });
    let find = |code: &str| {
        expressions
            .iter()
            .find(|(c, _)| c == code)
            .map(|(_, f)| f.clone())
            .unwrap_or_else(|| panic!("no expression {}", code))
    };
    assert_eq!(find("x"), Some(".2f".to_string()));
    assert_eq!(find("a==b"), None);
    assert_eq!(find("items[1:3]"), None);
    assert_eq!(find("prices['shield']"), Some(",".to_string()));
}

#[test]
fn glue_and_comments() {
    let story = compile(":: Start\nOne <>\ntwo. // aside\nhttp:\\//example\n").unwrap();
    assert_eq!(
        story.passage("Start").unwrap().content,
        vec![ContentItem::Text("One two.\nhttp://example\n".to_string())]
    );
}

#[test]
fn ir_survives_json_and_ron() {
    let story = fixture("door.bard");
    assert_eq!(StoryIr::from_json(&story.to_json().unwrap()).unwrap(), story);
    assert_eq!(StoryIr::from_ron(&story.to_ron().unwrap()).unwrap(), story);
}

#[test]
fn unknown_directive_lists_alternatives() {
    let errors = compile(":: Start\n@iff x:\n").unwrap_err();
    let hint = errors.0[0].hint.clone().unwrap();
    assert!(hint.contains("@if"));
    assert!(hint.contains("@render"));
}
