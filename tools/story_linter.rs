/// Story Linter: compiles a story and reports errors, warnings and
/// passages no path can reach.
///
/// Usage: story_linter <story.bard> [--json <out.json|out.ron>]

use bard_engine::core::compiler::{CompileErrors, Compiler};
use bard_engine::schema::story::{ContentItem, StoryIr};
use rustc_hash::FxHashSet;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: story_linter <story.bard> [--json <out.json|out.ron>]");
        process::exit(0);
    }

    let story_path = Path::new(&args[1]);
    let mut ir_out = None;

    let mut i = 2;
    while i < args.len() {
        if args[i] == "--json" && i + 1 < args.len() {
            i += 1;
            ir_out = Some(args[i].clone());
        }
        i += 1;
    }

    let mut compiler = Compiler::new();
    let result = compiler.compile_file(story_path);

    println!("\n=== Story Lint Report ===\n");

    for warning in compiler.warnings() {
        println!("WARNING: {}", warning);
    }

    let story = match result {
        Ok(story) => story,
        Err(errors) => {
            print_errors(&errors);
            println!(
                "\nSummary: {} errors, {} warnings",
                errors.len(),
                compiler.warnings().len()
            );
            process::exit(1);
        }
    };

    let unreachable = unreachable_passages(&story);
    for id in &unreachable {
        println!("WARNING: passage '{}' is never reached from '{}'", id, story.initial_passage);
    }

    println!(
        "Compiled {} passages (start: '{}')",
        story.passages.len(),
        story.initial_passage
    );
    if let Some(title) = &story.metadata.title {
        println!("Title: {}", title);
    }

    if let Some(out) = ir_out {
        if let Err(e) = story.write(Path::new(&out)) {
            eprintln!("ERROR: Failed to write IR to '{}': {}", out, e);
            process::exit(1);
        }
        println!("Wrote IR to {}", out);
    }

    println!(
        "\nSummary: 0 errors, {} warnings",
        compiler.warnings().len() + unreachable.len()
    );
}

/// Errors with two lines of source context each. Sources are read once per file.
fn print_errors(errors: &CompileErrors) {
    let mut sources: Vec<(String, Option<String>)> = Vec::new();
    for error in errors.iter() {
        let source = match sources.iter().find(|(file, _)| *file == error.file) {
            Some((_, text)) => text.clone(),
            None => {
                let text = fs::read_to_string(&error.file).ok();
                sources.push((error.file.clone(), text.clone()));
                text
            }
        };
        println!("ERROR: {}", error);
        if let Some(text) = source {
            println!("{}", error.render_context(&text));
        } else if let Some(hint) = &error.hint {
            println!("  Hint: {}\n", hint);
        }
    }
}

/// Passages not reachable from the initial passage through jumps or choices.
fn unreachable_passages(story: &StoryIr) -> Vec<String> {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut queue = vec![story.initial_passage.clone()];
    while let Some(id) = queue.pop() {
        let Some(passage) = story.passage(&id) else {
            continue;
        };
        if !seen.insert(id) {
            continue;
        }
        passage.walk(|item| {
            if let ContentItem::Jump { target, .. } = item {
                queue.push(target.clone());
            }
        });
        for choice in passage.all_choices() {
            queue.push(choice.target.clone());
        }
    }
    story
        .passages
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect()
}
