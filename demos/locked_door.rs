/// Locked Door demo: plays a short story with a fixed list of choices.
///
/// Walks the hall, searches for the key, saves, opens the door, then loads
/// the save to show the session rewinding to the moment it was made.
///
/// Run with: cargo run --example locked_door

use bard_engine::core::compiler::Compiler;
use bard_engine::core::engine::Engine;
use bard_engine::core::save::SaveDocument;
use bard_engine::schema::output::Output;
use std::path::Path;

fn show(out: &Output) {
    println!("--- {} ---", out.passage_id);
    print!("{}", out.content);
    for (i, choice) in out.choices.iter().enumerate() {
        let marker = if choice.one_shot { '*' } else { '+' };
        println!("  {} {}. {}", marker, i + 1, choice.text);
    }
    for warning in &out.warnings {
        println!("  (warning in '{}': {})", warning.passage_id, warning.message);
    }
    println!();
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut compiler = Compiler::new();
    let story = compiler
        .compile_file(Path::new("tests/fixtures/door.bard"))
        .unwrap_or_else(|errors| {
            for error in errors.iter() {
                eprintln!("{}", error);
            }
            std::process::exit(1);
        });
    for warning in compiler.warnings() {
        eprintln!("warning: {}", warning);
    }

    let mut engine = Engine::builder(story).seed(7).build().expect("Failed to build engine");
    println!("=== {} ===\n", engine.metadata().title.as_deref().unwrap_or("Untitled"));

    show(engine.start().expect("Failed to start"));

    // Try the door, go back, search, go back.
    for index in [0, 0, 1, 0] {
        show(engine.choose(index).expect("Choice failed"));
    }

    let save = engine.save().expect("Failed to save");
    println!("Saved at '{}':\n{}\n", save.current_passage_id, save.to_json().expect("Failed to encode save"));

    // Try the door again, now unlocked, and step through.
    show(engine.choose(0).expect("Choice failed"));
    show(engine.choose(0).expect("Choice failed"));
    println!("Terminal: {}\n", engine.is_terminal());

    let json = save.to_json().expect("Failed to encode save");
    let report = engine
        .load(&SaveDocument::from_json(&json).expect("Failed to decode save"))
        .expect("Failed to load");
    for warning in &report.warnings {
        println!("load warning: {}", warning);
    }
    println!("Loaded the save.\n");
    show(engine.current().expect("Nothing to show"));
}
