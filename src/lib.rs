//! Bard Engine: compiler and runtime for branching interactive stories.
//!
//! Stories are written as passages of text, choices and jumps with small
//! embedded expressions and statements. The compiler turns source into a
//! serializable `StoryIr`; the `Engine` runs it, separating one-time
//! execute commands from repeatable rendering, and saves sessions
//! (including host-defined objects) to a portable JSON document.
//!
//! ```no_run
//! use bard_engine::core::compiler::compile;
//! use bard_engine::core::engine::Engine;
//!
//! let story = compile(":: Start\nHello.\n+ [Again] -> Start\n").unwrap();
//! let mut engine = Engine::new(story).unwrap();
//! println!("{}", engine.start().unwrap().content);
//! engine.choose(0).unwrap();
//! ```

pub mod core;
pub mod schema;

pub use crate::core::compiler::{compile, compile_file, CompileError, CompileErrors, Compiler};
pub use crate::core::engine::{Engine, EngineBuilder, EngineError, NavigationError};
pub use crate::core::host::{HostRegistry, TypeEntry};
pub use crate::core::save::{LoadReport, SaveDocument, SaveError};
pub use crate::schema::object::{Capability, Exportable, HostObject, ObjectValue, Reflectable};
pub use crate::schema::output::Output;
pub use crate::schema::story::StoryIr;
pub use crate::schema::value::{CallArgs, Value};
