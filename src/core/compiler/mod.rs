//! Story compiler: `.bard` source → `StoryIr`.
//!
//! Compilation runs in three stages. `preprocess` resolves `@include`s and
//! top-of-file imports into a flat list of located lines. `parser` walks
//! those lines with a block stack, building passages. `validate` resolves
//! jump targets, checks call arity, picks the initial passage and tidies
//! whitespace. Errors are collected across all stages, not reported one at
//! a time.

pub mod parser;
pub mod preprocess;
pub mod validate;

use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::core::script::{Interpreter, ScriptHost};
use crate::schema::story::{StoryIr, IR_VERSION};

/// File label used when compiling a source string.
pub const INLINE_SOURCE: &str = "<source>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileErrorKind {
    /// Malformed line syntax (choices, jumps, headers, directives).
    Syntax,
    /// Unbalanced or misplaced control blocks.
    Block,
    /// Embedded expression or statement that does not parse.
    Expression,
    /// Jump or choice to a passage that does not exist.
    UnknownTarget,
    /// Jump or choice arguments that do not fit the target's parameters.
    Arity,
    Include,
    Import,
    /// Story-level problems: no passages, bad `@start`.
    Story,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Syntax => "syntax error",
            Self::Block => "block error",
            Self::Expression => "expression error",
            Self::UnknownTarget => "unknown target",
            Self::Arity => "argument error",
            Self::Include => "include error",
            Self::Import => "import error",
            Self::Story => "story error",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind} in {file} on line {line}: {message}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub file: String,
    /// 1-based.
    pub line: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, file: &str, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.to_string(),
            line,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Two lines of context either side of the error, with a pointer under
    /// the offending line. `source` is the text of `self.file`.
    pub fn render_context(&self, source: &str) -> String {
        let lines: Vec<&str> = source.lines().collect();
        let mut out = format!("{}\n  {}\n\n", self.kind, self.message);
        if self.line == 0 || self.line > lines.len() {
            return out;
        }
        let idx = self.line - 1;
        let start = idx.saturating_sub(2);
        let end = (idx + 3).min(lines.len());
        for (i, text) in lines.iter().enumerate().take(end).skip(start) {
            let marker = format!("  {:4} | ", i + 1);
            out.push_str(&marker);
            out.push_str(text);
            out.push('\n');
            if i == idx {
                let indent = text.len() - text.trim_start().len();
                let width = text.trim().chars().count().clamp(1, 60);
                out.push_str(&" ".repeat(marker.len() + indent));
                out.push_str(&"^".repeat(width));
                out.push('\n');
            }
        }
        if let Some(hint) = &self.hint {
            out.push_str(&format!("\n  Hint: {}\n", hint));
        }
        out
    }
}

/// All errors found in one compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_kind(&self, kind: CompileErrorKind) -> bool {
        self.0.iter().any(|e| e.kind == kind)
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} compile error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

/// Errors and warnings gathered while compiling.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub errors: Vec<CompileError>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn error(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    pub fn warn(&mut self, message: String) {
        log::warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct Compiler {
    script: Box<dyn ScriptHost>,
    warnings: Vec<String>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_script_host(Box::new(Interpreter::new()))
    }

    /// Validate embedded expressions with a different sublanguage host.
    pub fn with_script_host(script: Box<dyn ScriptHost>) -> Self {
        Self {
            script,
            warnings: Vec::new(),
        }
    }

    /// Non-fatal findings from the last compilation.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Compile a source string. `@include` paths resolve against the
    /// current directory.
    pub fn compile(&mut self, source: &str) -> Result<StoryIr, CompileErrors> {
        let mut diag = Diagnostics::default();
        let unit = preprocess::load_source(source, INLINE_SOURCE, Path::new("."), &mut diag);
        self.finish(unit, diag)
    }

    pub fn compile_file(&mut self, path: &Path) -> Result<StoryIr, CompileErrors> {
        let mut diag = Diagnostics::default();
        let unit = preprocess::load_file(path, &mut diag);
        self.finish(unit, diag)
    }

    fn finish(&mut self, unit: preprocess::Unit, mut diag: Diagnostics) -> Result<StoryIr, CompileErrors> {
        let parsed = parser::parse_lines(&unit.lines, self.script.as_ref(), &mut diag);
        let mut story = StoryIr {
            version: IR_VERSION.to_string(),
            initial_passage: String::new(),
            metadata: parsed.metadata,
            imports: unit.imports,
            passages: Default::default(),
        };
        validate::assemble(&mut story, parsed.passages, parsed.start, &mut diag);

        self.warnings = diag.warnings;
        if diag.errors.is_empty() {
            log::debug!(
                "compiled {} passage(s), initial passage '{}'",
                story.passages.len(),
                story.initial_passage
            );
            Ok(story)
        } else {
            diag.errors.sort_by(|a, b| (&a.file, a.line).cmp(&(&b.file, b.line)));
            Err(CompileErrors(diag.errors))
        }
    }
}

/// Compile a source string with the default interpreter.
pub fn compile(source: &str) -> Result<StoryIr, CompileErrors> {
    Compiler::new().compile(source)
}

pub fn compile_file(path: &Path) -> Result<StoryIr, CompileErrors> {
    Compiler::new().compile_file(path)
}
