/// Include resolution and top-of-file imports.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{CompileError, CompileErrorKind, Diagnostics};
use crate::schema::story::{ImportDecl, ImportName};

/// One source line after include expansion, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub file: Arc<str>,
    /// 1-based.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Default)]
pub(crate) struct Unit {
    pub lines: Vec<SourceLine>,
    pub imports: Vec<ImportDecl>,
}

pub(crate) fn load_file(path: &Path, diag: &mut Diagnostics) -> Unit {
    let mut unit = Unit::default();
    let label = path.display().to_string();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            diag.error(CompileError::new(
                CompileErrorKind::Include,
                &label,
                0,
                format!("cannot read story file: {}", err),
            ));
            return unit;
        }
    };
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut stack = vec![canonical];
    expand(&text, &label, &dir, &mut stack, &mut unit, diag);
    unit
}

pub(crate) fn load_source(source: &str, label: &str, dir: &Path, diag: &mut Diagnostics) -> Unit {
    let mut unit = Unit::default();
    let mut stack = Vec::new();
    expand(source, label, dir, &mut stack, &mut unit, diag);
    unit
}

fn expand(
    text: &str,
    label: &str,
    dir: &Path,
    stack: &mut Vec<PathBuf>,
    unit: &mut Unit,
    diag: &mut Diagnostics,
) {
    let file: Arc<str> = Arc::from(label);
    let mut in_header = true;
    let mut in_passage = false;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let raw = raw.trim_end_matches('\r');
        let trimmed = raw.trim();

        if !in_passage {
            if let Some(parsed) = parse_import(trimmed, line_no) {
                match parsed {
                    Ok(decls) if in_header => unit.imports.extend(decls),
                    Ok(_) => diag.error(
                        CompileError::new(
                            CompileErrorKind::Import,
                            label,
                            line_no,
                            "imports must appear at the top of the file",
                        )
                        .with_hint("move this line above @metadata, @include and the first passage"),
                    ),
                    Err(message) => diag.error(CompileError::new(
                        CompileErrorKind::Import,
                        label,
                        line_no,
                        message,
                    )),
                }
                continue;
            }
        }
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            in_header = false;
        }
        if trimmed.starts_with("::") {
            in_passage = true;
        }

        if let Some(rest) = directive_arg(trimmed, "@include") {
            include(rest, label, line_no, dir, stack, unit, diag);
            continue;
        }

        unit.lines.push(SourceLine {
            file: Arc::clone(&file),
            line: line_no,
            text: raw.to_string(),
        });
    }
}

/// `@name rest` → `Some(rest)`; also matches a bare `@name`.
pub(crate) fn directive_arg<'a>(trimmed: &'a str, name: &str) -> Option<&'a str> {
    let rest = trimmed.strip_prefix(name)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn include(
    spec: &str,
    label: &str,
    line_no: usize,
    dir: &Path,
    stack: &mut Vec<PathBuf>,
    unit: &mut Unit,
    diag: &mut Diagnostics,
) {
    let spec = spec.trim_matches(|c| c == '"' || c == '\'');
    if spec.is_empty() {
        diag.error(
            CompileError::new(CompileErrorKind::Include, label, line_no, "@include needs a path")
                .with_hint("write @include path/to/file.bard"),
        );
        return;
    }
    let full = dir.join(spec);
    let canonical = match full.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            diag.error(CompileError::new(
                CompileErrorKind::Include,
                label,
                line_no,
                format!("include file not found: {}", full.display()),
            ));
            return;
        }
    };
    if stack.contains(&canonical) {
        let chain: Vec<String> = stack
            .iter()
            .chain(std::iter::once(&canonical))
            .map(|p| p.display().to_string())
            .collect();
        diag.error(CompileError::new(
            CompileErrorKind::Include,
            label,
            line_no,
            format!("circular include: {}", chain.join(" -> ")),
        ));
        return;
    }
    let text = match fs::read_to_string(&canonical) {
        Ok(text) => text,
        Err(err) => {
            diag.error(CompileError::new(
                CompileErrorKind::Include,
                label,
                line_no,
                format!("cannot read {}: {}", full.display(), err),
            ));
            return;
        }
    };
    let child_dir = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    let child_label = full.display().to_string();
    stack.push(canonical);
    expand(&text, &child_label, &child_dir, stack, unit, diag);
    stack.pop();
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_module_path(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_identifier)
}

/// `import a, b.c` or `from m import A, B as C`. Returns `None` when the line
/// is not an import at all.
fn parse_import(trimmed: &str, line: usize) -> Option<Result<Vec<ImportDecl>, String>> {
    if let Some(rest) = trimmed.strip_prefix("import ") {
        let mut decls = Vec::new();
        for module in rest.split(',').map(str::trim) {
            if !is_module_path(module) {
                return Some(Err(format!("invalid module name '{}'", module)));
            }
            decls.push(ImportDecl {
                module: module.to_string(),
                names: Vec::new(),
                line,
            });
        }
        return Some(Ok(decls));
    }

    let rest = trimmed.strip_prefix("from ")?;
    let (module, names) = rest.split_once(" import ")?;
    let module = module.trim();
    if !is_module_path(module) {
        return Some(Err(format!("invalid module name '{}'", module)));
    }
    let names = names.trim().trim_start_matches('(').trim_end_matches(')');
    let mut imported = Vec::new();
    for item in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut words = item.split_whitespace();
        let import = match (words.next(), words.next(), words.next(), words.next()) {
            (Some(name), None, None, None) => ImportName {
                name: name.to_string(),
                alias: None,
            },
            (Some(name), Some("as"), Some(alias), None) => ImportName {
                name: name.to_string(),
                alias: Some(alias.to_string()),
            },
            _ => return Some(Err(format!("cannot parse import '{}'", item))),
        };
        if !is_identifier(&import.name) || !import.alias.as_deref().map_or(true, is_identifier) {
            return Some(Err(format!("cannot parse import '{}'", item)));
        }
        imported.push(import);
    }
    if imported.is_empty() {
        return Some(Err(format!("nothing imported from '{}'", module)));
    }
    Some(Ok(vec![ImportDecl {
        module: module.to_string(),
        names: imported,
        line,
    }]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(text: &str) -> (Unit, Diagnostics) {
        let mut diag = Diagnostics::default();
        let unit = load_source(text, "<test>", Path::new("."), &mut diag);
        (unit, diag)
    }

    #[test]
    fn imports_are_collected_from_the_header() {
        let (unit, diag) = source("# tarot story\nimport dice\nfrom tarot import Card, Deck as D\n\n:: Start\nHi");
        assert!(diag.errors.is_empty());
        assert_eq!(unit.imports.len(), 2);
        assert_eq!(unit.imports[1].names[1].bound_name(), "D");
        assert_eq!(unit.lines.len(), 4);
        assert_eq!(unit.lines[2].line, 5);
    }

    #[test]
    fn late_imports_are_errors_but_prose_is_not() {
        let (_, diag) = source("@metadata\n  title: X\nimport dice\n:: Start\nfrom the hills import nothing");
        assert_eq!(diag.errors.len(), 1);
        assert_eq!(diag.errors[0].line, 3);
    }

    #[test]
    fn missing_include_is_reported() {
        let (_, diag) = source(":: Start\n@include does/not/exist.bard\n");
        assert_eq!(diag.errors.len(), 1);
        assert_eq!(diag.errors[0].kind, CompileErrorKind::Include);
    }

    #[test]
    fn directive_arg_requires_word_boundary() {
        assert_eq!(directive_arg("@include a.bard", "@include"), Some("a.bard"));
        assert_eq!(directive_arg("@includes", "@include"), None);
        assert_eq!(directive_arg("@else", "@else"), Some(""));
    }
}
