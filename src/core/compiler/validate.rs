/// Whole-story checks run after parsing: passage table, initial passage,
/// target resolution, call arity and whitespace cleanup.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

use super::parser::{ParsedPassage, StartDecl};
use super::{CompileError, CompileErrorKind, Diagnostics, INLINE_SOURCE};
use crate::schema::story::{Arg, ContentItem, Param, StoryIr, NAMESPACE_SEPARATOR};

/// Conventional initial passage when no `@start` is given.
pub const DEFAULT_START: &str = "Start";

pub(crate) fn assemble(
    story: &mut StoryIr,
    passages: Vec<ParsedPassage>,
    start: Option<StartDecl>,
    diag: &mut Diagnostics,
) {
    let mut files: FxHashMap<String, Arc<str>> = FxHashMap::default();
    for parsed in passages {
        let id = parsed.passage.id.clone();
        if story.passages.contains_key(&id) {
            diag.warn(format!(
                "passage '{}' is redefined in {} on line {}; the later definition is used",
                id, parsed.file, parsed.line
            ));
        }
        files.insert(id.clone(), parsed.file);
        story.passages.insert(id, parsed.passage);
    }

    if story.passages.is_empty() {
        let (file, line) = start
            .as_ref()
            .map_or((INLINE_SOURCE.to_string(), 0), |s| (s.file.to_string(), s.line));
        diag.error(
            CompileError::new(CompileErrorKind::Story, &file, line, "story has no passages")
                .with_hint("start a passage with :: Name"),
        );
        return;
    }

    story.initial_passage = match start {
        Some(decl) if story.passages.contains_key(&decl.target) => decl.target,
        Some(decl) => {
            diag.error(CompileError::new(
                CompileErrorKind::Story,
                &decl.file,
                decl.line,
                format!("@start names unknown passage '{}'", decl.target),
            ));
            decl.target
        }
        None if story.passages.contains_key(DEFAULT_START) => DEFAULT_START.to_string(),
        None => {
            let first = story.passages.keys().next().cloned().unwrap_or_default();
            diag.warn(format!(
                "no @start directive or '{}' passage; beginning at '{}'",
                DEFAULT_START, first
            ));
            first
        }
    };

    let ids: FxHashSet<String> = story.passages.keys().cloned().collect();
    let signatures: FxHashMap<String, Vec<Param>> = story
        .passages
        .iter()
        .map(|(id, p)| (id.clone(), p.params.clone()))
        .collect();

    for passage in story.passages.values_mut() {
        let namespace = passage.namespace().map(str::to_string);
        let file = files.get(&passage.id).map_or(INLINE_SOURCE, |f| f.as_ref()).to_string();
        let mut link = |target: &mut String, args: &[Arg], line: usize| {
            let Some(resolved) = resolve(target, namespace.as_deref(), &ids) else {
                diag.error(
                    CompileError::new(
                        CompileErrorKind::UnknownTarget,
                        &file,
                        line,
                        format!("unknown passage '{}'", target),
                    )
                    .with_hint(suggestion(target, &ids)),
                );
                return;
            };
            if let Some(params) = signatures.get(&resolved) {
                if let Err(message) = check_arity(&resolved, params, args) {
                    diag.error(CompileError::new(CompileErrorKind::Arity, &file, line, message));
                }
            }
            *target = resolved;
        };
        for_each_link(&mut passage.content, &mut link);
        for choice in &mut passage.choices {
            link(&mut choice.target, &choice.args, choice.line);
        }

        tidy(&mut passage.content);
        trim_trailing_newlines(&mut passage.content);
    }
}

/// Namespace-relative lookup: the longest enclosing namespace wins, then
/// the bare id.
pub fn resolve(target: &str, namespace: Option<&str>, ids: &FxHashSet<String>) -> Option<String> {
    let mut scope = namespace;
    while let Some(prefix) = scope {
        let candidate = format!("{}{}{}", prefix, NAMESPACE_SEPARATOR, target);
        if ids.contains(&candidate) {
            return Some(candidate);
        }
        scope = prefix.rsplit_once(NAMESPACE_SEPARATOR).map(|(outer, _)| outer);
    }
    ids.contains(target).then(|| target.to_string())
}

fn suggestion(target: &str, ids: &FxHashSet<String>) -> String {
    let lower = target.to_lowercase();
    let mut close: Vec<&String> = ids
        .iter()
        .filter(|id| {
            let id = id.to_lowercase();
            id == lower || id.ends_with(&format!(".{}", lower))
        })
        .collect();
    close.sort();
    match close.first() {
        Some(id) => format!("did you mean '{}'?", id),
        None => "passage names are case-sensitive; check the :: header".to_string(),
    }
}

/// Static check of call arguments against the target's parameters.
pub fn check_arity(target: &str, params: &[Param], args: &[Arg]) -> Result<(), String> {
    let positional = args.iter().filter(|a| a.name.is_none()).count();
    if positional > params.len() {
        return Err(format!(
            "'{}' takes {} argument(s) but {} were given",
            target,
            params.len(),
            positional
        ));
    }
    let mut named: Vec<&str> = Vec::new();
    for name in args.iter().filter_map(|a| a.name.as_deref()) {
        let Some(index) = params.iter().position(|p| p.name == name) else {
            return Err(format!("'{}' has no parameter '{}'", target, name));
        };
        if index < positional {
            return Err(format!(
                "parameter '{}' of '{}' is given both positionally and by name",
                name, target
            ));
        }
        if named.contains(&name) {
            return Err(format!("parameter '{}' of '{}' is given twice", name, target));
        }
        named.push(name);
    }
    for (index, param) in params.iter().enumerate() {
        if param.default.is_none() && index >= positional && !named.contains(&param.name.as_str()) {
            return Err(format!(
                "'{}' is missing required argument '{}'",
                target, param.name
            ));
        }
    }
    Ok(())
}

fn for_each_link(items: &mut [ContentItem], f: &mut dyn FnMut(&mut String, &[Arg], usize)) {
    for item in items {
        match item {
            ContentItem::Jump { target, args, line } => f(target, args, *line),
            ContentItem::Choice(choice) => f(&mut choice.target, &choice.args, choice.line),
            ContentItem::Conditional { branches } => {
                for branch in branches {
                    for_each_link(&mut branch.content, f);
                }
            }
            ContentItem::Loop { body, .. } => for_each_link(body, f),
            _ => {}
        }
    }
}

fn is_newline(item: Option<&ContentItem>) -> bool {
    matches!(item, Some(ContentItem::Text(t)) if t == "\n")
}

fn is_conditional(item: Option<&ContentItem>) -> bool {
    matches!(item, Some(ContentItem::Conditional { .. }))
}

/// Collapse blank lines around conditionals and merge adjacent text.
fn tidy(items: &mut Vec<ContentItem>) {
    for item in items.iter_mut() {
        match item {
            ContentItem::Conditional { branches } => {
                for branch in branches {
                    tidy(&mut branch.content);
                }
            }
            ContentItem::Loop { body, .. } => tidy(body),
            _ => {}
        }
    }

    let keep: Vec<bool> = (0..items.len())
        .map(|i| {
            if !is_newline(items.get(i)) {
                return true;
            }
            let prev = i.checked_sub(1).and_then(|p| items.get(p));
            let next = items.get(i + 1);
            let before_block = is_conditional(next) && is_newline(prev);
            let after_block = is_conditional(prev) && is_newline(next);
            !(before_block || after_block)
        })
        .collect();
    let mut flags = keep.into_iter();
    items.retain(|_| flags.next().unwrap_or(true));

    let mut merged: Vec<ContentItem> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        match (merged.last_mut(), item) {
            (_, ContentItem::Text(t)) if t.is_empty() => {}
            (Some(ContentItem::Text(prev)), ContentItem::Text(t)) => prev.push_str(&t),
            (_, item) => merged.push(item),
        }
    }
    *items = merged;
}

/// At most one newline at the end of a passage, and none after a closing block.
fn trim_trailing_newlines(items: &mut Vec<ContentItem>) {
    let blank_tail = matches!(items.last(), Some(ContentItem::Text(t)) if t.chars().all(|c| c == '\n'));
    let after_block = items.len() >= 2
        && matches!(
            items[items.len() - 2],
            ContentItem::Conditional { .. } | ContentItem::Loop { .. }
        );
    if blank_tail && after_block {
        items.pop();
        return;
    }
    if let Some(ContentItem::Text(last)) = items.last_mut() {
        if last.ends_with("\n\n") {
            let kept = last.trim_end_matches('\n').len();
            last.truncate(kept);
            last.push('\n');
        }
    }
}
