/// Block-stack structural parser: located source lines → passages.

use std::sync::Arc;

use super::preprocess::{directive_arg, SourceLine};
use super::{CompileError, CompileErrorKind, Diagnostics};
use crate::core::script::format::split_format_spec;
use crate::core::script::lexer::{tokenize, Token};
use crate::core::script::parser::parse_target;
use crate::core::script::ScriptHost;
use crate::schema::story::{
    Arg, AssignOp, Branch, Choice, Command, ContentItem, Param, Passage, StoryMetadata,
};

/// Reserved state key that holds submitted input values.
pub const INPUTS_KEY: &str = "_inputs";

const DIRECTIVES: &str =
    "@if, @elif, @else, @endif, @for, @endfor, @script, @endscript, @render, @input, @include, @start, @metadata";

pub(crate) struct ParsedPassage {
    pub passage: Passage,
    pub file: Arc<str>,
    pub line: usize,
}

/// Explicit `@start` target and where it was declared.
pub(crate) struct StartDecl {
    pub target: String,
    pub file: Arc<str>,
    pub line: usize,
}

pub(crate) struct Parsed {
    pub passages: Vec<ParsedPassage>,
    pub start: Option<StartDecl>,
    pub metadata: StoryMetadata,
}

/// An error local to one line; located by the caller.
#[derive(Debug)]
struct LineError {
    kind: CompileErrorKind,
    message: String,
    hint: Option<String>,
}

impl LineError {
    fn syntax(message: impl Into<String>) -> Self {
        Self {
            kind: CompileErrorKind::Syntax,
            message: message.into(),
            hint: None,
        }
    }

    fn block(message: impl Into<String>) -> Self {
        Self {
            kind: CompileErrorKind::Block,
            message: message.into(),
            hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    fn locate(self, file: &str, line: usize) -> CompileError {
        let error = CompileError::new(self.kind, file, line, self.message);
        match self.hint {
            Some(hint) => error.with_hint(hint),
            None => error,
        }
    }
}

pub(crate) fn parse_lines(lines: &[SourceLine], script: &dyn ScriptHost, diag: &mut Diagnostics) -> Parsed {
    let mut parsed = Parsed {
        passages: Vec::new(),
        start: None,
        metadata: StoryMetadata::default(),
    };
    let mut current: Option<PassageBuilder<'_>> = None;
    let mut warned_stray = false;
    let mut i = 0;

    while i < lines.len() {
        let src = &lines[i];
        let trimmed = src.text.trim();

        if let Some(header) = trimmed.strip_prefix("::") {
            if let Some(done) = current.take() {
                parsed.passages.push(done.finish(diag));
            }
            match parse_header(header, script) {
                Ok(passage) => {
                    current = Some(PassageBuilder::new(passage, src, script));
                }
                Err(err) => {
                    diag.error(err.locate(&src.file, src.line));
                    current = None;
                }
            }
            i += 1;
            continue;
        }

        if trimmed.starts_with('#') {
            i += 1;
            continue;
        }

        if let Some(target) = directive_arg(trimmed, "@start") {
            let target = strip_inline_comment(target).trim().to_string();
            if is_passage_name(&target) {
                parsed.start = Some(StartDecl {
                    target,
                    file: Arc::clone(&src.file),
                    line: src.line,
                });
            } else {
                diag.error(
                    LineError::syntax("@start needs a passage name")
                        .hint("write @start PassageName")
                        .locate(&src.file, src.line),
                );
            }
            i += 1;
            continue;
        }

        if trimmed == "@metadata" {
            i = parse_metadata(lines, i + 1, &mut parsed.metadata);
            continue;
        }

        let Some(builder) = current.as_mut() else {
            if !trimmed.is_empty() && !warned_stray {
                diag.warn(format!(
                    "{} line {}: text outside any passage is ignored",
                    src.file, src.line
                ));
                warned_stray = true;
            }
            i += 1;
            continue;
        };

        if trimmed.is_empty() {
            builder.push_text("\n");
            i += 1;
            continue;
        }

        if trimmed.starts_with("@script") {
            i = builder.script_block(lines, i, diag);
            continue;
        }

        if let Some(first) = trimmed.strip_prefix('~') {
            let (code, next) = logical_statement(lines, i, first);
            builder.statement(&code, src, diag);
            i = next;
            continue;
        }

        builder.line(src, diag);
        i += 1;
    }

    if let Some(done) = current.take() {
        parsed.passages.push(done.finish(diag));
    }
    parsed
}

/// Indented `key: value` lines after `@metadata`. Returns the next line index.
fn parse_metadata(lines: &[SourceLine], mut i: usize, metadata: &mut StoryMetadata) -> usize {
    while i < lines.len() {
        let text = &lines[i].text;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        let indented = text.starts_with(|c: char| c.is_whitespace());
        let Some((key, value)) = trimmed.split_once(':').filter(|_| indented) else {
            break;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "title" => metadata.title = Some(value),
            "author" => metadata.author = Some(value),
            "version" => metadata.version = Some(value),
            "story_id" => metadata.story_id = Some(value),
            other => {
                metadata.custom.insert(other.to_string(), value);
            }
        }
        i += 1;
    }
    i
}

/// Join continuation lines while brackets or quotes are open.
fn logical_statement(lines: &[SourceLine], start: usize, first: &str) -> (String, usize) {
    let mut code = first.trim().to_string();
    let mut i = start + 1;
    while is_open(&code) && i < lines.len() && !lines[i].text.trim_start().starts_with("::") {
        code.push('\n');
        code.push_str(lines[i].text.trim());
        i += 1;
    }
    (code, i)
}

/// True while `code` has unclosed brackets or an unterminated string.
fn is_open(code: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut chars = code.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            },
        }
    }
    depth > 0 || quote.is_some()
}

/// Remove a trailing `// comment` outside braces; `\//` is a literal `//`.
pub(crate) fn strip_inline_comment(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if depth > 0 {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
            } else if c == '\'' || c == '"' {
                quote = Some(c);
            } else if c == '{' {
                depth += 1;
            } else if c == '}' {
                depth -= 1;
            }
            out.push(c);
            i += 1;
            continue;
        }
        if c == '\\' && next == Some('/') && chars.get(i + 2) == Some(&'/') {
            out.push_str("//");
            i += 3;
            continue;
        }
        if c == '/' && next == Some('/') {
            break;
        }
        if c == '{' {
            if next == Some('{') {
                out.push_str("{{");
                i += 2;
                continue;
            }
            depth += 1;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_passage_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn is_passage_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_passage_char)
}

/// Byte index of the bracket closing the one at `open`. Strings are skipped
/// except inside `[...]` choice text, where apostrophes are prose.
fn matching_close(s: &str, open: usize) -> Option<usize> {
    let track_quotes = !s[open..].starts_with('[');
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in s[open..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' if track_quotes => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `sep` at bracket depth 0, outside quotes.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, c) in s.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Trailing `^TAG` / `^TAG:param` tokens.
fn split_tags(s: &str) -> Result<(&str, Vec<String>), LineError> {
    let mut rest = s.trim_end();
    let mut tags = Vec::new();
    loop {
        let idx = rest
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map_or(0, |(i, c)| i + c.len_utf8());
        let token = &rest[idx..];
        let Some(tag) = token.strip_prefix('^') else {
            break;
        };
        let valid = match tag.split_once(':') {
            Some((name, param)) => {
                is_tag_word(name) && !param.is_empty() && param.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
            }
            None => is_tag_word(tag),
        };
        if !valid {
            return Err(LineError::syntax(format!("malformed tag '{}'", token)));
        }
        tags.push(tag.to_string());
        rest = rest[..idx].trim_end();
        if rest.is_empty() {
            break;
        }
    }
    tags.reverse();
    Ok((rest, tags))
}

fn is_tag_word(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn check_expr(script: &dyn ScriptHost, code: &str) -> Result<(), LineError> {
    script.check_expression(code).map_err(|err| LineError {
        kind: CompileErrorKind::Expression,
        message: format!("invalid expression '{}': {}", code.trim(), err),
        hint: None,
    })
}

fn parse_header(header: &str, script: &dyn ScriptHost) -> Result<Passage, LineError> {
    let header = strip_inline_comment(header);
    let (header, tags) = split_tags(header.trim())?;
    let name_end = header
        .find(|c: char| !is_passage_char(c))
        .unwrap_or(header.len());
    let name = &header[..name_end];
    if name.is_empty() {
        return Err(LineError::syntax("passage header needs a name").hint("write :: PassageName"));
    }
    let mut passage = Passage::new(name);
    passage.tags = tags;

    let rest = header[name_end..].trim_start();
    if rest.is_empty() {
        return Ok(passage);
    }
    if !rest.starts_with('(') {
        return Err(LineError::syntax(format!(
            "unexpected '{}' after passage name '{}'",
            rest, name
        ))
        .hint("passage names may only contain letters, digits, '_' and '.'"));
    }
    let close = matching_close(rest, 0)
        .ok_or_else(|| LineError::syntax("unclosed parameter list in passage header"))?;
    if !rest[close + 1..].trim().is_empty() {
        return Err(LineError::syntax(format!(
            "unexpected '{}' after parameter list",
            rest[close + 1..].trim()
        )));
    }
    passage.params = parse_params(&rest[1..close], script)?;
    Ok(passage)
}

fn parse_params(list: &str, script: &dyn ScriptHost) -> Result<Vec<Param>, LineError> {
    let mut params: Vec<Param> = Vec::new();
    if list.trim().is_empty() {
        return Ok(params);
    }
    for item in split_top_level(list, ',') {
        let item = item.trim();
        let (name, default) = match split_keyword(item) {
            Some((name, expr)) => (name, Some(expr)),
            None => (item, None),
        };
        if !is_identifier(name) {
            return Err(LineError::syntax(format!("invalid parameter name '{}'", name)));
        }
        if params.iter().any(|p| p.name == name) {
            return Err(LineError::syntax(format!("duplicate parameter '{}'", name)));
        }
        match default {
            Some(expr) => check_expr(script, expr)?,
            None => {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(LineError::syntax(format!(
                        "parameter '{}' without a default follows a parameter with one",
                        name
                    )));
                }
            }
        }
        params.push(Param {
            name: name.to_string(),
            default: default.map(str::to_string),
        });
    }
    Ok(params)
}

/// `name = expr` (but not `name == expr`).
fn split_keyword(item: &str) -> Option<(&str, &str)> {
    let end = item.find(|c: char| !(c.is_alphanumeric() || c == '_'))?;
    let name = &item[..end];
    let rest = item[end..].trim_start();
    let expr = rest.strip_prefix('=')?;
    if expr.starts_with('=') || !is_identifier(name) {
        return None;
    }
    Some((name, expr.trim()))
}

fn parse_args(list: &str, script: &dyn ScriptHost) -> Result<Vec<Arg>, LineError> {
    let mut args = Vec::new();
    if list.trim().is_empty() {
        return Ok(args);
    }
    let mut seen_keyword = false;
    for item in split_top_level(list, ',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(LineError::syntax("empty argument"));
        }
        let arg = match split_keyword(item) {
            Some((name, expr)) => {
                seen_keyword = true;
                Arg {
                    name: Some(name.to_string()),
                    expr: expr.to_string(),
                }
            }
            None => {
                if seen_keyword {
                    return Err(LineError::syntax(format!(
                        "positional argument '{}' follows a keyword argument",
                        item
                    )));
                }
                Arg {
                    name: None,
                    expr: item.to_string(),
                }
            }
        };
        check_expr(script, &arg.expr)?;
        args.push(arg);
    }
    Ok(args)
}

/// `Target` or `Target(args)`, followed by whatever is left.
fn parse_call<'a>(s: &'a str, script: &dyn ScriptHost) -> Result<(String, Vec<Arg>, &'a str), LineError> {
    let s = s.trim_start();
    let end = s.find(|c: char| !is_passage_char(c)).unwrap_or(s.len());
    let target = &s[..end];
    if target.is_empty() {
        return Err(LineError::syntax("missing target passage after '->'"));
    }
    let rest = &s[end..];
    if rest.starts_with('(') {
        let close = matching_close(rest, 0)
            .ok_or_else(|| LineError::syntax(format!("unclosed argument list for '{}'", target)))?;
        let args = parse_args(&rest[1..close], script)?;
        return Ok((target.to_string(), args, &rest[close + 1..]));
    }
    Ok((target.to_string(), Vec::new(), rest))
}

/// Text with `{expr}` / `{expr:spec}` interpolation and `{{` `}}` escapes.
fn parse_text(text: &str, script: &dyn ScriptHost) -> Result<Vec<ContentItem>, LineError> {
    let mut items = Vec::new();
    let mut literal = String::new();
    let mut rest = text;
    while let Some(idx) = rest.find(['{', '}']) {
        let (before, tail) = rest.split_at(idx);
        literal.push_str(before);
        if tail.starts_with("{{") {
            literal.push('{');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            literal.push('}');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            literal.push('}');
            rest = &tail[1..];
            continue;
        }
        let close = matching_close(tail, 0).ok_or_else(|| {
            LineError::syntax("unclosed '{' in text").hint("use {{ for a literal brace")
        })?;
        let inner = &tail[1..close];
        let (code, format) = split_format_spec(inner);
        if code.is_empty() {
            return Err(LineError::syntax("empty {} interpolation"));
        }
        check_expr(script, code)?;
        if !literal.is_empty() {
            items.push(ContentItem::Text(std::mem::take(&mut literal)));
        }
        items.push(ContentItem::Expression {
            code: code.to_string(),
            format: format.map(str::to_string),
        });
        rest = &tail[close + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        items.push(ContentItem::Text(literal));
    }
    Ok(items)
}

fn title_case(name: &str) -> String {
    name.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `name="field" label="..." placeholder="..."`.
fn parse_input(rest: &str) -> Result<ContentItem, LineError> {
    let mut name = None;
    let mut label = None;
    let mut placeholder = None;
    let mut s = rest.trim();
    while !s.is_empty() {
        let (key, after) = s
            .split_once('=')
            .ok_or_else(|| LineError::syntax(format!("malformed @input attribute '{}'", s)))?;
        let key = key.trim();
        let after = after.trim_start();
        let quote = after
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| LineError::syntax(format!("@input {} value must be quoted", key)))?;
        let end = after[1..]
            .find(quote)
            .ok_or_else(|| LineError::syntax(format!("unterminated @input {} value", key)))?;
        let value = after[1..1 + end].to_string();
        match key {
            "name" => name = Some(value),
            "label" => label = Some(value),
            "placeholder" => placeholder = Some(value),
            other => {
                return Err(LineError::syntax(format!("unknown @input attribute '{}'", other))
                    .hint("@input accepts name, label and placeholder"))
            }
        }
        s = after[end + 2..].trim_start();
    }
    let name = name.ok_or_else(|| {
        LineError::syntax("@input needs a name").hint("write @input name=\"field\"")
    })?;
    if !is_identifier(&name) {
        return Err(LineError::syntax(format!("invalid @input name '{}'", name)));
    }
    Ok(ContentItem::Input {
        label: Some(label.unwrap_or_else(|| title_case(&name))),
        name,
        placeholder,
    })
}

/// `@render name(args)` or `@render:hint name(args)`.
fn parse_render(rest: &str, script: &dyn ScriptHost) -> Result<ContentItem, LineError> {
    let (hint, body) = match rest.strip_prefix(':') {
        Some(after) => {
            let end = after.find(char::is_whitespace).unwrap_or(after.len());
            let hint = &after[..end];
            if !is_identifier(hint) {
                return Err(LineError::syntax("malformed @render hint").hint("write @render:hint name(args)"));
            }
            (Some(hint.to_string()), &after[end..])
        }
        None if rest.is_empty() || rest.starts_with(char::is_whitespace) => (None, rest),
        None => return Err(LineError::syntax("malformed @render directive")),
    };
    let body = body.trim();
    if body.is_empty() {
        return Err(LineError::syntax("@render needs a directive name").hint("write @render name(args)"));
    }
    let (name, args, tail) = parse_call(body, script)?;
    if !tail.trim().is_empty() {
        return Err(LineError::syntax(format!("unexpected '{}' after @render", tail.trim())));
    }
    Ok(ContentItem::Render { name, args, hint })
}

/// `cond:` from `@if cond:` with the colon required.
fn block_condition<'a>(directive: &str, rest: &'a str) -> Result<&'a str, LineError> {
    let Some(cond) = rest.trim_end().strip_suffix(':') else {
        return Err(LineError::block(format!("{} is missing its colon", directive))
            .hint(format!("write {} condition:", directive)));
    };
    let cond = cond.trim();
    if cond.is_empty() {
        return Err(LineError::block(format!("{} needs a condition", directive)));
    }
    Ok(cond)
}

enum Block {
    If {
        line: usize,
        branches: Vec<Branch>,
        has_else: bool,
        indent: Option<usize>,
    },
    For {
        line: usize,
        vars: Vec<String>,
        collection: String,
        body: Vec<ContentItem>,
        indent: Option<usize>,
    },
}

impl Block {
    fn opener(&self) -> (&'static str, &'static str, usize) {
        match self {
            Block::If { line, .. } => ("@if", "@endif", *line),
            Block::For { line, .. } => ("@for", "@endfor", *line),
        }
    }

    fn indent_mut(&mut self) -> &mut Option<usize> {
        match self {
            Block::If { indent, .. } | Block::For { indent, .. } => indent,
        }
    }

    fn content_mut(&mut self) -> &mut Vec<ContentItem> {
        match self {
            Block::If { branches, .. } => {
                if branches.is_empty() {
                    branches.push(Branch {
                        condition: None,
                        content: Vec::new(),
                    });
                }
                let last = branches.len() - 1;
                &mut branches[last].content
            }
            Block::For { body, .. } => body,
        }
    }

    fn into_item(self) -> ContentItem {
        match self {
            Block::If { branches, .. } => ContentItem::Conditional { branches },
            Block::For {
                vars,
                collection,
                body,
                ..
            } => ContentItem::Loop {
                vars,
                collection,
                body,
            },
        }
    }
}

struct PassageBuilder<'s> {
    passage: Passage,
    file: Arc<str>,
    line: usize,
    script: &'s dyn ScriptHost,
    stack: Vec<Block>,
    choices: usize,
}

impl<'s> PassageBuilder<'s> {
    fn new(passage: Passage, src: &SourceLine, script: &'s dyn ScriptHost) -> Self {
        Self {
            passage,
            file: Arc::clone(&src.file),
            line: src.line,
            script,
            stack: Vec::new(),
            choices: 0,
        }
    }

    fn target(&mut self) -> &mut Vec<ContentItem> {
        match self.stack.last_mut() {
            Some(block) => block.content_mut(),
            None => &mut self.passage.content,
        }
    }

    fn push_text(&mut self, text: &str) {
        self.target().push(ContentItem::Text(text.to_string()));
    }

    fn push_command(&mut self, command: Command) {
        if self.stack.is_empty() {
            self.passage.execute.push(command);
        } else {
            self.target().push(ContentItem::Command(command));
        }
    }

    fn report(&self, diag: &mut Diagnostics, src: &SourceLine, err: LineError) {
        diag.error(err.locate(&src.file, src.line));
    }

    /// Strip the enclosing block's base indentation from a body line.
    fn dedent<'t>(&mut self, text: &'t str) -> &'t str {
        let Some(block) = self.stack.last_mut() else {
            return text;
        };
        let indent = text.len() - text.trim_start().len();
        let base = *block.indent_mut().get_or_insert(indent);
        &text[indent.min(base)..]
    }

    fn finish(mut self, diag: &mut Diagnostics) -> ParsedPassage {
        while let Some(block) = self.stack.pop() {
            let (open, close, line) = block.opener();
            diag.error(
                CompileError::new(
                    CompileErrorKind::Block,
                    &self.file,
                    line,
                    format!("{} in passage '{}' is never closed", open, self.passage.id),
                )
                .with_hint(format!("add {} before the next passage", close)),
            );
        }
        ParsedPassage {
            passage: self.passage,
            file: self.file,
            line: self.line,
        }
    }

    fn statement(&mut self, code: &str, src: &SourceLine, diag: &mut Diagnostics) {
        match statement_command(code, src.line, self.script) {
            Ok(command) => self.push_command(command),
            Err(err) => self.report(diag, src, err),
        }
    }

    /// `@script:` … `@endscript`. Returns the index after the block.
    fn script_block(&mut self, lines: &[SourceLine], start: usize, diag: &mut Diagnostics) -> usize {
        let src = &lines[start];
        if src.text.trim() != "@script:" {
            self.report(
                diag,
                src,
                LineError::block("@script is missing its colon").hint("write @script: on its own line"),
            );
        }
        let mut body: Vec<&SourceLine> = Vec::new();
        let mut i = start + 1;
        let mut closed = false;
        while i < lines.len() {
            let trimmed = lines[i].text.trim();
            if trimmed == "@endscript" {
                closed = true;
                i += 1;
                break;
            }
            if trimmed.starts_with("::") {
                break;
            }
            body.push(&lines[i]);
            i += 1;
        }
        if !closed {
            self.report(
                diag,
                src,
                LineError::block("@script block is never closed").hint("add @endscript"),
            );
        }

        let mut j = 0;
        while j < body.len() {
            let line = body[j];
            let trimmed = line.text.trim();
            j += 1;
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut code = trimmed.to_string();
            while is_open(&code) && j < body.len() {
                code.push('\n');
                code.push_str(body[j].text.trim());
                j += 1;
            }
            self.statement(&code, line, diag);
        }
        i
    }

    fn line(&mut self, src: &SourceLine, diag: &mut Diagnostics) {
        let trimmed = src.text.trim();
        let result = if trimmed.starts_with('@') {
            self.directive(trimmed, src)
        } else if let Some(rest) = trimmed.strip_prefix("->") {
            self.jump(rest, src.line)
        } else if let Some(one_shot) = choice_marker(trimmed) {
            self.choice(&trimmed[1..], one_shot, src.line)
        } else {
            self.text(&src.text)
        };
        if let Err(err) = result {
            self.report(diag, src, err);
        }
    }

    fn text(&mut self, raw: &str) -> Result<(), LineError> {
        let line = self.dedent(raw).to_string();
        let line = strip_inline_comment(&line);
        if line.trim().is_empty() {
            // Comment-only line.
            return Ok(());
        }
        let line = line.trim_end();
        let (body, glue) = match line.strip_suffix("<>") {
            Some(body) => (body, true),
            None => (line, false),
        };
        let items = parse_text(body, self.script)?;
        self.target().extend(items);
        if !glue {
            self.push_text("\n");
        }
        Ok(())
    }

    fn jump(&mut self, rest: &str, line: usize) -> Result<(), LineError> {
        let rest = strip_inline_comment(rest);
        let (target, args, tail) = parse_call(&rest, self.script)?;
        if !tail.trim().is_empty() {
            return Err(LineError::syntax(format!("unexpected '{}' after jump target", tail.trim()))
                .hint("write -> Target or -> Target(args)"));
        }
        self.target().push(ContentItem::Jump { target, args, line });
        Ok(())
    }

    fn choice(&mut self, rest: &str, one_shot: bool, line: usize) -> Result<(), LineError> {
        let malformed = || {
            LineError::syntax("malformed choice").hint("write + [text] -> Target, * [text] -> Target or + {condition} [text] -> Target")
        };
        let rest = strip_inline_comment(rest);
        let (rest, tags) = split_tags(&rest)?;
        let mut rest = rest.trim_start();

        let mut guard = None;
        if rest.starts_with('{') {
            let close = matching_close(rest, 0).ok_or_else(malformed)?;
            let condition = rest[1..close].trim();
            if condition.is_empty() {
                return Err(LineError::syntax("empty choice condition"));
            }
            check_expr(self.script, condition)?;
            guard = Some(condition.to_string());
            rest = rest[close + 1..].trim_start();
        }

        if !rest.starts_with('[') {
            return Err(malformed());
        }
        let close = matching_close(rest, 0).ok_or_else(malformed)?;
        let text = parse_text(&rest[1..close], self.script)?;
        let rest = rest[close + 1..].trim_start();

        let Some(after_arrow) = rest.strip_prefix("->") else {
            return Err(malformed());
        };
        let (target, args, tail) = parse_call(after_arrow, self.script)?;
        if !tail.trim().is_empty() {
            return Err(malformed());
        }

        let choice = Choice {
            key: format!("{}#{}", self.passage.id, self.choices),
            text,
            target,
            args,
            guard,
            one_shot,
            tags,
            line,
        };
        self.choices += 1;
        if self.stack.is_empty() {
            self.passage.choices.push(choice);
        } else {
            self.target().push(ContentItem::Choice(choice));
        }
        Ok(())
    }

    fn directive(&mut self, trimmed: &str, src: &SourceLine) -> Result<(), LineError> {
        let word_end = trimmed[1..]
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .map(|i| i + 1)
            .unwrap_or(trimmed.len());
        let word = &trimmed[..word_end];
        let rest = strip_inline_comment(&trimmed[word_end..]);
        let rest = rest.trim_end();

        match word {
            "@if" => {
                let cond = block_condition("@if", rest)?;
                check_expr(self.script, cond)?;
                self.stack.push(Block::If {
                    line: src.line,
                    branches: vec![Branch {
                        condition: Some(cond.to_string()),
                        content: Vec::new(),
                    }],
                    has_else: false,
                    indent: None,
                });
                Ok(())
            }
            "@elif" => {
                let cond = block_condition("@elif", rest)?;
                check_expr(self.script, cond)?;
                match self.stack.last_mut() {
                    Some(Block::If { has_else: false, branches, .. }) => {
                        branches.push(Branch {
                            condition: Some(cond.to_string()),
                            content: Vec::new(),
                        });
                        Ok(())
                    }
                    Some(Block::If { .. }) => Err(LineError::block("@elif after @else")),
                    _ => Err(LineError::block("@elif without a matching @if")),
                }
            }
            "@else" => {
                if rest.trim() != ":" {
                    return Err(LineError::block("@else is missing its colon").hint("write @else:"));
                }
                match self.stack.last_mut() {
                    Some(Block::If { has_else, branches, .. }) if !*has_else => {
                        *has_else = true;
                        branches.push(Branch {
                            condition: None,
                            content: Vec::new(),
                        });
                        Ok(())
                    }
                    Some(Block::If { .. }) => Err(LineError::block("duplicate @else")),
                    _ => Err(LineError::block("@else without a matching @if")),
                }
            }
            "@endif" | "@endfor" => {
                if !rest.is_empty() {
                    let message = if rest.trim() == ":" {
                        format!("{} should not have a colon", word)
                    } else {
                        format!("unexpected '{}' after {}", rest.trim(), word)
                    };
                    return Err(LineError::block(message)
                        .hint("only opening directives (@if, @elif, @else, @for) take a colon"));
                }
                let expected = if word == "@endif" { "@if" } else { "@for" };
                match self.stack.last() {
                    Some(block) if block.opener().0 == expected => {}
                    Some(block) => {
                        let (open, close, line) = block.opener();
                        return Err(LineError::block(format!(
                            "{} found while {} from line {} is still open",
                            word, open, line
                        ))
                        .hint(format!("close it with {} first", close)));
                    }
                    None => {
                        return Err(LineError::block(format!("{} without a matching {}", word, expected)))
                    }
                }
                if let Some(block) = self.stack.pop() {
                    let item = block.into_item();
                    self.target().push(item);
                }
                Ok(())
            }
            "@for" => {
                let header = block_condition("@for", rest)?;
                let (vars, collection) = header.split_once(" in ").ok_or_else(|| {
                    LineError::block("malformed @for").hint("write @for item in collection:")
                })?;
                let vars: Vec<String> = vars.split(',').map(|v| v.trim().to_string()).collect();
                if vars.iter().any(|v| !is_identifier(v)) {
                    return Err(LineError::block(format!("invalid loop variable(s) '{}'", vars.join(", "))));
                }
                let collection = collection.trim();
                check_expr(self.script, collection)?;
                self.stack.push(Block::For {
                    line: src.line,
                    vars,
                    collection: collection.to_string(),
                    body: Vec::new(),
                    indent: None,
                });
                Ok(())
            }
            "@render" => {
                let item = parse_render(&strip_inline_comment(&trimmed[word_end..]), self.script)?;
                self.target().push(item);
                Ok(())
            }
            "@input" => {
                let item = parse_input(rest)?;
                self.target().push(item);
                Ok(())
            }
            "@endscript" => Err(LineError::block("@endscript without a matching @script:")),
            other => Err(LineError::syntax(format!("unknown directive '{}'", other))
                .hint(format!("valid directives: {}", DIRECTIVES))),
        }
    }
}

/// `Some(one_shot)` when the line is a choice: `+`/`*` followed by a
/// bracket or guard, or any `+ ... ->` line.
fn choice_marker(trimmed: &str) -> Option<bool> {
    let one_shot = match trimmed.chars().next()? {
        '+' => false,
        '*' => true,
        _ => return None,
    };
    let rest = trimmed[1..].trim_start();
    let looks_like_choice = rest.starts_with('[')
        || rest.starts_with('{')
        || (trimmed[1..].starts_with(char::is_whitespace) && rest.contains("->"));
    looks_like_choice.then_some(one_shot)
}

/// Build an execute command from `~` statement source.
fn statement_command(code: &str, line: usize, script: &dyn ScriptHost) -> Result<Command, LineError> {
    let expression_error = |err: String| LineError {
        kind: CompileErrorKind::Expression,
        message: format!("invalid statement '{}': {}", code.trim(), err),
        hint: None,
    };
    let code = code.trim();
    if code.is_empty() {
        return Err(LineError::syntax("empty ~ statement"));
    }
    let tokens = tokenize(code).map_err(|e| expression_error(e.to_string()))?;
    let mut depth = 0i32;
    let mut assign: Option<(usize, AssignOp)> = None;
    for spanned in &tokens {
        match spanned.token {
            Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
            Token::RParen | Token::RBracket | Token::RBrace => depth -= 1,
            Token::Assign(op) if depth == 0 => {
                assign = Some((spanned.pos, op));
                break;
            }
            _ => {}
        }
    }
    script
        .check_statement(code)
        .map_err(|e| expression_error(e.to_string()))?;

    let Some((pos, op)) = assign else {
        return Ok(Command::Eval {
            code: code.to_string(),
            line,
        });
    };
    let chars: Vec<char> = code.chars().collect();
    let target: String = chars[..pos].iter().collect::<String>().trim().to_string();
    let width = op.symbol().chars().count();
    let expression: String = chars[pos + width..].iter().collect::<String>().trim().to_string();

    let place = parse_target(&target).map_err(|e| expression_error(e.to_string()))?;
    if place.root_name() == Some(INPUTS_KEY) {
        return Err(LineError::syntax(format!(
            "'{}' is reserved for submitted input values",
            INPUTS_KEY
        ))
        .hint("read submitted values from _inputs, store them under another name"));
    }
    Ok(Command::Assign {
        target,
        op,
        expression,
        line,
    })
}
