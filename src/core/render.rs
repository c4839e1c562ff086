/// Pure render pass over one passage.
///
/// Rendering reads session state through a shared scope and never writes
/// it: statements inside `@if`/`@for` bodies land in a pass-local frame.
/// Evaluation failures are recovered where they happen. A failed condition
/// or guard counts as false, a failed interpolation renders an inline
/// `{ERROR: ...}` marker, and a jump or directive with failing arguments is
/// skipped. Each recovery is logged and reported in `warnings`.

use log::warn;
use rand::rngs::StdRng;
use rustc_hash::FxHashSet;

use crate::core::host::Bindings;
use crate::core::scope::Scope;
use crate::core::script::eval::{bind_targets, iterate};
use crate::core::script::format::format_value;
use crate::core::script::{EvalError, ScriptHost};
use crate::schema::output::{InputRequest, RenderDirective, RenderWarning, RenderedChoice};
use crate::schema::story::{Arg, Choice, ContentItem, Passage};
use crate::schema::value::{CallArgs, Value, VarMap};

/// A jump reached during rendering; content after it was not rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJump {
    pub target: String,
    pub args: CallArgs,
}

/// Everything one passage contributed to a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rendered {
    pub content: String,
    pub choices: Vec<RenderedChoice>,
    pub directives: Vec<RenderDirective>,
    pub inputs: Vec<InputRequest>,
    pub warnings: Vec<RenderWarning>,
    pub jump: Option<PendingJump>,
}

/// Inputs of a render pass besides the passage itself.
pub struct RenderContext<'a> {
    pub script: &'a dyn ScriptHost,
    pub state: &'a VarMap,
    pub bindings: &'a Bindings,
    pub consumed: &'a FxHashSet<String>,
}

enum Flow {
    Continue,
    Jump,
}

pub fn render_passage(passage: &Passage, locals: VarMap, rng: &mut StdRng, ctx: &RenderContext<'_>) -> Rendered {
    let scope = Scope::shared(ctx.state, locals, rng, ctx.bindings);
    let mut pass = Pass {
        script: ctx.script,
        consumed: ctx.consumed,
        passage_id: &passage.id,
        scope,
        out: Rendered::default(),
    };
    if let Flow::Continue = pass.items(&passage.content) {
        for choice in &passage.choices {
            pass.choice(choice);
        }
        // Block choices render during the pass; restore source order.
        pass.out.choices.sort_by_key(|c| source_index(&c.key));
    } else {
        // Choices belong to the final hop.
        pass.out.choices.clear();
    }
    pass.out
}

/// Position of a choice in its passage, from its `Passage#n` key.
fn source_index(key: &str) -> usize {
    key.rsplit_once('#')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(usize::MAX)
}

struct Pass<'p, 's> {
    script: &'p dyn ScriptHost,
    consumed: &'p FxHashSet<String>,
    passage_id: &'p str,
    scope: Scope<'s>,
    out: Rendered,
}

impl Pass<'_, '_> {
    fn warn(&mut self, expression: &str, error: &EvalError) {
        warn!(
            "render of '{}': '{}' failed: {}",
            self.passage_id, expression, error
        );
        self.out.warnings.push(RenderWarning {
            passage_id: self.passage_id.to_string(),
            expression: expression.to_string(),
            message: error.to_string(),
        });
    }

    fn eval(&mut self, code: &str) -> Result<Value, EvalError> {
        self.script.evaluate(code, &mut self.scope)
    }

    /// Condition value, with failures counted as false.
    fn condition(&mut self, code: &str) -> bool {
        match self.eval(code) {
            Ok(value) => value.is_truthy(),
            Err(err) => {
                self.warn(code, &err);
                false
            }
        }
    }

    fn args(&mut self, args: &[Arg]) -> Result<CallArgs, (String, EvalError)> {
        let mut call = CallArgs::new();
        for arg in args {
            let value = self.eval(&arg.expr).map_err(|e| (arg.expr.clone(), e))?;
            match &arg.name {
                Some(name) => {
                    call.named.insert(name.clone(), value);
                }
                None => call.positional.push(value),
            }
        }
        Ok(call)
    }

    fn interpolate(&mut self, code: &str, format: Option<&str>) -> String {
        let formatted = self
            .eval(code)
            .and_then(|value| match format {
                Some(spec) => format_value(&value, spec),
                None => Ok(value.to_string()),
            });
        match formatted {
            Ok(text) => text,
            Err(err) => {
                self.warn(code, &err);
                format!("{{ERROR: {} - {}}}", code, err)
            }
        }
    }

    fn items(&mut self, items: &[ContentItem]) -> Flow {
        for item in items {
            if let Flow::Jump = self.item(item) {
                return Flow::Jump;
            }
        }
        Flow::Continue
    }

    fn item(&mut self, item: &ContentItem) -> Flow {
        match item {
            ContentItem::Text(text) => self.out.content.push_str(text),
            ContentItem::Expression { code, format } => {
                let text = self.interpolate(code, format.as_deref());
                self.out.content.push_str(&text);
            }
            ContentItem::Conditional { branches } => {
                for branch in branches {
                    let taken = match &branch.condition {
                        Some(code) => self.condition(code),
                        None => true,
                    };
                    if taken {
                        return self.items(&branch.content);
                    }
                }
            }
            ContentItem::Loop {
                vars,
                collection,
                body,
            } => return self.repeat(vars, collection, body),
            ContentItem::Jump { target, args, .. } => match self.args(args) {
                Ok(args) => {
                    self.out.jump = Some(PendingJump {
                        target: target.clone(),
                        args,
                    });
                    return Flow::Jump;
                }
                Err((expr, err)) => self.warn(&expr, &err),
            },
            ContentItem::Render { name, args, hint } => match self.args(args) {
                Ok(arguments) => self.out.directives.push(RenderDirective {
                    name: name.clone(),
                    arguments,
                    presentation_hint: hint.clone(),
                }),
                Err((expr, err)) => self.warn(&expr, &err),
            },
            ContentItem::Input {
                name,
                label,
                placeholder,
            } => self.out.inputs.push(InputRequest {
                field_name: name.clone(),
                label: label.clone(),
                placeholder: placeholder.clone(),
            }),
            ContentItem::Command(command) => {
                let source = command.source();
                if let Err(err) = self.script.execute(&source, &mut self.scope) {
                    self.warn(&source, &err);
                }
            }
            ContentItem::Choice(choice) => self.choice(choice),
        }
        Flow::Continue
    }

    fn repeat(&mut self, vars: &[String], collection: &str, body: &[ContentItem]) -> Flow {
        let items = match self.eval(collection).and_then(|value| iterate(&value)) {
            Ok(items) => items,
            Err(err) => {
                self.warn(collection, &err);
                return Flow::Continue;
            }
        };
        for item in items {
            self.scope.push_frame();
            let flow = match bind_targets(vars, item, &mut self.scope) {
                Ok(()) => self.items(body),
                Err(err) => {
                    self.warn(collection, &err);
                    Flow::Continue
                }
            };
            self.scope.pop_frame();
            if let Flow::Jump = flow {
                return Flow::Jump;
            }
        }
        Flow::Continue
    }

    fn choice(&mut self, choice: &Choice) {
        if choice.one_shot && self.consumed.contains(&choice.key) {
            return;
        }
        if let Some(guard) = &choice.guard {
            if !self.condition(guard) {
                return;
            }
        }
        let args = match self.args(&choice.args) {
            Ok(args) => args,
            Err((expr, err)) => {
                self.warn(&expr, &err);
                return;
            }
        };
        let mut text = String::new();
        for item in &choice.text {
            match item {
                ContentItem::Text(t) => text.push_str(t),
                ContentItem::Expression { code, format } => {
                    let part = self.interpolate(code, format.as_deref());
                    text.push_str(&part);
                }
                _ => {}
            }
        }
        self.out.choices.push(RenderedChoice {
            key: choice.key.clone(),
            text: text.trim().to_string(),
            target: choice.target.clone(),
            args,
            one_shot: choice.one_shot,
            tags: choice.tags.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::compile;
    use crate::core::script::Interpreter;
    use rand::SeedableRng;

    fn render(source: &str, passage: &str, state: VarMap) -> Rendered {
        let story = compile(source).unwrap();
        render_with(&story.passages[passage], state, &FxHashSet::default())
    }

    fn render_with(passage: &Passage, state: VarMap, consumed: &FxHashSet<String>) -> Rendered {
        let script = Interpreter::new();
        let bindings = Bindings::default();
        let mut rng = StdRng::seed_from_u64(7);
        let ctx = RenderContext {
            script: &script,
            state: &state,
            bindings: &bindings,
            consumed,
        };
        render_passage(passage, VarMap::new(), &mut rng, &ctx)
    }

    fn state(pairs: &[(&str, Value)]) -> VarMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn conditionals_pick_the_first_true_branch() {
        let source = ":: Start\n@if gold > 10:\nRich\n@elif gold > 0:\nComfortable\n@else:\nBroke\n@endif\n";
        let out = render(source, "Start", state(&[("gold", Value::Int(5))]));
        assert_eq!(out.content, "Comfortable\n");
    }

    #[test]
    fn failed_conditions_are_false_and_warned() {
        let out = render(":: Start\n@if missing > 1:\nA\n@else:\nB\n@endif\n", "Start", VarMap::new());
        assert_eq!(out.content, "B\n");
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].expression, "missing > 1");
    }

    #[test]
    fn failed_interpolation_renders_a_marker() {
        let out = render(":: Start\nHello {name}.\n", "Start", VarMap::new());
        assert!(out.content.starts_with("Hello {ERROR: name - "));
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn loops_and_directives_collect_in_order() {
        let source = ":: Start\n@for card in hand:\n@render card(card)\n{card}<>\n@endfor\n@input name=\"nick\"\n";
        let hand = Value::List(vec![Value::from("sun"), Value::from("moon")]);
        let out = render(source, "Start", state(&[("hand", hand)]));
        assert_eq!(out.content, "sunmoon");
        assert_eq!(out.directives.len(), 2);
        assert_eq!(out.directives[1].arguments.positional[0], Value::from("moon"));
        assert_eq!(out.inputs[0].field_name, "nick");
    }

    #[test]
    fn untaken_branches_contribute_no_directives() {
        let source = ":: Start\n@if False:\n@render hidden()\n@endif\n@render shown()\n";
        let out = render(source, "Start", VarMap::new());
        assert_eq!(out.directives.len(), 1);
        assert_eq!(out.directives[0].name, "shown");
    }

    #[test]
    fn jumps_stop_rendering() {
        let source = ":: Start\nBefore\n-> Next(2)\nAfter\n+ [x] -> Next(1)\n:: Next(n)\nN\n";
        let out = render(source, "Start", VarMap::new());
        assert_eq!(out.content, "Before\n");
        let jump = out.jump.unwrap();
        assert_eq!(jump.target, "Next");
        assert_eq!(jump.args.positional, vec![Value::Int(2)]);
        assert!(out.choices.is_empty());
    }

    #[test]
    fn render_statements_do_not_touch_state() {
        let source = ":: Start\n@if True:\n~ gold += 5\n{gold}\n@endif\n";
        let vars = state(&[("gold", Value::Int(1))]);
        let out = render(source, "Start", vars.clone());
        assert_eq!(out.content, "6\n");
        assert_eq!(vars["gold"], Value::Int(1));
    }

    #[test]
    fn guards_and_consumed_choices_are_filtered() {
        let story = compile(":: Start\n+ {key} [Door] -> Start\n* [Once] -> Start\n+ [Always {n:03d}] -> Start\n").unwrap();
        let passage = &story.passages["Start"];
        let mut consumed = FxHashSet::default();
        consumed.insert("Start#1".to_string());
        let out = render_with(passage, state(&[("key", Value::Bool(false)), ("n", Value::Int(7))]), &consumed);
        assert_eq!(out.choices.len(), 1);
        assert_eq!(out.choices[0].text, "Always 007");
    }

    #[test]
    fn choices_inside_blocks_keep_source_order() {
        let source = ":: Start\n+ [A] -> Start\n@if True:\n    + [B] -> Start\n@endif\n+ [C] -> Start\n";
        let out = render(source, "Start", VarMap::new());
        let texts: Vec<&str> = out.choices.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(out.choices[1].key, "Start#1");
    }
}
