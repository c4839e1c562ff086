/// Session state machine: enter, current, choose, save, load.
///
/// Every transition works on a staged copy of the session. Parameter
/// binding, execute commands and the whole jump chain run against the copy,
/// and it replaces the live session only when all of them succeed. A failed
/// `enter` or `choose` therefore leaves variables, consumed choices, the RNG
/// and the cached output exactly as they were.

use indexmap::IndexMap;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::core::compiler::parser::INPUTS_KEY;
use crate::core::host::{Bindings, HostRegistry, TypeEntry};
use crate::core::render::{render_passage, RenderContext};
use crate::core::save::{self, LoadReport, SaveDocument, SaveError, FORMAT_VERSION};
use crate::core::scope::Scope;
use crate::core::script::{EvalError, Interpreter, ScriptHost};
use crate::schema::output::Output;
use crate::schema::story::{Passage, StoryError, StoryIr, StoryMetadata};
use crate::schema::value::{CallArgs, Value, VarMap};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NavigationError {
    #[error("unknown passage '{0}'")]
    UnknownPassage(String),
    #[error("passage '{passage}' requires argument '{param}'")]
    MissingParameter { passage: String, param: String },
    #[error("passage '{passage}' has no parameter '{param}'")]
    UnknownParameter { passage: String, param: String },
    #[error("passage '{passage}' got argument '{param}' twice")]
    DuplicateArgument { passage: String, param: String },
    #[error("passage '{passage}' takes {expected} argument(s) but {given} were given")]
    TooManyArguments {
        passage: String,
        expected: usize,
        given: usize,
    },
    #[error("jump cycle: {}", chain.join(" -> "))]
    JumpCycle { chain: Vec<String> },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("navigation error: {0}")]
    Navigation(#[from] NavigationError),
    #[error("in passage '{passage}', evaluating '{expression}': {source}")]
    Evaluation {
        passage: String,
        expression: String,
        source: EvalError,
    },
    #[error("no passage has been entered yet")]
    NotStarted,
    #[error("choice {index} is out of range ({available} available)")]
    ChoiceOutOfRange { index: usize, available: usize },
    #[error("save error: {0}")]
    Save(#[from] SaveError),
    #[error("story error: {0}")]
    Story(#[from] StoryError),
}

/// Where the session currently is.
#[derive(Debug, Clone)]
struct Position {
    passage_id: String,
    /// Frame 0 of the final hop after its execute phase.
    args: VarMap,
    output: Output,
}

/// Mutable session state. Cloned to stage each transition.
#[derive(Debug, Clone)]
struct Session {
    vars: VarMap,
    consumed: FxHashSet<String>,
    rng: StdRng,
    position: Option<Position>,
}

/// Runs one compiled story for one player.
pub struct Engine {
    story: StoryIr,
    script: Box<dyn ScriptHost>,
    registry: HostRegistry,
    bindings: Bindings,
    import_warnings: Vec<String>,
    session: Session,
}

/// Builder for constructing an `Engine`.
pub struct EngineBuilder {
    story: StoryIr,
    seed: u64,
    registry: HostRegistry,
    script: Option<Box<dyn ScriptHost>>,
    vars: VarMap,
}

impl EngineBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn register_type(mut self, entry: TypeEntry) -> Self {
        self.registry.register_type(entry);
        self
    }

    /// Bind a host function under the default module.
    pub fn bind_fn<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(CallArgs) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.registry.bind_fn(name, f);
        self
    }

    /// Replace the registry wholesale.
    pub fn registry(mut self, registry: HostRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn script_host(mut self, script: Box<dyn ScriptHost>) -> Self {
        self.script = Some(script);
        self
    }

    /// Initial value for a session variable.
    pub fn var(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.story.validate()?;
        let (bindings, import_warnings) = self.registry.bindings(&self.story.imports);
        debug!(
            "engine built: {} passage(s), {} bound name(s)",
            self.story.passages.len(),
            bindings.len()
        );
        Ok(Engine {
            story: self.story,
            script: self.script.unwrap_or_else(|| Box::new(Interpreter::new())),
            registry: self.registry,
            bindings,
            import_warnings,
            session: Session {
                vars: self.vars,
                consumed: FxHashSet::default(),
                rng: StdRng::seed_from_u64(self.seed),
                position: None,
            },
        })
    }
}

impl Engine {
    pub fn builder(story: StoryIr) -> EngineBuilder {
        EngineBuilder {
            story,
            seed: 0,
            registry: HostRegistry::new(),
            script: None,
            vars: VarMap::new(),
        }
    }

    /// Engine with the default interpreter and no host registrations.
    pub fn new(story: StoryIr) -> Result<Engine, EngineError> {
        Self::builder(story).build()
    }

    pub fn story(&self) -> &StoryIr {
        &self.story
    }

    pub fn metadata(&self) -> &StoryMetadata {
        &self.story.metadata
    }

    /// Story imports the registry could not satisfy.
    pub fn import_warnings(&self) -> &[String] {
        &self.import_warnings
    }

    /// Enter the story's initial passage.
    pub fn start(&mut self) -> Result<&Output, EngineError> {
        let initial = self.story.initial_passage.clone();
        self.enter(&initial, CallArgs::new())
    }

    /// Bind arguments, run execute commands once, render, follow jumps.
    pub fn enter(&mut self, passage_id: &str, args: CallArgs) -> Result<&Output, EngineError> {
        let staged = self.session.clone();
        self.transition(staged, passage_id, args)
    }

    /// Cached output of the last transition. Never re-executes anything.
    pub fn current(&self) -> Result<&Output, EngineError> {
        self.session
            .position
            .as_ref()
            .map(|p| &p.output)
            .ok_or(EngineError::NotStarted)
    }

    /// Take the `index`-th choice of the current output (guard-passed,
    /// unconsumed choices only).
    pub fn choose(&mut self, index: usize) -> Result<&Output, EngineError> {
        let output = self.current()?;
        let choice = output
            .choices
            .get(index)
            .cloned()
            .ok_or(EngineError::ChoiceOutOfRange {
                index,
                available: output.choices.len(),
            })?;
        debug!("choice {} '{}' -> {}", index, choice.key, choice.target);
        let mut staged = self.session.clone();
        if choice.one_shot {
            staged.consumed.insert(choice.key.clone());
        }
        self.transition(staged, &choice.target, choice.args)
    }

    /// Store submitted input values under the reserved `_inputs` mapping.
    pub fn submit_inputs(&mut self, values: IndexMap<String, Value>) {
        let slot = self
            .session
            .vars
            .entry(INPUTS_KEY.to_string())
            .or_insert_with(|| Value::Map(IndexMap::new()));
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::Map(IndexMap::new());
        }
        if let Value::Map(inputs) = slot {
            inputs.extend(values);
        }
    }

    pub fn set_var(&mut self, name: &str, value: impl Into<Value>) {
        self.session.vars.insert(name.to_string(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.session.vars.get(name)
    }

    pub fn state(&self) -> &VarMap {
        &self.session.vars
    }

    /// Whether the one-shot choice with this key has been taken.
    pub fn is_consumed(&self, key: &str) -> bool {
        self.session.consumed.contains(key)
    }

    pub fn has_choices(&self) -> bool {
        self.current().map_or(false, |out| !out.choices.is_empty())
    }

    /// Entered, and the final passage offers nothing further.
    pub fn is_terminal(&self) -> bool {
        self.current().map_or(false, |out| out.choices.is_empty())
    }

    pub fn save(&self) -> Result<SaveDocument, EngineError> {
        let position = self.session.position.as_ref().ok_or(EngineError::NotStarted)?;
        let (state, _) = save::encode_state(&self.session.vars);
        let (current_args, _) = save::encode_state(&position.args);
        let mut consumed: Vec<String> = self.session.consumed.iter().cloned().collect();
        consumed.sort();
        Ok(SaveDocument {
            format_version: FORMAT_VERSION,
            story_version: self.story.metadata.version.clone(),
            story_id: self.story.metadata.identity(),
            timestamp: save::now(),
            current_passage_id: position.passage_id.clone(),
            current_args,
            state,
            consumed_one_shot_choices: consumed,
        })
    }

    /// Replace the session with a saved one and re-render its passage
    /// without executing it. Nothing changes if the document is rejected.
    pub fn load(&mut self, doc: &SaveDocument) -> Result<LoadReport, EngineError> {
        doc.check_version()?;
        let passage = self
            .story
            .passage(&doc.current_passage_id)
            .ok_or_else(|| SaveError::UnknownPassage(doc.current_passage_id.clone()))?;

        let mut report = LoadReport::default();
        let identity = self.story.metadata.identity();
        if doc.story_id != identity {
            let message = format!(
                "save was made for story '{}', loading into '{}'",
                doc.story_id, identity
            );
            warn!("{}", message);
            report.warnings.push(message);
        }

        let (vars, warnings) = save::decode_state(&doc.state, &self.registry)?;
        report.warnings.extend(warnings);
        let (args, warnings) = save::decode_state(&doc.current_args, &self.registry)?;
        report.warnings.extend(warnings);

        let mut staged = Session {
            vars,
            consumed: doc.consumed_one_shot_choices.iter().cloned().collect(),
            rng: self.session.rng.clone(),
            position: None,
        };
        let rendered = {
            let ctx = RenderContext {
                script: self.script.as_ref(),
                state: &staged.vars,
                bindings: &self.bindings,
                consumed: &staged.consumed,
            };
            render_passage(passage, args.clone(), &mut staged.rng, &ctx)
        };
        if rendered.jump.is_some() {
            report
                .warnings
                .push(format!("'{}' now jumps on render; showing content up to the jump", passage.id));
        }
        staged.position = Some(Position {
            passage_id: passage.id.clone(),
            args,
            output: Output {
                passage_id: passage.id.clone(),
                visited: vec![passage.id.clone()],
                content: rendered.content,
                choices: rendered.choices,
                directives: rendered.directives,
                inputs: rendered.inputs,
                warnings: rendered.warnings,
            },
        });
        self.session = staged;
        debug!("loaded save at '{}'", doc.current_passage_id);
        Ok(report)
    }

    fn transition(&mut self, mut staged: Session, passage_id: &str, args: CallArgs) -> Result<&Output, EngineError> {
        let mut output = Output::default();
        let mut next = (passage_id.to_string(), args);

        let args = loop {
            let (id, call) = next;
            if output.visited.contains(&id) {
                let mut chain = output.visited.clone();
                chain.push(id);
                return Err(NavigationError::JumpCycle { chain }.into());
            }
            let passage = self
                .story
                .passage(&id)
                .ok_or_else(|| NavigationError::UnknownPassage(id.clone()))?;
            debug!("entering '{}'", id);
            output.visited.push(id.clone());

            let locals = self.execute(passage, call, &mut staged)?;
            let rendered = {
                let ctx = RenderContext {
                    script: self.script.as_ref(),
                    state: &staged.vars,
                    bindings: &self.bindings,
                    consumed: &staged.consumed,
                };
                render_passage(passage, locals.clone(), &mut staged.rng, &ctx)
            };
            output.content.push_str(&rendered.content);
            output.directives.extend(rendered.directives);
            output.inputs.extend(rendered.inputs);
            output.warnings.extend(rendered.warnings);

            match rendered.jump {
                Some(jump) => next = (jump.target, jump.args),
                None => {
                    output.passage_id = id;
                    output.choices = rendered.choices;
                    break locals;
                }
            }
        };

        staged.position = Some(Position {
            passage_id: output.passage_id.clone(),
            args,
            output,
        });
        self.session = staged;
        self.current()
    }

    /// Bind parameters and run the passage's execute commands against the
    /// staged state. Returns frame 0 (arguments) for rendering.
    fn execute(&self, passage: &Passage, call: CallArgs, staged: &mut Session) -> Result<VarMap, EngineError> {
        let mut scope = Scope::owned(&mut staged.vars, VarMap::new(), &mut staged.rng, &self.bindings);
        bind_params(passage, call, &mut scope, self.script.as_ref())?;
        for command in &passage.execute {
            let source = command.source();
            self.script
                .execute(&source, &mut scope)
                .map_err(|source_err| EngineError::Evaluation {
                    passage: passage.id.clone(),
                    expression: source.clone(),
                    source: source_err,
                })?;
        }
        if !passage.execute.is_empty() {
            debug!("executed {} command(s) in '{}'", passage.execute.len(), passage.id);
        }
        Ok(scope.into_locals())
    }
}

/// Match call arguments to declared parameters, evaluating defaults in
/// order so later defaults can refer to earlier parameters.
fn bind_params(
    passage: &Passage,
    call: CallArgs,
    scope: &mut Scope<'_>,
    script: &dyn ScriptHost,
) -> Result<(), EngineError> {
    let params = &passage.params;
    if call.positional.len() > params.len() {
        return Err(NavigationError::TooManyArguments {
            passage: passage.id.clone(),
            expected: params.len(),
            given: call.positional.len(),
        }
        .into());
    }
    let given = call.positional.len();
    let mut named = call.named;
    if let Some(name) = named.keys().find(|name| !params.iter().any(|p| &p.name == *name)) {
        return Err(NavigationError::UnknownParameter {
            passage: passage.id.clone(),
            param: name.clone(),
        }
        .into());
    }
    if let Some(param) = params[..given].iter().find(|p| named.contains_key(&p.name)) {
        return Err(NavigationError::DuplicateArgument {
            passage: passage.id.clone(),
            param: param.name.clone(),
        }
        .into());
    }

    let mut positional = call.positional.into_iter();
    for param in params {
        let value = match positional.next() {
            Some(value) => value,
            None => match (named.shift_remove(&param.name), &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => script.evaluate(default, scope).map_err(|source| EngineError::Evaluation {
                    passage: passage.id.clone(),
                    expression: default.clone(),
                    source,
                })?,
                (None, None) => {
                    return Err(NavigationError::MissingParameter {
                        passage: passage.id.clone(),
                        param: param.name.clone(),
                    }
                    .into())
                }
            },
        };
        scope.set_local(&param.name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::compile;

    fn engine(source: &str) -> Engine {
        Engine::new(compile(source).unwrap()).unwrap()
    }

    #[test]
    fn execute_runs_once_and_current_is_cached() {
        let mut engine = engine(":: Start\n~ count = count + 1\nCount {count}\n");
        engine.set_var("count", 0);
        let first = engine.start().unwrap().clone();
        let again = engine.current().unwrap().clone();
        assert_eq!(first, again);
        assert_eq!(first.content, "Count 1\n");
        assert_eq!(engine.var("count"), Some(&Value::Int(1)));
    }

    #[test]
    fn failed_execute_leaves_no_trace() {
        let mut engine = engine(":: Start\n~ gold = 5\n+ [Spend] -> Shop\n:: Shop\n~ gold = gold - 1\n~ boom = 1 // 0\nShop\n");
        engine.start().unwrap();
        let err = engine.choose(0).unwrap_err();
        assert!(matches!(err, EngineError::Evaluation { ref passage, .. } if passage == "Shop"));
        assert_eq!(engine.var("gold"), Some(&Value::Int(5)));
        assert_eq!(engine.current().unwrap().passage_id, "Start");
    }

    #[test]
    fn parameters_bind_with_defaults() {
        let mut engine = engine(":: Start\n-> Greet('Ada')\n:: Greet(name, title='Captain')\n{title} {name}\n");
        let out = engine.start().unwrap();
        assert_eq!(out.content, "Captain Ada\n");
        assert_eq!(out.visited, vec!["Start", "Greet"]);
        assert!(engine.var("name").is_none());
    }

    #[test]
    fn runtime_argument_errors() {
        let mut engine = engine(":: Start\nHi\n:: Greet(name)\n{name}\n");
        let missing = engine.enter("Greet", CallArgs::new()).unwrap_err();
        assert!(matches!(missing, EngineError::Navigation(NavigationError::MissingParameter { .. })));
        let extra = engine
            .enter("Greet", CallArgs::positional(vec![Value::Int(1), Value::Int(2)]))
            .unwrap_err();
        assert!(matches!(extra, EngineError::Navigation(NavigationError::TooManyArguments { given: 2, .. })));
        let unknown = engine.enter("Greet", CallArgs::new().with_named("nick", "x")).unwrap_err();
        assert!(matches!(unknown, EngineError::Navigation(NavigationError::UnknownParameter { .. })));
        let nowhere = engine.enter("Nowhere", CallArgs::new()).unwrap_err();
        assert!(matches!(nowhere, EngineError::Navigation(NavigationError::UnknownPassage(_))));
        assert!(matches!(engine.current(), Err(EngineError::NotStarted)));
    }

    #[test]
    fn choose_out_of_range() {
        let mut engine = engine(":: Start\n+ [A] -> Start\n");
        assert!(matches!(engine.choose(0), Err(EngineError::NotStarted)));
        engine.start().unwrap();
        assert!(matches!(
            engine.choose(3),
            Err(EngineError::ChoiceOutOfRange { index: 3, available: 1 })
        ));
    }

    #[test]
    fn inputs_live_under_a_reserved_mapping() {
        let mut engine = engine(":: Start\n@input name=\"hero\"\n+ [Go] -> Next\n:: Next\nHello {_inputs['hero']}.\n");
        engine.start().unwrap();
        let mut values = IndexMap::new();
        values.insert("hero".to_string(), Value::from("Ada"));
        engine.submit_inputs(values);
        assert!(engine.var("hero").is_none());
        assert_eq!(engine.choose(0).unwrap().content, "Hello Ada.\n");
    }

    #[test]
    fn terminal_state() {
        let mut engine = engine(":: Start\n+ [End] -> End\n:: End\nFin.\n");
        assert!(!engine.is_terminal());
        engine.start().unwrap();
        assert!(engine.has_choices());
        engine.choose(0).unwrap();
        assert!(engine.is_terminal());
        assert!(!engine.has_choices());
    }
}
