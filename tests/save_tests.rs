/// Save/load integration tests: sessions with host objects.

use bard_engine::core::compiler::compile_file;
use bard_engine::core::engine::{Engine, EngineError};
use bard_engine::core::host::TypeEntry;
use bard_engine::core::save::{SaveDocument, SaveError};
use bard_engine::core::script::EvalError;
use bard_engine::schema::object::{Capability, Exportable, HostObject, Reflectable};
use bard_engine::schema::story::StoryIr;
use bard_engine::schema::value::{CallArgs, Value};
use indexmap::IndexMap;
use std::path::Path;

/// A tarot card. Saved through its own export/import pair.
#[derive(Debug, Clone)]
struct Card {
    name: String,
    number: i64,
}

impl HostObject for Card {
    fn type_name(&self) -> &str {
        "Card"
    }

    fn origin(&self) -> &str {
        "tarot"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::from(self.name.as_str())),
            "number" => Some(Value::Int(self.number)),
            _ => None,
        }
    }

    fn display(&self) -> String {
        format!("{} ({})", self.name, self.number)
    }

    fn capability(&self) -> Capability<'_> {
        Capability::Exportable(self)
    }

    fn clone_box(&self) -> Box<dyn HostObject> {
        Box::new(self.clone())
    }
}

impl Exportable for Card {
    fn export(&self) -> Value {
        let mut map = IndexMap::new();
        map.insert("name".to_string(), Value::from(self.name.as_str()));
        map.insert("number".to_string(), Value::Int(self.number));
        Value::Map(map)
    }
}

fn new_card(args: CallArgs) -> Result<Box<dyn HostObject>, EvalError> {
    let name = args.get(0, "name").and_then(Value::as_str).map(str::to_string);
    let number = args.get(1, "number").and_then(Value::as_i64);
    match (name, number) {
        (Some(name), Some(number)) => Ok(Box::new(Card { name, number })),
        _ => Err(EvalError::Type("Card(name, number)".to_string())),
    }
}

fn import_card(value: &Value) -> Result<Box<dyn HostObject>, EvalError> {
    let Value::Map(map) = value else {
        return Err(EvalError::Type("card export must be a dict".to_string()));
    };
    let mut args = CallArgs::new();
    for key in ["name", "number"] {
        if let Some(v) = map.get(key) {
            args.named.insert(key.to_string(), v.clone());
        }
    }
    new_card(args)
}

/// A deck of card names. Saved reflectively.
#[derive(Debug, Clone, Default)]
struct Deck {
    cards: Vec<String>,
}

impl HostObject for Deck {
    fn type_name(&self) -> &str {
        "Deck"
    }

    fn origin(&self) -> &str {
        "tarot"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        (name == "cards").then(|| Value::List(self.cards.iter().map(|c| Value::from(c.as_str())).collect()))
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        match (name, value) {
            ("cards", Value::List(items)) => {
                self.cards = items.iter().map(|v| v.to_string()).collect();
                Ok(())
            }
            (name, _) => Err(EvalError::Attribute {
                type_name: "Deck".to_string(),
                attr: name.to_string(),
            }),
        }
    }

    fn call_method(&mut self, name: &str, _args: CallArgs) -> Result<Value, EvalError> {
        match name {
            "draw" if !self.cards.is_empty() => Ok(Value::from(self.cards.remove(0))),
            "draw" => Err(EvalError::Host("the deck is empty".to_string())),
            other => Err(EvalError::Attribute {
                type_name: "Deck".to_string(),
                attr: other.to_string(),
            }),
        }
    }

    fn capability(&self) -> Capability<'_> {
        Capability::Reflectable(self)
    }

    fn clone_box(&self) -> Box<dyn HostObject> {
        Box::new(self.clone())
    }
}

impl Reflectable for Deck {
    fn fields(&self) -> Vec<(String, Value)> {
        vec![("cards".to_string(), self.get_attr("cards").unwrap_or_default())]
    }
}

fn new_deck(args: CallArgs) -> Result<Box<dyn HostObject>, EvalError> {
    let mut deck = Deck::default();
    if let Some(cards) = args.get(0, "cards") {
        deck.set_attr("cards", cards.clone())?;
    }
    Ok(Box::new(deck))
}

fn tarot_story() -> StoryIr {
    compile_file(Path::new("tests/fixtures/tarot.bard")).unwrap()
}

fn tarot_engine(story: StoryIr) -> Engine {
    Engine::builder(story)
        .seed(3)
        .register_type(
            TypeEntry::new("Card")
                .origin("tarot")
                .constructor(new_card)
                .importer(import_card),
        )
        .register_type(
            TypeEntry::new("Deck")
                .origin("tarot")
                .constructor(new_deck)
                .blank(|| Box::new(Deck::default())),
        )
        .build()
        .unwrap()
}

fn card_count(engine: &Engine) -> usize {
    match engine.var("deck") {
        Some(Value::Object(deck)) => match deck.get().get_attr("cards") {
            Some(Value::List(cards)) => cards.len(),
            _ => panic!("deck has no cards list"),
        },
        other => panic!("expected a deck, got {:?}", other),
    }
}

#[test]
fn tarot_story_plays_with_host_types() {
    let mut engine = tarot_engine(tarot_story());
    assert!(engine.import_warnings().is_empty());

    let out = engine.start().unwrap();
    assert_eq!(out.passage_id, "Table");
    assert!(out.content.contains("3 cards remain"));
    assert_eq!(out.directives[0].name, "card_spread");
    assert_eq!(out.directives[0].presentation_hint.as_deref(), Some("card"));

    let out = engine.choose(0).unwrap();
    assert_eq!(out.content, "You draw Sun.\n");
    assert_eq!(card_count(&engine), 2);
    assert_eq!(engine.var("luck"), Some(&Value::Float(0.75)));
}

#[test]
fn save_document_uses_envelopes() {
    let mut engine = tarot_engine(tarot_story());
    engine.start().unwrap();
    let doc = engine.save().unwrap();
    assert_eq!(doc.story_id, "tarot");
    assert_eq!(doc.current_passage_id, "Table");

    let state = &doc.state["payload"];
    assert_eq!(state["card"]["type"], "Card");
    assert_eq!(state["card"]["origin"], "tarot");
    assert_eq!(state["card"]["strategy"], "explicit");
    assert_eq!(state["deck"]["strategy"], "reflective");
    assert_eq!(state["deck"]["payload"]["cards"][2], "Star");
    assert_eq!(state["notes"]["type"], "dict");
    assert_eq!(state["notes"]["payload"]["draws"][1], 2);
    assert_eq!(state["luck"], 0.5);

    let json = doc.to_json().unwrap();
    assert_eq!(SaveDocument::from_json(&json).unwrap(), doc);
}

#[test]
fn load_restores_the_session_without_executing() {
    let mut engine = tarot_engine(tarot_story());
    engine.start().unwrap();
    engine.choose(0).unwrap();
    let json = engine.save().unwrap().to_json().unwrap();

    engine.choose(0).unwrap();
    engine.choose(0).unwrap();
    assert_eq!(card_count(&engine), 1);
    assert_eq!(engine.var("drawn"), Some(&Value::from("Moon")));

    let doc = SaveDocument::from_json(&json).unwrap();
    let report = engine.load(&doc).unwrap();
    assert!(report.is_clean(), "{:?}", report.warnings);

    let out = engine.current().unwrap();
    assert_eq!(out.passage_id, "Draw");
    assert_eq!(out.content, "You draw Sun.\n");
    assert_eq!(card_count(&engine), 2);
    assert_eq!(engine.var("luck"), Some(&Value::Float(0.75)));
    match engine.var("card") {
        Some(Value::Object(card)) => assert_eq!(card.display(), "Sun (1)"),
        other => panic!("expected a card, got {:?}", other),
    }

    // Play continues from the restored state.
    let out = engine.choose(0).unwrap();
    assert!(out.content.contains("2 cards remain"));
}

#[test]
fn loading_into_a_fresh_engine() {
    let story = tarot_story();
    let mut first = tarot_engine(story.clone());
    first.start().unwrap();
    let doc = first.save().unwrap();

    let mut second = tarot_engine(story);
    assert!(matches!(second.current(), Err(EngineError::NotStarted)));
    second.load(&doc).unwrap();
    let (a, b) = (first.current().unwrap(), second.current().unwrap());
    assert_eq!(b.passage_id, a.passage_id);
    assert_eq!(b.content, a.content);
    assert_eq!(b.choices, a.choices);
    assert_eq!(b.directives, a.directives);
    assert_eq!(b.visited, vec!["Table"]);
}

#[test]
fn one_shot_choices_stay_consumed_after_load() {
    let story = compile_file(Path::new("tests/fixtures/one_shots.bard")).unwrap();
    let mut engine = Engine::new(story.clone()).unwrap();
    engine.start().unwrap();
    engine.choose(0).unwrap();
    let doc = engine.save().unwrap();
    assert_eq!(doc.consumed_one_shot_choices, vec!["Tavern#0"]);

    let mut restored = Engine::new(story).unwrap();
    restored.load(&doc).unwrap();
    assert!(restored.is_consumed("Tavern#0"));
    let out = restored.current().unwrap();
    assert_eq!(
        out.choice_texts(),
        vec!["Ask about the weather", "Ask about the ghost"]
    );
}

#[test]
fn mismatched_story_loads_with_a_warning() {
    let mut engine = tarot_engine(tarot_story());
    engine.start().unwrap();
    let mut doc = engine.save().unwrap();
    doc.story_id = "another_story".to_string();
    let report = engine.load(&doc).unwrap();
    assert!(report.warnings.iter().any(|w| w.contains("another_story")));
}

#[test]
fn unregistered_types_degrade_to_raw_data() {
    let story = tarot_story();
    let mut engine = tarot_engine(story.clone());
    engine.start().unwrap();
    let doc = engine.save().unwrap();

    let mut bare = Engine::new(story).unwrap();
    assert!(!bare.import_warnings().is_empty());
    let report = bare.load(&doc).unwrap();
    assert!(report.warnings.iter().any(|w| w.contains("'Card'")));
    assert!(report.warnings.iter().any(|w| w.contains("'Deck'")));
    match bare.var("deck") {
        Some(Value::Map(fields)) => assert_eq!(fields["cards"], Value::List(vec![
            Value::from("Sun"),
            Value::from("Moon"),
            Value::from("Star"),
        ])),
        other => panic!("expected raw deck data, got {:?}", other),
    }
}

#[test]
fn rejected_documents_leave_the_session_alone() {
    let mut engine = tarot_engine(tarot_story());
    engine.start().unwrap();
    let before = engine.current().unwrap().clone();

    let mut doc = engine.save().unwrap();
    doc.format_version = 2;
    assert!(matches!(
        engine.load(&doc),
        Err(EngineError::Save(SaveError::IncompatibleVersion { found: 2, .. }))
    ));

    let mut doc = engine.save().unwrap();
    doc.current_passage_id = "Attic".to_string();
    assert!(matches!(
        engine.load(&doc),
        Err(EngineError::Save(SaveError::UnknownPassage(_)))
    ));

    assert_eq!(engine.current().unwrap(), &before);
}

#[test]
fn save_requires_a_started_session() {
    let engine = tarot_engine(tarot_story());
    assert!(matches!(engine.save(), Err(EngineError::NotStarted)));
}
