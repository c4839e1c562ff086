/// Save documents and the tiered value encoding.
///
/// Primitives and lists are written as plain JSON. Dictionaries and host
/// objects are wrapped in an [`Envelope`] whose `strategy` records how the
/// payload was produced, so loading can pick the matching reconstruction:
///
/// | strategy     | written from                 | restored by                         |
/// |--------------|------------------------------|-------------------------------------|
/// | `explicit`   | `Exportable::export`         | the type's registered importer      |
/// | `reflective` | `Reflectable::fields`        | importer, else blank + `set_attr`   |
/// | `string`     | `HostObject::display` (lossy)| importer on the string, else text   |
/// | `collection` | dictionaries                 | recursively                         |
///
/// Types the loading host does not know degrade to their raw payload with a
/// warning; a load never fails because of an unknown type.

use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as Json};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::core::host::HostRegistry;
use crate::schema::object::{Capability, HostObject, ObjectValue};
use crate::schema::value::{Value, VarMap};

/// Save document layout version. Documents with another version are rejected.
pub const FORMAT_VERSION: u32 = 1;

/// Envelope origin for engine-native types.
pub const BUILTIN_ORIGIN: &str = "builtin";

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("save format version {found} is not supported (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },
    #[error("saved passage '{0}' does not exist in this story")]
    UnknownPassage(String),
    #[error("malformed save document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Explicit,
    Reflective,
    String,
    Collection,
}

/// Serialized form of one non-primitive value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_name: String,
    pub origin: String,
    pub strategy: Strategy,
    pub payload: Json,
}

impl Envelope {
    fn builtin(type_name: &str, strategy: Strategy, payload: Json) -> Self {
        Self {
            type_name: type_name.to_string(),
            origin: BUILTIN_ORIGIN.to_string(),
            strategy,
            payload,
        }
    }

    fn into_json(self) -> Json {
        let mut map = JsonMap::new();
        map.insert("type".to_string(), Json::String(self.type_name));
        map.insert("origin".to_string(), Json::String(self.origin));
        map.insert(
            "strategy".to_string(),
            Json::String(strategy_name(self.strategy).to_string()),
        );
        map.insert("payload".to_string(), self.payload);
        Json::Object(map)
    }
}

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDocument {
    pub format_version: u32,
    #[serde(default)]
    pub story_version: Option<String>,
    pub story_id: String,
    /// Unix seconds.
    pub timestamp: u64,
    pub current_passage_id: String,
    /// Passage arguments of the current passage, as a `dict` envelope.
    #[serde(default)]
    pub current_args: Json,
    /// Session variables, as a `dict` envelope.
    pub state: Json,
    #[serde(default)]
    pub consumed_one_shot_choices: Vec<String>,
}

impl SaveDocument {
    pub fn check_version(&self) -> Result<(), SaveError> {
        if self.format_version == FORMAT_VERSION {
            Ok(())
        } else {
            Err(SaveError::IncompatibleVersion {
                found: self.format_version,
                expected: FORMAT_VERSION,
            })
        }
    }

    pub fn to_json(&self) -> Result<String, SaveError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SaveError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), SaveError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, SaveError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Non-fatal findings from a load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub warnings: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encode a variable map as a `dict` envelope. Returns lossy-encoding warnings.
pub fn encode_state(vars: &VarMap) -> (Json, Vec<String>) {
    let mut encoder = Encoder::default();
    let json = encoder.map(vars);
    (json, encoder.warnings)
}

pub fn encode_value(value: &Value) -> (Json, Vec<String>) {
    let mut encoder = Encoder::default();
    let json = encoder.value(value);
    (json, encoder.warnings)
}

/// Envelope for a single host object.
pub fn encode_object(obj: &ObjectValue) -> Envelope {
    Encoder::default().object(obj.get())
}

#[derive(Default)]
struct Encoder {
    warnings: Vec<String>,
}

impl Encoder {
    fn value(&mut self, value: &Value) -> Json {
        match value {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number(Number::from(*i)),
            Value::Float(f) => match Number::from_f64(*f) {
                Some(n) => Json::Number(n),
                None => Envelope::builtin("float", Strategy::String, Json::String(value.to_string())).into_json(),
            },
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(|item| self.value(item)).collect()),
            Value::Map(map) => self.map(map),
            Value::Object(obj) => self.object(obj.get()).into_json(),
        }
    }

    fn map(&mut self, map: &IndexMap<String, Value>) -> Json {
        let payload = map
            .iter()
            .map(|(key, value)| (key.clone(), self.value(value)))
            .collect::<JsonMap<String, Json>>();
        Envelope::builtin("dict", Strategy::Collection, Json::Object(payload)).into_json()
    }

    fn object(&mut self, obj: &dyn HostObject) -> Envelope {
        let (strategy, payload) = match obj.capability() {
            Capability::Exportable(exportable) => (Strategy::Explicit, self.value(&exportable.export())),
            Capability::Reflectable(reflectable) => {
                let fields = reflectable
                    .fields()
                    .iter()
                    .map(|(name, value)| (name.clone(), self.value(value)))
                    .collect::<JsonMap<String, Json>>();
                (Strategy::Reflective, Json::Object(fields))
            }
            Capability::Opaque => {
                let message = format!(
                    "'{}' has no export or reflection support; saved as its display text",
                    obj.type_name()
                );
                warn!("{}", message);
                self.warnings.push(message);
                (Strategy::String, Json::String(obj.display()))
            }
        };
        Envelope {
            type_name: obj.type_name().to_string(),
            origin: obj.origin().to_string(),
            strategy,
            payload,
        }
    }
}

/// Decode a `dict` envelope back into a variable map.
pub fn decode_state(json: &Json, registry: &HostRegistry) -> Result<(VarMap, Vec<String>), SaveError> {
    let mut decoder = Decoder {
        registry,
        warnings: Vec::new(),
    };
    match decoder.value(json) {
        Value::Map(map) => Ok((map, decoder.warnings)),
        Value::None => Ok((VarMap::default(), decoder.warnings)),
        other => Err(SaveError::Malformed(format!(
            "state must be a dict envelope, found {}",
            other.type_name()
        ))),
    }
}

pub fn decode_value(json: &Json, registry: &HostRegistry) -> (Value, Vec<String>) {
    let mut decoder = Decoder {
        registry,
        warnings: Vec::new(),
    };
    let value = decoder.value(json);
    (value, decoder.warnings)
}

struct Decoder<'r> {
    registry: &'r HostRegistry,
    warnings: Vec<String>,
}

impl Decoder<'_> {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn value(&mut self, json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(|item| self.value(item)).collect()),
            Json::Object(map) => match Envelope::deserialize(json) {
                Ok(envelope) => self.envelope(envelope),
                Err(_) => {
                    self.warn("object without an envelope header restored as a plain dict".to_string());
                    self.plain_map(map)
                }
            },
        }
    }

    fn plain_map(&mut self, map: &JsonMap<String, Json>) -> Value {
        Value::Map(map.iter().map(|(k, v)| (k.clone(), self.value(v))).collect())
    }

    fn envelope(&mut self, envelope: Envelope) -> Value {
        if envelope.origin == BUILTIN_ORIGIN {
            match (envelope.type_name.as_str(), envelope.strategy, &envelope.payload) {
                ("dict", Strategy::Collection, Json::Object(map)) => return self.plain_map(map),
                ("float", Strategy::String, Json::String(text)) => {
                    if let Some(f) = parse_special_float(text) {
                        return Value::Float(f);
                    }
                }
                _ => {}
            }
        }

        // Reflective payloads are bare field maps.
        let payload = match (envelope.strategy, &envelope.payload) {
            (Strategy::Reflective, Json::Object(fields)) => self.plain_map(fields),
            (_, other) => self.value(other),
        };
        let Some(entry) = self.registry.type_entry(&envelope.type_name) else {
            self.warn(format!(
                "unknown type '{}' from '{}'; restored as raw data",
                envelope.type_name, envelope.origin
            ));
            return payload;
        };
        let (import, blank) = (entry.import, entry.blank);

        if let Some(import) = import {
            match import(&payload) {
                Ok(obj) => return Value::Object(ObjectValue::from_box(obj)),
                Err(err) => self.warn(format!(
                    "importing saved '{}' failed: {}",
                    envelope.type_name, err
                )),
            }
        }

        if let (Some(blank), Value::Map(fields)) = (blank, &payload) {
            if envelope.strategy != Strategy::String {
                let mut obj = blank();
                let mut ok = true;
                for (name, value) in fields {
                    if let Err(err) = obj.set_attr(name, value.clone()) {
                        self.warn(format!(
                            "restoring field '{}' of '{}' failed: {}",
                            name, envelope.type_name, err
                        ));
                        ok = false;
                    }
                }
                if ok {
                    return Value::Object(ObjectValue::from_box(obj));
                }
            }
        }

        self.warn(format!(
            "'{}' could not be reconstructed from its {} payload; restored as raw data",
            envelope.type_name,
            strategy_name(envelope.strategy)
        ));
        payload
    }
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Explicit => "explicit",
        Strategy::Reflective => "reflective",
        Strategy::String => "string",
        Strategy::Collection => "collection",
    }
}

fn parse_special_float(text: &str) -> Option<f64> {
    match text {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::TypeEntry;
    use crate::core::script::EvalError;
    use crate::schema::object::{Exportable, Reflectable};

    #[derive(Debug, Clone)]
    struct Purse {
        gold: i64,
    }

    impl HostObject for Purse {
        fn type_name(&self) -> &str {
            "Purse"
        }
        fn get_attr(&self, name: &str) -> Option<Value> {
            (name == "gold").then(|| Value::Int(self.gold))
        }
        fn capability(&self) -> Capability<'_> {
            Capability::Exportable(self)
        }
        fn clone_box(&self) -> Box<dyn HostObject> {
            Box::new(self.clone())
        }
    }

    impl Exportable for Purse {
        fn export(&self) -> Value {
            Value::Int(self.gold)
        }
    }

    fn import_purse(value: &Value) -> Result<Box<dyn HostObject>, EvalError> {
        match value {
            Value::Int(gold) if *gold >= 0 => Ok(Box::new(Purse { gold: *gold })),
            _ => Err(EvalError::type_error("purse needs a non-negative amount")),
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Lantern {
        lit: bool,
    }

    impl HostObject for Lantern {
        fn type_name(&self) -> &str {
            "Lantern"
        }
        fn get_attr(&self, name: &str) -> Option<Value> {
            (name == "lit").then(|| Value::Bool(self.lit))
        }
        fn set_attr(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
            match name {
                "lit" => {
                    self.lit = value.is_truthy();
                    Ok(())
                }
                _ => Err(EvalError::Attribute {
                    type_name: "Lantern".to_string(),
                    attr: name.to_string(),
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

    impl Reflectable for Lantern {
        fn fields(&self) -> Vec<(String, Value)> {
            vec![("lit".to_string(), Value::Bool(self.lit))]
        }
    }

    #[derive(Debug, Clone)]
    struct Rune;

    impl HostObject for Rune {
        fn type_name(&self) -> &str {
            "Rune"
        }
        fn get_attr(&self, _name: &str) -> Option<Value> {
            None
        }
        fn display(&self) -> String {
            "ᚠ".to_string()
        }
        fn clone_box(&self) -> Box<dyn HostObject> {
            Box::new(self.clone())
        }
    }

    fn registry() -> HostRegistry {
        let mut registry = HostRegistry::new();
        registry
            .register_type(TypeEntry::new("Purse").importer(import_purse))
            .register_type(TypeEntry::new("Lantern").blank(|| Box::new(Lantern::default())));
        registry
    }

    #[test]
    fn primitives_and_lists_are_plain_json() {
        let (json, warnings) = encode_value(&Value::List(vec![Value::Int(1), Value::from("a"), Value::None]));
        assert!(warnings.is_empty());
        assert_eq!(json, serde_json::json!([1, "a", null]));
    }

    #[test]
    fn dicts_use_collection_envelopes() {
        let mut map = IndexMap::new();
        map.insert("hp".to_string(), Value::Int(3));
        let (json, _) = encode_value(&Value::Map(map.clone()));
        assert_eq!(json["strategy"], "collection");
        assert_eq!(json["payload"]["hp"], 3);
        let (back, warnings) = decode_value(&json, &registry());
        assert!(warnings.is_empty());
        assert_eq!(back, Value::Map(map));
    }

    #[test]
    fn non_finite_floats_survive() {
        let (json, _) = encode_value(&Value::Float(f64::INFINITY));
        assert_eq!(json["type"], "float");
        let (back, _) = decode_value(&json, &registry());
        assert!(matches!(back, Value::Float(f) if f.is_infinite()));
    }

    #[test]
    fn explicit_objects_use_the_importer() {
        let (json, _) = encode_value(&Value::Object(ObjectValue::new(Purse { gold: 12 })));
        assert_eq!(json["strategy"], "explicit");
        assert_eq!(json["payload"], 12);
        let (back, warnings) = decode_value(&json, &registry());
        assert!(warnings.is_empty());
        let Value::Object(obj) = back else {
            panic!("expected object");
        };
        assert_eq!(obj.get().get_attr("gold"), Some(Value::Int(12)));
    }

    #[test]
    fn failed_import_degrades_to_payload() {
        let json = serde_json::json!({"type": "Purse", "origin": "host", "strategy": "explicit", "payload": -4});
        let (back, warnings) = decode_value(&json, &registry());
        assert_eq!(back, Value::Int(-4));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn reflective_objects_use_blank_and_set_attr() {
        let (json, _) = encode_value(&Value::Object(ObjectValue::new(Lantern { lit: true })));
        assert_eq!(json["strategy"], "reflective");
        let (back, warnings) = decode_value(&json, &registry());
        assert!(warnings.is_empty());
        let Value::Object(obj) = back else {
            panic!("expected object");
        };
        assert_eq!(obj.get().get_attr("lit"), Some(Value::Bool(true)));
    }

    #[test]
    fn opaque_objects_are_lossy_strings() {
        let (json, warnings) = encode_value(&Value::Object(ObjectValue::new(Rune)));
        assert_eq!(json["strategy"], "string");
        assert_eq!(warnings.len(), 1);
        let (back, warnings) = decode_value(&json, &registry());
        assert_eq!(back, Value::from("ᚠ"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_types_degrade_with_a_warning() {
        let json = serde_json::json!({
            "type": "Dragon", "origin": "beasts", "strategy": "reflective",
            "payload": {"heads": 3}
        });
        let (back, warnings) = decode_value(&json, &registry());
        assert!(matches!(back, Value::Map(ref m) if m.get("heads") == Some(&Value::Int(3))));
        assert!(warnings[0].contains("Dragon"));
    }

    #[test]
    fn state_must_be_a_dict() {
        assert!(decode_state(&serde_json::json!([1, 2]), &registry()).is_err());
        let (vars, _) = decode_state(&Json::Null, &registry()).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn document_version_check() {
        let doc = SaveDocument {
            format_version: 99,
            story_version: None,
            story_id: "tower".to_string(),
            timestamp: 0,
            current_passage_id: "Start".to_string(),
            current_args: Json::Null,
            state: Json::Null,
            consumed_one_shot_choices: Vec::new(),
        };
        assert!(matches!(doc.check_version(), Err(SaveError::IncompatibleVersion { found: 99, .. })));
        let json = doc.to_json().unwrap();
        assert!(json.contains("\"currentPassageId\""));
        assert!(json.contains("\"consumedOneShotChoices\""));
    }
}
