/// Host registry: object types and functions a story may use.
///
/// Everything registered here is bound by name for every story. A story's
/// `from module import Name as Alias` lines add aliases; `import module`
/// makes `module.Name` reachable. Imports the registry cannot satisfy are
/// reported as warnings when the engine is built.

use indexmap::IndexMap;
use log::warn;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::script::EvalError;
use crate::schema::object::HostObject;
use crate::schema::story::ImportDecl;
use crate::schema::value::{CallArgs, Value};

/// Module name used when a type or function is registered without one.
pub const DEFAULT_MODULE: &str = "host";

pub type HostFn = Arc<dyn Fn(CallArgs) -> Result<Value, EvalError> + Send + Sync>;

pub type Constructor = fn(CallArgs) -> Result<Box<dyn HostObject>, EvalError>;
pub type Importer = fn(&Value) -> Result<Box<dyn HostObject>, EvalError>;
pub type BlankFactory = fn() -> Box<dyn HostObject>;

/// A host-defined object type.
///
/// `import` is the counterpart of `Exportable::export` and should go through
/// the type's normal validating construction. `blank` is only used to restore
/// reflectively saved objects whose type has no importer.
#[derive(Clone)]
pub struct TypeEntry {
    pub name: String,
    pub origin: String,
    pub construct: Option<Constructor>,
    pub import: Option<Importer>,
    pub blank: Option<BlankFactory>,
}

impl TypeEntry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            origin: DEFAULT_MODULE.to_string(),
            construct: None,
            import: None,
            blank: None,
        }
    }

    pub fn origin(mut self, module: &str) -> Self {
        self.origin = module.to_string();
        self
    }

    pub fn constructor(mut self, f: Constructor) -> Self {
        self.construct = Some(f);
        self
    }

    pub fn importer(mut self, f: Importer) -> Self {
        self.import = Some(f);
        self
    }

    pub fn blank(mut self, f: BlankFactory) -> Self {
        self.blank = Some(f);
        self
    }
}

impl fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("construct", &self.construct.is_some())
            .field("import", &self.import.is_some())
            .field("blank", &self.blank.is_some())
            .finish()
    }
}

/// What a name in scope refers to when it is not a variable.
#[derive(Clone)]
pub enum Binding {
    Function(HostFn),
    Type(Arc<TypeEntry>),
    Value(Value),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => write!(f, "Function(..)"),
            Self::Type(entry) => write!(f, "Type({})", entry.name),
            Self::Value(value) => write!(f, "Value({:?})", value),
        }
    }
}

/// Name → binding table handed to every evaluation scope.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    names: FxHashMap<String, Binding>,
}

impl Bindings {
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.names.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn insert(&mut self, name: &str, binding: Binding) {
        self.names.insert(name.to_string(), binding);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct HostRegistry {
    modules: IndexMap<String, IndexMap<String, Binding>>,
    types: FxHashMap<String, Arc<TypeEntry>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, entry: TypeEntry) -> &mut Self {
        let entry = Arc::new(entry);
        self.modules
            .entry(entry.origin.clone())
            .or_default()
            .insert(entry.name.clone(), Binding::Type(Arc::clone(&entry)));
        self.types.insert(entry.name.clone(), entry);
        self
    }

    pub fn register_fn<F>(&mut self, module: &str, name: &str, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), Binding::Function(Arc::new(f)));
        self
    }

    /// Register a function in the default module.
    pub fn bind_fn<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(CallArgs) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.register_fn(DEFAULT_MODULE, name, f)
    }

    /// Register a constant.
    pub fn bind_value(&mut self, module: &str, name: &str, value: Value) -> &mut Self {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), Binding::Value(value));
        self
    }

    pub fn type_entry(&self, name: &str) -> Option<&TypeEntry> {
        self.types.get(name).map(|entry| entry.as_ref())
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    /// Build the binding table for a story, returning unresolved-import warnings.
    pub fn bindings(&self, imports: &[ImportDecl]) -> (Bindings, Vec<String>) {
        let mut bindings = Bindings::default();
        for (module, exports) in &self.modules {
            for (name, binding) in exports {
                bindings.insert(name, binding.clone());
                bindings.insert(&format!("{}.{}", module, name), binding.clone());
            }
        }

        let mut warnings = Vec::new();
        for decl in imports {
            let Some(exports) = self.modules.get(&decl.module) else {
                let message = format!(
                    "line {}: module '{}' is not registered with the engine",
                    decl.line, decl.module
                );
                warn!("{}", message);
                warnings.push(message);
                continue;
            };
            for import in &decl.names {
                match exports.get(&import.name) {
                    Some(binding) => bindings.insert(import.bound_name(), binding.clone()),
                    None => {
                        let message = format!(
                            "line {}: cannot import '{}' from '{}'",
                            decl.line, import.name, decl.module
                        );
                        warn!("{}", message);
                        warnings.push(message);
                    }
                }
            }
        }
        (bindings, warnings)
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (module, exports) in &self.modules {
            map.entry(module, &exports.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::story::ImportName;

    fn registry() -> HostRegistry {
        let mut registry = HostRegistry::new();
        registry
            .register_fn("dice", "roll", |args| {
                Ok(args.get(0, "sides").cloned().unwrap_or(Value::Int(6)))
            })
            .bind_value("dice", "SIDES", Value::Int(20));
        registry
    }

    #[test]
    fn registered_names_are_bound_plain_and_qualified() {
        let (bindings, warnings) = registry().bindings(&[]);
        assert!(warnings.is_empty());
        assert!(bindings.contains("roll"));
        assert!(bindings.contains("dice.roll"));
        assert!(matches!(bindings.get("SIDES"), Some(Binding::Value(Value::Int(20)))));
    }

    #[test]
    fn aliases_and_unresolved_imports() {
        let imports = vec![
            ImportDecl {
                module: "dice".to_string(),
                names: vec![
                    ImportName {
                        name: "roll".to_string(),
                        alias: Some("d".to_string()),
                    },
                    ImportName {
                        name: "missing".to_string(),
                        alias: None,
                    },
                ],
                line: 1,
            },
            ImportDecl {
                module: "tarot".to_string(),
                names: vec![],
                line: 2,
            },
        ];
        let (bindings, warnings) = registry().bindings(&imports);
        assert!(bindings.contains("d"));
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("missing"));
        assert!(warnings[1].contains("tarot"));
    }
}
