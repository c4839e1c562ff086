/// Host object capabilities.
///
/// Stories can hold instances of host-defined types. The engine only sees
/// them through `HostObject`; save/load picks a serialization tier from the
/// object's `Capability`, never from ad hoc type inspection.

use std::fmt;

use super::value::{CallArgs, Value};
use crate::core::script::EvalError;

/// An object type provided by the hosting application.
///
/// Objects have value semantics inside the engine: assigning one to a
/// second variable copies it via `clone_box`.
pub trait HostObject: fmt::Debug + Send + Sync {
    /// Type name used in envelopes and registry lookups.
    fn type_name(&self) -> &str;

    /// Module or scope the type was registered under.
    fn origin(&self) -> &str {
        "host"
    }

    fn get_attr(&self, name: &str) -> Option<Value>;

    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), EvalError> {
        Err(EvalError::Attribute {
            type_name: self.type_name().to_string(),
            attr: name.to_string(),
        })
    }

    fn call_method(&mut self, name: &str, _args: CallArgs) -> Result<Value, EvalError> {
        Err(EvalError::Attribute {
            type_name: self.type_name().to_string(),
            attr: name.to_string(),
        })
    }

    /// Text used for interpolation and the string serialization tier.
    fn display(&self) -> String {
        format!("<{} object>", self.type_name())
    }

    fn capability(&self) -> Capability<'_> {
        Capability::Opaque
    }

    fn clone_box(&self) -> Box<dyn HostObject>;

    fn equals(&self, other: &dyn HostObject) -> bool {
        self.type_name() == other.type_name() && self.display() == other.display()
    }
}

/// Explicit self-export. The matching import lives on the registry entry,
/// so restoring goes through the type's own constructing logic.
pub trait Exportable {
    fn export(&self) -> Value;
}

/// Enumerable named fields.
pub trait Reflectable {
    fn fields(&self) -> Vec<(String, Value)>;
}

/// Which serialization tier an object supports.
pub enum Capability<'a> {
    Exportable(&'a dyn Exportable),
    Reflectable(&'a dyn Reflectable),
    Opaque,
}

/// Owned, clonable handle to a host object stored in a `Value`.
pub struct ObjectValue(Box<dyn HostObject>);

impl ObjectValue {
    pub fn new(obj: impl HostObject + 'static) -> Self {
        Self(Box::new(obj))
    }

    pub fn from_box(obj: Box<dyn HostObject>) -> Self {
        Self(obj)
    }

    pub fn get(&self) -> &dyn HostObject {
        self.0.as_ref()
    }

    pub fn get_mut(&mut self) -> &mut dyn HostObject {
        self.0.as_mut()
    }

    pub fn type_name(&self) -> &str {
        self.0.type_name()
    }

    pub fn display(&self) -> String {
        self.0.display()
    }
}

impl Clone for ObjectValue {
    fn clone(&self) -> Self {
        Self(self.0.clone_box())
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.equals(other.0.as_ref())
    }
}
