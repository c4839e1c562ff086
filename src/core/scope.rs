/// Layered evaluation scope.
///
/// Lookup order is innermost frame first, then session state, then host
/// bindings (resolved by the evaluator), then builtins. Frame 0 holds the
/// passage arguments and any values created during a render pass.

use rand::rngs::StdRng;

use crate::core::host::Bindings;
use crate::schema::value::{Value, VarMap};

enum Globals<'a> {
    /// Execute phase: assignments reach session state.
    Owned(&'a mut VarMap),
    /// Render phase: state is read-only; writes land in frame 0.
    Shared(&'a VarMap),
}

pub struct Scope<'a> {
    globals: Globals<'a>,
    frames: Vec<VarMap>,
    rng: &'a mut StdRng,
    bindings: &'a Bindings,
}

impl<'a> Scope<'a> {
    pub fn owned(
        globals: &'a mut VarMap,
        locals: VarMap,
        rng: &'a mut StdRng,
        bindings: &'a Bindings,
    ) -> Self {
        Self {
            globals: Globals::Owned(globals),
            frames: vec![locals],
            rng,
            bindings,
        }
    }

    pub fn shared(
        globals: &'a VarMap,
        locals: VarMap,
        rng: &'a mut StdRng,
        bindings: &'a Bindings,
    ) -> Self {
        Self {
            globals: Globals::Shared(globals),
            frames: vec![locals],
            rng,
            bindings,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.globals, Globals::Shared(_))
    }

    fn global_map(&self) -> &VarMap {
        match &self.globals {
            Globals::Owned(map) => map,
            Globals::Shared(map) => map,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| self.global_map().get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn frame_index(&self, name: &str) -> Option<usize> {
        self.frames.iter().rposition(|frame| frame.contains_key(name))
    }

    /// Bind `name`, updating the innermost frame that already defines it.
    pub fn assign(&mut self, name: &str, value: Value) {
        if let Some(idx) = self.frame_index(name) {
            self.frames[idx].insert(name.to_string(), value);
            return;
        }
        match &mut self.globals {
            Globals::Owned(map) => {
                map.insert(name.to_string(), value);
            }
            Globals::Shared(_) => {
                self.frames[0].insert(name.to_string(), value);
            }
        }
    }

    /// Bind `name` in the innermost frame (loop and comprehension variables).
    pub fn set_local(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    /// Mutable slot for in-place updates. In shared mode a state variable is
    /// first copied into frame 0, so the session never changes.
    pub fn place_mut(&mut self, name: &str) -> Option<&mut Value> {
        if let Some(idx) = self.frame_index(name) {
            return self.frames[idx].get_mut(name);
        }
        match &mut self.globals {
            Globals::Owned(map) => map.get_mut(name),
            Globals::Shared(map) => {
                let copy = map.get(name)?.clone();
                self.frames[0].insert(name.to_string(), copy);
                self.frames[0].get_mut(name)
            }
        }
    }

    pub fn push_frame(&mut self) {
        self.frames.push(VarMap::new());
    }

    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut *self.rng
    }

    pub fn bindings(&self) -> &'a Bindings {
        self.bindings
    }

    /// Frame 0 after evaluation: passage arguments plus pass-local values.
    pub fn into_locals(mut self) -> VarMap {
        self.frames.truncate(1);
        self.frames.pop().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn owned_assignments_reach_state_unless_shadowed() {
        let mut vars = VarMap::new();
        vars.insert("gold".to_string(), Value::Int(1));
        let mut locals = VarMap::new();
        locals.insert("who".to_string(), Value::from("Ada"));
        let mut rng = StdRng::seed_from_u64(1);
        let bindings = Bindings::default();

        let mut scope = Scope::owned(&mut vars, locals, &mut rng, &bindings);
        scope.assign("gold", Value::Int(2));
        scope.assign("who", Value::from("Grace"));
        let locals = scope.into_locals();

        assert_eq!(vars.get("gold"), Some(&Value::Int(2)));
        assert!(!vars.contains_key("who"));
        assert_eq!(locals.get("who"), Some(&Value::from("Grace")));
    }

    #[test]
    fn shared_scope_never_touches_state() {
        let mut vars = VarMap::new();
        vars.insert("items".to_string(), Value::List(vec![]));
        let mut rng = StdRng::seed_from_u64(1);
        let bindings = Bindings::default();

        let mut scope = Scope::shared(&vars, VarMap::new(), &mut rng, &bindings);
        if let Some(Value::List(items)) = scope.place_mut("items") {
            items.push(Value::Int(1));
        }
        scope.assign("fresh", Value::Bool(true));
        assert_eq!(scope.get("items"), Some(&Value::List(vec![Value::Int(1)])));
        let locals = scope.into_locals();

        assert_eq!(vars.get("items"), Some(&Value::List(vec![])));
        assert!(locals.contains_key("fresh"));
    }

    #[test]
    fn inner_frames_shadow_and_pop() {
        let mut vars = VarMap::new();
        let mut rng = StdRng::seed_from_u64(1);
        let bindings = Bindings::default();
        let mut scope = Scope::owned(&mut vars, VarMap::new(), &mut rng, &bindings);
        scope.assign("x", Value::Int(1));
        scope.push_frame();
        scope.set_local("x", Value::Int(2));
        assert_eq!(scope.get("x"), Some(&Value::Int(2)));
        scope.pop_frame();
        assert_eq!(scope.get("x"), Some(&Value::Int(1)));
    }
}
