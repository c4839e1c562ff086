/// Tree-walking evaluator for parsed expressions and statements.

use indexmap::IndexMap;

use super::builtins;
use super::parser::{BinOp, CmpOp, CompClause, Expr, Stmt, UnaryOp};
use super::EvalError;
use crate::core::host::Binding;
use crate::core::scope::Scope;
use crate::schema::object::ObjectValue;
use crate::schema::value::{CallArgs, Value};

pub fn eval_expr(expr: &Expr, scope: &mut Scope<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => lookup(name, scope),
        Expr::List(items) => items
            .iter()
            .map(|item| eval_expr(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Dict(entries) => {
            let mut map = IndexMap::new();
            for (key, value) in entries {
                let key = dict_key(&eval_expr(key, scope)?)?;
                let value = eval_expr(value, scope)?;
                map.insert(key, value);
            }
            Ok(Value::Map(map))
        }
        Expr::Unary(op, operand) => {
            let value = eval_expr(operand, scope)?;
            unary(*op, &value)
        }
        Expr::Binary(op, left, right) => {
            let left = eval_expr(left, scope)?;
            let right = eval_expr(right, scope)?;
            binary(*op, &left, &right)
        }
        Expr::And(left, right) => {
            let left = eval_expr(left, scope)?;
            if left.is_truthy() {
                eval_expr(right, scope)
            } else {
                Ok(left)
            }
        }
        Expr::Or(left, right) => {
            let left = eval_expr(left, scope)?;
            if left.is_truthy() {
                Ok(left)
            } else {
                eval_expr(right, scope)
            }
        }
        Expr::Compare(first, chain) => {
            let mut left = eval_expr(first, scope)?;
            for (op, right) in chain {
                let right = eval_expr(right, scope)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if eval_expr(cond, scope)?.is_truthy() {
                eval_expr(then, scope)
            } else {
                eval_expr(otherwise, scope)
            }
        }
        Expr::Attr(base, attr) => {
            if let Some(binding) = qualified_binding(base, attr, scope) {
                return match binding {
                    Binding::Value(value) => Ok(value),
                    _ => Err(EvalError::type_error(format!(
                        "'{}' must be called",
                        attr
                    ))),
                };
            }
            let value = eval_expr(base, scope)?;
            get_attribute(&value, attr)
        }
        Expr::Index(base, index) => {
            let container = eval_expr(base, scope)?;
            let key = eval_expr(index, scope)?;
            index_value(&container, &key)
        }
        Expr::Slice { base, start, end } => {
            let container = eval_expr(base, scope)?;
            let start = match start {
                Some(expr) => eval_expr(expr, scope)?,
                None => Value::None,
            };
            let end = match end {
                Some(expr) => eval_expr(expr, scope)?,
                None => Value::None,
            };
            slice_value(&container, &start, &end)
        }
        Expr::Call { func, args, kwargs } => {
            let mut call_args = CallArgs::new();
            for arg in args {
                call_args.positional.push(eval_expr(arg, scope)?);
            }
            for (name, arg) in kwargs {
                let value = eval_expr(arg, scope)?;
                call_args.named.insert(name.clone(), value);
            }
            call(func, call_args, scope)
        }
        Expr::ListComp { element, clauses } => {
            let mut out = Vec::new();
            scope.push_frame();
            let result = comprehend(clauses, 0, scope, &mut |scope| {
                out.push(eval_expr(element, scope)?);
                Ok(())
            });
            scope.pop_frame();
            result.map(|_| Value::List(out))
        }
        Expr::DictComp {
            key,
            value,
            clauses,
        } => {
            let mut out = IndexMap::new();
            scope.push_frame();
            let result = comprehend(clauses, 0, scope, &mut |scope| {
                let k = dict_key(&eval_expr(key, scope)?)?;
                let v = eval_expr(value, scope)?;
                out.insert(k, v);
                Ok(())
            });
            scope.pop_frame();
            result.map(|_| Value::Map(out))
        }
    }
}

pub fn exec_stmt(stmt: &Stmt, scope: &mut Scope<'_>) -> Result<(), EvalError> {
    match stmt {
        Stmt::Expr(expr) => eval_expr(expr, scope).map(|_| ()),
        Stmt::Assign { target, op, value } => {
            let rhs = eval_expr(value, scope)?;
            let new_value = match BinOp::from_assign(*op) {
                None => rhs,
                Some(bin_op) => {
                    let current = eval_expr(target, scope)?;
                    binary(bin_op, &current, &rhs)?
                }
            };
            assign_to(target, new_value, scope)
        }
    }
}

/// Turn a value into the items a `for` loop walks: list items, string
/// characters or dict keys.
pub fn iterate(value: &Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Map(map) => Ok(map.keys().map(|k| Value::Str(k.clone())).collect()),
        other => Err(EvalError::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Bind loop variables, unpacking when there is more than one.
pub fn bind_targets(targets: &[String], item: Value, scope: &mut Scope<'_>) -> Result<(), EvalError> {
    if let [single] = targets {
        scope.set_local(single, item);
        return Ok(());
    }
    match item {
        Value::List(parts) if parts.len() == targets.len() => {
            for (name, part) in targets.iter().zip(parts) {
                scope.set_local(name, part);
            }
            Ok(())
        }
        other => Err(EvalError::type_error(format!(
            "cannot unpack {} into {} variables",
            other.type_name(),
            targets.len()
        ))),
    }
}

fn comprehend<'a>(
    clauses: &[CompClause],
    depth: usize,
    scope: &mut Scope<'a>,
    emit: &mut dyn FnMut(&mut Scope<'a>) -> Result<(), EvalError>,
) -> Result<(), EvalError> {
    let Some(clause) = clauses.get(depth) else {
        return emit(scope);
    };
    let items = iterate(&eval_expr(&clause.iter, scope)?)?;
    'items: for item in items {
        bind_targets(&clause.targets, item, scope)?;
        for condition in &clause.conditions {
            if !eval_expr(condition, scope)?.is_truthy() {
                continue 'items;
            }
        }
        comprehend(clauses, depth + 1, scope, emit)?;
    }
    Ok(())
}

fn lookup(name: &str, scope: &Scope<'_>) -> Result<Value, EvalError> {
    if let Some(value) = scope.get(name) {
        return Ok(value.clone());
    }
    match scope.bindings().get(name) {
        Some(Binding::Value(value)) => Ok(value.clone()),
        Some(_) => Err(EvalError::type_error(format!("'{}' must be called", name))),
        None if builtins::is_builtin(name) => {
            Err(EvalError::type_error(format!("'{}' must be called", name)))
        }
        None => Err(EvalError::UndefinedName(name.to_string())),
    }
}

/// `module.name` where `module` is not a variable but an imported module.
fn qualified_binding(base: &Expr, attr: &str, scope: &Scope<'_>) -> Option<Binding> {
    let Expr::Name(module) = base else {
        return None;
    };
    if scope.contains(module) {
        return None;
    }
    scope
        .bindings()
        .get(&format!("{}.{}", module, attr))
        .cloned()
}

fn call(func: &Expr, args: CallArgs, scope: &mut Scope<'_>) -> Result<Value, EvalError> {
    match func {
        Expr::Name(name) => {
            if let Some(value) = scope.get(name) {
                return Err(EvalError::type_error(format!(
                    "'{}' object is not callable",
                    value.type_name()
                )));
            }
            if let Some(binding) = scope.bindings().get(name) {
                return call_binding(name, binding, args);
            }
            builtins::call_builtin(name, args, scope)
                .unwrap_or_else(|| Err(EvalError::UndefinedName(name.clone())))
        }
        Expr::Attr(base, method) => {
            if let Some(binding) = qualified_binding(base, method, scope) {
                return call_binding(method, &binding, args);
            }
            let receiver = eval_expr(base, scope)?;
            if builtins::mutates(&receiver, method) && base.is_place() {
                with_place_mut(base, scope, &mut |slot| {
                    builtins::call_method(slot, method, args.clone())
                })
            } else {
                let mut receiver = receiver;
                builtins::call_method(&mut receiver, method, args)
            }
        }
        _ => Err(EvalError::type_error("expression is not callable")),
    }
}

fn call_binding(name: &str, binding: &Binding, args: CallArgs) -> Result<Value, EvalError> {
    match binding {
        Binding::Function(f) => f(args),
        Binding::Type(entry) => match entry.construct {
            Some(construct) => construct(args).map(|obj| Value::Object(ObjectValue::from_box(obj))),
            None => Err(EvalError::type_error(format!(
                "type '{}' cannot be constructed from a story",
                entry.name
            ))),
        },
        Binding::Value(value) => Err(EvalError::type_error(format!(
            "'{}' ({}) is not callable",
            name,
            value.type_name()
        ))),
    }
}

/// Run `f` against the storage slot named by a place expression.
///
/// Attribute places on host objects are read, updated, then written back
/// through `set_attr`.
fn with_place_mut(
    expr: &Expr,
    scope: &mut Scope<'_>,
    f: &mut dyn FnMut(&mut Value) -> Result<Value, EvalError>,
) -> Result<Value, EvalError> {
    match expr {
        Expr::Name(name) => match scope.place_mut(name) {
            Some(slot) => f(slot),
            None => Err(EvalError::UndefinedName(name.clone())),
        },
        Expr::Index(base, index) => {
            let key = eval_expr(index, scope)?;
            with_place_mut(base, scope, &mut |container| {
                let slot = index_slot(container, &key)?;
                f(slot)
            })
        }
        Expr::Attr(base, attr) => with_place_mut(base, scope, &mut |container| match container {
            Value::Object(obj) => {
                let mut field = obj.get().get_attr(attr).ok_or_else(|| EvalError::Attribute {
                    type_name: obj.type_name().to_string(),
                    attr: attr.clone(),
                })?;
                let result = f(&mut field)?;
                obj.get_mut().set_attr(attr, field)?;
                Ok(result)
            }
            other => Err(EvalError::Attribute {
                type_name: other.type_name().to_string(),
                attr: attr.clone(),
            }),
        }),
        _ => Err(EvalError::type_error("cannot modify the result of an expression")),
    }
}

fn assign_to(target: &Expr, value: Value, scope: &mut Scope<'_>) -> Result<(), EvalError> {
    let mut pending = Some(value);
    match target {
        Expr::Name(name) => {
            scope.assign(name, pending.take().unwrap_or_default());
            Ok(())
        }
        Expr::Index(base, index) => {
            let key = eval_expr(index, scope)?;
            with_place_mut(base, scope, &mut |container| {
                set_index(container, &key, pending.take().unwrap_or_default())?;
                Ok(Value::None)
            })
            .map(|_| ())
        }
        Expr::Attr(base, attr) => with_place_mut(base, scope, &mut |container| match container {
            Value::Object(obj) => {
                obj.get_mut()
                    .set_attr(attr, pending.take().unwrap_or_default())?;
                Ok(Value::None)
            }
            other => Err(EvalError::Attribute {
                type_name: other.type_name().to_string(),
                attr: attr.clone(),
            }),
        })
        .map(|_| ()),
        _ => Err(EvalError::type_error("invalid assignment target")),
    }
}

pub(crate) fn dict_key(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(EvalError::type_error(format!(
            "dict keys must be strings, not '{}'",
            other.type_name()
        ))),
    }
}

fn get_attribute(value: &Value, attr: &str) -> Result<Value, EvalError> {
    let found = match value {
        Value::Object(obj) => obj.get().get_attr(attr),
        _ => None,
    };
    found.ok_or_else(|| EvalError::Attribute {
        type_name: value.type_name().to_string(),
        attr: attr.to_string(),
    })
}

fn normalize_index(index: &Value, len: usize) -> Result<usize, EvalError> {
    let i = index.as_i64().ok_or_else(|| {
        EvalError::type_error(format!("indices must be integers, not '{}'", index.type_name()))
    })?;
    let len = len as i64;
    let resolved = if i < 0 { i + len } else { i };
    if (0..len).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(EvalError::Index(format!("index {} out of range", i)))
    }
}

fn index_value(container: &Value, key: &Value) -> Result<Value, EvalError> {
    match container {
        Value::List(items) => Ok(items[normalize_index(key, items.len())?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[normalize_index(key, chars.len())?].to_string()))
        }
        Value::Map(map) => {
            let name = key.as_str().ok_or_else(|| EvalError::Key(key.repr()))?;
            map.get(name).cloned().ok_or_else(|| EvalError::Key(key.repr()))
        }
        other => Err(EvalError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn index_slot<'v>(container: &'v mut Value, key: &Value) -> Result<&'v mut Value, EvalError> {
    match container {
        Value::List(items) => {
            let idx = normalize_index(key, items.len())?;
            Ok(&mut items[idx])
        }
        Value::Map(map) => {
            let name = key.as_str().ok_or_else(|| EvalError::Key(key.repr()))?;
            map.get_mut(name).ok_or_else(|| EvalError::Key(key.repr()))
        }
        other => Err(EvalError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn set_index(container: &mut Value, key: &Value, value: Value) -> Result<(), EvalError> {
    match container {
        Value::List(items) => {
            let idx = normalize_index(key, items.len())?;
            items[idx] = value;
            Ok(())
        }
        Value::Map(map) => {
            map.insert(dict_key(key)?, value);
            Ok(())
        }
        other => Err(EvalError::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

fn slice_bound(bound: &Value, len: usize, default: usize) -> Result<usize, EvalError> {
    match bound {
        Value::None => Ok(default),
        other => {
            let i = other.as_i64().ok_or_else(|| {
                EvalError::type_error("slice indices must be integers or None")
            })?;
            let len = len as i64;
            let resolved = if i < 0 { (i + len).max(0) } else { i.min(len) };
            Ok(resolved as usize)
        }
    }
}

fn slice_value(container: &Value, start: &Value, end: &Value) -> Result<Value, EvalError> {
    match container {
        Value::List(items) => {
            let s = slice_bound(start, items.len(), 0)?;
            let e = slice_bound(end, items.len(), items.len())?;
            Ok(Value::List(if s < e { items[s..e].to_vec() } else { Vec::new() }))
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let s = slice_bound(start, chars.len(), 0)?;
            let e = slice_bound(end, chars.len(), chars.len())?;
            Ok(Value::Str(if s < e {
                chars[s..e].iter().collect()
            } else {
                String::new()
            }))
        }
        other => Err(EvalError::type_error(format!(
            "'{}' object cannot be sliced",
            other.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v) => match v.as_i64() {
            Some(i) => i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow),
            None => Err(operand_error("unary -", v, None)),
        },
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, v) => v
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| operand_error("unary +", v, None)),
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Float(f) => Some(Num::Float(*f)),
            other => other.as_i64().map(Num::Int),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
    }
}

fn operand_error(op: &str, left: &Value, right: Option<&Value>) -> EvalError {
    match right {
        Some(right) => EvalError::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op,
            left.type_name(),
            right.type_name()
        )),
        None => EvalError::type_error(format!(
            "bad operand type for {}: '{}'",
            op,
            left.type_name()
        )),
    }
}

/// Upper bound on the length of a repeated string or list.
pub(crate) const MAX_REPEAT: usize = 1_000_000;

/// Length of `len` items repeated `times` times, checked against `MAX_REPEAT`.
fn repeat_len(len: usize, times: i64) -> Result<usize, EvalError> {
    if times <= 0 || len == 0 {
        return Ok(0);
    }
    let total = usize::try_from(times)
        .ok()
        .and_then(|t| len.checked_mul(t))
        .ok_or(EvalError::Overflow)?;
    if total > MAX_REPEAT {
        return Err(EvalError::Host(format!(
            "repetition of {} items exceeds the limit",
            total
        )));
    }
    Ok(total)
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, EvalError> {
    let total = repeat_len(items.len(), times)?;
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        out.extend_from_slice(items);
    }
    Ok(out)
}

pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::List(out))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            let times = repeat_len(s.len(), *n)? / s.len().max(1);
            Ok(Value::Str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), Value::Int(n))
        | (BinOp::Mul, Value::Int(n), Value::List(items)) => Ok(Value::List(repeat(items, *n)?)),
        _ => {
            let (Some(a), Some(b)) = (Num::of(left), Num::of(right)) else {
                return Err(operand_error(op_symbol(op), left, Some(right)));
            };
            match (a, b) {
                (Num::Int(x), Num::Int(y)) => int_op(op, x, y),
                _ => float_op(op, a.as_f64(), b.as_f64()),
            }
        }
    }
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Value, EvalError> {
    let result = match op {
        BinOp::Add => x.checked_add(y),
        BinOp::Sub => x.checked_sub(y),
        BinOp::Mul => x.checked_mul(y),
        BinOp::Div => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            x.checked_div(y).map(|q| {
                if x % y != 0 && ((x < 0) != (y < 0)) {
                    q - 1
                } else {
                    q
                }
            })
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            x.checked_rem(y).map(|r| {
                if r != 0 && ((r < 0) != (y < 0)) {
                    r + y
                } else {
                    r
                }
            })
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            u32::try_from(y).ok().and_then(|exp| x.checked_pow(exp))
        }
    };
    result.map(Value::Int).ok_or(EvalError::Overflow)
}

fn float_op(op: BinOp, x: f64, y: f64) -> Result<Value, EvalError> {
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            x.powf(y)
        }
    };
    Ok(Value::Float(result))
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    let ordered = |symbol: &str| {
        left.compare(right).ok_or_else(|| {
            EvalError::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                symbol,
                left.type_name(),
                right.type_name()
            ))
        })
    };
    Ok(match op {
        CmpOp::Eq => left == right,
        CmpOp::NotEq => left != right,
        CmpOp::Lt => ordered("<")?.is_lt(),
        CmpOp::LtEq => ordered("<=")?.is_le(),
        CmpOp::Gt => ordered(">")?.is_gt(),
        CmpOp::GtEq => ordered(">=")?.is_ge(),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => left.type_name() == right.type_name() && left == right,
        CmpOp::IsNot => !(left.type_name() == right.type_name() && left == right),
    })
}

pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(EvalError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.iter().any(|v| v == item)),
        Value::Map(map) => Ok(item.as_str().is_some_and(|key| map.contains_key(key))),
        other => Err(EvalError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::Bindings;
    use crate::core::script::parser::{parse_expression, parse_statement};
    use crate::schema::value::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eval_with(vars: &mut VarMap, source: &str) -> Result<Value, EvalError> {
        let mut rng = StdRng::seed_from_u64(3);
        let bindings = Bindings::default();
        let mut scope = Scope::owned(vars, VarMap::new(), &mut rng, &bindings);
        eval_expr(&parse_expression(source)?, &mut scope)
    }

    fn eval(source: &str) -> Result<Value, EvalError> {
        eval_with(&mut VarMap::new(), source)
    }

    fn run(vars: &mut VarMap, source: &str) {
        let mut rng = StdRng::seed_from_u64(3);
        let bindings = Bindings::default();
        let mut scope = Scope::owned(vars, VarMap::new(), &mut rng, &bindings);
        exec_stmt(&parse_statement(source).unwrap(), &mut scope).unwrap();
    }

    #[test]
    fn integer_division_rounds_down() {
        assert_eq!(eval("7 // 2").unwrap(), Value::Int(3));
        assert_eq!(eval("-7 // 2").unwrap(), Value::Int(-4));
        assert_eq!(eval("-7 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval("7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(eval("2 ** 10").unwrap(), Value::Int(1024));
        assert_eq!(eval("-2 ** 2").unwrap(), Value::Int(-4));
        assert_eq!(eval("'ab' * 2").unwrap(), Value::from("abab"));
        assert!(matches!(eval("1 / 0"), Err(EvalError::DivisionByZero)));
        assert!(matches!(eval("9223372036854775807 + 1"), Err(EvalError::Overflow)));
        assert!(matches!(eval("'a' + 1"), Err(EvalError::Type(_))));
    }

    #[test]
    fn repetition_is_bounded() {
        assert_eq!(eval("[1, 2] * 2").unwrap(), eval("[1, 2, 1, 2]").unwrap());
        assert_eq!(eval("[1] * -3").unwrap(), Value::List(Vec::new()));
        assert_eq!(eval("[] * 4611686018427387904").unwrap(), Value::List(Vec::new()));
        assert_eq!(eval("'' * 9223372036854775807").unwrap(), Value::from(""));
        assert!(matches!(eval("[1, 2] * 4611686018427387904"), Err(EvalError::Host(_))));
        assert!(matches!(eval("[1, 2, 3] * 9223372036854775807"), Err(EvalError::Overflow)));
        assert!(matches!(eval("[1] * 2000000"), Err(EvalError::Host(_))));
        assert!(matches!(eval("'abc' * 9223372036854775807"), Err(EvalError::Overflow)));
        assert!(matches!(eval("3 * 'abc' * 500000"), Err(EvalError::Host(_))));
    }

    #[test]
    fn logic_returns_operands() {
        assert_eq!(eval("0 or 'fallback'").unwrap(), Value::from("fallback"));
        assert_eq!(eval("1 and 2").unwrap(), Value::Int(2));
        assert_eq!(eval("not []").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 < 2 < 3").unwrap(), Value::Bool(true));
        assert_eq!(eval("3 > 2 > 2").unwrap(), Value::Bool(false));
        assert_eq!(eval("None is None").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 if False else 2").unwrap(), Value::Int(2));
    }

    #[test]
    fn undefined_names_are_errors_unless_short_circuited() {
        assert!(matches!(eval("missing"), Err(EvalError::UndefinedName(_))));
        assert_eq!(eval("False and missing").unwrap(), Value::Bool(false));
    }

    #[test]
    fn collections_index_and_slice() {
        let mut vars = VarMap::new();
        run(&mut vars, "items = ['a', 'b', 'c']");
        assert_eq!(eval_with(&mut vars, "items[-1]").unwrap(), Value::from("c"));
        assert_eq!(
            eval_with(&mut vars, "items[1:]").unwrap(),
            Value::List(vec![Value::from("b"), Value::from("c")])
        );
        assert!(matches!(eval_with(&mut vars, "items[5]"), Err(EvalError::Index(_))));
        assert_eq!(eval_with(&mut vars, "'b' in items").unwrap(), Value::Bool(true));
        assert_eq!(eval("{'a': 1}['a']").unwrap(), Value::Int(1));
        assert!(matches!(eval("{'a': 1}['b']"), Err(EvalError::Key(_))));
        assert!(matches!(eval("{1: 2}"), Err(EvalError::Type(_))));
    }

    #[test]
    fn comprehensions_do_not_leak_variables() {
        let mut vars = VarMap::new();
        assert_eq!(
            eval_with(&mut vars, "[x * 2 for x in range(4) if x % 2 == 0]").unwrap(),
            Value::List(vec![Value::Int(0), Value::Int(4)])
        );
        assert!(!vars.contains_key("x"));
        let squares = eval("{str(n): n * n for n in [1, 2]}").unwrap();
        assert_eq!(squares.to_string(), "{'1': 1, '2': 4}");
        assert_eq!(
            eval("[a + b for a, b in [[1, 2], [3, 4]]]").unwrap(),
            Value::List(vec![Value::Int(3), Value::Int(7)])
        );
    }

    #[test]
    fn nested_assignment_and_in_place_methods() {
        let mut vars = VarMap::new();
        run(&mut vars, "inv = {'keys': []}");
        run(&mut vars, "inv['keys'].append('brass')");
        run(&mut vars, "inv['gold'] = 3");
        run(&mut vars, "inv['gold'] *= 2");
        assert_eq!(
            eval_with(&mut vars, "inv").unwrap().to_string(),
            "{'keys': ['brass'], 'gold': 6}"
        );
        run(&mut vars, "name = 'ada'");
        assert_eq!(eval_with(&mut vars, "name.upper()").unwrap(), Value::from("ADA"));
        assert_eq!(vars.get("name"), Some(&Value::from("ada")));
    }
}
