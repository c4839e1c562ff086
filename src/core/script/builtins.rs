/// Whitelisted builtin functions and methods on builtin types.
///
/// Only pure helpers live here, plus three random helpers that draw from
/// the engine's seeded RNG so a fixed seed replays a story exactly.

use indexmap::IndexMap;
use rand::Rng;
use std::cmp::Ordering;

use super::eval::{binary, dict_key, iterate};
use super::parser::BinOp;
use super::EvalError;
use crate::core::scope::Scope;
use crate::schema::value::{CallArgs, Value};

/// Upper bound on `range()` results.
const MAX_RANGE: i64 = 1_000_000;

const BUILTINS: &[&str] = &[
    "bool",
    "chance",
    "dict",
    "enumerate",
    "float",
    "int",
    "len",
    "list",
    "max",
    "min",
    "random_choice",
    "random_int",
    "range",
    "round",
    "sorted",
    "str",
    "sum",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn required<'v>(args: &'v CallArgs, index: usize, name: &str, func: &str) -> Result<&'v Value, EvalError> {
    args.get(index, name).ok_or_else(|| {
        EvalError::type_error(format!("{}() missing required argument '{}'", func, name))
    })
}

fn int_arg(args: &CallArgs, index: usize, name: &str, func: &str) -> Result<i64, EvalError> {
    let value = required(args, index, name, func)?;
    value.as_i64().ok_or_else(|| {
        EvalError::type_error(format!(
            "{}() argument '{}' must be int, not '{}'",
            func,
            name,
            value.type_name()
        ))
    })
}

fn flag(args: &CallArgs, name: &str) -> bool {
    args.named.get(name).is_some_and(Value::is_truthy)
}

/// `Some(result)` when `name` is a builtin, `None` otherwise.
pub fn call_builtin(name: &str, args: CallArgs, scope: &mut Scope<'_>) -> Option<Result<Value, EvalError>> {
    let result = match name {
        "len" => len(&args),
        "str" => Ok(Value::Str(
            args.positional.first().map(|v| v.to_string()).unwrap_or_default(),
        )),
        "int" => to_int(&args),
        "float" => to_float(&args),
        "bool" => Ok(Value::Bool(
            args.positional.first().is_some_and(Value::is_truthy),
        )),
        "min" => extreme(&args, "min", Ordering::Less),
        "max" => extreme(&args, "max", Ordering::Greater),
        "sum" => sum(&args),
        "round" => round(&args),
        "range" => range(&args),
        "sorted" => required(&args, 0, "iterable", "sorted").and_then(|v| {
            let mut items = iterate(v)?;
            sort_values(&mut items, flag(&args, "reverse"))?;
            Ok(Value::List(items))
        }),
        "list" => match args.positional.first() {
            Some(v) => iterate(v).map(Value::List),
            None => Ok(Value::List(Vec::new())),
        },
        "dict" => to_dict(&args),
        "enumerate" => required(&args, 0, "iterable", "enumerate").and_then(|v| {
            let start = match args.get(1, "start") {
                Some(s) => s.as_i64().unwrap_or(0),
                None => 0,
            };
            Ok(Value::List(
                iterate(v)?
                    .into_iter()
                    .zip(start..)
                    .map(|(item, i)| Value::List(vec![Value::Int(i), item]))
                    .collect(),
            ))
        }),
        "random_int" => random_int(&args, scope),
        "random_choice" => required(&args, 0, "seq", "random_choice").and_then(|v| {
            let items = iterate(v)?;
            if items.is_empty() {
                return Err(EvalError::Index("cannot choose from an empty sequence".to_string()));
            }
            let idx = scope.rng().gen_range(0..items.len());
            Ok(items[idx].clone())
        }),
        "chance" => required(&args, 0, "probability", "chance").and_then(|v| {
            let p = v
                .as_f64()
                .ok_or_else(|| EvalError::type_error("chance() probability must be a number"))?;
            Ok(Value::Bool(scope.rng().gen::<f64>() < p))
        }),
        _ => return None,
    };
    Some(result)
}

fn len(args: &CallArgs) -> Result<Value, EvalError> {
    let n = match required(args, 0, "obj", "len")? {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        Value::Object(obj) => {
            return obj.get().get_attr("__len__").ok_or_else(|| {
                EvalError::type_error(format!("object of type '{}' has no len()", obj.type_name()))
            })
        }
        other => {
            return Err(EvalError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n as i64))
}

fn to_int(args: &CallArgs) -> Result<Value, EvalError> {
    let Some(value) = args.positional.first() else {
        return Ok(Value::Int(0));
    };
    match value {
        Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(Value::Int(f.trunc() as i64)),
        Value::Float(_) => Err(EvalError::Overflow),
        Value::Str(s) => s
            .trim()
            .replace('_', "")
            .parse()
            .map(Value::Int)
            .map_err(|_| EvalError::type_error(format!("invalid literal for int(): '{}'", s))),
        other => other
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| EvalError::type_error(format!("int() argument must be a number, not '{}'", other.type_name()))),
    }
}

fn to_float(args: &CallArgs) -> Result<Value, EvalError> {
    let Some(value) = args.positional.first() else {
        return Ok(Value::Float(0.0));
    };
    match value {
        Value::Str(s) => s
            .trim()
            .parse()
            .map(Value::Float)
            .map_err(|_| EvalError::type_error(format!("could not convert string to float: '{}'", s))),
        other => other
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| EvalError::type_error(format!("float() argument must be a number, not '{}'", other.type_name()))),
    }
}

fn to_dict(args: &CallArgs) -> Result<Value, EvalError> {
    let mut map = IndexMap::new();
    if let Some(source) = args.positional.first() {
        match source {
            Value::Map(existing) => map.extend(existing.iter().map(|(k, v)| (k.clone(), v.clone()))),
            other => {
                for pair in iterate(other)? {
                    match pair {
                        Value::List(kv) if kv.len() == 2 => {
                            map.insert(dict_key(&kv[0])?, kv[1].clone());
                        }
                        _ => return Err(EvalError::type_error("dict() needs key/value pairs")),
                    }
                }
            }
        }
    }
    map.extend(args.named.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(Value::Map(map))
}

/// Candidates are the single iterable argument, or all positionals.
fn candidates(args: &CallArgs, func: &str) -> Result<Vec<Value>, EvalError> {
    match args.positional.as_slice() {
        [] => Err(EvalError::type_error(format!("{}() expected at least 1 argument", func))),
        [single] => iterate(single),
        many => Ok(many.to_vec()),
    }
}

fn extreme(args: &CallArgs, func: &str, wanted: Ordering) -> Result<Value, EvalError> {
    let items = candidates(args, func)?;
    let mut iter = items.into_iter();
    let Some(mut best) = iter.next() else {
        return match args.named.get("default") {
            Some(default) => Ok(default.clone()),
            None => Err(EvalError::type_error(format!("{}() arg is an empty sequence", func))),
        };
    };
    for item in iter {
        let ord = item.compare(&best).ok_or_else(|| {
            EvalError::type_error(format!(
                "{}() cannot compare '{}' and '{}'",
                func,
                item.type_name(),
                best.type_name()
            ))
        })?;
        if ord == wanted {
            best = item;
        }
    }
    Ok(best)
}

fn sum(args: &CallArgs) -> Result<Value, EvalError> {
    let items = iterate(required(args, 0, "iterable", "sum")?)?;
    let mut total = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
    for item in &items {
        total = binary(BinOp::Add, &total, item)?;
    }
    Ok(total)
}

fn round(args: &CallArgs) -> Result<Value, EvalError> {
    let value = required(args, 0, "number", "round")?;
    let digits = match args.get(1, "ndigits") {
        None | Some(Value::None) => None,
        Some(d) => Some(d.as_i64().ok_or_else(|| EvalError::type_error("round() ndigits must be int"))?),
    };
    match (value, digits) {
        (Value::Int(i), _) => Ok(Value::Int(*i)),
        (Value::Bool(b), _) => Ok(Value::Int(i64::from(*b))),
        (Value::Float(f), None) => {
            let r = f.round_ties_even();
            if r.is_finite() && r.abs() < 9.2e18 {
                Ok(Value::Int(r as i64))
            } else {
                Err(EvalError::Overflow)
            }
        }
        (Value::Float(f), Some(n)) => {
            let scale = 10f64.powi(n.clamp(-300, 300) as i32);
            Ok(Value::Float((f * scale).round_ties_even() / scale))
        }
        (other, _) => Err(EvalError::type_error(format!(
            "type '{}' doesn't define round()",
            other.type_name()
        ))),
    }
}

fn range(args: &CallArgs) -> Result<Value, EvalError> {
    let (start, stop) = match args.positional.len() {
        0 => return Err(EvalError::type_error("range() expected at least 1 argument")),
        1 => (0, int_arg(args, 0, "stop", "range")?),
        _ => (int_arg(args, 0, "start", "range")?, int_arg(args, 1, "stop", "range")?),
    };
    let step = match args.positional.get(2) {
        Some(_) => int_arg(args, 2, "step", "range")?,
        None => 1,
    };
    if step == 0 {
        return Err(EvalError::type_error("range() arg 3 must not be zero"));
    }
    let count = if step > 0 {
        stop.saturating_sub(start).saturating_add(step - 1) / step
    } else {
        start.saturating_sub(stop).saturating_sub(step + 1) / step.saturating_neg()
    };
    if count > MAX_RANGE {
        return Err(EvalError::Host(format!("range() of {} items exceeds the limit", count)));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Value::Int(i));
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(Value::List(out))
}

fn random_int(args: &CallArgs, scope: &mut Scope<'_>) -> Result<Value, EvalError> {
    let low = int_arg(args, 0, "a", "random_int")?;
    let high = int_arg(args, 1, "b", "random_int")?;
    if low > high {
        return Err(EvalError::Host(format!("random_int({}, {}): empty range", low, high)));
    }
    Ok(Value::Int(scope.rng().gen_range(low..=high)))
}

pub(crate) fn sort_values(items: &mut [Value], reverse: bool) -> Result<(), EvalError> {
    let mut failure = None;
    items.sort_by(|a, b| match a.compare(b) {
        Some(ord) => ord,
        None => {
            if failure.is_none() {
                failure = Some(EvalError::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                )));
            }
            Ordering::Equal
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    if reverse {
        items.reverse();
    }
    Ok(())
}

/// True when `name` changes its receiver, so the evaluator must call it
/// on the stored value rather than a copy.
pub fn mutates(receiver: &Value, name: &str) -> bool {
    match receiver {
        Value::List(_) => matches!(
            name,
            "append" | "extend" | "pop" | "reverse" | "sort" | "clear"
        ),
        Value::Map(_) => matches!(name, "pop" | "clear"),
        Value::Object(_) => true,
        _ => false,
    }
}

pub fn call_method(receiver: &mut Value, name: &str, args: CallArgs) -> Result<Value, EvalError> {
    match receiver {
        Value::Str(s) => str_method(s, name, &args),
        Value::List(items) => list_method(items, name, args),
        Value::Map(map) => dict_method(map, name, args),
        Value::Object(obj) => obj.get_mut().call_method(name, args),
        other => Err(EvalError::Attribute {
            type_name: other.type_name().to_string(),
            attr: name.to_string(),
        }),
    }
}

fn str_arg<'v>(args: &'v CallArgs, index: usize, name: &str, func: &str) -> Result<&'v str, EvalError> {
    let value = required(args, index, name, func)?;
    value.as_str().ok_or_else(|| {
        EvalError::type_error(format!(
            "{}() argument must be str, not '{}'",
            func,
            value.type_name()
        ))
    })
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

fn str_method(s: &str, name: &str, args: &CallArgs) -> Result<Value, EvalError> {
    let strip_set = |args: &CallArgs| -> Option<Vec<char>> {
        args.positional
            .first()
            .and_then(Value::as_str)
            .map(|chars| chars.chars().collect())
    };
    let value = match name {
        "upper" => Value::Str(s.to_uppercase()),
        "lower" => Value::Str(s.to_lowercase()),
        "strip" => {
            let set = strip_set(args);
            Value::Str(
                s.trim_matches(|c: char| match &set {
                    Some(chars) => chars.contains(&c),
                    None => c.is_whitespace(),
                })
                .to_string(),
            )
        }
        "title" => Value::Str(title_case(s)),
        "split" => {
            let parts: Vec<Value> = match args.get(0, "sep") {
                None | Some(Value::None) => s.split_whitespace().map(Value::from).collect(),
                Some(_) => {
                    let sep = str_arg(args, 0, "sep", name)?;
                    if sep.is_empty() {
                        return Err(EvalError::type_error("empty separator"));
                    }
                    s.split(sep).map(Value::from).collect()
                }
            };
            Value::List(parts)
        }
        "join" => {
            let items = iterate(required(args, 0, "iterable", name)?)?;
            let mut parts = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::Str(part) => parts.push(part.as_str()),
                    other => {
                        return Err(EvalError::type_error(format!(
                            "sequence item: expected str instance, '{}' found",
                            other.type_name()
                        )))
                    }
                }
            }
            Value::Str(parts.join(s))
        }
        "find" => {
            let sub = str_arg(args, 0, "sub", name)?;
            Value::Int(match s.find(sub) {
                Some(byte) => s[..byte].chars().count() as i64,
                None => -1,
            })
        }
        _ => {
            return Err(EvalError::Attribute {
                type_name: "str".to_string(),
                attr: name.to_string(),
            })
        }
    };
    Ok(value)
}

fn list_method(items: &mut Vec<Value>, name: &str, args: CallArgs) -> Result<Value, EvalError> {
    let value = match name {
        "append" => {
            items.push(required(&args, 0, "object", name)?.clone());
            Value::None
        }
        "extend" => {
            items.extend(iterate(required(&args, 0, "iterable", name)?)?);
            Value::None
        }
        "pop" => {
            if items.is_empty() {
                return Err(EvalError::Index("pop from empty list".to_string()));
            }
            let len = items.len() as i64;
            let i = match args.get(0, "index") {
                Some(v) => v.as_i64().ok_or_else(|| EvalError::type_error("pop() index must be int"))?,
                None => -1,
            };
            let resolved = if i < 0 { i + len } else { i };
            if !(0..len).contains(&resolved) {
                return Err(EvalError::Index("pop index out of range".to_string()));
            }
            items.remove(resolved as usize)
        }
        "reverse" => {
            items.reverse();
            Value::None
        }
        "sort" => {
            sort_values(items, flag(&args, "reverse"))?;
            Value::None
        }
        "clear" => {
            items.clear();
            Value::None
        }
        _ => {
            return Err(EvalError::Attribute {
                type_name: "list".to_string(),
                attr: name.to_string(),
            })
        }
    };
    Ok(value)
}

fn dict_method(map: &mut IndexMap<String, Value>, name: &str, args: CallArgs) -> Result<Value, EvalError> {
    let key_arg = |args: &CallArgs| -> Result<String, EvalError> {
        dict_key(required(args, 0, "key", name)?)
    };
    let value = match name {
        "get" => {
            let key = key_arg(&args)?;
            map.get(&key)
                .cloned()
                .unwrap_or_else(|| args.get(1, "default").cloned().unwrap_or_default())
        }
        "keys" => Value::List(map.keys().map(|k| Value::Str(k.clone())).collect()),
        "values" => Value::List(map.values().cloned().collect()),
        "items" => Value::List(
            map.iter()
                .map(|(k, v)| Value::List(vec![Value::Str(k.clone()), v.clone()]))
                .collect(),
        ),
        "pop" => {
            let key = key_arg(&args)?;
            match map.shift_remove(&key) {
                Some(v) => v,
                None => args
                    .get(1, "default")
                    .cloned()
                    .ok_or_else(|| EvalError::Key(format!("'{}'", key)))?,
            }
        }
        "clear" => {
            map.clear();
            Value::None
        }
        _ => {
            return Err(EvalError::Attribute {
                type_name: "dict".to_string(),
                attr: name.to_string(),
            })
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::Bindings;
    use crate::core::script::{Interpreter, ScriptHost};
    use crate::schema::value::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eval(source: &str) -> Result<Value, EvalError> {
        let mut vars = VarMap::new();
        let mut rng = StdRng::seed_from_u64(11);
        let bindings = Bindings::default();
        let mut scope = Scope::owned(&mut vars, VarMap::new(), &mut rng, &bindings);
        Interpreter::new().evaluate(source, &mut scope)
    }

    #[test]
    fn conversions_and_aggregates() {
        assert_eq!(eval("len('héllo')").unwrap(), Value::Int(5));
        assert_eq!(eval("int('42')").unwrap(), Value::Int(42));
        assert_eq!(eval("int(3.9)").unwrap(), Value::Int(3));
        assert_eq!(eval("str(2.0)").unwrap(), Value::from("2.0"));
        assert_eq!(eval("sum([1, 2, 3])").unwrap(), Value::Int(6));
        assert_eq!(eval("max(3, 9, 4)").unwrap(), Value::Int(9));
        assert!(eval("min([])").is_err());
        assert_eq!(eval("round(2.5)").unwrap(), Value::Int(2));
        assert_eq!(eval("round(3.14159, 2)").unwrap(), Value::Float(3.14));
        assert_eq!(eval("sorted([3, 1, 2], reverse=True)").unwrap().to_string(), "[3, 2, 1]");
        assert_eq!(eval("list(range(5, 0, -2))").unwrap().to_string(), "[5, 3, 1]");
        assert_eq!(eval("enumerate(['a'])").unwrap().to_string(), "[[0, 'a']]");
        assert_eq!(eval("dict(a=1)").unwrap().to_string(), "{'a': 1}");
        assert!(eval("sorted([1, 'a'])").is_err());
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("'the old tower'.title()").unwrap(), Value::from("The Old Tower"));
        assert_eq!(eval("'  x '.strip()").unwrap(), Value::from("x"));
        assert_eq!(eval("', '.join(['a', 'b'])").unwrap(), Value::from("a, b"));
        assert_eq!(eval("'a-b-c'.split('-')").unwrap().to_string(), "['a', 'b', 'c']");
        assert_eq!(eval("'hello'.find('l')").unwrap(), Value::Int(2));
        assert!(matches!(eval("'x'.shout()"), Err(EvalError::Attribute { .. })));
    }

    #[test]
    fn only_whitelisted_names_are_callable() {
        assert!(matches!(eval("zip([1], [2])"), Err(EvalError::UndefinedName(_))));
        assert!(matches!(eval("open('save.json')"), Err(EvalError::UndefinedName(_))));
        assert!(matches!(eval("'abc'.replace('a', 'b')"), Err(EvalError::Attribute { .. })));
        assert!(matches!(eval("[1].insert(0, 2)"), Err(EvalError::Attribute { .. })));
        assert_eq!(eval("' a '.strip()").unwrap(), Value::from("a"));
    }

    #[test]
    fn dict_methods() {
        assert_eq!(eval("{'a': 1}.get('b', 0)").unwrap(), Value::Int(0));
        assert_eq!(eval("{'a': 1}.items()").unwrap().to_string(), "[['a', 1]]");
        assert!(matches!(eval("{}.pop('x')"), Err(EvalError::Key(_))));
    }

    #[test]
    fn random_helpers_are_deterministic_per_seed() {
        let first = eval("[random_int(1, 100) for _ in range(5)]").unwrap();
        let second = eval("[random_int(1, 100) for _ in range(5)]").unwrap();
        assert_eq!(first, second);
        assert!(matches!(eval("random_choice([])"), Err(EvalError::Index(_))));
        assert_eq!(eval("chance(0)").unwrap(), Value::Bool(false));
        assert_eq!(eval("chance(1)").unwrap(), Value::Bool(true));
    }
}
