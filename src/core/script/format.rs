/// Trailing format specifiers for interpolated expressions (`{gold:,}`,
/// `{ratio:.1%}`, `{name:>10}`).

use super::EvalError;
use crate::schema::value::{format_float, Value};

/// Split `expr:spec` on the last `:` that sits outside brackets and quotes.
///
/// The tail only counts as a specifier if it parses as one, so `a[1:2]`,
/// `{'k': v}` and `x == y` are left whole.
pub fn split_format_spec(source: &str) -> (&str, Option<&str>) {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut split_at = None;

    for (idx, c) in source.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
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
            ':' if depth == 0 => split_at = Some(idx),
            _ => {}
        }
    }

    if let Some(idx) = split_at {
        let expr = source[..idx].trim();
        let spec = &source[idx + 1..];
        if !expr.is_empty() && FormatSpec::parse(spec).is_ok() {
            return (expr, Some(spec));
        }
    }
    (source.trim(), None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
    Center,
    /// Padding goes between the sign and the digits.
    AfterSign,
}

/// Largest width or precision a specifier may ask for.
pub(crate) const MAX_SPEC_FIELD: usize = 1_000;

/// Parsed `[[fill]align][sign][#][0][width][,][.precision][type]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatSpec {
    fill: char,
    align: Option<Align>,
    sign: char,
    alternate: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    kind: Option<char>,
}

fn align_of(c: char) -> Option<Align> {
    match c {
        '<' => Some(Align::Left),
        '>' => Some(Align::Right),
        '^' => Some(Align::Center),
        '=' => Some(Align::AfterSign),
        _ => None,
    }
}

impl FormatSpec {
    pub fn parse(spec: &str) -> Result<FormatSpec, EvalError> {
        let invalid = || EvalError::Format(spec.to_string());
        if spec.is_empty() {
            return Err(invalid());
        }
        let chars: Vec<char> = spec.chars().collect();
        let mut out = FormatSpec {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            width: 0,
            grouping: false,
            precision: None,
            kind: None,
        };
        let mut i = 0;

        if chars.len() >= 2 && align_of(chars[1]).is_some() {
            out.fill = chars[0];
            out.align = align_of(chars[1]);
            i = 2;
        } else if let Some(align) = align_of(chars[0]) {
            out.align = Some(align);
            i = 1;
        }
        if i < chars.len() && matches!(chars[i], '+' | '-' | ' ') {
            out.sign = chars[i];
            i += 1;
        }
        if i < chars.len() && chars[i] == '#' {
            out.alternate = true;
            i += 1;
        }
        if i < chars.len() && chars[i] == '0' {
            if out.align.is_none() {
                out.fill = '0';
                out.align = Some(Align::AfterSign);
            }
            i += 1;
        }
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if i > start {
            let digits: String = chars[start..i].iter().collect();
            out.width = digits.parse().map_err(|_| invalid())?;
        }
        if i < chars.len() && chars[i] == ',' {
            out.grouping = true;
            i += 1;
        }
        if i < chars.len() && chars[i] == '.' {
            i += 1;
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i == start {
                return Err(invalid());
            }
            let digits: String = chars[start..i].iter().collect();
            out.precision = Some(digits.parse().map_err(|_| invalid())?);
        }
        if i < chars.len() {
            let kind = chars[i];
            if !"bcdeEfFgGosxX%".contains(kind) {
                return Err(invalid());
            }
            out.kind = Some(kind);
            i += 1;
        }
        if i != chars.len() {
            return Err(invalid());
        }
        Ok(out)
    }
}

/// Format `value` according to `spec`.
pub fn format_value(value: &Value, spec: &str) -> Result<String, EvalError> {
    let spec = FormatSpec::parse(spec)?;
    if spec.width > MAX_SPEC_FIELD || spec.precision.map_or(false, |p| p > MAX_SPEC_FIELD) {
        return Err(EvalError::Format(format!(
            "width and precision are limited to {}",
            MAX_SPEC_FIELD
        )));
    }
    let numeric = matches!(value, Value::Int(_) | Value::Float(_) | Value::Bool(_));
    let kind = spec.kind.unwrap_or(match value {
        Value::Int(_) | Value::Bool(_) => 'd',
        Value::Float(_) if spec.precision.is_some() => 'g',
        _ => 's',
    });

    let mismatch = || {
        EvalError::Format(format!(
            "unknown format code '{}' for object of type '{}'",
            kind,
            value.type_name()
        ))
    };

    let (negative, body) = match kind {
        's' => {
            if spec.sign != '-' && !numeric {
                return Err(mismatch());
            }
            let text = value.to_string();
            let text = match spec.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            };
            (false, text)
        }
        'c' => {
            let code = value.as_i64().ok_or_else(mismatch)?;
            let c = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| EvalError::Format("%c arg not in range".to_string()))?;
            (false, c.to_string())
        }
        'd' | 'b' | 'o' | 'x' | 'X' => {
            let n = match value {
                Value::Float(_) => return Err(mismatch()),
                other => other.as_i64().ok_or_else(mismatch)?,
            };
            let magnitude = n.unsigned_abs();
            let digits = match kind {
                'b' => format!("{:b}", magnitude),
                'o' => format!("{:o}", magnitude),
                'x' => format!("{:x}", magnitude),
                'X' => format!("{:X}", magnitude),
                _ => magnitude.to_string(),
            };
            let digits = if spec.grouping && kind == 'd' {
                group_thousands(&digits)
            } else {
                digits
            };
            let prefix = match (spec.alternate, kind) {
                (true, 'b') => "0b",
                (true, 'o') => "0o",
                (true, 'x') => "0x",
                (true, 'X') => "0X",
                _ => "",
            };
            (n < 0, format!("{}{}", prefix, digits))
        }
        'e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%' => {
            let x = value.as_f64().ok_or_else(mismatch)?;
            let magnitude = x.abs();
            let precision = spec.precision.unwrap_or(6);
            let mut text = match kind {
                'f' | 'F' => fixed(magnitude, precision, spec.grouping),
                '%' => format!("{}%", fixed(magnitude * 100.0, precision, spec.grouping)),
                'e' | 'E' => exponent(magnitude, precision),
                _ => general(magnitude, precision, spec.grouping, spec.alternate),
            };
            if kind.is_ascii_uppercase() {
                text = text.to_uppercase();
            }
            (x.is_sign_negative() && !x.is_nan(), text)
        }
        _ => return Err(mismatch()),
    };

    let sign = if negative {
        "-"
    } else {
        match (numeric, spec.sign) {
            (true, '+') => "+",
            (true, ' ') => " ",
            _ => "",
        }
    };
    Ok(pad(sign, &body, &spec, numeric))
}

fn group_thousands(digits: &str) -> String {
    let (int_part, rest) = match digits.find('.') {
        Some(idx) => digits.split_at(idx),
        None => (digits, ""),
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let len = int_part.len();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out.push_str(rest);
    out
}

fn fixed(x: f64, precision: usize, grouping: bool) -> String {
    if !x.is_finite() {
        return format_float(x);
    }
    let text = format!("{:.*}", precision, x);
    if grouping {
        group_thousands(&text)
    } else {
        text
    }
}

/// `1.500000e+05` style, with at least two exponent digits.
fn exponent(x: f64, precision: usize) -> String {
    if !x.is_finite() {
        return format_float(x);
    }
    let raw = format!("{:.*e}", precision, x);
    match raw.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => raw,
    }
}

fn general(x: f64, precision: usize, grouping: bool, keep_zeros: bool) -> String {
    if !x.is_finite() {
        return format_float(x);
    }
    let p = precision.max(1);
    if x == 0.0 {
        return "0".to_string();
    }
    // The exponent after rounding to `p` significant digits decides the style.
    let exp = exponent(x, p - 1)
        .split_once('e')
        .and_then(|(_, e)| e.parse::<i64>().ok())
        .unwrap_or_else(|| x.log10().floor() as i64);
    let text = if exp < -4 || exp >= p as i64 {
        exponent(x, p - 1)
    } else {
        fixed(x, (p as i64 - 1 - exp).max(0) as usize, grouping)
    };
    if keep_zeros {
        return text;
    }
    strip_trailing_zeros(&text)
}

fn strip_trailing_zeros(text: &str) -> String {
    let (mantissa, suffix) = match text.find('e') {
        Some(idx) => text.split_at(idx),
        None => (text, ""),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{}{}", mantissa, suffix)
}

fn pad(sign: &str, body: &str, spec: &FormatSpec, numeric: bool) -> String {
    let len = sign.chars().count() + body.chars().count();
    if len >= spec.width {
        return format!("{}{}", sign, body);
    }
    let padding = spec.width - len;
    let fill = |n: usize| spec.fill.to_string().repeat(n);
    let align = spec
        .align
        .unwrap_or(if numeric { Align::Right } else { Align::Left });
    match align {
        Align::Left => format!("{}{}{}", sign, body, fill(padding)),
        Align::Right => format!("{}{}{}", fill(padding), sign, body),
        Align::Center => {
            let left = padding / 2;
            format!("{}{}{}{}", fill(left), sign, body, fill(padding - left))
        }
        Align::AfterSign => format!("{}{}{}", sign, fill(padding), body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uses_last_top_level_colon() {
        assert_eq!(split_format_spec("x:.2f"), ("x", Some(".2f")));
        assert_eq!(split_format_spec("a==b"), ("a==b", None));
        assert_eq!(split_format_spec("items[1:3]"), ("items[1:3]", None));
        assert_eq!(split_format_spec("{'k': 1}['k']"), ("{'k': 1}['k']", None));
        assert_eq!(split_format_spec("d['a:b']:>8"), ("d['a:b']", Some(">8")));
        assert_eq!(split_format_spec("price:,"), ("price", Some(",")));
    }

    #[test]
    fn tail_that_is_not_a_spec_stays_in_expression() {
        assert_eq!(split_format_spec("a if b else c"), ("a if b else c", None));
        assert_eq!(split_format_spec("x:nope"), ("x:nope", None));
    }

    #[test]
    fn float_formats() {
        assert_eq!(format_value(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_value(&Value::Int(2), ".2f").unwrap(), "2.00");
        assert_eq!(format_value(&Value::Float(0.256), ".1%").unwrap(), "25.6%");
        assert_eq!(format_value(&Value::Float(150000.0), ".2e").unwrap(), "1.50e+05");
        assert_eq!(format_value(&Value::Float(-1.5), "+.1f").unwrap(), "-1.5");
        assert_eq!(format_value(&Value::Float(3.14159), ".3").unwrap(), "3.14");
    }

    #[test]
    fn integer_formats() {
        assert_eq!(format_value(&Value::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(format_value(&Value::Int(42), "05d").unwrap(), "00042");
        assert_eq!(format_value(&Value::Int(-42), "05d").unwrap(), "-0042");
        assert_eq!(format_value(&Value::Int(255), "#x").unwrap(), "0xff");
        assert_eq!(format_value(&Value::Int(5), "+d").unwrap(), "+5");
        assert!(format_value(&Value::Float(1.5), "d").is_err());
    }

    #[test]
    fn alignment_and_strings() {
        assert_eq!(format_value(&Value::from("ab"), ">5").unwrap(), "   ab");
        assert_eq!(format_value(&Value::from("ab"), "*^6").unwrap(), "**ab**");
        assert_eq!(format_value(&Value::from("abcdef"), ".3").unwrap(), "abc");
        assert_eq!(format_value(&Value::Int(7), "<3").unwrap(), "7  ");
        assert!(format_value(&Value::from("ab"), "d").is_err());
    }

    #[test]
    fn general_format_rounds_before_choosing_notation() {
        assert_eq!(format_value(&Value::Float(0.000099999), ".2g").unwrap(), "0.0001");
        assert_eq!(format_value(&Value::Float(99.99), ".2g").unwrap(), "1e+02");
        assert_eq!(format_value(&Value::Float(0.00001234), ".3g").unwrap(), "1.23e-05");
        assert_eq!(format_value(&Value::Float(123.456), ".4g").unwrap(), "123.5");
    }

    #[test]
    fn oversized_width_and_precision_are_rejected() {
        assert!(matches!(
            format_value(&Value::from("ab"), ">4000000000"),
            Err(EvalError::Format(_))
        ));
        assert!(matches!(
            format_value(&Value::Float(1.0), ".5000f"),
            Err(EvalError::Format(_))
        ));
        assert_eq!(format_value(&Value::Int(1), ">1000").unwrap().len(), 1000);
    }
}
