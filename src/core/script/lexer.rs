/// Tokenizer for the expression sublanguage.

use super::EvalError;
use crate::schema::story::AssignOp;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    True,
    False,
    None,
    And,
    Or,
    Not,
    In,
    Is,
    If,
    Else,
    For,
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    DoubleStar,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign(AssignOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Eof,
}

/// A token and the character offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

fn keyword(word: &str) -> Option<Token> {
    let tok = match word {
        "True" | "true" => Token::True,
        "False" | "false" => Token::False,
        "None" | "none" | "null" => Token::None,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "is" => Token::Is,
        "if" => Token::If,
        "else" => Token::Else,
        "for" => Token::For,
        _ => return None,
    };
    Some(tok)
}

pub fn tokenize(input: &str) -> Result<Vec<Spanned>, EvalError> {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() || (c == '.' && i + 1 < len && chars[i + 1].is_ascii_digit()) {
            let mut is_float = false;
            while i < len && (chars[i].is_ascii_digit() || chars[i] == '_') {
                i += 1;
            }
            if i < len && chars[i] == '.' && !(i + 1 < len && chars[i + 1] == '.') {
                is_float = true;
                i += 1;
                while i < len && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < len && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < len && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < len && chars[j].is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < len && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                Token::Float(text.parse().map_err(|_| syntax("invalid float literal", start))?)
            } else {
                Token::Int(text.parse().map_err(|_| syntax("integer literal too large", start))?)
            };
            tokens.push(Spanned { token, pos: start });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < len && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let token = keyword(&word).unwrap_or(Token::Name(word));
            tokens.push(Spanned { token, pos: start });
            continue;
        }

        if c == '"' || c == '\'' {
            let (text, next) = lex_string(&chars, i)?;
            tokens.push(Spanned {
                token: Token::Str(text),
                pos: start,
            });
            i = next;
            continue;
        }

        let rest = |n: usize| -> String { chars[i..(i + n).min(len)].iter().collect() };
        let three = rest(3);
        let two = rest(2);
        let (token, width) = if three == "//=" {
            (Token::Assign(AssignOp::FloorDiv), 3)
        } else if three == "**=" {
            (Token::Assign(AssignOp::Pow), 3)
        } else {
            match two.as_str() {
                "**" => (Token::DoubleStar, 2),
                "//" => (Token::DoubleSlash, 2),
                "==" => (Token::EqEq, 2),
                "!=" => (Token::NotEq, 2),
                "<=" => (Token::LtEq, 2),
                ">=" => (Token::GtEq, 2),
                "+=" => (Token::Assign(AssignOp::Add), 2),
                "-=" => (Token::Assign(AssignOp::Sub), 2),
                "*=" => (Token::Assign(AssignOp::Mul), 2),
                "/=" => (Token::Assign(AssignOp::Div), 2),
                "%=" => (Token::Assign(AssignOp::Mod), 2),
                "&&" => (Token::And, 2),
                "||" => (Token::Or, 2),
                _ => {
                    let tok = match c {
                        '+' => Token::Plus,
                        '-' => Token::Minus,
                        '*' => Token::Star,
                        '/' => Token::Slash,
                        '%' => Token::Percent,
                        '<' => Token::Lt,
                        '>' => Token::Gt,
                        '=' => Token::Assign(AssignOp::Set),
                        '!' => Token::Not,
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        '{' => Token::LBrace,
                        '}' => Token::RBrace,
                        ',' => Token::Comma,
                        ':' => Token::Colon,
                        '.' => Token::Dot,
                        other => {
                            return Err(syntax(&format!("unexpected character '{}'", other), start))
                        }
                    };
                    (tok, 1)
                }
            }
        };
        tokens.push(Spanned { token, pos: start });
        i += width;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        pos: len,
    });
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), EvalError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            let escaped = match chars[i + 1] {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            };
            out.push(escaped);
            i += 2;
            continue;
        }
        if c == quote {
            return Ok((out, i + 1));
        }
        out.push(c);
        i += 1;
    }
    Err(syntax("unterminated string literal", start))
}

fn syntax(message: &str, column: usize) -> EvalError {
    EvalError::Syntax {
        message: message.to_string(),
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn numbers_and_names() {
        assert_eq!(
            kinds("gold + 1.5"),
            vec![
                Token::Name("gold".to_string()),
                Token::Plus,
                Token::Float(1.5),
                Token::Eof
            ]
        );
        assert_eq!(kinds("1_000")[0], Token::Int(1000));
        assert_eq!(kinds("2e3")[0], Token::Float(2000.0));
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            kinds("a //= 2"),
            vec![
                Token::Name("a".to_string()),
                Token::Assign(AssignOp::FloorDiv),
                Token::Int(2),
                Token::Eof
            ]
        );
        assert_eq!(kinds("a ** b")[1], Token::DoubleStar);
        assert_eq!(kinds("a != b")[1], Token::NotEq);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(kinds(r#""it\'s \"ok\"""#)[0], Token::Str("it's \"ok\"".to_string()));
        assert_eq!(kinds("'a\\nb'")[0], Token::Str("a\nb".to_string()));
    }

    #[test]
    fn lowercase_booleans_are_keywords() {
        assert_eq!(kinds("true")[0], Token::True);
        assert_eq!(kinds("False")[0], Token::False);
    }

    #[test]
    fn unterminated_string_is_error() {
        assert!(matches!(tokenize("'oops"), Err(EvalError::Syntax { .. })));
        assert!(tokenize("a $ b").is_err());
    }
}
