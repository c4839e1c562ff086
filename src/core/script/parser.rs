/// Expression and statement parser (precedence climbing over `lexer` tokens).

use super::lexer::{tokenize, Spanned, Token};
use super::EvalError;
use crate::schema::story::AssignOp;
use crate::schema::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// Chained comparison: `a < b <= c`.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Slice {
        base: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    ListComp {
        element: Box<Expr>,
        clauses: Vec<CompClause>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        clauses: Vec<CompClause>,
    },
}

/// `for targets in iter if cond...` inside a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct CompClause {
    pub targets: Vec<String>,
    pub iter: Expr,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn from_assign(op: AssignOp) -> Option<BinOp> {
        match op {
            AssignOp::Set => None,
            AssignOp::Add => Some(Self::Add),
            AssignOp::Sub => Some(Self::Sub),
            AssignOp::Mul => Some(Self::Mul),
            AssignOp::Div => Some(Self::Div),
            AssignOp::FloorDiv => Some(Self::FloorDiv),
            AssignOp::Mod => Some(Self::Mod),
            AssignOp::Pow => Some(Self::Pow),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Is,
    IsNot,
}

/// A statement: assignment (plain or augmented) or a bare expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        target: Expr,
        op: AssignOp,
        value: Expr,
    },
    Expr(Expr),
}

impl Expr {
    /// Names, attributes and index expressions can be assigned to.
    pub fn is_place(&self) -> bool {
        match self {
            Expr::Name(_) => true,
            Expr::Attr(base, _) | Expr::Index(base, _) => base.is_place(),
            _ => false,
        }
    }

    /// Root variable of a place expression.
    pub fn root_name(&self) -> Option<&str> {
        match self {
            Expr::Name(name) => Some(name),
            Expr::Attr(base, _) | Expr::Index(base, _) => base.root_name(),
            _ => None,
        }
    }
}

pub fn parse_expression(source: &str) -> Result<Expr, EvalError> {
    let mut parser = Parser::new(source)?;
    let expr = parser.expression()?;
    parser.expect_end()?;
    Ok(expr)
}

pub fn parse_statement(source: &str) -> Result<Stmt, EvalError> {
    let mut parser = Parser::new(source)?;
    let first = parser.expression()?;
    if let Token::Assign(op) = parser.peek().clone() {
        if !first.is_place() {
            return Err(parser.error("cannot assign to this expression"));
        }
        parser.advance();
        let value = parser.expression()?;
        parser.expect_end()?;
        return Ok(Stmt::Assign {
            target: first,
            op,
            value,
        });
    }
    parser.expect_end()?;
    Ok(Stmt::Expr(first))
}

/// Parse a place expression (assignment target).
pub fn parse_target(source: &str) -> Result<Expr, EvalError> {
    let expr = parse_expression(source)?;
    if expr.is_place() {
        Ok(expr)
    } else {
        Err(EvalError::Syntax {
            message: format!("cannot assign to '{}'", source.trim()),
            column: 0,
        })
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, EvalError> {
        let tokens = tokenize(source)?;
        if tokens.len() == 1 {
            return Err(EvalError::Syntax {
                message: "empty expression".to_string(),
                column: 0,
            });
        }
        Ok(Self { tokens, pos: 0 })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), EvalError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn expect_end(&self) -> Result<(), EvalError> {
        if *self.peek() == Token::Eof {
            Ok(())
        } else {
            Err(self.error(&format!("unexpected {}", describe(self.peek()))))
        }
    }

    fn error(&self, message: &str) -> EvalError {
        EvalError::Syntax {
            message: message.to_string(),
            column: self.tokens[self.pos].pos,
        }
    }

    fn expression(&mut self) -> Result<Expr, EvalError> {
        let expr = self.or_expr()?;
        if *self.peek() == Token::If {
            self.advance();
            let cond = self.or_expr()?;
            self.expect(Token::Else, "'else' in conditional expression")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(expr),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Token::Not) {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.additive()?;
        let mut chain = Vec::new();
        loop {
            let op = match self.peek() {
                Token::EqEq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::Lt => CmpOp::Lt,
                Token::LtEq => CmpOp::LtEq,
                Token::Gt => CmpOp::Gt,
                Token::GtEq => CmpOp::GtEq,
                Token::In => CmpOp::In,
                Token::Not if *self.peek_at(1) == Token::In => {
                    self.advance();
                    CmpOp::NotIn
                }
                Token::Is => {
                    if *self.peek_at(1) == Token::Not {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            chain.push((op, right));
        }
        if chain.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), chain))
        }
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn power(&mut self) -> Result<Expr, EvalError> {
        let base = self.postfix()?;
        if self.eat(&Token::DoubleStar) {
            // Right associative, and binds tighter than a unary minus on the left.
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    match self.advance() {
                        Token::Name(name) => expr = Expr::Attr(Box::new(expr), name),
                        _ => return Err(self.error("expected attribute name after '.'")),
                    }
                }
                Token::LParen => {
                    self.advance();
                    let (args, kwargs) = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    expr = self.subscript(expr)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn subscript(&mut self, base: Expr) -> Result<Expr, EvalError> {
        let start = if *self.peek() == Token::Colon {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        if self.eat(&Token::Colon) {
            let end = if *self.peek() == Token::RBracket {
                None
            } else {
                Some(Box::new(self.expression()?))
            };
            self.expect(Token::RBracket, "']'")?;
            return Ok(Expr::Slice {
                base: Box::new(base),
                start,
                end,
            });
        }
        self.expect(Token::RBracket, "']'")?;
        match start {
            Some(index) => Ok(Expr::Index(Box::new(base), index)),
            None => Err(self.error("empty subscript")),
        }
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), EvalError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while *self.peek() != Token::RParen {
            let is_keyword = matches!(self.peek(), Token::Name(_))
                && *self.peek_at(1) == Token::Assign(AssignOp::Set);
            if is_keyword {
                let name = match self.advance() {
                    Token::Name(name) => name,
                    _ => unreachable!("checked above"),
                };
                self.advance();
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "')'")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Str(s) => {
                // Adjacent string literals concatenate.
                let mut text = s;
                while let Token::Str(next) = self.peek().clone() {
                    self.advance();
                    text.push_str(&next);
                }
                Ok(Expr::Literal(Value::Str(text)))
            }
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::None => Ok(Expr::Literal(Value::None)),
            Token::Name(name) => Ok(Expr::Name(name)),
            Token::LParen => {
                if self.eat(&Token::RParen) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expression()?;
                if *self.peek() == Token::For {
                    let clauses = self.comp_clauses()?;
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        clauses,
                    });
                }
                if self.eat(&Token::Comma) {
                    let mut items = vec![first];
                    while *self.peek() != Token::RParen {
                        items.push(self.expression()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::List(items));
                }
                self.expect(Token::RParen, "')'")?;
                Ok(first)
            }
            Token::LBracket => {
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expression()?;
                if *self.peek() == Token::For {
                    let clauses = self.comp_clauses()?;
                    self.expect(Token::RBracket, "']'")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        clauses,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Token::Comma) {
                    if *self.peek() == Token::RBracket {
                        break;
                    }
                    items.push(self.expression()?);
                }
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let key = self.expression()?;
                self.expect(Token::Colon, "':' in dict literal")?;
                let value = self.expression()?;
                if *self.peek() == Token::For {
                    let clauses = self.comp_clauses()?;
                    self.expect(Token::RBrace, "'}'")?;
                    return Ok(Expr::DictComp {
                        key: Box::new(key),
                        value: Box::new(value),
                        clauses,
                    });
                }
                let mut entries = vec![(key, value)];
                while self.eat(&Token::Comma) {
                    if *self.peek() == Token::RBrace {
                        break;
                    }
                    let key = self.expression()?;
                    self.expect(Token::Colon, "':' in dict literal")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                }
                self.expect(Token::RBrace, "'}'")?;
                Ok(Expr::Dict(entries))
            }
            other => {
                // Step back so the error column points at the bad token.
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(&format!("unexpected {}", describe(&other))))
            }
        }
    }

    fn comp_clauses(&mut self) -> Result<Vec<CompClause>, EvalError> {
        let mut clauses = Vec::new();
        while self.eat(&Token::For) {
            let mut targets = Vec::new();
            loop {
                match self.advance() {
                    Token::Name(name) => targets.push(name),
                    _ => return Err(self.error("expected loop variable name")),
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::In, "'in' in comprehension")?;
            let iter = self.or_expr()?;
            let mut conditions = Vec::new();
            while self.eat(&Token::If) {
                conditions.push(self.or_expr()?);
            }
            clauses.push(CompClause {
                targets,
                iter,
                conditions,
            });
        }
        Ok(clauses)
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Eof => "end of expression".to_string(),
        Token::Name(name) => format!("name '{}'", name),
        Token::Str(_) => "string literal".to_string(),
        Token::Int(i) => format!("number {}", i),
        Token::Float(f) => format!("number {}", f),
        other => format!("token {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_of_arithmetic() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary(BinOp::Add, _, right) => {
                assert!(matches!(*right, Expr::Binary(BinOp::Mul, _, _)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn power_binds_tighter_than_negation() {
        let expr = parse_expression("-2 ** 2").unwrap();
        assert!(matches!(expr, Expr::Unary(UnaryOp::Neg, _)));
    }

    #[test]
    fn chained_comparison_and_membership() {
        let expr = parse_expression("0 < x <= 10").unwrap();
        assert!(matches!(expr, Expr::Compare(_, ref chain) if chain.len() == 2));
        let expr = parse_expression("'key' not in inventory").unwrap();
        assert!(matches!(expr, Expr::Compare(_, ref chain) if chain[0].0 == CmpOp::NotIn));
    }

    #[test]
    fn method_chain_and_kwargs() {
        let expr = parse_expression("card.in_position('past').name(upper=True)").unwrap();
        match expr {
            Expr::Call { func, kwargs, .. } => {
                assert_eq!(kwargs.len(), 1);
                assert!(matches!(*func, Expr::Attr(_, ref name) if name == "name"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn comprehensions() {
        let expr = parse_expression("[c.name for c in cards if c.reversed]").unwrap();
        assert!(matches!(expr, Expr::ListComp { ref clauses, .. } if clauses[0].conditions.len() == 1));
        let expr = parse_expression("{k: v * 2 for k, v in prices.items()}").unwrap();
        assert!(matches!(expr, Expr::DictComp { ref clauses, .. } if clauses[0].targets.len() == 2));
    }

    #[test]
    fn ternary_and_slices() {
        assert!(matches!(
            parse_expression("'yes' if ok else 'no'").unwrap(),
            Expr::Ternary { .. }
        ));
        assert!(matches!(
            parse_expression("items[1:]").unwrap(),
            Expr::Slice { end: None, .. }
        ));
    }

    #[test]
    fn statements() {
        assert!(matches!(
            parse_statement("gold += 5").unwrap(),
            Stmt::Assign { op: AssignOp::Add, .. }
        ));
        assert!(matches!(
            parse_statement("inventory['key'] = True").unwrap(),
            Stmt::Assign { .. }
        ));
        assert!(matches!(parse_statement("items.append(1)").unwrap(), Stmt::Expr(_)));
        assert!(parse_statement("1 = 2").is_err());
    }

    #[test]
    fn syntax_errors() {
        assert!(parse_expression("a +").is_err());
        assert!(parse_expression("(a").is_err());
        assert!(parse_expression("f(x=1, 2)").is_err());
        assert!(parse_expression("").is_err());
        assert!(parse_expression("a b").is_err());
    }
}
