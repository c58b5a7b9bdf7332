//! Condition expression language: lexer, parser, and evaluator.
//!
//! Conditions guard conditional edges and loop gates. The only binding in
//! scope is a read-only view of the run state; there are no functions, no
//! assignment, and no way to reach anything outside the state mapping.
//!
//! Grammar:
//! ```text
//! Expr        ::= Or
//! Or          ::= And ( ('or' | '||') And )*
//! And         ::= Not ( ('and' | '&&') Not )*
//! Not         ::= ('not' | '!') Not | Comparison
//! Comparison  ::= Sum ( CompOp Sum )?
//! CompOp      ::= '==' | '!=' | '<' | '<=' | '>' | '>=' | 'in' | 'not' 'in'
//! Sum         ::= Product ( ('+' | '-') Product )*
//! Product     ::= Unary ( ('*' | '/' | '%') Unary )*
//! Unary       ::= '-' Unary | Postfix
//! Postfix     ::= Primary ( '[' Expr ']' | '.' Ident | '.get(' Expr (',' Expr)? ')' )*
//! Primary     ::= Number | String | 'true' | 'false' | 'True' | 'False'
//!               | 'null' | 'None' | Ident | '(' Expr ')' | '[' ( Expr (',' Expr)* )? ']'
//! ```
//!
//! `state` names the whole mapping. Any other identifier is a key lookup, so
//! `counter > 5` and `state['counter'] > 5` are equivalent.

use std::borrow::Cow;
use std::cmp::Ordering;

use flowgraph_types::RunState;
use serde_json::{Map, Number, Value};

/// Name of the single binding visible to expressions.
pub const STATE_BINDING: &str = "state";

/// Deepest expression nesting the parser accepts. Evaluation recurses over
/// the tree, so this also bounds evaluation depth.
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("condition parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("condition evaluation error: {0}")]
    Eval(String),
}

fn parse_error(offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Parse {
        offset,
        message: message.into(),
    }
}

fn eval_error(message: impl Into<String>) -> ConditionError {
    ConditionError::Eval(message.into())
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A parsed condition, ready to evaluate against any number of states.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub source: String,
    pub root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// The `state` binding itself.
    State,
    /// Bare identifier: a key in state.
    Key(String),
    List(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Get {
        target: Box<Expr>,
        key: Box<Expr>,
        default: Option<Box<Expr>>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

const TWO_CHAR_OPS: &[&str] = &["==", "!=", "<=", ">=", "&&", "||"];

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            // A dot followed by a digit continues the literal; otherwise it is
            // member access and belongs to the next token.
            if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let token = if is_float {
                Token::Float(
                    text.parse()
                        .map_err(|_| parse_error(offset, format!("bad number '{text}'")))?,
                )
            } else {
                match text.parse::<i64>() {
                    Ok(n) => Token::Int(n),
                    Err(_) => Token::Float(
                        text.parse()
                            .map_err(|_| parse_error(offset, format!("bad number '{text}'")))?,
                    ),
                }
            };
            tokens.push((offset, token));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(parse_error(offset, "unterminated string literal"));
                };
                i += 1;
                match ch {
                    '\\' => {
                        let Some(&(_, escaped)) = chars.get(i) else {
                            return Err(parse_error(offset, "unterminated string literal"));
                        };
                        i += 1;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    ch if ch == quote => break,
                    ch => value.push(ch),
                }
            }
            tokens.push((offset, Token::Str(value)));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
            tokens.push((offset, Token::Ident(ident)));
            continue;
        }

        if let Some(&(_, next)) = chars.get(i + 1) {
            let pair: String = [c, next].iter().collect();
            if let Some(op) = TWO_CHAR_OPS.iter().find(|op| **op == pair) {
                tokens.push((offset, Token::Op(*op)));
                i += 2;
                continue;
            }
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '.' => Token::Dot,
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '!' => Token::Op("!"),
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            '=' => return Err(parse_error(offset, "assignment is not allowed; use '=='")),
            other => return Err(parse_error(offset, format!("unexpected character '{other}'"))),
        };
        tokens.push((offset, token));
        i += 1;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    /// Current nesting of the expression under construction.
    depth: usize,
}

impl Parser {
    /// Count one more level of nesting, failing past [`MAX_NESTING`].
    fn descend(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(parse_error(
                self.offset(),
                format!("expression nests deeper than {MAX_NESTING} levels"),
            ));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn at_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ConditionError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(parse_error(self.offset(), format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut left = self.parse_and()?;
        while self.at_ident("or") || self.at_op("||") {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut left = self.parse_not()?;
        while self.at_ident("and") || self.at_op("&&") {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.at_ident("not") || self.at_op("!") {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<(BinaryOp, usize)> {
        match self.peek()? {
            Token::Op("==") => Some((BinaryOp::Eq, 1)),
            Token::Op("!=") => Some((BinaryOp::NotEq, 1)),
            Token::Op("<") => Some((BinaryOp::Lt, 1)),
            Token::Op("<=") => Some((BinaryOp::Le, 1)),
            Token::Op(">") => Some((BinaryOp::Gt, 1)),
            Token::Op(">=") => Some((BinaryOp::Ge, 1)),
            Token::Ident(w) if w == "in" => Some((BinaryOp::In, 1)),
            Token::Ident(w)
                if w == "not" && matches!(self.peek_at(1), Some(Token::Ident(n)) if n == "in") =>
            {
                Some((BinaryOp::NotIn, 2))
            }
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_sum()?;
        let Some((op, width)) = self.comparison_op() else {
            return Ok(left);
        };
        self.pos += width;
        self.descend()?;
        let right = self.parse_sum()?;
        self.depth -= 1;
        if self.comparison_op().is_some() {
            return Err(parse_error(
                self.offset(),
                "chained comparisons are not supported; join them with 'and'",
            ));
        }
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_sum(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            let right = self.parse_product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_product(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("%")) => BinaryOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.descend()?;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.at_op("-") {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ConditionError> {
        let base = self.depth;
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.pos += 1;
                    self.descend()?;
                    let key = self.parse_or()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    self.descend()?;
                    let offset = self.offset();
                    let Some(Token::Ident(name)) = self.advance() else {
                        return Err(parse_error(offset, "expected a name after '.'"));
                    };
                    if name == "get" && self.peek() == Some(&Token::LParen) {
                        self.pos += 1;
                        let key = self.parse_or()?;
                        let default = if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            Some(Box::new(self.parse_or()?))
                        } else {
                            None
                        };
                        self.expect(Token::RParen, "')' to close get(...)")?;
                        expr = Expr::Get {
                            target: Box::new(expr),
                            key: Box::new(key),
                            default,
                        };
                    } else if self.peek() == Some(&Token::LParen) {
                        return Err(parse_error(
                            offset,
                            format!("method '{name}' is not available; only get(...) is"),
                        ));
                    } else {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                }
                _ => {
                    self.depth = base;
                    return Ok(expr);
                }
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        let token = self
            .advance()
            .ok_or_else(|| parse_error(offset, "unexpected end of expression"))?;
        match token {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => Number::from_f64(f)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| parse_error(offset, "number out of range")),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::LBracket => {
                self.descend()?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(Token::RBracket, "']' to close list")?;
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            Token::Ident(word) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" => {
                    Err(parse_error(offset, format!("unexpected keyword '{word}'")))
                }
                STATE_BINDING => {
                    if self.peek() == Some(&Token::LParen) {
                        return Err(parse_error(offset, "'state' is not callable"));
                    }
                    Ok(Expr::State)
                }
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        return Err(parse_error(
                            offset,
                            format!("function calls are not allowed: '{word}(...)'"),
                        ));
                    }
                    Ok(Expr::Key(word))
                }
            },
            other => Err(parse_error(offset, format!("unexpected token {other:?}"))),
        }
    }
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// Empty input is a parse error: an edge or loop with no condition is never
/// taken.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(parse_error(0, "empty condition"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    let root = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parse_error(parser.offset(), "unexpected trailing input"));
    }
    Ok(ConditionExpr {
        source: input.to_string(),
        root,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A value during evaluation. The state binding is kept by reference so
/// `state['k']` never copies the whole mapping.
enum Operand<'a> {
    State(&'a Map<String, Value>),
    Value(Cow<'a, Value>),
}

impl<'a> Operand<'a> {
    fn owned(value: Value) -> Self {
        Operand::Value(Cow::Owned(value))
    }

    fn into_value(self) -> Cow<'a, Value> {
        match self {
            Operand::State(map) => Cow::Owned(Value::Object(map.clone())),
            Operand::Value(v) => v,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Operand::State(map) => !map.is_empty(),
            Operand::Value(v) => truthy(v),
        }
    }

    /// Key lookup on a mapping; `Ok(None)` when the key is absent.
    fn member(self, key: &str) -> Result<Option<Operand<'a>>, ConditionError> {
        match self {
            Operand::State(map) => Ok(map.get(key).map(|v| Operand::Value(Cow::Borrowed(v)))),
            Operand::Value(Cow::Borrowed(Value::Object(map))) => {
                Ok(map.get(key).map(|v| Operand::Value(Cow::Borrowed(v))))
            }
            Operand::Value(Cow::Owned(Value::Object(mut map))) => {
                Ok(map.remove(key).map(Operand::owned))
            }
            Operand::Value(other) => Err(eval_error(format!(
                "cannot look up '{key}' on {}",
                type_name(&other)
            ))),
        }
    }

    fn index(self, key: &Value) -> Result<Operand<'a>, ConditionError> {
        match key {
            Value::String(k) => self
                .member(k)?
                .ok_or_else(|| eval_error(format!("key '{k}' not found"))),
            Value::Number(n) => {
                let idx = n
                    .as_i64()
                    .ok_or_else(|| eval_error("list index must be an integer"))?;
                let list = match self {
                    Operand::Value(Cow::Borrowed(Value::Array(items))) => {
                        return pick(items.len(), idx)
                            .map(|i| Operand::Value(Cow::Borrowed(&items[i])));
                    }
                    Operand::Value(Cow::Owned(Value::Array(items))) => items,
                    Operand::State(_) => return Err(eval_error("state keys are strings")),
                    Operand::Value(other) => {
                        return Err(eval_error(format!(
                            "{} is not indexable by number",
                            type_name(&other)
                        )))
                    }
                };
                let i = pick(list.len(), idx)?;
                Ok(Operand::owned(list.into_iter().nth(i).unwrap_or(Value::Null)))
            }
            other => Err(eval_error(format!(
                "invalid subscript of type {}",
                type_name(other)
            ))),
        }
    }
}

fn pick(len: usize, idx: i64) -> Result<usize, ConditionError> {
    let resolved = if idx < 0 { len as i64 + idx } else { idx };
    if resolved < 0 || resolved as usize >= len {
        return Err(eval_error(format!("list index {idx} out of range")));
    }
    Ok(resolved as usize)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Truthiness: null, false, zero, and empty strings/lists/mappings are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality with numeric comparison across integer and float.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loosely_equal(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, v)| ym.get(k).is_some_and(|w| loosely_equal(v, w)))
        }
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<Ordering, ConditionError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                return Ok(i.cmp(&j));
            }
            let (fx, fy) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            fx.partial_cmp(&fy)
                .ok_or_else(|| eval_error("numbers are not comparable"))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(eval_error(format!(
            "cannot order {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn contains(needle: &Value, haystack: Operand<'_>) -> Result<bool, ConditionError> {
    match haystack {
        Operand::State(map) => match needle {
            Value::String(k) => Ok(map.contains_key(k)),
            other => Err(eval_error(format!(
                "state keys are strings, not {}",
                type_name(other)
            ))),
        },
        Operand::Value(hay) => match hay.as_ref() {
            Value::String(s) => match needle {
                Value::String(sub) => Ok(s.contains(sub.as_str())),
                other => Err(eval_error(format!(
                    "'in <string>' requires a string, not {}",
                    type_name(other)
                ))),
            },
            Value::Array(items) => Ok(items.iter().any(|item| loosely_equal(needle, item))),
            Value::Object(map) => match needle {
                Value::String(k) => Ok(map.contains_key(k)),
                other => Err(eval_error(format!(
                    "mapping keys are strings, not {}",
                    type_name(other)
                ))),
            },
            other => Err(eval_error(format!(
                "membership test on {}",
                type_name(other)
            ))),
        },
    }
}

fn number(f: f64) -> Result<Value, ConditionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| eval_error("arithmetic produced a non-finite number"))
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ConditionError> {
    match (op, a, b) {
        (BinaryOp::Add, Value::String(x), Value::String(y)) => {
            return Ok(Value::String(format!("{x}{y}")))
        }
        (BinaryOp::Add, Value::Array(x), Value::Array(y)) => {
            return Ok(Value::Array(x.iter().chain(y).cloned().collect()))
        }
        _ => {}
    }

    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(eval_error(format!(
            "unsupported operand types {} and {}",
            type_name(a),
            type_name(b)
        )));
    };

    if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
        let exact = match op {
            BinaryOp::Add => i.checked_add(j),
            BinaryOp::Sub => i.checked_sub(j),
            BinaryOp::Mul => i.checked_mul(j),
            BinaryOp::Rem if j == 0 => return Err(eval_error("modulo by zero")),
            // Result takes the sign of the divisor.
            BinaryOp::Rem => i
                .checked_rem(j)
                .map(|r| if r != 0 && (r < 0) != (j < 0) { r + j } else { r }),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let (fx, fy) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
    match op {
        BinaryOp::Add => number(fx + fy),
        BinaryOp::Sub => number(fx - fy),
        BinaryOp::Mul => number(fx * fy),
        BinaryOp::Div if fy == 0.0 => Err(eval_error("division by zero")),
        BinaryOp::Div => number(fx / fy),
        BinaryOp::Rem if fy == 0.0 => Err(eval_error("modulo by zero")),
        BinaryOp::Rem => number(fx - fy * (fx / fy).floor()),
        _ => Err(eval_error("not an arithmetic operator")),
    }
}

fn eval<'a>(expr: &Expr, state: &'a Map<String, Value>) -> Result<Operand<'a>, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(Operand::owned(v.clone())),
        Expr::State => Ok(Operand::State(state)),
        Expr::Key(k) => state
            .get(k)
            .map(|v| Operand::Value(Cow::Borrowed(v)))
            .ok_or_else(|| eval_error(format!("name '{k}' is not defined in state"))),
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, state).map(|op| op.into_value().into_owned()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Operand::owned(Value::Array(values)))
        }
        Expr::Index(target, key) => {
            let key = eval(key, state)?.into_value();
            eval(target, state)?.index(&key)
        }
        Expr::Field(target, name) => eval(target, state)?
            .member(name)?
            .ok_or_else(|| eval_error(format!("key '{name}' not found"))),
        Expr::Get {
            target,
            key,
            default,
        } => {
            let key = eval(key, state)?.into_value();
            let Value::String(k) = key.as_ref() else {
                return Err(eval_error("get() key must be a string"));
            };
            match eval(target, state)?.member(k)? {
                Some(found) => Ok(found),
                None => match default {
                    Some(d) => eval(d, state),
                    None => Ok(Operand::owned(Value::Null)),
                },
            }
        }
        Expr::Not(inner) => Ok(Operand::owned(Value::Bool(!eval(inner, state)?.truthy()))),
        Expr::Neg(inner) => {
            let v = eval(inner, state)?.into_value();
            arithmetic(BinaryOp::Sub, &Value::from(0), &v).map(Operand::owned)
        }
        Expr::And(l, r) => {
            if !eval(l, state)?.truthy() {
                return Ok(Operand::owned(Value::Bool(false)));
            }
            Ok(Operand::owned(Value::Bool(eval(r, state)?.truthy())))
        }
        Expr::Or(l, r) => {
            if eval(l, state)?.truthy() {
                return Ok(Operand::owned(Value::Bool(true)));
            }
            Ok(Operand::owned(Value::Bool(eval(r, state)?.truthy())))
        }
        Expr::Binary(op, l, r) => {
            let left = eval(l, state)?;
            let right = eval(r, state)?;
            let result = match op {
                BinaryOp::In => Value::Bool(contains(&left.into_value(), right)?),
                BinaryOp::NotIn => Value::Bool(!contains(&left.into_value(), right)?),
                BinaryOp::Eq => Value::Bool(loosely_equal(&left.into_value(), &right.into_value())),
                BinaryOp::NotEq => {
                    Value::Bool(!loosely_equal(&left.into_value(), &right.into_value()))
                }
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    let ord = order(&left.into_value(), &right.into_value())?;
                    Value::Bool(match op {
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::Le => ord != Ordering::Greater,
                        BinaryOp::Gt => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    })
                }
                _ => arithmetic(*op, &left.into_value(), &right.into_value())?,
            };
            Ok(Operand::owned(result))
        }
    }
}

impl ConditionExpr {
    /// Evaluate against `state`, returning the truthiness of the result.
    pub fn evaluate(&self, state: &RunState) -> Result<bool, ConditionError> {
        Ok(eval(&self.root, state.as_map())?.truthy())
    }

    /// Evaluate and return the raw value rather than its truthiness.
    pub fn value(&self, state: &RunState) -> Result<Value, ConditionError> {
        Ok(eval(&self.root, state.as_map())?.into_value().into_owned())
    }
}

/// Parse and evaluate in one go, surfacing any failure.
pub fn evaluate_condition(condition: &str, state: &RunState) -> Result<bool, ConditionError> {
    parse_condition(condition)?.evaluate(state)
}

// ---------------------------------------------------------------------------
// ConditionEvaluator: the engine-facing seam
// ---------------------------------------------------------------------------

/// Decides whether a condition holds for the current state.
///
/// Implementations must be fail-closed: any failure yields `false`.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, state: &RunState) -> bool;
}

/// The default evaluator backed by the expression language above.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, condition: &str, state: &RunState) -> bool {
        match evaluate_condition(condition, state) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    condition = %condition,
                    error = %err,
                    "Condition evaluation failed, treating as false"
                );
                false
            }
        }
    }
}
