//! Restricted expression language for node conditions and values.
//!
//! Supported:
//! - Paths: dotted names resolved against a [`Scope`] (`sender_phone`,
//!   `trigger.message.text`, `items.0`)
//! - Literals: single- or double-quoted strings, numbers, `true`, `false`, `null`
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`, `contains`
//! - Logic: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses
//!
//! Equality is loose: `1 == "1"`, `true == "true"` and `1 == 1.0` all hold.
//! Ordering compares numerically when both sides coerce to numbers and
//! lexically when both are strings; any other pairing is false. Missing
//! paths evaluate to `null`.
//!
//! There are no function calls, assignments or loops, so evaluation is
//! side-effect free and always terminates.

use crate::context::RunContext;
use crate::error::NodeError;
use serde_json::Value as JsonValue;
use std::fmt;

/// Anything expressions can resolve paths against.
pub trait Scope {
    /// Resolves a dotted path, returning `None` when it is missing.
    fn resolve(&self, path: &str) -> Option<JsonValue>;
}

impl Scope for RunContext {
    fn resolve(&self, path: &str) -> Option<JsonValue> {
        self.lookup(path)
    }
}

impl Scope for JsonValue {
    fn resolve(&self, path: &str) -> Option<JsonValue> {
        path.split('.').try_fold(self.clone(), |value, segment| match value {
            JsonValue::Object(mut map) => map.remove(segment),
            JsonValue::Array(mut items) => {
                let i = segment.parse::<usize>().ok()?;
                (i < items.len()).then(|| items.swap_remove(i))
            }
            _ => None,
        })
    }
}

/// Errors from parsing an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionError {
    /// The expression that failed to parse.
    pub source: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ExpressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in `{}`", self.message, self.source)
    }
}

impl std::error::Error for ExpressionError {}

impl From<ExpressionError> for NodeError {
    fn from(e: ExpressionError) -> Self {
        Self::Expression {
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns an error for empty input, unterminated strings, unknown
    /// characters, malformed structure or excessive nesting.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let fail = |message: String| ExpressionError {
            source: source.to_string(),
            message,
        };
        let tokens = tokenize(source).map_err(fail)?;
        if tokens.is_empty() {
            return Err(fail("empty expression".to_string()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or().map_err(fail)?;
        if let Some(token) = parser.peek() {
            return Err(fail(format!("unexpected token {token:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates to a value.
    #[must_use]
    pub fn eval_value(&self, scope: &dyn Scope) -> JsonValue {
        eval(&self.root, scope)
    }

    /// Evaluates and reduces the result to a boolean.
    #[must_use]
    pub fn eval_bool(&self, scope: &dyn Scope) -> bool {
        truthy(&self.eval_value(scope))
    }
}

/// Parses and tests a condition in one step.
///
/// # Errors
///
/// Returns an error when the condition does not parse.
pub fn evaluate_condition(source: &str, scope: &dyn Scope) -> Result<bool, ExpressionError> {
    Ok(Expression::parse(source)?.eval_bool(scope))
}

/// Parses and evaluates a value expression in one step.
///
/// # Errors
///
/// Returns an error when the expression does not parse.
pub fn evaluate_value(source: &str, scope: &dyn Scope) -> Result<JsonValue, ExpressionError> {
    Ok(Expression::parse(source)?.eval_value(scope))
}

/// Truthiness: `null`, `false`, `0`, `""` and `[]` are false.
#[must_use]
pub fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(_) => true,
    }
}

/// Type-coercing equality used by `==` and the `switch` node.
#[must_use]
pub fn loose_eq(a: &JsonValue, b: &JsonValue) -> bool {
    use JsonValue::{Bool, Null, Number, String};
    match (a, b) {
        (Null, Null) => true,
        (Null, _) | (_, Null) => false,
        (Number(x), Number(y)) => x.as_f64() == y.as_f64(),
        (Number(n), String(s)) | (String(s), Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Bool(flag), String(s)) | (String(s), Bool(flag)) => {
            s.trim().eq_ignore_ascii_case(if *flag { "true" } else { "false" })
        }
        (Bool(flag), Number(n)) | (Number(n), Bool(flag)) => {
            n.as_f64() == Some(if *flag { 1.0 } else { 0.0 })
        }
        _ => a == b,
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn display(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval(expr: &Expr, scope: &dyn Scope) -> JsonValue {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(p) => scope.resolve(p).unwrap_or(JsonValue::Null),
        Expr::Not(inner) => JsonValue::Bool(!truthy(&eval(inner, scope))),
        Expr::And(l, r) => JsonValue::Bool(truthy(&eval(l, scope)) && truthy(&eval(r, scope))),
        Expr::Or(l, r) => JsonValue::Bool(truthy(&eval(l, scope)) || truthy(&eval(r, scope))),
        Expr::Compare(l, op, r) => {
            let (l, r) = (eval(l, scope), eval(r, scope));
            JsonValue::Bool(compare(&l, *op, &r))
        }
    }
}

fn compare(l: &JsonValue, op: CmpOp, r: &JsonValue) -> bool {
    match op {
        CmpOp::Eq => loose_eq(l, r),
        CmpOp::Ne => !loose_eq(l, r),
        CmpOp::Contains => match l {
            JsonValue::String(s) => !r.is_null() && s.contains(&display(r)),
            JsonValue::Array(items) => items.iter().any(|item| loose_eq(item, r)),
            JsonValue::Object(map) => map.contains_key(&display(r)),
            _ => false,
        },
        CmpOp::Gt | CmpOp::Lt | CmpOp::Ge | CmpOp::Le => {
            let ordering = match (as_number(l), as_number(r)) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => match (l, r) {
                    (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => ordering.is_le(),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let peek = |i: usize| chars.get(i).copied();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(c) = peek(i) {
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if peek(i + 1) == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if peek(i + 1) == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let or_equal = peek(i + 1) == Some('=');
                tokens.push(Token::Op(match (c, or_equal) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                }));
                i += if or_equal { 2 } else { 1 };
            }
            '&' if peek(i + 1) == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if peek(i + 1) == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match peek(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') if peek(i + 1).is_some() => {
                            s.extend(peek(i + 1));
                            i += 2;
                        }
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && peek(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while peek(i).is_some_and(|n| n.is_ascii_digit() || n == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while peek(i).is_some_and(|n| n.is_alphanumeric() || n == '_' || n == '.' || n == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Op(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

/// Deepest nesting of `!` and parentheses a parse accepts.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("nesting deeper than {MAX_DEPTH} levels"));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Ident(path)) => Ok(Expr::Path(path)),
            Some(Token::Str(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number),
            )),
            Some(Token::Bool(b)) => Ok(Expr::Literal(JsonValue::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(JsonValue::Null)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
