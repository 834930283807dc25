//! Per-edge transforms.
//!
//! A transform is either an arithmetic expression applied to every numeric
//! field of a record, or a named function resolved from a
//! [`FunctionRegistry`] when the router is built.
//!
//! Expressions support numbers, `+ - * / ^`, parentheses, unary minus, the
//! constants `pi` and `e`, the functions `abs sqrt exp ln log10 min max pow
//! floor ceil round`, and placeholders: `%x%` is the field being transformed,
//! `%name%` is the field called `name` in the incoming record.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};
use crate::record::{Record, Value};

/// A record-to-record transform function.
pub type TransformFn = Arc<dyn Fn(Record) -> Result<Record> + Send + Sync>;

/// Placeholder naming the value being transformed.
const CURRENT: &str = "x";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Min,
    Max,
    Pow,
    Floor,
    Ceil,
    Round,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "exp" => Func::Exp,
            "ln" => Func::Ln,
            "log10" => Func::Log10,
            "min" => Func::Min,
            "max" => Func::Max,
            "pow" => Func::Pow,
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "round" => Func::Round,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Func::Min | Func::Max | Func::Pow => 2,
            _ => 1,
        }
    }

    fn call(self, args: &[f64]) -> f64 {
        let a = args.first().copied().unwrap_or(f64::NAN);
        let b = args.get(1).copied().unwrap_or(f64::NAN);
        match self {
            Func::Abs => a.abs(),
            Func::Sqrt => a.sqrt(),
            Func::Exp => a.exp(),
            Func::Ln => a.ln(),
            Func::Log10 => a.log10(),
            Func::Min => a.min(b),
            Func::Max => a.max(b),
            Func::Pow => a.powf(b),
            Func::Floor => a.floor(),
            Func::Ceil => a.ceil(),
            Func::Round => a.round(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Placeholder(String),
    Ident(String),
    Op(Op),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(value));
            }
            '%' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '%')
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated %placeholder%".to_string())?;
                let name: String = chars[start..end].iter().collect();
                let name = name.trim();
                if name.is_empty() {
                    return Err("empty %placeholder%".to_string());
                }
                tokens.push(Token::Placeholder(name.to_string()));
                i = end + 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Op(Op::Pow));
                i += 2;
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(match c {
                    '+' => Op::Add,
                    '-' => Op::Sub,
                    '*' => Op::Mul,
                    '/' => Op::Div,
                    _ => Op::Pow,
                }));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> std::result::Result<(), String> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(format!("expected {what}"))
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (Op::Add | Op::Sub))) = self.peek().cloned() {
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (Op::Mul | Op::Div))) = self.peek().cloned() {
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.eat(&Token::Op(Op::Sub)) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Op(Op::Add)) {
            return self.unary();
        }
        self.power()
    }

    // power := atom ('^' unary)?, right associative
    fn power(&mut self) -> std::result::Result<Expr, String> {
        let base = self.atom()?;
        if self.eat(&Token::Op(Op::Pow)) {
            let exponent = self.unary()?;
            return Ok(Expr::Binary(Op::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Placeholder(name)) => Ok(Expr::Field(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if let Some(func) = Func::lookup(&name) {
                    self.expect(&Token::LParen, &format!("'(' after {name}"))?;
                    let mut args = vec![self.expr()?];
                    while self.eat(&Token::Comma) {
                        args.push(self.expr()?);
                    }
                    self.expect(&Token::RParen, "')'")?;
                    if args.len() != func.arity() {
                        return Err(format!(
                            "{name} takes {} argument(s), got {}",
                            func.arity(),
                            args.len()
                        ));
                    }
                    return Ok(Expr::Call(func, args));
                }
                match name.as_str() {
                    "pi" => Ok(Expr::Number(std::f64::consts::PI)),
                    "e" => Ok(Expr::Number(std::f64::consts::E)),
                    _ => Err(format!("unknown name '{name}'")),
                }
            }
            Some(token) => Err(format!("unexpected {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// A parsed arithmetic transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |message: String| RouterError::Expression {
            expression: source.to_string(),
            message,
        };

        let tokens = tokenize(source).map_err(invalid)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr().map_err(invalid)?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected {token:?} after expression")));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate with `%x%` bound to `x` and other placeholders read from
    /// `record`.
    pub fn eval(&self, x: Option<f64>, record: &Record) -> Result<f64> {
        let value = eval(&self.root, x, record)?;
        if !value.is_finite() {
            return Err(RouterError::transform(format!(
                "'{}' evaluated to {value}",
                self.source
            )));
        }
        Ok(value)
    }

    /// Apply the expression to every numeric field of `record`.
    ///
    /// Placeholders read the incoming record, so earlier fields' results do
    /// not leak into later ones. Integer fields stay integers when the result
    /// is integral. Text and boolean fields pass through.
    pub fn apply(&self, record: &Record) -> Result<Record> {
        let mut out = record.clone();
        for field in out.fields_mut() {
            let x = match field.value {
                Value::Int(n) => n as f64,
                Value::Float(f) => f,
                _ => continue,
            };
            let result = self.eval(Some(x), record).map_err(|err| {
                RouterError::transform(format!("field '{}': {err}", field.name))
            })?;
            field.value = match field.value {
                Value::Int(_) if result.fract() == 0.0 && result.abs() < i64::MAX as f64 => {
                    Value::Int(result as i64)
                }
                _ => Value::Float(result),
            };
        }
        Ok(out)
    }
}

fn eval(expr: &Expr, x: Option<f64>, record: &Record) -> Result<f64> {
    Ok(match expr {
        Expr::Number(n) => *n,
        Expr::Field(name) if name == CURRENT => {
            x.ok_or_else(|| RouterError::transform("%x% used outside a field"))?
        }
        Expr::Field(name) => match record.get(name) {
            Some(value) => value.as_f64().ok_or_else(|| {
                RouterError::transform(format!("field '{name}' is not numeric"))
            })?,
            None => {
                return Err(RouterError::transform(format!(
                    "record has no field '{name}'"
                )))
            }
        },
        Expr::Neg(inner) => -eval(inner, x, record)?,
        Expr::Binary(op, lhs, rhs) => {
            let a = eval(lhs, x, record)?;
            let b = eval(rhs, x, record)?;
            match op {
                Op::Add => a + b,
                Op::Sub => a - b,
                Op::Mul => a * b,
                Op::Div => a / b,
                Op::Pow => a.powf(b),
            }
        }
        Expr::Call(func, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, x, record))
                .collect::<Result<Vec<f64>>>()?;
            func.call(&args)
        }
    })
}

/// A transform as declared on an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformSpec {
    Expression(String),
    Function { function: String },
}

impl TransformSpec {
    /// Parse or look up the transform. Failures here are build-time errors.
    pub fn resolve(&self, functions: &FunctionRegistry) -> Result<Transform> {
        match self {
            TransformSpec::Expression(source) => {
                Ok(Transform::Expression(Expression::parse(source)?))
            }
            TransformSpec::Function { function } => Ok(Transform::Function {
                name: function.clone(),
                function: functions.resolve(function)?,
            }),
        }
    }
}

/// A resolved, ready-to-run transform.
#[derive(Clone)]
pub enum Transform {
    Expression(Expression),
    Function { name: String, function: TransformFn },
}

impl Transform {
    pub fn apply(&self, record: Record) -> Result<Record> {
        match self {
            Transform::Expression(expression) => expression.apply(&record),
            Transform::Function { function, .. } => function(record),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Expression(expression) => write!(f, "\"{}\"", expression.as_str()),
            Transform::Function { name, .. } => write!(f, "function {name}"),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transform({self})")
    }
}

/// Named transform functions available to edges.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, TransformFn>,
}

impl FunctionRegistry {
    /// A registry holding the built-in `identity` function.
    pub fn new() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        registry.register("identity", Ok);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Record) -> Result<Record> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn resolve(&self, name: &str) -> Result<TransformFn> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| RouterError::UnknownFunction(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(source: &str) -> f64 {
        Expression::parse(source)
            .unwrap()
            .eval(Some(2.0), &Record::new().with("a", 3i64))
            .unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval_str("1 + 2 * 3"), 7.0);
        assert_eq!(eval_str("(1 + 2) * 3"), 9.0);
        assert_eq!(eval_str("-2 ^ 2"), -4.0);
        assert_eq!(eval_str("2 ^ 3 ^ 2"), 512.0);
        assert_eq!(eval_str("2 ** -1"), 0.5);
        assert_eq!(eval_str("10 - 4 - 3"), 3.0);
        assert_eq!(eval_str("1.5e1 / 3"), 5.0);
    }

    #[test]
    fn placeholders_and_functions() {
        assert_eq!(eval_str("%x% * 5"), 10.0);
        assert_eq!(eval_str("%a% + %x%"), 5.0);
        assert_eq!(eval_str("max(%a%, 10) + min(1, -1)"), 9.0);
        assert_eq!(eval_str("pow(%x%, 3) + sqrt(16) + abs(-1)"), 13.0);
        assert_eq!(eval_str("floor(2.7) + ceil(2.1) + round(2.5)"), 8.0);
        assert!((eval_str("ln(e) + log10(100) + exp(0)") - 4.0).abs() < 1e-12);
    }

    #[test]
    fn parse_errors() {
        for bad in ["1 +", "(1", "foo(1)", "max(1)", "%x", "%%", "1 $ 2", "1 2"] {
            assert!(
                matches!(
                    Expression::parse(bad),
                    Err(RouterError::Expression { .. })
                ),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn apply_is_per_field_and_keeps_integers() {
        let record = Record::new().with("x", 10i64).with("y", 0.5).with("tag", "a");
        let scaled = Expression::parse("%x%*5").unwrap().apply(&record).unwrap();

        assert_eq!(scaled.get("x"), Some(&Value::Int(50)));
        assert_eq!(scaled.get("y"), Some(&Value::Float(2.5)));
        assert_eq!(scaled.get("tag"), Some(&Value::Str("a".into())));
        assert_eq!(record.get("x"), Some(&Value::Int(10)));

        let divided = Expression::parse("%x% / 4").unwrap().apply(&record).unwrap();
        assert_eq!(divided.get("x"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn placeholders_read_the_incoming_record() {
        let record = Record::new().with("a", 1i64).with("b", 2i64);
        let out = Expression::parse("%x% + %a%").unwrap().apply(&record).unwrap();
        assert_eq!(out.values(), vec![Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn evaluation_errors_are_transform_errors() {
        let record = Record::new().with("x", 0i64).with("name", "pump");
        let cases = ["1 / %x%", "sqrt(-1) + %x%", "%missing% + 1", "%name% + 1"];
        for source in cases {
            let expression = Expression::parse(source).unwrap();
            assert!(
                matches!(expression.apply(&record), Err(RouterError::Transform(_))),
                "{source} should fail"
            );
        }
    }

    #[test]
    fn spec_deserializes_both_forms() {
        let expr: TransformSpec = serde_json::from_str(r#""%x%*5""#).unwrap();
        assert_eq!(expr, TransformSpec::Expression("%x%*5".into()));

        let func: TransformSpec = serde_json::from_str(r#"{"function": "double"}"#).unwrap();
        assert_eq!(
            func,
            TransformSpec::Function {
                function: "double".into()
            }
        );
    }

    #[test]
    fn functions_resolve_from_registry() {
        let mut registry = FunctionRegistry::new();
        registry.register("double", |mut record: Record| {
            for field in record.fields_mut() {
                if let Value::Int(n) = field.value {
                    field.value = Value::Int(n * 2);
                }
            }
            Ok(record)
        });

        let spec = TransformSpec::Function {
            function: "double".into(),
        };
        let transform = spec.resolve(&registry).unwrap();
        let out = transform.apply(Record::new().with("x", 4i64)).unwrap();
        assert_eq!(out.get("x"), Some(&Value::Int(8)));

        let identity = TransformSpec::Function {
            function: "identity".into(),
        }
        .resolve(&registry)
        .unwrap();
        assert_eq!(
            identity.apply(Record::new().with("x", 1i64)).unwrap(),
            Record::new().with("x", 1i64)
        );

        let missing = TransformSpec::Function {
            function: "nope".into(),
        };
        assert!(matches!(
            missing.resolve(&registry),
            Err(RouterError::UnknownFunction(name)) if name == "nope"
        ));
    }
}
