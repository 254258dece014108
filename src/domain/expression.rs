//! Restricted boolean expression sandbox for custom rules.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | compare
//! compare := sum (("<" | "<=" | ">" | ">=" | "==" | "!=") sum)*
//! sum     := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "%") unary)*
//! unary   := ("-" | "+") unary | power
//! power   := atom ("**" unary)?
//! atom    := number | "true" | "false" | identifier | "(" or ")"
//! ```
//!
//! Identifiers must belong to the variable set supplied at compile time.
//! Anything outside the grammar (calls, attribute access, subscripts,
//! strings, assignment, collection literals) is rejected while compiling, so
//! nothing outside the grammar is ever evaluated. Expressions are type-checked
//! before evaluation: arithmetic takes numbers, `and`/`or`/`not` take booleans,
//! and the whole expression must be boolean. Comparisons chain like
//! `a < b < c` meaning `a < b and b < c`.

use std::collections::BTreeMap;
use std::fmt;

use crate::domain::error::ExpressionError;

/// Variable bindings for one evaluation.
pub type Variables = BTreeMap<String, f64>;

pub const MAX_DEPTH: usize = 64;
pub const MAX_LENGTH: usize = 4096;

const TRUE_WORDS: [&str; 2] = ["true", "True"];
const FALSE_WORDS: [&str; 2] = ["false", "False"];

const RESERVED_WORDS: [&str; 16] = [
    "lambda", "import", "for", "while", "if", "else", "in", "is", "def", "class", "return",
    "yield", "del", "global", "with", "None",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Bool(bool),
    Variable(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Type {
    Number,
    Bool,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Number => write!(f, "number"),
            Type::Bool => write!(f, "boolean"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Number(f64),
    Bool(bool),
}

/// A compiled, type-checked expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn compile(source: &str, allowed: &[&str]) -> Result<Self, ExpressionError> {
        if source.len() > MAX_LENGTH {
            return Err(ExpressionError::new(
                format!("expression longer than {} bytes", MAX_LENGTH),
                MAX_LENGTH,
            ));
        }
        let mut parser = Parser::new(source, allowed);
        let root = parser.parse()?;
        match type_of(&root)? {
            Type::Bool => Ok(Self {
                source: source.to_string(),
                root,
            }),
            Type::Number => Err(ExpressionError::new(
                "expression must evaluate to a boolean, found number",
                root.position,
            )),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    pub fn evaluate(&self, variables: &Variables) -> Result<bool, ExpressionError> {
        match eval(&self.root, variables)? {
            Value::Bool(b) => Ok(b),
            Value::Number(_) => Err(ExpressionError::new(
                "expression must evaluate to a boolean, found number",
                self.root.position,
            )),
        }
    }
}

/// Compile against the names in `variables` and evaluate once.
pub fn evaluate(expression: &str, variables: &Variables) -> Result<bool, ExpressionError> {
    let allowed: Vec<&str> = variables.keys().map(String::as_str).collect();
    Expression::compile(expression, &allowed)?.evaluate(variables)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
    allowed: &'a [&'a str],
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, allowed: &'a [&'a str]) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            allowed,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek_exact(&self, s: &str) -> bool {
        self.remaining().starts_with(s)
    }

    fn consume_exact(&mut self, s: &str) -> bool {
        if self.peek_exact(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        let remaining = self.remaining();
        remaining.starts_with(keyword)
            && !remaining[keyword.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
    }

    fn consume_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn peek_word(&self) -> String {
        let word: String = self
            .remaining()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if word.is_empty() {
            self.peek()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "end of input".to_string())
        } else {
            word
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::new(message, self.pos)
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("expression nests deeper than {}", MAX_DEPTH)));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();
        if self.peek().is_none() {
            return Err(self.error("expected expression, found end of input"));
        }
        let expr = self.parse_or()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            if self.peek() == Some('=') {
                return Err(self.error("assignment is not allowed"));
            }
            return Err(self.error(format!(
                "unexpected input after expression: '{}'",
                self.remaining()
            )));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let mut left = self.parse_and()?;
        let mut folds = 0;
        loop {
            self.skip_whitespace();
            let position = self.pos;
            if self.consume_keyword("or") || self.consume_exact("||") {
                self.enter()?;
                folds += 1;
                let right = self.parse_and()?;
                left = Expr {
                    kind: ExprKind::Or(Box::new(left), Box::new(right)),
                    position,
                };
            } else {
                break;
            }
        }
        self.depth -= folds;
        self.leave();
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        let mut folds = 0;
        loop {
            self.skip_whitespace();
            let position = self.pos;
            if self.consume_keyword("and") || self.consume_exact("&&") {
                self.enter()?;
                folds += 1;
                let right = self.parse_not()?;
                left = Expr {
                    kind: ExprKind::And(Box::new(left), Box::new(right)),
                    position,
                };
            } else {
                break;
            }
        }
        self.depth -= folds;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();
        let position = self.pos;
        let negated = if self.peek_exact("!") && !self.peek_exact("!=") {
            self.advance();
            true
        } else {
            self.consume_keyword("not")
        };
        if negated {
            self.enter()?;
            let operand = self.parse_not()?;
            self.leave();
            return Ok(Expr {
                kind: ExprKind::Not(Box::new(operand)),
                position,
            });
        }
        self.parse_comparison()
    }

    fn parse_compare_op(&mut self) -> Option<CompareOp> {
        for (symbol, op) in [
            ("<=", CompareOp::Le),
            (">=", CompareOp::Ge),
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Ne),
            ("<", CompareOp::Lt),
            (">", CompareOp::Gt),
        ] {
            if self.consume_exact(symbol) {
                return Some(op);
            }
        }
        None
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();
        let position = self.pos;
        let first = self.parse_sum()?;
        let mut rest = Vec::new();
        loop {
            self.skip_whitespace();
            match self.parse_compare_op() {
                Some(op) => rest.push((op, self.parse_sum()?)),
                None => break,
            }
        }
        if rest.is_empty() {
            return Ok(first);
        }
        Ok(Expr {
            kind: ExprKind::Compare {
                first: Box::new(first),
                rest,
            },
            position,
        })
    }

    fn parse_sum(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        let mut folds = 0;
        loop {
            self.skip_whitespace();
            let position = self.pos;
            let op = match self.peek() {
                Some('+') => ArithOp::Add,
                Some('-') => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            folds += 1;
            let right = self.parse_term()?;
            left = Expr {
                kind: ExprKind::Arith {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                position,
            };
        }
        self.depth -= folds;
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        let mut folds = 0;
        loop {
            self.skip_whitespace();
            let position = self.pos;
            if self.peek_exact("**") {
                break;
            }
            if self.peek_exact("//") {
                return Err(self.error("floor division '//' is not supported"));
            }
            let op = match self.peek() {
                Some('*') => ArithOp::Mul,
                Some('/') => ArithOp::Div,
                Some('%') => ArithOp::Rem,
                _ => break,
            };
            self.advance();
            self.enter()?;
            folds += 1;
            let right = self.parse_unary()?;
            left = Expr {
                kind: ExprKind::Arith {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                position,
            };
        }
        self.depth -= folds;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();
        let position = self.pos;
        match self.peek() {
            Some('-') => {
                self.advance();
                self.enter()?;
                let operand = self.parse_unary()?;
                self.leave();
                Ok(Expr {
                    kind: ExprKind::Neg(Box::new(operand)),
                    position,
                })
            }
            Some('+') => {
                self.advance();
                self.enter()?;
                let operand = self.parse_unary()?;
                self.leave();
                Ok(operand)
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.parse_atom()?;
        self.skip_whitespace();
        let position = self.pos;
        if self.consume_exact("**") {
            self.enter()?;
            let exponent = self.parse_unary()?;
            self.leave();
            return Ok(Expr {
                kind: ExprKind::Arith {
                    op: ArithOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
                position,
            });
        }
        Ok(base)
    }

    fn parse_number(&mut self) -> Result<Expr, ExpressionError> {
        let start = self.pos;
        let mut digits = 0;
        let mut has_dot = false;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if digits == 0 {
            return Err(ExpressionError::new("expected number", start));
        }

        if matches!(self.peek(), Some('e') | Some('E')) {
            let mark = self.pos;
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.advance();
            }
            let exp_digits = self
                .remaining()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .count();
            if exp_digits == 0 {
                self.pos = mark;
            } else {
                self.pos += exp_digits;
            }
        }

        let text = &self.input[start..self.pos];
        let value = text
            .parse::<f64>()
            .map_err(|_| ExpressionError::new(format!("invalid number: {}", text), start))?;
        Ok(Expr {
            kind: ExprKind::Number(value),
            position: start,
        })
    }

    fn parse_identifier(&mut self) -> Result<Expr, ExpressionError> {
        let start = self.pos;
        let word = self.peek_word();

        if TRUE_WORDS.contains(&word.as_str()) || FALSE_WORDS.contains(&word.as_str()) {
            self.pos += word.len();
            return Ok(Expr {
                kind: ExprKind::Bool(TRUE_WORDS.contains(&word.as_str())),
                position: start,
            });
        }
        if matches!(word.as_str(), "and" | "or" | "not") {
            return Err(self.error(format!("expected operand, found '{}'", word)));
        }
        if RESERVED_WORDS.contains(&word.as_str()) {
            return Err(self.error(format!("'{}' is not allowed in expressions", word)));
        }

        self.pos += word.len();
        self.skip_whitespace();
        match self.peek() {
            Some('(') => {
                return Err(ExpressionError::new(
                    format!("function calls are not allowed: '{}(...)'", word),
                    start,
                ));
            }
            Some('.') => {
                return Err(ExpressionError::new(
                    format!("attribute access is not allowed on '{}'", word),
                    start,
                ));
            }
            Some('[') => {
                return Err(ExpressionError::new(
                    format!("subscripts are not allowed on '{}'", word),
                    start,
                ));
            }
            _ => {}
        }

        if !self.allowed.contains(&word.as_str()) {
            return Err(ExpressionError::new(
                format!("unknown identifier '{}'", word),
                start,
            ));
        }

        Ok(Expr {
            kind: ExprKind::Variable(word),
            position: start,
        })
    }

    fn parse_atom(&mut self) -> Result<Expr, ExpressionError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(self.error("expected operand, found end of input")),
            Some(ch) if ch.is_ascii_digit() || ch == '.' => self.parse_number(),
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.parse_identifier(),
            Some('(') => {
                self.advance();
                let inner = self.parse_or()?;
                self.skip_whitespace();
                match self.peek() {
                    Some(')') => {
                        self.advance();
                        Ok(inner)
                    }
                    Some(',') => Err(self.error("tuples are not allowed")),
                    Some(ch) => Err(self.error(format!("expected ')', found '{}'", ch))),
                    None => Err(self.error("expected ')', found end of input")),
                }
            }
            Some('"') | Some('\'') => Err(self.error("string literals are not allowed")),
            Some('[') | Some('{') => Err(self.error("collection literals are not allowed")),
            Some(ch) => Err(self.error(format!("unexpected character '{}'", ch))),
        }
    }
}

fn expect_type(expr: &Expr, expected: Type, context: &str) -> Result<(), ExpressionError> {
    let found = type_of(expr)?;
    if found != expected {
        return Err(ExpressionError::new(
            format!("{} expects a {}, found {}", context, expected, found),
            expr.position,
        ));
    }
    Ok(())
}

fn type_of(expr: &Expr) -> Result<Type, ExpressionError> {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Variable(_) => Ok(Type::Number),
        ExprKind::Bool(_) => Ok(Type::Bool),
        ExprKind::Neg(operand) => {
            expect_type(operand, Type::Number, "unary '-'")?;
            Ok(Type::Number)
        }
        ExprKind::Not(operand) => {
            expect_type(operand, Type::Bool, "'not'")?;
            Ok(Type::Bool)
        }
        ExprKind::Arith { left, right, .. } => {
            expect_type(left, Type::Number, "arithmetic")?;
            expect_type(right, Type::Number, "arithmetic")?;
            Ok(Type::Number)
        }
        ExprKind::Compare { first, rest } => {
            let mut prev = type_of(first)?;
            for (op, operand) in rest {
                let next = type_of(operand)?;
                let ordering = !matches!(op, CompareOp::Eq | CompareOp::Ne);
                if prev != next || (ordering && next == Type::Bool) {
                    return Err(ExpressionError::new(
                        format!("cannot compare {} {} {}", prev, op.symbol(), next),
                        operand.position,
                    ));
                }
                prev = next;
            }
            Ok(Type::Bool)
        }
        ExprKind::And(left, right) => {
            expect_type(left, Type::Bool, "'and'")?;
            expect_type(right, Type::Bool, "'and'")?;
            Ok(Type::Bool)
        }
        ExprKind::Or(left, right) => {
            expect_type(left, Type::Bool, "'or'")?;
            expect_type(right, Type::Bool, "'or'")?;
            Ok(Type::Bool)
        }
    }
}

fn eval_number(expr: &Expr, vars: &Variables) -> Result<f64, ExpressionError> {
    match eval(expr, vars)? {
        Value::Number(n) => Ok(n),
        Value::Bool(_) => Err(ExpressionError::new("expected a number", expr.position)),
    }
}

fn eval_bool(expr: &Expr, vars: &Variables) -> Result<bool, ExpressionError> {
    match eval(expr, vars)? {
        Value::Bool(b) => Ok(b),
        Value::Number(_) => Err(ExpressionError::new("expected a boolean", expr.position)),
    }
}

fn compare(op: CompareOp, left: Value, right: Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match op {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => false,
        },
        _ => false,
    }
}

fn eval(expr: &Expr, vars: &Variables) -> Result<Value, ExpressionError> {
    match &expr.kind {
        ExprKind::Number(n) => Ok(Value::Number(*n)),
        ExprKind::Bool(b) => Ok(Value::Bool(*b)),
        ExprKind::Variable(name) => vars.get(name).map(|v| Value::Number(*v)).ok_or_else(|| {
            ExpressionError::new(format!("unknown identifier '{}'", name), expr.position)
        }),
        ExprKind::Neg(operand) => Ok(Value::Number(-eval_number(operand, vars)?)),
        ExprKind::Not(operand) => Ok(Value::Bool(!eval_bool(operand, vars)?)),
        ExprKind::Arith { op, left, right } => {
            let a = eval_number(left, vars)?;
            let b = eval_number(right, vars)?;
            let value = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div | ArithOp::Rem if b == 0.0 => {
                    return Err(ExpressionError::new("division by zero", expr.position));
                }
                ArithOp::Div => a / b,
                ArithOp::Rem => a - b * (a / b).floor(),
                ArithOp::Pow => a.powf(b),
            };
            Ok(Value::Number(value))
        }
        ExprKind::Compare { first, rest } => {
            let mut left = eval(first, vars)?;
            for (op, operand) in rest {
                let right = eval(operand, vars)?;
                if !compare(*op, left, right) {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        ExprKind::And(left, right) => {
            Ok(Value::Bool(eval_bool(left, vars)? && eval_bool(right, vars)?))
        }
        ExprKind::Or(left, right) => {
            Ok(Value::Bool(eval_bool(left, vars)? || eval_bool(right, vars)?))
        }
    }
}
