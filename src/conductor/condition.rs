//! Edge-condition expression language.
//!
//! A small, side-effect-free language over the run context: literals, field
//! access (`context.foo`), comparisons, boolean operators, and `in`
//! membership. No function calls, no external references. Parse errors are
//! fatal at workflow load; evaluation errors (missing key, type mismatch)
//! default the edge to false.

use serde_json::Value;

use crate::error::{ApiaryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `context.a.b` — path segments after `context`.
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

/// Raised during evaluation only; the conductor maps it to edge = false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError(pub String);

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "condition evaluation failed: {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(String),
    LParen,
    RParen,
    Dot,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    value.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ApiaryError::ConditionParse(format!(
                        "unterminated string starting with {}",
                        quote
                    )));
                }
                i += 1;
                tokens.push(Token::Str(value));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let mut op = String::from(c);
                if i + 1 < chars.len() {
                    let next = chars[i + 1];
                    let pair = format!("{}{}", c, next);
                    if matches!(pair.as_str(), "==" | "!=" | "<=" | ">=" | "&&" | "||") {
                        op = pair;
                        i += 1;
                    }
                }
                i += 1;
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::from(c);
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    number.push(chars[i]);
                    i += 1;
                }
                let parsed: f64 = number.parse().map_err(|_| {
                    ApiaryError::ConditionParse(format!("bad number literal {:?}", number))
                })?;
                tokens.push(Token::Num(parsed));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    ident.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ApiaryError::ConditionParse(format!(
                    "unexpected character {:?}",
                    other
                )));
            }
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
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_op(&mut self, op: &str) -> bool {
        if self.peek() == Some(&Token::Op(op.to_string())) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.expect_op("||") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.expect_op("&&") {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.expect_op("!") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => match op.as_str() {
                "==" => Some(CmpOp::Eq),
                "!=" => Some(CmpOp::Ne),
                "<" => Some(CmpOp::Lt),
                "<=" => Some(CmpOp::Le),
                ">" => Some(CmpOp::Gt),
                ">=" => Some(CmpOp::Ge),
                _ => None,
            },
            Some(Token::Ident(word)) if word == "in" => {
                self.pos += 1;
                let right = self.parse_term()?;
                return Ok(Expr::In(Box::new(left), Box::new(right)));
            }
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.parse_term()?;
            return Ok(Expr::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ApiaryError::ConditionParse("expected ')'".into())),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(serde_json::json!(n))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "context" => {
                    let mut path = Vec::new();
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        match self.next() {
                            Some(Token::Ident(field)) => path.push(field),
                            _ => {
                                return Err(ApiaryError::ConditionParse(
                                    "expected field name after '.'".into(),
                                ));
                            }
                        }
                    }
                    Ok(Expr::Path(path))
                }
                other => Err(ApiaryError::ConditionParse(format!(
                    "unknown identifier {:?}; only 'context' references are allowed",
                    other
                ))),
            },
            other => Err(ApiaryError::ConditionParse(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

/// Parse a condition. Empty or whitespace-only conditions mean "always".
pub fn parse(input: &str) -> Result<Expr> {
    if input.trim().is_empty() {
        return Ok(Expr::Literal(Value::Bool(true)));
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ApiaryError::ConditionParse(format!(
            "trailing tokens after expression in {:?}",
            input
        )));
    }
    Ok(expr)
}

fn lookup<'a>(context: &'a Value, path: &[String]) -> std::result::Result<&'a Value, EvalError> {
    let mut current = context;
    for segment in path {
        current = current
            .get(segment)
            .ok_or_else(|| EvalError(format!("missing key '{}'", segment)))?;
    }
    Ok(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval_value(expr: &Expr, context: &Value) -> std::result::Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => lookup(context, path).cloned(),
        other => evaluate(other, context).map(Value::Bool),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> std::result::Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        ordered => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EvalError(format!(
                        "ordering comparison requires numbers, got {} and {}",
                        left, right
                    )));
                }
            };
            Ok(match ordered {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    // Numeric equality ignores integer/float representation.
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

/// Evaluate a parsed condition against the run context.
pub fn evaluate(expr: &Expr, context: &Value) -> std::result::Result<bool, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(truthy(value)),
        Expr::Path(path) => Ok(truthy(lookup(context, path)?)),
        Expr::Not(inner) => Ok(!evaluate(inner, context)?),
        Expr::And(left, right) => Ok(evaluate(left, context)? && evaluate(right, context)?),
        Expr::Or(left, right) => Ok(evaluate(left, context)? || evaluate(right, context)?),
        Expr::Cmp(left, op, right) => {
            let left = eval_value(left, context)?;
            let right = eval_value(right, context)?;
            compare(&left, *op, &right)
        }
        Expr::In(needle, haystack) => {
            let needle = eval_value(needle, context)?;
            let haystack = eval_value(haystack, context)?;
            match &haystack {
                Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, &needle))),
                Value::String(s) => match &needle {
                    Value::String(sub) => Ok(s.contains(sub.as_str())),
                    other => Err(EvalError(format!(
                        "cannot search string for non-string {}",
                        other
                    ))),
                },
                Value::Object(map) => match &needle {
                    Value::String(key) => Ok(map.contains_key(key)),
                    other => Err(EvalError(format!(
                        "cannot test object membership with {}",
                        other
                    ))),
                },
                other => Err(EvalError(format!("'in' not supported on {}", other))),
            }
        }
    }
}

/// Convenience: parse and evaluate in one step.
pub fn check(condition: &str, context: &Value) -> Result<bool> {
    let expr = parse(condition)?;
    Ok(evaluate(&expr, context).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "phase": "review",
            "score": 7,
            "approved": true,
            "tags": ["fast", "safe"],
            "nested": {"depth": 2},
        })
    }

    #[test]
    fn test_empty_condition_always_fires() {
        assert!(check("", &ctx()).unwrap());
        assert!(check("   ", &ctx()).unwrap());
    }

    #[test]
    fn test_equality_and_ordering() {
        assert!(check("context.phase == 'review'", &ctx()).unwrap());
        assert!(check("context.phase != 'done'", &ctx()).unwrap());
        assert!(check("context.score >= 7", &ctx()).unwrap());
        assert!(check("context.score < 10", &ctx()).unwrap());
        assert!(!check("context.score > 7", &ctx()).unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        assert!(check("context.approved && context.score > 5", &ctx()).unwrap());
        assert!(check("context.score > 100 || context.approved", &ctx()).unwrap());
        assert!(check("!(context.score > 100)", &ctx()).unwrap());
    }

    #[test]
    fn test_membership() {
        assert!(check("'fast' in context.tags", &ctx()).unwrap());
        assert!(!check("'slow' in context.tags", &ctx()).unwrap());
        assert!(check("'rev' in context.phase", &ctx()).unwrap());
        assert!(check("'depth' in context.nested", &ctx()).unwrap());
    }

    #[test]
    fn test_nested_path() {
        assert!(check("context.nested.depth == 2", &ctx()).unwrap());
    }

    #[test]
    fn test_missing_key_defaults_false() {
        // Evaluation error, not a parse error: the edge just does not fire.
        assert!(!check("context.absent == 1", &ctx()).unwrap());
        assert!(!check("context.absent", &ctx()).unwrap());
    }

    #[test]
    fn test_type_mismatch_defaults_false() {
        assert!(!check("context.phase > 3", &ctx()).unwrap());
    }

    #[test]
    fn test_parse_errors_are_fatal() {
        assert!(parse("context.phase ==").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("context.phase == 'x' garbage").is_err());
        assert!(parse("exec('rm')").is_err());
        assert!(parse("foo == 1").is_err());
    }

    #[test]
    fn test_bare_literals() {
        assert!(check("true", &ctx()).unwrap());
        assert!(!check("false", &ctx()).unwrap());
        assert!(!check("null", &ctx()).unwrap());
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        let context = json!({"count": 3});
        assert!(check("context.count == 3.0", &context).unwrap());
    }
}
