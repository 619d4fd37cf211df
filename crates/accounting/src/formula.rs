//! Amount formulas for template legs and determinations.
//!
//! A formula is a tiny arithmetic language: decimal literals, the named
//! transaction variables, `+ - * /`, unary minus and parentheses. Formulas
//! are parsed once when configuration is loaded; evaluation is exact decimal
//! arithmetic truncated to the minor unit.

use core::fmt;
use core::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{PostingError, PostingResult};

/// Named inputs a formula may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variable {
    Amount,
    Principal,
    Fee,
    Tax,
    Interest,
}

impl Variable {
    pub const ALL: [Variable; 5] = [
        Variable::Amount,
        Variable::Principal,
        Variable::Fee,
        Variable::Tax,
        Variable::Interest,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Variable::Amount => "amount",
            Variable::Principal => "principal",
            Variable::Fee => "fee",
            Variable::Tax => "tax",
            Variable::Interest => "interest",
        }
    }

    fn lookup(name: &str) -> Option<Variable> {
        Self::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(name))
    }
}

/// Transaction input values, all in minor units.
///
/// `amount` is always present; the component values are optional and a
/// formula referencing a missing one fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variables {
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interest: Option<i64>,
}

impl Variables {
    pub fn with_amount(amount: i64) -> Self {
        Self {
            amount,
            ..Self::default()
        }
    }

    pub fn get(&self, var: Variable) -> Option<i64> {
        match var {
            Variable::Amount => Some(self.amount),
            Variable::Principal => self.principal,
            Variable::Fee => self.fee,
            Variable::Tax => self.tax,
            Variable::Interest => self.interest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Number(Decimal),
    Var(Variable),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// A parsed amount formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl PartialEq for Formula {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for Formula {}

impl Formula {
    pub fn parse(source: &str) -> PostingResult<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(PostingError::formula(
                source,
                format!("unexpected trailing input at token {}", parser.pos + 1),
            ));
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Exact decimal value of the formula.
    pub fn evaluate_decimal(&self, vars: &Variables) -> PostingResult<Decimal> {
        eval(&self.expr, vars).map_err(|reason| PostingError::formula(&self.source, reason))
    }

    /// Value in minor units, truncated toward zero. Negative results fail.
    pub fn evaluate(&self, vars: &Variables) -> PostingResult<i64> {
        let value = self.evaluate_decimal(vars)?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(PostingError::formula(
                &self.source,
                format!("negative result {value}"),
            ));
        }
        value
            .trunc()
            .to_i64()
            .ok_or_else(|| PostingError::formula(&self.source, "result out of range"))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Formula {
    type Err = PostingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Formula {
    type Error = PostingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Formula> for String {
    fn from(value: Formula) -> Self {
        value.source
    }
}

fn eval(expr: &Expr, vars: &Variables) -> Result<Decimal, String> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(v) => vars
            .get(*v)
            .map(Decimal::from)
            .ok_or_else(|| format!("variable {} not supplied", v.name())),
        Expr::Neg(inner) => Ok(-eval(inner, vars)?),
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, vars)?;
            let r = eval(rhs, vars)?;
            match op {
                BinOp::Add => l.checked_add(r).ok_or_else(|| "overflow".to_string()),
                BinOp::Sub => l.checked_sub(r).ok_or_else(|| "overflow".to_string()),
                BinOp::Mul => l.checked_mul(r).ok_or_else(|| "overflow".to_string()),
                BinOp::Div => {
                    if r.is_zero() {
                        return Err("division by zero".to_string());
                    }
                    l.checked_div(r).ok_or_else(|| "overflow".to_string())
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> PostingResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(idx, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' | '(' | ')' => {
                chars.next();
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    _ => Token::RParen,
                });
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = idx;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &source[idx..end];
                let n = Decimal::from_str(literal).map_err(|e| {
                    PostingError::formula(source, format!("bad number {literal:?}: {e}"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = idx;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(source[idx..end].to_string()));
            }
            other => {
                return Err(PostingError::formula(
                    source,
                    format!("unexpected character {other:?} at offset {idx}"),
                ));
            }
        }
    }

    if tokens.is_empty() {
        return Err(PostingError::formula(source, "empty formula"));
    }
    if tokens.len() > MAX_TOKENS {
        return Err(PostingError::formula(
            source,
            format!("longer than {MAX_TOKENS} tokens"),
        ));
    }
    Ok(tokens)
}

/// Upper bounds on configured formulas; both keep parsing and evaluation
/// recursion shallow.
const MAX_TOKENS: usize = 256;
const MAX_NESTING: usize = 32;

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn error(&self, reason: impl Into<String>) -> PostingError {
        PostingError::formula(self.source, reason)
    }

    /// Parse one nested factor or parenthesised expression.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> PostingResult<T>) -> PostingResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nested deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> PostingResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self) -> PostingResult<Expr> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    // factor := NUMBER | IDENT | '-' factor | '(' expr ')'
    fn factor(&mut self) -> PostingResult<Expr> {
        match self.next().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => Variable::lookup(&name)
                .map(Expr::Var)
                .ok_or_else(|| self.error(format!("unknown variable {name:?}"))),
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.nested(Self::factor)?))),
            Some(Token::LParen) => {
                let inner = self.nested(Self::expr)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            Some(other) => Err(self.error(format!("unexpected token {other:?}"))),
            None => Err(self.error("unexpected end of formula")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        Variables {
            amount: 10_000,
            principal: Some(9_000),
            fee: Some(800),
            tax: Some(200),
            interest: None,
        }
    }

    #[test]
    fn precedence_and_parentheses() {
        let f = Formula::parse("principal + fee * 2").unwrap();
        assert_eq!(f.evaluate(&vars()).unwrap(), 10_600);

        let f = Formula::parse("(principal + fee) * 2").unwrap();
        assert_eq!(f.evaluate(&vars()).unwrap(), 19_600);
    }

    #[test]
    fn decimal_results_truncate_to_minor_unit() {
        let f = Formula::parse("amount * 0.015").unwrap();
        assert_eq!(f.evaluate(&Variables::with_amount(12_345)).unwrap(), 185);

        let f = Formula::parse("amount / 3").unwrap();
        assert_eq!(f.evaluate(&Variables::with_amount(100)).unwrap(), 33);
    }

    #[test]
    fn unknown_variable_is_rejected_at_parse_time() {
        let err = Formula::parse("principal + penalty").unwrap_err();
        match err {
            PostingError::FormulaEvaluation { reason, .. } => assert!(reason.contains("penalty")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_fails_evaluation() {
        let f = Formula::parse("amount / (fee - 800)").unwrap();
        let err = f.evaluate(&vars()).unwrap_err();
        assert!(matches!(err, PostingError::FormulaEvaluation { ref reason, .. } if reason == "division by zero"));
    }

    #[test]
    fn missing_variable_and_negative_results_fail() {
        let f = Formula::parse("interest").unwrap();
        assert!(f.evaluate(&vars()).is_err());

        let f = Formula::parse("fee - principal").unwrap();
        assert!(f.evaluate(&vars()).is_err());
    }

    #[test]
    fn malformed_input_is_rejected() {
        for bad in ["", "amount +", "(amount", "amount fee", "amount % 2", "1..2"] {
            assert!(Formula::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn unary_minus() {
        let f = Formula::parse("-fee + principal - -tax").unwrap();
        assert_eq!(f.evaluate(&vars()).unwrap(), 8_400);
    }

    #[test]
    fn deep_nesting_is_a_parse_error() {
        let parens = format!("{}amount{}", "(".repeat(100), ")".repeat(100));
        let err = Formula::parse(&parens).unwrap_err();
        assert!(matches!(err, PostingError::FormulaEvaluation { ref reason, .. } if reason.contains("nested")));

        let negations = format!("{}amount", "-".repeat(100));
        assert!(Formula::parse(&negations).is_err());

        let long = vec!["amount"; 200].join(" + ");
        assert!(Formula::parse(&long).is_err());

        let shallow = format!("{}amount{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(Formula::parse(&shallow).unwrap().evaluate(&vars()).unwrap(), 10_000);
    }

    #[test]
    fn serde_goes_through_the_parser() {
        let f: Formula = serde_json::from_str("\"PRINCIPAL * 1\"").unwrap();
        assert_eq!(f.evaluate(&vars()).unwrap(), 9_000);
        assert!(serde_json::from_str::<Formula>("\"bogus\"").is_err());
        assert_eq!(serde_json::to_string(&f).unwrap(), "\"PRINCIPAL * 1\"");
    }
}
