//! Boolean guard expressions attached to routing policies.
//!
//! ```text
//! expr       := or
//! or         := and ( ("||" | "or") and )*
//! and        := unary ( ("&&" | "and") unary )*
//! unary      := ("!" | "not") unary | primary
//! primary    := "(" expr ")" | "true" | "false" | comparison
//! comparison := ("complexity" | "budget") CMP number
//!             | ("domain" | "prompt") ("==" | "!=" | "contains") string
//! CMP        := "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! Keywords and string comparisons are case-insensitive. An absent domain
//! compares unequal to every string.

use std::fmt;

use crate::error::ConfigError;

/// The request facts a condition can inspect.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    pub complexity: f64,
    pub budget: f64,
    pub domain: Option<&'a str>,
    pub prompt: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    Complexity,
    Budget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Domain,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
            CmpOp::Ne => (lhs - rhs).abs() >= f64::EPSILON,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Eq,
    Ne,
    Contains,
}

/// Parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Const(bool),
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Numeric {
        field: NumericField,
        op: CmpOp,
        value: f64,
    },
    Text {
        field: TextField,
        op: TextOp,
        value: String,
    },
}

impl Condition {
    /// Parse an expression, rejecting anything outside the grammar.
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCondition {
            expression: expression.to_string(),
            reason,
        };

        let tokens = tokenize(expression).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.parse_or().map_err(invalid)?;
        if let Some(tok) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {tok}")));
        }
        Ok(condition)
    }

    /// Condition that always matches, used for catch-all policies.
    pub fn always() -> Self {
        Condition::Const(true)
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Condition::Const(true))
    }

    pub fn evaluate(&self, input: &PolicyInput<'_>) -> bool {
        match self {
            Condition::Const(b) => *b,
            Condition::Not(inner) => !inner.evaluate(input),
            Condition::All(parts) => parts.iter().all(|c| c.evaluate(input)),
            Condition::Any(parts) => parts.iter().any(|c| c.evaluate(input)),
            Condition::Numeric { field, op, value } => {
                let lhs = match field {
                    NumericField::Complexity => input.complexity,
                    NumericField::Budget => input.budget,
                };
                op.apply(lhs, *value)
            }
            Condition::Text { field, op, value } => {
                let lhs = match field {
                    TextField::Domain => input.domain,
                    TextField::Prompt => Some(input.prompt),
                };
                match (op, lhs) {
                    (TextOp::Eq, Some(lhs)) => lhs.eq_ignore_ascii_case(value),
                    (TextOp::Ne, Some(lhs)) => !lhs.eq_ignore_ascii_case(value),
                    (TextOp::Contains, Some(lhs)) => {
                        lhs.to_lowercase().contains(&value.to_lowercase())
                    }
                    (TextOp::Ne, None) => true,
                    (TextOp::Eq | TextOp::Contains, None) => false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    Contains,
    Ident(String),
    Number(f64),
    Str(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::Not => write!(f, "'!'"),
            Token::Cmp(op) => write!(f, "comparison {op:?}"),
            Token::Contains => write!(f, "'contains'"),
            Token::Ident(s) => write!(f, "identifier '{s}'"),
            Token::Number(n) => write!(f, "number {n}"),
            Token::Str(s) => write!(f, "string \"{s}\""),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|off| start + off)
                    .ok_or_else(|| format!("unterminated string starting at offset {i}"))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && next.is_some_and(|n| n.is_ascii_digit() || n == '.')) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect::<String>().to_lowercase();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Contains,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}' at offset {i}")),
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

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut parts = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::Any(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut parts = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Condition::All(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(tok) => Err(format!("expected ')', found {tok}")),
                    None => Err("expected ')', found end of expression".to_string()),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Condition::Const(true)),
                "false" => Ok(Condition::Const(false)),
                "complexity" => self.parse_numeric(NumericField::Complexity),
                "budget" => self.parse_numeric(NumericField::Budget),
                "domain" => self.parse_text(TextField::Domain),
                "prompt" => self.parse_text(TextField::Prompt),
                other => Err(format!(
                    "unknown identifier '{other}', expected complexity, budget, domain or prompt"
                )),
            },
            Some(tok) => Err(format!("unexpected {tok}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_numeric(&mut self, field: NumericField) -> Result<Condition, String> {
        let op = match self.advance() {
            Some(Token::Cmp(op)) => op,
            Some(tok) => return Err(format!("expected comparison after {field:?}, found {tok}")),
            None => return Err(format!("expected comparison after {field:?}")),
        };
        match self.advance() {
            Some(Token::Number(value)) => Ok(Condition::Numeric { field, op, value }),
            Some(tok) => Err(format!("expected number, found {tok}")),
            None => Err("expected number, found end of expression".to_string()),
        }
    }

    fn parse_text(&mut self, field: TextField) -> Result<Condition, String> {
        let op = match self.advance() {
            Some(Token::Cmp(CmpOp::Eq)) => TextOp::Eq,
            Some(Token::Cmp(CmpOp::Ne)) => TextOp::Ne,
            Some(Token::Contains) => TextOp::Contains,
            Some(tok) => {
                return Err(format!(
                    "expected '==', '!=' or 'contains' after {field:?}, found {tok}"
                ));
            }
            None => return Err(format!("expected operator after {field:?}")),
        };
        match self.advance() {
            Some(Token::Str(value)) => Ok(Condition::Text { field, op, value }),
            Some(tok) => Err(format!("expected quoted string, found {tok}")),
            None => Err("expected quoted string, found end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(complexity: f64, budget: f64, domain: Option<&'a str>) -> PolicyInput<'a> {
        PolicyInput {
            complexity,
            budget,
            domain,
            prompt: "Summarize the Clinical Trial results",
        }
    }

    fn eval(expr: &str, input: &PolicyInput<'_>) -> bool {
        Condition::parse(expr).unwrap().evaluate(input)
    }

    #[test]
    fn domain_equality_is_case_insensitive() {
        let i = input(0.2, 1.0, Some("Safety_Critical"));
        assert!(eval(r#"domain == "safety_critical""#, &i));
        assert!(!eval(r#"domain != "SAFETY_CRITICAL""#, &i));
    }

    #[test]
    fn missing_domain_never_equals() {
        let i = input(0.2, 1.0, None);
        assert!(!eval(r#"domain == "medical""#, &i));
        assert!(eval(r#"domain != "medical""#, &i));
        assert!(!eval(r#"domain contains "med""#, &i));
    }

    #[test]
    fn numeric_comparisons() {
        let i = input(0.85, 0.05, None);
        assert!(eval("complexity >= 0.8", &i));
        assert!(!eval("complexity < 0.8", &i));
        assert!(eval("budget < .1", &i));
        assert!(eval("budget > -1", &i));
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let i = input(0.1, 1.0, Some("legal"));
        // true || (false && false)
        assert!(eval(r#"domain == "legal" || complexity > 0.5 && budget < 0.5"#, &i));
        // (true || false) && false
        assert!(!eval(r#"(domain == "legal" || complexity > 0.5) && budget < 0.5"#, &i));
    }

    #[test]
    fn negation_and_word_operators() {
        let i = input(0.9, 1.0, Some("medical"));
        assert!(eval(r#"not domain == "legal" and complexity > 0.5"#, &i));
        assert!(!eval(r#"!(complexity > 0.5)"#, &i));
        assert!(eval("TRUE OR false", &i));
    }

    #[test]
    fn prompt_contains() {
        let i = input(0.5, 1.0, None);
        assert!(eval(r#"prompt contains 'clinical trial'"#, &i));
        assert!(!eval(r#"prompt contains "oncology""#, &i));
    }

    #[test]
    fn always_is_detected() {
        assert!(Condition::parse("true").unwrap().is_always());
        assert!(Condition::always().is_always());
        assert!(!Condition::parse("complexity > 0").unwrap().is_always());
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "   ",
            "complexity",
            "complexity >",
            "complexity > \"high\"",
            "domain > \"x\"",
            "temperature > 1",
            "(complexity > 0.5",
            "complexity > 0.5)",
            "domain == \"unterminated",
            "budget = 1",
            "complexity > 1.2.3",
        ] {
            let err = Condition::parse(bad).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidCondition { .. }),
                "{bad:?} gave {err:?}"
            );
        }
    }
}
