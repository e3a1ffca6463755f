//! Precedence-climbing expression parser
//!
//! The parser knows nothing about the values or operators it handles. A
//! [`Grammar`] supplies the tokenizer, the operator table and the callbacks
//! that build values and combine them. Each sub-expression is bounded by the
//! lowest operator precedence it may contain; parenthesized groups restart at
//! the minimum precedence.

use thiserror::Error;

/// Errors produced while parsing an expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unmatched \"(\"")]
    UnmatchedParen,

    #[error("Unexpected operator \"{0}\" found")]
    UnexpectedOperator(String),

    #[error("Unexpected \"{0}\" found")]
    UnexpectedToken(String),

    #[error("Unrecognized input \"{0}\" in expression")]
    InvalidToken(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator {
    pub precedence: u8,
    pub associativity: Associativity,
}

impl Operator {
    pub const fn left(precedence: u8) -> Self {
        Self {
            precedence,
            associativity: Associativity::Left,
        }
    }

    pub const fn right(precedence: u8) -> Self {
        Self {
            precedence,
            associativity: Associativity::Right,
        }
    }
}

/// The pieces of a language handled by [`parse_expression`]
pub trait Grammar {
    type Value;
    type Error: From<ExpressionError>;

    /// Split an expression into raw token strings. `(` and `)` must be
    /// returned as their own tokens.
    fn tokenize<'e>(&self, expr: &'e str) -> Result<Vec<&'e str>, Self::Error>;

    /// Look up an operator symbol
    fn operator(&self, symbol: &str) -> Option<Operator>;

    /// Build a value from a token, with surrounding quotes already removed
    fn value(&mut self, raw: &str) -> Result<Self::Value, Self::Error>;

    /// Combine two sub-expressions with an operator
    fn apply(
        &mut self,
        op: &str,
        lhs: Self::Value,
        rhs: Self::Value,
    ) -> Result<Self::Value, Self::Error>;
}

/// Parse an expression with the given grammar
pub fn parse_expression<G: Grammar>(grammar: &mut G, expr: &str) -> Result<G::Value, G::Error> {
    let tokens = grammar.tokenize(expr)?;
    let mut climber = Climber {
        grammar,
        tokens,
        pos: 0,
    };

    let value = climber.expression(1)?;

    match climber.peek() {
        None => Ok(value),
        Some(tok) => Err(ExpressionError::UnexpectedToken(tok.to_string()).into()),
    }
}

struct Climber<'g, 'e, G> {
    grammar: &'g mut G,
    tokens: Vec<&'e str>,
    pos: usize,
}

impl<'e, G: Grammar> Climber<'_, 'e, G> {
    fn peek(&self) -> Option<&'e str> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn expression(&mut self, min_precedence: u8) -> Result<G::Value, G::Error> {
        let mut lhs = self.atom()?;

        while let Some(token) = self.peek() {
            let Some(op) = self.grammar.operator(token) else {
                break;
            };
            if op.precedence < min_precedence {
                break;
            }

            let symbol = token.to_string();
            let next_min = match op.associativity {
                Associativity::Left => op.precedence + 1,
                Associativity::Right => op.precedence,
            };

            self.advance();
            let rhs = self.expression(next_min)?;
            lhs = self.grammar.apply(&symbol, lhs, rhs)?;
        }

        Ok(lhs)
    }

    fn atom(&mut self) -> Result<G::Value, G::Error> {
        let Some(token) = self.peek() else {
            return Err(ExpressionError::UnexpectedEnd.into());
        };

        match token {
            "(" => {
                self.advance();
                let value = self.expression(1)?;
                if self.peek() != Some(")") {
                    return Err(ExpressionError::UnmatchedParen.into());
                }
                self.advance();
                Ok(value)
            }
            ")" => Err(ExpressionError::UnexpectedToken(token.to_string()).into()),
            _ if self.grammar.operator(token).is_some() => {
                Err(ExpressionError::UnexpectedOperator(token.to_string()).into())
            }
            _ => {
                let raw = strip_quotes(token);
                self.advance();
                self.grammar.value(raw)
            }
        }
    }
}

/// Strip one matching pair of surrounding single or double quotes
pub fn strip_quotes(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
