//! Parsers for the shorthand embedded in template scalars

pub mod expression;
pub mod function;
pub mod lexer;
pub mod string;

pub use expression::{parse_expression, Associativity, ExpressionError, Grammar, Operator};
pub use function::Function;
pub use string::{StringParser, BASE64_SENTINEL};
