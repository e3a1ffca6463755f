//! Inline and block functions found in template scalars

use crate::error::TemplateError;
use crate::template::Node;

use super::expression::{parse_expression, strip_quotes};
use super::string::{ConditionGrammar, StringParser};

/// A function call parsed from a `<% Name(params) %>` marker
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    /// `Fn::Base64` of its parameter, or of its block contents when it has none
    Base64(Option<Node>),
    GetAzs(Node),
    Select { index: Node, container: Node },
    ImportValue(Node),
    If { condition: Node },
    Else,
    ElseIf { condition: Node },
    /// Any other function; parameters and block contents form one list
    Generic { name: String, params: Vec<Node> },
}

impl Function {
    /// Parse the parameters of a named function
    pub fn parse(
        name: &str,
        params: Option<&str>,
        parser: &mut StringParser<'_>,
    ) -> Result<Self, TemplateError> {
        let raw = params.unwrap_or("");

        match name {
            "Base64" => Ok(Function::Base64(single_param(name, raw, parser)?)),
            "GetAZs" => Ok(Function::GetAzs(
                single_param(name, raw, parser)?.unwrap_or_else(|| Node::str("")),
            )),
            "Select" => parse_select(raw, parser),
            "ImportValue" => {
                let mut values = parse_params(raw, parser)?;
                match (values.pop(), values.is_empty()) {
                    (Some(value), true) => Ok(Function::ImportValue(value)),
                    _ => Err(TemplateError::syntax(
                        "ImportValue takes exactly one parameter",
                        "",
                    )),
                }
            }
            "If" => Ok(Function::If {
                condition: parse_condition(raw, parser)?,
            }),
            "ElseIf" => Ok(Function::ElseIf {
                condition: parse_condition(raw, parser)?,
            }),
            "Else" => Ok(Function::Else),
            _ => Ok(Function::Generic {
                name: name.to_string(),
                params: parse_params(raw, parser)?,
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Function::Base64(_) => "Base64",
            Function::GetAzs(_) => "GetAZs",
            Function::Select { .. } => "Select",
            Function::ImportValue(_) => "ImportValue",
            Function::If { .. } => "If",
            Function::Else => "Else",
            Function::ElseIf { .. } => "ElseIf",
            Function::Generic { name, .. } => name,
        }
    }
}

/// Split a parameter list on commas outside quotes, brackets and parentheses
pub fn split_params(raw: &str) -> Vec<&str> {
    if raw.trim().is_empty() {
        return Vec::new();
    }

    let mut values = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                values.push(raw[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    values.push(raw[start..].trim());

    values
}

fn parse_params(raw: &str, parser: &mut StringParser<'_>) -> Result<Vec<Node>, TemplateError> {
    split_params(raw)
        .into_iter()
        .map(|value| parser.parse_fragment(strip_quotes(value)))
        .collect()
}

fn single_param(
    name: &str,
    raw: &str,
    parser: &mut StringParser<'_>,
) -> Result<Option<Node>, TemplateError> {
    let mut values = parse_params(raw, parser)?;
    if values.len() > 1 {
        return Err(TemplateError::syntax(
            format!("Too many parameters passed to {}", name),
            "",
        ));
    }
    Ok(values.pop())
}

fn parse_condition(raw: &str, parser: &mut StringParser<'_>) -> Result<Node, TemplateError> {
    let mut grammar = ConditionGrammar::new(parser);
    parse_expression(&mut grammar, raw)
}

/// `index, [items...]`, `index, @@Reference` or `index, Func(...)`
fn parse_select(raw: &str, parser: &mut StringParser<'_>) -> Result<Function, TemplateError> {
    let invalid = || {
        TemplateError::syntax(
            format!("Cannot parse parameters to Select function: \"{}\"", raw),
            "",
        )
    };

    let (index, rest) = raw.split_once(',').ok_or_else(invalid)?;
    let index = index.trim();
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let rest = rest.trim();

    let container = if let Some(array) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let items = parse_params(array, parser)?;
        if items.is_empty() {
            return Err(invalid());
        }
        Node::uncollapsible(items)
    } else if rest.starts_with("@@") {
        match parser.parse_fragment(rest)? {
            node @ Node::Map(_) => node,
            _ => return Err(invalid()),
        }
    } else if is_call(rest) {
        parser.parse_fragment(&format!("<% {} %>", rest))?
    } else {
        return Err(invalid());
    };

    Ok(Function::Select {
        index: Node::str(index),
        container,
    })
}

/// `Name(...)`, as allowed for the container of a `Select`
fn is_call(s: &str) -> bool {
    match s.split_once('(') {
        Some((name, _)) => name.chars().all(|c| c.is_ascii_alphabetic()) && s.ends_with(')'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_params() {
        assert_eq!(split_params(""), Vec::<&str>::new());
        assert_eq!(split_params("a, b,c"), vec!["a", "b", "c"]);
        assert_eq!(
            split_params(r#""x, y", [1, 2], f(a, b)"#),
            vec![r#""x, y""#, "[1, 2]", "f(a, b)"]
        );
        assert_eq!(split_params("'it''s', b"), vec!["'it''s'", "b"]);
    }

    #[test]
    fn test_is_call() {
        assert!(is_call("GetAZs(\"\")"));
        assert!(!is_call("@@Foo"));
        assert!(!is_call("Get-AZs()"));
    }
}
