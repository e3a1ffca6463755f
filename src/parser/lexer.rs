//! Lexers for template scalars and condition expressions using logos

use logos::Logos;

/// Byte range in source text
pub type Span = std::ops::Range<usize>;

/// Tokens found in one line of a template scalar
#[derive(Logos, Debug, Clone, PartialEq)]
pub enum LineToken<'s> {
    /// A `<% ... %>` marker, including a directly following newline
    #[regex(r"<%([^%]|%[^>])*%>\n?", |lex| lex.slice())]
    Marker(&'s str),

    /// `@@Name`, `@@{Name}`, `@@$$var` or `@@{$$a.b}`, without sigil and braces
    #[regex(
        r"@@(\{\$\$[A-Za-z0-9:_.]+\}|\{[A-Za-z0-9:_]+\}|\$\$[A-Za-z0-9:_]+|[A-Za-z0-9:_]+)",
        strip_sigil
    )]
    Reference(&'s str),

    /// `$$name` or `$${dotted.path}`, without sigil and braces
    #[regex(r"\$\$([A-Za-z0-9_]+|\{[A-Za-z0-9_.]+\})", strip_sigil)]
    Variable(&'s str),

    #[regex(r"[^<@$]+", |lex| lex.slice())]
    #[regex(r"[<@$]", |lex| lex.slice())]
    Text(&'s str),
}

/// Tokens of an `If`/`ElseIf` condition
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum ConditionToken {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("||")]
    Or,
    #[token("&&")]
    And,
    #[token("==")]
    Equal,
    #[token("!=")]
    NotEqual,

    #[regex(r#""[^"]*""#)]
    #[regex(r"'[^']*'")]
    Quoted,

    #[regex(r"[A-Za-z0-9_]+")]
    Word,

    #[regex(r"@@(\{\$\$[A-Za-z0-9:_.]+\}|\{[A-Za-z0-9:_]+\}|\$\$[A-Za-z0-9:_]+|[A-Za-z0-9:_]+)")]
    Reference,

    #[regex(r"\$\$([A-Za-z0-9_]+|\{[A-Za-z0-9_.]+\})")]
    Variable,
}

/// A classified `<% ... %>` marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker<'s> {
    /// `<% } %>`
    Close,
    /// `<% Name(params) %>` or, when `open` is set, `<% Name(params) { %>`
    Function {
        name: &'s str,
        params: Option<&'s str>,
        open: bool,
    },
}

impl<'s> Marker<'s> {
    /// Classify the raw text of a marker token.
    ///
    /// Returns `None` when the text is not a well-formed function or close
    /// marker; such text is kept as a literal.
    pub fn parse(raw: &'s str) -> Option<Self> {
        let inner = raw.strip_suffix('\n').unwrap_or(raw);
        let inner = inner.strip_prefix("<%")?.strip_suffix("%>")?.trim();

        if inner == "}" {
            return Some(Marker::Close);
        }

        let name_len = inner
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphanumeric())
            .map(|(i, _)| i)
            .unwrap_or(inner.len());
        let name = &inner[..name_len];
        let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
        if name.len() < 2 || !starts_with_letter {
            return None;
        }

        let mut rest = inner[name_len..].trim_start();
        let mut params = None;
        if rest.starts_with('(') {
            let close = rest.rfind(')')?;
            params = Some(&rest[1..close]);
            rest = rest[close + 1..].trim();
        }

        match rest {
            "" => Some(Marker::Function {
                name,
                params,
                open: false,
            }),
            "{" => Some(Marker::Function {
                name,
                params,
                open: true,
            }),
            _ => None,
        }
    }
}

/// Drop a two-character sigil and any surrounding braces
fn strip_sigil<'s>(lex: &mut logos::Lexer<'s, LineToken<'s>>) -> &'s str {
    let slice = lex.slice();
    unbrace(&slice[2..])
}

fn unbrace(s: &str) -> &str {
    s.strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(s)
}

/// Lex one scalar line into tokens with spans
pub fn lex_line(input: &str) -> impl Iterator<Item = (LineToken<'_>, Span)> + '_ {
    LineToken::lexer(input)
        .spanned()
        .filter_map(|(tok, span)| tok.ok().map(|t| (t, span)))
}

/// Lex a condition expression, reporting the first unrecognized input
pub fn lex_condition(input: &str) -> Result<Vec<(ConditionToken, &str)>, Span> {
    let mut lexer = ConditionToken::lexer(input);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next() {
        match tok {
            Ok(tok) => tokens.push((tok, lexer.slice())),
            Err(()) => return Err(lexer.span()),
        }
    }
    Ok(tokens)
}
