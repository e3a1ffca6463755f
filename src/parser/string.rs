//! Lowering of template scalars into function trees
//!
//! A scalar is lexed line by line. Block functions (`<% If(a) { %>` ...
//! `<% } %>`) open frames in an arena; the stack of open frames decides where
//! each literal, reference, variable or nested function lands. Once every
//! line is consumed the root frame is serialized into a [`Node`].

use crate::error::TemplateError;
use crate::template::{ListKind, Node, ProcessOptions, TemplateState};

use super::expression::{ExpressionError, Grammar, Operator};
use super::function::Function;
use super::lexer::{lex_condition, lex_line, LineToken, Marker};

/// First line of a scalar whose result is wrapped in `Fn::Base64`
pub const BASE64_SENTINEL: &str = "__base64__";

type FrameId = usize;

const ROOT: FrameId = 0;

#[derive(Debug)]
enum Item {
    Node(Node),
    Frame(FrameId),
}

/// One function (or the root of the scalar) and the content it has collected
#[derive(Debug, Default)]
struct Frame {
    func: Option<Function>,
    true_branch: Vec<Item>,
    false_branch: Vec<Item>,
    in_false: bool,
    has_else: bool,
    /// Frames removed from the stack by this frame's close marker
    pop_count: usize,
}

impl Frame {
    fn new(func: Option<Function>, pop_count: usize) -> Self {
        Self {
            func,
            pop_count,
            ..Self::default()
        }
    }

    fn push(&mut self, item: Item) {
        if self.in_false {
            self.false_branch.push(item);
        } else {
            self.true_branch.push(item);
        }
    }

    fn is_if(&self) -> bool {
        matches!(self.func, Some(Function::If { .. }))
    }
}

#[derive(Debug)]
struct Arena {
    frames: Vec<Frame>,
    stack: Vec<FrameId>,
}

impl Arena {
    fn new() -> Self {
        Self {
            frames: vec![Frame::new(None, 1)],
            stack: vec![ROOT],
        }
    }

    fn current(&self) -> FrameId {
        self.stack.last().copied().unwrap_or(ROOT)
    }

    fn add(&mut self, item: Item) {
        let id = self.current();
        self.frames[id].push(item);
    }

    fn alloc(&mut self, frame: Frame) -> FrameId {
        self.frames.push(frame);
        self.frames.len() - 1
    }
}

/// Parses scalars against the variables of a [`TemplateState`]
pub struct StringParser<'s> {
    state: &'s mut TemplateState,
}

impl<'s> StringParser<'s> {
    pub fn new(state: &'s mut TemplateState) -> Self {
        Self { state }
    }

    /// Parse a whole scalar, one item per line
    pub fn parse(&mut self, s: &str) -> Result<Node, TemplateError> {
        if s.is_empty() {
            return Ok(Node::str(""));
        }

        let mut lines = s.split_inclusive('\n').peekable();
        let base64 = lines
            .peek()
            .is_some_and(|first| first.trim() == BASE64_SENTINEL);
        if base64 {
            lines.next();
        }

        let mut arena = Arena::new();
        for line in lines {
            self.parse_line(line, &mut arena)
                .map_err(|err| err.with_code(line))?;
        }

        if arena.stack.len() > 1 {
            return Err(TemplateError::syntax("Unbalanced braces in template", s));
        }

        let result = self.serialize_root(arena)?;
        Ok(if base64 { Node::base64(result) } else { result })
    }

    /// Parse a function parameter or condition operand
    pub fn parse_fragment(&mut self, s: &str) -> Result<Node, TemplateError> {
        if s.is_empty() {
            return Ok(Node::str(""));
        }

        let mut arena = Arena::new();
        self.parse_line(s, &mut arena)?;
        if arena.stack.len() > 1 {
            return Err(TemplateError::syntax("Unbalanced braces in template", s));
        }
        self.serialize_root(arena)
    }

    /// Collapse serialized items into one node.
    ///
    /// A single item is unwrapped, a joinable list stays a list for later
    /// variable resolution, anything else becomes an `Fn::Join`.
    pub fn normalize(&mut self, items: Vec<Node>) -> Result<Node, TemplateError> {
        let node = self
            .state
            .process_tree(Node::plain_list(items), None, ProcessOptions::COLLAPSE)?;
        let items = match node {
            Node::List(list) => list.items,
            other => vec![other],
        };

        let mut list = TemplateState::normalize_vars_list(items);
        Ok(match list.items.len() {
            0 => Node::List(list),
            1 => list.items.pop().unwrap_or(Node::Null),
            _ if list.kind == ListKind::JoinableStrings => Node::List(list),
            _ => Node::join(list.items),
        })
    }

    fn parse_line(&mut self, line: &str, arena: &mut Arena) -> Result<(), TemplateError> {
        let mut text = String::new();

        for (token, _) in lex_line(line) {
            if let LineToken::Text(t) = token {
                text.push_str(t);
                continue;
            }

            if !text.is_empty() {
                arena.add(Item::Node(Node::Str(std::mem::take(&mut text))));
            }

            match token {
                LineToken::Variable(name) => arena.add(Item::Node(Node::var(name))),
                LineToken::Reference(name) => {
                    let target = match name.strip_prefix("$$") {
                        Some(var) => Node::var(var),
                        None => Node::str(name),
                    };
                    arena.add(Item::Node(Node::reference(target)));
                }
                LineToken::Marker(raw) => match Marker::parse(raw) {
                    Some(Marker::Close) => close_block(arena)?,
                    Some(Marker::Function { name, params, open }) => {
                        let func = Function::parse(name, params, self)?;
                        open_function(arena, func, open)?;
                    }
                    None => text.push_str(raw),
                },
                LineToken::Text(_) => {}
            }
        }

        if !text.is_empty() {
            arena.add(Item::Node(Node::Str(text)));
        }
        Ok(())
    }

    fn serialize_root(&mut self, mut arena: Arena) -> Result<Node, TemplateError> {
        let items = std::mem::take(&mut arena.frames[ROOT].true_branch);
        let items = self.serialize_items(&mut arena, items)?;
        self.normalize(items)
    }

    fn serialize_items(
        &mut self,
        arena: &mut Arena,
        items: Vec<Item>,
    ) -> Result<Vec<Node>, TemplateError> {
        items
            .into_iter()
            .map(|item| match item {
                Item::Node(node) => Ok(node),
                Item::Frame(id) => self.serialize_frame(arena, id),
            })
            .collect()
    }

    fn serialize_frame(&mut self, arena: &mut Arena, id: FrameId) -> Result<Node, TemplateError> {
        let frame = std::mem::take(&mut arena.frames[id]);
        let true_items = self.serialize_items(arena, frame.true_branch)?;

        match frame.func {
            Some(Function::If { condition }) => {
                let condition = match condition {
                    node @ (Node::Str(_) | Node::Var(_)) => node,
                    node @ Node::Map(_) => Node::Condition(Box::new(node)),
                    other => {
                        return Err(TemplateError::syntax(
                            format!("Invalid parameter to If: {:?}", other),
                            "",
                        ))
                    }
                };
                let if_true = self.normalize(true_items)?;
                let false_items = self.serialize_items(arena, frame.false_branch)?;
                let if_false = match self.normalize(false_items)? {
                    node if node.is_empty_list() || node.as_str() == Some("") => Node::no_value(),
                    node => node,
                };
                Ok(Node::function(
                    "Fn::If",
                    Node::uncollapsible(vec![condition, if_true, if_false]),
                ))
            }
            Some(Function::Base64(Some(value))) => Ok(Node::base64(value)),
            Some(Function::Base64(None)) if true_items.is_empty() => Ok(Node::base64(Node::str(""))),
            Some(Function::Base64(None)) => Ok(Node::base64(self.normalize(true_items)?)),
            Some(Function::GetAzs(value)) => Ok(Node::function("Fn::GetAZs", value)),
            Some(Function::Select { index, container }) => Ok(Node::function(
                "Fn::Select",
                Node::plain_list(vec![index, container]),
            )),
            Some(Function::ImportValue(value)) => Ok(Node::function("Fn::ImportValue", value)),
            Some(Function::Generic { name, mut params }) => {
                params.extend(true_items);
                Ok(Node::function(
                    format!("Fn::{}", name),
                    Node::uncollapsible(params),
                ))
            }
            Some(Function::Else) | Some(Function::ElseIf { .. }) | None => {
                Err(TemplateError::syntax("Misplaced block in template", ""))
            }
        }
    }
}

/// Place a parsed function in the current frame, opening a block when asked
fn open_function(arena: &mut Arena, func: Function, open: bool) -> Result<(), TemplateError> {
    let current = arena.current();

    match func {
        Function::Else | Function::ElseIf { .. } => {
            let name = func.name().to_string();
            let parent = &mut arena.frames[current];
            if !parent.is_if() {
                return Err(TemplateError::syntax(
                    format!("Found {} without a matching If", name),
                    "",
                ));
            }
            if parent.true_branch.is_empty() {
                return Err(TemplateError::syntax(
                    format!("Found {} without a \"true\" value in the If", name),
                    "",
                ));
            }
            if parent.has_else || !parent.false_branch.is_empty() {
                return Err(TemplateError::syntax(
                    format!("Found {} after an Else", name),
                    "",
                ));
            }
            parent.in_false = true;

            let Function::ElseIf { condition } = func else {
                parent.has_else = true;
                return Ok(());
            };

            let pop_count = parent.pop_count + 1;
            let id = arena.alloc(Frame::new(Some(Function::If { condition }), pop_count));
            arena.frames[current].push(Item::Frame(id));
            arena.stack.push(id);
        }
        Function::GetAzs(_)
        | Function::Select { .. }
        | Function::ImportValue(_)
        | Function::Base64(Some(_))
            if open =>
        {
            return Err(TemplateError::syntax(
                format!("{} cannot open a block", func.name()),
                "",
            ));
        }
        func => {
            let id = arena.alloc(Frame::new(Some(func), 1));
            arena.frames[current].push(Item::Frame(id));
            if open {
                arena.stack.push(id);
            }
        }
    }

    Ok(())
}

fn close_block(arena: &mut Arena) -> Result<(), TemplateError> {
    let pop_count = arena.frames[arena.current()].pop_count;
    for _ in 0..pop_count {
        if arena.stack.len() <= 1 {
            return Err(TemplateError::syntax(
                "Found a block close without a matching block",
                "",
            ));
        }
        arena.stack.pop();
    }
    Ok(())
}

/// Boolean expressions of `If` and `ElseIf` conditions
pub struct ConditionGrammar<'p, 's> {
    parser: &'p mut StringParser<'s>,
}

impl<'p, 's> ConditionGrammar<'p, 's> {
    pub fn new(parser: &'p mut StringParser<'s>) -> Self {
        Self { parser }
    }
}

impl Grammar for ConditionGrammar<'_, '_> {
    type Value = Node;
    type Error = TemplateError;

    fn tokenize<'e>(&self, expr: &'e str) -> Result<Vec<&'e str>, TemplateError> {
        let tokens = lex_condition(expr)
            .map_err(|span| ExpressionError::InvalidToken(expr[span].to_string()))?;
        Ok(tokens.into_iter().map(|(_, raw)| raw).collect())
    }

    fn operator(&self, symbol: &str) -> Option<Operator> {
        match symbol {
            "||" => Some(Operator::left(1)),
            "&&" => Some(Operator::left(2)),
            "==" | "!=" => Some(Operator::left(3)),
            _ => None,
        }
    }

    fn value(&mut self, raw: &str) -> Result<Node, TemplateError> {
        self.parser.parse_fragment(raw)
    }

    fn apply(&mut self, op: &str, lhs: Node, rhs: Node) -> Result<Node, TemplateError> {
        let pair = Node::uncollapsible(vec![lhs, rhs]);
        match op {
            "||" => Ok(Node::function("Fn::Or", pair)),
            "&&" => Ok(Node::function("Fn::And", pair)),
            "==" => Ok(Node::function("Fn::Equals", pair)),
            "!=" => Ok(Node::function(
                "Fn::Not",
                Node::plain_list(vec![Node::function("Fn::Equals", pair)]),
            )),
            _ => Err(ExpressionError::UnexpectedOperator(op.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn parse_with(state: &mut TemplateState, s: &str) -> Node {
        StringParser::new(state).parse(s).unwrap()
    }

    fn parse(s: &str) -> Node {
        parse_with(&mut TemplateState::new(), s)
    }

    fn parse_json(s: &str) -> Value {
        let node = parse(s);
        // Pending conditions are not JSON; compare their inner expression.
        strip_conditions(node).to_json().unwrap()
    }

    fn strip_conditions(node: Node) -> Node {
        match node {
            Node::Condition(inner) => strip_conditions(*inner),
            Node::Map(map) => Node::Map(
                map.into_iter()
                    .map(|(k, v)| (k, strip_conditions(v)))
                    .collect(),
            ),
            Node::List(mut list) => {
                list.items = list.items.into_iter().map(strip_conditions).collect();
                Node::List(list)
            }
            other => other,
        }
    }

    fn no_value() -> Value {
        json!({"Ref": "AWS::NoValue"})
    }

    #[test]
    fn test_plain_string() {
        assert_eq!(parse("hello"), Node::str("hello"));
        assert_eq!(parse(""), Node::str(""));
    }

    #[test]
    fn test_multiline_becomes_join_of_lines() {
        assert_eq!(
            parse_json("line 1\nline 2\nline 3\n"),
            json!({"Fn::Join": ["", ["line 1\n", "line 2\n", "line 3\n"]]})
        );
    }

    #[test]
    fn test_reference_in_text() {
        assert_eq!(
            parse_json("foo - @@Bar - baz"),
            json!({"Fn::Join": ["", ["foo - ", {"Ref": "Bar"}, " - baz"]]})
        );
    }

    #[test]
    fn test_braced_reference() {
        assert_eq!(
            parse_json("@@{AWS::StackName}-x"),
            json!({"Fn::Join": ["", [{"Ref": "AWS::StackName"}, "-x"]]})
        );
    }

    #[test]
    fn test_variable_reference_in_ref() {
        let mut state = TemplateState::new();
        state.variables.insert("name", Node::str("MyBucket"));
        let node = parse_with(&mut state, "@@$$name");
        assert_eq!(node, Node::reference(Node::var("name")));

        let node = state
            .process_tree(node, None, ProcessOptions::VARIABLES)
            .unwrap();
        assert_eq!(node.to_json().unwrap(), json!({"Ref": "MyBucket"}));
    }

    #[test]
    fn test_resolved_variable_collapses() {
        let mut state = TemplateState::new();
        state.variables.insert("myvar", Node::str("abc"));
        assert_eq!(parse_with(&mut state, "foo - $$myvar - baz"), Node::str("foo - abc - baz"));
    }

    #[test]
    fn test_unresolved_variable_stays_joinable() {
        let mut state = TemplateState::new();
        let node = parse_with(&mut state, "foo - $$myvar - baz");
        assert_eq!(
            node,
            Node::List(crate::template::List::new(
                ListKind::JoinableStrings,
                vec![Node::str("foo - "), Node::var("myvar"), Node::str(" - baz")]
            ))
        );
        assert!(state.unresolved.contains("myvar"));
    }

    #[test]
    fn test_lone_sigils_stay_in_one_string() {
        assert_eq!(parse("user@example.com costs $5"), Node::str("user@example.com costs $5"));
    }

    #[test]
    fn test_base64_sentinel() {
        assert_eq!(
            parse_json("__base64__\n#!/bin/sh\necho hi\n"),
            json!({"Fn::Base64": {"Fn::Join": ["", ["#!/bin/sh\n", "echo hi\n"]]}})
        );
    }

    #[test]
    fn test_if_without_else() {
        assert_eq!(
            parse_json("<% If (a) { %>\nthe line.\n<% } %>"),
            json!({"Fn::If": ["a", "the line.\n", no_value()]})
        );
    }

    #[test]
    fn test_if_else() {
        assert_eq!(
            parse_json("<% If (a) { %>\ntrue_value\n<% Else { %>\nfalse_value\n<% } %>"),
            json!({"Fn::If": ["a", "true_value\n", "false_value\n"]})
        );
    }

    #[test]
    fn test_if_elseif_else_chain() {
        let source = "<% If (a) { %>\nvalue1\n<% ElseIf (b) { %>\nvalue2\n\
                      <% ElseIf (c) { %>\nvalue3\n<% Else { %>\nvalue4\n<% } %>";
        assert_eq!(
            parse_json(source),
            json!({"Fn::If": ["a", "value1\n",
                {"Fn::If": ["b", "value2\n",
                    {"Fn::If": ["c", "value3\n", "value4\n"]}]}]})
        );
    }

    #[test]
    fn test_elseif_without_else() {
        assert_eq!(
            parse_json("<% If (a) { %>\nvalue1\n<% ElseIf (b) { %>\nvalue2\n<% } %>"),
            json!({"Fn::If": ["a", "value1\n", {"Fn::If": ["b", "value2\n", no_value()]}]})
        );
    }

    #[test]
    fn test_nested_if() {
        let source = "<% If (a) { %>\nLine 1.\n<%   If (b) { %>\nLine 2.\n<%   } %>\nLine 3.\n<% } %>";
        assert_eq!(
            parse_json(source),
            json!({"Fn::If": [
                "a",
                {"Fn::Join": ["", [
                    "Line 1.\n",
                    {"Fn::If": ["b", "Line 2.\n", no_value()]},
                    "Line 3.\n"
                ]]},
                no_value()
            ]})
        );
    }

    #[test]
    fn test_if_condition_is_pending() {
        let node = parse("<% If (a == b) { %>\nx\n<% } %>");
        let args = match node.as_map().and_then(|m| m.get("Fn::If")) {
            Some(Node::List(list)) => &list.items,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(args[0], Node::Condition(_)));
    }

    #[test]
    fn test_if_not_equals() {
        assert_eq!(
            parse_json("<% If (a != b) { %>\nx\n<% } %>"),
            json!({"Fn::If": [{"Fn::Not": [{"Fn::Equals": ["a", "b"]}]}, "x\n", no_value()]})
        );
    }

    #[test]
    fn test_if_complex_expression() {
        let mut state = TemplateState::new();
        state.variables.insert("v", Node::str("value"));
        let node = parse_with(
            &mut state,
            "<% If ((i != 1 || s == \"foo bar\") && @@r == 3 || $$v == true) { %>\nthe line.\n<% } %>",
        );
        assert_eq!(
            strip_conditions(node).to_json().unwrap(),
            json!({"Fn::If": [
                {"Fn::Or": [
                    {"Fn::And": [
                        {"Fn::Or": [
                            {"Fn::Not": [{"Fn::Equals": ["i", "1"]}]},
                            {"Fn::Equals": ["s", "foo bar"]}
                        ]},
                        {"Fn::Equals": [{"Ref": "r"}, "3"]}
                    ]},
                    {"Fn::Equals": ["value", "true"]}
                ]},
                "the line.\n",
                no_value()
            ]})
        );
    }

    #[test]
    fn test_else_without_if() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("x\n<% Else { %>\ny\n<% } %>")
            .unwrap_err();
        assert!(err.to_string().starts_with("Found Else without a matching If"));
    }

    #[test]
    fn test_else_without_true_branch() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("<% If (a) { %>\n<% Else { %>\ny\n<% } %>")
            .unwrap_err();
        assert!(err.to_string().contains("without a \"true\" value"));
    }

    #[test]
    fn test_else_after_else() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("<% If (a) { %>\nx\n<% Else { %>\ny\n<% ElseIf (b) { %>\nz\n<% } %>")
            .unwrap_err();
        assert!(err.to_string().starts_with("Found ElseIf after an Else"));
    }

    #[test]
    fn test_unbalanced_braces() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("<% If (a) { %>\nx\n")
            .unwrap_err();
        assert!(err.to_string().starts_with("Unbalanced braces in template"));
    }

    #[test]
    fn test_unexpected_close() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("x\n<% } %>\n")
            .unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }

    #[test]
    fn test_get_att() {
        assert_eq!(
            parse_json("<% GetAtt(\"MyResource\", @@MyProperty) %>"),
            json!({"Fn::GetAtt": ["MyResource", {"Ref": "MyProperty"}]})
        );
    }

    #[test]
    fn test_generic_block_function() {
        assert_eq!(
            parse_json("<% Join(\",\") { %>\na\nb\n<% } %>"),
            json!({"Fn::Join": [",", "a\n", "b\n"]})
        );
    }

    #[test]
    fn test_get_azs() {
        assert_eq!(parse_json("<% GetAZs() %>"), json!({"Fn::GetAZs": ""}));
        assert_eq!(
            parse_json("<% GetAZs(\"us-east-1\") %>"),
            json!({"Fn::GetAZs": "us-east-1"})
        );
        assert_eq!(
            parse_json("<% GetAZs(@@MyReference) %>"),
            json!({"Fn::GetAZs": {"Ref": "MyReference"}})
        );
    }

    #[test]
    fn test_get_azs_too_many_params() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("<% GetAZs(a, b) %>")
            .unwrap_err();
        assert!(err.to_string().starts_with("Too many parameters passed to GetAZs"));
    }

    #[test]
    fn test_base64_function() {
        assert_eq!(
            parse_json("<% Base64(\"hello\") %>"),
            json!({"Fn::Base64": "hello"})
        );
        assert_eq!(
            parse_json("<% Base64 { %>\nline 1\nline 2\n<% } %>"),
            json!({"Fn::Base64": {"Fn::Join": ["", ["line 1\n", "line 2\n"]]}})
        );
    }

    #[test]
    fn test_select_with_array() {
        let mut state = TemplateState::new();
        state.variables.insert("myvar", Node::str("abc"));
        let node = parse_with(
            &mut state,
            "<% Select(2, [\"foo 'bar'\", '\"foo\" bar', $$myvar]) %>",
        );
        assert_eq!(
            node.to_json().unwrap(),
            json!({"Fn::Select": ["2", ["foo 'bar'", "\"foo\" bar", "abc"]]})
        );
    }

    #[test]
    fn test_select_with_reference_and_function() {
        assert_eq!(
            parse_json("<% Select(2, @@MyReference) %>"),
            json!({"Fn::Select": ["2", {"Ref": "MyReference"}]})
        );
        assert_eq!(
            parse_json("<% Select(0, GetAZs(\"\")) %>"),
            json!({"Fn::Select": ["0", {"Fn::GetAZs": ""}]})
        );
    }

    #[test]
    fn test_select_rejects_garbage() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("<% Select(first, @@Foo) %>")
            .unwrap_err();
        assert!(err.to_string().starts_with("Cannot parse parameters to Select"));
    }

    #[test]
    fn test_import_value() {
        assert_eq!(
            parse_json("<% ImportValue(\"shared-VpcId\") %>"),
            json!({"Fn::ImportValue": "shared-VpcId"})
        );
        assert!(StringParser::new(&mut TemplateState::new())
            .parse("<% ImportValue(a, b) %>")
            .is_err());
    }

    #[test]
    fn test_value_functions_reject_blocks() {
        for source in [
            "<% GetAZs(\"\") { %>\nx\n<% } %>",
            "<% Select(0, [a, b]) { %>\nx\n<% } %>",
            "<% ImportValue(\"shared\") { %>\nx\n<% } %>",
            "<% Base64(\"hello\") { %>\nx\n<% } %>",
        ] {
            let err = StringParser::new(&mut TemplateState::new())
                .parse(source)
                .unwrap_err();
            assert!(
                err.to_string().contains("cannot open a block"),
                "unexpected error for {:?}: {}",
                source,
                err
            );
        }
    }

    #[test]
    fn test_error_carries_offending_line() {
        let err = StringParser::new(&mut TemplateState::new())
            .parse("ok\n<% If (a ~ b) { %>\n")
            .unwrap_err();
        match err {
            TemplateError::Syntax { code, .. } => assert_eq!(code, "<% If (a ~ b) { %>\n"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
