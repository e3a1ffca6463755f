//! The document tree produced by the loader and rewritten by resolution passes

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{ReferenceKind, TemplateError};

/// A value in a loaded template
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Str(String),
    Map(Mapping),
    List(List),
    /// A template variable that could not be resolved yet
    Var(String),
    /// A boolean expression waiting to become a named condition
    Condition(Box<Node>),
}

/// How a sequence behaves when its items are folded together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// An ordinary sequence
    Plain,
    /// Strings and variable references that become one string once resolved
    JoinableStrings,
    /// Items are resolved but never merged into neighbors
    Uncollapsible,
}

/// A tagged sequence of nodes
#[derive(Debug, Clone, PartialEq)]
pub struct List {
    pub kind: ListKind,
    pub items: Vec<Node>,
}

/// One piece of a mapping key that still contains variables
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Str(String),
    Var(String),
}

/// A mapping key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(String),
    /// A key built from literals and variables, resolved during expansion
    Parts(Vec<KeyPart>),
}

impl Key {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            Key::Parts(_) => None,
        }
    }

    /// Convert a loaded key node into a key
    pub fn from_node(node: Node) -> Result<Self, Node> {
        match node {
            Node::Str(s) => Ok(Key::Str(s)),
            Node::Var(name) => Ok(Key::Parts(vec![KeyPart::Var(name)])),
            Node::List(list) if list.kind == ListKind::JoinableStrings => {
                let mut parts = Vec::with_capacity(list.items.len());
                for item in list.items {
                    match item {
                        Node::Str(s) => parts.push(KeyPart::Str(s)),
                        Node::Var(name) => parts.push(KeyPart::Var(name)),
                        other => return Err(other),
                    }
                }
                Ok(Key::Parts(parts))
            }
            other => Err(other),
        }
    }

    /// The node form of this key, as used for tag names
    pub fn to_node(&self) -> Node {
        match self {
            Key::Str(s) => Node::Str(s.clone()),
            Key::Parts(parts) => Node::List(List::new(
                ListKind::JoinableStrings,
                parts
                    .iter()
                    .map(|p| match p {
                        KeyPart::Str(s) => Node::Str(s.clone()),
                        KeyPart::Var(name) => Node::Var(name.clone()),
                    })
                    .collect(),
            )),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

/// Insertion-ordered mapping; later inserts replace earlier values in place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    entries: IndexMap<Key, Node>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Key>, value: Node) -> Option<Node> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.get(&Key::Str(key.to_string()))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.entries.get_mut(&Key::Str(key.to_string()))
    }

    /// Remove a key, keeping the order of the remaining entries
    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.entries.shift_remove(&Key::Str(key.to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Node)> {
        self.entries.iter()
    }

    /// Merge another mapping into this one; colliding keys take the new value
    pub fn extend(&mut self, other: Mapping) {
        self.entries.extend(other.entries);
    }
}

impl IntoIterator for Mapping {
    type Item = (Key, Node);
    type IntoIter = indexmap::map::IntoIter<Key, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(Key, Node)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (Key, Node)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl List {
    pub fn new(kind: ListKind, items: Vec<Node>) -> Self {
        Self { kind, items }
    }

    pub fn plain(items: Vec<Node>) -> Self {
        Self::new(ListKind::Plain, items)
    }
}

impl Node {
    pub fn str(s: impl Into<String>) -> Self {
        Node::Str(s.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Node::Var(name.into())
    }

    pub fn plain_list(items: Vec<Node>) -> Self {
        Node::List(List::plain(items))
    }

    pub fn uncollapsible(items: Vec<Node>) -> Self {
        Node::List(List::new(ListKind::Uncollapsible, items))
    }

    /// A single-key mapping, the shape of every intrinsic function
    pub fn function(name: impl Into<String>, value: Node) -> Self {
        let mut map = Mapping::new();
        map.insert(Key::Str(name.into()), value);
        Node::Map(map)
    }

    /// `{Ref: name}`
    pub fn reference(target: Node) -> Self {
        Node::function("Ref", target)
    }

    /// The placeholder for an absent conditional branch
    pub fn no_value() -> Self {
        Node::reference(Node::str("AWS::NoValue"))
    }

    /// `{Fn::Join: ["", items]}`
    pub fn join(items: Vec<Node>) -> Self {
        Node::function(
            "Fn::Join",
            Node::plain_list(vec![Node::str(""), Node::plain_list(items)]),
        )
    }

    /// `{Fn::Base64: value}`
    pub fn base64(value: Node) -> Self {
        Node::function("Fn::Base64", value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_empty_list(&self) -> bool {
        matches!(self, Node::List(list) if list.items.is_empty())
    }

    /// Names of every variable reference still present in the tree
    pub fn unresolved_variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut BTreeSet<String>) {
        match self {
            Node::Var(name) => {
                names.insert(name.clone());
            }
            Node::Map(map) => {
                for (key, value) in map.iter() {
                    if let Key::Parts(parts) = key {
                        for part in parts {
                            if let KeyPart::Var(name) = part {
                                names.insert(name.clone());
                            }
                        }
                    }
                    value.collect_variables(names);
                }
            }
            Node::List(list) => {
                for item in &list.items {
                    item.collect_variables(names);
                }
            }
            Node::Condition(inner) => inner.collect_variables(names),
            Node::Null | Node::Str(_) => {}
        }
    }

    /// Convert a fully resolved tree into JSON.
    ///
    /// Any variable still present is a reference error; a condition that was
    /// never materialized is a validation error.
    pub fn to_json(&self) -> Result<Value, TemplateError> {
        match self {
            Node::Null => Ok(Value::Null),
            Node::Str(s) => Ok(Value::String(s.clone())),
            Node::Map(map) => {
                let mut object = serde_json::Map::with_capacity(map.len());
                for (key, value) in map.iter() {
                    let key = match key {
                        Key::Str(s) => s.clone(),
                        Key::Parts(parts) => {
                            return Err(unresolved_key_error(parts));
                        }
                    };
                    object.insert(key, value.to_json()?);
                }
                Ok(Value::Object(object))
            }
            Node::List(list) => list
                .items
                .iter()
                .map(Node::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Node::Var(name) => Err(TemplateError::reference(ReferenceKind::Variable, name)),
            Node::Condition(_) => Err(TemplateError::validation(
                "If condition found outside of a resolvable section",
            )),
        }
    }
}

fn unresolved_key_error(parts: &[KeyPart]) -> TemplateError {
    let name = parts
        .iter()
        .find_map(|p| match p {
            KeyPart::Var(name) => Some(name.clone()),
            KeyPart::Str(_) => None,
        })
        .unwrap_or_default();
    TemplateError::reference(ReferenceKind::Variable, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_mapping_keeps_insertion_order() {
        let mut map = Mapping::new();
        map.insert("b", Node::str("1"));
        map.insert("a", Node::str("2"));
        map.insert("b", Node::str("3"));
        let keys: Vec<_> = map.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(map.get("b"), Some(&Node::str("3")));
    }

    #[test]
    fn test_to_json() {
        let node = Node::join(vec![Node::str("a"), Node::reference(Node::str("B"))]);
        assert_eq!(
            node.to_json().unwrap(),
            json!({"Fn::Join": ["", ["a", {"Ref": "B"}]]})
        );
    }

    #[test]
    fn test_to_json_rejects_variables() {
        let node = Node::plain_list(vec![Node::str("a"), Node::var("missing")]);
        let err = node.to_json().unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Reference {
                kind: ReferenceKind::Variable,
                ..
            }
        ));
    }

    #[test]
    fn test_key_from_joinable_list() {
        let node = Node::List(List::new(
            ListKind::JoinableStrings,
            vec![Node::str("Web"), Node::var("suffix")],
        ));
        assert_eq!(
            Key::from_node(node),
            Ok(Key::Parts(vec![
                KeyPart::Str("Web".to_string()),
                KeyPart::Var("suffix".to_string())
            ]))
        );
    }

    #[test]
    fn test_unresolved_variables() {
        let mut map = Mapping::new();
        map.insert("a", Node::var("x"));
        map.insert("b", Node::Condition(Box::new(Node::var("y"))));
        assert_eq!(
            Node::Map(map).unresolved_variables().into_iter().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
    }
}
