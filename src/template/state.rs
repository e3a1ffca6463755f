//! Variable and macro bindings shared by every document of one compile

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{ReferenceKind, TemplateError};

use super::node::{Key, KeyPart, List, ListKind, Mapping, Node};

/// Which rewrites a [`TemplateState::process_tree`] pass performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Replace variable references with their values; misses are errors
    pub resolve_variables: bool,
    /// Keep variables that cannot be resolved yet instead of failing
    pub keep_unresolved: bool,
    /// Turn pending conditions into named entries of the condition table
    pub resolve_conditions: bool,
}

impl ProcessOptions {
    /// Fold what can be folded, resolve nothing
    pub const COLLAPSE: Self = Self {
        resolve_variables: false,
        keep_unresolved: true,
        resolve_conditions: false,
    };

    /// Resolve what the scope can resolve, leave the rest pending
    pub const PARTIAL: Self = Self {
        resolve_variables: true,
        keep_unresolved: true,
        resolve_conditions: false,
    };

    /// Resolve variables only
    pub const VARIABLES: Self = Self {
        resolve_variables: true,
        keep_unresolved: false,
        resolve_conditions: false,
    };

    /// Resolve variables and materialize conditions
    pub const COMPILE: Self = Self {
        resolve_variables: true,
        keep_unresolved: false,
        resolve_conditions: true,
    };
}

/// Bindings and bookkeeping for one compile
#[derive(Debug, Default)]
pub struct TemplateState {
    /// Template variables, possibly nested mappings addressed by dotted paths
    pub variables: Mapping,
    /// Macro definitions, possibly nested like variables
    pub macros: Mapping,
    /// Names of variable references that could not be resolved yet
    pub unresolved: HashSet<String>,
    pub imported_files: BTreeSet<PathBuf>,
    pub embedded_files: BTreeSet<PathBuf>,
    /// Materialized conditions, in the order they were named
    pub conditions: IndexMap<String, Node>,
}

impl TemplateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another state into this one; the other state wins on collisions
    pub fn update(&mut self, other: TemplateState) {
        self.macros.extend(other.macros);
        self.variables.extend(other.variables);
        self.unresolved.extend(other.unresolved);
        self.imported_files.extend(other.imported_files);
        self.embedded_files.extend(other.embedded_files);
    }

    /// Look up a name or dotted path within a scope
    pub fn resolve<'a>(name: &str, scope: &'a Mapping) -> Result<&'a Node, TemplateError> {
        let mut parts = name.split('.');
        let first = parts.next().unwrap_or_default();
        let mut current = scope
            .get(first)
            .ok_or_else(|| TemplateError::reference(ReferenceKind::Key, name))?;

        for part in parts {
            current = current
                .as_map()
                .and_then(|m| m.get(part))
                .ok_or_else(|| TemplateError::reference(ReferenceKind::Key, name))?;
        }

        Ok(current)
    }

    /// Walk a tree, rewriting variables and conditions per `options`.
    ///
    /// `scope` defaults to the state's own variables.
    pub fn process_tree(
        &mut self,
        node: Node,
        scope: Option<&Mapping>,
        options: ProcessOptions,
    ) -> Result<Node, TemplateError> {
        let TemplateState {
            variables,
            unresolved,
            conditions,
            ..
        } = self;
        let mut walker = TreeWalker {
            scope: scope.unwrap_or(&*variables),
            unresolved,
            conditions,
            options,
        };
        walker.process(node)
    }

    /// Fold resolvable variables into their neighboring strings.
    ///
    /// Variables that cannot be resolved stay in place and are recorded as
    /// unresolved.
    pub fn collapse_variables(
        &mut self,
        items: Vec<Node>,
        kind: ListKind,
        scope: Option<&Mapping>,
    ) -> Vec<Node> {
        let TemplateState {
            variables,
            unresolved,
            conditions,
            ..
        } = self;
        let mut walker = TreeWalker {
            scope: scope.unwrap_or(&*variables),
            unresolved,
            conditions,
            options: ProcessOptions::COLLAPSE,
        };
        walker.collapse(items, kind)
    }

    /// Tag a list as joinable strings when it holds only strings and at
    /// least one variable reference
    pub fn normalize_vars_list(items: Vec<Node>) -> List {
        let mut has_vars = false;

        for item in &items {
            match item {
                Node::Var(_) => has_vars = true,
                Node::Str(_) => {}
                _ => return List::plain(items),
            }
        }

        if has_vars {
            List::new(ListKind::JoinableStrings, items)
        } else {
            List::plain(items)
        }
    }
}

struct TreeWalker<'a> {
    scope: &'a Mapping,
    unresolved: &'a mut HashSet<String>,
    conditions: &'a mut IndexMap<String, Node>,
    options: ProcessOptions,
}

impl TreeWalker<'_> {
    fn process(&mut self, node: Node) -> Result<Node, TemplateError> {
        match node {
            Node::Map(map) => {
                let mut out = Mapping::new();
                for (key, value) in map {
                    let key = self.process_key(key)?;
                    let value = self.process(value)?;
                    out.insert(key, value);
                }
                Ok(Node::Map(out))
            }
            Node::List(List { kind, items }) => {
                let collapsed = self.collapse(items, kind);
                let items = collapsed
                    .into_iter()
                    .map(|item| self.process(item))
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(match kind {
                    ListKind::JoinableStrings => fold_joinable(items),
                    kind => Node::List(List::new(kind, items)),
                })
            }
            Node::Var(name) if self.options.resolve_variables => {
                match TemplateState::resolve(&name, self.scope) {
                    Ok(value) => {
                        self.unresolved.remove(&name);
                        Ok(value.clone())
                    }
                    Err(_) if self.options.keep_unresolved => {
                        self.unresolved.insert(name.clone());
                        Ok(Node::Var(name))
                    }
                    Err(_) => Err(TemplateError::reference(ReferenceKind::Variable, name)),
                }
            }
            Node::Condition(expr) => {
                if self.options.resolve_conditions {
                    let name = format!("IfCondition{}", self.conditions.len() + 1);
                    let saved = self.options;
                    self.options.resolve_conditions = false;
                    let expr = self.process(*expr);
                    self.options = saved;

                    debug!(condition = %name, "materialized condition");
                    self.conditions.insert(name.clone(), expr?);
                    Ok(Node::Str(name))
                } else {
                    Ok(Node::Condition(Box::new(self.process(*expr)?)))
                }
            }
            other => Ok(other),
        }
    }

    fn process_key(&mut self, key: Key) -> Result<Key, TemplateError> {
        let parts = match key {
            Key::Parts(parts) => parts,
            key => return Ok(key),
        };

        let mut folded: Vec<KeyPart> = Vec::with_capacity(parts.len());
        for part in parts {
            let part = match part {
                KeyPart::Var(name) => match TemplateState::resolve(&name, self.scope) {
                    Ok(Node::Str(value)) => {
                        self.unresolved.remove(&name);
                        KeyPart::Str(value.clone())
                    }
                    Ok(_) => {
                        return Err(TemplateError::validation(format!(
                            "Variable \"{}\" used in a mapping key must be a string",
                            name
                        )))
                    }
                    Err(_) if !self.options.keep_unresolved => {
                        return Err(TemplateError::reference(ReferenceKind::Variable, name))
                    }
                    Err(_) => {
                        self.unresolved.insert(name.clone());
                        KeyPart::Var(name)
                    }
                },
                part => part,
            };

            match (folded.last_mut(), part) {
                (Some(KeyPart::Str(last)), KeyPart::Str(s)) => last.push_str(&s),
                (_, part) => folded.push(part),
            }
        }

        match folded.as_slice() {
            [] => Ok(Key::Str(String::new())),
            [KeyPart::Str(s)] => Ok(Key::Str(s.clone())),
            _ => Ok(Key::Parts(folded)),
        }
    }

    fn collapse(&mut self, items: Vec<Node>, kind: ListKind) -> Vec<Node> {
        let can_collapse = kind != ListKind::Uncollapsible;
        let mut collapse_string = false;
        let mut result: Vec<Node> = Vec::with_capacity(items.len());

        for item in items {
            let mut collapse_next = false;

            let item = match item {
                Node::Var(name) => match TemplateState::resolve(&name, self.scope) {
                    Ok(value) => {
                        collapse_string = can_collapse;
                        collapse_next = can_collapse;
                        value.clone()
                    }
                    Err(_) => {
                        self.unresolved.insert(name.clone());
                        Node::Var(name)
                    }
                },
                other => other,
            };

            match item {
                Node::Str(s) => {
                    let folded = match result.last_mut() {
                        Some(Node::Str(last)) if collapse_string => {
                            last.push_str(&s);
                            true
                        }
                        _ => false,
                    };
                    if !folded {
                        result.push(Node::Str(s));
                    }
                    collapse_string = collapse_next;
                }
                other => {
                    result.push(other);
                    collapse_string = false;
                }
            }
        }

        result
    }
}

/// Re-fold a processed joinable list
fn fold_joinable(items: Vec<Node>) -> Node {
    if items.iter().all(|i| matches!(i, Node::Str(_))) {
        let joined: String = items.iter().filter_map(Node::as_str).collect();
        Node::Str(joined)
    } else if items
        .iter()
        .all(|i| matches!(i, Node::Str(_) | Node::Var(_)))
    {
        Node::List(List::new(ListKind::JoinableStrings, items))
    } else {
        Node::join(items)
    }
}
