//! Conversion of parsed YAML values into template nodes
//!
//! Every scalar runs through the [`StringParser`], mapping keys named `<`
//! splice their mapping into the parent, and tagged values are dispatched
//! through a [`TagTable`].

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::{BuildHasher, Hasher};
use std::path::{Component, Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::error::{ReferenceKind, TemplateError};
use crate::parser::StringParser;

use super::node::{Key, ListKind, Mapping, Node};
use super::reader::TemplateReader;
use super::state::{ProcessOptions, TemplateState};

/// Builds a node from the value following a custom tag
pub type TagHandler = fn(&mut DocumentLoader<'_>, Value) -> Result<Node, TemplateError>;

/// Key that splices its mapping value into the enclosing mapping
pub const MERGE_KEY: &str = "<";

/// Custom YAML tags and their handlers
#[derive(Clone)]
pub struct TagTable {
    handlers: HashMap<&'static str, TagHandler>,
}

impl fmt::Debug for TagTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("TagTable").field("tags", &names).finish()
    }
}

impl Default for TagTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register("import", load_import);
        table.register("call-macro", load_call_macro);
        table.register("tags", load_tags);
        table.register("embed-file", load_embed_file);
        table.register("cloud-init", load_cloud_init);
        table
    }
}

impl TagTable {
    /// A table with the standard template tags
    pub fn new() -> Self {
        Self::default()
    }

    /// A table without any handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `!name`, replacing any existing one
    pub fn register(&mut self, name: &'static str, handler: TagHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<TagHandler> {
        self.handlers.get(name).copied()
    }
}

/// Loads the values of one source into nodes
pub struct DocumentLoader<'a> {
    pub state: &'a mut TemplateState,
    tags: &'a TagTable,
    source: &'a str,
    filename: Option<&'a Path>,
    base_dir: Option<&'a Path>,
    /// Files currently being imported, outermost first
    import_chain: &'a [PathBuf],
}

impl<'a> DocumentLoader<'a> {
    pub fn new(state: &'a mut TemplateState, tags: &'a TagTable, source: &'a str) -> Self {
        Self {
            state,
            tags,
            source,
            filename: None,
            base_dir: None,
            import_chain: &[],
        }
    }

    pub fn with_filename(mut self, filename: Option<&'a Path>) -> Self {
        self.filename = filename;
        self
    }

    pub fn with_base_dir(mut self, base_dir: Option<&'a Path>) -> Self {
        self.base_dir = base_dir;
        self
    }

    pub fn with_import_chain(mut self, chain: &'a [PathBuf]) -> Self {
        self.import_chain = chain;
        self
    }

    /// Load any YAML value
    pub fn load(&mut self, value: Value) -> Result<Node, TemplateError> {
        match value {
            Value::Null => Ok(Node::Null),
            Value::Bool(b) => Ok(Node::Str(b.to_string())),
            Value::Number(n) => Ok(Node::Str(n.to_string())),
            Value::String(s) => self.load_scalar(&s),
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|item| self.load(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Node::plain_list),
            Value::Mapping(map) => self.load_mapping(map).map(Node::Map),
            Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                let name = tag.trim_start_matches('!');
                match self.tags.get(name) {
                    Some(handler) => handler(self, tagged.value),
                    None => Err(TemplateError::validation(format!(
                        "Unknown tag \"{}\"",
                        tag
                    ))),
                }
            }
        }
    }

    /// Load a value that must become a mapping
    pub fn load_map(&mut self, value: Value, what: &str) -> Result<Mapping, TemplateError> {
        match self.load(value)? {
            Node::Map(map) => Ok(map),
            Node::Null => Ok(Mapping::new()),
            _ => Err(TemplateError::validation(format!(
                "{} must be a mapping",
                what
            ))),
        }
    }

    fn load_scalar(&mut self, s: &str) -> Result<Node, TemplateError> {
        StringParser::new(self.state)
            .parse(s)
            .map_err(|err| err.locate(self.filename, self.source))
    }

    fn load_mapping(&mut self, map: serde_yaml::Mapping) -> Result<Mapping, TemplateError> {
        let mut out = Mapping::new();

        for (key, value) in map {
            if matches!(&key, Value::String(k) if k == MERGE_KEY) {
                match self.load(value)? {
                    Node::Map(merged) => out.extend(merged),
                    _ => {
                        return Err(TemplateError::syntax(
                            "The merge key \"<\" requires a mapping value",
                            MERGE_KEY,
                        )
                        .locate(self.filename, self.source))
                    }
                }
                continue;
            }

            let raw_key = match &key {
                Value::String(k) => k.clone(),
                other => serde_yaml::to_string(other).unwrap_or_default(),
            };
            let key = Key::from_node(self.load(key)?).map_err(|_| {
                TemplateError::syntax("Invalid mapping key", raw_key.trim())
                    .locate(self.filename, self.source)
            })?;
            let value = self.load(value)?;
            out.insert(key, value);
        }

        Ok(out)
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// `!import path [path...]`: pull macros and variables from other files
fn load_import(loader: &mut DocumentLoader<'_>, value: Value) -> Result<Node, TemplateError> {
    let Value::String(paths) = value else {
        return Err(TemplateError::validation(
            "!import expects one or more file paths",
        ));
    };

    for path in paths.split_whitespace() {
        let mut path = loader.resolve_path(path);
        if path.is_dir() {
            path.push("__main__.yaml");
        }
        let path = normalize_path(&path);

        if loader.import_chain.contains(&path) {
            let chain = loader
                .import_chain
                .iter()
                .chain(std::iter::once(&path))
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(TemplateError::reference(ReferenceKind::Import, chain));
        }

        debug!(path = %path.display(), "importing template");
        loader.state.imported_files.insert(path.clone());

        let mut chain = loader.import_chain.to_vec();
        chain.push(path.clone());

        let mut reader = TemplateReader::with_tags(loader.tags.clone()).with_import_chain(chain);
        reader.load_file(&path)?;
        loader.state.update(reader.state);
    }

    Ok(Node::Null)
}

/// `!call-macro {macro: name, ...overrides}`: expand a macro in place
fn load_call_macro(loader: &mut DocumentLoader<'_>, value: Value) -> Result<Node, TemplateError> {
    let mut overrides = loader.load_map(value, "!call-macro")?;

    let name = match overrides.remove("macro") {
        Some(Node::Str(name)) => name,
        _ => {
            return Err(TemplateError::validation(
                "!call-macro requires a \"macro\" name",
            ))
        }
    };

    let definition = TemplateState::resolve(&name, &loader.state.macros)
        .ok()
        .and_then(Node::as_map)
        .cloned()
        .ok_or_else(|| TemplateError::reference(ReferenceKind::Macro, &name))?;
    let content = definition
        .get("content")
        .cloned()
        .ok_or_else(|| TemplateError::reference(ReferenceKind::Macro, &name))?;

    let mut scope = loader.state.variables.clone();
    if let Some(Node::Map(defaults)) = definition.get("defaultParams") {
        scope.extend(defaults.clone());
    }
    scope.extend(overrides);

    debug!(name = %name, "expanding macro");
    loader
        .state
        .process_tree(content, Some(&scope), ProcessOptions::VARIABLES)
}

/// `!tags {name: value}`: the list-of-`{Key, Value}` form of a tag set
fn load_tags(loader: &mut DocumentLoader<'_>, value: Value) -> Result<Node, TemplateError> {
    let values = loader.load_map(value, "!tags")?;
    let mut tags = Vec::with_capacity(values.len());

    for (key, value) in values {
        let valid = match &value {
            Node::Str(_) | Node::Var(_) => true,
            Node::Map(map) => is_intrinsic(map),
            Node::List(list) => list.kind == ListKind::JoinableStrings,
            Node::Null | Node::Condition(_) => false,
        };
        if !valid {
            return Err(TemplateError::validation(format!(
                "Invalid value for tag \"{}\"",
                key.as_str().unwrap_or("<generated>")
            )));
        }

        let mut tag = Mapping::new();
        tag.insert("Key", key.to_node());
        tag.insert("Value", value);
        tags.push(Node::Map(tag));
    }

    Ok(Node::plain_list(tags))
}

/// A single `Ref` or `Fn::*` entry, the only mappings that evaluate to a string
fn is_intrinsic(map: &Mapping) -> bool {
    let mut keys = map.iter().map(|(key, _)| key.as_str());
    match (keys.next(), keys.next()) {
        (Some(Some(name)), None) => name == "Ref" || name.starts_with("Fn::"),
        _ => false,
    }
}

/// `!embed-file {filename, base64}`: the raw lines of a file
fn load_embed_file(loader: &mut DocumentLoader<'_>, value: Value) -> Result<Node, TemplateError> {
    let values = loader.load_map(value, "!embed-file")?;

    let filename = match values.get("filename") {
        Some(Node::Str(filename)) => filename.clone(),
        _ => {
            return Err(TemplateError::validation(
                "Missing filename in !embed-file",
            ))
        }
    };
    let base64 = match values.get("base64") {
        None => false,
        Some(Node::Str(flag)) => flag.eq_ignore_ascii_case("true"),
        Some(_) => {
            return Err(TemplateError::validation(
                "The base64 flag of !embed-file must be true or false",
            ))
        }
    };

    let path = normalize_path(&loader.resolve_path(&filename));
    let content = fs::read_to_string(&path).map_err(|err| TemplateError::io(&path, err))?;

    debug!(path = %path.display(), base64, "embedding file");
    loader.state.embedded_files.insert(path);

    let lines = content.split_inclusive('\n').map(Node::str).collect();
    let joined = Node::join(lines);
    Ok(if base64 { Node::base64(joined) } else { joined })
}

/// Known `!cloud-init` blocks: name, MIME type and attachment file name
const CLOUD_INIT_PARTS: [(&str, &str, &str); 2] = [
    ("config", "text/cloud-config", "cloud.cfg"),
    ("script", "text/x-shellscript", "script.sh"),
];

/// `!cloud-init {config, script}`: base64 user data, multipart when needed
fn load_cloud_init(loader: &mut DocumentLoader<'_>, value: Value) -> Result<Node, TemplateError> {
    let mut blocks = loader.load_map(value, "!cloud-init")?;

    if let Some(unknown) = blocks
        .iter()
        .filter_map(|(key, _)| key.as_str())
        .find(|name| !CLOUD_INIT_PARTS.iter().any(|(part, _, _)| part == name))
    {
        return Err(TemplateError::validation(format!(
            "Unknown !cloud-init block \"{}\"",
            unknown
        )));
    }

    let mut parts: Vec<_> = CLOUD_INIT_PARTS
        .iter()
        .filter_map(|(name, content_type, filename)| {
            blocks
                .remove(name)
                .map(|content| (*content_type, *filename, content))
        })
        .collect();

    if parts.len() == 1 {
        let (_, _, content) = parts.remove(0);
        return Ok(Node::base64(content));
    }
    if parts.is_empty() {
        return Err(TemplateError::validation(
            "!cloud-init requires a config or script block",
        ));
    }

    let boundary = mime_boundary();
    let mut items = vec![
        Node::str(format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"\n",
            boundary
        )),
        Node::str("MIME-Version: 1.0\n"),
        Node::str("\n"),
    ];

    for (content_type, filename, content) in parts {
        items.push(Node::str(format!("--{}\n", boundary)));
        items.push(Node::str(format!("Content-Type: {}\n", content_type)));
        items.push(Node::str("MIME-Version: 1.0\n"));
        items.push(Node::str(format!(
            "Content-Disposition: attachment; filename=\"{}\"\n",
            filename
        )));
        items.push(Node::str("\n"));
        items.extend(join_items(content));
    }
    items.push(Node::str(format!("--{}--\n", boundary)));

    Ok(Node::base64(Node::join(items)))
}

/// The items of an `Fn::Join` with an empty separator, or the node itself
fn join_items(node: Node) -> Vec<Node> {
    if let Node::Map(map) = &node {
        if map.len() == 1 {
            if let Some(Node::List(args)) = map.get("Fn::Join") {
                if let [Node::Str(sep), Node::List(items)] = args.items.as_slice() {
                    if sep.is_empty() {
                        return items.items.clone();
                    }
                }
            }
        }
    }
    vec![node]
}

/// A random MIME boundary: 15 `=`, 19 digits, `==`
fn mime_boundary() -> String {
    let token = RandomState::new().build_hasher().finish() % (i64::MAX as u64);
    format!("{}{:019}==", "=".repeat(15), token)
}

/// Resolve `.` and `..` components without touching the filesystem
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
