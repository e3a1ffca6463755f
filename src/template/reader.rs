//! Multi-document template loading

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::{debug, trace};

use crate::error::TemplateError;

use super::loader::{DocumentLoader, TagTable};
use super::node::{Mapping, Node};
use super::state::{ProcessOptions, TemplateState};
use super::yaml;

/// Tag of a document holding macro definitions
pub const MACROS_TAG: &str = "macros";

/// Tag of a document holding variable definitions
pub const VARS_TAG: &str = "vars";

/// Reads the documents of a template into a tree and a shared state.
///
/// A source holds any number of `--- !macros` documents, `--- !vars`
/// documents and plain documents. Plain documents are merged into
/// [`TemplateReader::doc`], later keys winning.
#[derive(Debug, Default)]
pub struct TemplateReader {
    pub doc: Mapping,
    pub state: TemplateState,
    tags: TagTable,
    import_chain: Vec<PathBuf>,
}

impl TemplateReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reader using a custom tag table
    pub fn with_tags(tags: TagTable) -> Self {
        Self {
            tags,
            ..Self::default()
        }
    }

    /// Files already being imported; importing one of them again is an error
    pub fn with_import_chain(mut self, chain: Vec<PathBuf>) -> Self {
        self.import_chain = chain;
        self
    }

    /// Load a template from a string.
    ///
    /// `base_dir` anchors relative imports and embedded files; `filename`
    /// is used in error messages.
    pub fn load_str(
        &mut self,
        source: &str,
        base_dir: Option<&Path>,
        filename: Option<&Path>,
    ) -> Result<(), TemplateError> {
        debug!(
            file = %filename.map(|f| f.display().to_string()).unwrap_or_default(),
            "loading template"
        );

        for value in yaml::documents(source) {
            let value = value.map_err(|err| TemplateError::from_yaml(err, filename, source))?;

            let mut loader = DocumentLoader::new(&mut self.state, &self.tags, source)
                .with_filename(filename)
                .with_base_dir(base_dir)
                .with_import_chain(&self.import_chain);

            match value {
                Value::Null => {}
                Value::Tagged(tagged) if tagged.tag == MACROS_TAG => {
                    let macros = loader.load_map(tagged.value, "A macros document")?;
                    trace!(count = macros.len(), "loaded macros");
                    self.state.macros.extend(macros);
                }
                Value::Tagged(tagged) if tagged.tag == VARS_TAG => {
                    let variables = loader.load_map(tagged.value, "A vars document")?;
                    let variables = self.resolve_variables(variables)?;
                    trace!(count = variables.len(), "loaded variables");
                    self.state.variables.extend(variables);
                }
                value => match loader.load(value)? {
                    Node::Map(map) => self.doc.extend(map),
                    Node::Null => {}
                    _ => {
                        return Err(TemplateError::validation(
                            "Template documents must be mappings",
                        ))
                    }
                },
            }
        }

        Ok(())
    }

    /// Load a template file; its directory anchors relative paths
    pub fn load_file(&mut self, path: &Path) -> Result<(), TemplateError> {
        let source = fs::read_to_string(path).map_err(|err| TemplateError::io(path, err))?;

        if !self.import_chain.iter().any(|p| p == path) {
            self.import_chain.push(path.to_path_buf());
        }

        let base_dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        self.load_str(&source, base_dir, Some(path))
    }

    /// A Makefile rule making `target` depend on the template and every
    /// file it imported or embedded
    pub fn dependency_line(&self, target: &str, template: &Path) -> String {
        let mut line = format!("{}: {}", target, template.display());
        for path in self
            .state
            .imported_files
            .iter()
            .chain(&self.state.embedded_files)
        {
            line.push(' ');
            line.push_str(&path.display().to_string());
        }
        line
    }

    /// Resolve a variables document against itself until no more progress
    /// is made.
    ///
    /// Variables may reference each other in any order. Names that stay
    /// unresolved are left in place; they only fail once a compile pass
    /// demands their value.
    fn resolve_variables(&mut self, variables: Mapping) -> Result<Mapping, TemplateError> {
        let mut tree = Node::Map(variables);
        let mut previous: Option<BTreeSet<String>> = None;

        loop {
            let pending = tree.unresolved_variables();
            if pending.is_empty() || previous.as_ref() == Some(&pending) {
                if !pending.is_empty() {
                    debug!(?pending, "variables left unresolved");
                }
                break;
            }
            trace!(pending = pending.len(), "resolving variables");

            let mut scope = self.state.variables.clone();
            if let Node::Map(doc) = &tree {
                scope.extend(doc.clone());
            }
            tree = self
                .state
                .process_tree(tree, Some(&scope), ProcessOptions::PARTIAL)?;
            previous = Some(pending);
        }

        match tree {
            Node::Map(map) => Ok(map),
            _ => Ok(Mapping::new()),
        }
    }
}
