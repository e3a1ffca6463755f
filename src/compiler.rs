//! Top-level compile pass producing CloudFormation JSON

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::config::{stack_name_from_path, CompileConfig};
use crate::error::{ReferenceKind, TemplateError};
use crate::params::ParameterValues;
use crate::template::{Mapping, Node, ProcessOptions, TagTable, TemplateReader};

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Output sections, in emission order
pub const SECTIONS: [&str; 5] = ["Parameters", "Mappings", "Conditions", "Resources", "Outputs"];

/// Variable telling templates whether this compile builds images
pub const BUILDING_AMIS_VAR: &str = "buildingAMIs";

/// Resource metadata key holding compiler annotations
pub const METADATA_KEY: &str = "Stackweave";

const META_SECTION: &str = "Meta";
const INSTANCE_TYPE: &str = "AWS::EC2::Instance";

/// Output keys generated for one image-producing instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmiOutputKeys {
    pub instance_id_key: String,
    pub name_format_key: String,
    pub previous_ami_key: Option<String>,
}

/// An instance whose image is built from the stack outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmiOutput {
    pub resource_name: String,
    pub keys: AmiOutputKeys,
}

/// The result of a compile
#[derive(Debug, Clone, Default)]
pub struct CompiledTemplate {
    /// The CloudFormation document, keys in emission order
    pub doc: Map<String, Value>,
    /// The resolved `Meta` section
    pub meta: Map<String, Value>,
    pub ami_outputs: Vec<AmiOutput>,
    /// `LookupFromStack` annotations, keyed by parameter name
    pub stack_param_lookups: IndexMap<String, Value>,
    /// Whether each parameter must be given a value
    pub required_params: IndexMap<String, bool>,
    pub imported_files: BTreeSet<PathBuf>,
    pub embedded_files: BTreeSet<PathBuf>,
}

/// Compiles templates into CloudFormation documents
#[derive(Debug, Clone, Default)]
pub struct TemplateCompiler {
    config: CompileConfig,
    tags: TagTable,
}

impl TemplateCompiler {
    pub fn new(config: CompileConfig) -> Self {
        Self {
            config,
            tags: TagTable::default(),
        }
    }

    /// Use a custom tag table instead of the built-in handlers
    pub fn with_tags(mut self, tags: TagTable) -> Self {
        self.tags = tags;
        self
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Compile template source text
    pub fn compile_str(&self, source: &str) -> Result<CompiledTemplate, TemplateError> {
        let mut reader = self.reader();
        reader.load_str(
            source,
            self.config.base_dir.as_deref(),
            self.config.filename.as_deref(),
        )?;
        self.assemble(reader, self.config.stack_name.clone())
    }

    /// Compile a template file.
    ///
    /// Without a configured stack name, the name is derived from the file
    /// name.
    pub fn compile_file(&self, path: &Path) -> Result<CompiledTemplate, TemplateError> {
        let mut reader = self.reader();
        reader.load_file(path)?;
        let stack_name = self
            .config
            .stack_name
            .clone()
            .or_else(|| stack_name_from_path(path));
        self.assemble(reader, stack_name)
    }

    fn reader(&self) -> TemplateReader {
        let mut reader = TemplateReader::with_tags(self.tags.clone());
        let flag = if self.config.for_amis { "true" } else { "false" };
        reader
            .state
            .variables
            .insert(BUILDING_AMIS_VAR, Node::str(flag));
        reader
    }

    fn assemble(
        &self,
        reader: TemplateReader,
        stack_name: Option<String>,
    ) -> Result<CompiledTemplate, TemplateError> {
        let TemplateReader {
            mut doc, mut state, ..
        } = reader;
        let globals = state.variables.clone();

        let mut out = Map::new();
        out.insert(
            "AWSTemplateFormatVersion".to_string(),
            Value::String(TEMPLATE_FORMAT_VERSION.to_string()),
        );

        let meta = match doc.remove(META_SECTION) {
            Some(node) => state
                .process_tree(node, Some(&globals), ProcessOptions::VARIABLES)?
                .to_json()?,
            None => Value::Null,
        };
        let mut meta = match meta {
            Value::Object(meta) => meta,
            Value::Null => Map::new(),
            _ => return Err(TemplateError::validation("The Meta section must be a mapping")),
        };

        if !meta.contains_key("Name") {
            if let Some(name) = stack_name {
                meta.insert("Name".to_string(), Value::String(name));
            }
        }

        if let Some(description) = meta.get("Description") {
            let mut description = scalar_string(description, "Meta.Description")?;
            if let Some(version) = meta.get("Version") {
                description.push_str(&format!(" [v{}]", scalar_string(version, "Meta.Version")?));
            }
            out.insert("Description".to_string(), Value::String(description));
        }

        for section in SECTIONS {
            let node = doc.remove(section).unwrap_or(Node::Map(Mapping::new()));
            let options = match section {
                "Conditions" | "Resources" => ProcessOptions::COMPILE,
                _ => ProcessOptions::VARIABLES,
            };
            let value = match state.process_tree(node, Some(&globals), options)?.to_json()? {
                Value::Null => Value::Object(Map::new()),
                value => value,
            };
            out.insert(section.to_string(), value);
        }

        for (key, _) in doc.iter() {
            trace!(key = ?key, "ignoring unknown top-level key");
        }

        let conditions = std::mem::take(&mut state.conditions);
        if !conditions.is_empty() {
            debug!(count = conditions.len(), "merging materialized conditions");
            let section = section_mut(&mut out, "Conditions")?;
            for (name, expr) in conditions {
                section.insert(name, expr.to_json()?);
            }
        }

        let mut compiled = CompiledTemplate {
            meta,
            imported_files: state.imported_files,
            embedded_files: state.embedded_files,
            ..CompiledTemplate::default()
        };

        compiled.post_process_params(section_mut(&mut out, "Parameters")?)?;

        let candidates = scan_ami_metadata(section_mut(&mut out, "Resources")?)?;
        if self.config.for_amis && !candidates.is_empty() {
            let outputs = section_mut(&mut out, "Outputs")?;
            for candidate in candidates {
                compiled.ami_outputs.push(candidate.add_outputs(outputs));
            }
        }

        out.retain(|key, value| {
            !(SECTIONS.contains(&key.as_str()) && value.as_object().is_some_and(Map::is_empty))
        });
        compiled.doc = out;

        Ok(compiled)
    }
}

impl CompiledTemplate {
    /// The generic stack name, from `Meta.Name` or the compile default
    pub fn name(&self) -> Option<&str> {
        self.meta.get("Name").and_then(Value::as_str)
    }

    /// Pretty-print the document with four-space indentation
    pub fn to_json(&self) -> Result<String, TemplateError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.doc
            .serialize(&mut serializer)
            .map_err(|err| TemplateError::validation(err.to_string()))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Resolve the stack tags declared in `Meta.Tags`.
    ///
    /// `GenericStackName` and `StackVersion` come first. Tags given as
    /// `{Ref: Param}` take their value from `params`.
    pub fn resolve_tags(
        &self,
        params: &ParameterValues,
    ) -> Result<IndexMap<String, String>, TemplateError> {
        let mut tags = IndexMap::new();

        if let Some(name) = self.meta.get("Name") {
            tags.insert(
                "GenericStackName".to_string(),
                scalar_string(name, "Meta.Name")?,
            );
        }
        if let Some(version) = self.meta.get("Version") {
            tags.insert(
                "StackVersion".to_string(),
                scalar_string(version, "Meta.Version")?,
            );
        }

        match self.meta.get("Tags") {
            None | Some(Value::Null) => {}
            Some(Value::Object(declared)) => {
                for (name, value) in declared {
                    tags.insert(name.clone(), tag_value(name, value, params)?);
                }
            }
            // The `!tags` form: a list of {Key, Value} pairs
            Some(Value::Array(declared)) => {
                for entry in declared {
                    let name = entry
                        .get("Key")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            TemplateError::validation(format!(
                                "Invalid entry {} found in the stack metadata tags",
                                entry
                            ))
                        })?;
                    let value = entry.get("Value").unwrap_or(&Value::Null);
                    tags.insert(name.to_string(), tag_value(name, value, params)?);
                }
            }
            Some(_) => return Err(TemplateError::validation("Meta.Tags must be a mapping")),
        }

        Ok(tags)
    }

    /// Move parameter annotations out of the parameter definitions
    fn post_process_params(&mut self, params: &mut Map<String, Value>) -> Result<(), TemplateError> {
        for (name, param) in params.iter_mut() {
            let Value::Object(param) = param else {
                return Err(TemplateError::validation(format!(
                    "Parameter \"{}\" must be a mapping",
                    name
                )));
            };

            if let Some(lookup) = param.shift_remove("LookupFromStack") {
                if !lookup.is_null() {
                    self.stack_param_lookups.insert(name.clone(), lookup);
                }
            }

            let required = match param.shift_remove("Required") {
                None => true,
                Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
                Some(other) => {
                    return Err(TemplateError::validation(format!(
                        "Invalid Required value {} for parameter \"{}\"",
                        other, name
                    )))
                }
            };
            self.required_params.insert(name.clone(), required);
        }

        Ok(())
    }
}

/// An annotated instance found while scanning resources
struct AmiCandidate {
    resource_name: String,
    name_format: Value,
    previous_ami: Option<Value>,
}

impl AmiCandidate {
    fn add_outputs(self, outputs: &mut Map<String, Value>) -> AmiOutput {
        let name = &self.resource_name;
        let keys = AmiOutputKeys {
            instance_id_key: format!("{}{}InstanceID", METADATA_KEY, name),
            name_format_key: format!("{}{}AMINameFormat", METADATA_KEY, name),
            previous_ami_key: self
                .previous_ami
                .as_ref()
                .map(|_| format!("{}{}PreviousAMI", METADATA_KEY, name)),
        };

        outputs.insert(
            keys.instance_id_key.clone(),
            output(
                format!("Instance ID for {}", name),
                serde_json::json!({ "Ref": name }),
            ),
        );
        outputs.insert(
            keys.name_format_key.clone(),
            output(format!("Name format for the AMI for {}", name), self.name_format),
        );
        if let (Some(key), Some(previous)) = (&keys.previous_ami_key, self.previous_ami) {
            outputs.insert(
                key.clone(),
                output(format!("Previous AMI ID created for {}", name), previous),
            );
        }

        debug!(resource = %name, "added image outputs");
        AmiOutput {
            resource_name: self.resource_name,
            keys,
        }
    }
}

fn scan_ami_metadata(resources: &Map<String, Value>) -> Result<Vec<AmiCandidate>, TemplateError> {
    let mut candidates = Vec::new();

    for (name, resource) in resources {
        let Some(resource) = resource.as_object() else {
            continue;
        };
        if resource.get("Type").and_then(Value::as_str) != Some(INSTANCE_TYPE) {
            continue;
        }
        let Some(metadata) = resource
            .get("Metadata")
            .and_then(|m| m.get(METADATA_KEY))
        else {
            continue;
        };
        let metadata = metadata.as_object().ok_or_else(|| {
            TemplateError::validation(format!(
                "Metadata.{} for \"{}\" must be a mapping",
                METADATA_KEY, name
            ))
        })?;

        if let Some(name_format) = metadata.get("AMINameFormat") {
            candidates.push(AmiCandidate {
                resource_name: name.clone(),
                name_format: name_format.clone(),
                previous_ami: metadata.get("PreviousAMI").cloned(),
            });
        }
    }

    Ok(candidates)
}

fn output(description: String, value: Value) -> Value {
    let mut output = Map::new();
    output.insert("Description".to_string(), Value::String(description));
    output.insert("Value".to_string(), value);
    Value::Object(output)
}

fn section_mut<'a>(
    doc: &'a mut Map<String, Value>,
    name: &str,
) -> Result<&'a mut Map<String, Value>, TemplateError> {
    match doc
        .entry(name)
        .or_insert_with(|| Value::Object(Map::new()))
    {
        Value::Object(section) => Ok(section),
        _ => Err(TemplateError::validation(format!(
            "The {} section must be a mapping",
            name
        ))),
    }
}

fn scalar_string(value: &Value, what: &str) -> Result<String, TemplateError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TemplateError::validation(format!("{} must be a string", what)))
}

fn tag_value(name: &str, value: &Value, params: &ParameterValues) -> Result<String, TemplateError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Object(obj) if obj.len() == 1 && obj.contains_key("Ref") => {
            let param = obj.get("Ref").and_then(Value::as_str).unwrap_or_default();
            params
                .get(param)
                .map(str::to_string)
                .ok_or_else(|| TemplateError::reference(ReferenceKind::Parameter, param))
        }
        other => Err(TemplateError::validation(format!(
            "Invalid value {} for tag \"{}\" found in the stack metadata",
            other, name
        ))),
    }
}
