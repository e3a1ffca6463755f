//! Stackweave - a template language that compiles to CloudFormation
//!
//! Templates are YAML documents extended with variables (`$$name`),
//! references (`@@Resource`), inline functions (`<% GetAZs() %>`),
//! `If`/`ElseIf`/`Else` blocks, macros and file imports.
//!
//! # Example
//!
//! ```rust
//! use stackweave::compile;
//!
//! let json = compile("Resources:\n    Logs:\n        Type: AWS::S3::Bucket\n").unwrap();
//! assert!(json.contains("\"AWSTemplateFormatVersion\": \"2010-09-09\""));
//! ```

pub mod compiler;
pub mod config;
pub mod error;
pub mod params;
pub mod parser;
pub mod template;

pub use compiler::{AmiOutput, AmiOutputKeys, CompiledTemplate, TemplateCompiler};
pub use config::CompileConfig;
pub use error::{Location, ReferenceKind, TemplateError};
pub use params::{ParameterValues, ParamsError};
pub use template::{Node, TemplateReader, TemplateState};

/// Compile template source to CloudFormation JSON with default configuration
///
/// # Example
///
/// ```rust
/// use stackweave::compile;
///
/// let json = compile(r#"
/// Resources:
///     Web:
///         Type: AWS::EC2::Instance
///         Properties:
///             AvailabilityZone: <% Select(0, GetAZs("")) %>
///             UserData: "@@Bootstrap"
/// "#).unwrap();
///
/// assert!(json.contains("Fn::Select"));
/// assert!(json.contains("\"Ref\": \"Bootstrap\""));
/// ```
pub fn compile(source: &str) -> Result<String, TemplateError> {
    compile_with_config(source, CompileConfig::default())
}

/// Compile template source to CloudFormation JSON with custom configuration
///
/// # Example
///
/// ```rust
/// use stackweave::{compile_with_config, CompileConfig};
///
/// let config = CompileConfig::new().with_for_amis(true);
/// let json = compile_with_config(
///     "Outputs:\n    Building:\n        Value: $$buildingAMIs\n",
///     config,
/// )
/// .unwrap();
/// assert!(json.contains("\"Value\": \"true\""));
/// ```
pub fn compile_with_config(source: &str, config: CompileConfig) -> Result<String, TemplateError> {
    TemplateCompiler::new(config).compile_str(source)?.to_json()
}
