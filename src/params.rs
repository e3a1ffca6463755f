//! Stack parameter values supplied from a TOML file
//!
//! ```toml
//! [parameters]
//! Environment = "production"
//! KeyName = "ops"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading a parameters file
#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("Failed to read parameters file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse parameters TOML: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Concrete values for a template's parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterValues {
    pub values: HashMap<String, String>,
}

#[derive(Deserialize)]
struct TomlParameters {
    #[serde(default)]
    parameters: HashMap<String, String>,
}

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load parameter values from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ParamsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load parameter values from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ParamsError> {
        let parsed: TomlParameters = toml::from_str(content)?;
        Ok(Self {
            values: parsed.parameters,
        })
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parameters() {
        let params = ParameterValues::from_str(
            r#"
[parameters]
Environment = "production"
KeyName = "ops"
"#,
        )
        .expect("Should parse");
        assert_eq!(params.get("Environment"), Some("production"));
        assert_eq!(params.get("KeyName"), Some("ops"));
        assert_eq!(params.get("Missing"), None);
    }

    #[test]
    fn test_missing_table_is_empty() {
        let params = ParameterValues::from_str("").expect("Should parse");
        assert!(params.values.is_empty());
    }

    #[test]
    fn test_non_string_value_is_error() {
        assert!(ParameterValues::from_str("[parameters]\nCount = 3\n").is_err());
    }
}
