//! Compile configuration

use std::path::{Path, PathBuf};

/// Configuration for one template compile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileConfig {
    /// Compile for image building: seeds `buildingAMIs` and emits the
    /// per-instance image outputs
    pub for_amis: bool,

    /// Generic stack name used when `Meta.Name` is absent
    pub stack_name: Option<String>,

    /// Directory that relative imports and embedded files resolve against
    pub base_dir: Option<PathBuf>,

    /// Template filename, used in error messages
    pub filename: Option<PathBuf>,
}

impl CompileConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_for_amis(mut self, for_amis: bool) -> Self {
        self.for_amis = for_amis;
        self
    }

    pub fn with_stack_name(mut self, name: impl Into<String>) -> Self {
        self.stack_name = Some(name.into());
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Derive a generic stack name from a template path.
///
/// `web_frontend.v2.yaml` becomes `web-frontend-v2`.
pub fn stack_name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    Some(stem.replace(['_', '.'], "-"))
}
