//! Error types for loading and compiling templates

use std::fmt;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ariadne::{Color, Label, Report, ReportKind, Source};
use thiserror::Error;

use crate::parser::ExpressionError;

/// 1-based position of an error in a template source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

/// What kind of name failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Variable,
    Macro,
    Key,
    Parameter,
    Import,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReferenceKind::Variable => "variable",
            ReferenceKind::Macro => "macro",
            ReferenceKind::Key => "key",
            ReferenceKind::Parameter => "parameter",
            ReferenceKind::Import => "import",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while reading or compiling a template
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Malformed template source
    #[error("{}", format_syntax(message, filename.as_deref(), location.as_ref(), code))]
    Syntax {
        message: String,
        filename: Option<PathBuf>,
        location: Option<Location>,
        code: String,
    },

    /// A variable, macro, parameter or key that could not be found
    #[error("unknown {kind} \"{name}\"")]
    Reference { kind: ReferenceKind, name: String },

    /// Structurally valid input carrying values that make no sense
    #[error("{message}")]
    Validation { message: String },

    /// A file referenced by the template could not be read
    #[error("unable to read \"{}\": {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TemplateError {
    /// Create a syntax error that has not been placed in a source file yet
    pub fn syntax(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            filename: None,
            location: None,
            code: code.into(),
        }
    }

    /// Create a reference error
    pub fn reference(kind: ReferenceKind, name: impl Into<String>) -> Self {
        Self::Reference {
            kind,
            name: name.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an I/O error for a path
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a syntax error from a YAML scanner/parser failure
    pub fn from_yaml(err: serde_yaml::Error, filename: Option<&Path>, source: &str) -> Self {
        let location = err.location().map(|loc| Location {
            line: loc.line(),
            column: loc.column(),
        });
        let code = location
            .and_then(|loc| source.lines().nth(loc.line.saturating_sub(1)))
            .unwrap_or_default()
            .to_string();

        Self::Syntax {
            message: err.to_string(),
            filename: filename.map(Path::to_path_buf),
            location,
            code,
        }
    }

    /// Attach file and position information to a syntax error.
    ///
    /// The position is found by searching `source` for the first non-blank
    /// line of the offending code. Other error kinds pass through untouched.
    pub fn locate(self, filename: Option<&Path>, source: &str) -> Self {
        match self {
            Self::Syntax {
                message,
                filename: None,
                location,
                code,
            } => {
                let location = location.or_else(|| find_code(source, &code));
                Self::Syntax {
                    message,
                    filename: filename.map(Path::to_path_buf),
                    location,
                    code,
                }
            }
            other => other,
        }
    }

    /// Fill in the offending code of a syntax error raised without one
    pub fn with_code(self, code: &str) -> Self {
        match self {
            Self::Syntax {
                message,
                filename,
                location,
                code: existing,
            } if existing.is_empty() => Self::Syntax {
                message,
                filename,
                location,
                code: code.to_string(),
            },
            other => other,
        }
    }

    /// Get the source location if available
    pub fn location(&self) -> Option<Location> {
        match self {
            Self::Syntax { location, .. } => *location,
            _ => None,
        }
    }

    /// Format the error with source context using ariadne
    pub fn format(&self, source: &str, filename: &str) -> String {
        let Self::Syntax {
            message,
            location: Some(location),
            ..
        } = self
        else {
            return self.to_string();
        };

        let span = char_span(source, *location);

        let mut buf = Vec::new();
        let written = Report::build(ReportKind::Error, filename, span.start)
            .with_message(message)
            .with_label(
                Label::new((filename, span))
                    .with_message(message)
                    .with_color(Color::Red),
            )
            .finish()
            .write((filename, Source::from(source)), &mut buf);

        match written {
            Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => self.to_string(),
        }
    }
}

impl From<ExpressionError> for TemplateError {
    fn from(err: ExpressionError) -> Self {
        Self::syntax(err.to_string(), "")
    }
}

fn format_syntax(
    message: &str,
    filename: Option<&Path>,
    location: Option<&Location>,
    code: &str,
) -> String {
    let file = filename
        .map(|f| f.display().to_string())
        .unwrap_or_else(|| "<string>".to_string());
    match location {
        Some(loc) => format!(
            "{} in \"{}\", line {}, column {}:\n{}",
            message, file, loc.line, loc.column, code
        ),
        None => format!("{} in \"{}\":\n{}", message, file, code),
    }
}

/// Find the 1-based line/column of the first non-blank line of `code`
fn find_code(source: &str, code: &str) -> Option<Location> {
    let needle = code.lines().map(str::trim).find(|l| !l.is_empty())?;
    let offset = source.find(needle)?;
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|n| n + 1).unwrap_or(0);
    let column = source[line_start..offset].chars().count() + 1;
    Some(Location { line, column })
}

/// Character range from `location` to the end of its line, as ariadne indexes sources
fn char_span(source: &str, location: Location) -> Range<usize> {
    let offset = byte_offset(source, location);
    let line_end = source[offset..]
        .find('\n')
        .map(|n| offset + n)
        .unwrap_or(source.len());
    let total = source.chars().count();
    let start = source[..offset].chars().count();
    let end = (start + source[offset..line_end].chars().count())
        .max(start + 1)
        .min(total.max(start));
    start..end
}

/// Convert a 1-based line/column into a byte offset
fn byte_offset(source: &str, location: Location) -> usize {
    let line_start: usize = source
        .split_inclusive('\n')
        .take(location.line.saturating_sub(1))
        .map(str::len)
        .sum();
    let line_start = line_start.min(source.len());
    source[line_start..]
        .char_indices()
        .nth(location.column.saturating_sub(1))
        .map(|(i, _)| line_start + i)
        .unwrap_or(source.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_display_with_location() {
        let err = TemplateError::Syntax {
            message: "Unbalanced braces in template".to_string(),
            filename: Some(PathBuf::from("stack.yaml")),
            location: Some(Location { line: 3, column: 5 }),
            code: "<% If (a) { %>".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unbalanced braces in template in \"stack.yaml\", line 3, column 5:\n<% If (a) { %>"
        );
    }

    #[test]
    fn test_locate_finds_scalar() {
        let source = "Resources:\n    key: |\n        <% If (a) { %>\n";
        let err = TemplateError::syntax("Unbalanced braces in template", "<% If (a) { %>\n")
            .locate(Some(Path::new("t.yaml")), source);
        assert_eq!(err.location(), Some(Location { line: 3, column: 9 }));
    }

    #[test]
    fn test_reference_display() {
        let err = TemplateError::reference(ReferenceKind::Macro, "my-macro");
        assert_eq!(err.to_string(), "unknown macro \"my-macro\"");
    }

    #[test]
    fn test_format_falls_back_without_location() {
        let err = TemplateError::validation("bad tag");
        assert_eq!(err.format("", "t.yaml"), "bad tag");
    }

    #[test]
    fn test_format_renders_context() {
        let source = "key: |\n    <% } %>\n";
        let err = TemplateError::syntax("Unexpected block close", "<% } %>").locate(None, source);
        let rendered = err.format(source, "t.yaml");
        assert!(rendered.contains("Unexpected block close"));
    }

    #[test]
    fn test_char_span_counts_characters() {
        let source = "name: é€\nkey: |\n    <% } %>\n";
        let location = Location { line: 3, column: 5 };
        assert_eq!(byte_offset(source, location), 23);
        assert_eq!(char_span(source, location), 20..27);

        let err = TemplateError::syntax("Unexpected block close", "<% } %>").locate(None, source);
        assert_eq!(err.location(), Some(location));
        assert!(err.format(source, "t.yaml").contains("Unexpected block close"));
    }

    #[test]
    fn test_char_span_at_end_of_source() {
        let source = "a: ü";
        assert_eq!(char_span(source, Location { line: 1, column: 5 }), 4..4);
        assert_eq!(char_span(source, Location { line: 1, column: 4 }), 3..4);
    }
}
