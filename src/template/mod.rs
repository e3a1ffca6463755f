//! Template loading and variable resolution
//!
//! A template is a stream of YAML documents. `--- !macros` documents define
//! reusable content, `--- !vars` documents define variables, and every other
//! document contributes to the template tree.
//!
//! # Example
//!
//! ```text
//! --- !vars
//! env: prod
//!
//! --- !macros
//! bucket:
//!     defaultParams:
//!         suffix: data
//!     content:
//!         Type: AWS::S3::Bucket
//!         Properties:
//!             BucketName: $$env-$$suffix
//!
//! ---
//! Resources:
//!     Data: !call-macro
//!         macro: bucket
//! ```

mod loader;
mod node;
mod reader;
mod state;
mod yaml;

pub use loader::{DocumentLoader, TagHandler, TagTable, MERGE_KEY};
pub use node::{Key, KeyPart, List, ListKind, Mapping, Node};
pub use reader::{TemplateReader, MACROS_TAG, VARS_TAG};
pub use state::{ProcessOptions, TemplateState};
