//! Filesystem, document, and web tool primitives dispatched by the executor.

pub mod doc;
pub mod error;
pub mod fs;
pub mod web;

pub use error::ToolError;
