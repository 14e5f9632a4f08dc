//! Intermediate Representation (IR) consumed by the offload lowering core
//!
//! This module defines the named-variable IR that upstream loop analysis hands
//! to the lowering core. The IR is designed to be:
//! - Explicit about control flow (labeled basic blocks with terminators)
//! - Typed through a separate, name-keyed type map
//! - Cheap to snapshot (plain owned data, loop nests kept in an index arena)
//! - Easy to splice (labels can be offset and renumbered in bulk)

pub mod types;
pub mod instructions;
pub mod blocks;
pub mod loop_nest;
pub mod functions;
pub mod builder;
pub mod rename;
pub mod insert_dels;
pub mod optimization;
pub mod dump;

pub use types::*;
pub use instructions::*;
pub use blocks::*;
pub use loop_nest::*;
pub use functions::*;
pub use builder::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source location information for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IrSourceLocation {
    pub file_id: u32,
    pub line: u32,
    pub column: u32,
}

impl IrSourceLocation {
    pub fn new(file_id: u32, line: u32, column: u32) -> Self {
        Self {
            file_id,
            line,
            column,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

impl fmt::Display for IrSourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}:{}:{}", self.file_id, self.line, self.column)
        } else {
            write!(f, "<unknown>")
        }
    }
}

/// Whether `name` can appear verbatim in a generated parameter list.
///
/// Legal names are non-empty, start with a letter or underscore and contain
/// only ASCII alphanumerics and underscores.
pub fn is_legal_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_identifiers() {
        assert!(is_legal_identifier("a"));
        assert!(is_legal_identifier("_tmp0"));
        assert!(!is_legal_identifier("$parfor_index.1"));
        assert!(!is_legal_identifier("a.b"));
        assert!(!is_legal_identifier("0abc"));
        assert!(!is_legal_identifier(""));
    }

    #[test]
    fn test_source_location_display() {
        assert_eq!(IrSourceLocation::new(1, 4, 2).to_string(), "1:4:2");
        assert_eq!(IrSourceLocation::unknown().to_string(), "<unknown>");
    }
}
