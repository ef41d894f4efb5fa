//! The `ASTIndex` external-collaborator interface.
//!
//! Deliberately out of scope per §1: the core only consumes exported-symbol
//! information through this narrow trait. A real implementation would walk
//! a language's AST; the core never does that itself.

use crate::model::file_tracking::SymbolKind;

/// One symbol a file exports, as reported by an `ASTIndex`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedSymbol {
    /// The symbol's name.
    pub name: String,
    /// The symbol's kind.
    pub kind: SymbolKind,
}

/// Maps modified files to the symbols they export.
///
/// If no index is available, implementations should prefer returning an
/// empty result from `exported_symbols` over erroring — per the spec,
/// `DetectSemanticConflicts` must degrade to an empty, well-formed result
/// rather than fail when this collaborator is unavailable.
pub trait AstIndex {
    /// Return the symbols `path` exports, or an empty vec if the index has
    /// no information about it (unsupported language, file not indexed,
    /// index unavailable).
    fn exported_symbols(&self, path: &str) -> Vec<ExportedSymbol>;
}

/// An `AstIndex` that always reports no symbols — the default when no real
/// index is wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAstIndex;

impl AstIndex for NullAstIndex {
    fn exported_symbols(&self, _path: &str) -> Vec<ExportedSymbol> {
        Vec::new()
    }
}
