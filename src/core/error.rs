// This module defines the error types for the ccgen backend using the thiserror crate. None of
// these are user errors: everything reaching the backend has been accepted by the parser and
// type checker. CodegenError covers arena exhaustion, selection-table misses (an inconsistency
// between the type checker and the instruction tables), structural invariant violations in the
// register table or local-use stack, and tree shapes the backend does not lower. The driver
// treats every variant as fatal for the function being compiled. CodegenResult<T> is the
// convenience alias used throughout the crate.

//! Error types for the ccgen backend.

use thiserror::Error;

/// Internal compiler error raised by the backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("memory limit exceeded: arena holds {bytes} bytes")]
    ResourceExhausted { bytes: usize },

    #[error("no {table} table entry for key {key:#06x}")]
    SelectionMiss { table: &'static str, key: u32 },

    #[error("internal invariant violated: {reason}")]
    InvariantViolation { reason: String },

    #[error("unsupported construct: {what}")]
    Unsupported { what: String },
}

impl CodegenError {
    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }
}

/// Result type alias for backend operations.
pub type CodegenResult<T> = Result<T, CodegenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let miss = CodegenError::SelectionMiss {
            table: "move",
            key: 0x0412,
        };
        assert_eq!(miss.to_string(), "no move table entry for key 0x0412");

        let err = CodegenError::invariant("local-use stack is empty");
        assert_eq!(
            err.to_string(),
            "internal invariant violated: local-use stack is empty"
        );
    }
}
