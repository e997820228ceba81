// This module gathers the infrastructure shared by every phase of the ccgen backend. It exports
// the symbol table and C type model the parser hands over, the error taxonomy, the arena-backed
// compilation session, the register table that tracks which DAG values live in which physical
// registers, and the frame manager that lays out locals and temporaries on the local-use stack.
// None of these emit code themselves; the instruction selector and the driver own that.

//! Core ccgen infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based tree allocation using `bumpalo`
//! - Per-unit compilation statistics
//!
//! ## Register Table (`register_file`)
//! - Free / in-use / reserved state per register
//! - Value associations with last-reference tracking for eviction
//!
//! ## Frame Layout (`frame`)
//! - Block-structured local-use stack
//! - Temporary slots reused once their owner is dead

pub mod error;
pub mod frame;
pub mod register_file;
pub mod session;
pub mod symbols;
pub mod test_utils;

pub use error::{CodegenError, CodegenResult};
pub use frame::{FrameManager, LocalUse};
pub use register_file::{RegAllocError, RegId, RegMask, RegisterFile};
pub use session::{CompilationSession, SessionStats};
pub use symbols::{CType, Symbol, SymbolKind, SymbolTable, TyClass};
