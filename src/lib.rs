//! ccgen - code generation backend for a small C compiler.
//!
//! ccgen turns type-checked expression and statement trees into a
//! register-allocated pseudo-assembly instruction stream. Trees are
//! canonicalized into straight-line IR codes (control flow made explicit as
//! labels and jumps), split into basic blocks, numbered into a DAG so common
//! subexpressions are computed once, and finally selected into instructions
//! with registers allocated on the fly.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use ccgen::core::{CompilationSession, CType, SymbolTable};
//! use ccgen::codegen::{CodegenContext, CodegenOptions};
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut symbols = SymbolTable::new();
//! let f = symbols.function("f", CType::Int);
//!
//! let mut tb = session.builder(&mut symbols);
//! let one = tb.int(1);
//! let ret = tb.ret(Some(one));
//! let body = tb.block(&[], &[ret]);
//! let def = tb.function(f, &[], body);
//!
//! let mut ctx = CodegenContext::new(&mut symbols, CodegenOptions::default());
//! let compiled = session.compile(&mut ctx, def)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Symbols, types, errors, session, registers and frame layout
//! - [`tree`] - Input expression and statement trees
//! - [`canon`] - Canonicalization into IR codes and basic blocks
//! - [`dag`] - Value-numbered DAG with common-subexpression elimination
//! - [`isel`] - Table-driven instruction selection and register allocation
//! - [`codegen`] - Per-function driver
//! - [`asm`] - Pseudo-assembly operands and instruction list
//! - [`vm`] - Reference interpreter for compiled code

pub mod asm;
pub mod canon;
pub mod codegen;
pub mod core;
pub mod dag;
pub mod isel;
pub mod tree;
pub mod vm;

pub use asm::{Address, Instr, InstrList, Opcode, Operand};
pub use canon::{Canonicalizer, FunctionIr, IrCode};
pub use codegen::{CodegenContext, CodegenOptions, CompiledFunction, FunctionStats};
pub use core::{
    CType, CodegenError, CodegenResult, CompilationSession, SessionStats, Symbol, SymbolKind,
    SymbolTable, TyClass,
};
pub use dag::{Cond, Op};
pub use tree::{BinaryOp, Expr, FunctionDef, Stmt, TreeBuilder, UnaryOp};
pub use vm::{Machine, Value, VmError};
