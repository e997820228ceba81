// This module provides arena-based session management for a translation unit using the bumpalo
// crate. CompilationSession owns a borrow of the arena that holds the parser's expression and
// statement trees, so every tree handed to the backend shares one lifetime and is released in
// one step when the unit is done. The session builds trees through TreeBuilder, drives one
// CodegenContext per function, and accumulates SessionStats across the unit (functions compiled,
// instructions emitted, common subexpressions found, DAG resets, spills, reloads, evictions and
// pruned blocks). An optional memory limit makes compile refuse, with ResourceExhausted, once
// the arena holds more than the limit; the arena itself is never capped, so tree building cannot
// abort part way.

//! Arena-based compilation session management.

use super::error::{CodegenError, CodegenResult};
use super::symbols::SymbolTable;
use crate::codegen::{CodegenContext, CompiledFunction};
use crate::tree::{FunctionDef, TreeBuilder};
use bumpalo::Bump;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::fmt;

/// Arena-backed session for one translation unit.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    memory_limit: Option<usize>,
    stats: RefCell<SessionStats>,
    current_function: RefCell<Option<String>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            memory_limit: None,
            stats: RefCell::new(SessionStats::default()),
            current_function: RefCell::new(None),
        }
    }

    /// Session that stops compiling once the arena holds more than `limit` bytes.
    pub fn with_memory_limit(arena: &'arena Bump, limit: usize) -> Self {
        Self {
            memory_limit: Some(limit),
            ..Self::new(arena)
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }

    fn check_memory(&self) -> CodegenResult<()> {
        let used = self.memory_used();
        match self.memory_limit {
            Some(limit) if used > limit => {
                warn!("arena holds {used} bytes, limit is {limit}");
                Err(CodegenError::ResourceExhausted { bytes: used })
            }
            _ => Ok(()),
        }
    }

    /// Tree builder over this session's arena.
    pub fn builder<'s>(&self, symbols: &'s mut SymbolTable) -> TreeBuilder<'arena, 's> {
        TreeBuilder::new(self.arena, symbols)
    }

    pub fn current_function(&self) -> Option<String> {
        self.current_function.borrow().clone()
    }

    /// Compile one function and fold its counters into the session totals.
    pub fn compile(
        &self,
        ctx: &mut CodegenContext<'_>,
        def: &FunctionDef<'_>,
    ) -> CodegenResult<CompiledFunction> {
        let name = ctx.symbols().name(def.name).to_string();
        *self.current_function.borrow_mut() = Some(name.clone());
        self.check_memory()?;
        let compiled = ctx.compile_function(def)?;
        self.record_function(&compiled);
        info!(
            "compiled {name}: {} instructions, frame {} bytes",
            compiled.code.len(),
            compiled.frame_size
        );
        Ok(compiled)
    }

    pub fn record_function(&self, compiled: &CompiledFunction) {
        let mut stats = self.stats.borrow_mut();
        let f = &compiled.stats;
        stats.functions_compiled += 1;
        stats.instructions_emitted += f.instructions;
        stats.cse_hits += f.cse_hits;
        stats.dag_resets += f.dag_resets;
        stats.spills += f.spills;
        stats.reloads += f.reloads;
        stats.evictions += f.evictions;
        stats.pruned_blocks += f.pruned_blocks;
        stats.frame_bytes += compiled.frame_size as u64;
        debug!("session totals: {:?}", *stats);
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Bytes the arena currently holds.
    pub fn memory_used(&self) -> usize {
        self.arena.allocated_bytes()
    }
}

/// Totals over every function compiled in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub functions_compiled: u64,
    pub instructions_emitted: u64,
    pub cse_hits: u64,
    pub dag_resets: u64,
    pub spills: u64,
    pub reloads: u64,
    pub evictions: u64,
    pub pruned_blocks: u64,
    pub frame_bytes: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Common subexpressions: {}", self.cse_hits)?;
        writeln!(f, "  DAG resets: {}", self.dag_resets)?;
        writeln!(f, "  Spills: {}", self.spills)?;
        writeln!(f, "  Reloads: {}", self.reloads)?;
        writeln!(f, "  Evictions: {}", self.evictions)?;
        writeln!(f, "  Pruned blocks: {}", self.pruned_blocks)?;
        write!(f, "  Frame bytes: {}", self.frame_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Opcode;
    use crate::codegen::CodegenOptions;
    use crate::core::symbols::CType;
    use crate::core::test_utils::test::TestContext;
    use crate::tree::BinaryOp;

    #[test]
    fn test_session_accumulates_stats() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut symbols = SymbolTable::new();
        let f = symbols.function("seven", CType::Int);

        let mut tb = session.builder(&mut symbols);
        let seven = tb.int(7);
        let ret = tb.ret(Some(seven));
        let body = tb.block(&[], &[ret]);
        let def = tb.function(f, &[], body);

        let mut ctx = CodegenContext::new(&mut symbols, CodegenOptions::default());
        session.compile(&mut ctx, def).unwrap();
        session.compile(&mut ctx, def).unwrap();

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 2);
        assert!(stats.instructions_emitted >= 8);
        assert_eq!(session.current_function().as_deref(), Some("seven"));
        assert!(stats.to_string().contains("Functions compiled: 2"));
    }

    fn build_sum<'a>(
        session: &CompilationSession<'a>,
        symbols: &mut SymbolTable,
    ) -> &'a FunctionDef<'a> {
        let f = symbols.function("sum", CType::Int);
        let mut tb = session.builder(symbols);
        let mut total = tb.int(0);
        for i in 1..=200 {
            let k = tb.int(i);
            total = tb.binary(BinaryOp::Add, total, k);
        }
        let ret = tb.ret(Some(total));
        let body = tb.block(&[], &[ret]);
        tb.function(f, &[], body)
    }

    #[test]
    fn test_memory_limit_is_reported() {
        let arena = Bump::new();
        let session = CompilationSession::with_memory_limit(&arena, 64);
        let mut symbols = SymbolTable::new();
        let def = build_sum(&session, &mut symbols);
        assert!(session.memory_used() > 64);

        let mut ctx = CodegenContext::new(&mut symbols, CodegenOptions::default());
        let err = session.compile(&mut ctx, def).unwrap_err();
        assert!(matches!(err, CodegenError::ResourceExhausted { bytes } if bytes > 64));
        assert!(err.to_string().contains("memory limit exceeded"));
        assert_eq!(session.stats().functions_compiled, 0);
    }

    #[test]
    fn test_memory_limit_allows_small_units() {
        let arena = Bump::new();
        let session = CompilationSession::with_memory_limit(&arena, 1 << 20);
        assert_eq!(session.memory_limit(), Some(1 << 20));
        let mut symbols = SymbolTable::new();
        let def = build_sum(&session, &mut symbols);

        let mut ctx = CodegenContext::new(&mut symbols, CodegenOptions::default());
        session.compile(&mut ctx, def).unwrap();
        assert_eq!(session.stats().functions_compiled, 1);
    }

    #[test]
    fn test_session_over_test_context() {
        let ctx = TestContext::new();
        let mut symbols = SymbolTable::new();
        let f = symbols.function("nothing", CType::Void);
        let compiled = ctx.with_session(|session| {
            let def = {
                let mut tb = session.builder(&mut symbols);
                let body = tb.block(&[], &[]);
                tb.function(f, &[], body)
            };
            let mut cg = CodegenContext::new(&mut symbols, CodegenOptions::default());
            session.compile(&mut cg, def).unwrap()
        });
        assert_eq!(compiled.count(Opcode::Ret), 1);
        assert_eq!(compiled.frame_size, 0);
        assert!(ctx.arena().allocated_bytes() > 0);
    }
}
