// This module drives code generation for one function at a time. CodegenContext owns every piece
// of per-function mutable state (the DAG pool, the register table, the local-use stack and the
// instruction list) and is reset at the start of each function, so a context can be reused across
// a translation unit and separate contexts can compile different functions independently. The
// pipeline is: canonicalize the tree into IR codes, split the codes into basic blocks, optionally
// prune unreachable blocks, number values into the DAG (recording last-reference positions and
// pending-use counts), then walk the surviving codes in order and select instructions, allocating
// registers on the fly. The frame-enter instruction is patched with the final frame size at the end.

//! Per-function code generation driver.

use crate::asm::{Instr, InstrId, InstrList, Opcode};
use crate::canon::blocks::Cfg;
use crate::canon::{Canonicalizer, FunctionIr, IrCode, LinId};
use crate::core::error::{CodegenError, CodegenResult};
use crate::core::frame::FrameManager;
use crate::core::register_file::RegisterFile;
use crate::core::symbols::{CType, Symbol, SymbolTable, TyClass};
use crate::dag::{DagPool, NodeId, Op};
use crate::isel::tables::SelectionTables;
use crate::isel::HeldValue;
use crate::tree::FunctionDef;
use log::{debug, log_enabled, trace, Level};

/// Knobs for one code generation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Drop blocks with no path from the function entry.
    pub prune_unreachable: bool,
    /// Hash-table entries the DAG pool holds before forcing a reset.
    pub dag_capacity: usize,
    /// Log every emitted instruction at debug level instead of trace.
    pub trace_listing: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            prune_unreachable: true,
            dag_capacity: DagPool::DEFAULT_CAPACITY,
            trace_listing: false,
        }
    }
}

/// Counters for one compiled function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionStats {
    pub instructions: u64,
    pub cse_hits: u64,
    pub dag_resets: u64,
    pub spills: u64,
    pub reloads: u64,
    pub evictions: u64,
    pub pruned_blocks: u64,
}

/// Selected code for one function, ready for the textual emitter.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: Symbol,
    pub ret: CType,
    pub params: Vec<Symbol>,
    pub code: InstrList,
    pub frame_size: u32,
    pub blocks: usize,
    pub stats: FunctionStats,
}

impl CompiledFunction {
    pub fn instrs(&self) -> impl Iterator<Item = &Instr> {
        self.code.iter()
    }

    /// Number of instructions with the given opcode.
    pub fn count(&self, op: Opcode) -> usize {
        self.code.iter().filter(|i| i.op == op).count()
    }

    pub fn listing(&self, symbols: &SymbolTable) -> String {
        format!("{}:\n{}", symbols.name(self.name), self.code.listing(symbols))
    }
}

/// Per-function code generation state.
pub struct CodegenContext<'s> {
    pub(crate) symbols: &'s mut SymbolTable,
    pub(crate) dag: DagPool,
    pub(crate) regs: RegisterFile,
    pub(crate) frame: FrameManager,
    pub(crate) code: InstrList,
    pub(crate) tables: SelectionTables,
    /// Index of the IR code being selected.
    pub(crate) seq: u32,
    pub(crate) stats: FunctionStats,
    /// Register operands waiting for their consumer, oldest first.
    pub(crate) held: Vec<HeldValue>,
    dag_of: Vec<Option<NodeId>>,
    enter: Option<InstrId>,
    options: CodegenOptions,
}

impl<'s> CodegenContext<'s> {
    pub fn new(symbols: &'s mut SymbolTable, options: CodegenOptions) -> Self {
        Self {
            symbols,
            dag: DagPool::new(options.dag_capacity),
            regs: RegisterFile::new(),
            frame: FrameManager::new(),
            code: InstrList::new(),
            tables: SelectionTables::new(),
            seq: 0,
            stats: FunctionStats::default(),
            held: Vec::new(),
            dag_of: Vec::new(),
            enter: None,
            options,
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        self.symbols
    }

    pub fn options(&self) -> CodegenOptions {
        self.options
    }

    /// Forget all per-function state.
    pub fn reset(&mut self) {
        self.dag.clear();
        self.regs.reset();
        self.frame.reset();
        self.code = InstrList::new();
        self.seq = 0;
        self.stats = FunctionStats::default();
        self.held.clear();
        self.dag_of.clear();
        self.enter = None;
    }

    /// Canonicalize and compile one function definition.
    pub fn compile_function(&mut self, def: &FunctionDef<'_>) -> CodegenResult<CompiledFunction> {
        debug!("compiling {}", self.symbols.name(def.name));
        let ir = Canonicalizer::new(self.symbols).function(def)?;
        self.compile_ir(&ir)
    }

    /// Compile an already canonicalized function.
    pub fn compile_ir(&mut self, ir: &FunctionIr) -> CodegenResult<CompiledFunction> {
        self.reset();
        let mut cfg = Cfg::build(&ir.codes, ir.exit)?;
        if self.options.prune_unreachable {
            self.stats.pruned_blocks = cfg.prune_unreachable() as u64;
        }
        self.number_values(ir, &cfg)?;
        let dag_stats = self.dag.stats();
        self.stats.cse_hits = dag_stats.hits;
        self.stats.dag_resets = dag_stats.resets;

        for &param in &ir.params {
            self.frame.bind_param(param, self.symbols);
        }

        for block in cfg.blocks() {
            for idx in block.codes.clone() {
                self.seq = idx as u32;
                let code = &ir.codes[idx];
                if block.reachable {
                    self.select_code(ir, idx)?;
                } else if code.is_structural() {
                    // Frame layout must stay balanced even across removed code.
                    self.structural(code)?;
                }
            }
        }

        let frame_size = self.frame.max_size();
        if let Some(enter) = self.enter.and_then(|id| self.code.get_mut(id)) {
            enter.bytes = frame_size;
        }
        debug!(
            "{}: {} instructions, frame {} bytes, {} blocks",
            self.symbols.name(ir.name),
            self.code.len(),
            frame_size,
            cfg.len()
        );

        Ok(CompiledFunction {
            name: ir.name,
            ret: ir.ret,
            params: ir.params.clone(),
            code: std::mem::take(&mut self.code),
            frame_size,
            blocks: cfg.reachable().count(),
            stats: self.stats,
        })
    }

    /// Build the DAG for the reachable codes and record, for every node, the
    /// last code that consumes it and how many consumptions are pending.
    fn number_values(&mut self, ir: &FunctionIr, cfg: &Cfg) -> CodegenResult<()> {
        self.dag_of = vec![None; ir.lin.len()];
        let mut visited = Vec::new();
        for block in cfg.reachable() {
            for idx in block.codes.clone() {
                let seq = idx as u32;
                match &ir.codes[idx] {
                    IrCode::Label(_) => self.dag.reset_pool(),
                    IrCode::Eval(lin) => {
                        let id = self.intern(ir, *lin)?;
                        let node = self.dag.node(id);
                        match node.op {
                            Op::Assign => {
                                let target = node.kids[0].map(|k| self.dag.node(k));
                                let known = target
                                    .filter(|t| t.op == Op::Addr)
                                    .and_then(|t| t.sym);
                                self.count_uses(id, seq, true, &mut visited);
                                match known {
                                    Some(sym) => self.dag.invalidate(sym),
                                    None => self.dag.reset_pool(),
                                }
                            }
                            Op::Call => {
                                self.count_uses(id, seq, true, &mut visited);
                                self.dag.reset_pool();
                            }
                            _ => {}
                        }
                    }
                    IrCode::Arg(lin) | IrCode::Return(Some(lin)) | IrCode::ZeroFill { addr: lin, .. } => {
                        let id = self.node_of(*lin)?;
                        self.count_uses(id, seq, false, &mut visited);
                    }
                    IrCode::Branch { cond, .. } => {
                        let id = self.node_of(*cond)?;
                        self.count_uses(id, seq, true, &mut visited);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn intern(&mut self, ir: &FunctionIr, lin: LinId) -> CodegenResult<NodeId> {
        let n = ir.node(lin);
        let kid = |k: Option<LinId>| -> CodegenResult<Option<NodeId>> {
            k.map(|k| self.node_of(k)).transpose()
        };
        let kids = [kid(n.kids[0])?, kid(n.kids[1])?];
        let id = if n.op.has_side_effect() {
            self.dag.fresh(n.op, n.ty, kids, n.sym, n.aux)
        } else {
            match (kids, n.sym) {
                ([None, None], Some(sym)) => self.dag.intern_leaf(n.op, n.ty, sym),
                ([Some(k), None], _) => self.dag.intern_unary(n.op, n.ty, k),
                ([Some(l), Some(r)], sym) => self.dag.intern_binary(n.op, n.ty, l, r, sym),
                _ => {
                    return Err(CodegenError::invariant(format!(
                        "malformed linear node {:?}",
                        n.op
                    )))
                }
            }
        };
        self.dag_of[lin.index()] = Some(id);
        Ok(id)
    }

    /// Count one consumption of `id` at `seq` (roots are not consumed, only
    /// their operands). Selection re-enters a node's children only when it
    /// computes the node, so children are counted on the first visit, and
    /// on every visit for nodes that are recomputed at each use.
    fn count_uses(&mut self, id: NodeId, seq: u32, root: bool, visited: &mut Vec<bool>) {
        let passes = self.dag.passes_through(id);
        let node = self.dag.node_mut(id);
        node.last_ref = node.last_ref.max(seq);
        if !root {
            node.pending_uses += 1;
        }
        let side_effect = node.op.has_side_effect();
        let kids = node.kids;

        if visited.len() <= id.index() {
            visited.resize(id.index() + 1, false);
        }
        let first = !visited[id.index()];
        visited[id.index()] = true;

        if root || (!side_effect && (first || passes)) {
            for kid in kids.into_iter().flatten() {
                self.count_uses(kid, seq, false, visited);
            }
        }
    }

    pub(crate) fn node_of(&self, lin: LinId) -> CodegenResult<NodeId> {
        self.dag_of
            .get(lin.index())
            .copied()
            .flatten()
            .ok_or_else(|| {
                CodegenError::invariant(format!("linear node {} was never numbered", lin.index()))
            })
    }

    /// Append an instruction at the current sequence position.
    pub(crate) fn emit(&mut self, mut instr: Instr) -> InstrId {
        instr.seq = self.seq;
        if self.options.trace_listing {
            debug!("{}", instr.listing(self.symbols));
        } else if log_enabled!(Level::Trace) {
            trace!("{}", instr.listing(self.symbols));
        }
        self.stats.instructions += 1;
        self.code.append(instr)
    }

    fn structural(&mut self, code: &IrCode) -> CodegenResult<()> {
        match *code {
            IrCode::BlockEnter(level) => self.frame.enter_block(level),
            IrCode::BlockLeave(level) => self.frame.leave_block(level, self.seq)?,
            IrCode::Local(sym) => {
                self.frame.declare_local(sym, self.symbols);
            }
            _ => {}
        }
        Ok(())
    }

    fn select_code(&mut self, ir: &FunctionIr, idx: usize) -> CodegenResult<()> {
        let code = &ir.codes[idx];
        match *code {
            IrCode::Eval(lin) => {
                if ir.node(lin).op.has_side_effect() {
                    let id = self.node_of(lin)?;
                    self.select_root(id)?;
                }
            }
            IrCode::Arg(lin) => {
                let id = self.node_of(lin)?;
                self.push_arg(id)?;
            }
            IrCode::Jump(target) => self.select_jump(target)?,
            IrCode::Branch { cond, target } => {
                let id = self.node_of(cond)?;
                self.select_branch(id, target)?;
            }
            IrCode::Label(label) => {
                self.flush_registers()?;
                self.emit(Instr::new(Opcode::Label, TyClass::Void).with_target(label));
            }
            IrCode::Return(value) => {
                if let Some(lin) = value {
                    let id = self.node_of(lin)?;
                    self.return_value(id)?;
                }
                if ir.codes.get(idx + 1) != Some(&IrCode::Label(ir.exit)) {
                    self.select_jump(ir.exit)?;
                }
            }
            IrCode::ZeroFill { addr, bytes } => {
                let id = self.node_of(addr)?;
                self.zero_fill(id, bytes)?;
            }
            IrCode::FrameEnter => {
                let id = self.emit(Instr::new(Opcode::Enter, TyClass::Void));
                self.enter = Some(id);
            }
            IrCode::FrameExit => {
                self.emit(Instr::new(Opcode::Leave, TyClass::Void));
                self.emit(Instr::new(Opcode::Ret, TyClass::Void));
            }
            IrCode::BlockEnter(_) | IrCode::BlockLeave(_) | IrCode::Local(_) => {
                self.structural(code)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::tree::BinaryOp;

    #[test]
    fn test_context_resets_between_functions() {
        let ctx = TestContext::new();
        let mut symbols = SymbolTable::new();
        let f = symbols.function("f", CType::Int);
        let g = symbols.function("g", CType::Int);
        let a = symbols.param("a", CType::Int);
        let b = symbols.param("b", CType::Int);

        let mut tb = ctx.builder(&mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let sum = tb.binary(BinaryOp::Add, va, vb);
        let ret = tb.ret(Some(sum));
        let body = tb.block(&[], &[ret]);
        let fdef = tb.function(f, &[a, b], body);
        let one = tb.int(1);
        let ret1 = tb.ret(Some(one));
        let body1 = tb.block(&[], &[ret1]);
        let gdef = tb.function(g, &[], body1);

        let mut cg = CodegenContext::new(&mut symbols, CodegenOptions::default());
        let first = cg.compile_function(fdef).unwrap();
        let second = cg.compile_function(gdef).unwrap();
        assert_eq!(first.count(Opcode::Add), 1);
        assert_eq!(second.count(Opcode::Add), 0);
        assert_eq!(second.frame_size, 0);
        assert_eq!(second.instrs().next().map(|i| i.op), Some(Opcode::Enter));
    }

    #[test]
    fn test_pending_uses_follow_consumers() {
        let ctx = TestContext::new();
        let mut symbols = SymbolTable::new();
        let f = symbols.function("f", CType::Void);
        let x = symbols.global("x", CType::Int);
        let y = symbols.global("y", CType::Int);
        let a = symbols.global("a", CType::Int);

        let mut tb = ctx.builder(&mut symbols);
        let va = tb.var(a);
        let va2 = tb.var(a);
        let vx = tb.var(x);
        let vy = tb.var(y);
        let s1 = tb.assign(vx, va);
        let s2 = tb.assign(vy, va2);
        let st1 = tb.expr_stmt(s1);
        let st2 = tb.expr_stmt(s2);
        let body = tb.block(&[], &[st1, st2]);
        let def = tb.function(f, &[], body);

        let ir = Canonicalizer::new(&mut symbols).function(def).unwrap();
        let mut cg = CodegenContext::new(&mut symbols, CodegenOptions::default());
        let cfg = Cfg::build(&ir.codes, ir.exit).unwrap();
        cg.number_values(&ir, &cfg).unwrap();

        // Both statements read `a` through the same node.
        let loads: Vec<NodeId> = ir
            .lin
            .iter()
            .enumerate()
            .filter(|(_, n)| n.op == Op::Load)
            .map(|(i, _)| cg.dag_of[i].unwrap())
            .collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0], loads[1]);
        let node = cg.dag.node(loads[0]);
        assert_eq!(node.pending_uses, 2);
        let last_assign = ir
            .codes
            .iter()
            .rposition(|c| matches!(c, IrCode::Eval(l) if ir.node(*l).op == Op::Assign))
            .unwrap();
        assert_eq!(node.last_ref, last_assign as u32);
    }
}
