//! Canonicalizer: type-checked trees to a linear IR code list.
//!
//! Expressions are flattened into linear nodes (one per operator, in
//! evaluation order) referenced by `Eval` codes, and control flow is made
//! explicit with labels and jumps. Conditions are lowered in branch context
//! so `&&`, `||` and `!` never materialize a boolean unless their value is
//! used. Statement lowering produces the frame-structure codes (block
//! enter/leave, local declarations, zero fills) the frame manager consumes.

pub mod blocks;

use crate::core::error::{CodegenError, CodegenResult};
use crate::core::frame::round_to_slot;
use crate::core::symbols::{CType, Symbol, SymbolKind, SymbolTable};
use crate::dag::{Cond, Op};
use crate::tree::{BinaryOp, Decl, Expr, ExprKind, FunctionDef, Stmt, UnaryOp};
use log::debug;

/// Deepest expression nesting lowered before giving up.
pub const MAX_DEPTH: u32 = 512;

/// Index of a linear expression node within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinId(u32);

impl LinId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One operator of a flattened expression.
#[derive(Debug, Clone, PartialEq)]
pub struct LinNode {
    pub op: Op,
    pub ty: CType,
    pub kids: [Option<LinId>; 2],
    pub sym: Option<Symbol>,
    pub aux: i64,
}

/// Linear intermediate code.
#[derive(Debug, Clone, PartialEq)]
pub enum IrCode {
    /// Push an evaluated argument.
    Arg(LinId),
    /// Evaluate one operator.
    Eval(LinId),
    Jump(Symbol),
    /// Jump to `target` when the comparison node holds.
    Branch { cond: LinId, target: Symbol },
    Label(Symbol),
    BlockEnter(u32),
    BlockLeave(u32),
    Local(Symbol),
    /// Return, optionally with a value; transfers to the exit label.
    Return(Option<LinId>),
    ZeroFill { addr: LinId, bytes: u32 },
    FrameEnter,
    FrameExit,
}

impl IrCode {
    /// Codes that end a basic block.
    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            IrCode::Jump(_) | IrCode::Branch { .. } | IrCode::Return(_)
        )
    }

    /// Codes that only shape the frame and emit no instructions of their own.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            IrCode::BlockEnter(_) | IrCode::BlockLeave(_) | IrCode::Local(_)
        )
    }
}

/// Canonical form of one function.
#[derive(Debug, Clone)]
pub struct FunctionIr {
    pub name: Symbol,
    pub ret: CType,
    /// Incoming parameters in frame order; the hidden output address comes first.
    pub params: Vec<Symbol>,
    pub codes: Vec<IrCode>,
    pub lin: Vec<LinNode>,
    pub exit: Symbol,
}

impl FunctionIr {
    pub fn node(&self, id: LinId) -> &LinNode {
        &self.lin[id.index()]
    }

    pub fn label_count(&self) -> usize {
        self.codes
            .iter()
            .filter(|c| matches!(c, IrCode::Label(_)))
            .count()
    }

    pub fn jump_count(&self) -> usize {
        self.codes.iter().filter(|c| c.is_jump()).count()
    }
}

struct Loop {
    cont: Symbol,
    brk: Symbol,
}

/// Lowers one function at a time.
pub struct Canonicalizer<'s> {
    symbols: &'s mut SymbolTable,
    codes: Vec<IrCode>,
    lin: Vec<LinNode>,
    loops: Vec<Loop>,
    level: u32,
    depth: u32,
    sret: Option<Symbol>,
    exit: Option<Symbol>,
    /// Tags the memoized lowering of shared subtrees with this pass.
    epoch: u32,
}

impl<'s> Canonicalizer<'s> {
    pub fn new(symbols: &'s mut SymbolTable) -> Self {
        let epoch = symbols.next_lowering_pass();
        Self {
            symbols,
            codes: Vec::new(),
            lin: Vec::new(),
            loops: Vec::new(),
            level: 0,
            depth: 0,
            sret: None,
            exit: None,
            epoch,
        }
    }

    /// Lower a whole function definition.
    pub fn function(mut self, def: &FunctionDef<'_>) -> CodegenResult<FunctionIr> {
        let exit = self.symbols.new_label();
        self.exit = Some(exit);
        self.sret = def.sret;

        let params: Vec<Symbol> = def.sret.into_iter().chain(def.params.iter().copied()).collect();

        self.codes.push(IrCode::FrameEnter);
        self.stmt(def.body)?;
        self.codes.push(IrCode::Label(exit));
        self.codes.push(IrCode::FrameExit);

        debug!(
            "canonicalized {}: {} codes, {} linear nodes",
            self.symbols.name(def.name),
            self.codes.len(),
            self.lin.len()
        );
        Ok(FunctionIr {
            name: def.name,
            ret: def.ret,
            params,
            codes: self.codes,
            lin: self.lin,
            exit,
        })
    }

    /// Codes produced so far, for lowering fragments outside a function.
    pub fn finish(self) -> (Vec<IrCode>, Vec<LinNode>) {
        (self.codes, self.lin)
    }

    /// Lower `e` in value context when both labels are absent, otherwise as a
    /// branch to `t` when it is true and to `f` when it is false; an absent
    /// label means fall through.
    pub fn linearize(
        &mut self,
        e: &Expr<'_>,
        t: Option<Symbol>,
        f: Option<Symbol>,
    ) -> CodegenResult<Option<LinId>> {
        if t.is_none() && f.is_none() {
            self.value(e).map(Some)
        } else {
            self.branch(e, t, f)?;
            Ok(None)
        }
    }

    fn emit(&mut self, op: Op, ty: CType, kids: [Option<LinId>; 2], sym: Option<Symbol>) -> LinId {
        self.emit_aux(op, ty, kids, sym, 0)
    }

    fn emit_aux(
        &mut self,
        op: Op,
        ty: CType,
        kids: [Option<LinId>; 2],
        sym: Option<Symbol>,
        aux: i64,
    ) -> LinId {
        let id = LinId(self.lin.len() as u32);
        self.lin.push(LinNode {
            op,
            ty,
            kids,
            sym,
            aux,
        });
        self.codes.push(IrCode::Eval(id));
        id
    }

    fn label(&mut self) -> Symbol {
        self.symbols.new_label()
    }

    fn place(&mut self, label: Symbol) {
        self.codes.push(IrCode::Label(label));
    }

    fn enter(&mut self) -> CodegenResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CodegenError::unsupported(format!(
                "expression nesting deeper than {MAX_DEPTH}"
            )));
        }
        Ok(())
    }

    fn zero(&mut self, ty: CType) -> LinId {
        let sym = if ty.is_float() {
            self.symbols.float_const(0.0, ty)
        } else {
            self.symbols.int_const(0, ty)
        };
        self.emit(Op::Const, ty, [None, None], Some(sym))
    }

    fn value(&mut self, e: &Expr<'_>) -> CodegenResult<LinId> {
        if let Some(done) = e.lowered(self.epoch) {
            return Ok(done);
        }
        self.enter()?;
        let result = self.value_inner(e);
        self.depth -= 1;
        let id = result?;
        e.set_lowered(self.epoch, id);
        Ok(id)
    }

    fn value_inner(&mut self, e: &Expr<'_>) -> CodegenResult<LinId> {
        let ty = e.ty;
        match e.kind {
            ExprKind::Const(sym) => Ok(self.emit(Op::Const, ty, [None, None], Some(sym))),
            ExprKind::Addr(sym) => Ok(self.emit(Op::Addr, CType::Pointer, [None, None], Some(sym))),
            ExprKind::Deref(ptr) => {
                let addr = self.value(ptr)?;
                Ok(self.emit(Op::Load, ty, [Some(addr), None], None))
            }
            ExprKind::Unary(UnaryOp::Neg, x) => {
                let v = self.value(x)?;
                Ok(self.emit(Op::Neg, ty, [Some(v), None], None))
            }
            ExprKind::Unary(UnaryOp::Compl, x) => {
                let v = self.value(x)?;
                Ok(self.emit(Op::Compl, ty, [Some(v), None], None))
            }
            ExprKind::Unary(UnaryOp::Not, x) => {
                let v = self.value(x)?;
                let z = self.zero(x.ty);
                Ok(self.emit(Op::Cmp(Cond::Eq), CType::Int, [Some(v), Some(z)], None))
            }
            ExprKind::Binary(op, _, _) if op.is_logical() => self.bool_value(e),
            ExprKind::Binary(op, l, r) if op.is_relational() => {
                let lv = self.value(l)?;
                let rv = self.value(r)?;
                Ok(self.emit(Op::Cmp(relation(op)?), CType::Int, [Some(lv), Some(rv)], None))
            }
            ExprKind::Binary(op, l, r) => {
                let lv = self.value(l)?;
                let rv = self.value(r)?;
                Ok(self.emit(arith(op)?, ty, [Some(lv), Some(rv)], None))
            }
            ExprKind::Assign(addr, v) => {
                let a = self.value(addr)?;
                let rv = self.value(v)?;
                self.emit(Op::Assign, ty, [Some(a), Some(rv)], None);
                if ty.is_integer() && v.ty.is_integer() && ty.size() < v.ty.size() {
                    // The value of a narrowing store is the narrowed value.
                    return Ok(self.emit(Op::Cvt, ty, [Some(rv), None], None));
                }
                Ok(rv)
            }
            ExprKind::Cond(c, a, b) => self.ternary(e, c, a, b),
            ExprKind::Call(callee, args) => self.call(e, callee, args),
            ExprKind::Cast(x) => {
                let v = self.value(x)?;
                if ty == CType::Void || x.ty.class() == ty.class() {
                    Ok(v)
                } else {
                    Ok(self.emit(Op::Cvt, ty, [Some(v), None], None))
                }
            }
            ExprKind::Comma(a, b) => {
                self.effect(a)?;
                self.value(b)
            }
        }
    }

    /// Lower `e` for its side effects only.
    fn effect(&mut self, e: &Expr<'_>) -> CodegenResult<()> {
        match e.kind {
            ExprKind::Cond(c, a, b) if e.lowered(self.epoch).is_none() => {
                let other = self.label();
                let join = self.label();
                self.branch(c, None, Some(other))?;
                self.effect(a)?;
                self.codes.push(IrCode::Jump(join));
                self.place(other);
                self.effect(b)?;
                self.place(join);
                Ok(())
            }
            ExprKind::Binary(BinaryOp::LogAnd, a, b) if e.lowered(self.epoch).is_none() => {
                let end = self.label();
                self.branch(a, None, Some(end))?;
                self.effect(b)?;
                self.place(end);
                Ok(())
            }
            ExprKind::Binary(BinaryOp::LogOr, a, b) if e.lowered(self.epoch).is_none() => {
                let end = self.label();
                self.branch(a, Some(end), None)?;
                self.effect(b)?;
                self.place(end);
                Ok(())
            }
            ExprKind::Comma(a, b) => {
                self.effect(a)?;
                self.effect(b)
            }
            _ => self.value(e).map(|_| ()),
        }
    }

    /// Lower a condition as control flow.
    fn branch(&mut self, e: &Expr<'_>, t: Option<Symbol>, f: Option<Symbol>) -> CodegenResult<()> {
        self.enter()?;
        let result = self.branch_inner(e, t, f);
        self.depth -= 1;
        result
    }

    fn branch_inner(
        &mut self,
        e: &Expr<'_>,
        t: Option<Symbol>,
        f: Option<Symbol>,
    ) -> CodegenResult<()> {
        if e.ty.is_struct() {
            return Err(CodegenError::unsupported("struct value used as a condition"));
        }
        if e.lowered(self.epoch).is_some() {
            let v = self.value(e)?;
            return self.test_value(v, e.ty, t, f);
        }
        match e.kind {
            ExprKind::Binary(BinaryOp::LogAnd, a, b) => match f {
                Some(f) => {
                    self.branch(a, None, Some(f))?;
                    self.branch(b, t, Some(f))
                }
                None => {
                    let skip = self.label();
                    self.branch(a, None, Some(skip))?;
                    self.branch(b, t, None)?;
                    self.place(skip);
                    Ok(())
                }
            },
            ExprKind::Binary(BinaryOp::LogOr, a, b) => match t {
                Some(t) => {
                    self.branch(a, Some(t), None)?;
                    self.branch(b, Some(t), f)
                }
                None => {
                    let taken = self.label();
                    self.branch(a, Some(taken), None)?;
                    self.branch(b, None, f)?;
                    self.place(taken);
                    Ok(())
                }
            },
            ExprKind::Unary(UnaryOp::Not, x) => self.branch(x, f, t),
            ExprKind::Binary(op, l, r) if op.is_relational() => {
                let lv = self.value(l)?;
                let rv = self.value(r)?;
                self.compare(relation(op)?, lv, rv, t, f)
            }
            ExprKind::Const(sym) => {
                let truth = match self.symbols.kind(sym) {
                    SymbolKind::IntConst(v) => v != 0,
                    SymbolKind::FloatConst(v) => v != 0.0,
                    _ => true,
                };
                let target = if truth { t } else { f };
                if let Some(target) = target {
                    self.codes.push(IrCode::Jump(target));
                }
                Ok(())
            }
            ExprKind::Comma(a, b) => {
                self.effect(a)?;
                self.branch(b, t, f)
            }
            _ => {
                let v = self.value(e)?;
                self.test_value(v, e.ty, t, f)
            }
        }
    }

    fn test_value(
        &mut self,
        v: LinId,
        ty: CType,
        t: Option<Symbol>,
        f: Option<Symbol>,
    ) -> CodegenResult<()> {
        let z = self.zero(ty);
        self.compare(Cond::Ne, v, z, t, f)
    }

    /// One conditional jump, plus an unconditional one only when both
    /// targets are explicit.
    fn compare(
        &mut self,
        cond: Cond,
        l: LinId,
        r: LinId,
        t: Option<Symbol>,
        f: Option<Symbol>,
    ) -> CodegenResult<()> {
        match (t, f) {
            (Some(t), f) => {
                let c = self.emit(Op::Cmp(cond), CType::Int, [Some(l), Some(r)], None);
                self.codes.push(IrCode::Branch { cond: c, target: t });
                if let Some(f) = f {
                    self.codes.push(IrCode::Jump(f));
                }
                Ok(())
            }
            (None, Some(f)) => {
                let c = self.emit(Op::Cmp(cond.negate()), CType::Int, [Some(l), Some(r)], None);
                self.codes.push(IrCode::Branch { cond: c, target: f });
                Ok(())
            }
            (None, None) => Err(CodegenError::invariant("branch without any target")),
        }
    }

    fn temp(&mut self, ty: CType) -> Symbol {
        let tmp = self.symbols.temp(ty);
        self.codes.push(IrCode::Local(tmp));
        tmp
    }

    fn store_to(&mut self, sym: Symbol, ty: CType, v: LinId) {
        let a = self.emit(Op::Addr, CType::Pointer, [None, None], Some(sym));
        self.emit(Op::Assign, ty, [Some(a), Some(v)], None);
    }

    fn load_from(&mut self, sym: Symbol, ty: CType) -> LinId {
        let a = self.emit(Op::Addr, CType::Pointer, [None, None], Some(sym));
        self.emit(Op::Load, ty, [Some(a), None], None)
    }

    /// `&&` and `||` in value context: branch, then store 1 or 0.
    fn bool_value(&mut self, e: &Expr<'_>) -> CodegenResult<LinId> {
        let tmp = self.temp(CType::Int);
        let other = self.label();
        let join = self.label();
        self.branch_inner(e, None, Some(other))?;
        let one = self.symbols.int_const(1, CType::Int);
        let one = self.emit(Op::Const, CType::Int, [None, None], Some(one));
        self.store_to(tmp, CType::Int, one);
        self.codes.push(IrCode::Jump(join));
        self.place(other);
        let zero = self.zero(CType::Int);
        self.store_to(tmp, CType::Int, zero);
        self.place(join);
        Ok(self.load_from(tmp, CType::Int))
    }

    fn ternary(
        &mut self,
        e: &Expr<'_>,
        c: &Expr<'_>,
        a: &Expr<'_>,
        b: &Expr<'_>,
    ) -> CodegenResult<LinId> {
        let ty = e.ty;
        if ty == CType::Void {
            self.effect_cond(c, a, b)?;
            return Ok(self.zero(CType::Int));
        }
        let tmp = self.temp(ty);
        let other = self.label();
        let join = self.label();
        self.branch(c, None, Some(other))?;
        let av = self.value(a)?;
        self.store_to(tmp, ty, av);
        self.codes.push(IrCode::Jump(join));
        self.place(other);
        let bv = self.value(b)?;
        self.store_to(tmp, ty, bv);
        self.place(join);
        Ok(self.load_from(tmp, ty))
    }

    fn effect_cond(&mut self, c: &Expr<'_>, a: &Expr<'_>, b: &Expr<'_>) -> CodegenResult<()> {
        let other = self.label();
        let join = self.label();
        self.branch(c, None, Some(other))?;
        self.effect(a)?;
        self.codes.push(IrCode::Jump(join));
        self.place(other);
        self.effect(b)?;
        self.place(join);
        Ok(())
    }

    fn call(&mut self, e: &Expr<'_>, callee: &Expr<'_>, args: &[&Expr<'_>]) -> CodegenResult<LinId> {
        let mut bytes = 0u32;
        let out = e.ty.is_struct().then(|| self.temp(e.ty));
        for arg in args.iter().rev() {
            let v = self.value(arg)?;
            self.codes.push(IrCode::Arg(v));
            bytes += round_to_slot(arg.ty.size());
        }
        if let Some(out) = out {
            let a = self.emit(Op::Addr, CType::Pointer, [None, None], Some(out));
            self.codes.push(IrCode::Arg(a));
            bytes += round_to_slot(CType::Pointer.size());
        }
        let f = self.value(callee)?;
        let ret = if out.is_some() { CType::Void } else { e.ty };
        let call = self.emit_aux(Op::Call, ret, [Some(f), None], None, bytes as i64);
        match out {
            Some(out) => Ok(self.load_from(out, e.ty)),
            None => Ok(call),
        }
    }

    fn stmt(&mut self, s: &Stmt<'_>) -> CodegenResult<()> {
        match *s {
            Stmt::Expr(e) => self.effect(e),
            Stmt::If(c, then, None) => {
                let end = self.label();
                self.branch(c, None, Some(end))?;
                self.stmt(then)?;
                self.place(end);
                Ok(())
            }
            Stmt::If(c, then, Some(other)) => {
                let other_label = self.label();
                let end = self.label();
                self.branch(c, None, Some(other_label))?;
                self.stmt(then)?;
                self.codes.push(IrCode::Jump(end));
                self.place(other_label);
                self.stmt(other)?;
                self.place(end);
                Ok(())
            }
            Stmt::While(c, body) => {
                let top = self.label();
                let test = self.label();
                let brk = self.label();
                self.codes.push(IrCode::Jump(test));
                self.place(top);
                self.loops.push(Loop { cont: test, brk });
                let result = self.stmt(body);
                self.loops.pop();
                result?;
                self.place(test);
                self.branch(c, Some(top), None)?;
                self.place(brk);
                Ok(())
            }
            Stmt::Block(decls, stmts) => {
                self.level += 1;
                let level = self.level;
                self.codes.push(IrCode::BlockEnter(level));
                for decl in decls {
                    self.declare(decl)?;
                }
                for s in stmts {
                    self.stmt(s)?;
                }
                self.codes.push(IrCode::BlockLeave(level));
                self.level -= 1;
                Ok(())
            }
            Stmt::Return(None) => {
                self.codes.push(IrCode::Return(None));
                Ok(())
            }
            Stmt::Return(Some(e)) => match self.sret {
                Some(sret) if e.ty.is_struct() => {
                    let v = self.value(e)?;
                    let out = self.load_from(sret, CType::Pointer);
                    self.emit(Op::Assign, e.ty, [Some(out), Some(v)], None);
                    self.codes.push(IrCode::Return(None));
                    Ok(())
                }
                _ => {
                    let v = self.value(e)?;
                    self.codes.push(IrCode::Return(Some(v)));
                    Ok(())
                }
            },
            Stmt::Break => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.brk)
                    .ok_or_else(|| CodegenError::unsupported("break outside of a loop"))?;
                self.codes.push(IrCode::Jump(target));
                Ok(())
            }
            Stmt::Continue => {
                let target = self
                    .loops
                    .last()
                    .map(|l| l.cont)
                    .ok_or_else(|| CodegenError::unsupported("continue outside of a loop"))?;
                self.codes.push(IrCode::Jump(target));
                Ok(())
            }
        }
    }

    fn declare(&mut self, decl: &Decl<'_>) -> CodegenResult<()> {
        self.codes.push(IrCode::Local(decl.sym));
        let ty = self.symbols.ty(decl.sym);
        if decl.zero_fill {
            let addr = self.emit(Op::Addr, CType::Pointer, [None, None], Some(decl.sym));
            self.codes.push(IrCode::ZeroFill {
                addr,
                bytes: round_to_slot(ty.size()),
            });
        }
        if let Some(init) = decl.init {
            let v = self.value(init)?;
            self.store_to(decl.sym, ty, v);
        }
        Ok(())
    }
}

fn relation(op: BinaryOp) -> CodegenResult<Cond> {
    Ok(match op {
        BinaryOp::Eq => Cond::Eq,
        BinaryOp::Ne => Cond::Ne,
        BinaryOp::Lt => Cond::Lt,
        BinaryOp::Le => Cond::Le,
        BinaryOp::Gt => Cond::Gt,
        BinaryOp::Ge => Cond::Ge,
        other => {
            return Err(CodegenError::invariant(format!(
                "{other:?} is not a relational operator"
            )))
        }
    })
}

fn arith(op: BinaryOp) -> CodegenResult<Op> {
    Ok(match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::Mod => Op::Mod,
        BinaryOp::And => Op::And,
        BinaryOp::Or => Op::Or,
        BinaryOp::Xor => Op::Xor,
        BinaryOp::Shl => Op::Shl,
        BinaryOp::Shr => Op::Shr,
        other => {
            return Err(CodegenError::invariant(format!(
                "{other:?} is not an arithmetic operator"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeBuilder;
    use bumpalo::Bump;

    fn jumps(codes: &[IrCode]) -> (usize, usize) {
        let branches = codes
            .iter()
            .filter(|c| matches!(c, IrCode::Branch { .. }))
            .count();
        let plain = codes.iter().filter(|c| matches!(c, IrCode::Jump(_))).count();
        (branches, plain)
    }

    #[test]
    fn test_relational_branch_uses_fallthrough() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let a = symbols.local("a", CType::Int);
        let b = symbols.local("b", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let lt = tb.binary(BinaryOp::Lt, va, vb);

        let mut canon = Canonicalizer::new(&mut symbols);
        let f = canon.label();
        canon.linearize(lt, None, Some(f)).unwrap();
        let (codes, lin) = canon.finish();

        assert_eq!(jumps(&codes), (1, 0));
        let Some(IrCode::Branch { cond, target }) = codes.last() else {
            panic!("expected a branch, got {codes:?}");
        };
        assert_eq!(*target, f);
        // Branching to the false label tests the negated relation.
        assert_eq!(lin[cond.index()].op, Op::Cmp(Cond::Ge));
    }

    #[test]
    fn test_both_targets_add_one_jump() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let a = symbols.local("a", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let va = tb.var(a);
        let zero = tb.int(0);
        let eq = tb.binary(BinaryOp::Eq, va, zero);

        let mut canon = Canonicalizer::new(&mut symbols);
        let (t, f) = (canon.label(), canon.label());
        canon.linearize(eq, Some(t), Some(f)).unwrap();
        let (codes, _) = canon.finish();
        assert_eq!(jumps(&codes), (1, 1));
    }

    #[test]
    fn test_not_swaps_targets() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let a = symbols.local("a", CType::Int);
        let b = symbols.local("b", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let lt = tb.binary(BinaryOp::Lt, va, vb);
        let not = tb.unary(UnaryOp::Not, lt);

        let mut canon = Canonicalizer::new(&mut symbols);
        let f = canon.label();
        canon.linearize(not, None, Some(f)).unwrap();
        let (codes, lin) = canon.finish();
        let Some(IrCode::Branch { cond, target }) = codes.last() else {
            panic!("expected a branch");
        };
        assert_eq!(*target, f);
        assert_eq!(lin[cond.index()].op, Op::Cmp(Cond::Lt));
    }

    #[test]
    fn test_and_in_branch_context() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let a = symbols.local("a", CType::Int);
        let b = symbols.local("b", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let and = tb.binary(BinaryOp::LogAnd, va, vb);

        let mut canon = Canonicalizer::new(&mut symbols);
        let f = canon.label();
        canon.linearize(and, None, Some(f)).unwrap();
        let (codes, _) = canon.finish();

        // Both operands branch straight to the false label.
        let targets: Vec<Symbol> = codes
            .iter()
            .filter_map(|c| match c {
                IrCode::Branch { target, .. } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![f, f]);
        assert!(!codes.iter().any(|c| matches!(c, IrCode::Label(_))));
    }

    #[test]
    fn test_call_arguments_right_to_left() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let f = symbols.function("f", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let one = tb.int(1);
        let two = tb.int(2);
        let call = tb.call_fn(f, &[one, two]);

        let mut canon = Canonicalizer::new(&mut symbols);
        let result = canon.linearize(call, None, None).unwrap().unwrap();
        let (codes, lin) = canon.finish();

        let pushed: Vec<Option<Symbol>> = codes
            .iter()
            .filter_map(|c| match c {
                IrCode::Arg(id) => Some(lin[id.index()].sym),
                _ => None,
            })
            .collect();
        let (one_sym, two_sym) = match (&one.kind, &two.kind) {
            (ExprKind::Const(a), ExprKind::Const(b)) => (*a, *b),
            _ => unreachable!(),
        };
        assert_eq!(pushed, vec![Some(two_sym), Some(one_sym)]);
        assert_eq!(lin[result.index()].op, Op::Call);
        assert_eq!(lin[result.index()].aux, 8);
    }

    #[test]
    fn test_shared_subtree_lowered_once() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let g = symbols.function("g", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let call = tb.call_fn(g, &[]);
        let sum = tb.binary(BinaryOp::Add, call, call);

        let mut canon = Canonicalizer::new(&mut symbols);
        canon.linearize(sum, None, None).unwrap();
        let (_, lin) = canon.finish();
        assert_eq!(lin.iter().filter(|n| n.op == Op::Call).count(), 1);
    }

    #[test]
    fn test_relowering_ignores_earlier_pass() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let g = symbols.function("g", CType::Int);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let call = tb.call_fn(g, &[]);

        let mut first = Canonicalizer::new(&mut symbols);
        let pad = first.zero(CType::Int);
        let id = first.linearize(call, None, None).unwrap().unwrap();
        assert_ne!(id, pad);
        drop(first);

        // A fresh pass must lower the call again instead of reusing an id
        // from the earlier node list.
        let mut second = Canonicalizer::new(&mut symbols);
        let id = second.linearize(call, None, None).unwrap().unwrap();
        let (_, lin) = second.finish();
        assert_eq!(lin[id.index()].op, Op::Call);
        assert_eq!(lin.iter().filter(|n| n.op == Op::Call).count(), 1);
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let f = symbols.function("f", CType::Void);
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let brk = tb.brk();
        let body = tb.block(&[], &[brk]);
        let def = tb.function(f, &[], body);

        let err = Canonicalizer::new(&mut symbols).function(def).unwrap_err();
        assert!(matches!(err, CodegenError::Unsupported { .. }));
    }
}
