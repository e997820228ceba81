// This module selects pseudo-assembly instructions for DAG nodes. Selection is demand driven: a
// consumer asks for a node's value in one of a set of operand formats, the node is computed the
// first time it is asked for (recursively asking for its children in the formats the operator's
// table accepts), and the result is coerced into an acceptable format by loading it into
// registers or storing it to a frame temporary. Leaves, loads and narrowing integer conversions are
// transparent: they produce addressing operands instead of code and are recomputed on every use.
// Every other value is bound to its register location and reused until its last consumer.

//! Table-driven instruction selection.

mod regalloc;
pub mod tables;

pub(crate) use regalloc::HeldValue;

use crate::asm::{Address, Fmt, Instr, Operand, Opcode};
use crate::codegen::CodegenContext;
use crate::core::error::{CodegenError, CodegenResult};
use crate::core::frame::round_to_slot;
use crate::core::register_file::{RegMask, EAX, EBP, EDX, ESP, F0};
use crate::core::symbols::{CType, Symbol, TyClass};
use crate::dag::{Cond, NodeId, Op};
use log::trace;
use tables::{cvt_key, key};

const POINTER: Fmt = Fmt::REG.union(Fmt::MEM);

impl CodegenContext<'_> {
    /// Value of `id` in one of the formats in `mask`; consumes one pending use.
    pub(crate) fn select(&mut self, id: NodeId, mask: Fmt) -> CodegenResult<Operand> {
        let node = self.dag.node_mut(id);
        node.pending_uses = node.pending_uses.saturating_sub(1);
        let loc = node.loc;
        let op = match loc {
            Some(loc) => loc,
            None => self.compute(id)?,
        };
        self.coerce(id, op, mask)
    }

    /// Select a node evaluated for its side effect.
    pub(crate) fn select_root(&mut self, id: NodeId) -> CodegenResult<()> {
        match self.dag.node(id).op {
            Op::Assign => self.select_assign(id),
            Op::Call => self.select_call(id),
            other => Err(CodegenError::invariant(format!(
                "{other:?} selected as a statement"
            ))),
        }
    }

    fn compute(&mut self, id: NodeId) -> CodegenResult<Operand> {
        let node = self.dag.node(id);
        let (op, sym, kid) = (node.op, node.sym, node.kids[0]);
        match op {
            Op::Const => Ok(Operand::Imm(self.leaf_symbol(sym)?)),
            Op::Addr => {
                let sym = self.leaf_symbol(sym)?;
                Ok(Operand::Mem(self.address_of(sym)?))
            }
            Op::Load => {
                let kid = self.kid(id, kid)?;
                let addr = self.select(kid, POINTER)?;
                Ok(Operand::Ind(deref_address(addr)?))
            }
            Op::Neg | Op::Compl => self.select_unary(id),
            Op::Cmp(cond) => self.select_setcc(id, cond),
            Op::Cvt => self.select_cvt(id),
            op if op.is_binary() => self.select_binary(id),
            Op::Assign | Op::Call => Err(CodegenError::invariant(format!(
                "{op:?} node {id:?} used before it was evaluated"
            ))),
            other => Err(CodegenError::invariant(format!("cannot select {other:?}"))),
        }
    }

    fn kid(&self, id: NodeId, kid: Option<NodeId>) -> CodegenResult<NodeId> {
        kid.ok_or_else(|| CodegenError::invariant(format!("{id:?} is missing an operand")))
    }

    fn kids(&self, id: NodeId) -> CodegenResult<(NodeId, NodeId)> {
        match self.dag.node(id).kids {
            [Some(l), Some(r)] => Ok((l, r)),
            _ => Err(CodegenError::invariant(format!("{id:?} needs two operands"))),
        }
    }

    fn leaf_symbol(&self, sym: Option<Symbol>) -> CodegenResult<Symbol> {
        sym.ok_or_else(|| CodegenError::invariant("leaf without a symbol"))
    }

    /// Address of a variable: frame-pointer relative for locals, parameters
    /// and temporaries, symbolic otherwise.
    fn address_of(&self, sym: Symbol) -> CodegenResult<Address> {
        if !self.symbols.is_frame_resident(sym) {
            return Ok(Address::symbol(sym));
        }
        let offset = self.symbols.offset(sym).ok_or_else(|| {
            CodegenError::invariant(format!(
                "{} used before its frame slot was assigned",
                self.symbols.name(sym)
            ))
        })?;
        Ok(Address::based(EBP, offset))
    }

    /// Bring `op` into one of the formats in `mask`.
    fn coerce(&mut self, id: NodeId, op: Operand, mask: Fmt) -> CodegenResult<Operand> {
        if mask.contains(op.fmt()) {
            return Ok(op);
        }
        if mask.contains(Fmt::REG) {
            return self.load_reg(id, op);
        }
        if mask.contains(Fmt::IND) {
            return self.to_memory(id, op);
        }
        let cls = self.dag.node(id).ty.class();
        Err(CodegenError::SelectionMiss {
            table: "coerce",
            key: key(mask, op.fmt(), cls),
        })
    }

    /// Load `op` into fresh registers and make them the node's location.
    fn load_reg(&mut self, id: NodeId, op: Operand) -> CodegenResult<Operand> {
        let node = self.dag.node(id);
        let (ty, spill) = (node.ty, node.spill);
        let cls = ty.class();
        let opcode = self.tables.mov.lookup(key(Fmt::REG, op.fmt(), cls))?;
        self.hold(&op);
        let dst = self.alloc_value(ty)?;
        self.release(&op)?;
        self.emit(Instr::new(opcode, cls).with_dst(dst).with_src(op));
        if spill.is_some_and(|slot| op == Operand::Ind(Address::based(EBP, slot))) {
            self.stats.reloads += 1;
            trace!("reloaded {id:?}");
        }
        self.bind(id, dst)?;
        Ok(dst)
    }

    /// A memory copy of the value, stored to a frame temporary if needed.
    fn to_memory(&mut self, id: NodeId, op: Operand) -> CodegenResult<Operand> {
        let node = self.dag.node(id);
        let (ty, last_ref) = (node.ty, node.last_ref);
        if let Some(slot) = node.spill {
            return Ok(Operand::Ind(Address::based(EBP, slot)));
        }
        let cls = ty.class();
        let src = if self.tables.mov.lookup(key(Fmt::IND, op.fmt(), cls)).is_ok() {
            op
        } else {
            self.load_reg(id, op)?
        };
        let opcode = self.tables.mov.lookup(key(Fmt::IND, src.fmt(), cls))?;
        let slot = self.frame.get_or_alloc_temp(self.seq, id, ty.size(), last_ref);
        let dst = Operand::Ind(Address::based(EBP, slot));
        self.emit(Instr::new(opcode, cls).with_dst(dst).with_src(src));
        self.dag.node_mut(id).spill = Some(slot);
        Ok(dst)
    }

    fn move_op(&mut self, cls: TyClass, dst: Operand, src: Operand) -> CodegenResult<()> {
        let opcode = self.tables.mov.lookup(key(dst.fmt(), src.fmt(), cls))?;
        self.emit(Instr::new(opcode, cls).with_dst(dst).with_src(src));
        Ok(())
    }

    fn select_binary(&mut self, id: NodeId) -> CodegenResult<Operand> {
        let node = self.dag.node(id);
        let (op, ty) = (node.op, node.ty);
        let (l, r) = self.kids(id)?;
        let cls = ty.class();
        let src_mask = self.tables.for_op(op)?.src_mask(Fmt::REG, cls);

        let rhs = self.select(r, src_mask)?;
        self.hold_value(r, rhs);
        let lhs = self.select(l, Fmt::REG)?;
        self.hold(&lhs);
        let dst = self.claim(lhs, ty)?;
        self.hold(&dst);
        let rhs = self.take_held(src_mask)?;
        self.release(&dst)?;
        let opcode = self.tables.for_op(op)?.lookup(key(Fmt::REG, rhs.fmt(), cls))?;
        self.emit(Instr::new(opcode, cls).with_dst(dst).with_src(rhs));
        self.release(&lhs)?;
        self.release(&rhs)?;
        self.bind(id, dst)?;
        Ok(dst)
    }

    fn select_unary(&mut self, id: NodeId) -> CodegenResult<Operand> {
        let node = self.dag.node(id);
        let (op, ty, kid) = (node.op, node.ty, node.kids[0]);
        let cls = ty.class();
        let opcode = self.tables.for_op(op)?.lookup(key(Fmt::REG, Fmt::NONE, cls))?;
        let kid = self.kid(id, kid)?;
        let v = self.select(kid, Fmt::REG)?;
        self.hold(&v);
        let dst = self.claim(v, ty)?;
        self.release(&v)?;
        self.emit(Instr::new(opcode, cls).with_dst(dst));
        self.bind(id, dst)?;
        Ok(dst)
    }

    /// Emit the comparison of a `Cmp` node's operands.
    fn compare(&mut self, id: NodeId) -> CodegenResult<()> {
        let (l, r) = self.kids(id)?;
        let cls = self.dag.node(l).ty.class();
        let cmp = &self.tables.cmp;
        let src_mask = cmp.src_mask(Fmt::REG, cls).union(cmp.src_mask(Fmt::IND, cls));

        let rhs = self.select(r, src_mask)?;
        // A register operand may come back from memory, so the other side
        // must accept both.
        let cmp = &self.tables.cmp;
        let dst_mask = match rhs {
            Operand::Reg { .. } => cmp
                .dst_mask(Fmt::REG, cls)
                .intersect(cmp.dst_mask(Fmt::IND, cls)),
            _ => cmp.dst_mask(rhs.fmt(), cls),
        };
        self.hold_value(r, rhs);
        let lhs = self.select(l, dst_mask)?;
        self.hold(&lhs);
        let rhs_mask = self.tables.cmp.src_mask(lhs.fmt(), cls);
        let rhs = self.take_held(rhs_mask)?;
        let opcode = self.tables.cmp.lookup(key(lhs.fmt(), rhs.fmt(), cls))?;
        self.emit(Instr::new(opcode, cls).with_dst(lhs).with_src(rhs));
        self.release(&lhs)?;
        self.release(&rhs)
    }

    fn select_setcc(&mut self, id: NodeId, cond: Cond) -> CodegenResult<Operand> {
        self.compare(id)?;
        let dst = Operand::reg(self.alloc(RegMask::GP)?);
        self.emit(Instr::new(Opcode::Set(cond), TyClass::I32).with_dst(dst));
        self.bind(id, dst)?;
        Ok(dst)
    }

    /// Conditional jump on a `Cmp` node; the comparison is always redone
    /// from its operands.
    pub(crate) fn select_branch(&mut self, id: NodeId, target: Symbol) -> CodegenResult<()> {
        let Op::Cmp(cond) = self.dag.node(id).op else {
            return Err(CodegenError::invariant("branch on a non-comparison"));
        };
        self.compare(id)?;
        self.flush_registers()?;
        self.emit(Instr::new(Opcode::Jcc(cond), TyClass::Void).with_target(target));
        Ok(())
    }

    pub(crate) fn select_jump(&mut self, target: Symbol) -> CodegenResult<()> {
        self.flush_registers()?;
        self.emit(Instr::new(Opcode::Jmp, TyClass::Void).with_target(target));
        Ok(())
    }

    fn select_assign(&mut self, id: NodeId) -> CodegenResult<()> {
        let ty = self.dag.node(id).ty;
        let (a, v) = self.kids(id)?;
        let cls = ty.class();

        let src_mask = if ty.is_struct() {
            Fmt::IND
        } else {
            self.tables.mov.src_mask(Fmt::IND, cls)
        };
        let src = self.select(v, src_mask)?;
        self.hold_value(v, src);
        let addr = deref_address(self.select(a, POINTER)?)?;
        let target = Operand::Ind(addr);
        self.hold(&target);
        let src = self.take_held(src_mask)?;
        self.release(&target)?;
        if ty.is_struct() {
            self.emit(
                Instr::new(Opcode::Copy, cls)
                    .with_dst(Operand::Ind(addr))
                    .with_src(src)
                    .with_bytes(ty.size()),
            );
        } else {
            self.move_op(cls, Operand::Ind(addr), src)?;
        }
        self.release(&src)
    }

    fn stage(&mut self, kid: NodeId, ty: CType) -> NodeId {
        let id = self.dag.fresh(Op::Cvt, ty, [Some(kid), None], None, 0);
        let node = self.dag.node_mut(id);
        node.last_ref = self.seq;
        node.pending_uses = 1;
        id
    }

    fn select_cvt(&mut self, id: NodeId) -> CodegenResult<Operand> {
        let node = self.dag.node(id);
        let (ty, kid) = (node.ty, self.kid(id, node.kids[0])?);
        let src_ty = self.dag.node(kid).ty;

        if src_ty.is_integer() && ty.is_integer() {
            if ty.size() <= src_ty.size() {
                // Narrowing reads the low part in place.
                let v = self.select(kid, Fmt::ANY)?;
                return Ok(match v {
                    Operand::Reg { lo, hi: Some(_) } if !ty.is_wide() => Operand::reg(lo),
                    other => other,
                });
            }
            return self.convert(id, kid, ty, src_ty);
        }

        if ty.is_float() && src_ty.is_integer() {
            let staged = match src_ty.class() {
                TyClass::I8 | TyClass::U8 | TyClass::I16 | TyClass::U16 => {
                    Some(self.stage(kid, CType::Int))
                }
                TyClass::U32 => Some(self.stage(kid, CType::LongLong)),
                _ => None,
            };
            let (kid, src_ty) = match staged {
                Some(s) => (s, self.dag.node(s).ty),
                None => (kid, src_ty),
            };
            return self.convert(id, kid, ty, src_ty);
        }

        if ty.is_integer() && src_ty.is_float() {
            let via = match ty.class() {
                TyClass::I32 | TyClass::I64 | TyClass::U64 => None,
                TyClass::U32 => Some(CType::LongLong),
                _ => Some(CType::Int),
            };
            let Some(via) = via else {
                return self.convert(id, kid, ty, src_ty);
            };
            let staged = self.stage(kid, via);
            let v = self.select(staged, Fmt::REG)?;
            let dst = match v {
                Operand::Reg { lo, hi } if ty.is_wide() => Operand::Reg { lo, hi },
                Operand::Reg { lo, .. } => Operand::reg(lo),
                other => other,
            };
            self.bind(id, dst)?;
            return Ok(dst);
        }

        if ty.is_float() && src_ty.is_float() {
            return self.convert(id, kid, ty, src_ty);
        }
        Err(CodegenError::unsupported(format!(
            "conversion from {src_ty:?} to {ty:?}"
        )))
    }

    /// One table-driven conversion instruction into fresh registers.
    fn convert(&mut self, id: NodeId, kid: NodeId, ty: CType, src_ty: CType) -> CodegenResult<Operand> {
        let (cls, src_cls) = (ty.class(), src_ty.class());
        let mask = self.tables.cvt.cvt_src_mask(cls, src_cls);
        if mask.is_empty() {
            return Err(CodegenError::SelectionMiss {
                table: "cvt",
                key: cvt_key(Fmt::REG, cls, Fmt::NONE, src_cls),
            });
        }
        let v = self.select(kid, mask)?;
        self.hold(&v);
        let dst = self.alloc_value(ty)?;
        self.release(&v)?;
        let opcode = self.tables.cvt.lookup(cvt_key(Fmt::REG, cls, v.fmt(), src_cls))?;
        self.emit(
            Instr::new(opcode, cls)
                .with_dst(dst)
                .with_src(v)
                .with_bytes(src_cls.width()),
        );
        self.bind(id, dst)?;
        Ok(dst)
    }

    fn select_call(&mut self, id: NodeId) -> CodegenResult<()> {
        let node = self.dag.node(id);
        let (ty, bytes, callee) = (node.ty, node.aux, self.kid(id, node.kids[0])?);
        let target_mask = Fmt::REG.union(Fmt::IMM).union(Fmt::MEM).union(Fmt::IND);
        let target = self.select(callee, target_mask)?;
        let opcode = self.tables.call.lookup(key(Fmt::NONE, target.fmt(), TyClass::U32))?;

        // Every register is clobbered by the callee.
        self.hold(&target);
        for reg in self.regs.allocatable().iter() {
            if !self.regs.is_pinned(reg) {
                self.free(reg)?;
            }
        }
        for reg in self.regs.allocatable().iter() {
            let users: Vec<NodeId> = self.regs.users(reg).iter().map(|u| u.node).collect();
            for user in users {
                let n = self.dag.node(user);
                if n.is_live_at(self.seq) && n.spill.is_none() {
                    self.spill(user)?;
                }
            }
        }
        self.emit(Instr::new(opcode, TyClass::U32).with_src(target));
        self.release(&target)?;
        self.flush_registers()?;

        if bytes > 0 {
            let pop = self.symbols.int_const(bytes, CType::UInt);
            self.emit(
                Instr::new(Opcode::Add, TyClass::U32)
                    .with_dst(Operand::reg(ESP))
                    .with_src(Operand::Imm(pop)),
            );
        }

        let result = match ty {
            CType::Void => Operand::Imm(self.symbols.int_const(0, CType::Int)),
            ty if ty.is_float() => Operand::reg(F0),
            ty if ty.is_wide() => Operand::pair(EAX, EDX),
            ty if ty.is_struct() => {
                return Err(CodegenError::invariant("struct call result in registers"))
            }
            _ => Operand::reg(EAX),
        };
        self.bind(id, result)
    }

    /// Push one outgoing argument.
    pub(crate) fn push_arg(&mut self, id: NodeId) -> CodegenResult<()> {
        let ty = self.dag.node(id).ty;
        let cls = ty.class();
        let mask = self.tables.push.src_mask(Fmt::NONE, cls);
        let v = self.select(id, mask)?;
        let opcode = self.tables.push.lookup(key(Fmt::NONE, v.fmt(), cls))?;
        self.emit(
            Instr::new(opcode, cls)
                .with_src(v)
                .with_bytes(round_to_slot(ty.size())),
        );
        Ok(())
    }

    /// Move a returned value into the return registers.
    pub(crate) fn return_value(&mut self, id: NodeId) -> CodegenResult<()> {
        let ty = self.dag.node(id).ty;
        if ty == CType::Void {
            return Ok(());
        }
        let cls = ty.class();
        let target = if ty.is_float() {
            Operand::reg(F0)
        } else if ty.is_wide() {
            Operand::pair(EAX, EDX)
        } else {
            Operand::reg(EAX)
        };
        let mask = self.tables.mov.src_mask(Fmt::REG, cls);
        let mut v = self.select(id, mask)?;
        if v == target {
            return Ok(());
        }
        let targets = target.regs();
        if v.regs().iter().any(|r| targets.contains(r)) {
            v = self.to_memory(id, v)?;
        }
        self.hold(&v);
        for &reg in &targets {
            self.free(reg)?;
        }
        self.release(&v)?;
        self.move_op(cls, target, v)
    }

    pub(crate) fn zero_fill(&mut self, addr: NodeId, bytes: u32) -> CodegenResult<()> {
        let addr = deref_address(self.select(addr, POINTER)?)?;
        self.emit(
            Instr::new(Opcode::ZeroFill, TyClass::Blk)
                .with_dst(Operand::Ind(addr))
                .with_bytes(bytes),
        );
        Ok(())
    }
}

/// Memory operand addressed by a pointer value.
fn deref_address(ptr: Operand) -> CodegenResult<Address> {
    match ptr {
        Operand::Mem(a) => Ok(a),
        Operand::Reg { lo, .. } => Ok(Address::based(lo, 0)),
        other => Err(CodegenError::invariant(format!(
            "{other:?} cannot be used as an address"
        ))),
    }
}
