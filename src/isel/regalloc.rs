//! On-the-fly register allocation for the selector.
//!
//! Registers are handed out while instructions are selected. A register is
//! reusable as soon as every value it holds is dead (no pending consumers, or
//! last referenced before the current code). When every candidate holds a
//! live value, the one whose values are needed furthest in the future is
//! spilled to a frame temporary and reloaded on its next use. When every
//! candidate is pinned, the oldest operand still waiting for its consumer is
//! moved to memory instead.

use crate::asm::{Address, Fmt, Instr, Operand};
use crate::codegen::CodegenContext;
use crate::core::error::{CodegenError, CodegenResult};
use crate::core::register_file::{reg_name, RegAllocError, RegChoice, RegId, RegMask, EBP};
use crate::core::symbols::CType;
use crate::dag::{NodeId, Op};
use crate::isel::tables::key;
use log::{debug, trace};

/// An operand pinned while sibling operands are selected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeldValue {
    id: NodeId,
    op: Operand,
    /// Moved to memory to free its registers.
    demoted: bool,
}

impl CodegenContext<'_> {
    /// Whether a value can be recomputed from its operator alone.
    fn rematerializable(&self, id: NodeId) -> bool {
        matches!(self.dag.node(id).op, Op::Const | Op::Addr)
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.dag.node(id).is_live_at(self.seq)
    }

    /// Drop the associations of registers in `mask` whose values are all dead.
    fn reap(&mut self, mask: RegMask) -> CodegenResult<()> {
        for reg in mask.iter() {
            if self.regs.is_pinned(reg) || self.regs.users(reg).is_empty() {
                continue;
            }
            let users: Vec<NodeId> = self.regs.users(reg).iter().map(|u| u.node).collect();
            if users.iter().all(|&u| !self.is_live(u)) {
                for user in users {
                    self.drop_location(user)?;
                }
            }
        }
        Ok(())
    }

    /// Hand out one register from `mask`, evicting if necessary.
    pub(crate) fn alloc(&mut self, mask: RegMask) -> CodegenResult<RegId> {
        self.reap(mask)?;
        let choice = loop {
            match self.regs.choose(mask, self.seq) {
                Ok(choice) => break choice,
                Err(RegAllocError::NoRegistersAvailable(m)) => {
                    if !self.demote_held(mask)? {
                        return Err(RegAllocError::NoRegistersAvailable(m).into());
                    }
                    self.reap(mask)?;
                }
                Err(err) => return Err(err.into()),
            }
        };
        if let RegChoice::Evict(reg) = choice {
            self.stats.evictions += 1;
            debug!("evicting {} at {}", reg_name(reg), self.seq);
        }
        let reg = choice.reg();
        self.free(reg)?;
        Ok(reg)
    }

    /// Registers for a fresh value of type `ty`: one FP register, a GP pair
    /// for wide integers, or one GP register.
    pub(crate) fn alloc_value(&mut self, ty: CType) -> CodegenResult<Operand> {
        if ty.is_float() {
            return Ok(Operand::reg(self.alloc(RegMask::FP)?));
        }
        let lo = self.alloc(RegMask::GP)?;
        if !ty.is_wide() {
            return Ok(Operand::reg(lo));
        }
        self.regs.mark_used(lo);
        let hi = self.alloc(RegMask::GP);
        self.regs.unmark_used(lo)?;
        Ok(Operand::pair(lo, hi?))
    }

    /// Empty `reg`, storing live values that have no memory copy yet.
    pub(crate) fn free(&mut self, reg: RegId) -> CodegenResult<()> {
        let users: Vec<NodeId> = self.regs.users(reg).iter().map(|u| u.node).collect();
        for user in users {
            let node = self.dag.node(user);
            if self.is_live(user) && node.spill.is_none() && !self.rematerializable(user) {
                self.spill(user)?;
            }
            self.drop_location(user)?;
        }
        Ok(())
    }

    /// Empty every allocatable register; used at block boundaries and calls.
    pub(crate) fn flush_registers(&mut self) -> CodegenResult<()> {
        for reg in self.regs.allocatable().iter() {
            self.free(reg)?;
        }
        Ok(())
    }

    /// Store a register-resident value into a frame temporary.
    pub(crate) fn spill(&mut self, id: NodeId) -> CodegenResult<i32> {
        let node = self.dag.node(id);
        let (ty, last_ref) = (node.ty, node.last_ref);
        let Some(src @ Operand::Reg { .. }) = node.loc else {
            return Err(CodegenError::invariant(format!(
                "spilling {id:?} which is not in a register"
            )));
        };
        let slot = self
            .frame
            .get_or_alloc_temp(self.seq, id, ty.size(), last_ref);
        let dst = Operand::Ind(Address::based(EBP, slot));
        let cls = ty.class();
        let opcode = self.tables.mov.lookup(key(Fmt::IND, Fmt::REG, cls))?;
        self.emit(Instr::new(opcode, cls).with_dst(dst).with_src(src));
        self.dag.node_mut(id).spill = Some(slot);
        self.stats.spills += 1;
        trace!("spilled {id:?} to {slot}(ebp)");
        Ok(slot)
    }

    /// Forget the registers holding `id`; its location falls back to the
    /// spill slot if it has one.
    pub(crate) fn drop_location(&mut self, id: NodeId) -> CodegenResult<()> {
        let node = self.dag.node(id);
        if let Some(Operand::Reg { lo, hi }) = node.loc {
            self.regs.dissociate(lo, id, 0)?;
            if let Some(hi) = hi {
                self.regs.dissociate(hi, id, 1)?;
            }
        }
        let node = self.dag.node_mut(id);
        if matches!(node.loc, Some(Operand::Reg { .. }) | None) {
            node.loc = node.spill.map(|slot| Operand::Ind(Address::based(EBP, slot)));
        }
        Ok(())
    }

    /// Make `op` the current location of `id`.
    pub(crate) fn bind(&mut self, id: NodeId, op: Operand) -> CodegenResult<()> {
        if matches!(self.dag.node(id).loc, Some(Operand::Reg { .. })) {
            self.drop_location(id)?;
        }
        let last_ref = self.dag.node(id).last_ref;
        if let Operand::Reg { lo, hi } = op {
            self.regs.associate(lo, id, 0, last_ref)?;
            if let Some(hi) = hi {
                self.regs.associate(hi, id, 1, last_ref)?;
            }
        }
        self.dag.node_mut(id).loc = Some(op);
        Ok(())
    }

    /// Pin the registers an operand reads until `release`.
    pub(crate) fn hold(&mut self, op: &Operand) {
        for reg in op.regs() {
            self.regs.mark_used(reg);
        }
    }

    pub(crate) fn release(&mut self, op: &Operand) -> CodegenResult<()> {
        for reg in op.regs() {
            self.regs.unmark_used(reg)?;
        }
        Ok(())
    }

    /// Pin the value `op` of `id` like `hold`, but let the allocator move it
    /// to memory if it runs out of registers before `take_held`.
    pub(crate) fn hold_value(&mut self, id: NodeId, op: Operand) {
        self.hold(&op);
        self.held.push(HeldValue {
            id,
            op,
            demoted: false,
        });
    }

    /// Finish the innermost `hold_value`, returning the value in one of the
    /// formats in `mask`. The result is pinned until `release`.
    pub(crate) fn take_held(&mut self, mask: Fmt) -> CodegenResult<Operand> {
        let held = self
            .held
            .pop()
            .ok_or_else(|| CodegenError::invariant("take_held without a held value"))?;
        if !held.demoted {
            return Ok(held.op);
        }
        let op = self.coerce(held.id, held.op, mask)?;
        self.hold(&op);
        Ok(op)
    }

    /// Store the oldest held register value using registers of `mask` and
    /// unpin it. Returns false when there is none.
    fn demote_held(&mut self, mask: RegMask) -> CodegenResult<bool> {
        let Some(pos) = self.held.iter().position(|h| {
            !h.demoted
                && matches!(h.op, Operand::Reg { .. })
                && h.op.regs().iter().any(|&r| mask.contains(r))
        }) else {
            return Ok(false);
        };
        let HeldValue { id, op, .. } = self.held[pos];
        let stored = self.dag.node(id).spill.is_none();
        let mem = self.to_memory(id, op)?;
        self.release(&op)?;
        let held = &mut self.held[pos];
        held.op = mem;
        held.demoted = true;
        self.stats.evictions += 1;
        if stored {
            self.stats.spills += 1;
        }
        debug!("demoted held {id:?} to memory at {}", self.seq);
        Ok(true)
    }

    /// Turn a register operand into a destination the caller may overwrite.
    ///
    /// When every value in the registers is dead they are taken over;
    /// otherwise the value is copied into fresh registers first.
    pub(crate) fn claim(&mut self, op: Operand, ty: CType) -> CodegenResult<Operand> {
        let regs = op.regs();
        let dead = regs.iter().all(|&r| {
            self.regs
                .users(r)
                .iter()
                .all(|u| !self.dag.node(u.node).is_live_at(self.seq))
        });
        if dead {
            for reg in regs {
                let users: Vec<NodeId> = self.regs.users(reg).iter().map(|u| u.node).collect();
                for user in users {
                    self.drop_location(user)?;
                }
            }
            return Ok(op);
        }
        let dst = self.alloc_value(ty)?;
        let cls = ty.class();
        let opcode = self.tables.mov.lookup(key(Fmt::REG, Fmt::REG, cls))?;
        self.emit(Instr::new(opcode, cls).with_dst(dst).with_src(op));
        Ok(dst)
    }
}
