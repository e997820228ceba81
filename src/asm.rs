//! Pseudo-assembly model handed to the textual emitter.
//!
//! Operands are a sum over the four addressing formats, instructions carry an
//! opcode from a fixed enum plus up to two operands, and each function's
//! instructions live in an index-based list that supports the splicing the
//! selector needs (the frame-enter size is patched after the body is done).

use crate::core::register_file::{reg_name, RegId};
use crate::core::symbols::{Symbol, SymbolKind, SymbolTable, TyClass};
use crate::dag::Cond;
use std::fmt::Write as _;

/// Bit set of operand formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Fmt(u8);

impl Fmt {
    pub const NONE: Fmt = Fmt(0);
    pub const REG: Fmt = Fmt(1);
    pub const IMM: Fmt = Fmt(2);
    /// An address value (symbol and/or frame offset), usable like an immediate.
    pub const MEM: Fmt = Fmt(4);
    /// The memory contents at an address.
    pub const IND: Fmt = Fmt(8);
    pub const ANY: Fmt = Fmt(15);

    pub const SINGLES: [Fmt; 4] = [Fmt::REG, Fmt::IMM, Fmt::MEM, Fmt::IND];

    pub const fn union(self, other: Fmt) -> Fmt {
        Fmt(self.0 | other.0)
    }

    pub const fn intersect(self, other: Fmt) -> Fmt {
        Fmt(self.0 & other.0)
    }

    pub fn contains(self, other: Fmt) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0 as u32
    }

    pub fn from_bits(bits: u8) -> Fmt {
        Fmt(bits & Fmt::ANY.0)
    }

    /// The single formats set in this mask.
    pub fn singles(self) -> impl Iterator<Item = Fmt> {
        Fmt::SINGLES.into_iter().filter(move |f| self.contains(*f))
    }
}

/// Base register + symbol displacement + constant displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Option<RegId>,
    pub sym: Option<Symbol>,
    pub disp: i32,
}

impl Address {
    pub fn symbol(sym: Symbol) -> Self {
        Self {
            base: None,
            sym: Some(sym),
            disp: 0,
        }
    }

    pub fn based(base: RegId, disp: i32) -> Self {
        Self {
            base: Some(base),
            sym: None,
            disp,
        }
    }
}

/// Assembly operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// One register, or a low/high pair for wide integers.
    Reg { lo: RegId, hi: Option<RegId> },
    /// Constant symbol.
    Imm(Symbol),
    /// Address value.
    Mem(Address),
    /// Memory at an address.
    Ind(Address),
}

impl Operand {
    pub fn reg(lo: RegId) -> Self {
        Operand::Reg { lo, hi: None }
    }

    pub fn pair(lo: RegId, hi: RegId) -> Self {
        Operand::Reg { lo, hi: Some(hi) }
    }

    pub fn fmt(&self) -> Fmt {
        match self {
            Operand::Reg { .. } => Fmt::REG,
            Operand::Imm(_) => Fmt::IMM,
            Operand::Mem(_) => Fmt::MEM,
            Operand::Ind(_) => Fmt::IND,
        }
    }

    /// Registers the operand reads, including address bases.
    pub fn regs(&self) -> Vec<RegId> {
        match *self {
            Operand::Reg { lo, hi } => std::iter::once(lo).chain(hi).collect(),
            Operand::Mem(a) | Operand::Ind(a) => a.base.into_iter().collect(),
            Operand::Imm(_) => Vec::new(),
        }
    }
}

/// Opcodes of the pseudo target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Lea,
    Movsx,
    Movzx,
    Add,
    Sub,
    Mul,
    Div,
    Udiv,
    Mod,
    Umod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Neg,
    Not,
    Cmp,
    Set(Cond),
    Jmp,
    Jcc(Cond),
    Push,
    Call,
    /// Call through a function pointer held in memory.
    CallInd,
    Ret,
    Enter,
    Leave,
    Fld,
    Fst,
    Fild,
    Fist,
    /// `fild` of an unsigned 64-bit integer.
    Ufild,
    /// `fist` to an unsigned 64-bit integer.
    Ufist,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fchs,
    Fcmp,
    /// Float width conversion.
    Fcvt,
    /// Block copy of `bytes` bytes.
    Copy,
    /// Zero `bytes` bytes.
    ZeroFill,
    Label,
}

impl Opcode {
    pub fn mnemonic(self) -> String {
        match self {
            Opcode::Set(c) => format!("set{}", c.mnemonic()),
            Opcode::Jcc(c) => format!("j{}", c.mnemonic()),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

/// One pseudo-assembly instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub ty: TyClass,
    pub dst: Option<Operand>,
    pub src: Option<Operand>,
    /// Branch target label.
    pub target: Option<Symbol>,
    /// Byte count for pushes, copies, fills and frame sizes.
    pub bytes: u32,
    pub seq: u32,
}

impl Instr {
    pub fn new(op: Opcode, ty: TyClass) -> Self {
        Self {
            op,
            ty,
            dst: None,
            src: None,
            target: None,
            bytes: 0,
            seq: 0,
        }
    }

    pub fn with_dst(mut self, dst: Operand) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn with_src(mut self, src: Operand) -> Self {
        self.src = Some(src);
        self
    }

    pub fn with_target(mut self, target: Symbol) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_bytes(mut self, bytes: u32) -> Self {
        self.bytes = bytes;
        self
    }

    /// Human-readable listing line, for logs and diagnostics.
    pub fn listing(&self, symbols: &SymbolTable) -> String {
        if self.op == Opcode::Label {
            return match self.target {
                Some(l) => format!("{}:", symbols.name(l)),
                None => "?:".to_string(),
            };
        }
        let mut line = format!("    {}.{:?}", self.op.mnemonic(), self.ty).to_lowercase();
        let operands: Vec<String> = self
            .dst
            .iter()
            .chain(self.src.iter())
            .map(|o| operand_listing(o, symbols))
            .chain(self.target.map(|t| symbols.name(t).to_string()))
            .collect();
        if !operands.is_empty() {
            let _ = write!(line, " {}", operands.join(", "));
        }
        if self.bytes != 0 {
            let _ = write!(line, " #{}", self.bytes);
        }
        line
    }
}

fn address_listing(a: &Address, symbols: &SymbolTable) -> String {
    let mut out = String::new();
    if let Some(sym) = a.sym {
        out.push_str(symbols.name(sym));
        if a.disp != 0 {
            let _ = write!(out, "{:+}", a.disp);
        }
    } else if a.disp != 0 || a.base.is_none() {
        let _ = write!(out, "{}", a.disp);
    }
    if let Some(base) = a.base {
        let _ = write!(out, "({})", reg_name(base));
    }
    out
}

pub fn operand_listing(op: &Operand, symbols: &SymbolTable) -> String {
    match op {
        Operand::Reg { lo, hi: None } => reg_name(*lo).to_string(),
        Operand::Reg { lo, hi: Some(hi) } => format!("{}:{}", reg_name(*hi), reg_name(*lo)),
        Operand::Imm(sym) => match symbols.kind(*sym) {
            SymbolKind::IntConst(v) => format!("${v}"),
            _ => format!("${}", symbols.name(*sym)),
        },
        Operand::Mem(a) => format!("&{}", address_listing(a, symbols)),
        Operand::Ind(a) => format!("[{}]", address_listing(a, symbols)),
    }
}

/// Position of an instruction in an [`InstrList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(u32);

#[derive(Debug, Clone)]
struct Slot {
    instr: Option<Instr>,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Ordered instruction list backed by a vector with a free list.
#[derive(Debug, Clone, Default)]
pub struct InstrList {
    slots: Vec<Slot>,
    head: Option<u32>,
    tail: Option<u32>,
    free: Vec<u32>,
    len: usize,
}

impl InstrList {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, instr: Instr) -> u32 {
        let slot = Slot {
            instr: Some(instr),
            prev: None,
            next: None,
        };
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn link(&mut self, idx: u32, prev: Option<u32>, next: Option<u32>) {
        self.slots[idx as usize].prev = prev;
        self.slots[idx as usize].next = next;
        match prev {
            Some(p) => self.slots[p as usize].next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.slots[n as usize].prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    pub fn append(&mut self, instr: Instr) -> InstrId {
        let idx = self.alloc(instr);
        let tail = self.tail;
        self.link(idx, tail, None);
        InstrId(idx)
    }

    pub fn insert_before(&mut self, at: InstrId, instr: Instr) -> InstrId {
        let idx = self.alloc(instr);
        let prev = self.slots[at.0 as usize].prev;
        self.link(idx, prev, Some(at.0));
        InstrId(idx)
    }

    pub fn insert_after(&mut self, at: InstrId, instr: Instr) -> InstrId {
        let idx = self.alloc(instr);
        let next = self.slots[at.0 as usize].next;
        self.link(idx, Some(at.0), next);
        InstrId(idx)
    }

    pub fn remove(&mut self, id: InstrId) -> Option<Instr> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let instr = slot.instr.take()?;
        let (prev, next) = (slot.prev, slot.next);
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(id.0);
        self.len -= 1;
        Some(instr)
    }

    pub fn get(&self, id: InstrId) -> Option<&Instr> {
        self.slots.get(id.0 as usize)?.instr.as_ref()
    }

    pub fn get_mut(&mut self, id: InstrId) -> Option<&mut Instr> {
        self.slots.get_mut(id.0 as usize)?.instr.as_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ids(&self) -> InstrIds<'_> {
        InstrIds {
            list: self,
            cursor: self.head,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instr> {
        self.ids().filter_map(move |id| self.get(id))
    }

    pub fn listing(&self, symbols: &SymbolTable) -> String {
        self.iter()
            .map(|i| i.listing(symbols))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Iterator over instruction ids in program order.
pub struct InstrIds<'a> {
    list: &'a InstrList,
    cursor: Option<u32>,
}

impl Iterator for InstrIds<'_> {
    type Item = InstrId;

    fn next(&mut self) -> Option<InstrId> {
        let idx = self.cursor?;
        self.cursor = self.list.slots[idx as usize].next;
        Some(InstrId(idx))
    }
}
