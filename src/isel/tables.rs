//! Flat instruction-selection tables.
//!
//! Each table is a list of `(packed key, opcode)` pairs built from a short
//! rule list. A key packs the destination format, source format and type
//! class (and, for conversions, the source type class); lookups are linear
//! scans. The selector also asks a table which source formats it accepts for
//! a given destination, which is how operand masks are derived.

use crate::asm::{Fmt, Opcode};
use crate::core::error::{CodegenError, CodegenResult};
use crate::core::symbols::TyClass;
use crate::core::symbols::TyClass::{Blk, F32, F64, I16, I32, I64, I8, U16, U32, U64, U8};
use crate::dag::Op;

/// Pack `(dst format, src format, type)` into a table key.
pub fn key(dst: Fmt, src: Fmt, ty: TyClass) -> u32 {
    dst.bits() | (src.bits() << 4) | (ty.bits() << 8)
}

/// Conversion key: `key(dst, src, dst_ty)` plus the source type.
pub fn cvt_key(dst: Fmt, dst_ty: TyClass, src: Fmt, src_ty: TyClass) -> u32 {
    key(dst, src, dst_ty) | (src_ty.bits() << 12)
}

fn dst_of(key: u32) -> u32 {
    key & 0xf
}

fn src_of(key: u32) -> u8 {
    ((key >> 4) & 0xf) as u8
}

fn ty_of(key: u32) -> u32 {
    (key >> 8) & 0xf
}

fn src_ty_of(key: u32) -> u32 {
    (key >> 12) & 0xf
}

/// A group of entries sharing one opcode.
struct Rule {
    dst: Fmt,
    src: Fmt,
    tys: &'static [TyClass],
    op: Opcode,
}

const fn rule(dst: Fmt, src: Fmt, tys: &'static [TyClass], op: Opcode) -> Rule {
    Rule { dst, src, tys, op }
}

struct CvtRule {
    dst_tys: &'static [TyClass],
    src: Fmt,
    src_tys: &'static [TyClass],
    op: Opcode,
}

const fn cvt(
    dst_tys: &'static [TyClass],
    src: Fmt,
    src_tys: &'static [TyClass],
    op: Opcode,
) -> CvtRule {
    CvtRule {
        dst_tys,
        src,
        src_tys,
        op,
    }
}

const INTS: &[TyClass] = &TyClass::INTS;
const FLOATS: &[TyClass] = &TyClass::FLOATS;
const SIGNED: &[TyClass] = &[I8, I16, I32, I64];
const UNSIGNED: &[TyClass] = &[U8, U16, U32, U64];
const PTR: &[TyClass] = &[U32];

const R: Fmt = Fmt::REG;
const I: Fmt = Fmt::IMM;
const M: Fmt = Fmt::MEM;
const N: Fmt = Fmt::IND;
const NONE: Fmt = Fmt::NONE;
const RIN: Fmt = R.union(I).union(N);
const RN: Fmt = R.union(N);
const RI: Fmt = R.union(I);

const MOVE: &[Rule] = &[
    rule(R, RIN, INTS, Opcode::Mov),
    rule(R, M, PTR, Opcode::Lea),
    rule(N, RI, INTS, Opcode::Mov),
    rule(N, M, PTR, Opcode::Mov),
    rule(R, RIN, FLOATS, Opcode::Fld),
    rule(N, R, FLOATS, Opcode::Fst),
    rule(N, N, &[Blk], Opcode::Copy),
];

const fn arith(int_op: Opcode, float_op: Opcode) -> [Rule; 3] {
    [
        rule(R, RIN, INTS, int_op),
        rule(R, M, PTR, int_op),
        rule(R, RN, FLOATS, float_op),
    ]
}

const ADD: [Rule; 3] = arith(Opcode::Add, Opcode::Fadd);
const SUB: [Rule; 3] = arith(Opcode::Sub, Opcode::Fsub);

const MUL: &[Rule] = &[
    rule(R, RIN, INTS, Opcode::Mul),
    rule(R, RN, FLOATS, Opcode::Fmul),
];

const DIV: &[Rule] = &[
    rule(R, RN, SIGNED, Opcode::Div),
    rule(R, RN, UNSIGNED, Opcode::Udiv),
    rule(R, RN, FLOATS, Opcode::Fdiv),
];

const MOD: &[Rule] = &[
    rule(R, RN, SIGNED, Opcode::Mod),
    rule(R, RN, UNSIGNED, Opcode::Umod),
];

const AND: &[Rule] = &[rule(R, RIN, INTS, Opcode::And)];
const OR: &[Rule] = &[rule(R, RIN, INTS, Opcode::Or)];
const XOR: &[Rule] = &[rule(R, RIN, INTS, Opcode::Xor)];
const SHL: &[Rule] = &[rule(R, RI, INTS, Opcode::Shl)];
const SHR: &[Rule] = &[
    rule(R, RI, SIGNED, Opcode::Sar),
    rule(R, RI, UNSIGNED, Opcode::Shr),
];

// Unary tables key on the operand format alone.
const NEG: &[Rule] = &[
    rule(RN, NONE, INTS, Opcode::Neg),
    rule(R, NONE, FLOATS, Opcode::Fchs),
];
const COMPL: &[Rule] = &[rule(RN, NONE, INTS, Opcode::Not)];

const CMP: &[Rule] = &[
    rule(R, RIN, INTS, Opcode::Cmp),
    rule(R, M, PTR, Opcode::Cmp),
    rule(N, RI, INTS, Opcode::Cmp),
    rule(R, RN, FLOATS, Opcode::Fcmp),
];

const PUSH: &[Rule] = &[
    rule(NONE, RIN, INTS, Opcode::Push),
    rule(NONE, M, PTR, Opcode::Push),
    rule(NONE, RN, FLOATS, Opcode::Push),
    rule(NONE, N, &[Blk], Opcode::Push),
];

const CALL: &[Rule] = &[
    rule(NONE, R.union(M).union(I), PTR, Opcode::Call),
    rule(NONE, N, PTR, Opcode::CallInd),
];

const CVT: &[CvtRule] = &[
    cvt(&[I16, U16, I32, U32, I64, U64], RN, &[I8], Opcode::Movsx),
    cvt(&[I16, U16, I32, U32, I64, U64], RN, &[U8], Opcode::Movzx),
    cvt(&[I32, U32, I64, U64], RN, &[I16], Opcode::Movsx),
    cvt(&[I32, U32, I64, U64], RN, &[U16], Opcode::Movzx),
    cvt(&[I64, U64], RIN, &[I32], Opcode::Movsx),
    cvt(&[I64, U64], RIN, &[U32], Opcode::Movzx),
    cvt(FLOATS, N, &[I32, I64], Opcode::Fild),
    cvt(FLOATS, N, &[U64], Opcode::Ufild),
    cvt(&[I32, I64], R, FLOATS, Opcode::Fist),
    cvt(&[U64], R, FLOATS, Opcode::Ufist),
    cvt(&[F64], RN, &[F32], Opcode::Fcvt),
    cvt(&[F32], RN, &[F64], Opcode::Fcvt),
];

/// One packed-key lookup table.
#[derive(Debug, Clone)]
pub struct Table {
    name: &'static str,
    entries: Vec<(u32, Opcode)>,
}

impl Table {
    fn from_rules(name: &'static str, rules: &[Rule]) -> Self {
        let mut entries = Vec::new();
        for r in rules {
            for &ty in r.tys {
                for dst in fmts(r.dst) {
                    for src in fmts(r.src) {
                        entries.push((key(dst, src, ty), r.op));
                    }
                }
            }
        }
        Self { name, entries }
    }

    fn from_cvt_rules(name: &'static str, rules: &[CvtRule]) -> Self {
        let mut entries = Vec::new();
        for r in rules {
            for &dst_ty in r.dst_tys {
                for &src_ty in r.src_tys {
                    for src in r.src.singles() {
                        entries.push((cvt_key(Fmt::REG, dst_ty, src, src_ty), r.op));
                    }
                }
            }
        }
        Self { name, entries }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: u32) -> CodegenResult<Opcode> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|&(_, op)| op)
            .ok_or(CodegenError::SelectionMiss {
                table: self.name,
                key,
            })
    }

    /// Source formats accepted for destination `dst` at `ty`.
    pub fn src_mask(&self, dst: Fmt, ty: TyClass) -> Fmt {
        self.entries
            .iter()
            .filter(|(k, _)| dst_of(*k) == dst.bits() && ty_of(*k) == ty.bits())
            .fold(Fmt::NONE, |acc, (k, _)| acc.union(Fmt::from_bits(src_of(*k))))
    }

    /// Destination formats accepted with source `src` at `ty`.
    pub fn dst_mask(&self, src: Fmt, ty: TyClass) -> Fmt {
        self.entries
            .iter()
            .filter(|(k, _)| src_of(*k) as u32 == src.bits() && ty_of(*k) == ty.bits())
            .fold(Fmt::NONE, |acc, (k, _)| acc.union(Fmt::from_bits(dst_of(*k) as u8)))
    }

    /// Source formats accepted by a conversion table for `src_ty -> dst_ty`.
    pub fn cvt_src_mask(&self, dst_ty: TyClass, src_ty: TyClass) -> Fmt {
        self.entries
            .iter()
            .filter(|(k, _)| {
                dst_of(*k) == Fmt::REG.bits()
                    && ty_of(*k) == dst_ty.bits()
                    && src_ty_of(*k) == src_ty.bits()
            })
            .fold(Fmt::NONE, |acc, (k, _)| acc.union(Fmt::from_bits(src_of(*k))))
    }
}

/// Single formats of a rule mask; `NONE` stands for "no operand".
fn fmts(mask: Fmt) -> Vec<Fmt> {
    if mask.is_empty() {
        vec![Fmt::NONE]
    } else {
        mask.singles().collect()
    }
}

/// All tables the selector consults.
#[derive(Debug, Clone)]
pub struct SelectionTables {
    pub mov: Table,
    add: Table,
    sub: Table,
    mul: Table,
    div: Table,
    rem: Table,
    and: Table,
    or: Table,
    xor: Table,
    shl: Table,
    shr: Table,
    neg: Table,
    compl: Table,
    pub cmp: Table,
    pub cvt: Table,
    pub push: Table,
    pub call: Table,
}

impl SelectionTables {
    pub fn new() -> Self {
        Self {
            mov: Table::from_rules("move", MOVE),
            add: Table::from_rules("add", &ADD),
            sub: Table::from_rules("sub", &SUB),
            mul: Table::from_rules("mul", MUL),
            div: Table::from_rules("div", DIV),
            rem: Table::from_rules("mod", MOD),
            and: Table::from_rules("and", AND),
            or: Table::from_rules("or", OR),
            xor: Table::from_rules("xor", XOR),
            shl: Table::from_rules("shl", SHL),
            shr: Table::from_rules("shr", SHR),
            neg: Table::from_rules("neg", NEG),
            compl: Table::from_rules("compl", COMPL),
            cmp: Table::from_rules("cmp", CMP),
            cvt: Table::from_cvt_rules("cvt", CVT),
            push: Table::from_rules("push", PUSH),
            call: Table::from_rules("call", CALL),
        }
    }

    /// Table for a binary or unary DAG operator.
    pub fn for_op(&self, op: Op) -> CodegenResult<&Table> {
        Ok(match op {
            Op::Add => &self.add,
            Op::Sub => &self.sub,
            Op::Mul => &self.mul,
            Op::Div => &self.div,
            Op::Mod => &self.rem,
            Op::And => &self.and,
            Op::Or => &self.or,
            Op::Xor => &self.xor,
            Op::Shl => &self.shl,
            Op::Shr => &self.shr,
            Op::Neg => &self.neg,
            Op::Compl => &self.compl,
            other => {
                return Err(CodegenError::invariant(format!(
                    "no operator table for {other:?}"
                )))
            }
        })
    }
}

impl Default for SelectionTables {
    fn default() -> Self {
        Self::new()
    }
}
