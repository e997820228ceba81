// This module implements a reference interpreter for the pseudo-assembly the backend produces.
// It models a flat little-endian memory image with globals laid out from a fixed base, a
// downward-growing stack, six general registers plus the frame and stack pointers, two
// floating registers and a comparison flag. General registers hold 32 bits; reads narrow or
// extend by the instruction's type class, so narrowing conversions need no code. Functions are
// identified by synthetic addresses, which lets direct calls, calls through pointers and calls
// to host closures share one path. The interpreter is how tests check that generated code
// computes what the source expression means, including across spills and calls.

//! Reference interpreter for compiled functions.

use crate::asm::{Address, Instr, Opcode, Operand};
use crate::codegen::CompiledFunction;
use crate::core::frame::round_to_slot;
use crate::core::register_file::{RegId, EAX, EBP, EDX, ESP, F0};
use crate::core::symbols::{CType, Symbol, SymbolKind, SymbolTable, TyClass};
use hashbrown::HashMap;
use log::{debug, trace};
use std::cmp::Ordering;
use thiserror::Error;

pub const MEMORY_SIZE: usize = 1 << 16;
/// Address of the first global.
pub const GLOBAL_BASE: u32 = 0x100;
/// Functions live at `FUNCTION_BASE + symbol index`.
pub const FUNCTION_BASE: u32 = 0xF000_0000;
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

const RETURN_TOKEN: u32 = 0xFFFF_FFF0;

/// A scalar crossing the interpreter boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Void,
}

impl Value {
    pub fn as_int(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Float(f) => f as i64,
            Value::Void => 0,
        }
    }

    pub fn as_float(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(f) => f,
            Value::Void => 0.0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    #[error("access of {len} bytes at {addr:#x} is outside memory")]
    BadAddress { addr: u64, len: u32 },
    #[error("call of unknown function address {0:#x}")]
    UnknownFunction(u32),
    #[error("function {0} has not been loaded")]
    NotLoaded(String),
    #[error("undefined label {0}")]
    UndefinedLabel(String),
    #[error("division by zero")]
    DivideByZero,
    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),
    #[error("expected {expected} arguments, got {got}")]
    ArgCount { expected: usize, got: usize },
    #[error("malformed instruction: {0}")]
    Malformed(String),
}

pub type VmResult<T> = Result<T, VmError>;

/// Outgoing arguments of a host call, read from the stack.
pub struct HostArgs<'m> {
    mem: &'m [u8],
    sp: u32,
}

impl HostArgs<'_> {
    fn bytes<const N: usize>(&self, offset: u32) -> [u8; N] {
        let start = (self.sp + offset) as usize;
        let mut out = [0u8; N];
        if let Some(src) = self.mem.get(start..start + N) {
            out.copy_from_slice(src);
        }
        out
    }

    /// The `idx`-th 4-byte argument slot.
    pub fn word(&self, idx: u32) -> u32 {
        u32::from_le_bytes(self.bytes(idx * 4))
    }

    pub fn int(&self, idx: u32) -> i32 {
        self.word(idx) as i32
    }

    /// A double starting at argument slot `idx`.
    pub fn double(&self, idx: u32) -> f64 {
        f64::from_le_bytes(self.bytes(idx * 4))
    }
}

type HostFn<'p> = Box<dyn FnMut(&HostArgs<'_>) -> Value + 'p>;

struct Loaded {
    code: Vec<Instr>,
    labels: HashMap<Symbol, usize>,
    ret: CType,
    params: Vec<Symbol>,
}

/// Interpreter state.
pub struct Machine<'p> {
    symbols: &'p SymbolTable,
    mem: Vec<u8>,
    gp: [u32; 8],
    fp: [f64; 2],
    flags: Option<Ordering>,
    globals: HashMap<Symbol, u32>,
    functions: HashMap<Symbol, Loaded>,
    hosts: HashMap<Symbol, HostFn<'p>>,
    by_address: HashMap<u32, Symbol>,
    step_limit: u64,
    steps: u64,
}

impl<'p> Machine<'p> {
    pub fn new(symbols: &'p SymbolTable) -> Self {
        let mut globals = HashMap::new();
        let mut next = GLOBAL_BASE;
        for g in symbols.globals() {
            globals.insert(g, next);
            next += round_to_slot(symbols.ty(g).size());
        }
        Self {
            symbols,
            mem: vec![0; MEMORY_SIZE],
            gp: [0; 8],
            fp: [0.0; 2],
            flags: None,
            globals,
            functions: HashMap::new(),
            hosts: HashMap::new(),
            by_address: HashMap::new(),
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn function_address(sym: Symbol) -> u32 {
        FUNCTION_BASE + sym.index() as u32
    }

    pub fn load(&mut self, func: &CompiledFunction) {
        let code: Vec<Instr> = func.code.iter().cloned().collect();
        let labels = code
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Opcode::Label)
            .filter_map(|(idx, i)| i.target.map(|t| (t, idx)))
            .collect();
        self.by_address.insert(Self::function_address(func.name), func.name);
        self.functions.insert(
            func.name,
            Loaded {
                code,
                labels,
                ret: func.ret,
                params: func.params.clone(),
            },
        );
        debug!("loaded {}", self.symbols.name(func.name));
    }

    /// Bind a function symbol to a host closure.
    pub fn host(&mut self, sym: Symbol, f: impl FnMut(&HostArgs<'_>) -> Value + 'p) {
        self.by_address.insert(Self::function_address(sym), sym);
        self.hosts.insert(sym, Box::new(f));
    }

    pub fn global_address(&self, sym: Symbol) -> Option<u32> {
        self.globals.get(&sym).copied()
    }

    fn global(&self, sym: Symbol) -> VmResult<u32> {
        self.global_address(sym)
            .ok_or_else(|| VmError::Malformed(format!("{} is not a global", self.symbols.name(sym))))
    }

    pub fn read_global(&self, sym: Symbol) -> VmResult<Value> {
        let addr = self.global(sym)?;
        self.read_mem(addr, self.symbols.ty(sym).class())
    }

    pub fn write_global(&mut self, sym: Symbol, value: Value) -> VmResult<()> {
        let addr = self.global(sym)?;
        self.write_mem(addr, self.symbols.ty(sym).class(), value)
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> VmResult<&[u8]> {
        let start = addr as usize;
        self.mem
            .get(start..start + len as usize)
            .ok_or(VmError::BadAddress {
                addr: addr as u64,
                len,
            })
    }

    /// Call a loaded function with arguments in source order.
    ///
    /// Struct results are written to a stack buffer whose address is returned.
    pub fn call(&mut self, sym: Symbol, args: &[Value]) -> VmResult<Value> {
        let loaded = self
            .functions
            .get(&sym)
            .ok_or_else(|| VmError::NotLoaded(self.symbols.name(sym).to_string()))?;
        let (ret, params) = (loaded.ret, loaded.params.clone());
        let visible = if ret.is_struct() { &params[1..] } else { &params[..] };
        if visible.len() != args.len() {
            return Err(VmError::ArgCount {
                expected: visible.len(),
                got: args.len(),
            });
        }

        self.gp = [0; 8];
        self.gp[ESP as usize] = MEMORY_SIZE as u32;
        let out = if ret.is_struct() {
            self.gp[ESP as usize] -= round_to_slot(ret.size());
            Some(self.gp[ESP as usize])
        } else {
            None
        };
        for (param, arg) in visible.iter().zip(args).rev() {
            let ty = self.symbols.ty(*param);
            self.push_value(*arg, ty.class(), round_to_slot(ty.size()))?;
        }
        if let Some(out) = out {
            self.push_value(Value::Int(out as i64), TyClass::U32, 4)?;
        }
        self.push_word(RETURN_TOKEN)?;
        self.run(sym)?;

        Ok(match ret {
            CType::Void => Value::Void,
            _ if ret.is_struct() => Value::Int(out.unwrap_or(0) as i64),
            _ if ret.is_float() => Value::Float(narrow_float(self.fp[0], ret.class())),
            _ if ret.is_wide() => {
                let raw = (self.gp[EDX as usize] as u64) << 32 | self.gp[EAX as usize] as u64;
                Value::Int(raw as i64)
            }
            _ => Value::Int(normalize(self.gp[EAX as usize] as u64, ret.class())),
        })
    }

    fn run(&mut self, entry: Symbol) -> VmResult<()> {
        let mut frames: Vec<(Symbol, usize)> = Vec::new();
        let (mut func, mut pc) = (entry, 0usize);
        loop {
            self.steps += 1;
            if self.steps > self.step_limit {
                return Err(VmError::StepLimit(self.step_limit));
            }
            let instr = self
                .functions
                .get(&func)
                .and_then(|f| f.code.get(pc))
                .cloned()
                .ok_or_else(|| {
                    VmError::Malformed(format!("ran off the end of {}", self.symbols.name(func)))
                })?;
            trace!("{}:{pc} {}", self.symbols.name(func), instr.listing(self.symbols));
            pc += 1;

            match instr.op {
                Opcode::Ret => {
                    self.pop_word()?;
                    match frames.pop() {
                        Some((f, p)) => (func, pc) = (f, p),
                        None => return Ok(()),
                    }
                }
                Opcode::Jmp => pc = self.label(func, &instr)?,
                Opcode::Jcc(cond) => {
                    let taken = match self.flags {
                        Some(ord) => cond.holds(ord),
                        // Unordered float comparison.
                        None => cond == crate::dag::Cond::Ne,
                    };
                    if taken {
                        pc = self.label(func, &instr)?;
                    }
                }
                Opcode::Call | Opcode::CallInd => {
                    let src = operand(instr.src)?;
                    let addr = self.read(&src, TyClass::U32)?.as_int() as u32;
                    let callee = *self
                        .by_address
                        .get(&addr)
                        .ok_or(VmError::UnknownFunction(addr))?;
                    if let Some(host) = self.hosts.get_mut(&callee) {
                        let args = HostArgs {
                            mem: &self.mem,
                            sp: self.gp[ESP as usize],
                        };
                        match host(&args) {
                            Value::Int(v) => {
                                self.gp[EAX as usize] = v as u32;
                                self.gp[EDX as usize] = (v >> 32) as u32;
                            }
                            Value::Float(f) => self.fp[0] = f,
                            Value::Void => {}
                        }
                        continue;
                    }
                    self.push_word(RETURN_TOKEN)?;
                    frames.push((func, pc));
                    (func, pc) = (callee, 0);
                }
                _ => self.execute(&instr)?,
            }
        }
    }

    fn label(&self, func: Symbol, instr: &Instr) -> VmResult<usize> {
        let target = instr
            .target
            .ok_or_else(|| VmError::Malformed("jump without a target".to_string()))?;
        self.functions
            .get(&func)
            .and_then(|f| f.labels.get(&target))
            .copied()
            .ok_or_else(|| VmError::UndefinedLabel(self.symbols.name(target).to_string()))
    }

    fn execute(&mut self, instr: &Instr) -> VmResult<()> {
        let ty = instr.ty;
        match instr.op {
            Opcode::Mov | Opcode::Fld | Opcode::Fst => {
                let v = self.read(&operand(instr.src)?, ty)?;
                self.write(&operand(instr.dst)?, ty, v)
            }
            Opcode::Lea => {
                let Operand::Mem(a) = operand(instr.src)? else {
                    return Err(VmError::Malformed("lea of a non-address".to_string()));
                };
                let addr = self.resolve(&a)?;
                self.write(&operand(instr.dst)?, ty, Value::Int(addr as i64))
            }
            Opcode::Movsx | Opcode::Movzx => {
                let src_cls = int_class(instr.bytes, instr.op == Opcode::Movsx);
                let v = self.read(&operand(instr.src)?, src_cls)?;
                self.write(&operand(instr.dst)?, ty, v)
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Udiv
            | Opcode::Mod
            | Opcode::Umod
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar => {
                let dst = operand(instr.dst)?;
                let a = self.read(&dst, ty)?.as_int();
                let b = self.read(&operand(instr.src)?, ty)?.as_int();
                let r = int_binary(instr.op, ty, a, b)?;
                self.write(&dst, ty, Value::Int(r))
            }
            Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
                let dst = operand(instr.dst)?;
                let a = self.read(&dst, ty)?.as_float();
                let b = self.read(&operand(instr.src)?, ty)?.as_float();
                let r = match instr.op {
                    Opcode::Fadd => a + b,
                    Opcode::Fsub => a - b,
                    Opcode::Fmul => a * b,
                    _ => a / b,
                };
                self.write(&dst, ty, Value::Float(r))
            }
            Opcode::Neg | Opcode::Not => {
                let dst = operand(instr.dst)?;
                let a = self.read(&dst, ty)?.as_int();
                let r = if instr.op == Opcode::Neg { a.wrapping_neg() } else { !a };
                self.write(&dst, ty, Value::Int(r))
            }
            Opcode::Fchs => {
                let dst = operand(instr.dst)?;
                let a = self.read(&dst, ty)?.as_float();
                self.write(&dst, ty, Value::Float(-a))
            }
            Opcode::Cmp => {
                let a = self.read(&operand(instr.dst)?, ty)?.as_int();
                let b = self.read(&operand(instr.src)?, ty)?.as_int();
                self.flags = Some(if ty == TyClass::U64 {
                    (a as u64).cmp(&(b as u64))
                } else {
                    a.cmp(&b)
                });
                Ok(())
            }
            Opcode::Fcmp => {
                let a = self.read(&operand(instr.dst)?, ty)?.as_float();
                let b = self.read(&operand(instr.src)?, ty)?.as_float();
                self.flags = a.partial_cmp(&b);
                Ok(())
            }
            Opcode::Set(cond) => {
                let holds = self.flags.is_some_and(|ord| cond.holds(ord))
                    || (self.flags.is_none() && cond == crate::dag::Cond::Ne);
                self.write(&operand(instr.dst)?, TyClass::I32, Value::Int(holds as i64))
            }
            Opcode::Push => {
                let src = operand(instr.src)?;
                if ty == TyClass::Blk {
                    let Operand::Ind(a) = src else {
                        return Err(VmError::Malformed("block push of a non-memory operand".to_string()));
                    };
                    let from = self.resolve(&a)?;
                    self.gp[ESP as usize] -= instr.bytes;
                    let to = self.gp[ESP as usize];
                    return self.copy(to, from, instr.bytes);
                }
                let v = self.read(&src, ty)?;
                self.push_value(v, ty, instr.bytes)
            }
            Opcode::Enter => {
                self.push_word(self.gp[EBP as usize])?;
                self.gp[EBP as usize] = self.gp[ESP as usize];
                self.gp[ESP as usize] -= instr.bytes;
                Ok(())
            }
            Opcode::Leave => {
                self.gp[ESP as usize] = self.gp[EBP as usize];
                self.gp[EBP as usize] = self.pop_word()?;
                Ok(())
            }
            Opcode::Fild => {
                let v = self.read(&operand(instr.src)?, int_class(instr.bytes, true))?;
                self.write(&operand(instr.dst)?, ty, Value::Float(v.as_int() as f64))
            }
            Opcode::Fist => {
                let v = self.read(&operand(instr.src)?, float_class(instr.bytes))?;
                self.write(&operand(instr.dst)?, ty, Value::Int(v.as_float().trunc() as i64))
            }
            Opcode::Ufild => {
                let v = self.read(&operand(instr.src)?, TyClass::U64)?;
                self.write(&operand(instr.dst)?, ty, Value::Float(v.as_int() as u64 as f64))
            }
            Opcode::Ufist => {
                let v = self.read(&operand(instr.src)?, float_class(instr.bytes))?;
                self.write(&operand(instr.dst)?, ty, Value::Int(v.as_float().trunc() as u64 as i64))
            }
            Opcode::Fcvt => {
                let v = self.read(&operand(instr.src)?, float_class(instr.bytes))?;
                self.write(&operand(instr.dst)?, ty, v)
            }
            Opcode::Copy => {
                let (Operand::Ind(to), Operand::Ind(from)) =
                    (operand(instr.dst)?, operand(instr.src)?)
                else {
                    return Err(VmError::Malformed("copy between non-memory operands".to_string()));
                };
                let (to, from) = (self.resolve(&to)?, self.resolve(&from)?);
                self.copy(to, from, instr.bytes)
            }
            Opcode::ZeroFill => {
                let Operand::Ind(a) = operand(instr.dst)? else {
                    return Err(VmError::Malformed("fill of a non-memory operand".to_string()));
                };
                let start = self.resolve(&a)?;
                self.slice_mut(start, instr.bytes)?.fill(0);
                Ok(())
            }
            Opcode::Label => Ok(()),
            Opcode::Jmp | Opcode::Jcc(_) | Opcode::Call | Opcode::CallInd | Opcode::Ret => Err(
                VmError::Malformed(format!("{:?} outside the dispatch loop", instr.op)),
            ),
        }
    }

    fn resolve(&self, a: &Address) -> VmResult<u32> {
        let mut addr = a.disp as i64;
        if let Some(base) = a.base {
            addr += self.gp_reg(base)? as i64;
        }
        if let Some(sym) = a.sym {
            addr += self.symbol_address(sym)? as i64;
        }
        Ok(addr as u32)
    }

    fn symbol_address(&self, sym: Symbol) -> VmResult<u32> {
        match self.symbols.kind(sym) {
            SymbolKind::Global => self.global(sym),
            SymbolKind::Function => Ok(Self::function_address(sym)),
            _ => Err(VmError::Malformed(format!(
                "{} has no static address",
                self.symbols.name(sym)
            ))),
        }
    }

    fn gp_reg(&self, reg: RegId) -> VmResult<u32> {
        self.gp
            .get(reg as usize)
            .copied()
            .ok_or_else(|| VmError::Malformed(format!("{reg} is not a general register")))
    }

    fn fp_slot(reg: RegId) -> VmResult<usize> {
        match reg.checked_sub(F0) {
            Some(idx @ 0..=1) => Ok(idx as usize),
            _ => Err(VmError::Malformed(format!("{reg} is not a floating register"))),
        }
    }

    fn read(&self, op: &Operand, cls: TyClass) -> VmResult<Value> {
        match *op {
            Operand::Reg { lo, hi } => {
                if cls.is_float() {
                    return Ok(Value::Float(narrow_float(self.fp[Self::fp_slot(lo)?], cls)));
                }
                let lo_bits = self.gp_reg(lo)?;
                let raw = match hi {
                    Some(hi) => (self.gp_reg(hi)? as u64) << 32 | lo_bits as u64,
                    None if cls == TyClass::I64 => lo_bits as i32 as i64 as u64,
                    None => lo_bits as u64,
                };
                Ok(Value::Int(normalize(raw, cls)))
            }
            Operand::Imm(sym) => match self.symbols.kind(sym) {
                SymbolKind::IntConst(v) if cls.is_float() => Ok(Value::Float(v as f64)),
                SymbolKind::IntConst(v) => Ok(Value::Int(normalize(v as u64, cls))),
                SymbolKind::FloatConst(f) if cls.is_float() => Ok(Value::Float(narrow_float(f, cls))),
                SymbolKind::FloatConst(f) => Ok(Value::Int(f as i64)),
                _ => Ok(Value::Int(self.symbol_address(sym)? as i64)),
            },
            Operand::Mem(a) => Ok(Value::Int(self.resolve(&a)? as i64)),
            Operand::Ind(a) => {
                let addr = self.resolve(&a)?;
                self.read_mem(addr, cls)
            }
        }
    }

    fn write(&mut self, op: &Operand, cls: TyClass, v: Value) -> VmResult<()> {
        match *op {
            Operand::Reg { lo, hi } => {
                if cls.is_float() {
                    self.fp[Self::fp_slot(lo)?] = narrow_float(v.as_float(), cls);
                    return Ok(());
                }
                self.gp_reg(lo)?;
                let raw = v.as_int() as u64;
                self.gp[lo as usize] = raw as u32;
                if let Some(hi) = hi {
                    self.gp_reg(hi)?;
                    self.gp[hi as usize] = (raw >> 32) as u32;
                }
                Ok(())
            }
            Operand::Ind(a) => {
                let addr = self.resolve(&a)?;
                self.write_mem(addr, cls, v)
            }
            _ => Err(VmError::Malformed(format!("write to {op:?}"))),
        }
    }

    fn slice(&self, addr: u32, len: u32) -> VmResult<&[u8]> {
        self.read_bytes(addr, len)
    }

    fn slice_mut(&mut self, addr: u32, len: u32) -> VmResult<&mut [u8]> {
        let start = addr as usize;
        self.mem
            .get_mut(start..start + len as usize)
            .ok_or(VmError::BadAddress {
                addr: addr as u64,
                len,
            })
    }

    fn read_mem(&self, addr: u32, cls: TyClass) -> VmResult<Value> {
        let width = cls.width();
        if width == 0 {
            return Err(VmError::Malformed(format!("memory read of class {cls:?}")));
        }
        let bytes = self.slice(addr, width)?;
        match cls {
            TyClass::F32 => {
                let raw: [u8; 4] = bytes.try_into().map_err(|_| VmError::BadAddress {
                    addr: addr as u64,
                    len: 4,
                })?;
                Ok(Value::Float(f32::from_le_bytes(raw) as f64))
            }
            TyClass::F64 => {
                let raw: [u8; 8] = bytes.try_into().map_err(|_| VmError::BadAddress {
                    addr: addr as u64,
                    len: 8,
                })?;
                Ok(Value::Float(f64::from_le_bytes(raw)))
            }
            _ => {
                let mut raw = [0u8; 8];
                raw[..bytes.len()].copy_from_slice(bytes);
                Ok(Value::Int(normalize(u64::from_le_bytes(raw), cls)))
            }
        }
    }

    fn write_mem(&mut self, addr: u32, cls: TyClass, v: Value) -> VmResult<()> {
        let width = cls.width();
        let bytes: Vec<u8> = match cls {
            TyClass::F32 => (v.as_float() as f32).to_le_bytes().to_vec(),
            TyClass::F64 => v.as_float().to_le_bytes().to_vec(),
            _ if width > 0 => (v.as_int() as u64).to_le_bytes()[..width as usize].to_vec(),
            _ => return Err(VmError::Malformed(format!("memory write of class {cls:?}"))),
        };
        self.slice_mut(addr, width)?.copy_from_slice(&bytes);
        Ok(())
    }

    fn copy(&mut self, to: u32, from: u32, len: u32) -> VmResult<()> {
        let src = self.slice(from, len)?.to_vec();
        self.slice_mut(to, len)?.copy_from_slice(&src);
        Ok(())
    }

    fn push_value(&mut self, v: Value, cls: TyClass, bytes: u32) -> VmResult<()> {
        let sp = self.gp[ESP as usize]
            .checked_sub(bytes)
            .ok_or(VmError::BadAddress { addr: 0, len: bytes })?;
        self.gp[ESP as usize] = sp;
        let slot_cls = match cls {
            TyClass::I8 | TyClass::I16 => TyClass::I32,
            TyClass::U8 | TyClass::U16 => TyClass::U32,
            other => other,
        };
        self.write_mem(sp, slot_cls, v)
    }

    fn push_word(&mut self, word: u32) -> VmResult<()> {
        self.push_value(Value::Int(word as i64), TyClass::U32, 4)
    }

    fn pop_word(&mut self) -> VmResult<u32> {
        let sp = self.gp[ESP as usize];
        let v = self.read_mem(sp, TyClass::U32)?;
        self.gp[ESP as usize] = sp + 4;
        Ok(v.as_int() as u32)
    }
}

fn operand(op: Option<Operand>) -> VmResult<Operand> {
    op.ok_or_else(|| VmError::Malformed("missing operand".to_string()))
}

/// Sign- or zero-extend the low bits of `raw` per `cls`.
fn normalize(raw: u64, cls: TyClass) -> i64 {
    match cls {
        TyClass::I8 => raw as i8 as i64,
        TyClass::U8 => raw as u8 as i64,
        TyClass::I16 => raw as i16 as i64,
        TyClass::U16 => raw as u16 as i64,
        TyClass::I32 => raw as i32 as i64,
        TyClass::U32 => raw as u32 as i64,
        _ => raw as i64,
    }
}

fn narrow_float(f: f64, cls: TyClass) -> f64 {
    if cls == TyClass::F32 {
        f as f32 as f64
    } else {
        f
    }
}

fn int_class(bytes: u32, signed: bool) -> TyClass {
    match (bytes, signed) {
        (1, true) => TyClass::I8,
        (1, false) => TyClass::U8,
        (2, true) => TyClass::I16,
        (2, false) => TyClass::U16,
        (8, true) => TyClass::I64,
        (8, false) => TyClass::U64,
        (_, true) => TyClass::I32,
        (_, false) => TyClass::U32,
    }
}

fn float_class(bytes: u32) -> TyClass {
    if bytes == 4 {
        TyClass::F32
    } else {
        TyClass::F64
    }
}

fn int_binary(op: Opcode, cls: TyClass, a: i64, b: i64) -> VmResult<i64> {
    let wide_unsigned = cls == TyClass::U64;
    Ok(match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div | Opcode::Mod | Opcode::Udiv | Opcode::Umod if b == 0 => {
            return Err(VmError::DivideByZero)
        }
        Opcode::Div => a.wrapping_div(b),
        Opcode::Mod => a.wrapping_rem(b),
        Opcode::Udiv if wide_unsigned => ((a as u64) / (b as u64)) as i64,
        Opcode::Umod if wide_unsigned => ((a as u64) % (b as u64)) as i64,
        Opcode::Udiv => a / b,
        Opcode::Umod => a % b,
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a.wrapping_shl(b as u32 & 63),
        Opcode::Shr => ((a as u64) >> (b as u32 & 63)) as i64,
        Opcode::Sar => a >> (b as u32 & 63),
        other => return Err(VmError::Malformed(format!("{other:?} is not an integer operator"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::InstrList;
    use crate::codegen::FunctionStats;
    use crate::core::register_file::ECX;

    fn function(symbols: &mut SymbolTable, name: &str, body: Vec<Instr>) -> CompiledFunction {
        let sym = symbols.function(name, CType::Int);
        let mut code = InstrList::new();
        code.append(Instr::new(Opcode::Enter, TyClass::Void));
        for instr in body {
            code.append(instr);
        }
        code.append(Instr::new(Opcode::Leave, TyClass::Void));
        code.append(Instr::new(Opcode::Ret, TyClass::Void));
        CompiledFunction {
            name: sym,
            ret: CType::Int,
            params: Vec::new(),
            code,
            frame_size: 0,
            blocks: 1,
            stats: FunctionStats::default(),
        }
    }

    #[test]
    fn test_registers_narrow_on_read() {
        let mut symbols = SymbolTable::new();
        let big = symbols.int_const(300, CType::Int);
        let f = function(
            &mut symbols,
            "f",
            vec![
                Instr::new(Opcode::Mov, TyClass::I32)
                    .with_dst(Operand::reg(ECX))
                    .with_src(Operand::Imm(big)),
                // 300 read as a signed byte is 44.
                Instr::new(Opcode::Movsx, TyClass::I32)
                    .with_dst(Operand::reg(EAX))
                    .with_src(Operand::reg(ECX))
                    .with_bytes(1),
            ],
        );
        let mut vm = Machine::new(&symbols);
        vm.load(&f);
        assert_eq!(vm.call(f.name, &[]).unwrap(), Value::Int(44));
    }

    #[test]
    fn test_division_by_zero_is_reported() {
        let mut symbols = SymbolTable::new();
        let zero = symbols.int_const(0, CType::Int);
        let f = function(
            &mut symbols,
            "f",
            vec![Instr::new(Opcode::Div, TyClass::I32)
                .with_dst(Operand::reg(EAX))
                .with_src(Operand::Imm(zero))],
        );
        let mut vm = Machine::new(&symbols);
        vm.load(&f);
        assert_eq!(vm.call(f.name, &[]), Err(VmError::DivideByZero));
    }

    #[test]
    fn test_step_limit() {
        let mut symbols = SymbolTable::new();
        let top = symbols.new_label();
        let f = function(
            &mut symbols,
            "spin",
            vec![
                Instr::new(Opcode::Label, TyClass::Void).with_target(top),
                Instr::new(Opcode::Jmp, TyClass::Void).with_target(top),
            ],
        );
        let mut vm = Machine::new(&symbols).with_step_limit(100);
        vm.load(&f);
        assert_eq!(vm.call(f.name, &[]), Err(VmError::StepLimit(100)));
    }

    #[test]
    fn test_globals_round_trip() {
        let mut symbols = SymbolTable::new();
        let g = symbols.global("g", CType::Short);
        let d = symbols.global("d", CType::Double);
        let mut vm = Machine::new(&symbols);
        vm.write_global(g, Value::Int(-2)).unwrap();
        vm.write_global(d, Value::Float(1.5)).unwrap();
        assert_eq!(vm.read_global(g).unwrap(), Value::Int(-2));
        assert_eq!(vm.read_global(d).unwrap(), Value::Float(1.5));
        assert_eq!(vm.global_address(g), Some(GLOBAL_BASE));
        assert_eq!(vm.global_address(d), Some(GLOBAL_BASE + 4));
    }
}
