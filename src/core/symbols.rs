//! Symbol table interface consumed by the backend.
//!
//! The parser owns name resolution; the backend only needs stable identities for
//! variables, constants and labels (used as hash keys and operand payloads), the
//! storage class of each symbol, a way to synthesize labels and temporaries, and
//! a slot to record the frame offset the frame manager assigns.

use hashbrown::HashMap;
use std::fmt;

/// Stable identity of a symbol within one translation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resolved C type as annotated by the type checker.
///
/// Pointers carry no pointee: the type checker has already scaled pointer
/// arithmetic and resolved every dereference width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CType {
    Void,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    LongLong,
    ULongLong,
    Float,
    Double,
    Pointer,
    Struct { size: u32 },
}

impl CType {
    /// Size in bytes.
    pub fn size(self) -> u32 {
        match self {
            CType::Void => 0,
            CType::Char | CType::UChar => 1,
            CType::Short | CType::UShort => 2,
            CType::Int | CType::UInt | CType::Pointer | CType::Float => 4,
            CType::LongLong | CType::ULongLong | CType::Double => 8,
            CType::Struct { size } => size,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, CType::Float | CType::Double)
    }

    pub fn is_struct(self) -> bool {
        matches!(self, CType::Struct { .. })
    }

    pub fn is_integer(self) -> bool {
        !self.is_float() && !self.is_struct() && self != CType::Void
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            CType::Char | CType::Short | CType::Int | CType::LongLong | CType::Float | CType::Double
        )
    }

    /// Integer values that occupy a register pair.
    pub fn is_wide(self) -> bool {
        matches!(self, CType::LongLong | CType::ULongLong)
    }

    /// Selection-table class of this type.
    pub fn class(self) -> TyClass {
        match self {
            CType::Void => TyClass::Void,
            CType::Char => TyClass::I8,
            CType::UChar => TyClass::U8,
            CType::Short => TyClass::I16,
            CType::UShort => TyClass::U16,
            CType::Int => TyClass::I32,
            CType::UInt | CType::Pointer => TyClass::U32,
            CType::LongLong => TyClass::I64,
            CType::ULongLong => TyClass::U64,
            CType::Float => TyClass::F32,
            CType::Double => TyClass::F64,
            CType::Struct { .. } => TyClass::Blk,
        }
    }
}

/// Type tag used in DAG keys and selection-table keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TyClass {
    I8 = 0,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Blk,
    Void,
}

impl TyClass {
    pub const INTS: [TyClass; 8] = [
        TyClass::I8,
        TyClass::U8,
        TyClass::I16,
        TyClass::U16,
        TyClass::I32,
        TyClass::U32,
        TyClass::I64,
        TyClass::U64,
    ];
    pub const NARROW_INTS: [TyClass; 6] = [
        TyClass::I8,
        TyClass::U8,
        TyClass::I16,
        TyClass::U16,
        TyClass::I32,
        TyClass::U32,
    ];
    pub const WIDE_INTS: [TyClass; 2] = [TyClass::I64, TyClass::U64];
    pub const FLOATS: [TyClass; 2] = [TyClass::F32, TyClass::F64];

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn is_float(self) -> bool {
        matches!(self, TyClass::F32 | TyClass::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            TyClass::I8 | TyClass::I16 | TyClass::I32 | TyClass::I64 | TyClass::F32 | TyClass::F64
        )
    }

    pub fn is_wide(self) -> bool {
        matches!(self, TyClass::I64 | TyClass::U64)
    }

    /// Byte width of integer and float classes.
    pub fn width(self) -> u32 {
        match self {
            TyClass::I8 | TyClass::U8 => 1,
            TyClass::I16 | TyClass::U16 => 2,
            TyClass::I32 | TyClass::U32 | TyClass::F32 => 4,
            TyClass::I64 | TyClass::U64 | TyClass::F64 => 8,
            TyClass::Blk | TyClass::Void => 0,
        }
    }
}

/// Storage class and payload of a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SymbolKind {
    Global,
    Function,
    Param,
    Local,
    /// Compiler-synthesized local.
    Temp,
    IntConst(i64),
    FloatConst(f64),
    Label,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    /// Object type; for functions the return type.
    pub ty: CType,
    /// Frame-pointer relative offset, set by the frame manager.
    pub offset: Option<i32>,
}

/// Symbol table shared by the parser and the backend.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolInfo>,
    int_consts: HashMap<(i64, CType), Symbol>,
    float_consts: HashMap<(u64, CType), Symbol>,
    next_label: u32,
    next_temp: u32,
    lowering_passes: u32,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: String, kind: SymbolKind, ty: CType) -> Symbol {
        let sym = Symbol(self.entries.len() as u32);
        self.entries.push(SymbolInfo {
            name,
            kind,
            ty,
            offset: None,
        });
        sym
    }

    pub fn global(&mut self, name: &str, ty: CType) -> Symbol {
        self.push(name.to_string(), SymbolKind::Global, ty)
    }

    pub fn function(&mut self, name: &str, ret: CType) -> Symbol {
        self.push(name.to_string(), SymbolKind::Function, ret)
    }

    pub fn param(&mut self, name: &str, ty: CType) -> Symbol {
        self.push(name.to_string(), SymbolKind::Param, ty)
    }

    pub fn local(&mut self, name: &str, ty: CType) -> Symbol {
        self.push(name.to_string(), SymbolKind::Local, ty)
    }

    /// Synthesize an anonymous local of the given type.
    pub fn temp(&mut self, ty: CType) -> Symbol {
        let name = format!(".t{}", self.next_temp);
        self.next_temp += 1;
        self.push(name, SymbolKind::Temp, ty)
    }

    /// Synthesize a fresh branch-target label.
    pub fn new_label(&mut self) -> Symbol {
        let name = format!(".L{}", self.next_label);
        self.next_label += 1;
        self.push(name, SymbolKind::Label, CType::Void)
    }

    /// Start a new tree lowering pass over this table's trees; never zero.
    pub fn next_lowering_pass(&mut self) -> u32 {
        self.lowering_passes += 1;
        self.lowering_passes
    }

    /// Intern an integer constant; equal values of equal type share a symbol.
    pub fn int_const(&mut self, value: i64, ty: CType) -> Symbol {
        if let Some(&sym) = self.int_consts.get(&(value, ty)) {
            return sym;
        }
        let sym = self.push(value.to_string(), SymbolKind::IntConst(value), ty);
        self.int_consts.insert((value, ty), sym);
        sym
    }

    /// Intern a floating constant, keyed by its bit pattern.
    pub fn float_const(&mut self, value: f64, ty: CType) -> Symbol {
        let key = (value.to_bits(), ty);
        if let Some(&sym) = self.float_consts.get(&key) {
            return sym;
        }
        let sym = self.push(format!("{value:?}"), SymbolKind::FloatConst(value), ty);
        self.float_consts.insert(key, sym);
        sym
    }

    pub fn info(&self, sym: Symbol) -> &SymbolInfo {
        &self.entries[sym.index()]
    }

    pub fn name(&self, sym: Symbol) -> &str {
        &self.entries[sym.index()].name
    }

    pub fn kind(&self, sym: Symbol) -> SymbolKind {
        self.entries[sym.index()].kind
    }

    pub fn ty(&self, sym: Symbol) -> CType {
        self.entries[sym.index()].ty
    }

    pub fn offset(&self, sym: Symbol) -> Option<i32> {
        self.entries[sym.index()].offset
    }

    pub fn set_offset(&mut self, sym: Symbol, offset: i32) {
        self.entries[sym.index()].offset = Some(offset);
    }

    /// Whether the symbol's storage is addressed relative to the frame pointer.
    pub fn is_frame_resident(&self, sym: Symbol) -> bool {
        matches!(
            self.kind(sym),
            SymbolKind::Param | SymbolKind::Local | SymbolKind::Temp
        )
    }

    /// Look up a named global or function.
    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.entries
            .iter()
            .position(|info| {
                info.name == name
                    && matches!(info.kind, SymbolKind::Global | SymbolKind::Function)
            })
            .map(|idx| Symbol(idx as u32))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn globals(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, info)| info.kind == SymbolKind::Global)
            .map(|(idx, _)| Symbol(idx as u32))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}
