//! Type-checked expression and statement trees.
//!
//! These are what the parser and type checker hand to the backend: every node
//! carries its resolved type, identifiers are already bound to symbols, and
//! implicit conversions and pointer scaling are explicit. Trees are allocated
//! in the session arena and referenced by shared borrows.
//!
//! Variables appear as `Deref(Addr(sym))` when used as values and as their
//! address on the left of an assignment.

use crate::canon::LinId;
use crate::core::symbols::{CType, Symbol, SymbolTable};
use bumpalo::Bump;
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Compl,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogAnd | BinaryOp::LogOr)
    }
}

#[derive(Debug)]
pub enum ExprKind<'a> {
    /// Interned constant symbol.
    Const(Symbol),
    /// Address of a variable or function.
    Addr(Symbol),
    Deref(&'a Expr<'a>),
    Unary(UnaryOp, &'a Expr<'a>),
    Binary(BinaryOp, &'a Expr<'a>, &'a Expr<'a>),
    /// Store the value through the address.
    Assign(&'a Expr<'a>, &'a Expr<'a>),
    Cond(&'a Expr<'a>, &'a Expr<'a>, &'a Expr<'a>),
    Call(&'a Expr<'a>, &'a [&'a Expr<'a>]),
    /// Conversion to the node's type.
    Cast(&'a Expr<'a>),
    Comma(&'a Expr<'a>, &'a Expr<'a>),
}

#[derive(Debug)]
pub struct Expr<'a> {
    pub kind: ExprKind<'a>,
    pub ty: CType,
    /// Lowering pass that produced `LinId`, and the id.
    lowered: Cell<Option<(u32, LinId)>>,
}

impl<'a> Expr<'a> {
    pub fn new(kind: ExprKind<'a>, ty: CType) -> Self {
        Self {
            kind,
            ty,
            lowered: Cell::new(None),
        }
    }

    /// Result of an earlier linearization of this node in pass `epoch`.
    pub fn lowered(&self, epoch: u32) -> Option<LinId> {
        self.lowered
            .get()
            .and_then(|(e, lin)| (e == epoch).then_some(lin))
    }

    pub(crate) fn set_lowered(&self, epoch: u32, lin: LinId) {
        self.lowered.set(Some((epoch, lin)));
    }
}

/// Local declaration at the head of a compound statement.
#[derive(Debug, Clone, Copy)]
pub struct Decl<'a> {
    pub sym: Symbol,
    pub init: Option<&'a Expr<'a>>,
    /// Clear the whole object before any initializer runs.
    pub zero_fill: bool,
}

#[derive(Debug)]
pub enum Stmt<'a> {
    Expr(&'a Expr<'a>),
    If(&'a Expr<'a>, &'a Stmt<'a>, Option<&'a Stmt<'a>>),
    While(&'a Expr<'a>, &'a Stmt<'a>),
    Block(&'a [Decl<'a>], &'a [&'a Stmt<'a>]),
    Return(Option<&'a Expr<'a>>),
    Break,
    Continue,
}

#[derive(Debug)]
pub struct FunctionDef<'a> {
    pub name: Symbol,
    pub ret: CType,
    pub params: &'a [Symbol],
    /// Hidden output-address parameter of struct-returning functions.
    pub sret: Option<Symbol>,
    pub body: &'a Stmt<'a>,
}

/// Arena builder used by the parser (and by tests) to produce trees.
pub struct TreeBuilder<'a, 's> {
    arena: &'a Bump,
    symbols: &'s mut SymbolTable,
}

impl<'a, 's> TreeBuilder<'a, 's> {
    pub fn new(arena: &'a Bump, symbols: &'s mut SymbolTable) -> Self {
        Self { arena, symbols }
    }

    pub fn symbols(&mut self) -> &mut SymbolTable {
        self.symbols
    }

    fn expr(&self, kind: ExprKind<'a>, ty: CType) -> &'a Expr<'a> {
        self.arena.alloc(Expr::new(kind, ty))
    }

    pub fn int(&mut self, value: i64) -> &'a Expr<'a> {
        self.int_of(value, CType::Int)
    }

    pub fn int_of(&mut self, value: i64, ty: CType) -> &'a Expr<'a> {
        let sym = self.symbols.int_const(value, ty);
        self.expr(ExprKind::Const(sym), ty)
    }

    pub fn float(&mut self, value: f64) -> &'a Expr<'a> {
        let sym = self.symbols.float_const(value, CType::Double);
        self.expr(ExprKind::Const(sym), CType::Double)
    }

    pub fn addr(&mut self, sym: Symbol) -> &'a Expr<'a> {
        self.expr(ExprKind::Addr(sym), CType::Pointer)
    }

    /// Value of a variable.
    pub fn var(&mut self, sym: Symbol) -> &'a Expr<'a> {
        let ty = self.symbols.ty(sym);
        let addr = self.addr(sym);
        self.expr(ExprKind::Deref(addr), ty)
    }

    pub fn deref(&mut self, ptr: &'a Expr<'a>, ty: CType) -> &'a Expr<'a> {
        self.expr(ExprKind::Deref(ptr), ty)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: &'a Expr<'a>) -> &'a Expr<'a> {
        let ty = match op {
            UnaryOp::Not => CType::Int,
            _ => operand.ty,
        };
        self.expr(ExprKind::Unary(op, operand), ty)
    }

    /// Binary operator; relational and logical operators yield `int`.
    pub fn binary(&mut self, op: BinaryOp, lhs: &'a Expr<'a>, rhs: &'a Expr<'a>) -> &'a Expr<'a> {
        let ty = if op.is_relational() || op.is_logical() {
            CType::Int
        } else {
            lhs.ty
        };
        self.expr(ExprKind::Binary(op, lhs, rhs), ty)
    }

    /// Assignment to an lvalue expression (`Deref`) or through an address.
    pub fn assign(&mut self, target: &'a Expr<'a>, value: &'a Expr<'a>) -> &'a Expr<'a> {
        match target.kind {
            ExprKind::Deref(addr) => self.expr(ExprKind::Assign(addr, value), target.ty),
            _ => self.expr(ExprKind::Assign(target, value), value.ty),
        }
    }

    pub fn cond(
        &mut self,
        test: &'a Expr<'a>,
        then: &'a Expr<'a>,
        other: &'a Expr<'a>,
    ) -> &'a Expr<'a> {
        self.expr(ExprKind::Cond(test, then, other), then.ty)
    }

    pub fn call(&mut self, callee: &'a Expr<'a>, args: &[&'a Expr<'a>], ret: CType) -> &'a Expr<'a> {
        let args = self.arena.alloc_slice_copy(args);
        self.expr(ExprKind::Call(callee, args), ret)
    }

    /// Direct call of a named function.
    pub fn call_fn(&mut self, func: Symbol, args: &[&'a Expr<'a>]) -> &'a Expr<'a> {
        let ret = self.symbols.ty(func);
        let callee = self.addr(func);
        self.call(callee, args, ret)
    }

    pub fn cast(&mut self, value: &'a Expr<'a>, ty: CType) -> &'a Expr<'a> {
        self.expr(ExprKind::Cast(value), ty)
    }

    pub fn comma(&mut self, first: &'a Expr<'a>, second: &'a Expr<'a>) -> &'a Expr<'a> {
        self.expr(ExprKind::Comma(first, second), second.ty)
    }

    pub fn expr_stmt(&mut self, e: &'a Expr<'a>) -> &'a Stmt<'a> {
        self.arena.alloc(Stmt::Expr(e))
    }

    pub fn if_stmt(
        &mut self,
        test: &'a Expr<'a>,
        then: &'a Stmt<'a>,
        other: Option<&'a Stmt<'a>>,
    ) -> &'a Stmt<'a> {
        self.arena.alloc(Stmt::If(test, then, other))
    }

    pub fn while_stmt(&mut self, test: &'a Expr<'a>, body: &'a Stmt<'a>) -> &'a Stmt<'a> {
        self.arena.alloc(Stmt::While(test, body))
    }

    pub fn block(&mut self, decls: &[Decl<'a>], stmts: &[&'a Stmt<'a>]) -> &'a Stmt<'a> {
        let decls = self.arena.alloc_slice_copy(decls);
        let stmts = self.arena.alloc_slice_copy(stmts);
        self.arena.alloc(Stmt::Block(decls, stmts))
    }

    pub fn ret(&mut self, value: Option<&'a Expr<'a>>) -> &'a Stmt<'a> {
        self.arena.alloc(Stmt::Return(value))
    }

    pub fn brk(&mut self) -> &'a Stmt<'a> {
        self.arena.alloc(Stmt::Break)
    }

    pub fn cont(&mut self) -> &'a Stmt<'a> {
        self.arena.alloc(Stmt::Continue)
    }

    pub fn decl(&mut self, sym: Symbol, init: Option<&'a Expr<'a>>) -> Decl<'a> {
        Decl {
            sym,
            init,
            zero_fill: false,
        }
    }

    pub fn zeroed(&mut self, sym: Symbol) -> Decl<'a> {
        Decl {
            sym,
            init: None,
            zero_fill: true,
        }
    }

    /// Function definition; a hidden output parameter is added for struct returns.
    pub fn function(
        &mut self,
        name: Symbol,
        params: &[Symbol],
        body: &'a Stmt<'a>,
    ) -> &'a FunctionDef<'a> {
        let ret = self.symbols.ty(name);
        let sret = ret
            .is_struct()
            .then(|| self.symbols.param(".sret", CType::Pointer));
        let params = self.arena.alloc_slice_copy(params);
        self.arena.alloc(FunctionDef {
            name,
            ret,
            params,
            sret,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_types() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let x = symbols.local("x", CType::Char);
        let mut b = TreeBuilder::new(&arena, &mut symbols);

        let v = b.var(x);
        assert_eq!(v.ty, CType::Char);
        assert!(matches!(v.kind, ExprKind::Deref(_)));

        let one = b.int(1);
        let lt = b.binary(BinaryOp::Lt, v, one);
        assert_eq!(lt.ty, CType::Int);

        let store = b.assign(v, one);
        assert!(matches!(store.kind, ExprKind::Assign(_, _)));
        assert_eq!(store.ty, CType::Char);
    }

    #[test]
    fn test_struct_function_gets_hidden_param() {
        let arena = Bump::new();
        let mut symbols = SymbolTable::new();
        let f = symbols.function("make", CType::Struct { size: 12 });
        let mut b = TreeBuilder::new(&arena, &mut symbols);
        let body = b.ret(None);
        let def = b.function(f, &[], body);
        assert!(def.sret.is_some());
    }
}
