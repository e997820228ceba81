//! Hash-consed value-numbering DAG.
//!
//! Every expression node the canonicalizer produces is interned here before
//! instruction selection. Structurally identical nodes within one pool
//! generation are unified, which is how local common subexpressions are found:
//! the key is (operator, type, symbol, child identities), and children are
//! compared by identity because they were unified first.
//!
//! The hash table is what generations reset; the node storage itself lives for
//! the whole function so that nodes interned before a reset can still be
//! selected afterwards.

use crate::asm::Operand;
use crate::core::symbols::{CType, Symbol};
use hashbrown::HashMap;
use log::trace;

/// Identity of a DAG node within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn from_raw(raw: u32) -> Self {
        NodeId(raw)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Comparison condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    /// Condition that holds exactly when `self` does not.
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
        }
    }

    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Cond::Eq => ord == Equal,
            Cond::Ne => ord != Equal,
            Cond::Lt => ord == Less,
            Cond::Le => ord != Greater,
            Cond::Gt => ord == Greater,
            Cond::Ge => ord != Less,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
        }
    }
}

/// DAG and linear-expression operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Constant; the symbol is an interned constant.
    Const,
    /// Address of a global, local, parameter or function.
    Addr,
    /// Load through the address in kid 0.
    Load,
    /// Store kid 1 through the address in kid 0.
    Assign,
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
    Neg,
    Compl,
    /// Relational comparison producing 0 or 1.
    Cmp(Cond),
    /// Conversion from kid 0's type to the node's type.
    Cvt,
    /// Call of kid 0; `aux` holds the pushed argument bytes.
    Call,
}

impl Op {
    /// Operators that must execute exactly where they appear and are never unified.
    pub fn has_side_effect(self) -> bool {
        matches!(self, Op::Assign | Op::Call)
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::And
                | Op::Or
                | Op::Xor
                | Op::Shl
                | Op::Shr
        )
    }
}

/// A value-numbered computation.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub op: Op,
    pub ty: CType,
    pub kids: [Option<NodeId>; 2],
    pub sym: Option<Symbol>,
    pub aux: i64,
    /// Sequence number of the last code that consumes this node.
    pub last_ref: u32,
    /// Consumptions still to come; may over-count, never under-count.
    pub pending_uses: u32,
    /// Where the computed value currently lives, once selected.
    pub loc: Option<Operand>,
    /// Frame offset of the spill slot, once spilled.
    pub spill: Option<i32>,
    /// Pool generation the node was created in.
    pub generation: u32,
}

impl DagNode {
    pub fn size(&self) -> u32 {
        self.ty.size()
    }

    pub fn kid(&self, idx: usize) -> Option<NodeId> {
        self.kids[idx]
    }

    /// Whether the value may still be needed by a code at or after `seq`.
    pub fn is_live_at(&self, seq: u32) -> bool {
        self.pending_uses > 0 && self.last_ref >= seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DagKey {
    op: Op,
    ty: CType,
    sym: Option<Symbol>,
    kids: [Option<NodeId>; 2],
}

/// Counters reported into the session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DagStats {
    pub hits: u64,
    pub misses: u64,
    pub resets: u64,
}

/// Per-function value-numbering pool.
#[derive(Debug)]
pub struct DagPool {
    nodes: Vec<DagNode>,
    table: HashMap<DagKey, NodeId>,
    capacity: usize,
    generation: u32,
    stats: DagStats,
}

impl DagPool {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            table: HashMap::new(),
            capacity: capacity.max(1),
            generation: 0,
            stats: DagStats::default(),
        }
    }

    pub fn intern_leaf(&mut self, op: Op, ty: CType, sym: Symbol) -> NodeId {
        self.intern(DagKey {
            op,
            ty,
            sym: Some(sym),
            kids: [None, None],
        })
    }

    pub fn intern_unary(&mut self, op: Op, ty: CType, child: NodeId) -> NodeId {
        self.intern(DagKey {
            op,
            ty,
            sym: None,
            kids: [Some(child), None],
        })
    }

    pub fn intern_binary(
        &mut self,
        op: Op,
        ty: CType,
        left: NodeId,
        right: NodeId,
        sym: Option<Symbol>,
    ) -> NodeId {
        self.intern(DagKey {
            op,
            ty,
            sym,
            kids: [Some(left), Some(right)],
        })
    }

    /// Create a node that is never unified with any other.
    pub fn fresh(
        &mut self,
        op: Op,
        ty: CType,
        kids: [Option<NodeId>; 2],
        sym: Option<Symbol>,
        aux: i64,
    ) -> NodeId {
        let id = self.push(DagKey { op, ty, sym, kids });
        self.nodes[id.index()].aux = aux;
        id
    }

    fn intern(&mut self, key: DagKey) -> NodeId {
        if let Some(&id) = self.table.get(&key) {
            self.stats.hits += 1;
            trace!("dag hit {:?} -> {:?}", key.op, id);
            return id;
        }
        if self.table.len() >= self.capacity {
            self.reset_pool();
        }
        self.stats.misses += 1;
        let id = self.push(key);
        self.table.insert(key, id);
        id
    }

    fn push(&mut self, key: DagKey) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(DagNode {
            op: key.op,
            ty: key.ty,
            kids: key.kids,
            sym: key.sym,
            aux: 0,
            last_ref: 0,
            pending_uses: 0,
            loc: None,
            spill: None,
            generation: self.generation,
        });
        id
    }

    /// Forget every unification; later interning creates new nodes.
    pub fn reset_pool(&mut self) {
        self.table.clear();
        self.generation += 1;
        self.stats.resets += 1;
    }

    /// Forget loads whose value an assignment to `sym` may have changed.
    ///
    /// Loads through the known address of `sym` go, and so do loads through
    /// computed addresses, which may alias it.
    pub fn invalidate(&mut self, sym: Symbol) {
        let nodes = &self.nodes;
        self.table.retain(|key, _| {
            if key.op != Op::Load {
                return true;
            }
            match key.kids[0].map(|k| &nodes[k.index()]) {
                Some(addr) if addr.op == Op::Addr => addr.sym != Some(sym),
                _ => false,
            }
        });
    }

    pub fn node(&self, id: NodeId) -> &DagNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DagNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn stats(&self) -> DagStats {
        self.stats
    }

    /// Selection re-enters these nodes' children on every use unless the value
    /// was forced into a register: leaves, loads and same-width-or-narrowing
    /// integer conversions.
    pub fn passes_through(&self, id: NodeId) -> bool {
        let node = self.node(id);
        match node.op {
            Op::Const | Op::Addr | Op::Load => true,
            Op::Cvt => node
                .kids[0]
                .map(|k| {
                    let src = self.node(k).ty;
                    src.is_integer() && node.ty.is_integer() && node.ty.size() <= src.size()
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Drop everything for a new function.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.table.clear();
        self.generation = 0;
        self.stats = DagStats::default();
    }
}

impl Default for DagPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symbols::SymbolTable;

    fn setup() -> (DagPool, SymbolTable) {
        (DagPool::default(), SymbolTable::new())
    }

    #[test]
    fn test_identical_shapes_unify() {
        let (mut dag, mut symbols) = setup();
        let a = symbols.local("a", CType::Int);
        let b = symbols.local("b", CType::Int);

        let la = dag.intern_leaf(Op::Addr, CType::Pointer, a);
        let lb = dag.intern_leaf(Op::Addr, CType::Pointer, b);
        let va = dag.intern_unary(Op::Load, CType::Int, la);
        let vb = dag.intern_unary(Op::Load, CType::Int, lb);
        let sum1 = dag.intern_binary(Op::Add, CType::Int, va, vb, None);

        let la2 = dag.intern_leaf(Op::Addr, CType::Pointer, a);
        let va2 = dag.intern_unary(Op::Load, CType::Int, la2);
        let sum2 = dag.intern_binary(Op::Add, CType::Int, va2, vb, None);

        assert_eq!(la, la2);
        assert_eq!(sum1, sum2);
        assert_eq!(dag.stats().hits, 3);

        let diff = dag.intern_binary(Op::Sub, CType::Int, va, vb, None);
        assert_ne!(diff, sum1);
        let swapped = dag.intern_binary(Op::Add, CType::Int, vb, va, None);
        assert_ne!(swapped, sum1);
    }

    #[test]
    fn test_reset_creates_new_nodes() {
        let (mut dag, mut symbols) = setup();
        let x = symbols.global("x", CType::Int);
        let before = dag.intern_leaf(Op::Addr, CType::Pointer, x);
        dag.reset_pool();
        let after = dag.intern_leaf(Op::Addr, CType::Pointer, x);
        assert_ne!(before, after);
        assert_eq!(dag.node(after).generation, 1);
        // Nodes from the old generation stay readable.
        assert_eq!(dag.node(before).sym, Some(x));
    }

    #[test]
    fn test_side_effects_never_unify() {
        let (mut dag, mut symbols) = setup();
        let x = symbols.global("x", CType::Int);
        let one = symbols.int_const(1, CType::Int);
        let addr = dag.intern_leaf(Op::Addr, CType::Pointer, x);
        let c = dag.intern_leaf(Op::Const, CType::Int, one);
        let s1 = dag.fresh(Op::Assign, CType::Int, [Some(addr), Some(c)], None, 0);
        let s2 = dag.fresh(Op::Assign, CType::Int, [Some(addr), Some(c)], None, 0);
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_invalidate_only_affected_loads() {
        let (mut dag, mut symbols) = setup();
        let x = symbols.global("x", CType::Int);
        let y = symbols.global("y", CType::Int);
        let ax = dag.intern_leaf(Op::Addr, CType::Pointer, x);
        let ay = dag.intern_leaf(Op::Addr, CType::Pointer, y);
        let lx = dag.intern_unary(Op::Load, CType::Int, ax);
        let ly = dag.intern_unary(Op::Load, CType::Int, ay);
        let through = dag.intern_unary(Op::Load, CType::Int, ly);

        dag.invalidate(x);

        assert_ne!(dag.intern_unary(Op::Load, CType::Int, ax), lx);
        assert_eq!(dag.intern_unary(Op::Load, CType::Int, ay), ly);
        assert_ne!(dag.intern_unary(Op::Load, CType::Int, ly), through);
        assert_eq!(dag.intern_leaf(Op::Addr, CType::Pointer, x), ax);
    }

    #[test]
    fn test_capacity_forces_reset() {
        let mut dag = DagPool::new(4);
        let mut symbols = SymbolTable::new();
        let first = {
            let c = symbols.int_const(0, CType::Int);
            dag.intern_leaf(Op::Const, CType::Int, c)
        };
        for v in 1..4 {
            let c = symbols.int_const(v, CType::Int);
            dag.intern_leaf(Op::Const, CType::Int, c);
        }
        assert_eq!(dag.stats().resets, 0);
        let c = symbols.int_const(9, CType::Int);
        dag.intern_leaf(Op::Const, CType::Int, c);
        assert_eq!(dag.stats().resets, 1);
        let zero = symbols.int_const(0, CType::Int);
        assert_ne!(dag.intern_leaf(Op::Const, CType::Int, zero), first);
    }

    #[test]
    fn test_cond_negation() {
        use std::cmp::Ordering;
        for cond in [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Le, Cond::Gt, Cond::Ge] {
            for ord in [Ordering::Less, Ordering::Equal, Ordering::Greater] {
                assert_ne!(cond.holds(ord), cond.negate().holds(ord));
            }
        }
    }
}
