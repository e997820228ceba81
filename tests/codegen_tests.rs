//! Structural tests of the selected code: CSE, control flow shape, pool
//! resets and frame temporaries.

use bumpalo::Bump;
use ccgen::canon::blocks::Cfg;
use ccgen::canon::Canonicalizer;
use ccgen::codegen::{CodegenContext, CodegenOptions, CompiledFunction};
use ccgen::core::{CType, CodegenError, SymbolTable};
use ccgen::tree::{BinaryOp, FunctionDef, TreeBuilder};
use ccgen::Opcode;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compile(symbols: &mut SymbolTable, def: &FunctionDef<'_>) -> CompiledFunction {
    let mut cg = CodegenContext::new(symbols, CodegenOptions::default());
    cg.compile_function(def).unwrap()
}

fn jcc_count(f: &CompiledFunction) -> usize {
    f.instrs().filter(|i| matches!(i.op, Opcode::Jcc(_))).count()
}

#[test]
fn test_common_subexpression_computed_once() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let x = symbols.global("x", CType::Int);
    let a = symbols.param("a", CType::Int);
    let b = symbols.param("b", CType::Int);

    // x = (a + b) * (a + b);
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let s1 = tb.binary(BinaryOp::Add, va, vb);
        let (va, vb) = (tb.var(a), tb.var(b));
        let s2 = tb.binary(BinaryOp::Add, va, vb);
        let prod = tb.binary(BinaryOp::Mul, s1, s2);
        let vx = tb.var(x);
        let store = tb.assign(vx, prod);
        let stmt = tb.expr_stmt(store);
        let body = tb.block(&[], &[stmt]);
        tb.function(f, &[a, b], body)
    };
    let compiled = compile(&mut symbols, def);

    assert_eq!(compiled.count(Opcode::Add), 1, "{}", compiled.listing(&symbols));
    assert_eq!(compiled.count(Opcode::Mul), 1);
    assert!(compiled.stats.cse_hits > 0);
    assert_eq!(compiled.stats.spills, 0);
}

#[test]
fn test_if_else_shape() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let x = symbols.global("x", CType::Int);
    let a = symbols.param("a", CType::Int);
    let b = symbols.param("b", CType::Int);

    // if (a < b) { x = 1; } else { x = 2; }
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let test = tb.binary(BinaryOp::Lt, va, vb);
        let (vx, one) = (tb.var(x), tb.int(1));
        let set1 = tb.assign(vx, one);
        let s1 = tb.expr_stmt(set1);
        let then = tb.block(&[], &[s1]);
        let (vx, two) = (tb.var(x), tb.int(2));
        let set2 = tb.assign(vx, two);
        let s2 = tb.expr_stmt(set2);
        let other = tb.block(&[], &[s2]);
        let stmt = tb.if_stmt(test, then, Some(other));
        let body = tb.block(&[], &[stmt]);
        tb.function(f, &[a, b], body)
    };

    let ir = Canonicalizer::new(&mut symbols).function(def).unwrap();
    let cfg = Cfg::build(&ir.codes, ir.exit).unwrap();
    assert_eq!(cfg.conditional_jumps(&ir.codes), 1);
    assert!(cfg.unconditional_jumps(&ir.codes) <= 1);
    let body_blocks = cfg
        .blocks()
        .iter()
        .filter(|b| b.label != Some(ir.exit))
        .count();
    assert!((3..=4).contains(&body_blocks), "{body_blocks} blocks");

    let compiled = compile(&mut symbols, def);
    assert_eq!(jcc_count(&compiled), 1);
    assert!(compiled.count(Opcode::Jmp) <= 1);
}

#[test]
fn test_unreachable_code_is_pruned() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Int);
    let x = symbols.global("x", CType::Int);

    // return 1; x = 2;
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let one = tb.int(1);
        let ret = tb.ret(Some(one));
        let (vx, two) = (tb.var(x), tb.int(2));
        let set = tb.assign(vx, two);
        let dead = tb.expr_stmt(set);
        let body = tb.block(&[], &[ret, dead]);
        tb.function(f, &[], body)
    };

    let pruned = compile(&mut symbols, def);
    assert!(pruned.stats.pruned_blocks >= 1);
    let stores_to_x = |c: &CompiledFunction| {
        c.instrs()
            .filter(|i| matches!(i.dst, Some(ccgen::Operand::Ind(a)) if a.sym == Some(x)))
            .count()
    };
    assert_eq!(stores_to_x(&pruned), 0);

    let options = CodegenOptions {
        prune_unreachable: false,
        ..CodegenOptions::default()
    };
    let mut cg = CodegenContext::new(&mut symbols, options);
    let kept = cg.compile_function(def).unwrap();
    assert_eq!(kept.stats.pruned_blocks, 0);
    assert_eq!(stores_to_x(&kept), 1);
}

#[test]
fn test_store_to_named_variable_keeps_other_values() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let x = symbols.global("x", CType::Int);
    let y = symbols.global("y", CType::Int);
    let a = symbols.param("a", CType::Int);
    let b = symbols.param("b", CType::Int);

    // x = a + b; y = a + b;
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let mut stmts = Vec::new();
        for target in [x, y] {
            let (va, vb) = (tb.var(a), tb.var(b));
            let sum = tb.binary(BinaryOp::Add, va, vb);
            let vt = tb.var(target);
            let set = tb.assign(vt, sum);
            stmts.push(tb.expr_stmt(set));
        }
        let body = tb.block(&[], &stmts);
        tb.function(f, &[a, b], body)
    };
    let compiled = compile(&mut symbols, def);
    assert_eq!(compiled.count(Opcode::Add), 1);
}

#[test]
fn test_call_resets_the_pool() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let g = symbols.function("g", CType::Void);
    let x = symbols.global("x", CType::Int);
    let y = symbols.global("y", CType::Int);
    let a = symbols.global("a", CType::Int);
    let b = symbols.global("b", CType::Int);

    // x = a + b; g(); y = a + b;
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let (va, vb) = (tb.var(a), tb.var(b));
        let s = tb.binary(BinaryOp::Add, va, vb);
        let vx = tb.var(x);
        let set = tb.assign(vx, s);
        let first = tb.expr_stmt(set);
        let call = tb.call_fn(g, &[]);
        let call = tb.expr_stmt(call);
        let (va, vb) = (tb.var(a), tb.var(b));
        let s = tb.binary(BinaryOp::Add, va, vb);
        let vy = tb.var(y);
        let set = tb.assign(vy, s);
        let second = tb.expr_stmt(set);
        let body = tb.block(&[], &[first, call, second]);
        tb.function(f, &[], body)
    };
    let compiled = compile(&mut symbols, def);
    assert_eq!(compiled.count(Opcode::Add), 2);
    assert!(compiled.stats.dag_resets >= 1);
    assert_eq!(compiled.count(Opcode::Call), 1);
}

#[test]
fn test_dead_temporary_slot_is_reused() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let next = symbols.function("next", CType::Int);
    let x = symbols.global("x", CType::Int);
    let y = symbols.global("y", CType::Int);

    // x = next(1) + next(2); y = next(3) + next(4);
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let mut stmts = Vec::new();
        for (target, base) in [(x, 1), (y, 3)] {
            let (c1, c2) = (tb.int(base), tb.int(base + 1));
            let l = tb.call_fn(next, &[c1]);
            let r = tb.call_fn(next, &[c2]);
            let sum = tb.binary(BinaryOp::Add, l, r);
            let vt = tb.var(target);
            let set = tb.assign(vt, sum);
            stmts.push(tb.expr_stmt(set));
        }
        let body = tb.block(&[], &stmts);
        tb.function(f, &[], body)
    };
    let compiled = compile(&mut symbols, def);

    // Each statement spills its first call result across the second call,
    // and both spills share one slot.
    assert_eq!(compiled.stats.spills, 2);
    assert_eq!(compiled.stats.reloads, 2);
    assert_eq!(compiled.frame_size, 4);
    let enter = compiled.instrs().next().unwrap();
    assert_eq!(enter.op, Opcode::Enter);
    assert_eq!(enter.bytes, 4);
}

#[test]
fn test_struct_condition_is_unsupported() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let s = symbols.global("s", CType::Struct { size: 8 });

    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let vs = tb.var(s);
        let empty = tb.block(&[], &[]);
        let stmt = tb.if_stmt(vs, empty, None);
        let body = tb.block(&[], &[stmt]);
        tb.function(f, &[], body)
    };
    let mut cg = CodegenContext::new(&mut symbols, CodegenOptions::default());
    let err = cg.compile_function(def).unwrap_err();
    assert!(matches!(err, CodegenError::Unsupported { .. }));
}

#[test]
fn test_struct_assignment_copies_bytes() {
    init();
    let arena = Bump::new();
    let mut symbols = SymbolTable::new();
    let f = symbols.function("f", CType::Void);
    let ty = CType::Struct { size: 12 };
    let s = symbols.global("s", ty);
    let t = symbols.local("t", ty);

    // { struct T t = {0}; s = t; }
    let def = {
        let mut tb = TreeBuilder::new(&arena, &mut symbols);
        let decl = tb.zeroed(t);
        let (vs, vt) = (tb.var(s), tb.var(t));
        let set = tb.assign(vs, vt);
        let stmt = tb.expr_stmt(set);
        let body = tb.block(&[decl], &[stmt]);
        tb.function(f, &[], body)
    };
    let compiled = compile(&mut symbols, def);
    let copy = compiled
        .instrs()
        .find(|i| i.op == Opcode::Copy)
        .expect("a block copy");
    assert_eq!(copy.bytes, 12);
    assert_eq!(compiled.count(Opcode::ZeroFill), 1);
    assert_eq!(compiled.frame_size, 12);
}
