//! Compiles the built-in sample functions and prints their listings.
//!
//! With `--run` each sample is also executed on the reference interpreter.

use bumpalo::Bump;
use ccgen::codegen::{CodegenContext, CodegenOptions};
use ccgen::core::{CType, CompilationSession, Symbol, SymbolTable};
use ccgen::tree::{BinaryOp, FunctionDef, TreeBuilder};
use ccgen::vm::{Machine, Value};
use clap::Parser;
use std::cell::Cell;

#[derive(Parser, Debug)]
#[command(name = "ccgen-demo", about = "Compile the built-in sample functions")]
struct Args {
    /// Compile only the named sample
    #[arg(long)]
    sample: Option<String>,
    /// Keep blocks that cannot be reached from the entry
    #[arg(long)]
    no_prune: bool,
    /// Run each sample on the reference interpreter
    #[arg(long)]
    run: bool,
    /// Log every emitted instruction at debug level
    #[arg(long)]
    trace: bool,
}

struct Sample<'a> {
    name: &'static str,
    def: &'a FunctionDef<'a>,
    args: Vec<Value>,
}

/// `x = (a + b) * (a + b); return x;`
fn square_sum<'a>(tb: &mut TreeBuilder<'a, '_>) -> &'a FunctionDef<'a> {
    let f = tb.symbols().function("square_sum", CType::Int);
    let x = tb.symbols().global("x", CType::Int);
    let a = tb.symbols().param("a", CType::Int);
    let b = tb.symbols().param("b", CType::Int);
    let (va, vb) = (tb.var(a), tb.var(b));
    let sum = tb.binary(BinaryOp::Add, va, vb);
    let (va, vb) = (tb.var(a), tb.var(b));
    let sum2 = tb.binary(BinaryOp::Add, va, vb);
    let prod = tb.binary(BinaryOp::Mul, sum, sum2);
    let vx = tb.var(x);
    let store = tb.assign(vx, prod);
    let s1 = tb.expr_stmt(store);
    let vx = tb.var(x);
    let s2 = tb.ret(Some(vx));
    let body = tb.block(&[], &[s1, s2]);
    tb.function(f, &[a, b], body)
}

/// `if (a > b) return a; else return b;`
fn max<'a>(tb: &mut TreeBuilder<'a, '_>) -> &'a FunctionDef<'a> {
    let f = tb.symbols().function("max", CType::Int);
    let a = tb.symbols().param("a", CType::Int);
    let b = tb.symbols().param("b", CType::Int);
    let (va, vb) = (tb.var(a), tb.var(b));
    let test = tb.binary(BinaryOp::Gt, va, vb);
    let va = tb.var(a);
    let then = tb.ret(Some(va));
    let vb = tb.var(b);
    let other = tb.ret(Some(vb));
    let stmt = tb.if_stmt(test, then, Some(other));
    let body = tb.block(&[], &[stmt]);
    tb.function(f, &[a, b], body)
}

/// `int r = 1; while (n > 1) { r = r * n; n = n - 1; } return r;`
fn fact<'a>(tb: &mut TreeBuilder<'a, '_>) -> &'a FunctionDef<'a> {
    let f = tb.symbols().function("fact", CType::Int);
    let n = tb.symbols().param("n", CType::Int);
    let r = tb.symbols().local("r", CType::Int);
    let one = tb.int(1);
    let decl = tb.decl(r, Some(one));

    let (vn, one) = (tb.var(n), tb.int(1));
    let test = tb.binary(BinaryOp::Gt, vn, one);
    let (vr, vn) = (tb.var(r), tb.var(n));
    let prod = tb.binary(BinaryOp::Mul, vr, vn);
    let vr = tb.var(r);
    let step_r = tb.assign(vr, prod);
    let (vn, one) = (tb.var(n), tb.int(1));
    let dec = tb.binary(BinaryOp::Sub, vn, one);
    let vn = tb.var(n);
    let step_n = tb.assign(vn, dec);
    let s1 = tb.expr_stmt(step_r);
    let s2 = tb.expr_stmt(step_n);
    let loop_body = tb.block(&[], &[s1, s2]);
    let lp = tb.while_stmt(test, loop_body);
    let vr = tb.var(r);
    let ret = tb.ret(Some(vr));
    let body = tb.block(&[decl], &[lp, ret]);
    tb.function(f, &[n], body)
}

/// `return (next(1) + next(2)) + (next(3) + next(4));` with `next` supplied by the host.
fn sum_calls<'a>(tb: &mut TreeBuilder<'a, '_>, next: Symbol) -> &'a FunctionDef<'a> {
    let f = tb.symbols().function("sum_calls", CType::Int);
    let mut calls = Vec::new();
    for i in 1..=4 {
        let arg = tb.int(i);
        calls.push(tb.call_fn(next, &[arg]));
    }
    let left = tb.binary(BinaryOp::Add, calls[0], calls[1]);
    let right = tb.binary(BinaryOp::Add, calls[2], calls[3]);
    let total = tb.binary(BinaryOp::Add, left, right);
    let ret = tb.ret(Some(total));
    let body = tb.block(&[], &[ret]);
    tb.function(f, &[], body)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut symbols = SymbolTable::new();
    let next = symbols.function("next", CType::Int);

    let samples = {
        let mut tb = session.builder(&mut symbols);
        vec![
            Sample {
                name: "square_sum",
                def: square_sum(&mut tb),
                args: vec![Value::Int(3), Value::Int(4)],
            },
            Sample {
                name: "max",
                def: max(&mut tb),
                args: vec![Value::Int(-7), Value::Int(2)],
            },
            Sample {
                name: "fact",
                def: fact(&mut tb),
                args: vec![Value::Int(6)],
            },
            Sample {
                name: "sum_calls",
                def: sum_calls(&mut tb, next),
                args: vec![],
            },
        ]
    };
    let selected: Vec<&Sample<'_>> = samples
        .iter()
        .filter(|s| args.sample.as_deref().map_or(true, |name| name == s.name))
        .collect();
    if selected.is_empty() {
        let names: Vec<&str> = samples.iter().map(|s| s.name).collect();
        return Err(format!("unknown sample; available: {}", names.join(", ")).into());
    }

    let options = CodegenOptions {
        prune_unreachable: !args.no_prune,
        trace_listing: args.trace,
        ..CodegenOptions::default()
    };
    let mut compiled = Vec::new();
    {
        let mut ctx = CodegenContext::new(&mut symbols, options);
        for sample in &selected {
            compiled.push(session.compile(&mut ctx, sample.def)?);
        }
    }

    for func in &compiled {
        println!("{}", func.listing(&symbols));
    }
    println!("{}", session.stats());

    if args.run {
        let counter = Cell::new(0i64);
        let mut vm = Machine::new(&symbols);
        vm.host(next, |args| {
            counter.set(counter.get() + 1);
            Value::Int(args.int(0) as i64 * 10)
        });
        for func in &compiled {
            vm.load(func);
        }
        for (sample, func) in selected.iter().zip(&compiled) {
            let result = vm.call(func.name, &sample.args)?;
            println!("{}({:?}) = {:?}", sample.name, sample.args, result);
        }
        println!("host calls: {}", counter.get());
    }
    Ok(())
}
