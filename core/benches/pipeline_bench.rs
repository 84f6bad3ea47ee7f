use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use bytepatch_core::code::{CodeUnit, Const, UnitBuilder};
use bytepatch_core::ir::{Opcode, decode, encode};
use bytepatch_core::patch::{Pattern, PatternOp, Pinned, match_and_replace, optimize};

// A straight-line body of `n` copy chains: `x = k; y = x; z = y; print(z)`.
fn copy_chains(n: usize) -> CodeUnit {
    let mut b = UnitBuilder::function("chains", &[]);
    for k in 0..n {
        let (x, y, z) = (format!("x{}", k), format!("y{}", k), format!("z{}", k));
        b.load_const(Const::Int(k as i64))
            .store_fast(&x)
            .load_fast(&x)
            .store_fast(&y)
            .load_fast(&y)
            .store_fast(&z)
            .load_global("print")
            .load_fast(&z)
            .op_arg(Opcode::CallFunction, 1)
            .op(Opcode::PopTop);
    }
    b.load_const(Const::None).op(Opcode::ReturnValue);
    b.build().unwrap()
}

fn bench_decode_encode(c: &mut Criterion) {
    let unit = copy_chains(20);
    c.bench_function("decode_20_chains", |b| {
        b.iter(|| black_box(decode(black_box(&unit)).unwrap()));
    });

    let seq = decode(&unit).unwrap();
    c.bench_function("encode_20_chains", |b| {
        b.iter(|| black_box(encode(black_box(&seq)).unwrap()));
    });
}

fn bench_rewrite(c: &mut Criterion) {
    let unit = copy_chains(20);
    let seq = decode(&unit).unwrap();
    // print(z) -> z
    let before = Pattern::new(vec![
        PatternOp::arg(Opcode::LoadGlobal, 0),
        PatternOp::bind(Opcode::LoadFast, "$1"),
        PatternOp::arg(Opcode::CallFunction, 1),
        PatternOp::bare(Opcode::PopTop),
    ]);
    let after = Pattern::new(vec![
        PatternOp::bind(Opcode::LoadFast, "$1"),
        PatternOp::bare(Opcode::PopTop),
    ]);

    c.bench_function("rewrite_20_sites", |b| {
        b.iter(|| {
            let mut work = seq.clone();
            black_box(match_and_replace(&mut work, &before, &after).unwrap());
        })
    });
}

fn bench_optimize(c: &mut Criterion) {
    let unit = copy_chains(20);
    let seq = decode(&unit).unwrap();
    let pinned = Pinned { consts: 1, locals: 0 };

    c.bench_function("optimize_20_chains", |b| {
        b.iter(|| {
            let mut work = seq.clone();
            black_box(optimize(&mut work, pinned).unwrap());
        })
    });
}

criterion_group!(benches, bench_decode_encode, bench_rewrite, bench_optimize);
criterion_main!(benches);
