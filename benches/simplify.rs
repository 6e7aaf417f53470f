//! Simplifier fixed-point benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ropforge::expr::{Binop, Expr};

fn deep_affine(n: u16) -> Expr {
    let mut e = Expr::reg(0, 64);
    for i in 1..n {
        e = e.add(Expr::reg(i % 8, 64));
        e = e.sub(Expr::cst(u64::from(i), 64));
    }
    e
}

fn bench_simplify(c: &mut Criterion) {
    let affine = deep_affine(32);
    c.bench_function("simplify_affine_chain", |b| {
        b.iter(|| black_box(&affine).simplify())
    });

    let masked = Expr::binop(
        Binop::And,
        Expr::binop(Binop::Xor, Expr::reg(1, 64), Expr::reg(1, 64)),
        Expr::cst(0xffff, 64),
    );
    c.bench_function("simplify_bitwise", |b| {
        b.iter(|| black_box(&masked).simplify())
    });

    let sliced = Expr::concat(
        Expr::extract(Expr::reg(2, 64), 63, 32),
        Expr::extract(Expr::reg(2, 64), 31, 0),
    );
    c.bench_function("simplify_slice_merge", |b| {
        b.iter(|| black_box(&sliced).simplify())
    });
}

criterion_group!(benches, bench_simplify);
criterion_main!(benches);
