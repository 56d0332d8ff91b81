use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use canopy::clause::Clause;
use canopy::eval::EvalContext;
use canopy::expr::{Expr, VarGenerator};
use canopy::optimize::Compiler;
use canopy::pipeline::Pipeline;
use canopy::value::CmpOp;

/// An iterate/filter/bind chain with a positional filter, exercising the
/// rewrite passes that fire most often.
fn build_pipeline(generator: &mut VarGenerator) -> Pipeline {
    let x = generator.fresh("x");
    let p = generator.fresh("p");
    let y = generator.fresh("y");
    Pipeline::new(
        vec![
            Clause::iterate_at(x.clone(), p.clone(), Expr::Range { start: 1, end: 1000 }),
            Clause::filter(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(10))),
            Clause::bind(y.clone(), Expr::cmp(CmpOp::Lt, Expr::var(&x), Expr::integer(900))),
            Clause::filter(Expr::var(&y)),
            Clause::filter(Expr::cmp(CmpOp::Le, Expr::var(&p), Expr::integer(500))),
        ],
        Expr::var(&x),
    )
}

fn compile_pipeline(c: &mut Criterion) {
    c.bench_function("compile pipeline", |b| {
        b.iter(|| {
            let mut generator = VarGenerator::new();
            let pipeline = build_pipeline(&mut generator);
            let mut compiler = Compiler::new(generator);
            black_box(compiler.compile(pipeline.into_expr()).unwrap())
        })
    });
}

fn evaluate_compiled(c: &mut Criterion) {
    let mut generator = VarGenerator::new();
    let pipeline = build_pipeline(&mut generator);
    let mut compiler = Compiler::new(generator);
    let compiled = compiler.compile(pipeline.into_expr()).unwrap();
    c.bench_function("evaluate compiled pipeline", |b| {
        b.iter(|| {
            let mut ctx = EvalContext::new();
            black_box(compiled.evaluate(&mut ctx).unwrap())
        })
    });
}

fn evaluate_unoptimized(c: &mut Criterion) {
    let mut generator = VarGenerator::new();
    let pipeline = build_pipeline(&mut generator);
    c.bench_function("evaluate unoptimized pipeline", |b| {
        b.iter(|| {
            let mut ctx = EvalContext::new();
            black_box(pipeline.evaluate(&mut ctx).unwrap())
        })
    });
}

criterion_group!(
    benches,
    compile_pipeline,
    evaluate_compiled,
    evaluate_unoptimized
);
criterion_main!(benches);
