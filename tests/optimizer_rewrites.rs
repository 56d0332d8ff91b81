use canopy::clause::{Clause, OrderKey};
use canopy::eval::EvalContext;
use canopy::expr::{Expr, VarGenerator};
use canopy::optimize::Compiler;
use canopy::pipeline::Pipeline;
use canopy::value::{CmpOp, Item};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn compile(pipeline: Pipeline, generator: VarGenerator) -> Expr {
    init_tracing();
    let mut compiler = Compiler::new(generator);
    compiler.compile(pipeline.into_expr()).expect("pipeline compiles")
}

fn integers(values: &[i64]) -> Expr {
    Expr::Literal(values.iter().copied().map(Item::Integer).collect())
}

fn texts(values: &[&str]) -> Expr {
    Expr::Literal(values.iter().map(|v| Item::Text((*v).to_owned())).collect())
}

fn evaluate(expr: &Expr) -> Vec<Item> {
    expr.evaluate(&mut EvalContext::new()).expect("evaluates")
}

#[test]
fn empty_source_collapses_to_empty_sequence() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x, Expr::empty())],
        Expr::text("A"),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, Expr::empty());
}

#[test]
fn unused_bind_is_deleted() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::bind(x, Expr::integer(1))],
        Expr::text("A"),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, Expr::text("A"));
}

#[test]
fn filter_is_absorbed_into_source_predicate() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 2, 3])),
            Clause::filter(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(1))),
        ],
        Expr::var(&x),
    );
    let compiled = compile(pipeline, generator);
    let expected = Expr::Predicate {
        input: Box::new(integers(&[1, 2, 3])),
        cond: Box::new(Expr::cmp(CmpOp::Gt, Expr::ContextItem, Expr::integer(1))),
    };
    assert_eq!(compiled, expected);
    assert_eq!(evaluate(&compiled), vec![Item::Integer(2), Item::Integer(3)]);
}

#[test]
fn positional_filter_becomes_position_predicate() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let p = generator.fresh("p");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate_at(x.clone(), p.clone(), texts(&["a", "b", "c"])),
            Clause::filter(Expr::cmp(CmpOp::Eq, Expr::var(&p), Expr::integer(2))),
        ],
        Expr::var(&x),
    );
    let compiled = compile(pipeline, generator);
    let expected = Expr::PositionPredicate {
        input: Box::new(texts(&["a", "b", "c"])),
        min: 2,
        max: 2,
    };
    assert_eq!(compiled, expected);
    assert_eq!(evaluate(&compiled), vec![Item::Text("b".to_owned())]);
}

#[test]
fn single_use_bind_is_inlined() {
    let mut generator = VarGenerator::new();
    let y = generator.fresh("y");
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![
            Clause::bind(y.clone(), Expr::Range { start: 1, end: 3 }),
            Clause::iterate(x.clone(), Expr::var(&y)),
        ],
        Expr::var(&x),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, Expr::Range { start: 1, end: 3 });
}

#[test]
fn single_item_iterate_folds_completely() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x.clone(), integers(&[42]))],
        Expr::cmp(CmpOp::Eq, Expr::var(&x), Expr::integer(42)),
    );
    // iterate over one item becomes a bind, the bind is inlined, and the
    // comparison of two constants folds away
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, Expr::boolean(true));
}

#[test]
fn dead_iterate_with_live_position_becomes_range() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let c = generator.fresh("c");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x, integers(&[9, 8, 7, 6, 5])),
            Clause::Count { var: c.clone() },
        ],
        Expr::var(&c),
    );
    // the count merges into the iterate as a positional variable; the item
    // binding is dead, so the source becomes a pure integer range
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, Expr::Range { start: 1, end: 5 });
    assert_eq!(
        evaluate(&compiled),
        (1..=5).map(Item::Integer).collect::<Vec<_>>()
    );
}

#[test]
fn dead_iterate_preserves_iteration_count() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x, integers(&[4, 4, 4]))],
        Expr::text("t"),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(
        evaluate(&compiled),
        vec![
            Item::Text("t".to_owned()),
            Item::Text("t".to_owned()),
            Item::Text("t".to_owned()),
        ]
    );
}

#[test]
fn guarded_return_splits_into_filter_and_collapses() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x.clone(), integers(&[1, 2, 3]))],
        Expr::If {
            cond: Box::new(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(1))),
            then: Box::new(Expr::var(&x)),
            otherwise: Box::new(Expr::empty()),
        },
    );
    // same final form as an explicit filter clause
    let compiled = compile(pipeline, generator);
    let expected = Expr::Predicate {
        input: Box::new(integers(&[1, 2, 3])),
        cond: Box::new(Expr::cmp(CmpOp::Gt, Expr::ContextItem, Expr::integer(1))),
    };
    assert_eq!(compiled, expected);
}

#[test]
fn loop_invariant_bind_is_hoisted_out_of_the_loop() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let y = generator.fresh("y");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x, integers(&[1, 2, 3])),
            Clause::bind(y.clone(), Expr::Range { start: 1, end: 2 }),
        ],
        Expr::Concat(vec![Expr::var(&y), Expr::var(&y)]),
    );
    let compiled = compile(pipeline, generator);
    let Expr::Flwor(optimized) = &compiled else {
        panic!("expected a pipeline, got {compiled:?}");
    };
    assert!(
        matches!(optimized.clauses.first(), Some(Clause::Bind { .. })),
        "bind should have moved above the loop: {optimized:?}"
    );
    let result = evaluate(&compiled);
    assert_eq!(result.len(), 12);
    assert_eq!(result[..4], [1, 2, 1, 2].map(Item::Integer));
}

#[test]
fn merged_return_rewrites_variables_inside_nested_pipelines() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let y = generator.fresh("y");
    let nested = Pipeline::new(
        vec![
            Clause::iterate(y.clone(), Expr::var(&x)),
            Clause::OrderBy {
                keys: vec![OrderKey { expr: Expr::var(&y), descending: false }],
            },
        ],
        Expr::var(&y),
    );
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x.clone(), integers(&[3, 1, 2]))],
        nested.into_expr(),
    );
    // the nested pipeline is not simple, so the trailing iterate becomes a
    // map; the iteration variable survives only as the context item
    let compiled = compile(pipeline, generator);
    assert_eq!(
        evaluate(&compiled),
        vec![Item::Integer(3), Item::Integer(1), Item::Integer(2)]
    );
}

#[test]
fn filter_is_not_hoisted_across_a_count() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let z = generator.fresh("z");
    let c = generator.fresh("c");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 2, 3, 4, 5])),
            Clause::bind(z.clone(), Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(0))),
            Clause::Count { var: c.clone() },
            Clause::filter(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(2))),
        ],
        Expr::Concat(vec![Expr::var(&c), Expr::var(&z), Expr::var(&z)]),
    );
    let expected = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    // the count numbers every tuple; the filter only selects afterwards
    assert_eq!(
        expected[..3],
        [Item::Integer(3), Item::Boolean(true), Item::Boolean(true)]
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(evaluate(&compiled), expected);
}

#[test]
fn constant_false_filter_discards_everything() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 2, 3])),
            Clause::filter(Expr::boolean(false)),
        ],
        Expr::var(&x),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, Expr::empty());
}

#[test]
fn constant_true_filter_is_removed() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), texts(&["a", "b"])),
            Clause::filter(Expr::boolean(true)),
        ],
        Expr::var(&x),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, texts(&["a", "b"]));
}

#[test]
fn nested_pipeline_in_source_is_flattened() {
    let mut generator = VarGenerator::new();
    let inner = generator.fresh("inner");
    let outer = generator.fresh("outer");
    let nested = Pipeline::new(
        vec![Clause::iterate(inner.clone(), integers(&[1, 2, 3]))],
        Expr::var(&inner),
    );
    let pipeline = Pipeline::new(
        vec![Clause::iterate(outer.clone(), nested.into_expr())],
        Expr::var(&outer),
    );
    let compiled = compile(pipeline, generator);
    assert_eq!(compiled, integers(&[1, 2, 3]));
}
