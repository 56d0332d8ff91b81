use canopy::clause::{Carried, Clause, GroupKey};
use canopy::eval::EvalContext;
use canopy::expr::{Expr, VarGenerator};
use canopy::optimize::Compiler;
use canopy::pipeline::Pipeline;
use canopy::value::{CmpOp, Item};

fn integers(values: &[i64]) -> Expr {
    Expr::Literal(values.iter().copied().map(Item::Integer).collect())
}

fn ints(values: &[i64]) -> Vec<Item> {
    values.iter().copied().map(Item::Integer).collect()
}

fn grouped_pipeline(generator: &mut VarGenerator) -> Pipeline {
    let x = generator.fresh("x");
    let g = generator.fresh("g");
    let all = generator.fresh("all");
    Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 2, 1, 3, 2])),
            Clause::GroupBy {
                keys: vec![GroupKey { var: g, expr: Expr::var(&x) }],
                carried: vec![Carried { out: all.clone(), source: x }],
            },
        ],
        Expr::var(&all),
    )
}

#[test]
fn groups_emit_in_first_appearance_order() {
    let mut generator = VarGenerator::new();
    let pipeline = grouped_pipeline(&mut generator);
    let result = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    // carried values concatenate in tuple order within each group
    assert_eq!(result, ints(&[1, 1, 2, 2, 3]));
}

#[test]
fn group_keys_are_bound_per_group() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let g = generator.fresh("g");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[2, 1, 2, 1, 1])),
            Clause::GroupBy {
                keys: vec![GroupKey { var: g.clone(), expr: Expr::var(&x) }],
                carried: vec![],
            },
        ],
        Expr::var(&g),
    );
    let result = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    assert_eq!(result, ints(&[2, 1]));
}

#[test]
fn multi_item_group_key_raises() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let g = generator.fresh("g");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x, integers(&[1])),
            Clause::GroupBy {
                keys: vec![GroupKey { var: g.clone(), expr: integers(&[1, 2]) }],
                carried: vec![],
            },
        ],
        Expr::var(&g),
    );
    let err = pipeline.evaluate(&mut EvalContext::new()).unwrap_err();
    assert!(err.to_string().contains("grouping key"), "unexpected error: {err}");
}

#[test]
fn dead_carried_variables_are_pruned_by_compilation() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let g = generator.fresh("g");
    let all = generator.fresh("all");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 2, 1])),
            Clause::GroupBy {
                keys: vec![GroupKey { var: g.clone(), expr: Expr::var(&x) }],
                carried: vec![Carried { out: all, source: x }],
            },
        ],
        Expr::var(&g),
    );
    let mut compiler = Compiler::new(generator);
    let compiled = compiler.compile(pipeline.into_expr()).expect("compiles");
    let Expr::Flwor(optimized) = &compiled else {
        panic!("expected a pipeline, got {compiled:?}");
    };
    let Some(Clause::GroupBy { carried, .. }) = optimized.clauses.last() else {
        panic!("expected a trailing group clause: {optimized:?}");
    };
    assert!(carried.is_empty(), "unused carried variable survived");
    let result = compiled.evaluate(&mut EvalContext::new()).expect("evaluates");
    assert_eq!(result, ints(&[1, 2]));
}

#[test]
fn grouping_survives_compilation_unchanged() {
    let mut generator = VarGenerator::new();
    let pipeline = grouped_pipeline(&mut generator);
    let expected = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    let mut compiler = Compiler::new(generator);
    let compiled = compiler.compile(pipeline.into_expr()).expect("compiles");
    let result = compiled.evaluate(&mut EvalContext::new()).expect("evaluates");
    assert_eq!(result, expected);
}

#[test]
fn windows_tumble_between_opening_items() {
    let mut generator = VarGenerator::new();
    let w = generator.fresh("w");
    let pipeline = Pipeline::new(
        vec![Clause::Window {
            var: w.clone(),
            source: integers(&[1, 5, 2, 6, 3]),
            // a window opens at every item >= 5
            start: Expr::cmp(CmpOp::Ge, Expr::ContextItem, Expr::integer(5)),
            end: None,
        }],
        Expr::var(&w),
    );
    let result = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    // items before the first opening item are dropped; the trailing
    // partial window is emitted
    assert_eq!(result, ints(&[5, 2, 6, 3]));
}

#[test]
fn window_end_condition_closes_inclusively() {
    let mut generator = VarGenerator::new();
    let w = generator.fresh("w");
    let c = generator.fresh("c");
    let pipeline = Pipeline::new(
        vec![
            Clause::Window {
                var: w.clone(),
                source: integers(&[5, 1, 2, 5, 3, 2]),
                start: Expr::cmp(CmpOp::Ge, Expr::ContextItem, Expr::integer(5)),
                end: Some(Expr::cmp(CmpOp::Eq, Expr::ContextItem, Expr::integer(2))),
            },
            Clause::Count { var: c.clone() },
        ],
        Expr::Concat(vec![Expr::var(&c), Expr::var(&w)]),
    );
    let result = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    // first window [5, 1, 2] closes at the 2; the 5 reopens; [5, 3, 2]
    // closes at the final 2
    assert_eq!(result, ints(&[1, 5, 1, 2, 2, 5, 3, 2]));
}

#[test]
fn window_with_no_opening_item_is_empty() {
    let mut generator = VarGenerator::new();
    let w = generator.fresh("w");
    let pipeline = Pipeline::new(
        vec![Clause::Window {
            var: w.clone(),
            source: integers(&[1, 2, 3]),
            start: Expr::cmp(CmpOp::Gt, Expr::ContextItem, Expr::integer(10)),
            end: None,
        }],
        Expr::var(&w),
    );
    let result = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
    assert_eq!(result, Vec::<Item>::new());
}
