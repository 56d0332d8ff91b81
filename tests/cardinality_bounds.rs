use canopy::clause::{Clause, GroupKey};
use canopy::eval::EvalContext;
use canopy::expr::{Expr, VarGenerator};
use canopy::pipeline::Pipeline;
use canopy::seqtype::Card;
use canopy::value::{CmpOp, Item};

fn integers(values: &[i64]) -> Expr {
    Expr::Literal(values.iter().copied().map(Item::Integer).collect())
}

#[test]
fn iterate_multiplies_by_source_size() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let y = generator.fresh("y");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x, integers(&[1, 2, 3])),
            Clause::iterate(y, integers(&[1, 2])),
        ],
        Expr::integer(0),
    );
    assert_eq!(pipeline.calc_size(false), Card::exact(6));
}

#[test]
fn filter_drops_the_lower_bound() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 2, 3])),
            Clause::filter(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(1))),
        ],
        Expr::var(&x),
    );
    assert_eq!(pipeline.calc_size(false), Card { min: 0, max: Some(3) });
}

#[test]
fn unknown_source_degrades_to_unbounded() {
    let mut generator = VarGenerator::new();
    let s = generator.fresh("s");
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x, Expr::var(&s))],
        Expr::integer(0),
    );
    assert_eq!(pipeline.calc_size(false), Card::UNKNOWN);
}

#[test]
fn empty_source_stops_further_combination() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let s = generator.fresh("s");
    let y = generator.fresh("y");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x, Expr::empty()),
            Clause::iterate(y, Expr::var(&s)),
        ],
        Expr::integer(0),
    );
    assert_eq!(pipeline.calc_size(false), Card::exact(0));
}

#[test]
fn allow_empty_guarantees_one_tuple() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::Iterate {
            var: x,
            pos: None,
            source: Expr::empty(),
            allow_empty: true,
        }],
        Expr::integer(0),
    );
    assert_eq!(pipeline.calc_size(false), Card::ONE);
}

#[test]
fn group_by_caps_the_lower_bound_at_one() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let g = generator.fresh("g");
    let pipeline = Pipeline::new(
        vec![
            Clause::iterate(x.clone(), integers(&[1, 1, 2])),
            Clause::GroupBy {
                keys: vec![GroupKey { var: g.clone(), expr: Expr::var(&x) }],
                carried: vec![],
            },
        ],
        Expr::var(&g),
    );
    assert_eq!(pipeline.calc_size(false), Card { min: 1, max: Some(3) });
}

#[test]
fn window_bounds_by_source_size() {
    let mut generator = VarGenerator::new();
    let w = generator.fresh("w");
    let pipeline = Pipeline::new(
        vec![Clause::Window {
            var: w.clone(),
            source: integers(&[1, 2, 3, 4]),
            start: Expr::boolean(true),
            end: None,
        }],
        Expr::var(&w),
    );
    assert_eq!(pipeline.calc_size(false), Card { min: 0, max: Some(4) });
}

#[test]
fn include_return_multiplies_by_return_size() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipeline = Pipeline::new(
        vec![Clause::iterate(x, integers(&[1, 2, 3]))],
        integers(&[7, 8]),
    );
    assert_eq!(pipeline.calc_size(true), Card::exact(6));
}

/// The true result count always lies within the reported bounds.
#[test]
fn reported_bounds_contain_the_true_count() {
    let mut generator = VarGenerator::new();
    let x = generator.fresh("x");
    let pipelines = vec![
        Pipeline::new(
            vec![Clause::iterate(x.clone(), integers(&[1, 2, 3, 4]))],
            Expr::var(&x),
        ),
        Pipeline::new(
            vec![
                Clause::iterate(x.clone(), integers(&[1, 2, 3, 4])),
                Clause::filter(Expr::cmp(CmpOp::Ge, Expr::var(&x), Expr::integer(3))),
            ],
            Expr::var(&x),
        ),
        Pipeline::new(
            vec![Clause::iterate(x.clone(), Expr::empty())],
            Expr::var(&x),
        ),
    ];
    for pipeline in pipelines {
        let bounds = pipeline.calc_size(true);
        let result = pipeline.evaluate(&mut EvalContext::new()).expect("evaluates");
        let count = result.len() as u64;
        assert!(bounds.min <= count, "count {count} below min {bounds:?}");
        if let Some(max) = bounds.max {
            assert!(count <= max, "count {count} above max {bounds:?}");
        }
    }
}
