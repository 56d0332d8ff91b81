use canopy::clause::Clause;
use canopy::error::EngineError;
use canopy::eval::{CancelToken, EvalContext};
use canopy::expr::{Expr, VarGenerator};
use canopy::pipeline::Pipeline;
use canopy::value::Item;

fn pipeline(generator: &mut VarGenerator) -> Pipeline {
    let x = generator.fresh("x");
    Pipeline::new(
        vec![Clause::iterate(x.clone(), Expr::Range { start: 1, end: 1000 })],
        Expr::var(&x),
    )
}

#[test]
fn cancelled_token_aborts_iteration() {
    let mut generator = VarGenerator::new();
    let pipeline = pipeline(&mut generator);
    let token = CancelToken::new();
    token.cancel();
    let mut ctx = EvalContext::new().with_cancel(token);
    assert_eq!(pipeline.evaluate(&mut ctx), Err(EngineError::Cancelled));
}

#[test]
fn live_token_does_not_interfere() {
    let mut generator = VarGenerator::new();
    let pipeline = pipeline(&mut generator);
    let mut ctx = EvalContext::new().with_cancel(CancelToken::new());
    let result = pipeline.evaluate(&mut ctx).expect("evaluates");
    assert_eq!(result.len(), 1000);
}

#[test]
fn cancelling_mid_pull_stops_the_iterator() {
    let mut generator = VarGenerator::new();
    let pipeline = pipeline(&mut generator);
    let token = CancelToken::new();
    let mut ctx = EvalContext::new().with_cancel(token.clone());
    let mut iter = pipeline.iter(&mut ctx);
    assert_eq!(iter.next(), Some(Ok(Item::Integer(1))));
    assert_eq!(iter.next(), Some(Ok(Item::Integer(2))));
    token.cancel();
    assert_eq!(iter.next(), Some(Err(EngineError::Cancelled)));
    assert_eq!(iter.next(), None);
}

#[test]
fn clones_share_the_cancellation_flag() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    token.cancel();
    assert!(clone.is_cancelled());
}
