//! Canopy is a compiler and evaluator for clause pipelines over tree-shaped
//! data. A pipeline is an ordered list of clauses (iteration, binding,
//! filtering, counting, ordering, grouping and windowing) followed by a
//! return expression evaluated once per surviving binding tuple.
//!
//! The [`optimize::Compiler`] rewrites pipelines to a fixed point: nested
//! pipelines are flattened, single-use bindings inlined, loop-invariant
//! bindings hoisted, dead bindings removed, filters hoisted and absorbed
//! into source predicates, positional filters turned into position
//! predicates, and trivial pipelines collapsed away entirely. Compilation
//! is idempotent: compiling an already-compiled expression changes nothing.
//! Static errors raised while compiling a clause are deferred to runtime
//! when a preceding clause could legitimately prevent them from surfacing.
//!
//! Evaluation is pull-based: each clause wraps the evaluator of the
//! preceding clauses and tuples are produced one at a time, so a caller
//! that stops early never pays for the rest. See [`eval`] for the lazy
//! iterator and the cancellation token.
//!
//! ```
//! use canopy::eval::EvalContext;
//! use canopy::expr::{Expr, VarGenerator};
//! use canopy::clause::Clause;
//! use canopy::optimize::Compiler;
//! use canopy::pipeline::Pipeline;
//! use canopy::value::{CmpOp, Item};
//!
//! let mut generator = VarGenerator::new();
//! let x = generator.fresh("x");
//! let pipeline = Pipeline::new(
//!     vec![
//!         Clause::iterate(x.clone(), Expr::Range { start: 1, end: 4 }),
//!         Clause::filter(Expr::cmp(CmpOp::Gt, Expr::var(&x), Expr::integer(2))),
//!     ],
//!     Expr::var(&x),
//! );
//! let mut compiler = Compiler::new(generator);
//! let compiled = compiler.compile(pipeline.into_expr()).unwrap();
//! let result = compiled.evaluate(&mut EvalContext::new()).unwrap();
//! assert_eq!(result, vec![Item::Integer(3), Item::Integer(4)]);
//! ```

pub mod clause;
pub mod error;
pub mod eval;
pub mod expr;
pub mod optimize;
pub mod pipeline;
pub mod seqtype;
pub mod tree;
pub mod value;
