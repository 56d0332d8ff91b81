//! The clause pipeline aggregate, with the cardinality estimator and the
//! variable-usage analyzer.

use crate::clause::Clause;
use crate::expr::{Effects, Expr, Substitution, Usage, Var, VarGenerator, VarId};
use crate::seqtype::Card;

/// An ordered list of clauses plus a trailing return expression. Built by
/// the front end, rewritten by the compiler, immutable once evaluation
/// begins.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub clauses: Vec<Clause>,
    pub ret: Expr,
}

impl Pipeline {
    pub fn new(clauses: Vec<Clause>, ret: Expr) -> Self {
        Self { clauses, ret }
    }

    /// Wraps this pipeline as an expression node.
    pub fn into_expr(self) -> Expr {
        Expr::Flwor(Box::new(self))
    }

    /// Static (min, max) bound on the number of result tuples, or items
    /// when `include_return` is set. Starts at (1, 1), folds each clause's
    /// contribution in order, and stops combining once the maximum reaches
    /// zero. Pure; missing knowledge degrades to (0, unbounded).
    pub fn calc_size(&self, include_return: bool) -> Card {
        let mut card = Card::ONE;
        for clause in &self.clauses {
            if card.max == Some(0) {
                break;
            }
            clause.tweak_size(&mut card);
        }
        if include_return && card.max != Some(0) {
            card.multiply(self.ret.size());
        }
        card
    }

    /// Usage of `var` from clause `start` to the end of the pipeline,
    /// weighting each position by how many times it may execute. `Never`
    /// is exact; `Once` is reported only when every referencing position
    /// has static multiplicity one.
    pub fn count_from(&self, var: &Var, start: usize) -> Usage {
        let mut card = Card::ONE;
        let mut usage = Usage::Never;
        for clause in self.clauses.iter().skip(start) {
            usage = usage.plus(clause.count(var).times(card.max));
            clause.tweak_size(&mut card);
        }
        usage.plus(self.ret.count(var).times(card.max))
    }

    /// Combined effect flags of all clauses and the return expression.
    pub fn effects(&self) -> Effects {
        self.clauses
            .iter()
            .fold(self.ret.effects(), |acc, clause| acc.union(clause.effects()))
    }

    /// Whether the pipeline consists of Iterate, Bind and Filter clauses
    /// only, which is the precondition for splicing it into an enclosing
    /// pipeline.
    pub fn is_simple(&self) -> bool {
        self.clauses.iter().all(|clause| {
            matches!(
                clause,
                Clause::Iterate { .. } | Clause::Bind { .. } | Clause::Filter { .. }
            )
        })
    }

    /// Calls `f` with every variable id referenced anywhere in the pipeline.
    pub fn visit_vars(&self, f: &mut impl FnMut(VarId)) {
        for clause in &self.clauses {
            clause.visit_vars(f);
        }
        self.ret.visit_vars(f);
    }

    /// An independent clone with fresh identities for all variables the
    /// pipeline's clauses introduce.
    pub fn copy(&self, generator: &mut VarGenerator, subst: &mut Substitution) -> Pipeline {
        let clauses = self
            .clauses
            .iter()
            .map(|clause| clause.copy(generator, subst))
            .collect();
        Pipeline { clauses, ret: self.ret.copy(generator, subst) }
    }

    /// Substitutes a copy of `value` for references to `var` in clauses
    /// `start..` and the return expression.
    pub fn inline_from(
        &mut self,
        var: &Var,
        value: &Expr,
        start: usize,
        generator: &mut VarGenerator,
    ) -> bool {
        let mut changed = false;
        for clause in self.clauses.iter_mut().skip(start) {
            changed |= clause.inline(var, value, generator);
        }
        changed | self.ret.inline(var, value, generator)
    }

    /// Replaces references to `var` with the context item in all clauses
    /// and the return expression.
    pub fn replace_with_context(&mut self, var: &Var) {
        for clause in &mut self.clauses {
            clause.replace_with_context(var);
        }
        self.ret.replace_with_context(var);
    }

    /// Whether `var` is referenced from a focus-rebinding position.
    pub fn uses_var_in_focus_scope(&self, var: &Var) -> bool {
        self.clauses
            .iter()
            .any(|clause| clause.uses_var_in_focus_scope(var))
            || self.ret.uses_var_in_focus_scope(var)
    }
}
