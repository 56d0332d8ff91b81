//! Pipeline clauses.
//!
//! One closed sum type per the clause kinds of the language, pattern-matched
//! exhaustively by the optimizer and the evaluator composer. A clause may
//! reference only variables introduced by itself or by an earlier clause.

use crate::expr::{Effects, Expr, Substitution, Usage, Var, VarGenerator, VarId};
use crate::seqtype::Card;

/// One ordering key of an OrderBy clause.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub descending: bool,
}

/// One grouping key of a GroupBy clause: `var` is bound to the key value
/// computed by `expr` for each group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey {
    pub var: Var,
    pub expr: Expr,
}

/// A non-key variable carried across a GroupBy: `out` is bound to the
/// concatenation of the `source` bindings of all tuples in the group.
#[derive(Debug, Clone, PartialEq)]
pub struct Carried {
    pub out: Var,
    pub source: Var,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Binds `var` to each item of `source` in turn, optionally tracking
    /// the 1-based position. With `allow_empty`, an empty source still
    /// yields one tuple with an empty binding and position 0.
    Iterate {
        var: Var,
        pos: Option<Var>,
        source: Expr,
        allow_empty: bool,
    },
    /// Binds `var` once to the value of `value`.
    Bind { var: Var, value: Expr },
    /// Passes only tuples for which `cond` holds.
    Filter { cond: Expr },
    /// Binds `var` to 1, 2, 3, … per passing tuple.
    Count { var: Var },
    OrderBy { keys: Vec<OrderKey> },
    GroupBy {
        keys: Vec<GroupKey>,
        carried: Vec<Carried>,
    },
    /// Splits `source` into tumbling windows and binds `var` to each. A
    /// window opens when `start` holds for an item and closes before the
    /// next opening item, or when `end` holds if present.
    Window {
        var: Var,
        source: Expr,
        start: Expr,
        end: Option<Expr>,
    },
}

impl Clause {
    pub fn iterate(var: Var, source: Expr) -> Clause {
        Clause::Iterate { var, pos: None, source, allow_empty: false }
    }

    pub fn iterate_at(var: Var, pos: Var, source: Expr) -> Clause {
        Clause::Iterate { var, pos: Some(pos), source, allow_empty: false }
    }

    pub fn bind(var: Var, value: Expr) -> Clause {
        Clause::Bind { var, value }
    }

    pub fn filter(cond: Expr) -> Clause {
        Clause::Filter { cond }
    }

    /// Variables this clause introduces, in binding order.
    pub fn vars(&self) -> Vec<&Var> {
        match self {
            Clause::Iterate { var, pos, .. } => match pos {
                Some(p) => vec![var, p],
                None => vec![var],
            },
            Clause::Bind { var, .. } | Clause::Count { var } | Clause::Window { var, .. } => {
                vec![var]
            }
            Clause::Filter { .. } | Clause::OrderBy { .. } => Vec::new(),
            Clause::GroupBy { keys, carried } => keys
                .iter()
                .map(|key| &key.var)
                .chain(carried.iter().map(|c| &c.out))
                .collect(),
        }
    }

    /// The expressions this clause owns.
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Clause::Iterate { source, .. } => vec![source],
            Clause::Bind { value, .. } => vec![value],
            Clause::Filter { cond } => vec![cond],
            Clause::Count { .. } => Vec::new(),
            Clause::OrderBy { keys } => keys.iter().map(|key| &key.expr).collect(),
            Clause::GroupBy { keys, .. } => keys.iter().map(|key| &key.expr).collect(),
            Clause::Window { source, start, end, .. } => {
                let mut list = vec![source, start];
                if let Some(end) = end {
                    list.push(end);
                }
                list
            }
        }
    }

    fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Clause::Iterate { source, .. } => vec![source],
            Clause::Bind { value, .. } => vec![value],
            Clause::Filter { cond } => vec![cond],
            Clause::Count { .. } => Vec::new(),
            Clause::OrderBy { keys } => keys.iter_mut().map(|key| &mut key.expr).collect(),
            Clause::GroupBy { keys, .. } => {
                keys.iter_mut().map(|key| &mut key.expr).collect()
            }
            Clause::Window { source, start, end, .. } => {
                let mut list = vec![source, start];
                if let Some(end) = end {
                    list.push(end);
                }
                list
            }
        }
    }

    /// Folds this clause's multiplicity contribution into `card`.
    pub fn tweak_size(&self, card: &mut Card) {
        match self {
            Clause::Iterate { source, allow_empty, .. } => {
                let mut contribution = source.size();
                if *allow_empty {
                    contribution.min = contribution.min.max(1);
                    contribution.max = contribution.max.map(|m| m.max(1));
                }
                card.multiply(contribution);
            }
            Clause::Bind { .. } | Clause::Count { .. } | Clause::OrderBy { .. } => {}
            Clause::Filter { cond } => match cond {
                Expr::Literal(seq) => {
                    match crate::value::effective_boolean(seq) {
                        Ok(true) => {}
                        // a constant-false gate passes nothing through
                        Ok(false) => card.multiply(Card::exact(0)),
                        Err(_) => card.min = 0,
                    }
                }
                _ => card.min = 0,
            },
            Clause::GroupBy { .. } => {
                // at least one group when the input is nonempty
                card.min = card.min.min(1);
            }
            Clause::Window { source, .. } => {
                // at most one window per source item
                card.multiply(Card { min: 0, max: source.size().max });
            }
        }
    }

    /// Combined effect flags of the owned expressions. Focus use inside
    /// window conditions is resolved by the clause itself.
    pub fn effects(&self) -> Effects {
        match self {
            Clause::Window { source, start, end, .. } => {
                let mut effects = source.effects().union(start.effects().without_focus());
                if let Some(end) = end {
                    effects = effects.union(end.effects().without_focus());
                }
                effects
            }
            _ => self
                .exprs()
                .iter()
                .fold(Effects::NONE, |acc, expr| acc.union(expr.effects())),
        }
    }

    /// How often one execution of this clause references `var`.
    pub fn count(&self, var: &Var) -> Usage {
        match self {
            Clause::GroupBy { keys, carried } => {
                let mut usage = keys
                    .iter()
                    .fold(Usage::Never, |acc, key| acc.plus(key.expr.count(var)));
                // carried variables re-read every grouped binding
                if carried.iter().any(|c| c.source.is(var)) {
                    usage = usage.plus(Usage::Many);
                }
                usage
            }
            Clause::Window { source, start, end, .. } => {
                // conditions run once per source item
                let per_item = source.size().max;
                let mut usage = source
                    .count(var)
                    .plus(start.count(var).times(per_item));
                if let Some(end) = end {
                    usage = usage.plus(end.count(var).times(per_item));
                }
                usage
            }
            _ => self
                .exprs()
                .iter()
                .fold(Usage::Never, |acc, expr| acc.plus(expr.count(var))),
        }
    }

    /// Calls `f` with every variable id this clause references.
    pub fn visit_vars(&self, f: &mut impl FnMut(VarId)) {
        for expr in self.exprs() {
            expr.visit_vars(f);
        }
        if let Clause::GroupBy { carried, .. } = self {
            for c in carried {
                f(c.source.id);
            }
        }
    }

    /// Whether `moved` (a Bind or Filter being hoisted upward) may cross
    /// this clause. It may not when this clause binds a variable `moved`
    /// references, and never across tuple-reshaping clauses. A Filter also
    /// may not cross a Count: filtering earlier renumbers the count.
    pub fn skippable(&self, moved: &Clause) -> bool {
        match self {
            Clause::Iterate { .. }
            | Clause::Bind { .. }
            | Clause::Filter { .. }
            | Clause::Window { .. } => self
                .vars()
                .iter()
                .all(|var| moved.count(var) == Usage::Never),
            Clause::Count { var } => {
                !matches!(moved, Clause::Filter { .. }) && moved.count(var) == Usage::Never
            }
            Clause::OrderBy { .. } | Clause::GroupBy { .. } => false,
        }
    }

    /// An independent clone with fresh identities for the variables this
    /// clause introduces, recorded in `subst` for downstream references.
    pub fn copy(&self, generator: &mut VarGenerator, subst: &mut Substitution) -> Clause {
        match self {
            Clause::Iterate { var, pos, source, allow_empty } => {
                let source = source.copy(generator, subst);
                let var2 = generator.copy_of(var);
                subst.insert(var.id, var2.clone());
                let pos2 = pos.as_ref().map(|p| {
                    let fresh = generator.copy_of(p);
                    subst.insert(p.id, fresh.clone());
                    fresh
                });
                Clause::Iterate { var: var2, pos: pos2, source, allow_empty: *allow_empty }
            }
            Clause::Bind { var, value } => {
                let value = value.copy(generator, subst);
                let var2 = generator.copy_of(var);
                subst.insert(var.id, var2.clone());
                Clause::Bind { var: var2, value }
            }
            Clause::Filter { cond } => Clause::Filter { cond: cond.copy(generator, subst) },
            Clause::Count { var } => {
                let var2 = generator.copy_of(var);
                subst.insert(var.id, var2.clone());
                Clause::Count { var: var2 }
            }
            Clause::OrderBy { keys } => Clause::OrderBy {
                keys: keys
                    .iter()
                    .map(|key| OrderKey {
                        expr: key.expr.copy(generator, subst),
                        descending: key.descending,
                    })
                    .collect(),
            },
            Clause::GroupBy { keys, carried } => {
                let keys = keys
                    .iter()
                    .map(|key| {
                        let expr = key.expr.copy(generator, subst);
                        let var = generator.copy_of(&key.var);
                        subst.insert(key.var.id, var.clone());
                        GroupKey { var, expr }
                    })
                    .collect();
                let carried = carried
                    .iter()
                    .map(|c| {
                        let source =
                            subst.get(&c.source.id).cloned().unwrap_or_else(|| c.source.clone());
                        let out = generator.copy_of(&c.out);
                        subst.insert(c.out.id, out.clone());
                        Carried { out, source }
                    })
                    .collect();
                Clause::GroupBy { keys, carried }
            }
            Clause::Window { var, source, start, end } => {
                let source = source.copy(generator, subst);
                let start = start.copy(generator, subst);
                let end = end.as_ref().map(|e| e.copy(generator, subst));
                let var2 = generator.copy_of(var);
                subst.insert(var.id, var2.clone());
                Clause::Window { var: var2, source, start, end }
            }
        }
    }

    /// Substitutes a copy of `value` for references to `var`.
    pub fn inline(&mut self, var: &Var, value: &Expr, generator: &mut VarGenerator) -> bool {
        let mut changed = false;
        for expr in self.exprs_mut() {
            changed |= expr.inline(var, value, generator);
        }
        changed
    }

    /// Replaces references to `var` with the context item.
    pub fn replace_with_context(&mut self, var: &Var) {
        for expr in self.exprs_mut() {
            expr.replace_with_context(var);
        }
    }

    /// Whether `var` is referenced from a focus-rebinding position.
    pub fn uses_var_in_focus_scope(&self, var: &Var) -> bool {
        match self {
            Clause::Window { source, start, end, .. } => {
                source.uses_var_in_focus_scope(var)
                    || start.count(var) != Usage::Never
                    || end.as_ref().is_some_and(|e| e.count(var) != Usage::Never)
            }
            _ => self
                .exprs()
                .iter()
                .any(|expr| expr.uses_var_in_focus_scope(var)),
        }
    }
}
