//! The pipeline compiler: per-clause compilation with error recovery, the
//! rewrite pass set, the fixed-point driver and final normalization.
//!
//! Every pass is individually sound: it either proves an equivalent cheaper
//! form or leaves the pipeline untouched. The passes run in a fixed textual
//! order per round until none reports a change, then two order-sensitive
//! cleanups run once (merging adjacent filters, collapsing trivial
//! pipelines). Compiling an already-compiled expression reports no further
//! changes.

use roaring::RoaringBitmap;
use tracing::debug;

use crate::clause::{Clause, GroupKey, OrderKey};
use crate::error::{EngineError, Result};
use crate::expr::{Expr, Usage, Var, VarGenerator};
use crate::pipeline::Pipeline;
use crate::value::{CmpOp, Item, effective_boolean};

/// Compiles expressions and pipelines. Holds the variable generator of the
/// enclosing compilation so that copies made while inlining get fresh
/// identities.
#[derive(Debug, Default)]
pub struct Compiler {
    generator: VarGenerator,
}

impl Compiler {
    pub fn new(generator: VarGenerator) -> Self {
        Self { generator }
    }

    pub fn generator(&mut self) -> &mut VarGenerator {
        &mut self.generator
    }

    /// Compiles an expression: constant-folds it bottom-up and optimizes
    /// every nested pipeline. Static errors abort compilation unless an
    /// enclosing clause recovers them (see [`Compiler::recover`]).
    pub fn compile(&mut self, expr: Expr) -> Result<Expr> {
        let expr = match expr {
            Expr::Flwor(pipeline) => return self.compile_pipeline(*pipeline),
            Expr::Replicate { value, count } => Expr::Replicate {
                value: Box::new(self.compile(*value)?),
                count,
            },
            Expr::Path { root, steps } => Expr::Path {
                root: Box::new(self.compile(*root)?),
                steps,
            },
            Expr::Predicate { input, cond } => Expr::Predicate {
                input: Box::new(self.compile(*input)?),
                cond: Box::new(self.compile(*cond)?),
            },
            Expr::PositionPredicate { input, min, max } => Expr::PositionPredicate {
                input: Box::new(self.compile(*input)?),
                min,
                max,
            },
            Expr::Cmp { op, lhs, rhs } => Expr::Cmp {
                op,
                lhs: Box::new(self.compile(*lhs)?),
                rhs: Box::new(self.compile(*rhs)?),
            },
            Expr::And(list) => Expr::And(
                list.into_iter()
                    .map(|e| self.compile(e))
                    .collect::<Result<_>>()?,
            ),
            Expr::Not(inner) => Expr::Not(Box::new(self.compile(*inner)?)),
            Expr::If { cond, then, otherwise } => Expr::If {
                cond: Box::new(self.compile(*cond)?),
                then: Box::new(self.compile(*then)?),
                otherwise: Box::new(self.compile(*otherwise)?),
            },
            Expr::Concat(list) => Expr::Concat(
                list.into_iter()
                    .map(|e| self.compile(e))
                    .collect::<Result<_>>()?,
            ),
            Expr::Map { input, body } => Expr::Map {
                input: Box::new(self.compile(*input)?),
                body: Box::new(self.compile(*body)?),
            },
            Expr::Call { name, args, effects, result } => Expr::Call {
                name,
                args: args
                    .into_iter()
                    .map(|e| self.compile(e))
                    .collect::<Result<_>>()?,
                effects,
                result,
            },
            leaf => leaf,
        };
        expr.fold()
    }

    /// Compiles each clause in order, recovering static errors behind
    /// guarding clauses, then optimizes the surviving pipeline.
    fn compile_pipeline(&mut self, pipeline: Pipeline) -> Result<Expr> {
        let Pipeline { clauses, ret } = pipeline;
        let mut compiled: Vec<Clause> = Vec::with_capacity(clauses.len());
        for clause in clauses {
            match self.compile_clause(clause) {
                Ok(clause) => compiled.push(clause),
                Err(err) if err.is_static() => {
                    let recovered = self.recover(compiled, err)?;
                    return self.optimize(recovered);
                }
                Err(err) => return Err(err),
            }
        }
        let ret = match self.compile(ret) {
            Ok(ret) => ret,
            Err(err) if err.is_static() => {
                let recovered = self.recover(compiled, err)?;
                return self.optimize(recovered);
            }
            Err(err) => return Err(err),
        };
        self.optimize(Pipeline::new(compiled, ret))
    }

    fn compile_clause(&mut self, clause: Clause) -> Result<Clause> {
        Ok(match clause {
            Clause::Iterate { var, pos, source, allow_empty } => Clause::Iterate {
                var,
                pos,
                source: self.compile(source)?,
                allow_empty,
            },
            Clause::Bind { var, value } => Clause::Bind { var, value: self.compile(value)? },
            Clause::Filter { cond } => Clause::Filter { cond: self.compile(cond)? },
            Clause::Count { var } => Clause::Count { var },
            Clause::OrderBy { keys } => Clause::OrderBy {
                keys: keys
                    .into_iter()
                    .map(|key| {
                        Ok(OrderKey {
                            expr: self.compile(key.expr)?,
                            descending: key.descending,
                        })
                    })
                    .collect::<Result<_>>()?,
            },
            Clause::GroupBy { keys, carried } => Clause::GroupBy {
                keys: keys
                    .into_iter()
                    .map(|key| {
                        Ok(GroupKey { var: key.var, expr: self.compile(key.expr)? })
                    })
                    .collect::<Result<_>>()?,
                carried,
            },
            Clause::Window { var, source, start, end } => Clause::Window {
                var,
                source: self.compile(source)?,
                start: self.compile(start)?,
                end: end.map(|e| self.compile(e)).transpose()?,
            },
        })
    }

    /// Recovers from a static error raised while compiling a clause or the
    /// return expression. The nearest preceding Iterate, Window or Filter
    /// clause can legitimately prevent control from reaching the failing
    /// code; everything from there on is replaced by a deferred error. With
    /// no such guard the error propagates and compilation fails.
    fn recover(&mut self, mut clauses: Vec<Clause>, err: EngineError) -> Result<Pipeline> {
        let guard = clauses.iter().rposition(|clause| {
            matches!(
                clause,
                Clause::Iterate { .. } | Clause::Window { .. } | Clause::Filter { .. }
            )
        });
        match guard {
            Some(index) => {
                debug!(error = %err, "deferring static error behind guarding clause");
                clauses.truncate(index + 1);
                Ok(Pipeline::new(clauses, Expr::DeferredError(err)))
            }
            None => Err(err),
        }
    }

    /// Runs the rewrite pass set to a fixed point, then the final cleanups.
    fn optimize(&mut self, mut p: Pipeline) -> Result<Expr> {
        flatten_and(&mut p);
        loop {
            let mut changed = false;
            changed |= self.flatten_return(&mut p);
            changed |= self.flatten_iterate(&mut p);
            changed |= self.unnest(&mut p)?;
            changed |= self.iterate_to_bind(&mut p);
            changed |= self.inline_binds(&mut p)?;
            changed |= self.hoist_binds(&mut p);
            changed |= self.unused_vars(&mut p);
            changed |= self.clean_group_vars(&mut p);
            changed |= self.optimize_filters(&mut p)?;
            changed |= self.optimize_positional(&mut p);
            changed |= self.unnest_binds(&mut p);
            changed |= self.if_to_filter(&mut p);
            changed |= self.merge_return(&mut p)?;
            if !changed {
                break;
            }
        }
        merge_filters(&mut p);
        self.finalize(p)
    }

    /// Splices a simple nested pipeline in return position onto this one.
    fn flatten_return(&mut self, p: &mut Pipeline) -> bool {
        if p.clauses.is_empty() {
            return false;
        }
        let simple = matches!(&p.ret, Expr::Flwor(sub) if sub.is_simple());
        if !simple {
            return false;
        }
        if let Expr::Flwor(sub) = std::mem::replace(&mut p.ret, Expr::empty()) {
            debug!("flattening nested pipeline in return position");
            p.clauses.extend(sub.clauses);
            p.ret = sub.ret;
        }
        true
    }

    /// Flattens a leading Iterate over a nested pipeline, and merges a
    /// Count clause that directly follows the leading Iterate.
    fn flatten_iterate(&mut self, p: &mut Pipeline) -> bool {
        enum Action {
            Nested,
            MergeCount,
        }
        let action = match p.clauses.first() {
            Some(Clause::Iterate { allow_empty: false, source: Expr::Flwor(_), .. }) => {
                Action::Nested
            }
            Some(Clause::Iterate { allow_empty: false, .. })
                if matches!(p.clauses.get(1), Some(Clause::Count { .. })) =>
            {
                Action::MergeCount
            }
            _ => return false,
        };
        match action {
            Action::Nested => {
                let clause = p.clauses.remove(0);
                if let Clause::Iterate { var, pos, source: Expr::Flwor(sub), .. } = clause {
                    debug!(var = %var.name, "flattening nested pipeline in iterate source");
                    let sub = *sub;
                    let mut spliced = sub.clauses;
                    spliced.push(Clause::iterate(var, sub.ret));
                    if let Some(pos) = pos {
                        spliced.push(Clause::Count { var: pos });
                    }
                    for (i, clause) in spliced.into_iter().enumerate() {
                        p.clauses.insert(i, clause);
                    }
                    true
                } else {
                    p.clauses.insert(0, clause);
                    false
                }
            }
            Action::MergeCount => {
                let counter = p.clauses.remove(1);
                let (Clause::Count { var: cnt }, Some(Clause::Iterate { pos, .. })) =
                    (counter, p.clauses.first_mut())
                else {
                    return false;
                };
                match pos {
                    Some(pos) => {
                        // the count duplicates the positional variable
                        let alias = Clause::bind(cnt, Expr::var(pos));
                        p.clauses.insert(1, alias);
                    }
                    None => *pos = Some(cnt),
                }
                true
            }
        }
    }

    /// Splices simple nested pipelines out of Iterate sources and hoists
    /// leading Binds out of nested pipelines in Bind values.
    fn unnest(&mut self, p: &mut Pipeline) -> Result<bool> {
        let mut changed = false;
        let mut again = true;
        while again {
            again = false;
            for i in 0..p.clauses.len() {
                let splice = matches!(
                    &p.clauses[i],
                    Clause::Iterate {
                        allow_empty: false,
                        pos: None,
                        source: Expr::Flwor(sub),
                        ..
                    } if sub.is_simple()
                );
                if splice {
                    let clause = p.clauses.remove(i);
                    if let Clause::Iterate { var, source: Expr::Flwor(sub), .. } = clause {
                        debug!(var = %var.name, "splicing nested pipeline into iterate");
                        let sub = *sub;
                        let mut at = i;
                        for inner in sub.clauses {
                            p.clauses.insert(at, inner);
                            at += 1;
                        }
                        p.clauses.insert(at, Clause::iterate(var, sub.ret));
                        changed = true;
                        again = true;
                        break;
                    }
                    p.clauses.insert(i, clause);
                }
                let hoist = matches!(
                    &p.clauses[i],
                    Clause::Bind { value: Expr::Flwor(sub), .. }
                        if matches!(sub.clauses.first(), Some(Clause::Bind { .. }))
                );
                if hoist {
                    let clause = p.clauses.remove(i);
                    if let Clause::Bind { var, value: Expr::Flwor(sub) } = clause {
                        debug!(var = %var.name, "hoisting leading binds out of bind value");
                        let mut sub = *sub;
                        let mut at = i;
                        while matches!(sub.clauses.first(), Some(Clause::Bind { .. })) {
                            p.clauses.insert(at, sub.clauses.remove(0));
                            at += 1;
                        }
                        let rest = if sub.clauses.is_empty() {
                            sub.ret
                        } else {
                            self.optimize(sub)?
                        };
                        p.clauses.insert(at, Clause::bind(var, rest));
                        changed = true;
                        again = true;
                        break;
                    }
                    p.clauses.insert(i, clause);
                }
            }
        }
        Ok(changed)
    }

    /// Downgrades an Iterate whose source statically yields exactly one
    /// item to a Bind; a positional variable becomes a Bind to 1.
    fn iterate_to_bind(&mut self, p: &mut Pipeline) -> bool {
        let mut changed = false;
        for i in (0..p.clauses.len()).rev() {
            let single = matches!(
                &p.clauses[i],
                Clause::Iterate { source, .. } if source.size().exact_count() == Some(1)
            );
            if !single {
                continue;
            }
            let clause = p.clauses.remove(i);
            if let Clause::Iterate { var, pos, source, .. } = clause {
                debug!(var = %var.name, "converting single-item iterate to bind");
                p.clauses.insert(i, Clause::bind(var, source));
                if let Some(pos) = pos {
                    p.clauses.insert(i + 1, Clause::bind(pos, Expr::integer(1)));
                }
                changed = true;
            } else {
                p.clauses.insert(i, clause);
            }
        }
        changed
    }

    /// Inlines a Bind whose variable is used exactly once and whose value
    /// has no ordered effects and no focus dependence. Substitution can
    /// expose new folding opportunities, so the pipeline is recompiled
    /// afterwards.
    fn inline_binds(&mut self, p: &mut Pipeline) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut target = None;
            for i in 0..p.clauses.len() {
                if let Clause::Bind { var, value } = &p.clauses[i] {
                    let effects = value.effects();
                    if effects.ordered() || effects.focus {
                        continue;
                    }
                    if p.count_from(var, i + 1) == Usage::Once {
                        target = Some(i);
                        break;
                    }
                }
            }
            let Some(i) = target else { break };
            let clause = p.clauses.remove(i);
            if let Clause::Bind { var, value } = clause {
                debug!(var = %var.name, "inlining single-use bind");
                p.inline_from(&var, &value, i, &mut self.generator);
                changed = true;
            } else {
                p.clauses.insert(i, clause);
                break;
            }
        }
        if changed {
            self.refold(p)?;
        }
        Ok(changed)
    }

    /// Recompiles every clause expression and the return expression in
    /// place. Static errors surfaced by the fresh folds go through the same
    /// recovery as first-time compilation.
    fn refold(&mut self, p: &mut Pipeline) -> Result<()> {
        let clauses = std::mem::take(&mut p.clauses);
        let ret = std::mem::replace(&mut p.ret, Expr::empty());
        let mut compiled = Vec::with_capacity(clauses.len());
        for clause in clauses {
            match self.compile_clause(clause) {
                Ok(clause) => compiled.push(clause),
                Err(err) if err.is_static() => {
                    *p = self.recover(compiled, err)?;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        match self.compile(ret) {
            Ok(ret) => {
                p.clauses = compiled;
                p.ret = ret;
                Ok(())
            }
            Err(err) if err.is_static() => {
                *p = self.recover(compiled, err)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Slides effect-free Binds out of loops, landing directly above the
    /// highest skippable Iterate or Window clause.
    fn hoist_binds(&mut self, p: &mut Pipeline) -> bool {
        let mut changed = false;
        for c in 1..p.clauses.len() {
            let movable = matches!(&p.clauses[c], Clause::Bind { value, .. } if {
                let effects = value.effects();
                !effects.ordered() && !effects.constructs && !effects.focus
            });
            if !movable {
                continue;
            }
            let mut insert = None;
            for d in (0..c).rev() {
                if !p.clauses[d].skippable(&p.clauses[c]) {
                    break;
                }
                if matches!(p.clauses[d], Clause::Iterate { .. } | Clause::Window { .. }) {
                    insert = Some(d);
                }
            }
            if let Some(d) = insert {
                debug!("hoisting loop-invariant bind");
                let clause = p.clauses.remove(c);
                p.clauses.insert(d, clause);
                changed = true;
            }
        }
        changed
    }

    /// Removes dead Binds and Counts, drops dead positional variables, and
    /// replaces the source of an Iterate whose variable is dead while
    /// preserving the number of iterations.
    fn unused_vars(&mut self, p: &mut Pipeline) -> bool {
        enum Rewrite {
            Remove,
            DropPos,
            RangeForPos(u64),
            ReplicateSource(u64),
        }
        let mut changed = false;
        for i in (0..p.clauses.len()).rev() {
            let rewrite = match &p.clauses[i] {
                Clause::Bind { var, value } => {
                    if !value.effects().ordered() && p.count_from(var, i + 1) == Usage::Never {
                        Some(Rewrite::Remove)
                    } else {
                        None
                    }
                }
                Clause::Count { var } => {
                    if p.count_from(var, i + 1) == Usage::Never {
                        Some(Rewrite::Remove)
                    } else {
                        None
                    }
                }
                Clause::Iterate { var, pos, source, .. } => {
                    let pos_dead = pos
                        .as_ref()
                        .is_some_and(|pv| p.count_from(pv, i) == Usage::Never);
                    if pos_dead {
                        Some(Rewrite::DropPos)
                    } else if !source.effects().ordered()
                        && var.decl.is_none()
                        && !matches!(source, Expr::Replicate { .. } | Expr::Range { .. })
                        && p.count_from(var, i + 1) == Usage::Never
                    {
                        match source.size().exact_count() {
                            Some(n) if n > 1 => {
                                if pos.is_some() {
                                    Some(Rewrite::RangeForPos(n))
                                } else {
                                    Some(Rewrite::ReplicateSource(n))
                                }
                            }
                            _ => None,
                        }
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some(rewrite) = rewrite else { continue };
            match rewrite {
                Rewrite::Remove => {
                    debug!("removing unused binding clause");
                    p.clauses.remove(i);
                    changed = true;
                }
                Rewrite::DropPos => {
                    if let Clause::Iterate { pos, .. } = &mut p.clauses[i] {
                        debug!("dropping unused positional variable");
                        *pos = None;
                        changed = true;
                    }
                }
                Rewrite::RangeForPos(n) => {
                    // the positional variable carries the iteration instead
                    if let Clause::Iterate { var, pos, source, .. } = &mut p.clauses[i] {
                        debug!(var = %var.name, "iterating over a pure integer range");
                        *source = Expr::Range { start: 1, end: n as i64 };
                        if let Some(pv) = pos.take() {
                            *var = pv;
                        }
                        changed = true;
                    }
                }
                Rewrite::ReplicateSource(n) => {
                    // same length, no retained value
                    if let Clause::Iterate { var, source, .. } = &mut p.clauses[i] {
                        debug!(var = %var.name, "replacing unused iterate source");
                        *source = Expr::Replicate {
                            value: Box::new(Expr::integer(0)),
                            count: n,
                        };
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Drops carried GroupBy variables that nothing references.
    fn clean_group_vars(&mut self, p: &mut Pipeline) -> bool {
        if !p
            .clauses
            .iter()
            .any(|clause| matches!(clause, Clause::GroupBy { .. }))
        {
            return false;
        }
        let mut used = RoaringBitmap::new();
        p.visit_vars(&mut |id| {
            used.insert(id);
        });
        let mut changed = false;
        for clause in &mut p.clauses {
            if let Clause::GroupBy { carried, .. } = clause {
                let before = carried.len();
                carried.retain(|c| used.contains(c.out.id));
                if carried.len() != before {
                    debug!("dropping dead carried group variables");
                    changed = true;
                }
            }
        }
        changed
    }

    /// Removes constant-true Filters, hoists movable Filters upward, and
    /// absorbs a Filter into the source of the binding clause directly
    /// above it.
    fn optimize_filters(&mut self, p: &mut Pipeline) -> Result<bool> {
        let mut changed = false;
        let mut c = 0;
        while c < p.clauses.len() {
            if !matches!(p.clauses[c], Clause::Filter { .. }) {
                c += 1;
                continue;
            }
            if let Clause::Filter { cond: Expr::Literal(seq) } = &p.clauses[c] {
                match effective_boolean(seq) {
                    Ok(true) => {
                        debug!("removing always-true filter");
                        p.clauses.remove(c);
                        changed = true;
                        continue;
                    }
                    // nothing can pass; later clauses never see a tuple
                    Ok(false) => break,
                    Err(_) => {}
                }
            }
            let Clause::Filter { cond } = &p.clauses[c] else {
                c += 1;
                continue;
            };
            let effects = cond.effects();
            if effects.ordered() {
                c += 1;
                continue;
            }
            let mut insert = None;
            for j in (0..c).rev() {
                let above = &p.clauses[j];
                if above.effects().ordered() || !above.skippable(&p.clauses[c]) {
                    break;
                }
                // skipping only other filters would loop forever
                if !matches!(above, Clause::Filter { .. }) {
                    insert = Some(j);
                }
            }
            if let Some(j) = insert {
                debug!("hoisting filter above skippable clauses");
                let clause = p.clauses.remove(c);
                p.clauses.insert(j, clause);
                changed = true;
            }
            if !effects.focus {
                changed |= self.push_into_source(p, insert.unwrap_or(c))?;
            }
            c += 1;
        }
        Ok(changed)
    }

    /// Absorbs the Filter at `at` as a predicate on the source of the
    /// Iterate or Bind clause directly above it (skipping other Filters).
    fn push_into_source(&mut self, p: &mut Pipeline, at: usize) -> Result<bool> {
        if !matches!(p.clauses.get(at), Some(Clause::Filter { .. })) {
            return Ok(false);
        }
        let mut b = at;
        let target = loop {
            if b == 0 {
                return Ok(false);
            }
            b -= 1;
            match &p.clauses[b] {
                Clause::Filter { .. } => continue,
                Clause::Iterate { .. } | Clause::Bind { .. } => break b,
                _ => return Ok(false),
            }
        };
        let applicable = match (&p.clauses[target], &p.clauses[at]) {
            // a positional variable would be renumbered by a source predicate
            (
                Clause::Iterate { var, pos: None, allow_empty: false, .. },
                Clause::Filter { cond },
            ) => cond.count(var) != Usage::Never && !cond.uses_var_in_focus_scope(var),
            (Clause::Bind { var, value }, Clause::Filter { cond }) => {
                // a whole-sequence test only matches an item test when the
                // bound value cannot exceed one item
                at + 1 == p.clauses.len()
                    && matches!(&p.ret, Expr::VarRef(v) if v.is(var))
                    && matches!(value.size().max, Some(m) if m <= 1)
                    && cond.count(var) != Usage::Never
                    && !cond.uses_var_in_focus_scope(var)
            }
            _ => false,
        };
        if !applicable {
            return Ok(false);
        }
        let removed = p.clauses.remove(at);
        let Clause::Filter { cond } = removed else {
            p.clauses.insert(at, removed);
            return Ok(false);
        };
        let var = match &p.clauses[target] {
            Clause::Iterate { var, .. } | Clause::Bind { var, .. } => var.clone(),
            _ => return Ok(false),
        };
        debug!(var = %var.name, "rewriting filter to source predicate");
        let mut pred = cond;
        pred.replace_with_context(&var);
        let pred = self.compile(pred)?;
        match &mut p.clauses[target] {
            Clause::Iterate { source, .. } | Clause::Bind { value: source, .. } => {
                let input = std::mem::replace(source, Expr::empty());
                *source = Expr::Predicate { input: Box::new(input), cond: Box::new(pred) };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Rewrites a comparison of a positional variable against an integer
    /// constant into a position predicate on the Iterate's source.
    fn optimize_positional(&mut self, p: &mut Pipeline) -> bool {
        let mut changed = false;
        let mut c = 0;
        while c < p.clauses.len() {
            let posv = match &p.clauses[c] {
                Clause::Iterate { pos: Some(pos), allow_empty: false, .. } => pos.clone(),
                _ => {
                    c += 1;
                    continue;
                }
            };
            let mut d = c + 1;
            while d < p.clauses.len() {
                match &p.clauses[d] {
                    Clause::Filter { cond } => {
                        let Some((min, max)) = position_range(cond, &posv) else {
                            d += 1;
                            continue;
                        };
                        let filter = p.clauses.remove(d);
                        if p.count_from(&posv, c) == Usage::Never {
                            if let Clause::Iterate { source, .. } = &mut p.clauses[c] {
                                debug!("rewriting positional filter to position predicate");
                                let input = std::mem::replace(source, Expr::empty());
                                *source = Expr::PositionPredicate {
                                    input: Box::new(input),
                                    min,
                                    max,
                                };
                                changed = true;
                            }
                        } else {
                            // still used elsewhere; give up
                            p.clauses.insert(d, filter);
                        }
                        break;
                    }
                    Clause::Iterate { .. } | Clause::Bind { .. }
                        if !p.clauses[d].effects().ordered() =>
                    {
                        d += 1;
                    }
                    _ => break,
                }
            }
            c += 1;
        }
        changed
    }

    /// Hoists leading Binds of a nested pipeline in return position into
    /// this pipeline.
    fn unnest_binds(&mut self, p: &mut Pipeline) -> bool {
        if p.clauses.is_empty() {
            return false;
        }
        let applies = matches!(
            &p.ret,
            Expr::Flwor(sub) if matches!(sub.clauses.first(), Some(Clause::Bind { .. }))
        );
        if !applies {
            return false;
        }
        if let Expr::Flwor(sub) = std::mem::replace(&mut p.ret, Expr::empty()) {
            debug!("hoisting leading binds out of nested return pipeline");
            let mut sub = *sub;
            while matches!(sub.clauses.first(), Some(Clause::Bind { .. })) {
                p.clauses.push(sub.clauses.remove(0));
            }
            p.ret = if sub.clauses.is_empty() { sub.ret } else { sub.into_expr() };
        }
        true
    }

    /// Splits `if (cond) then X else ()` in Iterate sources and in the
    /// return expression into a Filter clause plus the surviving branch.
    fn if_to_filter(&mut self, p: &mut Pipeline) -> bool {
        let mut changed = false;
        for c in (0..p.clauses.len()).rev() {
            let applies = matches!(
                &p.clauses[c],
                Clause::Iterate { allow_empty: false, source: Expr::If { .. }, .. }
            );
            if !applies {
                continue;
            }
            let clause = p.clauses.remove(c);
            if let Clause::Iterate {
                var,
                pos,
                source: Expr::If { cond, then, otherwise },
                allow_empty,
            } = clause
            {
                match split_conditional(*cond, *then, *otherwise) {
                    Ok((gate, branch)) => {
                        debug!("splitting guarded iterate source into filter");
                        p.clauses.insert(c, Clause::filter(gate));
                        p.clauses
                            .insert(c + 1, Clause::Iterate { var, pos, source: branch, allow_empty });
                        changed = true;
                    }
                    Err((cond, then, otherwise)) => {
                        p.clauses.insert(
                            c,
                            Clause::Iterate {
                                var,
                                pos,
                                source: Expr::If {
                                    cond: Box::new(cond),
                                    then: Box::new(then),
                                    otherwise: Box::new(otherwise),
                                },
                                allow_empty,
                            },
                        );
                    }
                }
            } else {
                p.clauses.insert(c, clause);
            }
        }
        if matches!(&p.ret, Expr::If { .. }) {
            if let Expr::If { cond, then, otherwise } =
                std::mem::replace(&mut p.ret, Expr::empty())
            {
                match split_conditional(*cond, *then, *otherwise) {
                    Ok((gate, branch)) => {
                        debug!("splitting guarded return into filter");
                        p.clauses.push(Clause::filter(gate));
                        p.ret = branch;
                        changed = true;
                    }
                    Err((cond, then, otherwise)) => {
                        p.ret = Expr::If {
                            cond: Box::new(cond),
                            then: Box::new(then),
                            otherwise: Box::new(otherwise),
                        };
                    }
                }
            }
        }
        changed
    }

    /// Merges the final clause into the return expression: a return that is
    /// exactly the last clause's variable becomes that clause's source; a
    /// trailing Iterate with a focus-free return becomes a map.
    fn merge_return(&mut self, p: &mut Pipeline) -> Result<bool> {
        enum Merge {
            Value,
            MapOverSource,
        }
        let merge = match p.clauses.last() {
            Some(Clause::Bind { var, .. }) => {
                if matches!(&p.ret, Expr::VarRef(v) if v.is(var)) {
                    Some(Merge::Value)
                } else {
                    None
                }
            }
            Some(Clause::Iterate { var, pos: None, allow_empty: false, .. }) => {
                if matches!(&p.ret, Expr::VarRef(v) if v.is(var)) {
                    Some(Merge::Value)
                } else if !p.ret.effects().focus && !p.ret.uses_var_in_focus_scope(var) {
                    Some(Merge::MapOverSource)
                } else {
                    None
                }
            }
            _ => None,
        };
        match merge {
            Some(Merge::Value) => {
                let Some(clause) = p.clauses.pop() else { return Ok(false) };
                match clause {
                    Clause::Bind { value, .. } => p.ret = value,
                    Clause::Iterate { source, .. } => p.ret = source,
                    other => {
                        p.clauses.push(other);
                        return Ok(false);
                    }
                }
                debug!("merging trailing clause into return");
                Ok(true)
            }
            Some(Merge::MapOverSource) => {
                let Some(Clause::Iterate { var, source, .. }) = p.clauses.pop() else {
                    return Ok(false);
                };
                debug!(var = %var.name, "rewriting trailing iterate to map");
                let mut body = std::mem::replace(&mut p.ret, Expr::empty());
                body.replace_with_context(&var);
                // the context item has static size one, so the substitution
                // can expose folds a plain recompilation would find
                p.ret =
                    self.compile(Expr::Map { input: Box::new(source), body: Box::new(body) })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Final collapse: no clauses left means the bare return expression; a
    /// single leading Filter becomes a conditional; statically-sized
    /// pipelines simplify.
    fn finalize(&mut self, mut p: Pipeline) -> Result<Expr> {
        if p.clauses.is_empty() {
            return Ok(p.ret);
        }
        let convertible = match p.clauses.first() {
            // a literal without a boolean value raises dynamically instead
            Some(Clause::Filter { cond: Expr::Literal(seq) }) => effective_boolean(seq).is_ok(),
            Some(Clause::Filter { .. }) => true,
            _ => false,
        };
        if convertible {
            let Clause::Filter { cond } = p.clauses.remove(0) else {
                return Err(EngineError::Invariant("leading filter vanished".to_owned()));
            };
            debug!("collapsing leading filter into conditional");
            let branch = if p.clauses.is_empty() { p.ret } else { p.into_expr() };
            return Expr::If {
                cond: Box::new(cond),
                then: Box::new(branch),
                otherwise: Box::new(Expr::empty()),
            }
            .fold();
        }
        self.simplify(p)
    }

    /// Rewrites pipelines whose tuple count is statically exact.
    fn simplify(&mut self, mut p: Pipeline) -> Result<Expr> {
        let card = p.calc_size(false);
        let clauses_ordered = p.clauses.iter().any(|clause| clause.effects().ordered());
        if let Some(n) = card.exact_count() {
            if n == 0 {
                if !p.effects().ordered() {
                    debug!("pipeline iterates zero times; replacing by empty sequence");
                    return Ok(Expr::empty());
                }
                // a single effectful iterate source still has to run; any
                // other guarding clause keeps the pipeline intact
                if matches!(p.clauses.as_slice(), [Clause::Iterate { .. }]) {
                    if let Some(Clause::Iterate { source, .. }) = p.clauses.pop() {
                        return Ok(source);
                    }
                }
                return Ok(p.into_expr());
            }
            let referenced = p.clauses.iter().any(|clause| {
                clause
                    .vars()
                    .into_iter()
                    .any(|var| p.ret.count(var) != Usage::Never)
            });
            if n == 1 && !referenced && !clauses_ordered {
                debug!("single iteration without variable references; unwrapping return");
                return Ok(p.ret);
            }
            if n > 1 && !referenced && !clauses_ordered {
                let ret_effects = p.ret.effects();
                if !ret_effects.ordered() && !ret_effects.constructs {
                    debug!("constant iteration count; replacing by replication");
                    return Ok(Expr::Replicate { value: Box::new(p.ret), count: n });
                }
            }
        }
        if p.ret.is_empty_literal() && !clauses_ordered {
            return Ok(Expr::empty());
        }
        Ok(p.into_expr())
    }
}

/// Splits conjunctive Filter conditions into one Filter per operand.
fn flatten_and(p: &mut Pipeline) {
    let mut i = 0;
    while i < p.clauses.len() {
        if matches!(&p.clauses[i], Clause::Filter { cond: Expr::And(_) }) {
            if let Clause::Filter { cond: Expr::And(list) } = p.clauses.remove(i) {
                for (j, cond) in list.into_iter().enumerate() {
                    p.clauses.insert(i + j, Clause::filter(cond));
                }
            }
        }
        i += 1;
    }
}

/// Merges runs of adjacent Filters into one conjunctive Filter. Stops at a
/// pinned constant-false gate.
fn merge_filters(p: &mut Pipeline) {
    let mut i = 0;
    while i + 1 < p.clauses.len() {
        let false_gate = matches!(
            &p.clauses[i],
            Clause::Filter { cond: Expr::Literal(seq) }
                if effective_boolean(seq) == Ok(false)
        );
        if false_gate {
            return;
        }
        let mergeable = |clause: &Clause| match clause {
            // a literal without a boolean value must keep raising on its own
            Clause::Filter { cond: Expr::Literal(seq) } => effective_boolean(seq).is_ok(),
            Clause::Filter { .. } => true,
            _ => false,
        };
        if !mergeable(&p.clauses[i]) || !mergeable(&p.clauses[i + 1]) {
            i += 1;
            continue;
        }
        let Clause::Filter { cond: second } = p.clauses.remove(i + 1) else {
            return;
        };
        if let Clause::Filter { cond: first } = &mut p.clauses[i] {
            let combined = match std::mem::replace(first, Expr::empty()) {
                Expr::And(mut list) => {
                    list.push(second);
                    Expr::And(list)
                }
                single => Expr::And(vec![single, second]),
            };
            *first = combined;
        }
    }
}

/// The 1-based position range expressed by a comparison of a positional
/// variable against an integer constant.
fn position_range(cond: &Expr, pos: &Var) -> Option<(i64, i64)> {
    let Expr::Cmp { op, lhs, rhs } = cond else {
        return None;
    };
    let (op, k) = match (&**lhs, &**rhs) {
        (Expr::VarRef(v), Expr::Literal(seq)) if v.is(pos) => (*op, integer_literal(seq)?),
        (Expr::Literal(seq), Expr::VarRef(v)) if v.is(pos) => {
            (mirror(*op), integer_literal(seq)?)
        }
        _ => return None,
    };
    match op {
        CmpOp::Eq => Some((k, k)),
        CmpOp::Lt => Some((1, k.saturating_sub(1))),
        CmpOp::Le => Some((1, k)),
        CmpOp::Gt => Some((k.saturating_add(1), i64::MAX)),
        CmpOp::Ge => Some((k, i64::MAX)),
        CmpOp::Ne => None,
    }
}

fn integer_literal(seq: &[Item]) -> Option<i64> {
    match seq {
        [Item::Integer(i)] => Some(*i),
        _ => None,
    }
}

/// The operator as seen with its operands swapped.
fn mirror(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Ge => CmpOp::Le,
        CmpOp::Eq | CmpOp::Ne => op,
    }
}

/// Splits a conditional with one empty branch into (gate, surviving branch).
/// Returns the parts unchanged when neither branch is statically empty.
#[allow(clippy::type_complexity)]
fn split_conditional(
    cond: Expr,
    then: Expr,
    otherwise: Expr,
) -> std::result::Result<(Expr, Expr), (Expr, Expr, Expr)> {
    if otherwise.is_empty_literal() {
        Ok((cond, then))
    } else if then.is_empty_literal() {
        Ok((cond.negated(), otherwise))
    } else {
        Err((cond, then, otherwise))
    }
}
