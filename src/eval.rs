//! Pull evaluation of compiled pipelines.
//!
//! Each clause owns an evaluator wrapping the evaluator of the preceding
//! clauses; advancing the outermost evaluator produces one binding tuple at
//! a time. The degenerate evaluator at the bottom of the chain yields a
//! single empty tuple. [`Pipeline::iter`] exposes the same traversal as a
//! lazy item iterator; [`Pipeline::evaluate`] drains it eagerly. Both
//! produce results in identical order.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use tracing::trace;

use crate::clause::{Carried, Clause, GroupKey, OrderKey};
use crate::error::{EngineError, Result};
use crate::expr::{Expr, Var, VarHasher, VarId};
use crate::pipeline::Pipeline;
use crate::value::{Item, Sequence, effective_boolean, general_compare};

/// Variable bindings of the current tuple.
type Bindings = HashMap<VarId, Sequence, VarHasher>;

// ------------- Cancellation -------------

/// A shared flag for cancelling a running evaluation from another thread.
/// Checked once per iterated item; a cancelled evaluation surfaces
/// [`EngineError::Cancelled`] to the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(AtomicOrdering::Relaxed)
    }
}

// ------------- Evaluation context -------------

/// Mutable evaluation state: the bindings of the current tuple, the current
/// focus item and an optional cancellation token.
#[derive(Debug, Default)]
pub struct EvalContext {
    bindings: Bindings,
    focus: Option<Item>,
    cancel: Option<CancelToken>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn bind(&mut self, var: &Var, value: Sequence) {
        self.bindings.insert(var.id, value);
    }

    pub fn value_of(&self, var: &Var) -> Result<Sequence> {
        self.bindings
            .get(&var.id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownVariable(var.name.clone()))
    }

    pub fn focus(&self) -> Option<&Item> {
        self.focus.as_ref()
    }

    /// Runs `f` with `item` as the focus and restores the previous focus on
    /// every path out.
    pub fn with_focus<R>(
        &mut self,
        item: Option<Item>,
        f: impl FnOnce(&mut EvalContext) -> Result<R>,
    ) -> Result<R> {
        let previous = std::mem::replace(&mut self.focus, item);
        let result = f(self);
        self.focus = previous;
        result
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(EngineError::Cancelled),
            _ => Ok(()),
        }
    }

    /// The condition's effective boolean value with `item` as the focus.
    fn holds_for(&mut self, cond: &Expr, item: &Item) -> Result<bool> {
        self.with_focus(Some(item.clone()), |ctx| {
            let seq = cond.evaluate(ctx)?;
            effective_boolean(&seq)
        })
    }
}

// ------------- Expression evaluation -------------

impl Expr {
    /// Evaluates this expression to a materialized sequence.
    pub fn evaluate(&self, ctx: &mut EvalContext) -> Result<Sequence> {
        match self {
            Expr::Literal(seq) => Ok(seq.clone()),
            Expr::VarRef(var) => ctx.value_of(var),
            Expr::Range { start, end } => {
                if end < start {
                    Ok(Vec::new())
                } else {
                    Ok((*start..=*end).map(Item::Integer).collect())
                }
            }
            Expr::Replicate { value, count } => {
                let once = value.evaluate(ctx)?;
                let mut out = Vec::with_capacity(once.len() * *count as usize);
                for _ in 0..*count {
                    out.extend(once.iter().cloned());
                }
                Ok(out)
            }
            Expr::ContextItem => match ctx.focus() {
                Some(item) => Ok(vec![item.clone()]),
                None => Err(EngineError::NoContext),
            },
            Expr::Path { root, steps } => {
                let mut current = root.evaluate(ctx)?;
                for step in steps {
                    let mut next = Vec::new();
                    for item in &current {
                        match item {
                            Item::Node(node) => {
                                next.extend(node.select(step).into_iter().map(Item::Node));
                            }
                            other => {
                                return Err(EngineError::DynamicType(format!(
                                    "path step '{step}' on {} value",
                                    other.kind()
                                )));
                            }
                        }
                    }
                    current = next;
                }
                Ok(current)
            }
            Expr::Predicate { input, cond } => {
                let items = input.evaluate(ctx)?;
                let mut out = Vec::new();
                for item in items {
                    if ctx.holds_for(cond, &item)? {
                        out.push(item);
                    }
                }
                Ok(out)
            }
            Expr::PositionPredicate { input, min, max } => {
                let items = input.evaluate(ctx)?;
                Ok(items
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| {
                        let position = *i as i64 + 1;
                        position >= *min && position <= *max
                    })
                    .map(|(_, item)| item)
                    .collect())
            }
            Expr::Cmp { op, lhs, rhs } => {
                let left = lhs.evaluate(ctx)?;
                let right = rhs.evaluate(ctx)?;
                Ok(vec![Item::Boolean(general_compare(*op, &left, &right)?)])
            }
            Expr::And(list) => {
                for operand in list {
                    let seq = operand.evaluate(ctx)?;
                    if !effective_boolean(&seq)? {
                        return Ok(vec![Item::Boolean(false)]);
                    }
                }
                Ok(vec![Item::Boolean(true)])
            }
            Expr::Not(inner) => {
                let seq = inner.evaluate(ctx)?;
                Ok(vec![Item::Boolean(!effective_boolean(&seq)?)])
            }
            Expr::If { cond, then, otherwise } => {
                let seq = cond.evaluate(ctx)?;
                if effective_boolean(&seq)? {
                    then.evaluate(ctx)
                } else {
                    otherwise.evaluate(ctx)
                }
            }
            Expr::Concat(list) => {
                let mut out = Vec::new();
                for operand in list {
                    out.extend(operand.evaluate(ctx)?);
                }
                Ok(out)
            }
            Expr::Map { input, body } => {
                let items = input.evaluate(ctx)?;
                let mut out = Vec::new();
                for item in items {
                    let mapped =
                        ctx.with_focus(Some(item), |ctx| body.evaluate(ctx))?;
                    out.extend(mapped);
                }
                Ok(out)
            }
            Expr::Call { name, .. } => Err(EngineError::UnknownFunction(name.clone())),
            Expr::Flwor(pipeline) => pipeline.evaluate(ctx),
            Expr::DeferredError(err) => Err(err.clone()),
        }
    }
}

// ------------- Clause evaluators -------------

/// One evaluator per clause, each owning the evaluator of the preceding
/// clauses. `advance` installs the next tuple's bindings into the context
/// and reports whether one was produced.
enum Eval<'a> {
    /// Yields exactly one empty tuple.
    Start { done: bool },
    Iterate {
        inner: Box<Eval<'a>>,
        var: &'a Var,
        pos: Option<&'a Var>,
        source: &'a Expr,
        allow_empty: bool,
        items: std::vec::IntoIter<Item>,
        index: i64,
        active: bool,
    },
    Bind {
        inner: Box<Eval<'a>>,
        var: &'a Var,
        value: &'a Expr,
    },
    Filter {
        inner: Box<Eval<'a>>,
        cond: &'a Expr,
    },
    Count {
        inner: Box<Eval<'a>>,
        var: &'a Var,
        n: i64,
    },
    OrderBy {
        inner: Box<Eval<'a>>,
        keys: &'a [OrderKey],
        rows: Option<std::vec::IntoIter<Bindings>>,
    },
    GroupBy {
        inner: Box<Eval<'a>>,
        keys: &'a [GroupKey],
        carried: &'a [Carried],
        groups: Option<std::vec::IntoIter<Group>>,
    },
    Window {
        inner: Box<Eval<'a>>,
        var: &'a Var,
        source: &'a Expr,
        start: &'a Expr,
        end: Option<&'a Expr>,
        windows: std::vec::IntoIter<Sequence>,
    },
}

/// One materialized group of a GroupBy evaluator.
struct Group {
    snapshot: Bindings,
    keys: Vec<Option<Item>>,
    carried: Vec<Sequence>,
}

impl Eval<'_> {
    fn advance(&mut self, ctx: &mut EvalContext) -> Result<bool> {
        match self {
            Eval::Start { done } => {
                if *done {
                    Ok(false)
                } else {
                    *done = true;
                    Ok(true)
                }
            }
            Eval::Iterate { inner, var, pos, source, allow_empty, items, index, active } => {
                loop {
                    ctx.check_cancelled()?;
                    if *active {
                        if let Some(item) = items.next() {
                            *index += 1;
                            ctx.bind(var, vec![item]);
                            if let Some(pos) = pos {
                                ctx.bind(pos, vec![Item::Integer(*index)]);
                            }
                            return Ok(true);
                        }
                        *active = false;
                        // an empty source still contributes one tuple
                        if *allow_empty && *index == 0 {
                            ctx.bind(var, Vec::new());
                            if let Some(pos) = pos {
                                ctx.bind(pos, vec![Item::Integer(0)]);
                            }
                            return Ok(true);
                        }
                    }
                    if !inner.advance(ctx)? {
                        return Ok(false);
                    }
                    let seq = source.evaluate(ctx)?;
                    *items = seq.into_iter();
                    *index = 0;
                    *active = true;
                }
            }
            Eval::Bind { inner, var, value } => {
                if !inner.advance(ctx)? {
                    return Ok(false);
                }
                let seq = value.evaluate(ctx)?;
                ctx.bind(var, seq);
                Ok(true)
            }
            Eval::Filter { inner, cond } => loop {
                if !inner.advance(ctx)? {
                    return Ok(false);
                }
                let seq = cond.evaluate(ctx)?;
                if effective_boolean(&seq)? {
                    return Ok(true);
                }
            },
            Eval::Count { inner, var, n } => {
                if !inner.advance(ctx)? {
                    return Ok(false);
                }
                *n += 1;
                ctx.bind(var, vec![Item::Integer(*n)]);
                Ok(true)
            }
            Eval::OrderBy { inner, keys, rows } => {
                if rows.is_none() {
                    *rows = Some(sort_tuples(inner, keys, ctx)?.into_iter());
                }
                match rows.as_mut().and_then(|r| r.next()) {
                    Some(bindings) => {
                        ctx.bindings = bindings;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Eval::GroupBy { inner, keys, carried, groups } => {
                if groups.is_none() {
                    *groups = Some(group_tuples(inner, keys, carried, ctx)?.into_iter());
                }
                match groups.as_mut().and_then(|g| g.next()) {
                    Some(group) => {
                        ctx.bindings = group.snapshot;
                        for (key, item) in keys.iter().zip(group.keys) {
                            ctx.bind(&key.var, item.into_iter().collect());
                        }
                        for (c, seq) in carried.iter().zip(group.carried) {
                            ctx.bind(&c.out, seq);
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Eval::Window { inner, var, source, start, end, windows } => loop {
                if let Some(window) = windows.next() {
                    ctx.bind(var, window);
                    return Ok(true);
                }
                if !inner.advance(ctx)? {
                    return Ok(false);
                }
                let items = source.evaluate(ctx)?;
                *windows = split_windows(&items, start, *end, ctx)?.into_iter();
            },
        }
    }
}

/// Materializes and stably sorts all tuples of `inner` by `keys`. An empty
/// key sorts before every item; descending keys reverse per key.
fn sort_tuples(
    inner: &mut Eval<'_>,
    keys: &[OrderKey],
    ctx: &mut EvalContext,
) -> Result<Vec<Bindings>> {
    let mut rows: Vec<(Vec<Option<Item>>, Bindings)> = Vec::new();
    while inner.advance(ctx)? {
        let mut key_items = Vec::with_capacity(keys.len());
        for key in keys {
            key_items.push(single_key(&key.expr, ctx, "order key")?);
        }
        rows.push((key_items, ctx.bindings.clone()));
    }
    trace!(tuples = rows.len(), "sorting materialized tuples");
    let mut mismatch = false;
    rows.sort_by(|a, b| {
        for (k, key) in keys.iter().enumerate() {
            let ordering = match (&a.0[k], &b.0[k]) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => match crate::value::compare_items(x, y) {
                    Some(ordering) => ordering,
                    None => {
                        mismatch = true;
                        Ordering::Equal
                    }
                },
            };
            let ordering = if key.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    if mismatch {
        return Err(EngineError::DynamicType(
            "order keys are not mutually comparable".to_owned(),
        ));
    }
    Ok(rows.into_iter().map(|(_, bindings)| bindings).collect())
}

/// Materializes all tuples of `inner` into groups keyed by the grouping key
/// values, in order of first appearance.
fn group_tuples(
    inner: &mut Eval<'_>,
    keys: &[GroupKey],
    carried: &[Carried],
    ctx: &mut EvalContext,
) -> Result<Vec<Group>> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<Vec<Option<Item>>, usize, VarHasher> = HashMap::default();
    while inner.advance(ctx)? {
        let mut key_items = Vec::with_capacity(keys.len());
        for key in keys {
            key_items.push(single_key(&key.expr, ctx, "grouping key")?);
        }
        let mut carried_values = Vec::with_capacity(carried.len());
        for c in carried {
            carried_values.push(ctx.value_of(&c.source)?);
        }
        match index.get(&key_items) {
            Some(&at) => {
                for (accumulated, value) in groups[at].carried.iter_mut().zip(carried_values) {
                    accumulated.extend(value);
                }
            }
            None => {
                index.insert(key_items.clone(), groups.len());
                groups.push(Group {
                    snapshot: ctx.bindings.clone(),
                    keys: key_items,
                    carried: carried_values,
                });
            }
        }
    }
    trace!(groups = groups.len(), "grouped materialized tuples");
    Ok(groups)
}

/// Evaluates a key expression, which must yield at most one item.
fn single_key(expr: &Expr, ctx: &mut EvalContext, role: &str) -> Result<Option<Item>> {
    let mut seq = expr.evaluate(ctx)?;
    match seq.len() {
        0 => Ok(None),
        1 => Ok(seq.pop()),
        _ => Err(EngineError::DynamicType(format!(
            "{role} must be empty or a single item"
        ))),
    }
}

/// Splits `items` into tumbling windows. A window opens at an item for
/// which `start` holds and closes before the next opening item, or at an
/// item for which `end` holds (inclusive). Items before the first opening
/// item are dropped; a trailing partial window is emitted.
fn split_windows(
    items: &[Item],
    start: &Expr,
    end: Option<&Expr>,
    ctx: &mut EvalContext,
) -> Result<Vec<Sequence>> {
    let mut windows = Vec::new();
    let mut current: Option<Sequence> = None;
    for item in items {
        ctx.check_cancelled()?;
        if ctx.holds_for(start, item)? {
            if let Some(window) = current.take() {
                windows.push(window);
            }
            current = Some(vec![item.clone()]);
        } else if let Some(window) = &mut current {
            window.push(item.clone());
        }
        if let (Some(end), true) = (end, current.is_some()) {
            if ctx.holds_for(end, item)? {
                if let Some(window) = current.take() {
                    windows.push(window);
                }
            }
        }
    }
    if let Some(window) = current {
        windows.push(window);
    }
    Ok(windows)
}

// ------------- Pipeline evaluation -------------

impl Pipeline {
    fn composer(&self) -> Eval<'_> {
        let mut eval = Eval::Start { done: false };
        for clause in &self.clauses {
            eval = match clause {
                Clause::Iterate { var, pos, source, allow_empty } => Eval::Iterate {
                    inner: Box::new(eval),
                    var,
                    pos: pos.as_ref(),
                    source,
                    allow_empty: *allow_empty,
                    items: Vec::new().into_iter(),
                    index: 0,
                    active: false,
                },
                Clause::Bind { var, value } => {
                    Eval::Bind { inner: Box::new(eval), var, value }
                }
                Clause::Filter { cond } => Eval::Filter { inner: Box::new(eval), cond },
                Clause::Count { var } => Eval::Count { inner: Box::new(eval), var, n: 0 },
                Clause::OrderBy { keys } => {
                    Eval::OrderBy { inner: Box::new(eval), keys, rows: None }
                }
                Clause::GroupBy { keys, carried } => Eval::GroupBy {
                    inner: Box::new(eval),
                    keys,
                    carried,
                    groups: None,
                },
                Clause::Window { var, source, start, end } => Eval::Window {
                    inner: Box::new(eval),
                    var,
                    source,
                    start,
                    end: end.as_ref(),
                    windows: Vec::new().into_iter(),
                },
            };
        }
        eval
    }

    /// Evaluates the pipeline eagerly into a materialized sequence.
    pub fn evaluate(&self, ctx: &mut EvalContext) -> Result<Sequence> {
        let mut eval = self.composer();
        let mut out = Vec::new();
        while eval.advance(ctx)? {
            out.extend(self.ret.evaluate(ctx)?);
        }
        Ok(out)
    }

    /// A lazy item iterator over the pipeline's results. Produces the same
    /// items in the same order as [`Pipeline::evaluate`]; after the first
    /// error no further items are produced.
    pub fn iter<'a>(&'a self, ctx: &'a mut EvalContext) -> ResultIter<'a> {
        ResultIter {
            ret: &self.ret,
            eval: self.composer(),
            ctx,
            buffer: Vec::new().into_iter(),
            done: false,
        }
    }
}

/// Lazy result iterator; see [`Pipeline::iter`].
pub struct ResultIter<'a> {
    ret: &'a Expr,
    eval: Eval<'a>,
    ctx: &'a mut EvalContext,
    buffer: std::vec::IntoIter<Item>,
    done: bool,
}

impl Iterator for ResultIter<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Result<Item>> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            match self.eval.advance(self.ctx) {
                Ok(true) => match self.ret.evaluate(self.ctx) {
                    Ok(seq) => self.buffer = seq.into_iter(),
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                },
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
