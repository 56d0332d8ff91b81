//! Expression nodes of the query language.
//!
//! The pipeline compiler only needs a small slice of the full expression
//! language: enough to describe clause interaction (variable references,
//! predicates, conditionals, sequence construction) plus the capabilities
//! every node must offer: effect flags, a static size, usage counting and
//! a structurally independent copy that remaps variable identities.
//! External computations enter as [`Expr::Call`] with declared effects.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;

use crate::error::{EngineError, Result};
use crate::pipeline::Pipeline;
use crate::seqtype::{Card, Occurrence};
use crate::value::{CmpOp, Item, Sequence, effective_boolean, general_compare};

// ------------- Variables -------------

pub type VarId = u32;

/// Hasher for variable-keyed maps.
pub type VarHasher = BuildHasherDefault<SeaHasher>;

/// Remapping table used when copying expressions between pipeline copies.
pub type Substitution = HashMap<VarId, Var, VarHasher>;

/// A variable bound by a clause. Identity is the id, which is unique within
/// one compilation; the name is diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub id: VarId,
    pub name: String,
    pub decl: Option<Occurrence>,
}

impl Var {
    pub fn is(&self, other: &Var) -> bool {
        self.id == other.id
    }
}

/// Issues fresh variable identities. Shared between whoever builds the
/// initial pipeline and the compiler, which needs fresh ids when copying.
#[derive(Debug, Default)]
pub struct VarGenerator {
    next: VarId,
}

impl VarGenerator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn fresh(&mut self, name: &str) -> Var {
        self.next += 1;
        Var { id: self.next, name: name.to_owned(), decl: None }
    }

    pub fn fresh_typed(&mut self, name: &str, decl: Occurrence) -> Var {
        let mut var = self.fresh(name);
        var.decl = Some(decl);
        var
    }

    /// A fresh identity carrying the name and declared type of `var`.
    pub fn copy_of(&mut self, var: &Var) -> Var {
        self.next += 1;
        Var { id: self.next, name: var.name.clone(), decl: var.decl }
    }
}

// ------------- Effects and usage -------------

/// Effect flags an expression declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Effects {
    /// Writes into the data it runs against.
    pub updating: bool,
    /// May yield different results on repeated evaluation.
    pub non_deterministic: bool,
    /// Constructs new nodes (fresh identity per evaluation).
    pub constructs: bool,
    /// Reads the current context item.
    pub focus: bool,
}

impl Effects {
    pub const NONE: Effects = Effects {
        updating: false,
        non_deterministic: false,
        constructs: false,
        focus: false,
    };

    pub fn union(self, other: Effects) -> Effects {
        Effects {
            updating: self.updating || other.updating,
            non_deterministic: self.non_deterministic || other.non_deterministic,
            constructs: self.constructs || other.constructs,
            focus: self.focus || other.focus,
        }
    }

    /// Focus use that is resolved within the expression itself.
    pub fn without_focus(self) -> Effects {
        Effects { focus: false, ..self }
    }

    /// Whether re-running or relocating the expression is observable.
    pub fn ordered(self) -> bool {
        self.updating || self.non_deterministic
    }
}

/// How often a variable binding is referenced: never, exactly once, or
/// possibly many times. `Never` is exact; `Once` is only reported when every
/// referencing position has static multiplicity one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Usage {
    Never,
    Once,
    Many,
}

impl Usage {
    pub fn plus(self, other: Usage) -> Usage {
        match (self, other) {
            (Usage::Never, u) | (u, Usage::Never) => u,
            _ => Usage::Many,
        }
    }

    /// Usage when the referencing position runs up to `count` times
    /// (`None` = unbounded).
    pub fn times(self, count: Option<u64>) -> Usage {
        match (self, count) {
            (Usage::Never, _) => Usage::Never,
            (_, Some(0)) => Usage::Never,
            (u, Some(1)) => u,
            _ => Usage::Many,
        }
    }
}

// ------------- Expression nodes -------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant sequence.
    Literal(Sequence),
    /// A reference to a clause-bound variable.
    VarRef(Var),
    /// The integer range `start..=end`; empty when `end < start`.
    Range { start: i64, end: i64 },
    /// `value`, evaluated once, repeated `count` times.
    Replicate { value: Box<Expr>, count: u64 },
    /// The current context item.
    ContextItem,
    /// Child-step navigation from the root value.
    Path { root: Box<Expr>, steps: Vec<String> },
    /// Keeps the items of `input` for which `cond` holds (item as focus).
    Predicate { input: Box<Expr>, cond: Box<Expr> },
    /// Keeps the items of `input` at 1-based positions `min..=max`.
    PositionPredicate { input: Box<Expr>, min: i64, max: i64 },
    Cmp { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
    And(Vec<Expr>),
    Not(Box<Expr>),
    If { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    /// Sequence concatenation.
    Concat(Vec<Expr>),
    /// `body` evaluated once per item of `input` (item as focus).
    Map { input: Box<Expr>, body: Box<Expr> },
    /// An opaque external function with declared effects and result type.
    Call {
        name: String,
        args: Vec<Expr>,
        effects: Effects,
        result: Occurrence,
    },
    /// A nested clause pipeline.
    Flwor(Box<Pipeline>),
    /// Raises the recorded error if ever evaluated. Produced by
    /// compile-error recovery; never removed or reordered by the optimizer.
    DeferredError(EngineError),
}

impl Expr {
    pub fn empty() -> Expr {
        Expr::Literal(Vec::new())
    }

    pub fn integer(i: i64) -> Expr {
        Expr::Literal(vec![Item::Integer(i)])
    }

    pub fn boolean(b: bool) -> Expr {
        Expr::Literal(vec![Item::Boolean(b)])
    }

    pub fn text(t: &str) -> Expr {
        Expr::Literal(vec![Item::Text(t.to_owned())])
    }

    pub fn var(var: &Var) -> Expr {
        Expr::VarRef(var.clone())
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Cmp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn is_empty_literal(&self) -> bool {
        matches!(self, Expr::Literal(seq) if seq.is_empty())
    }

    /// Logical negation, cancelling a double negation.
    pub fn negated(self) -> Expr {
        match self {
            Expr::Not(inner) => *inner,
            Expr::Literal(seq) => match effective_boolean(&seq) {
                Ok(b) => Expr::boolean(!b),
                Err(_) => Expr::Not(Box::new(Expr::Literal(seq))),
            },
            other => Expr::Not(Box::new(other)),
        }
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_)
            | Expr::VarRef(_)
            | Expr::Range { .. }
            | Expr::ContextItem
            | Expr::Flwor(_)
            | Expr::DeferredError(_) => Vec::new(),
            Expr::Replicate { value, .. } => vec![value],
            Expr::Path { root, .. } => vec![root],
            Expr::Predicate { input, cond } => vec![input, cond],
            Expr::PositionPredicate { input, .. } => vec![input],
            Expr::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            Expr::And(list) | Expr::Concat(list) => list.iter().collect(),
            Expr::Not(inner) => vec![inner],
            Expr::If { cond, then, otherwise } => vec![cond, then, otherwise],
            Expr::Map { input, body } => vec![input, body],
            Expr::Call { args, .. } => args.iter().collect(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Literal(_)
            | Expr::VarRef(_)
            | Expr::Range { .. }
            | Expr::ContextItem
            | Expr::Flwor(_)
            | Expr::DeferredError(_) => Vec::new(),
            Expr::Replicate { value, .. } => vec![value],
            Expr::Path { root, .. } => vec![root],
            Expr::Predicate { input, cond } => vec![input, cond],
            Expr::PositionPredicate { input, .. } => vec![input],
            Expr::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
            Expr::And(list) | Expr::Concat(list) => list.iter_mut().collect(),
            Expr::Not(inner) => vec![inner],
            Expr::If { cond, then, otherwise } => vec![cond, then, otherwise],
            Expr::Map { input, body } => vec![input, body],
            Expr::Call { args, .. } => args.iter_mut().collect(),
        }
    }

    /// Static (min, max) bound on the number of items this expression yields.
    pub fn size(&self) -> Card {
        match self {
            Expr::Literal(seq) => Card::exact(seq.len() as u64),
            Expr::VarRef(var) => var.decl.map(Occurrence::card).unwrap_or(Card::UNKNOWN),
            Expr::Range { start, end } => Card::exact(if end < start {
                0
            } else {
                end.abs_diff(*start) + 1
            }),
            Expr::Replicate { value, count } => {
                let mut card = value.size();
                card.multiply(Card::exact(*count));
                card
            }
            Expr::ContextItem => Card::ONE,
            Expr::Path { .. } => Card::UNKNOWN,
            Expr::Predicate { input, .. } => Card { min: 0, max: input.size().max },
            Expr::PositionPredicate { input, min, max } => {
                let len = if max < min {
                    0
                } else {
                    max.saturating_sub(*min).saturating_add(1) as u64
                };
                let bound = match input.size().max {
                    Some(m) => m.min(len),
                    None => len,
                };
                Card { min: 0, max: Some(bound) }
            }
            Expr::Cmp { .. } | Expr::And(_) | Expr::Not(_) => Card::ONE,
            Expr::If { then, otherwise, .. } => then.size().union(otherwise.size()),
            Expr::Concat(list) => {
                let mut card = Card::exact(0);
                for expr in list {
                    card.add(expr.size());
                }
                card
            }
            Expr::Map { input, body } => {
                let mut card = input.size();
                card.multiply(body.size());
                card
            }
            Expr::Call { result, .. } => result.card(),
            Expr::Flwor(pipeline) => pipeline.calc_size(true),
            Expr::DeferredError(_) => Card::UNKNOWN,
        }
    }

    /// Combined effect flags of this expression tree. Focus use that an
    /// enclosing predicate or map resolves itself is masked out. Deferred
    /// errors report the non-deterministic flag so that no rewrite deletes
    /// or relocates them.
    pub fn effects(&self) -> Effects {
        match self {
            Expr::ContextItem => Effects { focus: true, ..Effects::NONE },
            Expr::Predicate { input, cond } | Expr::Map { input, body: cond } => {
                input.effects().union(cond.effects().without_focus())
            }
            Expr::Call { args, effects, .. } => args
                .iter()
                .fold(*effects, |acc, arg| acc.union(arg.effects())),
            Expr::Flwor(pipeline) => pipeline.effects(),
            Expr::DeferredError(_) => {
                Effects { non_deterministic: true, ..Effects::NONE }
            }
            _ => self
                .children()
                .iter()
                .fold(Effects::NONE, |acc, child| acc.union(child.effects())),
        }
    }

    /// How often a single evaluation of this expression references `var`.
    pub fn count(&self, var: &Var) -> Usage {
        match self {
            Expr::VarRef(v) => {
                if v.is(var) {
                    Usage::Once
                } else {
                    Usage::Never
                }
            }
            Expr::Predicate { input, cond } | Expr::Map { input, body: cond } => input
                .count(var)
                .plus(cond.count(var).times(input.size().max)),
            Expr::If { cond, then, otherwise } => cond
                .count(var)
                .plus(then.count(var).max(otherwise.count(var))),
            Expr::Flwor(pipeline) => pipeline.count_from(var, 0),
            _ => self
                .children()
                .iter()
                .fold(Usage::Never, |acc, child| acc.plus(child.count(var))),
        }
    }

    /// Calls `f` with every referenced variable id in the tree.
    pub fn visit_vars(&self, f: &mut impl FnMut(VarId)) {
        match self {
            Expr::VarRef(var) => f(var.id),
            Expr::Flwor(pipeline) => pipeline.visit_vars(f),
            _ => {
                for child in self.children() {
                    child.visit_vars(f);
                }
            }
        }
    }

    /// A structurally independent clone. Variables introduced inside the
    /// copied tree get fresh identities; references are remapped through
    /// `subst`.
    pub fn copy(&self, generator: &mut VarGenerator, subst: &mut Substitution) -> Expr {
        match self {
            Expr::Literal(seq) => Expr::Literal(seq.clone()),
            Expr::VarRef(var) => {
                Expr::VarRef(subst.get(&var.id).cloned().unwrap_or_else(|| var.clone()))
            }
            Expr::Range { start, end } => Expr::Range { start: *start, end: *end },
            Expr::Replicate { value, count } => Expr::Replicate {
                value: Box::new(value.copy(generator, subst)),
                count: *count,
            },
            Expr::ContextItem => Expr::ContextItem,
            Expr::Path { root, steps } => Expr::Path {
                root: Box::new(root.copy(generator, subst)),
                steps: steps.clone(),
            },
            Expr::Predicate { input, cond } => Expr::Predicate {
                input: Box::new(input.copy(generator, subst)),
                cond: Box::new(cond.copy(generator, subst)),
            },
            Expr::PositionPredicate { input, min, max } => Expr::PositionPredicate {
                input: Box::new(input.copy(generator, subst)),
                min: *min,
                max: *max,
            },
            Expr::Cmp { op, lhs, rhs } => Expr::Cmp {
                op: *op,
                lhs: Box::new(lhs.copy(generator, subst)),
                rhs: Box::new(rhs.copy(generator, subst)),
            },
            Expr::And(list) => {
                Expr::And(list.iter().map(|e| e.copy(generator, subst)).collect())
            }
            Expr::Not(inner) => Expr::Not(Box::new(inner.copy(generator, subst))),
            Expr::If { cond, then, otherwise } => Expr::If {
                cond: Box::new(cond.copy(generator, subst)),
                then: Box::new(then.copy(generator, subst)),
                otherwise: Box::new(otherwise.copy(generator, subst)),
            },
            Expr::Concat(list) => {
                Expr::Concat(list.iter().map(|e| e.copy(generator, subst)).collect())
            }
            Expr::Map { input, body } => Expr::Map {
                input: Box::new(input.copy(generator, subst)),
                body: Box::new(body.copy(generator, subst)),
            },
            Expr::Call { name, args, effects, result } => Expr::Call {
                name: name.clone(),
                args: args.iter().map(|e| e.copy(generator, subst)).collect(),
                effects: *effects,
                result: *result,
            },
            Expr::Flwor(pipeline) => {
                Expr::Flwor(Box::new(pipeline.copy(generator, subst)))
            }
            Expr::DeferredError(err) => Expr::DeferredError(err.clone()),
        }
    }

    /// Substitutes a copy of `value` for every reference to `var`.
    pub fn inline(&mut self, var: &Var, value: &Expr, generator: &mut VarGenerator) -> bool {
        match self {
            Expr::VarRef(v) if v.is(var) => {
                *self = value.copy(generator, &mut Substitution::default());
                true
            }
            Expr::Flwor(pipeline) => pipeline.inline_from(var, value, 0, generator),
            _ => {
                let mut changed = false;
                for child in self.children_mut() {
                    changed |= child.inline(var, value, generator);
                }
                changed
            }
        }
    }

    /// Replaces references to `var` with the context item. The caller must
    /// have checked [`Expr::uses_var_in_focus_scope`] first.
    pub fn replace_with_context(&mut self, var: &Var) {
        match self {
            Expr::VarRef(v) if v.is(var) => *self = Expr::ContextItem,
            Expr::Flwor(pipeline) => pipeline.replace_with_context(var),
            _ => {
                for child in self.children_mut() {
                    child.replace_with_context(var);
                }
            }
        }
    }

    /// Whether `var` is referenced from a position that rebinds the focus
    /// (a predicate condition, a map body, a window condition). Such a
    /// reference cannot be rewritten into a context-item reference.
    pub fn uses_var_in_focus_scope(&self, var: &Var) -> bool {
        match self {
            Expr::Predicate { input, cond } | Expr::Map { input, body: cond } => {
                cond.count(var) != Usage::Never || input.uses_var_in_focus_scope(var)
            }
            Expr::Flwor(pipeline) => pipeline.uses_var_in_focus_scope(var),
            _ => self
                .children()
                .iter()
                .any(|child| child.uses_var_in_focus_scope(var)),
        }
    }

    /// Single-level constant folding; children are expected to be folded
    /// already. This is where *static* errors originate: a simplification
    /// that can prove an evaluation must fail reports it at compile time.
    pub fn fold(self) -> Result<Expr> {
        Ok(match self {
            Expr::Range { start, end } if end < start => Expr::empty(),
            Expr::Not(inner) => match *inner {
                Expr::Literal(seq) => Expr::boolean(!static_ebv(&seq)?),
                Expr::Not(nested) => *nested,
                other => Expr::Not(Box::new(other)),
            },
            Expr::Cmp { op, lhs, rhs } => match (*lhs, *rhs) {
                (Expr::Literal(a), Expr::Literal(b)) => {
                    let result = general_compare(op, &a, &b).map_err(as_static)?;
                    Expr::boolean(result)
                }
                (lhs, rhs) => Expr::Cmp { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            },
            Expr::And(list) => fold_and(list)?,
            Expr::If { cond, then, otherwise } => match *cond {
                Expr::Literal(seq) => {
                    if static_ebv(&seq)? {
                        *then
                    } else {
                        *otherwise
                    }
                }
                cond => Expr::If {
                    cond: Box::new(cond),
                    then,
                    otherwise,
                },
            },
            Expr::Predicate { input, .. } if input.is_empty_literal() => Expr::empty(),
            Expr::PositionPredicate { input, min, max }
                if max < min && !input.effects().ordered() =>
            {
                Expr::empty()
            }
            Expr::Map { input, .. } if input.is_empty_literal() => Expr::empty(),
            Expr::Replicate { value, count: 0 } if !value.effects().ordered() => Expr::empty(),
            Expr::Replicate { value, count: 1 } => *value,
            Expr::Path { root, steps } => match *root {
                Expr::Literal(seq) => Expr::Literal(fold_path(&seq, &steps)?),
                root => Expr::Path { root: Box::new(root), steps },
            },
            Expr::Concat(list) => fold_concat(list),
            other => other,
        })
    }
}

/// Effective boolean value at compile time; failures are static errors.
fn static_ebv(seq: &[Item]) -> Result<bool> {
    effective_boolean(seq).map_err(as_static)
}

fn as_static(err: EngineError) -> EngineError {
    match err {
        EngineError::DynamicType(message) => EngineError::Type(message),
        other => other,
    }
}

fn fold_and(list: Vec<Expr>) -> Result<Expr> {
    let mut rest = Vec::with_capacity(list.len());
    for expr in list {
        match expr {
            Expr::Literal(seq) => {
                if !static_ebv(&seq)? {
                    // short-circuit is only safe when nothing else observes
                    if rest.iter().all(|e: &Expr| !e.effects().ordered()) {
                        return Ok(Expr::boolean(false));
                    }
                    rest.push(Expr::boolean(false));
                }
                // a true operand contributes nothing
            }
            other => rest.push(other),
        }
    }
    Ok(match rest.len() {
        0 => Expr::boolean(true),
        1 => rest.remove(0),
        _ => Expr::And(rest),
    })
}

fn fold_concat(list: Vec<Expr>) -> Expr {
    let mut parts: Vec<Expr> = Vec::with_capacity(list.len());
    for expr in list {
        match expr {
            Expr::Literal(seq) if seq.is_empty() => {}
            Expr::Concat(nested) => {
                for inner in nested {
                    push_concat(&mut parts, inner);
                }
            }
            other => push_concat(&mut parts, other),
        }
    }
    match parts.len() {
        0 => Expr::empty(),
        1 => parts.remove(0),
        _ => Expr::Concat(parts),
    }
}

fn push_concat(parts: &mut Vec<Expr>, expr: Expr) {
    if let (Some(Expr::Literal(tail)), Expr::Literal(items)) = (parts.last_mut(), &expr) {
        tail.extend(items.iter().cloned());
        return;
    }
    if !expr.is_empty_literal() {
        parts.push(expr);
    }
}

fn fold_path(seq: &[Item], steps: &[String]) -> Result<Sequence> {
    let mut current: Vec<Item> = seq.to_vec();
    for step in steps {
        let mut next = Vec::new();
        for item in &current {
            match item {
                Item::Node(node) => {
                    next.extend(node.select(step).into_iter().map(Item::Node));
                }
                other => {
                    return Err(EngineError::Type(format!(
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
