use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::tree::Node;

/// A single result item. The engine is untyped at this granularity; the
/// static type system only reasons about occurrence counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Item {
    Integer(i64),
    Boolean(bool),
    Text(String),
    Node(Arc<Node>),
}

/// An ordered, possibly empty sequence of items.
pub type Sequence = Vec<Item>;

impl Item {
    pub fn kind(&self) -> &'static str {
        match self {
            Item::Integer(_) => "integer",
            Item::Boolean(_) => "boolean",
            Item::Text(_) => "text",
            Item::Node(_) => "node",
        }
    }

    /// The atomized value used in comparisons: nodes compare by their text.
    fn atomized(&self) -> Item {
        match self {
            Item::Node(node) => Item::Text(node.text()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Item::Integer(i) => write!(f, "{i}"),
            Item::Boolean(b) => write!(f, "{b}"),
            Item::Text(t) => write!(f, "{t}"),
            Item::Node(n) => write!(f, "{n}"),
        }
    }
}

/// Effective boolean value of a sequence.
///
/// Empty is false, a leading node is true, and a singleton atomic value is
/// its natural truthiness. Everything else has no boolean interpretation.
pub fn effective_boolean(seq: &[Item]) -> Result<bool> {
    match seq {
        [] => Ok(false),
        [Item::Node(_), ..] => Ok(true),
        [item] => match item {
            Item::Boolean(b) => Ok(*b),
            Item::Integer(i) => Ok(*i != 0),
            Item::Text(t) => Ok(!t.is_empty()),
            Item::Node(_) => Ok(true),
        },
        _ => Err(EngineError::DynamicType(
            "sequence of multiple atomic items has no boolean value".to_owned(),
        )),
    }
}

/// Compares two items after atomization. Mismatched kinds do not compare;
/// the caller decides whether that is a static or a dynamic error.
pub fn compare_items(left: &Item, right: &Item) -> Option<Ordering> {
    match (left.atomized(), right.atomized()) {
        (Item::Integer(a), Item::Integer(b)) => Some(a.cmp(&b)),
        (Item::Boolean(a), Item::Boolean(b)) => Some(a.cmp(&b)),
        (Item::Text(a), Item::Text(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// Comparison operators of the expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let symbol = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{symbol}")
    }
}

/// Existentially quantified comparison of two sequences: true if any pair
/// of items satisfies the operator.
pub fn general_compare(op: CmpOp, left: &[Item], right: &[Item]) -> Result<bool> {
    for a in left {
        for b in right {
            match compare_items(a, b) {
                Some(ordering) => {
                    if op.holds(ordering) {
                        return Ok(true);
                    }
                }
                None => {
                    return Err(EngineError::DynamicType(format!(
                        "cannot compare {} with {}",
                        a.kind(),
                        b.kind()
                    )));
                }
            }
        }
    }
    Ok(false)
}
