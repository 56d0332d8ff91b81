//! Occurrence indicators and static cardinality bounds.
//!
//! The full static type system lives outside this crate; what the pipeline
//! compiler needs from it is the occurrence part: how many items a value may
//! consist of, with union/intersection/instance-of so that typed constructs
//! can narrow their knowledge. [`Card`] is the arithmetic companion used by
//! the cardinality estimator, where `max == None` means unbounded.

/// Declared occurrence of a sequence type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// The empty sequence.
    Zero,
    /// Zero or one items.
    ZeroOrOne,
    /// Exactly one item.
    ExactlyOne,
    /// Any number of items.
    ZeroOrMore,
    /// At least one item.
    OneOrMore,
}

impl Occurrence {
    pub fn card(self) -> Card {
        match self {
            Occurrence::Zero => Card::exact(0),
            Occurrence::ZeroOrOne => Card { min: 0, max: Some(1) },
            Occurrence::ExactlyOne => Card::exact(1),
            Occurrence::ZeroOrMore => Card::UNKNOWN,
            Occurrence::OneOrMore => Card { min: 1, max: None },
        }
    }

    fn from_bounds(min: u64, max: Option<u64>) -> Occurrence {
        match (min, max) {
            (_, Some(0)) => Occurrence::Zero,
            (0, Some(1)) => Occurrence::ZeroOrOne,
            (1.., Some(1)) => Occurrence::ExactlyOne,
            (0, _) => Occurrence::ZeroOrMore,
            (1.., _) => Occurrence::OneOrMore,
        }
    }

    /// The least occurrence admitting both operands.
    pub fn union(self, other: Occurrence) -> Occurrence {
        let (a, b) = (self.card(), other.card());
        let max = match (a.max, b.max) {
            (Some(x), Some(y)) => Some(x.max(y)),
            _ => None,
        };
        Occurrence::from_bounds(a.min.min(b.min), max)
    }

    /// The occurrence admitted by both operands, if any.
    pub fn intersect(self, other: Occurrence) -> Option<Occurrence> {
        let (a, b) = (self.card(), other.card());
        let min = a.min.max(b.min);
        let max = match (a.max, b.max) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (Some(x), None) | (None, Some(x)) => Some(x),
            (None, None) => None,
        };
        match max {
            Some(m) if m < min => None,
            _ => Some(Occurrence::from_bounds(min, max)),
        }
    }

    /// Whether every value of this occurrence also satisfies `other`.
    pub fn instance_of(self, other: Occurrence) -> bool {
        let (a, b) = (self.card(), other.card());
        a.min >= b.min
            && match (a.max, b.max) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(x), Some(y)) => x <= y,
            }
    }
}

/// A static (min, max) bound on a result count. `max == None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    pub min: u64,
    pub max: Option<u64>,
}

impl Card {
    /// The least precise bound: zero to unbounded.
    pub const UNKNOWN: Card = Card { min: 0, max: None };
    pub const ONE: Card = Card { min: 1, max: Some(1) };

    pub fn exact(n: u64) -> Card {
        Card { min: n, max: Some(n) }
    }

    /// The exact count, when min and max coincide.
    pub fn exact_count(&self) -> Option<u64> {
        match self.max {
            Some(max) if max == self.min => Some(max),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max == Some(0)
    }

    /// Multiplies this bound by another, saturating, with 0 dominating
    /// unbounded on either side.
    pub fn multiply(&mut self, other: Card) {
        self.min = self.min.saturating_mul(other.min);
        self.max = match (self.max, other.max) {
            (Some(0), _) | (_, Some(0)) => Some(0),
            (Some(a), Some(b)) => Some(a.saturating_mul(b)),
            _ => None,
        };
    }

    /// Adds another bound to this one, saturating.
    pub fn add(&mut self, other: Card) {
        self.min = self.min.saturating_add(other.min);
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            _ => None,
        };
    }

    /// Union of two alternative bounds (used for conditional branches).
    pub fn union(&self, other: Card) -> Card {
        Card {
            min: self.min.min(other.min),
            max: match (self.max, other.max) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }
}
