use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DomainValue {
    Int(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSet {
    All,
    None,
    Discrete(BTreeSet<DomainValue>),
    /// Inclusive on both ends.
    Range { low: DomainValue, high: DomainValue },
}

impl ValueSet {
    fn contains(&self, value: &DomainValue) -> bool {
        match self {
            ValueSet::All => true,
            ValueSet::None => false,
            ValueSet::Discrete(values) => values.contains(value),
            ValueSet::Range { low, high } => low <= value && value <= high,
        }
    }

    fn intersect(&self, other: &ValueSet) -> ValueSet {
        match (self, other) {
            (ValueSet::None, _) | (_, ValueSet::None) => ValueSet::None,
            (ValueSet::All, other) | (other, ValueSet::All) => other.clone(),
            (ValueSet::Discrete(a), ValueSet::Discrete(b)) => {
                Self::discrete(a.intersection(b).cloned().collect())
            }
            (ValueSet::Discrete(values), range @ ValueSet::Range { .. })
            | (range @ ValueSet::Range { .. }, ValueSet::Discrete(values)) => {
                Self::discrete(values.iter().filter(|v| range.contains(v)).cloned().collect())
            }
            (
                ValueSet::Range {
                    low: low_a,
                    high: high_a,
                },
                ValueSet::Range {
                    low: low_b,
                    high: high_b,
                },
            ) => {
                let low = low_a.max(low_b).clone();
                let high = high_a.min(high_b).clone();
                if low > high {
                    ValueSet::None
                } else {
                    ValueSet::Range { low, high }
                }
            }
        }
    }

    fn discrete(values: BTreeSet<DomainValue>) -> ValueSet {
        if values.is_empty() {
            ValueSet::None
        } else {
            ValueSet::Discrete(values)
        }
    }
}

/// Set of values a column may take, as computed by a dynamic filter.
///
/// Domains only ever narrow: merging two domains yields their intersection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    values: ValueSet,
    null_allowed: bool,
}

impl Domain {
    pub fn all() -> Self {
        Self {
            values: ValueSet::All,
            null_allowed: true,
        }
    }

    pub fn none() -> Self {
        Self {
            values: ValueSet::None,
            null_allowed: false,
        }
    }

    pub fn multiple_values(values: impl IntoIterator<Item = DomainValue>) -> Self {
        Self {
            values: ValueSet::discrete(values.into_iter().collect()),
            null_allowed: false,
        }
    }

    pub fn single_value(value: DomainValue) -> Self {
        Self::multiple_values([value])
    }

    pub fn range(low: DomainValue, high: DomainValue) -> Self {
        let values = if low > high {
            ValueSet::None
        } else {
            ValueSet::Range { low, high }
        };
        Self {
            values,
            null_allowed: false,
        }
    }

    pub fn with_nulls(mut self) -> Self {
        self.null_allowed = true;
        self
    }

    pub fn values(&self) -> &ValueSet {
        &self.values
    }

    pub fn is_null_allowed(&self) -> bool {
        self.null_allowed
    }

    pub fn is_none(&self) -> bool {
        self.values == ValueSet::None && !self.null_allowed
    }

    pub fn includes(&self, value: &DomainValue) -> bool {
        self.values.contains(value)
    }

    pub fn intersect(&self, other: &Domain) -> Domain {
        Domain {
            values: self.values.intersect(&other.values),
            null_allowed: self.null_allowed && other.null_allowed,
        }
    }
}
