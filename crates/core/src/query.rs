//! Query shapes
//!
//! A [`Query`] names an object type, a filter and an optional sort. It is a
//! plain value (`Eq + Hash`) so that subscriptions with the same shape on one
//! handle can share a notifier.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::value::Value;

/// Comparison operator of a filter term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
        }
    }
}

/// Filter over the properties of one object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every object
    All,
    /// `property <op> value`
    Compare {
        /// Property name
        property: String,
        /// Operator
        op: CompareOp,
        /// Right-hand side
        value: Value,
    },
    /// All terms match
    And(Vec<Predicate>),
    /// Any term matches
    Or(Vec<Predicate>),
    /// Term does not match
    Not(Box<Predicate>),
}

impl Predicate {
    /// `property <op> value`
    pub fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            property: property.into(),
            op,
            value: value.into(),
        }
    }

    /// `property == value`
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::compare(property, CompareOp::Eq, value)
    }

    /// `property > value`
    pub fn gt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::compare(property, CompareOp::Gt, value)
    }

    /// `property < value`
    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::compare(property, CompareOp::Lt, value)
    }

    /// Evaluate against one object
    ///
    /// `lookup` returns the value of a property, or `None` if the object has
    /// no such property (which never matches a comparison).
    pub fn matches<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        match self {
            Predicate::All => true,
            Predicate::Compare {
                property,
                op,
                value,
            } => lookup(property)
                .and_then(|v| v.compare(value))
                .map(|ord| op.accepts(ord))
                .unwrap_or(false),
            Predicate::And(terms) => terms.iter().all(|t| t.matches(lookup)),
            Predicate::Or(terms) => terms.iter().any(|t| t.matches(lookup)),
            Predicate::Not(term) => !term.matches(lookup),
        }
    }
}

/// Sort order of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortDescriptor {
    /// Property to sort by
    pub property: String,
    /// Ascending when true
    pub ascending: bool,
}

/// Query over one object type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    /// Object type the query reads
    pub object_type: String,
    /// Filter
    pub predicate: Predicate,
    /// Optional sort; unsorted results are in insertion (key) order
    pub sort: Option<SortDescriptor>,
}

impl Query {
    /// Every object of a type, in insertion order
    pub fn all(object_type: impl Into<String>) -> Self {
        Query {
            object_type: object_type.into(),
            predicate: Predicate::All,
            sort: None,
        }
    }

    /// Add a filter term (combined with any existing filter by AND)
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = match self.predicate {
            Predicate::All => predicate,
            Predicate::And(mut terms) => {
                terms.push(predicate);
                Predicate::And(terms)
            }
            existing => Predicate::And(vec![existing, predicate]),
        };
        self
    }

    /// Sort by a property
    pub fn sorted_by(mut self, property: impl Into<String>, ascending: bool) -> Self {
        self.sort = Some(SortDescriptor {
            property: property.into(),
            ascending,
        });
        self
    }
}
