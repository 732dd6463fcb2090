//! Structured fetch requests.
//!
//! A [`FetchRequest`] combines an entity name, a [`Predicate`] over attribute
//! values, sort keys and paging. Predicates are evaluated against committed
//! rows in the store and against pending values in the requesting context.

use crate::error::{CoreError, CoreResult};
use crate::row::RowValues;
use faultdb_codec::Value;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Comparison operator of a [`Predicate::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Text prefix.
    BeginsWith,
    /// Text substring.
    Contains,
}

/// A filter over attribute values.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches everything.
    True,
    /// `attribute op value`.
    Compare {
        /// Attribute name.
        attribute: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        value: Value,
    },
    /// Attribute equals one of the values.
    In {
        /// Attribute name.
        attribute: String,
        /// Candidates.
        values: Vec<Value>,
    },
    /// Attribute is null or absent.
    IsNull(String),
    /// All sub-predicates match.
    And(Vec<Predicate>),
    /// Any sub-predicate matches.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(attribute: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            attribute: attribute.to_string(),
            op,
            value: value.into(),
        }
    }

    /// `attribute == value`.
    pub fn eq(attribute: &str, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Eq, value)
    }

    /// `attribute != value`.
    pub fn ne(attribute: &str, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ne, value)
    }

    /// `attribute < value`.
    pub fn lt(attribute: &str, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Lt, value)
    }

    /// `attribute <= value`.
    pub fn le(attribute: &str, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Le, value)
    }

    /// `attribute > value`.
    pub fn gt(attribute: &str, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Gt, value)
    }

    /// `attribute >= value`.
    pub fn ge(attribute: &str, value: impl Into<Value>) -> Self {
        Self::compare(attribute, CompareOp::Ge, value)
    }

    /// Text attribute starts with `prefix`.
    pub fn begins_with(attribute: &str, prefix: &str) -> Self {
        Self::compare(attribute, CompareOp::BeginsWith, prefix)
    }

    /// Text attribute contains `needle`.
    pub fn contains(attribute: &str, needle: &str) -> Self {
        Self::compare(attribute, CompareOp::Contains, needle)
    }

    /// Attribute is one of `values`.
    pub fn one_of(attribute: &str, values: Vec<Value>) -> Self {
        Self::In {
            attribute: attribute.to_string(),
            values,
        }
    }

    /// Attribute is null.
    pub fn is_null(attribute: &str) -> Self {
        Self::IsNull(attribute.to_string())
    }

    /// Conjunction with another predicate.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::True => other,
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction with another predicate.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates against a set of values. Absent attributes read as `Null`.
    ///
    /// Ordering comparisons involving `Null` never match.
    #[must_use]
    pub fn evaluate(&self, values: &RowValues) -> bool {
        match self {
            Self::True => true,
            Self::Compare {
                attribute,
                op,
                value,
            } => {
                let actual = values.get(attribute).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
            Self::In { attribute, values: candidates } => {
                let actual = values.get(attribute).unwrap_or(&Value::Null);
                candidates
                    .iter()
                    .any(|c| actual.cmp_total(c) == Ordering::Equal)
            }
            Self::IsNull(attribute) => values.get(attribute).map_or(true, Value::is_null),
            Self::And(parts) => parts.iter().all(|p| p.evaluate(values)),
            Self::Or(parts) => parts.iter().any(|p| p.evaluate(values)),
            Self::Not(inner) => !inner.evaluate(values),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => actual.cmp_total(expected) == Ordering::Equal,
        CompareOp::Ne => actual.cmp_total(expected) != Ordering::Equal,
        CompareOp::BeginsWith => match (actual, expected) {
            (Value::Text(a), Value::Text(e)) => a.starts_with(e.as_str()),
            _ => false,
        },
        CompareOp::Contains => match (actual, expected) {
            (Value::Text(a), Value::Text(e)) => a.contains(e.as_str()),
            _ => false,
        },
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            if actual.is_null() || expected.is_null() {
                return false;
            }
            let ord = actual.cmp_total(expected);
            match op {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    /// Attribute name.
    pub attribute: String,
    /// Ascending if true.
    pub ascending: bool,
}

impl SortDescriptor {
    /// Ascending on `attribute`.
    pub fn ascending(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            ascending: true,
        }
    }

    /// Descending on `attribute`.
    pub fn descending(attribute: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            ascending: false,
        }
    }
}

/// Compares two value sets by a list of sort keys.
#[must_use]
pub fn compare_by(sort: &[SortDescriptor], a: &RowValues, b: &RowValues) -> Ordering {
    for key in sort {
        let left = a.get(&key.attribute).unwrap_or(&Value::Null);
        let right = b.get(&key.attribute).unwrap_or(&Value::Null);
        let ord = left.cmp_total(right);
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Cooperative cancellation flag shared between a fetch and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }

    /// Fails with [`CoreError::Cancelled`] if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the token is triggered.
    pub fn check(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A fetch against one entity.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Entity name.
    pub entity: String,
    /// Filter.
    pub predicate: Predicate,
    /// Sort keys, applied in order.
    pub sort: Vec<SortDescriptor>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Results to skip.
    pub offset: usize,
    /// Cache-population batch size, overriding the coordinator default.
    pub batch_size: Option<usize>,
    /// Return unmaterialized handles.
    pub returns_faults: bool,
    /// Merge the context's unsaved changes into the result.
    pub include_pending_changes: bool,
    /// Relationships whose destinations are loaded in the same pass.
    pub prefetch: Vec<String>,
    /// Cancellation token checked between batches.
    pub cancel: Option<CancelToken>,
}

impl FetchRequest {
    /// Fetches every object of `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            predicate: Predicate::True,
            sort: Vec::new(),
            limit: None,
            offset: 0,
            batch_size: None,
            returns_faults: true,
            include_pending_changes: true,
            prefetch: Vec::new(),
            cancel: None,
        }
    }

    /// Sets the filter.
    #[must_use]
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Appends a sort key.
    #[must_use]
    pub fn sort(mut self, descriptor: SortDescriptor) -> Self {
        self.sort.push(descriptor);
        self
    }

    /// Caps the result count.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips leading results.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the cache-population batch size.
    #[must_use]
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = Some(rows);
        self
    }

    /// Chooses between faults and materialized handles.
    #[must_use]
    pub fn returns_faults(mut self, value: bool) -> Self {
        self.returns_faults = value;
        self
    }

    /// Chooses whether unsaved changes are merged in.
    #[must_use]
    pub fn include_pending_changes(mut self, value: bool) -> Self {
        self.include_pending_changes = value;
        self
    }

    /// Prefetches a relationship of every result.
    #[must_use]
    pub fn prefetch(mut self, relationship: &str) -> Self {
        self.prefetch.push(relationship.to_string());
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Checks the cancellation token, if any.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the token is triggered.
    pub fn check_cancelled(&self) -> CoreResult<()> {
        self.cancel.as_ref().map_or(Ok(()), CancelToken::check)
    }

    /// Applies offset and limit to an already sorted list.
    #[must_use]
    pub fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}
