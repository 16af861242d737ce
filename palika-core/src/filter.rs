//! Field-predicate filters and query options
//!
//! Filters are conjunctions of simple field comparisons evaluated against a
//! record's JSON fields. They are the only query language the change feed
//! exposes: point queries and counts over a collection take a [`Filter`].

use crate::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
}

/// One field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against (JSON value for flexibility)
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Eq, value.into())
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Contains, value.into())
    }

    /// Evaluate this expression against a record.
    ///
    /// A missing field never matches, whatever the operator.
    pub fn matches(&self, record: &Record) -> bool {
        let Some(actual) = record.field(&self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::Eq => actual == &self.value,
            FilterOperator::Ne => actual != &self.value,
            FilterOperator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            FilterOperator::In => match &self.value {
                Value::Array(options) => options.contains(actual),
                _ => false,
            },
        }
    }
}

/// Conjunction of field comparisons. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub exprs: Vec<FilterExpr>,
}

impl Filter {
    /// Filter matching every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Shorthand for a single equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(FilterExpr::eq(field, value))
    }

    /// Add another expression to the conjunction.
    pub fn and(mut self, expr: FilterExpr) -> Self {
        self.exprs.push(expr);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// True when every expression matches.
    pub fn matches(&self, record: &Record) -> bool {
        self.exprs.iter().all(|expr| expr.matches(record))
    }
}

/// Sort direction for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Ordering clause for list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Limit and ordering for list queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub order: Option<OrderBy>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of records returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Order by a field in the given direction.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Sort and truncate `records` in place according to these options.
    ///
    /// Records missing the order field sort after every record that has it,
    /// regardless of direction.
    pub fn apply(&self, records: &mut Vec<Record>) {
        if let Some(order) = &self.order {
            records.sort_by(|a, b| {
                match (a.field(&order.field), b.field(&order.field)) {
                    (Some(x), Some(y)) => {
                        let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                        match order.direction {
                            SortDirection::Asc => ord,
                            SortDirection::Desc => ord.reverse(),
                        }
                    }
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
    }
}

/// Compare two JSON scalars of the same kind.
///
/// Numbers compare numerically, strings lexically (which orders RFC 3339
/// timestamps chronologically), booleans false-before-true. Mixed kinds are
/// incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
