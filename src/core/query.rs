//! Backend-agnostic query primitives
//!
//! Ordering, paging and result-column comparisons shared by every adapter. Filters
//! themselves are backend-specific and opaque; these types only describe what happens to
//! the matching rows afterwards.

use super::value::{compare_values, FieldValue, Record};
use std::cmp::Ordering;

/// Comparison operators for post-filter comparisons (e.g. HAVING)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Equal to (=)
    Eq,
    /// Not equal to (!=)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    /// LIKE pattern matching (`%` any run, `_` one character)
    Like,
    /// IS NULL
    IsNull,
    /// IS NOT NULL
    IsNotNull,
}

impl Operator {
    /// SQL spelling of this operator
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "LIKE",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        }
    }

    /// Whether this operator takes a right-hand value
    pub fn takes_value(&self) -> bool {
        !matches!(self, Operator::IsNull | Operator::IsNotNull)
    }

    /// Evaluate `left <op> right` with SQL null semantics (null never compares true)
    pub fn evaluate(&self, left: &FieldValue, right: &FieldValue) -> bool {
        match self {
            Operator::IsNull => left.is_null(),
            Operator::IsNotNull => !left.is_null(),
            _ if left.is_null() || right.is_null() => false,
            Operator::Like => match (left.as_str(), right.as_str()) {
                (Some(text), Some(pattern)) => like_matches(text, pattern),
                _ => false,
            },
            Operator::Eq => compare_values(left, right) == Ordering::Equal,
            Operator::Ne => compare_values(left, right) != Ordering::Equal,
            Operator::Lt => compare_values(left, right) == Ordering::Less,
            Operator::Le => compare_values(left, right) != Ordering::Greater,
            Operator::Gt => compare_values(left, right) == Ordering::Greater,
            Operator::Ge => compare_values(left, right) != Ordering::Less,
        }
    }
}

/// Case-insensitive LIKE over ASCII, matching SQLite's default behavior
fn like_matches(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((bp, bt)) = backtrack {
            p = bp + 1;
            t = bt + 1;
            backtrack = Some((bp, bt + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

/// One `column <op> value` comparison against a result record
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    /// Result column the comparison reads
    pub column: String,
    /// Operator to apply
    pub operator: Operator,
    /// Right-hand value (ignored by IS NULL / IS NOT NULL)
    pub value: FieldValue,
}

impl Comparison {
    /// Create a comparison
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<FieldValue>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }

    /// Evaluate against a record; a missing column reads as null
    pub fn matches(&self, record: &Record) -> bool {
        let left = record.get(&self.column).unwrap_or(&FieldValue::Null);
        self.operator.evaluate(left, &self.value)
    }
}

/// ORDER BY direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Ascending order
    #[default]
    Asc,
    /// Descending order
    Desc,
}

impl OrderDirection {
    /// SQL spelling of this direction
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// One ordering key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Column or field to sort on
    pub column: String,
    /// Sort direction
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Ascending on `column`
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Descending on `column`
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// Sort records in place by a list of keys (stable)
pub fn sort_records(records: &mut [Record], order: &[OrderBy]) {
    if order.is_empty() {
        return;
    }
    records.sort_by(|a, b| compare_by(a, b, order));
}

/// Compare two records by a list of ordering keys
pub fn compare_by(a: &Record, b: &Record, order: &[OrderBy]) -> Ordering {
    for key in order {
        let left = a.get(&key.column).unwrap_or(&FieldValue::Null);
        let right = b.get(&key.column).unwrap_or(&FieldValue::Null);
        let ord = match key.direction {
            OrderDirection::Asc => compare_values(left, right),
            OrderDirection::Desc => compare_values(right, left),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Limit/offset window, applied after ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    /// Maximum number of items to return
    pub limit: Option<usize>,
    /// Number of items to skip
    pub offset: usize,
}

impl Page {
    /// No paging
    pub fn all() -> Self {
        Self::default()
    }

    /// At most `limit` items from the start
    pub fn first(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: 0,
        }
    }

    /// Set the limit
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the offset
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Apply this window to an already ordered sequence
    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::record;

    #[test]
    fn test_operator_null_semantics() {
        assert!(!Operator::Eq.evaluate(&FieldValue::Null, &FieldValue::Null));
        assert!(Operator::IsNull.evaluate(&FieldValue::Null, &FieldValue::Null));
        assert!(Operator::Gt.evaluate(&FieldValue::Long(5), &FieldValue::Int(4)));
    }

    #[test]
    fn test_like_patterns() {
        assert!(like_matches("Alice", "a%"));
        assert!(like_matches("Alice", "%lic%"));
        assert!(like_matches("Alice", "_lice"));
        assert!(!like_matches("Alice", "b%"));
        assert!(like_matches("", "%"));
        assert!(!like_matches("abc", "ab"));
    }

    #[test]
    fn test_sort_records_multi_key() {
        let mut rows = vec![
            record([("dept", FieldValue::from("B")), ("age", 5.into())]),
            record([("dept", FieldValue::from("A")), ("age", 20.into())]),
            record([("dept", FieldValue::from("A")), ("age", 10.into())]),
        ];
        sort_records(&mut rows, &[OrderBy::asc("dept"), OrderBy::desc("age")]);

        let ages: Vec<_> = rows.iter().map(|r| r["age"].as_long()).collect();
        assert_eq!(ages, vec![Some(20), Some(10), Some(5)]);
    }

    #[test]
    fn test_page_apply() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(Page::all().apply(items.clone()), vec![1, 2, 3, 4, 5]);
        assert_eq!(Page::first(2).offset(1).apply(items.clone()), vec![2, 3]);
        assert_eq!(Page::all().offset(10).apply(items), Vec::<i32>::new());
    }
}
