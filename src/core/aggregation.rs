//! Grouped and scalar aggregation
//!
//! An [`AggregationSpec`] describes a grouped aggregation without reference to any
//! backend: group-by columns, named aggregate expressions, an optional backend-specific
//! filter, HAVING comparisons over the result columns, ordering and paging. SQL adapters
//! render it natively; stores without a query engine feed their filtered records through
//! [`aggregate_records`]. Both paths finish with [`normalize_row`] so they agree on
//! result types:
//!
//! - `count` is an exact integer and is `0` over no rows
//! - `sum` and `avg` are floating point and are null over no rows
//! - `min` and `max` keep the column's own type and are null over no rows
//!
//! Without group-by columns the whole input is one group, so a scalar aggregation always
//! yields exactly one row.

use super::error::{BridgeError, Result};
use super::query::{sort_records, Comparison, OrderBy, Page};
use super::value::{compare_values, FieldValue, Record};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// Name of the result column used by the scalar shortcuts
pub const SCALAR_COLUMN: &str = "value";

/// One aggregate expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// Number of rows in the group
    Count,
    /// Number of non-null values in a column
    CountColumn(String),
    /// Number of distinct non-null values in a column
    CountDistinct(String),
    /// Sum of a column
    Sum(String),
    /// Average of a column
    Avg(String),
    /// Smallest value of a column
    Min(String),
    /// Largest value of a column
    Max(String),
}

impl Aggregate {
    /// Column this aggregate reads, if any
    pub fn column(&self) -> Option<&str> {
        match self {
            Aggregate::Count => None,
            Aggregate::CountColumn(c)
            | Aggregate::CountDistinct(c)
            | Aggregate::Sum(c)
            | Aggregate::Avg(c)
            | Aggregate::Min(c)
            | Aggregate::Max(c) => Some(c),
        }
    }

    /// SQL function name
    pub fn function_name(&self) -> &'static str {
        match self {
            Aggregate::Count | Aggregate::CountColumn(_) | Aggregate::CountDistinct(_) => "COUNT",
            Aggregate::Sum(_) => "SUM",
            Aggregate::Avg(_) => "AVG",
            Aggregate::Min(_) => "MIN",
            Aggregate::Max(_) => "MAX",
        }
    }

    fn is_count(&self) -> bool {
        matches!(
            self,
            Aggregate::Count | Aggregate::CountColumn(_) | Aggregate::CountDistinct(_)
        )
    }

    fn is_floating(&self) -> bool {
        matches!(self, Aggregate::Sum(_) | Aggregate::Avg(_))
    }
}

/// Backend-agnostic aggregation request
///
/// `F` is the adapter's own filter type; the engine never looks inside it.
#[derive(Debug, Clone)]
pub struct AggregationSpec<F> {
    /// Columns to group by
    pub group_by: Vec<String>,
    /// Result column name -> aggregate, in output order
    pub aggregations: Vec<(String, Aggregate)>,
    /// Row filter applied before grouping
    pub filter: Option<F>,
    /// Comparisons over result columns applied after grouping
    pub having: Vec<Comparison>,
    /// Ordering over result columns
    pub order_by: Vec<OrderBy>,
    /// Window over the ordered groups
    pub page: Page,
}

impl<F> Default for AggregationSpec<F> {
    fn default() -> Self {
        Self {
            group_by: Vec::new(),
            aggregations: Vec::new(),
            filter: None,
            having: Vec::new(),
            order_by: Vec::new(),
            page: Page::all(),
        }
    }
}

impl<F> AggregationSpec<F> {
    /// An empty aggregation
    pub fn new() -> Self {
        Self::default()
    }

    /// A one-aggregate, ungrouped aggregation whose result column is [`SCALAR_COLUMN`]
    pub fn scalar(aggregate: Aggregate, filter: Option<F>) -> Self {
        Self {
            aggregations: vec![(SCALAR_COLUMN.to_string(), aggregate)],
            filter,
            ..Self::default()
        }
    }

    /// Group by the given columns
    #[must_use]
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add a named aggregate
    #[must_use]
    pub fn aggregate(mut self, name: impl Into<String>, aggregate: Aggregate) -> Self {
        self.aggregations.push((name.into(), aggregate));
        self
    }

    /// Set the row filter
    #[must_use]
    pub fn filter(mut self, filter: F) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Add a HAVING comparison
    #[must_use]
    pub fn having(mut self, comparison: Comparison) -> Self {
        self.having.push(comparison);
        self
    }

    /// Add an ordering key
    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set the limit
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.page.limit = Some(limit);
        self
    }

    /// Set the offset
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.page.offset = offset;
        self
    }

    /// Names of the result columns, group-by columns first
    pub fn result_columns(&self) -> Vec<&str> {
        self.group_by
            .iter()
            .map(String::as_str)
            .chain(self.aggregations.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    /// Check the aggregation against the target's columns
    ///
    /// # Errors
    ///
    /// Returns `Validation` when a group-by or aggregate column is not a column of the
    /// target, when result names are empty or repeated, when HAVING or ORDER BY name a
    /// column that is not in the result, or when the limit is zero.
    pub fn validate(&self, column_exists: impl Fn(&str) -> bool) -> Result<()> {
        if self.group_by.is_empty() && self.aggregations.is_empty() {
            return Err(BridgeError::validation(
                "aggregation needs at least one group-by column or aggregate",
            ));
        }

        for column in &self.group_by {
            if !column_exists(column) {
                return Err(BridgeError::validation(format!(
                    "unknown group-by column '{}'",
                    column
                )));
            }
        }

        let mut names: HashSet<&str> = self.group_by.iter().map(String::as_str).collect();
        if names.len() != self.group_by.len() {
            return Err(BridgeError::validation("duplicate group-by column"));
        }

        for (name, aggregate) in &self.aggregations {
            if name.is_empty() {
                return Err(BridgeError::validation("aggregate result name is empty"));
            }
            if !names.insert(name.as_str()) {
                return Err(BridgeError::validation(format!(
                    "result column '{}' is defined twice",
                    name
                )));
            }
            if let Some(column) = aggregate.column() {
                if !column_exists(column) {
                    return Err(BridgeError::validation(format!(
                        "unknown column '{}' in aggregate '{}'",
                        column, name
                    )));
                }
            }
        }

        for comparison in &self.having {
            if !names.contains(comparison.column.as_str()) {
                return Err(BridgeError::validation(format!(
                    "HAVING references '{}', which is not a result column",
                    comparison.column
                )));
            }
        }

        for order in &self.order_by {
            if !names.contains(order.column.as_str()) {
                return Err(BridgeError::validation(format!(
                    "ORDER BY references '{}', which is not a result column",
                    order.column
                )));
            }
        }

        if self.page.limit == Some(0) {
            return Err(BridgeError::validation("limit must be greater than zero"));
        }

        Ok(())
    }

    /// Replace the filter type, keeping everything else
    pub fn map_filter<G>(self, f: impl FnOnce(F) -> G) -> AggregationSpec<G> {
        AggregationSpec {
            group_by: self.group_by,
            aggregations: self.aggregations,
            filter: self.filter.map(f),
            having: self.having,
            order_by: self.order_by,
            page: self.page,
        }
    }
}

/// Bring a result row to the engine-independent result types
pub fn normalize_row<F>(mut row: Record, spec: &AggregationSpec<F>) -> Record {
    for (name, aggregate) in &spec.aggregations {
        let value = row.remove(name).unwrap_or(FieldValue::Null);
        let value = if aggregate.is_count() {
            FieldValue::Long(value.as_long().unwrap_or(0))
        } else if aggregate.is_floating() {
            match value.as_double() {
                Some(v) if !value.is_null() => FieldValue::Double(v),
                _ => FieldValue::Null,
            }
        } else {
            value
        };
        row.insert(name.clone(), value);
    }
    row
}

#[derive(Debug, Clone)]
struct GroupKey(Vec<FieldValue>);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let ord = compare_values(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(u64),
    Distinct(Vec<FieldValue>),
    Sum { total: f64, seen: bool },
    Avg { total: f64, n: u64 },
    Min(Option<FieldValue>),
    Max(Option<FieldValue>),
}

impl Accumulator {
    fn new(aggregate: &Aggregate) -> Self {
        match aggregate {
            Aggregate::Count | Aggregate::CountColumn(_) => Accumulator::Count(0),
            Aggregate::CountDistinct(_) => Accumulator::Distinct(Vec::new()),
            Aggregate::Sum(_) => Accumulator::Sum {
                total: 0.0,
                seen: false,
            },
            Aggregate::Avg(_) => Accumulator::Avg { total: 0.0, n: 0 },
            Aggregate::Min(_) => Accumulator::Min(None),
            Aggregate::Max(_) => Accumulator::Max(None),
        }
    }

    fn feed(&mut self, aggregate: &Aggregate, row: &Record) {
        let value = match aggregate.column() {
            None => {
                if let Accumulator::Count(n) = self {
                    *n += 1;
                }
                return;
            }
            Some(column) => match row.get(column) {
                Some(v) if !v.is_null() => v,
                _ => return,
            },
        };

        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Distinct(seen) => {
                if let Err(pos) = seen.binary_search_by(|seen_value| compare_values(seen_value, value)) {
                    seen.insert(pos, value.clone());
                }
            }
            Accumulator::Sum { total, seen } => {
                *total += value.as_double().unwrap_or(0.0);
                *seen = true;
            }
            Accumulator::Avg { total, n } => {
                *total += value.as_double().unwrap_or(0.0);
                *n += 1;
            }
            Accumulator::Min(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| compare_values(value, c) == Ordering::Less)
                {
                    *current = Some(value.clone());
                }
            }
            Accumulator::Max(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| compare_values(value, c) == Ordering::Greater)
                {
                    *current = Some(value.clone());
                }
            }
        }
    }

    fn finish(self) -> FieldValue {
        match self {
            Accumulator::Count(n) => FieldValue::Long(n as i64),
            Accumulator::Distinct(seen) => FieldValue::Long(seen.len() as i64),
            Accumulator::Sum { total, seen } => {
                if seen {
                    FieldValue::Double(total)
                } else {
                    FieldValue::Null
                }
            }
            Accumulator::Avg { total, n } => {
                if n == 0 {
                    FieldValue::Null
                } else {
                    FieldValue::Double(total / n as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(FieldValue::Null),
        }
    }
}

/// Aggregate already-filtered records in memory
///
/// Used by stores that have no query engine of their own. The aggregation's filter is ignored
/// here; the caller applies it while producing `records`.
pub fn aggregate_records<F, I>(records: I, spec: &AggregationSpec<F>) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let fresh = || -> Vec<Accumulator> {
        spec.aggregations
            .iter()
            .map(|(_, aggregate)| Accumulator::new(aggregate))
            .collect()
    };

    let mut groups: BTreeMap<GroupKey, Vec<Accumulator>> = BTreeMap::new();
    if spec.group_by.is_empty() {
        groups.insert(GroupKey(Vec::new()), fresh());
    }

    for row in records {
        let key = GroupKey(
            spec.group_by
                .iter()
                .map(|column| row.get(column).cloned().unwrap_or(FieldValue::Null))
                .collect(),
        );
        let accumulators = groups.entry(key).or_insert_with(fresh);
        for (acc, (_, aggregate)) in accumulators.iter_mut().zip(&spec.aggregations) {
            acc.feed(aggregate, &row);
        }
    }

    let mut rows: Vec<Record> = groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut row: Record = spec.group_by.iter().cloned().zip(key.0).collect();
            for (acc, (name, _)) in accumulators.into_iter().zip(&spec.aggregations) {
                row.insert(name.clone(), acc.finish());
            }
            row
        })
        .filter(|row| spec.having.iter().all(|c| c.matches(row)))
        .collect();

    sort_records(&mut rows, &spec.order_by);
    spec.page.apply(rows)
}

/// Pull the scalar result out of a one-row aggregation result
pub fn scalar_value(rows: Vec<Record>) -> FieldValue {
    rows.into_iter()
        .next()
        .and_then(|mut row| row.remove(SCALAR_COLUMN))
        .unwrap_or(FieldValue::Null)
}
