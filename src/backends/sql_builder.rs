//! SQL rendering for the relational adapters
//!
//! Builders produce a [`SqlStatement`]: SQL text with `?` placeholders plus the values to
//! bind, so caller data never reaches the SQL text. Table and column names are checked
//! against `[A-Za-z_][A-Za-z0-9_]*` and quoted.
//!
//! [`SqlPredicate`] is the filter type of the relational adapters. Its clause is passed
//! through verbatim, wrapped in parentheses; the builders never parse it.

use crate::core::aggregation::{Aggregate, AggregationSpec};
use crate::core::error::{BridgeError, Result};
use crate::core::query::{Comparison, OrderBy, Page};
use crate::core::value::{FieldValue, Record};

/// An opaque SQL `WHERE` clause with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    /// Clause text, using `?` placeholders
    pub clause: String,
    /// Values bound to the placeholders, in order
    pub params: Vec<FieldValue>,
}

impl SqlPredicate {
    /// A clause with parameters
    pub fn new(clause: impl Into<String>, params: Vec<FieldValue>) -> Self {
        Self {
            clause: clause.into(),
            params,
        }
    }

    /// A clause without parameters
    pub fn raw(clause: impl Into<String>) -> Self {
        Self::new(clause, Vec::new())
    }

    /// `column = value`
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `column` is not a valid identifier.
    pub fn eq(column: &str, value: impl Into<FieldValue>) -> Result<Self> {
        Ok(Self::new(
            format!("{} = ?", quote_identifier(column)?),
            vec![value.into()],
        ))
    }

    /// Both predicates must hold
    #[must_use]
    pub fn and(mut self, other: SqlPredicate) -> Self {
        self.clause = format!("({}) AND ({})", self.clause, other.clause);
        self.params.extend(other.params);
        self
    }
}

/// Rendered SQL plus its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    /// SQL text
    pub sql: String,
    /// Parameters in placeholder order
    pub params: Vec<FieldValue>,
}

/// Check that `name` is a plain SQL identifier
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(BridgeError::validation(format!(
            "invalid identifier '{}'",
            name
        )))
    }
}

/// Validate and double-quote an identifier
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

fn push_where(sql: &mut String, params: &mut Vec<FieldValue>, filter: Option<&SqlPredicate>) {
    if let Some(filter) = filter {
        sql.push_str(&format!(" WHERE ({})", filter.clause));
        params.extend(filter.params.iter().cloned());
    }
}

fn push_order(sql: &mut String, order: &[OrderBy]) -> Result<()> {
    if order.is_empty() {
        return Ok(());
    }
    let clauses = order
        .iter()
        .map(|o| Ok(format!("{} {}", quote_identifier(&o.column)?, o.direction.as_sql())))
        .collect::<Result<Vec<_>>>()?;
    sql.push_str(" ORDER BY ");
    sql.push_str(&clauses.join(", "));
    Ok(())
}

fn push_page(sql: &mut String, page: Page) {
    match (page.limit, page.offset) {
        (Some(limit), 0) => sql.push_str(&format!(" LIMIT {}", limit)),
        (Some(limit), offset) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        (None, 0) => {}
        // SQLite needs a LIMIT before OFFSET
        (None, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
    }
}

/// Record fields in a stable order
fn sorted_fields(record: &Record) -> Vec<(&String, &FieldValue)> {
    let mut fields: Vec<_> = record.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    fields
}

/// SELECT query builder
#[derive(Debug, Clone)]
pub struct SelectBuilder<'a> {
    table: &'a str,
    columns: Vec<&'a str>,
    filter: Option<&'a SqlPredicate>,
    order_by: &'a [OrderBy],
    page: Page,
}

impl<'a> SelectBuilder<'a> {
    /// Select every column of `table`
    pub fn new(table: &'a str) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filter: None,
            order_by: &[],
            page: Page::all(),
        }
    }

    /// Select specific columns
    #[must_use]
    pub fn columns(mut self, columns: &[&'a str]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    /// Restrict to rows matching `filter`
    #[must_use]
    pub fn filter(mut self, filter: Option<&'a SqlPredicate>) -> Self {
        self.filter = filter;
        self
    }

    /// Order the rows
    #[must_use]
    pub fn order_by(mut self, order: &'a [OrderBy]) -> Self {
        self.order_by = order;
        self
    }

    /// Page the ordered rows
    #[must_use]
    pub fn page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }

    /// Render the query
    pub fn build(&self) -> Result<SqlStatement> {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", columns, quote_identifier(self.table)?);
        let mut params = Vec::new();
        push_where(&mut sql, &mut params, self.filter);
        push_order(&mut sql, self.order_by)?;
        push_page(&mut sql, self.page);
        Ok(SqlStatement { sql, params })
    }

    /// Render a `COUNT(*)` over the same rows, ignoring order and paging
    pub fn build_count(&self) -> Result<SqlStatement> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(self.table)?);
        let mut params = Vec::new();
        push_where(&mut sql, &mut params, self.filter);
        Ok(SqlStatement { sql, params })
    }

    /// Render an `EXISTS` check over the same rows
    pub fn build_exists(&self) -> Result<SqlStatement> {
        let mut inner = format!("SELECT 1 FROM {}", quote_identifier(self.table)?);
        let mut params = Vec::new();
        push_where(&mut inner, &mut params, self.filter);
        Ok(SqlStatement {
            sql: format!("SELECT EXISTS({} LIMIT 1)", inner),
            params,
        })
    }
}

/// How an insert treats an existing row with the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Fail on a constraint violation
    Abort,
    /// Replace the existing row
    Replace,
}

/// Render an INSERT for one record
pub fn build_insert(table: &str, record: &Record, conflict: Conflict) -> Result<SqlStatement> {
    let verb = match conflict {
        Conflict::Abort => "INSERT",
        Conflict::Replace => "INSERT OR REPLACE",
    };
    let table = quote_identifier(table)?;

    if record.is_empty() {
        return Ok(SqlStatement {
            sql: format!("{} INTO {} DEFAULT VALUES", verb, table),
            params: Vec::new(),
        });
    }

    let fields = sorted_fields(record);
    let columns = fields
        .iter()
        .map(|(name, _)| quote_identifier(name))
        .collect::<Result<Vec<_>>>()?;
    let placeholders = vec!["?"; fields.len()];

    Ok(SqlStatement {
        sql: format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            table,
            columns.join(", "),
            placeholders.join(", ")
        ),
        params: fields.into_iter().map(|(_, v)| v.clone()).collect(),
    })
}

/// Render an UPDATE of matching rows
pub fn build_update(table: &str, changes: &Record, filter: &SqlPredicate) -> Result<SqlStatement> {
    if changes.is_empty() {
        return Err(BridgeError::validation("update needs at least one column"));
    }

    let fields = sorted_fields(changes);
    let assignments = fields
        .iter()
        .map(|(name, _)| Ok(format!("{} = ?", quote_identifier(name)?)))
        .collect::<Result<Vec<_>>>()?;

    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_identifier(table)?,
        assignments.join(", ")
    );
    let mut params: Vec<FieldValue> = fields.into_iter().map(|(_, v)| v.clone()).collect();
    push_where(&mut sql, &mut params, Some(filter));
    Ok(SqlStatement { sql, params })
}

/// Render a DELETE of matching rows; `None` deletes every row
pub fn build_delete(table: &str, filter: Option<&SqlPredicate>) -> Result<SqlStatement> {
    let mut sql = format!("DELETE FROM {}", quote_identifier(table)?);
    let mut params = Vec::new();
    push_where(&mut sql, &mut params, filter);
    Ok(SqlStatement { sql, params })
}

fn aggregate_expression(aggregate: &Aggregate) -> Result<String> {
    Ok(match aggregate {
        Aggregate::Count => "COUNT(*)".to_string(),
        Aggregate::CountDistinct(column) => {
            format!("COUNT(DISTINCT {})", quote_identifier(column)?)
        }
        Aggregate::CountColumn(column)
        | Aggregate::Sum(column)
        | Aggregate::Avg(column)
        | Aggregate::Min(column)
        | Aggregate::Max(column) => {
            format!("{}({})", aggregate.function_name(), quote_identifier(column)?)
        }
    })
}

fn having_clause(
    comparison: &Comparison,
    spec: &AggregationSpec<SqlPredicate>,
    params: &mut Vec<FieldValue>,
) -> Result<String> {
    let target = match spec
        .aggregations
        .iter()
        .find(|(name, _)| *name == comparison.column)
    {
        Some((_, aggregate)) => aggregate_expression(aggregate)?,
        None => quote_identifier(&comparison.column)?,
    };

    if comparison.operator.takes_value() {
        params.push(comparison.value.clone());
        Ok(format!("{} {} ?", target, comparison.operator.as_sql()))
    } else {
        Ok(format!("{} {}", target, comparison.operator.as_sql()))
    }
}

/// Render a grouped aggregation
///
/// The aggregation must already be validated against the table's columns.
pub fn build_aggregate(table: &str, spec: &AggregationSpec<SqlPredicate>) -> Result<SqlStatement> {
    let mut selected = spec
        .group_by
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>>>()?;
    for (name, aggregate) in &spec.aggregations {
        selected.push(format!(
            "{} AS {}",
            aggregate_expression(aggregate)?,
            quote_identifier(name)?
        ));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        selected.join(", "),
        quote_identifier(table)?
    );
    let mut params = Vec::new();
    push_where(&mut sql, &mut params, spec.filter.as_ref());

    if !spec.group_by.is_empty() {
        let columns = spec
            .group_by
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" GROUP BY {}", columns.join(", ")));
    }

    if !spec.having.is_empty() {
        let clauses = spec
            .having
            .iter()
            .map(|c| having_clause(c, spec, &mut params))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&format!(" HAVING {}", clauses.join(" AND ")));
    }

    push_order(&mut sql, &spec.order_by)?;
    push_page(&mut sql, spec.page);
    Ok(SqlStatement { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Operator;
    use crate::core::value::record;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("_user_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2users").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("na\"me").is_err());
    }

    #[test]
    fn test_select_builder() {
        let filter = SqlPredicate::new("age > ?", vec![18.into()]);
        let order = [OrderBy::desc("age")];
        let stmt = SelectBuilder::new("users")
            .columns(&["id", "name"])
            .filter(Some(&filter))
            .order_by(&order)
            .page(Page::first(10).offset(20))
            .build()
            .unwrap();

        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE (age > ?) ORDER BY \"age\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(stmt.params, vec![FieldValue::Int(18)]);
    }

    #[test]
    fn test_offset_without_limit() {
        let stmt = SelectBuilder::new("t")
            .page(Page::all().offset(5))
            .build()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM \"t\" LIMIT -1 OFFSET 5");
    }

    #[test]
    fn test_count_and_exists() {
        let filter = SqlPredicate::eq("name", "Alice").unwrap();
        let builder = SelectBuilder::new("users").filter(Some(&filter));
        assert_eq!(
            builder.build_count().unwrap().sql,
            "SELECT COUNT(*) FROM \"users\" WHERE (\"name\" = ?)"
        );
        assert_eq!(
            builder.build_exists().unwrap().sql,
            "SELECT EXISTS(SELECT 1 FROM \"users\" WHERE (\"name\" = ?) LIMIT 1)"
        );
    }

    #[test]
    fn test_insert_and_upsert() {
        let row = record([("name", FieldValue::from("Alice")), ("age", 30.into())]);
        let stmt = build_insert("users", &row, Conflict::Abort).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"age\", \"name\") VALUES (?, ?)"
        );
        assert_eq!(stmt.params, vec![FieldValue::Int(30), FieldValue::from("Alice")]);

        let stmt = build_insert("users", &row, Conflict::Replace).unwrap();
        assert!(stmt.sql.starts_with("INSERT OR REPLACE INTO"));

        let bad = record([("bad column", 1)]);
        assert!(build_insert("users", &bad, Conflict::Abort).is_err());
    }

    #[test]
    fn test_update_binds_changes_before_filter() {
        let filter = SqlPredicate::new("id = ?", vec![7.into()]);
        let stmt = build_update("users", &record([("age", 31)]), &filter).unwrap();
        assert_eq!(stmt.sql, "UPDATE \"users\" SET \"age\" = ? WHERE (id = ?)");
        assert_eq!(stmt.params, vec![FieldValue::Int(31), FieldValue::Int(7)]);

        assert!(build_update("users", &Record::new(), &filter).is_err());
    }

    #[test]
    fn test_grouped_aggregate() {
        let spec = AggregationSpec::new()
            .group_by(["dept"])
            .aggregate("avg_age", Aggregate::Avg("age".into()))
            .aggregate("people", Aggregate::Count)
            .filter(SqlPredicate::new("age > ?", vec![1.into()]))
            .having(Comparison::new("people", Operator::Ge, 2))
            .order_by(OrderBy::asc("dept"))
            .limit(5);

        let stmt = build_aggregate("staff", &spec).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"dept\", AVG(\"age\") AS \"avg_age\", COUNT(*) AS \"people\" FROM \"staff\" \
             WHERE (age > ?) GROUP BY \"dept\" HAVING COUNT(*) >= ? ORDER BY \"dept\" ASC LIMIT 5"
        );
        assert_eq!(stmt.params, vec![FieldValue::Int(1), FieldValue::Int(2)]);
    }

    #[test]
    fn test_predicate_and() {
        let p = SqlPredicate::eq("a", 1)
            .unwrap()
            .and(SqlPredicate::new("b < ?", vec![2.into()]));
        assert_eq!(p.clause, "(\"a\" = ?) AND (b < ?)");
        assert_eq!(p.params.len(), 2);
    }
}
