/// Declarative views for the in-memory store.
///
/// A view says what a SQL text returns in terms the store can evaluate:
/// the rows of one table that pass every column comparison, optionally
/// ordered by one column. A comparison value may name a bound parameter,
/// `"$1"` for a positional one or `"${name}"` for a named one.
///
/// ```ignore
/// // SELECT * FROM t WHERE id < $1 ORDER BY id
/// let view = View::scan("t").filter(Filter::lt("id", "$1")).order_by("id");
/// ```
use crate::types::{Params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => ordering.is_ne(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Lte => ordering.is_le(),
            CompareOp::Gt => ordering.is_gt(),
            CompareOp::Gte => ordering.is_ge(),
        }
    }
}

/// `column <op> value`.
///
/// Like SQL, a comparison involving a missing column, a null or values of
/// different types is never true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub value: JsonValue,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<JsonValue>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(column, CompareOp::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(column, CompareOp::Lt, value)
    }

    pub fn lte(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(column, CompareOp::Lte, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(column, CompareOp::Gt, value)
    }

    pub fn gte(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::new(column, CompareOp::Gte, value)
    }

    /// Whether `row` passes, with parameter references bound from `params`.
    pub fn matches(&self, row: &Row, params: &Params) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        compare_scalars(actual, resolve(&self.value, params)).is_some_and(|o| self.op.holds(o))
    }
}

/// Ordering of a view's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

/// What a query returns, evaluated against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub table: String,
    /// Conditions combined with AND.
    #[serde(default, rename = "where")]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
}

impl View {
    /// Every row of `table`, in table order.
    pub fn scan(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn matches(&self, row: &Row, params: &Params) -> bool {
        self.filters.iter().all(|f| f.matches(row, params))
    }

    /// Evaluate the view over a table's rows.
    pub fn evaluate<'a, I>(&self, rows: I, params: &Params) -> Vec<Row>
    where
        I: IntoIterator<Item = &'a Row>,
    {
        let mut result: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.matches(row, params))
            .cloned()
            .collect();

        if let Some(order) = &self.order_by {
            // Nulls sort last ascending and first descending, as in Postgres.
            result.sort_by(|a, b| {
                let ordering = match (non_null(a, &order.column), non_null(b, &order.column)) {
                    (Some(x), Some(y)) => compare_scalars(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        result
    }
}

fn non_null<'a>(row: &'a Row, column: &str) -> Option<&'a JsonValue> {
    row.get(column).filter(|v| !v.is_null())
}

/// Bind `"$N"` and `"${name}"`; anything else is a literal. Unbound
/// references are null.
fn resolve<'a>(value: &'a JsonValue, params: &'a Params) -> &'a JsonValue {
    static NULL: JsonValue = JsonValue::Null;

    let Some(reference) = value.as_str().and_then(|s| s.strip_prefix('$')) else {
        return value;
    };
    if let Some(name) = reference.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        return params.named(name).unwrap_or(&NULL);
    }
    match reference.parse::<usize>() {
        Ok(index) => params.nth(index).unwrap_or(&NULL),
        Err(_) => value,
    }
}

fn compare_scalars(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
