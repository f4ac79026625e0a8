/// Table reference extraction.
///
/// The registry needs to know which tables a query reads so the change
/// notifier can watch them. [`SqlTableExtractor`] parses the query with
/// `sqlparser` and collects every relation it reads, including those inside
/// subqueries, set operations and common table expressions. Names declared
/// by `WITH` and table functions such as `generate_series` are skipped.
use crate::error::{LiveError, LiveResult};
use crate::types::Params;
use async_trait::async_trait;
use regex::Regex;
use sqlparser::ast::{Ident, ObjectName, ObjectNamePart, Query, TableFactor, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::LazyLock;

/// Named placeholders (`${name}`, `$[name]`, `$(name)`, `$<name>`, `$/name/`)
/// that a Postgres parser does not accept.
static NAMED_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{[\w.:]+\}|\[[\w.:]+\]|\([\w.:]+\)|<[\w.:]+>|/[\w.:]+/)")
        .expect("valid named placeholder regex")
});

/// Finds the tables a query reads.
#[async_trait]
pub trait TableExtractor: Send + Sync {
    /// Tables read by `query` when run with `params`.
    async fn tables(&self, query: &str, params: &Params) -> LiveResult<BTreeSet<String>>;
}

/// Extractor for Postgres SQL text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlTableExtractor;

impl SqlTableExtractor {
    /// Create an extractor.
    pub fn new() -> Self {
        Self
    }

    /// Extract table names without going through the async trait.
    pub fn extract(&self, query: &str) -> LiveResult<BTreeSet<String>> {
        let sql = NAMED_PLACEHOLDER.replace_all(query, "$$1");
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, &sql)
            .map_err(|e| LiveError::invalid(format!("failed to parse query: {}", e)))?;

        let mut relations = Relations::default();
        let _ = statements.visit(&mut relations);

        Ok(relations
            .tables
            .into_iter()
            .filter(|name| !relations.ctes.contains(name))
            .collect())
    }
}

#[async_trait]
impl TableExtractor for SqlTableExtractor {
    async fn tables(&self, query: &str, _params: &Params) -> LiveResult<BTreeSet<String>> {
        let tables = self.extract(query)?;
        if tables.is_empty() {
            return Err(LiveError::invalid(format!(
                "query reads no tables: {}",
                query.trim()
            )));
        }
        Ok(tables)
    }
}

#[derive(Default)]
struct Relations {
    tables: BTreeSet<String>,
    ctes: BTreeSet<String>,
}

impl Visitor for Relations {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(ident_name(&cte.alias.name));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        if let TableFactor::Table {
            name, args: None, ..
        } = factor
        {
            self.tables.insert(object_name(name));
        }
        ControlFlow::Continue(())
    }
}

/// Unquoted identifiers fold to lower case the way Postgres folds them.
fn ident_name(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .filter_map(|part| match part {
            ObjectNamePart::Identifier(ident) => Some(ident_name(ident)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(sql: &str) -> Vec<String> {
        SqlTableExtractor::new()
            .extract(sql)
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_simple_select() {
        assert_eq!(extract("SELECT * FROM t WHERE id < $1"), vec!["t"]);
        assert_eq!(extract("select * from Test where id < $[id]"), vec!["test"]);
    }

    #[test]
    fn test_joins_and_lists() {
        let sql = "SELECT u.name, o.total
                   FROM users u
                   LEFT JOIN orders AS o ON o.user_id = u.id
                   JOIN public.items i USING (id)";
        assert_eq!(
            extract(sql),
            vec!["orders", "public.items", "users"]
        );
        assert_eq!(extract("SELECT * FROM a, b AS x, \"Mixed\" WHERE 1=1"), vec!["Mixed", "a", "b"]);
    }

    #[test]
    fn test_skips_ctes_subqueries_and_functions() {
        let sql = "WITH recent AS (SELECT * FROM events WHERE ts > now()),
                        counts (n) AS (SELECT count(*) FROM recent)
                   SELECT EXTRACT(year FROM r.ts), s.x
                   FROM recent r, generate_series(1, 3) g
                   JOIN (SELECT * FROM sources) s ON true";
        assert_eq!(extract(sql), vec!["events", "sources"]);
    }

    #[test]
    fn test_ignores_literals_and_comments() {
        let sql = "SELECT 'from fake' AS s -- FROM commented
                   /* JOIN hidden */ FROM real_table";
        assert_eq!(extract(sql), vec!["real_table"]);
    }

    #[tokio::test]
    async fn test_no_tables_is_invalid() {
        let err = SqlTableExtractor::new()
            .tables("SELECT 1", &Params::None)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::InvalidArgument { .. }));
    }

    #[test]
    fn test_unterminated_literal() {
        assert!(SqlTableExtractor::new().extract("SELECT 'oops FROM t").is_err());
    }

    #[test]
    fn test_set_operations_and_where_subqueries() {
        let sql = "SELECT id FROM a WHERE id IN (SELECT a_id FROM b)
                   UNION ALL
                   SELECT id FROM c WHERE $1 > 0";
        assert_eq!(extract(sql), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_named_placeholders() {
        let sql = "SELECT * FROM users WHERE age >= ${min_age} AND name <> $[name] LIMIT $(n)";
        assert_eq!(extract(sql), vec!["users"]);
    }
}
