/// Query execution against the backing store.
use crate::error::LiveResult;
use crate::types::{Params, Row};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs parameterized queries and returns rows in result order.
///
/// Failures should be reported as [`LiveError::StoreError`](crate::LiveError::StoreError).
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute `sql` with `params`.
    async fn execute(&self, sql: &str, params: &Params) -> LiveResult<Vec<Row>>;
}

#[async_trait]
impl<T: QueryExecutor + ?Sized> QueryExecutor for Arc<T> {
    async fn execute(&self, sql: &str, params: &Params) -> LiveResult<Vec<Row>> {
        (**self).execute(sql, params).await
    }
}
