//! Storage connection trait.
//!
//! A [`Connection`] executes the statements persisters produce and brackets
//! them in a transaction. It is owned by exactly one unit of work.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for proper cancellation; the unit of work propagates every `Outcome` arm
//! unchanged.

use crate::error::Error;
use crate::persister::Statement;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Executes persister statements against the transactional resource.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, &persister.load_statement(&Value::BigInt(1))).await;
/// conn.begin(&cx).await;
/// conn.execute(&cx, &persister.delete_statement(&spec)).await;
/// conn.commit(&cx).await;
/// ```
pub trait Connection: Send + Sync {
    /// Execute a SELECT and return all rows.
    fn query(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a SELECT and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Execute a write and return the number of rows affected.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT whose identifier is generated by storage and return it.
    fn insert(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;

    /// Execute same-shape writes as one batch.
    ///
    /// Returns the rows affected by each statement. A driver that cannot run
    /// a particular batch reports a [`crate::error::StorageErrorKind::Batch`]
    /// error, after which the unit of work executes the statements one by one.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send;

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Check if the connection is still usable.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Check if the connection is still valid (alias for ping that returns bool).
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }
}
