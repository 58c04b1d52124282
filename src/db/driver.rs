//! Driver seams.
//!
//! The executor only talks to PostgreSQL through these traits. The
//! tokio-postgres implementation lives in [`crate::db::postgres`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::connection::ConnectionConfig;
use super::query::StatementResult;
use crate::error::Result;

/// Creates pools and standalone connections.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Build a pool for `config`. Connections are opened lazily on acquire.
    fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionPool>>;

    /// Open a connection that is closed, never pooled, on release.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Check out a connection, opening one if the pool has room.
    async fn acquire(&self) -> Result<Box<dyn Connection>>;

    /// Live connections currently owned by the pool.
    fn total_count(&self) -> usize;

    /// Close the pool. Idle connections are closed now, checked-out ones when
    /// they come back.
    async fn end(&self);
}

/// One acquired connection.
#[async_trait]
pub trait Connection: Send {
    /// Run `text` in one round trip. A multi-statement text yields one
    /// result per statement.
    async fn query(&mut self, text: &str, values: &[Value]) -> Result<Vec<StatementResult>>;

    /// Hand the connection to a server-side cursor over `text`.
    ///
    /// Open failures surface on the first [`Cursor::read`]. The cursor owns
    /// the connection from here on and releases it on [`Cursor::close`].
    fn open_cursor(self: Box<Self>, text: String, values: Vec<Value>) -> Box<dyn Cursor>;

    /// Give the connection back. With `discard` set the connection is closed
    /// instead of being returned to its pool.
    async fn release(self: Box<Self>, discard: bool);
}

#[async_trait]
pub trait Cursor: Send {
    /// Fetch up to `max_rows` further rows.
    async fn read(&mut self, max_rows: usize) -> Result<Vec<Value>>;

    /// Close the cursor and release its connection. Safe to call repeatedly.
    async fn close(&mut self, discard: bool);
}
