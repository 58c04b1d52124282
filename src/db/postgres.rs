//! tokio-postgres / deadpool-postgres implementation of the driver seams.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use futures::{pin_mut, TryStreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::types::Type;
use tokio_postgres::{
    Client, NoTls, Portal, SimpleQueryMessage, SimpleQueryRow, Socket, Transaction,
};

use super::connection::{build_tls_connector, create_client, ConnectionConfig, SslMode};
use super::driver::{Connection, ConnectionPool, Cursor, Driver};
use super::params::{as_sql_refs, SqlParam};
use super::query::{
    command_tag, row_to_json, simple_row_to_json, split_statements, StatementResult,
    StructuredError,
};
use crate::error::{Error, Result};

/// PostgreSQL driver backed by deadpool pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDriver;

#[async_trait]
impl Driver for PgDriver {
    fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionPool>> {
        let pool = match config.ssl_mode {
            SslMode::Disable => build_pool(config, NoTls)?,
            _ => build_pool(config, build_tls_connector(config)?)?,
        };
        tracing::info!(
            "Created pool for {} (max {})",
            config.display_string(),
            config.pool_max
        );
        Ok(Arc::new(PgPool::new(pool, config.idle_timeout())))
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let client = create_client(config).await?;
        Ok(Box::new(PgConnection {
            handle: ClientHandle::Standalone(client),
        }))
    }
}

fn build_pool<T>(config: &ConnectionConfig, tls: T) -> Result<Pool>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let mut manager_config = ManagerConfig::default();
    manager_config.recycling_method = RecyclingMethod::Fast;
    let manager = Manager::from_config(config.pg_config(), tls, manager_config);

    Pool::builder(manager)
        .max_size(config.pool_max.max(1))
        .wait_timeout(config.connect_timeout())
        .create_timeout(config.connect_timeout())
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Connection(format!("Failed to create pool: {}", e)))
}

pub struct PgPool {
    pool: Pool,
    reaper: Option<JoinHandle<()>>,
}

impl PgPool {
    fn new(pool: Pool, idle_timeout: Option<Duration>) -> Self {
        let reaper = idle_timeout.and_then(|idle| {
            let handle = tokio::runtime::Handle::try_current().ok()?;
            Some(handle.spawn(reap_idle(pool.clone(), idle)))
        });
        Self { pool, reaper }
    }
}

/// Close pooled connections that sat unused for longer than `idle`.
async fn reap_idle(pool: Pool, idle: Duration) {
    let mut interval = tokio::time::interval(idle);
    interval.tick().await;
    loop {
        interval.tick().await;
        if pool.is_closed() {
            break;
        }
        let before = pool.status().size;
        pool.retain(|_, metrics| metrics.last_used() < idle);
        let closed = before.saturating_sub(pool.status().size);
        if closed > 0 {
            tracing::debug!("Closed {} idle connection(s)", closed);
        }
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let object = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Connection(format!("Failed to acquire connection: {}", e)))?;
        Ok(Box::new(PgConnection {
            handle: ClientHandle::Pooled(object),
        }))
    }

    fn total_count(&self) -> usize {
        self.pool.status().size
    }

    async fn end(&self) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
        self.pool.close();
    }
}

enum ClientHandle {
    Pooled(Object),
    Standalone(Client),
}

impl ClientHandle {
    fn client(&self) -> &Client {
        match self {
            ClientHandle::Pooled(object) => object,
            ClientHandle::Standalone(client) => client,
        }
    }

    fn client_mut(&mut self) -> &mut Client {
        match self {
            ClientHandle::Pooled(object) => object,
            ClientHandle::Standalone(client) => client,
        }
    }

    /// Pooled clients go back to the pool unless discarded; standalone ones
    /// are always closed.
    fn release(self, discard: bool) {
        match self {
            ClientHandle::Pooled(object) if discard => drop(Object::take(object)),
            ClientHandle::Pooled(object) => drop(object),
            ClientHandle::Standalone(client) => drop(client),
        }
    }
}

pub struct PgConnection {
    handle: ClientHandle,
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&mut self, text: &str, values: &[Value]) -> Result<Vec<StatementResult>> {
        let client = self.handle.client();

        // Several statements can only go through the simple protocol, which
        // takes no parameters.
        if values.is_empty() {
            let statements = split_statements(text);
            if statements.len() > 1 {
                return simple_batch(client, text, &statements).await;
            }
        }

        let params = SqlParam::from_values(values);
        let refs = as_sql_refs(&params);
        let query_error =
            |e: tokio_postgres::Error| Error::Query(StructuredError::from_pg_error(&e, text));

        let stream = client.query_raw(text, refs).await.map_err(query_error)?;
        pin_mut!(stream);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await.map_err(query_error)? {
            rows.push(row_to_json(&row));
        }
        let row_count = stream.rows_affected().unwrap_or(rows.len() as u64);

        Ok(vec![StatementResult {
            command: command_tag(text),
            row_count,
            rows,
        }])
    }

    fn open_cursor(self: Box<Self>, text: String, values: Vec<Value>) -> Box<dyn Cursor> {
        let (commands, receiver) = mpsc::channel(1);
        tokio::spawn(drive_portal(self.handle, text, values, receiver));
        Box::new(PgCursor {
            commands: Some(commands),
        })
    }

    async fn release(self: Box<Self>, discard: bool) {
        self.handle.release(discard);
    }
}

/// Run several statements in one simple-protocol round trip. Rows arrive as
/// text, so every statement that returned rows is prepared afterwards to
/// recover its column types.
async fn simple_batch(
    client: &Client,
    text: &str,
    statements: &[&str],
) -> Result<Vec<StatementResult>> {
    let messages = client
        .simple_query(text)
        .await
        .map_err(|e| Error::Query(StructuredError::from_pg_error(&e, text)))?;

    let mut completed = Vec::with_capacity(statements.len());
    let mut rows = Vec::new();
    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => rows.push(row),
            SimpleQueryMessage::CommandComplete(count) => {
                completed.push((std::mem::take(&mut rows), count));
            }
            _ => {}
        }
    }

    let mut results = Vec::with_capacity(completed.len());
    for (i, (rows, row_count)) in completed.into_iter().enumerate() {
        let statement = statements.get(i).copied().unwrap_or_default();
        let types = match rows.first() {
            Some(row) => column_types(client, statement, row).await,
            None => None,
        };
        results.push(StatementResult {
            command: command_tag(statement),
            row_count,
            rows: rows
                .iter()
                .map(|row| simple_row_to_json(row, types.as_deref()))
                .collect(),
        });
    }
    Ok(results)
}

/// Column types of `statement`, if preparing it describes the same columns
/// as `row`.
async fn column_types(
    client: &Client,
    statement: &str,
    row: &SimpleQueryRow,
) -> Option<Vec<Type>> {
    let prepared = match client.prepare(statement).await {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::debug!("Column types unavailable, keeping text values: {}", e);
            return None;
        }
    };
    let columns = prepared.columns();
    let aligned = columns.len() == row.columns().len()
        && columns
            .iter()
            .zip(row.columns())
            .all(|(column, simple)| column.name() == simple.name());
    aligned.then(|| columns.iter().map(|c| c.type_().clone()).collect())
}

enum PortalCommand {
    Read {
        max_rows: i32,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
    Close {
        discard: bool,
        done: oneshot::Sender<()>,
    },
}

/// Handle to a portal owned by a background task.
///
/// The task holds the connection, the transaction and the portal; the
/// handle forwards reads and the final close over a channel.
pub struct PgCursor {
    commands: Option<mpsc::Sender<PortalCommand>>,
}

fn cursor_closed() -> Error {
    Error::Cursor(StructuredError::from_string("Cursor is closed".to_string()))
}

#[async_trait]
impl Cursor for PgCursor {
    async fn read(&mut self, max_rows: usize) -> Result<Vec<Value>> {
        let commands = self.commands.as_ref().ok_or_else(cursor_closed)?;
        let (reply, response) = oneshot::channel();
        let max_rows = i32::try_from(max_rows.max(1)).unwrap_or(i32::MAX);
        commands
            .send(PortalCommand::Read { max_rows, reply })
            .await
            .map_err(|_| cursor_closed())?;
        response.await.map_err(|_| cursor_closed())?
    }

    async fn close(&mut self, discard: bool) {
        if let Some(commands) = self.commands.take() {
            let (done, finished) = oneshot::channel();
            if commands
                .send(PortalCommand::Close { discard, done })
                .await
                .is_ok()
            {
                let _ = finished.await;
            }
        }
    }
}

async fn open_portal<'a>(
    client: &'a mut Client,
    text: &str,
    params: &[SqlParam],
) -> Result<(Transaction<'a>, Portal)> {
    let cursor_error =
        |e: tokio_postgres::Error| Error::Cursor(StructuredError::from_pg_error(&e, text));
    let transaction = client.transaction().await.map_err(cursor_error)?;
    let portal = transaction
        .bind(text, &as_sql_refs(params))
        .await
        .map_err(cursor_error)?;
    Ok((transaction, portal))
}

async fn drive_portal(
    mut handle: ClientHandle,
    text: String,
    values: Vec<Value>,
    mut commands: mpsc::Receiver<PortalCommand>,
) {
    let params = SqlParam::from_values(&values);
    let mut discard = false;
    let mut done = None;
    {
        let opened = open_portal(handle.client_mut(), &text, &params).await;
        if let Err(e) = &opened {
            tracing::debug!("Cursor open failed: {}", e);
            discard = true;
        }

        while let Some(command) = commands.recv().await {
            match command {
                PortalCommand::Read { max_rows, reply } => {
                    let page = match &opened {
                        Ok((transaction, portal)) => transaction
                            .query_portal(portal, max_rows)
                            .await
                            .map(|rows| rows.iter().map(row_to_json).collect())
                            .map_err(|e| {
                                Error::Cursor(StructuredError::from_pg_error(&e, &text))
                            }),
                        Err(e) => Err(e.clone()),
                    };
                    let _ = reply.send(page);
                }
                PortalCommand::Close {
                    discard: requested,
                    done: finished,
                } => {
                    discard |= requested;
                    done = Some(finished);
                    break;
                }
            }
        }

        if let Ok((transaction, portal)) = opened {
            drop(portal);
            if let Err(e) = transaction.rollback().await {
                tracing::warn!("Failed to close cursor transaction: {}", e);
                discard = true;
            }
        }
    }

    handle.release(discard);
    if let Some(done) = done {
        let _ = done.send(());
    }
}
