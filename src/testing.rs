//! Scripted fakes for the driver seams and the host runtime, shared by the
//! unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::db::{
    command_tag, Connection, ConnectionConfig, ConnectionPool, Cursor, Driver,
    StatementResult, StructuredError,
};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::node::NodeOutput;
use crate::status::NodeStatus;
use crate::tick::{TickSink, Topology};

#[derive(Default)]
struct DbState {
    rows: Vec<Value>,
    results: Option<Vec<StatementResult>>,
    fail_query: Option<Error>,
    fail_acquire: Option<Error>,
    fail_read_at: Option<usize>,
    acquired: usize,
    releases: usize,
    discards: usize,
    cursor_closes: usize,
    reads: usize,
    queries: Vec<(String, Vec<Value>)>,
}

/// Shared backing store for every connection the fakes hand out.
#[derive(Default)]
pub struct FakeDb {
    state: Mutex<DbState>,
}

impl FakeDb {
    fn with<R>(&self, f: impl FnOnce(&mut DbState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        self.with(|s| s.rows = rows);
    }

    pub fn set_results(&self, results: Vec<StatementResult>) {
        self.with(|s| s.results = Some(results));
    }

    pub fn fail_query(&self, err: Error) {
        self.with(|s| s.fail_query = Some(err));
    }

    pub fn fail_acquire(&self, err: Error) {
        self.with(|s| s.fail_acquire = Some(err));
    }

    /// Fail the `n`th cursor read (0-based).
    pub fn fail_read_at(&self, n: usize) {
        self.with(|s| s.fail_read_at = Some(n));
    }

    pub fn acquired(&self) -> usize {
        self.with(|s| s.acquired)
    }

    pub fn releases(&self) -> usize {
        self.with(|s| s.releases)
    }

    pub fn discards(&self) -> usize {
        self.with(|s| s.discards)
    }

    pub fn cursor_closes(&self) -> usize {
        self.with(|s| s.cursor_closes)
    }

    pub fn reads(&self) -> usize {
        self.with(|s| s.reads)
    }

    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.with(|s| s.queries.clone())
    }

    fn record(&self, text: &str, values: &[Value]) {
        self.with(|s| s.queries.push((text.to_string(), values.to_vec())));
    }

    fn release(&self, discard: bool) {
        self.with(|s| {
            s.releases += 1;
            if discard {
                s.discards += 1;
            }
        });
    }
}

pub struct FakePool {
    db: Arc<FakeDb>,
    config: ConnectionConfig,
    end_calls: AtomicUsize,
    total: AtomicUsize,
}

impl FakePool {
    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn set_total_count(&self, n: usize) {
        self.total.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionPool for FakePool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        if let Some(err) = self.db.with(|s| s.fail_acquire.clone()) {
            return Err(err);
        }
        self.db.with(|s| s.acquired += 1);
        Ok(Box::new(FakeConnection {
            db: self.db.clone(),
        }))
    }

    fn total_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    async fn end(&self) {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeDriver {
    db: Arc<FakeDb>,
    pools: Mutex<Vec<Arc<FakePool>>>,
    fail_pool: Mutex<Option<Error>>,
    connects: Mutex<Vec<ConnectionConfig>>,
}

impl FakeDriver {
    pub fn db(&self) -> &Arc<FakeDb> {
        &self.db
    }

    pub fn pools_created(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    pub fn pool(&self, i: usize) -> Arc<FakePool> {
        self.pools.lock().unwrap()[i].clone()
    }

    pub fn fail_pool_creation(&self, err: Error) {
        *self.fail_pool.lock().unwrap() = Some(err);
    }

    /// Configs of the standalone connections opened so far.
    pub fn connects(&self) -> Vec<ConnectionConfig> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionPool>> {
        if let Some(err) = self.fail_pool.lock().unwrap().clone() {
            return Err(err);
        }
        let pool = Arc::new(FakePool {
            db: self.db.clone(),
            config: config.clone(),
            end_calls: AtomicUsize::new(0),
            total: AtomicUsize::new(config.pool_max),
        });
        self.pools.lock().unwrap().push(pool.clone());
        Ok(pool)
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if let Some(err) = self.db.with(|s| s.fail_acquire.clone()) {
            return Err(err);
        }
        self.connects.lock().unwrap().push(config.clone());
        self.db.with(|s| s.acquired += 1);
        Ok(Box::new(FakeConnection {
            db: self.db.clone(),
        }))
    }
}

pub struct FakeConnection {
    db: Arc<FakeDb>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&mut self, text: &str, values: &[Value]) -> Result<Vec<StatementResult>> {
        self.db.record(text, values);
        self.db.with(|s| {
            if let Some(err) = s.fail_query.clone() {
                return Err(err);
            }
            if let Some(results) = s.results.clone() {
                return Ok(results);
            }
            Ok(vec![StatementResult {
                command: command_tag(text),
                row_count: s.rows.len() as u64,
                rows: s.rows.clone(),
            }])
        })
    }

    fn open_cursor(self: Box<Self>, text: String, values: Vec<Value>) -> Box<dyn Cursor> {
        self.db.record(&text, &values);
        Box::new(FakeCursor {
            db: self.db,
            offset: 0,
            closed: false,
        })
    }

    async fn release(self: Box<Self>, discard: bool) {
        self.db.release(discard);
    }
}

pub struct FakeCursor {
    db: Arc<FakeDb>,
    offset: usize,
    closed: bool,
}

#[async_trait]
impl Cursor for FakeCursor {
    async fn read(&mut self, max_rows: usize) -> Result<Vec<Value>> {
        let offset = self.offset;
        let page = self.db.with(|s| {
            let n = s.reads;
            s.reads += 1;
            if s.fail_read_at == Some(n) {
                return Err(Error::Cursor(StructuredError::from_string(
                    "cursor read failed".into(),
                )));
            }
            let end = (offset + max_rows).min(s.rows.len());
            Ok(s.rows[offset.min(end)..end].to_vec())
        })?;
        self.offset += page.len();
        Ok(page)
    }

    async fn close(&mut self, discard: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.db.with(|s| s.cursor_closes += 1);
        self.db.release(discard);
    }
}

/// Captures everything a node emits.
#[derive(Default)]
pub struct RecordingOutput {
    sent: Mutex<Vec<Message>>,
    errors: Mutex<Vec<String>>,
    statuses: Mutex<Vec<NodeStatus>>,
}

impl RecordingOutput {
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl NodeOutput for RecordingOutput {
    fn send(&self, msg: Message) {
        self.sent.lock().unwrap().push(msg);
    }

    fn error(&self, err: &Error, _msg: &Message) {
        self.errors.lock().unwrap().push(err.to_string());
    }

    fn status(&self, status: NodeStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

#[derive(Default)]
pub struct RecordingTick {
    count: AtomicUsize,
}

impl RecordingTick {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl TickSink for RecordingTick {
    fn tick(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Topology with at most one tick-consuming upstream neighbour.
#[derive(Default)]
pub struct FakeTopology {
    pub upstream: Option<Arc<RecordingTick>>,
    pub lookups: AtomicUsize,
}

impl FakeTopology {
    pub fn with_upstream(tick: Arc<RecordingTick>) -> Self {
        Self {
            upstream: Some(tick),
            lookups: AtomicUsize::new(0),
        }
    }
}

impl Topology for FakeTopology {
    fn tick_consumer_upstream(&self, _node_id: &str) -> Option<Arc<dyn TickSink>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.upstream
            .clone()
            .map(|tick| tick as Arc<dyn TickSink>)
    }
}
