//! The query node: turns inbound messages into queries and emits their
//! results, one request at a time.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{ConnectionSettings, ContextStore, MemoryStore, NodeSettings};
use crate::cursor::Paginator;
use crate::db::{Connection, ConnectionOverride, Driver, StatementResult};
use crate::error::{Error, Result};
use crate::message::{Batch, CommandMeta, Message};
use crate::named::translate;
use crate::pool::PoolManager;
use crate::status::{NodeStatus, StatusTracker};
use crate::template::{MustacheRenderer, TemplateRenderer};
use crate::tick::{FlowState, TickState, Topology};

/// Where a node's output goes.
pub trait NodeOutput: Send + Sync {
    /// Deliver a message to every downstream neighbour.
    fn send(&self, msg: Message);

    /// Report a failed request to the host's error channel.
    fn error(&self, err: &Error, msg: &Message);

    fn status(&self, status: NodeStatus);
}

enum Resource {
    None,
    Connection(Box<dyn Connection>),
    Stream(Paginator),
}

impl Resource {
    async fn release(self, discard: bool) {
        match self {
            Resource::None => {}
            Resource::Connection(conn) => conn.release(discard).await,
            Resource::Stream(mut pages) => pages.close(discard).await,
        }
    }
}

/// The one in-flight request of a node.
struct ActiveRequest {
    parts_id: String,
    msg: Message,
    /// Query text as sent, for error reports.
    query: String,
    resource: Resource,
}

pub struct QueryNode {
    id: String,
    settings: NodeSettings,
    connection: ConnectionSettings,
    context: Arc<dyn ContextStore>,
    renderer: Arc<dyn TemplateRenderer>,
    topology: Arc<dyn Topology>,
    output: Arc<dyn NodeOutput>,
    pools: PoolManager,
    status: StatusTracker,
    flow: TickState,
    active: Option<ActiveRequest>,
}

impl QueryNode {
    pub fn new(
        id: impl Into<String>,
        settings: NodeSettings,
        connection: ConnectionSettings,
        driver: Arc<dyn Driver>,
        topology: Arc<dyn Topology>,
        output: Arc<dyn NodeOutput>,
    ) -> Self {
        let pools = PoolManager::new(driver);
        let status = StatusTracker::new(
            output.clone(),
            pools.gauge(),
            Duration::from_millis(settings.status_period_ms),
        );
        status.update(0, false);

        Self {
            id: id.into(),
            settings,
            connection,
            context: Arc::new(MemoryStore::default()),
            renderer: Arc::new(MustacheRenderer::new()),
            topology,
            output,
            pools,
            status,
            flow: TickState::new(),
            active: None,
        }
    }

    pub fn with_context(mut self, context: Arc<dyn ContextStore>) -> Self {
        self.context = context;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn downstream_ready(&self) -> bool {
        self.flow.downstream_ready()
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow.state()
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Handle one inbound message. Failures are reported through the node's
    /// output; the node stays usable afterwards.
    pub async fn on_input(&mut self, msg: Message) {
        self.flow.resolve_upstream(self.topology.as_ref(), &self.id);
        if msg.tick {
            if self.flow.on_tick() {
                self.pump().await;
            }
        } else {
            self.on_data(msg).await;
        }
    }

    async fn on_data(&mut self, mut msg: Message) {
        self.abandon().await;

        let parts_id = Uuid::new_v4().to_string();
        tracing::debug!("Node {}: request {} started", self.id, parts_id);
        self.status.update(1, false);
        self.flow.on_data();

        if self.settings.split {
            msg.complete = None;
        }
        self.active = Some(ActiveRequest {
            parts_id,
            msg,
            query: String::new(),
            resource: Resource::None,
        });

        if let Err(err) = self.start().await {
            self.fail(err).await;
        }
    }

    async fn start(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };

        let rendered = match active.msg.explicit_query() {
            Some(query) => query.to_string(),
            None => self
                .renderer
                .render(&self.settings.query, &active.msg.template_context())?,
        };
        active.query = rendered.clone();

        let (text, values) = if let Some(values) = active.msg.positional_params() {
            (rendered, values.to_vec())
        } else if let Some(named) = active.msg.named_params() {
            let translated = translate(&rendered, named)?;
            (translated.text, translated.values)
        } else {
            (rendered, Vec::new())
        };
        active.query = text.clone();

        let overrides = active.msg.pg_config.clone();
        let reconnect = active.msg.reconnect;
        let conn = self.acquire(overrides.as_ref(), reconnect).await?;

        if self.settings.split {
            let page_size = Paginator::page_size(self.settings.rows_per_msg);
            self.set_resource(Resource::Stream(Paginator::open(conn, text, values, page_size)));
            return self.fetch().await;
        }

        let mut conn = conn;
        let results = conn.query(&text, &values).await;
        self.set_resource(Resource::Connection(conn));
        let results = results?;
        self.finish_single(results).await;
        Ok(())
    }

    async fn acquire(
        &mut self,
        overrides: Option<&ConnectionOverride>,
        reconnect: bool,
    ) -> Result<Box<dyn Connection>> {
        let config = self.connection.resolve(self.context.as_ref())?;
        match overrides {
            Some(overrides) => {
                let config = overrides.apply(&config);
                tracing::debug!(
                    "Node {}: standalone connection to {}",
                    self.id,
                    config.display_string()
                );
                self.pools.driver().connect(&config).await
            }
            None => {
                let pool = self.pools.ensure_pool(&config, reconnect).await?;
                pool.acquire().await
            }
        }
    }

    fn set_resource(&mut self, resource: Resource) {
        if let Some(active) = self.active.as_mut() {
            active.resource = resource;
        }
    }

    /// Pull and emit the next page if downstream is ready.
    async fn pump(&mut self) {
        if let Err(err) = self.fetch().await {
            self.fail(err).await;
        }
    }

    async fn fetch(&mut self) -> Result<()> {
        if !self.flow.may_fetch() {
            return Ok(());
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let Resource::Stream(pages) = &mut active.resource else {
            return Ok(());
        };

        let page = pages.fetch_next().await?;
        let batch = Batch {
            correlation_id: active.parts_id.clone(),
            index: page.index,
            meta: CommandMeta {
                command: page.command,
                row_count: page.rows.len() as u64,
            },
            rows: page.rows,
            is_final: page.complete,
        };
        let out = batch.into_message(&active.msg, self.settings.rows_per_msg);

        if page.complete {
            self.finish(out).await;
        } else {
            self.flow.on_batch_emitted(false);
            self.output.send(out);
        }
        Ok(())
    }

    async fn finish_single(&mut self, results: Vec<StatementResult>) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let out = active.msg.clone().with_results(results);
        self.finish(out).await;
    }

    /// Release the request, emit its last message and tick upstream.
    async fn finish(&mut self, out: Message) {
        if let Some(active) = self.active.take() {
            active.resource.release(false).await;
            tracing::debug!("Node {}: request {} complete", self.id, active.parts_id);
        }
        self.status.update(-1, false);
        self.flow.on_batch_emitted(true);
        self.output.send(out);
        self.flow.on_settled();
    }

    async fn fail(&mut self, err: Error) {
        self.flow.on_error();
        let Some(active) = self.active.take() else {
            return;
        };
        active.resource.release(true).await;
        self.status.update(-1, true);

        tracing::error!(
            "Node {}: request {} failed ({}): {}",
            self.id,
            active.parts_id,
            err.kind(),
            match &err {
                Error::Query(e) | Error::Cursor(e) => e.display_full(),
                other => other.to_string(),
            }
        );

        let description = format!("{} {}", err, active.query);
        let out = active.msg.into_abort(&active.parts_id, description);
        self.output.error(&err, &out);
        self.output.send(out);
        self.flow.on_settled();
    }

    /// Drop a request that never drained, e.g. a stream parked on a
    /// downstream that stopped ticking.
    async fn abandon(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::warn!(
                "Node {}: abandoning request {} ({})",
                self.id,
                active.parts_id,
                self.flow.state()
            );
            active.resource.release(false).await;
            self.status.update(-1, false);
            self.flow.on_abandoned();
        }
    }

    /// Release any in-flight request, end the pool and clear the status.
    pub async fn close(&mut self) {
        self.abandon().await;
        self.pools.end().await;
        self.status.clear();
        tracing::debug!("Node {}: closed", self.id);
    }
}
