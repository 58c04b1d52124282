//! Minimal in-process host: node inboxes, static wiring and topology lookup.
//!
//! Each node owns an unbounded inbox. Wiring is fixed when the graph is
//! built; a node's output delivers a clone of every message to each wired
//! target.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::message::Message;
use crate::node::{NodeOutput, QueryNode};
use crate::status::NodeStatus;
use crate::tick::{TickSink, Topology};

/// Sending side of a node's inbox.
#[derive(Debug, Clone)]
pub struct NodeInbox {
    id: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl NodeInbox {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue `msg` for the node. Returns false once the node has stopped.
    pub fn deliver(&self, msg: Message) -> bool {
        self.sender.send(msg).is_ok()
    }
}

impl TickSink for NodeInbox {
    fn tick(&self) {
        if !self.deliver(Message::tick()) {
            tracing::debug!("Tick to stopped node {} dropped", self.id);
        }
    }
}

struct NodeEntry {
    inbox: Arc<NodeInbox>,
    tick_consumer: bool,
    wires: Vec<String>,
}

#[derive(Default)]
pub struct GraphBuilder {
    nodes: BTreeMap<String, NodeEntry>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a node wired to `wires`. Returns the node's inbox receiver.
    pub fn node(
        &mut self,
        id: &str,
        tick_consumer: bool,
        wires: &[&str],
    ) -> mpsc::UnboundedReceiver<Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.nodes.insert(
            id.to_string(),
            NodeEntry {
                inbox: Arc::new(NodeInbox {
                    id: id.to_string(),
                    sender,
                }),
                tick_consumer,
                wires: wires.iter().map(|w| w.to_string()).collect(),
            },
        );
        receiver
    }

    pub fn build(self) -> Arc<Graph> {
        for (id, entry) in &self.nodes {
            for target in &entry.wires {
                if !self.nodes.contains_key(target) {
                    tracing::warn!("Node {} is wired to unknown node {}", id, target);
                }
            }
        }
        Arc::new(Graph { nodes: self.nodes })
    }
}

pub struct Graph {
    nodes: BTreeMap<String, NodeEntry>,
}

impl Graph {
    pub fn inbox(&self, id: &str) -> Option<Arc<NodeInbox>> {
        self.nodes.get(id).map(|entry| entry.inbox.clone())
    }

    /// Inboxes of the nodes `id` is wired to.
    pub fn downstream(&self, id: &str) -> Vec<Arc<NodeInbox>> {
        self.nodes
            .get(id)
            .map(|entry| {
                entry
                    .wires
                    .iter()
                    .filter_map(|target| self.inbox(target))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Output that delivers `id`'s messages along its wires.
    pub fn output(self: &Arc<Self>, id: &str) -> Arc<WiredOutput> {
        Arc::new(WiredOutput {
            id: id.to_string(),
            graph: self.clone(),
        })
    }
}

impl Topology for Graph {
    fn tick_consumer_upstream(&self, node_id: &str) -> Option<Arc<dyn TickSink>> {
        self.nodes
            .values()
            .find(|entry| entry.tick_consumer && entry.wires.iter().any(|w| w == node_id))
            .map(|entry| entry.inbox.clone() as Arc<dyn TickSink>)
    }
}

pub struct WiredOutput {
    id: String,
    graph: Arc<Graph>,
}

impl NodeOutput for WiredOutput {
    fn send(&self, msg: Message) {
        for target in self.graph.downstream(&self.id) {
            if !target.deliver(msg.clone()) {
                tracing::debug!("Node {} stopped, message from {} dropped", target.id(), self.id);
            }
        }
    }

    fn error(&self, err: &Error, _msg: &Message) {
        tracing::error!("[{}] {}", self.id, err);
    }

    fn status(&self, status: NodeStatus) {
        if status.is_cleared() {
            tracing::debug!("[{}] status cleared", self.id);
        } else {
            tracing::info!("[{}] {}", self.id, status);
        }
    }
}

/// A query node running on its own task.
pub struct NodeTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl NodeTask {
    /// Stop the node after the message it is handling, then close it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!("Node task ended abnormally: {}", e);
        }
    }
}

pub fn spawn_node(mut node: QueryNode, mut inbox: mpsc::UnboundedReceiver<Message>) -> NodeTask {
    let (shutdown, mut stop) = oneshot::channel();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => node.on_input(msg).await,
                    None => break,
                },
            }
        }
        node.close().await;
    });
    NodeTask { shutdown, handle }
}
