use anyhow::{Context, Result};
use clap::Parser;
use pgflow::config::{NodeConfigFile, NodeSettings};
use pgflow::db::PgDriver;
use pgflow::graph::{spawn_node, GraphBuilder};
use pgflow::message::Message;
use pgflow::node::QueryNode;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

/// Run a PostgreSQL query node over newline-delimited JSON messages.
///
/// Each stdin line is one inbound message; every outbound message is printed
/// as one JSON line on stdout. The next line is only read once the node has
/// drained the previous request.
#[derive(Parser)]
#[command(name = "pgflow", version, about)]
struct Cli {
    /// Node configuration file (defaults to <config dir>/pgflow/node.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Query template, overriding the configured one
    #[arg(short, long)]
    query: Option<String>,

    /// Stream results page by page
    #[arg(long)]
    split: bool,

    /// Rows per streamed message
    #[arg(long)]
    rows_per_msg: Option<i64>,

    /// Log request lifecycle details
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<NodeConfigFile> {
    let mut file = match &cli.config {
        Some(path) => NodeConfigFile::load(path)?,
        None => {
            let path = NodeConfigFile::default_path();
            if path.exists() {
                NodeConfigFile::load(&path)?
            } else {
                NodeConfigFile::default()
            }
        }
    };

    let node: &mut NodeSettings = &mut file.node;
    if let Some(query) = &cli.query {
        node.query = query.clone();
    }
    if cli.split {
        node.split = true;
    }
    if let Some(rows) = cli.rows_per_msg {
        node.rows_per_msg = rows;
    }
    Ok(file)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the message stream; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let file = load_config(&cli)?;
    if file.node.query.is_empty() {
        anyhow::bail!("No query configured; pass --query or set [node].query");
    }

    let mut graph = GraphBuilder::new();
    let mut stdin_ticks = graph.node("stdin", true, &["query"]);
    let query_inbox = graph.node("query", true, &["stdout"]);
    let mut stdout_inbox = graph.node("stdout", false, &[]);
    let graph = graph.build();

    let node = QueryNode::new(
        "query",
        file.node.clone(),
        file.connection.clone(),
        Arc::new(PgDriver),
        graph.clone(),
        graph.output("query"),
    )
    .with_context(Arc::new(file.context_store()));
    let task = spawn_node(node, query_inbox);

    let query = graph.inbox("query").context("query node missing")?;

    // Always-ready sink: print each batch and ack it with a tick.
    let printer = {
        let query = query.clone();
        tokio::spawn(async move {
            while let Some(msg) = stdout_inbox.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::error!("Failed to encode message: {}", e),
                }
                query.deliver(Message::tick());
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let msg: Message = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("Skipping invalid message: {}", e);
                continue;
            }
        };
        if !query.deliver(msg) {
            break;
        }
        // Wait until the node has drained this request.
        loop {
            match stdin_ticks.recv().await {
                Some(msg) if msg.tick => break,
                Some(_) => continue,
                None => break,
            }
        }
    }

    task.stop().await;
    // Dropping the graph closes the stdout inbox once the node task is gone.
    drop(graph);
    printer.await.context("Output task failed")?;
    Ok(())
}
