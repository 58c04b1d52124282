//! Node configuration: where each connection field comes from, the node's own
//! settings, and the TOML file that holds both.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::db::{ConnectionConfig, SslMode};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Str,
    Num,
    Bool,
    Json,
    Env,
    Global,
    /// Legacy flow-scope lookup.
    Flow,
}

/// Source of one configuration field: a bare literal, or `{ type, value }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Typed {
        #[serde(rename = "type")]
        kind: FieldKind,
        value: Value,
    },
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Flow,
    Global,
}

/// Key-value store consulted by `global` and `flow` fields.
pub trait ContextStore: Send + Sync {
    fn get(&self, scope: Scope, key: &str) -> Option<Value>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub global: Map<String, Value>,
    pub flow: Map<String, Value>,
}

impl ContextStore for MemoryStore {
    fn get(&self, scope: Scope, key: &str) -> Option<Value> {
        match scope {
            Scope::Global => self.global.get(key).cloned(),
            Scope::Flow => self.flow.get(key).cloned(),
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FieldSource {
    pub fn literal(value: impl Into<Value>) -> Self {
        FieldSource::Literal(value.into())
    }

    pub fn typed(kind: FieldKind, value: impl Into<Value>) -> Self {
        FieldSource::Typed {
            kind,
            value: value.into(),
        }
    }

    /// Read the field's current value. `None` means unset.
    pub fn resolve(&self, store: &dyn ContextStore) -> Result<Option<Value>> {
        let (kind, value) = match self {
            FieldSource::Literal(Value::Null) => return Ok(None),
            FieldSource::Literal(value) => return Ok(Some(value.clone())),
            FieldSource::Typed { kind, value } => (*kind, value),
        };

        let resolved = match kind {
            FieldKind::Str => Some(Value::String(text_of(value))),
            FieldKind::Num => {
                let text = text_of(value);
                let n: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| Error::config(format!("not a number: {}", text)))?;
                Some(Value::from(n))
            }
            FieldKind::Bool | FieldKind::Json => match value {
                Value::String(s) => Some(
                    serde_json::from_str(s)
                        .map_err(|e| Error::config(format!("invalid JSON {:?}: {}", s, e)))?,
                ),
                other => Some(other.clone()),
            },
            FieldKind::Env => std::env::var(text_of(value)).ok().map(Value::String),
            FieldKind::Global => store.get(Scope::Global, &text_of(value)),
            FieldKind::Flow => store.get(Scope::Flow, &text_of(value)),
        };
        Ok(resolved.filter(|v| !v.is_null()))
    }
}

/// Connection fields as configured, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub user: Option<FieldSource>,
    pub password: Option<FieldSource>,
    pub host: Option<FieldSource>,
    pub port: Option<FieldSource>,
    pub database: Option<FieldSource>,
    /// Bool (`true` = require) or an sslmode name.
    pub tls: Option<FieldSource>,
    pub application_name: Option<FieldSource>,
    pub pool_max: Option<FieldSource>,
    pub idle_timeout_ms: Option<FieldSource>,
    pub connect_timeout_ms: Option<FieldSource>,
    pub accept_invalid_certs: bool,
    pub ca_cert_path: Option<String>,
}

fn field(
    source: &Option<FieldSource>,
    store: &dyn ContextStore,
) -> Result<Option<Value>> {
    match source {
        Some(source) => source.resolve(store),
        None => Ok(None),
    }
}

fn as_u64(name: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::config(format!("{} must be a non-negative integer, got {}", name, value)))
}

fn as_tls(value: &Value) -> Result<SslMode> {
    match value {
        Value::Bool(true) => Ok(SslMode::Require),
        Value::Bool(false) => Ok(SslMode::Disable),
        Value::String(s) => match s.trim() {
            "true" => Ok(SslMode::Require),
            "false" => Ok(SslMode::Disable),
            mode => SslMode::parse(mode)
                .ok_or_else(|| Error::config(format!("unknown tls mode: {}", mode))),
        },
        other => Err(Error::config(format!("unknown tls mode: {}", other))),
    }
}

impl ConnectionSettings {
    /// Resolve every field against the environment and `store`. Fields that
    /// are unset fall back to [`ConnectionConfig::default`].
    pub fn resolve(&self, store: &dyn ContextStore) -> Result<ConnectionConfig> {
        let mut config = ConnectionConfig::default();

        if let Some(v) = field(&self.user, store)? {
            config.user = text_of(&v);
        }
        if let Some(v) = field(&self.password, store)? {
            config.password = text_of(&v);
        }
        if let Some(v) = field(&self.host, store)? {
            config.host = text_of(&v);
        }
        if let Some(v) = field(&self.port, store)? {
            config.port = u16::try_from(as_u64("port", &v)?)
                .map_err(|_| Error::config(format!("port out of range: {}", v)))?;
        }
        if let Some(v) = field(&self.database, store)? {
            config.database = text_of(&v);
        }
        if let Some(v) = field(&self.tls, store)? {
            config.ssl_mode = as_tls(&v)?;
        }
        if let Some(v) = field(&self.application_name, store)? {
            config.application_name = Some(text_of(&v));
        }
        if let Some(v) = field(&self.pool_max, store)? {
            config.pool_max = as_u64("pool_max", &v)? as usize;
        }
        if let Some(v) = field(&self.idle_timeout_ms, store)? {
            config.idle_timeout_ms = as_u64("idle_timeout_ms", &v)?;
        }
        if let Some(v) = field(&self.connect_timeout_ms, store)? {
            config.connect_timeout_ms = as_u64("connect_timeout_ms", &v)?;
        }
        config.accept_invalid_certs = self.accept_invalid_certs;
        config.ca_cert_path = self.ca_cert_path.clone();

        Ok(config)
    }
}

fn default_rows_per_msg() -> i64 {
    1
}

fn default_status_period_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default)]
    pub name: Option<String>,
    /// Query template, rendered against `{ msg }`.
    #[serde(default)]
    pub query: String,
    /// Stream results page by page instead of one message per request.
    #[serde(default)]
    pub split: bool,
    #[serde(default = "default_rows_per_msg")]
    pub rows_per_msg: i64,
    #[serde(default = "default_status_period_ms")]
    pub status_period_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: None,
            query: String::new(),
            split: false,
            rows_per_msg: default_rows_per_msg(),
            status_period_ms: default_status_period_ms(),
        }
    }
}

/// On-disk node configuration.
///
/// ```toml
/// [node]
/// query = "SELECT * FROM orders WHERE region = $region"
/// split = true
/// rows_per_msg = 100
///
/// [connection]
/// host = { type = "env", value = "PGHOST" }
/// password = { type = "global", value = "pg_password" }
/// tls = false
///
/// [globals]
/// pg_password = "secret"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigFile {
    pub node: NodeSettings,
    pub connection: ConnectionSettings,
    pub globals: Map<String, Value>,
    pub flow: Map<String, Value>,
}

impl NodeConfigFile {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pgflow")
            .join("node.toml")
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Invalid node configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn context_store(&self) -> MemoryStore {
        MemoryStore {
            global: self.globals.clone(),
            flow: self.flow.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryStore {
        let mut store = MemoryStore::default();
        store.global.insert("pg_host".into(), json!("db.internal"));
        store.flow.insert("pg_db".into(), json!("flowdb"));
        store
    }

    #[test]
    fn test_field_kinds() {
        let store = store();
        let resolve = |source: FieldSource| source.resolve(&store).unwrap();

        assert_eq!(resolve(FieldSource::literal("x")), Some(json!("x")));
        assert_eq!(resolve(FieldSource::typed(FieldKind::Str, 5)), Some(json!("5")));
        assert_eq!(resolve(FieldSource::typed(FieldKind::Num, "42")), Some(json!(42)));
        assert_eq!(resolve(FieldSource::typed(FieldKind::Bool, "true")), Some(json!(true)));
        assert_eq!(
            resolve(FieldSource::typed(FieldKind::Json, r#"{"rejectUnauthorized":false}"#)),
            Some(json!({"rejectUnauthorized": false}))
        );
        assert_eq!(
            resolve(FieldSource::typed(FieldKind::Global, "pg_host")),
            Some(json!("db.internal"))
        );
        assert_eq!(resolve(FieldSource::typed(FieldKind::Flow, "pg_db")), Some(json!("flowdb")));
        assert_eq!(resolve(FieldSource::typed(FieldKind::Global, "absent")), None);
        assert_eq!(resolve(FieldSource::Literal(Value::Null)), None);
    }

    #[test]
    fn test_env_field() {
        std::env::set_var("PGFLOW_TEST_PORT", "6543");
        let source = FieldSource::typed(FieldKind::Env, "PGFLOW_TEST_PORT");
        assert_eq!(source.resolve(&MemoryStore::default()).unwrap(), Some(json!("6543")));

        let missing = FieldSource::typed(FieldKind::Env, "PGFLOW_TEST_UNSET_VARIABLE");
        assert_eq!(missing.resolve(&MemoryStore::default()).unwrap(), None);
    }

    #[test]
    fn test_bad_number_is_config_error() {
        let err = FieldSource::typed(FieldKind::Num, "abc")
            .resolve(&MemoryStore::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unset_settings_resolve_to_defaults() {
        let config = ConnectionSettings::default()
            .resolve(&MemoryStore::default())
            .unwrap();
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_resolve_mixed_sources() {
        let settings = ConnectionSettings {
            host: Some(FieldSource::typed(FieldKind::Global, "pg_host")),
            database: Some(FieldSource::typed(FieldKind::Flow, "pg_db")),
            port: Some(FieldSource::typed(FieldKind::Str, "5433")),
            tls: Some(FieldSource::literal(false)),
            pool_max: Some(FieldSource::literal(3)),
            application_name: Some(FieldSource::literal("reports")),
            ..ConnectionSettings::default()
        };
        let config = settings.resolve(&store()).unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.database, "flowdb");
        assert_eq!(config.port, 5433);
        assert_eq!(config.ssl_mode, SslMode::Disable);
        assert_eq!(config.pool_max, 3);
        assert_eq!(config.application_name.as_deref(), Some("reports"));
    }

    #[test]
    fn test_tls_accepts_mode_names() {
        assert_eq!(as_tls(&json!(true)).unwrap(), SslMode::Require);
        assert_eq!(as_tls(&json!("verify-full")).unwrap(), SslMode::VerifyFull);
        assert!(as_tls(&json!("sometimes")).is_err());
    }

    #[test]
    fn test_parse_config_file() {
        let file = NodeConfigFile::parse(
            r#"
            [node]
            query = "SELECT * FROM t WHERE id = $id"
            split = true
            rows_per_msg = 50

            [connection]
            host = { type = "global", value = "pg_host" }
            port = 6000
            tls = "require"

            [globals]
            pg_host = "db.example"
            "#,
        )
        .unwrap();

        assert!(file.node.split);
        assert_eq!(file.node.rows_per_msg, 50);
        assert_eq!(file.node.status_period_ms, 1000);

        let config = file.connection.resolve(&file.context_store()).unwrap();
        assert_eq!(config.host, "db.example");
        assert_eq!(config.port, 6000);
        assert_eq!(config.ssl_mode, SslMode::Require);
    }

    #[test]
    fn test_parse_empty_file_uses_defaults() {
        let file = NodeConfigFile::parse("").unwrap();
        assert_eq!(file.node, NodeSettings::default());
        assert!(!file.node.split);
    }

    #[test]
    fn test_default_path_is_under_pgflow() {
        let path = NodeConfigFile::default_path();
        assert!(path.ends_with("pgflow/node.toml"));
    }
}
