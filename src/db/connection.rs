use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_postgres::config::SslMode as PgSslMode;
use tokio_postgres::{Client, NoTls};

use crate::error::{Error, Result};

/// Fully resolved connection parameters.
///
/// Two configs are equal iff every field is equal; a change in any field
/// replaces the node's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Only honoured for
    /// `Prefer`/`Require`.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    pub ca_cert_path: Option<String>,
    pub application_name: Option<String>,
    /// Upper bound on pooled connections.
    pub pool_max: usize,
    /// Pooled connections unused for this long are closed. `0` disables reaping.
    pub idle_timeout_ms: u64,
    /// Bound on establishing a connection and on waiting for a pool slot.
    /// `0` means no limit.
    pub connect_timeout_ms: u64,
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disable" => Some(SslMode::Disable),
            "prefer" => Some(SslMode::Prefer),
            "require" => Some(SslMode::Require),
            "verify-ca" => Some(SslMode::VerifyCa),
            "verify-full" => Some(SslMode::VerifyFull),
            _ => None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user: String::from("postgres"),
            password: String::new(),
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            application_name: None,
            pool_max: 10,
            idle_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
        }
    }
}

/// Per-message connection override. Set fields shadow the node's resolved
/// config for one standalone connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOverride {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub ssl_mode: Option<SslMode>,
    pub application_name: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

impl ConnectionOverride {
    /// Layer this override over `base` without touching `base`.
    pub fn apply(&self, base: &ConnectionConfig) -> ConnectionConfig {
        let mut config = base.clone();
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(ssl_mode) = self.ssl_mode {
            config.ssl_mode = ssl_mode;
        }
        if self.application_name.is_some() {
            config.application_name = self.application_name.clone();
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.connect_timeout_ms = timeout;
        }
        config
    }
}

impl ConnectionConfig {
    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Build the driver-level connection parameters.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .ssl_mode(match self.ssl_mode {
                SslMode::Disable => PgSslMode::Disable,
                SslMode::Prefer => PgSslMode::Prefer,
                SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
            });
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        if let Some(name) = &self.application_name {
            config.application_name(name);
        }
        if let Some(timeout) = self.connect_timeout() {
            config.connect_timeout(timeout);
        }
        config
    }
}

/// Open a standalone (unpooled) client.
///
/// The connection task is spawned onto the current runtime; dropping the
/// returned client closes the connection.
pub async fn create_client(config: &ConnectionConfig) -> Result<Client> {
    let pg_config = config.pg_config();
    let timeout = config.connect_timeout().unwrap_or(Duration::MAX);

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) = tokio::time::timeout(timeout, pg_config.connect(NoTls))
                .await
                .map_err(|_| timed_out(config))?
                .map_err(|e| connect_failed(config, &e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("Connection error: {}", e);
                }
            });
            client
        }
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            let tls = build_tls_connector(config)?;
            let (client, connection) = tokio::time::timeout(timeout, pg_config.connect(tls))
                .await
                .map_err(|_| timed_out(config))?
                .map_err(|e| connect_failed(config, &e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("Connection error: {}", e);
                }
            });
            client
        }
    };

    Ok(client)
}

fn timed_out(config: &ConnectionConfig) -> Error {
    Error::Connection(format!(
        "Connection to {} timed out after {}ms",
        config.display_string(),
        config.connect_timeout_ms
    ))
}

fn connect_failed(config: &ConnectionConfig, err: &tokio_postgres::Error) -> Error {
    Error::Connection(format!(
        "Failed to connect to {}: {}",
        config.display_string(),
        err
    ))
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `VerifyCa`/`VerifyFull` always verify the chain; `VerifyCa` skips the
/// hostname check. `accept_invalid_certs` only relaxes `Prefer`/`Require`.
pub fn build_tls_connector(config: &ConnectionConfig) -> Result<MakeTlsConnector> {
    let strict_verify = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if let Some(ca_path) = &config.ca_cert_path {
            let ca_data = std::fs::read(ca_path).map_err(|e| {
                Error::Config(format!("Failed to read CA certificate file {}: {}", ca_path, e))
            })?;
            let cert = native_tls::Certificate::from_pem(&ca_data)
                .map_err(|e| Error::Config(format!("Failed to parse CA certificate: {}", e)))?;
            builder.add_root_certificate(cert);
        }
        if config.ssl_mode == SslMode::VerifyCa {
            builder.danger_accept_invalid_hostnames(true);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build TLS connector: {}", e)))?;

    Ok(MakeTlsConnector::new(connector))
}
