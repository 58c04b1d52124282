use std::sync::{Arc, Mutex, PoisonError};

use crate::db::{ConnectionConfig, ConnectionPool, Driver};
use crate::error::Result;

/// Cloneable view of the node's current pool, for status reporting.
///
/// Reads see either the old or the new pool, never a half-replaced one.
#[derive(Clone, Default)]
pub struct PoolGauge {
    current: Arc<Mutex<Option<Arc<dyn ConnectionPool>>>>,
}

impl PoolGauge {
    /// Live connections of the current pool; 0 before any pool exists.
    pub fn total_count(&self) -> usize {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |pool| pool.total_count())
    }

    fn swap(&self, pool: Option<Arc<dyn ConnectionPool>>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = pool;
    }
}

struct ActivePool {
    config: ConnectionConfig,
    pool: Arc<dyn ConnectionPool>,
}

/// Owns the node's pool and replaces it when the resolved config drifts.
pub struct PoolManager {
    driver: Arc<dyn Driver>,
    current: Option<ActivePool>,
    gauge: PoolGauge,
}

impl PoolManager {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            current: None,
            gauge: PoolGauge::default(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn gauge(&self) -> PoolGauge {
        self.gauge.clone()
    }

    pub fn total_count(&self) -> usize {
        self.gauge.total_count()
    }

    pub fn current(&self) -> Option<&Arc<dyn ConnectionPool>> {
        self.current.as_ref().map(|active| &active.pool)
    }

    /// Return the pool for `config`, building it on first use, when any field
    /// differs from the config the current pool was built with, or when
    /// `reconnect` is set. The previous pool is ended before its replacement
    /// is built. Build failures are returned as-is, without retry.
    pub async fn ensure_pool(
        &mut self,
        config: &ConnectionConfig,
        reconnect: bool,
    ) -> Result<Arc<dyn ConnectionPool>> {
        if let Some(active) = &self.current {
            if !reconnect && active.config == *config {
                return Ok(active.pool.clone());
            }
        }

        if let Some(previous) = self.current.take() {
            if reconnect {
                tracing::info!("Reconnect requested, replacing pool");
            } else {
                tracing::info!(
                    "Connection config changed ({}), replacing pool",
                    changed_fields(&previous.config, config).join(", ")
                );
            }
            self.gauge.swap(None);
            previous.pool.end().await;
        }

        let pool = self.driver.create_pool(config)?;
        self.gauge.swap(Some(pool.clone()));
        self.current = Some(ActivePool {
            config: config.clone(),
            pool: pool.clone(),
        });
        Ok(pool)
    }

    /// End the current pool, if any.
    pub async fn end(&mut self) {
        if let Some(active) = self.current.take() {
            self.gauge.swap(None);
            active.pool.end().await;
        }
    }
}

/// Names of the fields that differ between two configs.
pub fn changed_fields(old: &ConnectionConfig, new: &ConnectionConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let mut check = |name: &'static str, differs: bool| {
        if differs {
            changed.push(name);
        }
    };
    check("user", old.user != new.user);
    check("password", old.password != new.password);
    check("host", old.host != new.host);
    check("port", old.port != new.port);
    check("database", old.database != new.database);
    check(
        "tls",
        old.ssl_mode != new.ssl_mode
            || old.accept_invalid_certs != new.accept_invalid_certs
            || old.ca_cert_path != new.ca_cert_path,
    );
    check("applicationName", old.application_name != new.application_name);
    check("poolMax", old.pool_max != new.pool_max);
    check("idleTimeoutMs", old.idle_timeout_ms != new.idle_timeout_ms);
    check("connectTimeoutMs", old.connect_timeout_ms != new.connect_timeout_ms);
    changed
}
