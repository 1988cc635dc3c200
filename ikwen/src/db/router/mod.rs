//! Routing of queries to named databases.
//!
//! [`DbRouter`] resolves database aliases to connection pools:
//!
//! ```text
//! ┌──────────────┐
//! │   DbRouter   │
//! └──────┬───────┘
//!        │
//!   ┌────┼──────────┬──────────────┐
//!   ↓    ↓          ↓              ↓
//! default umbrella wallets   tenant databases (added at runtime)
//! ```
//!
//! `umbrella` holds cross-tenant member data and `wallets` holds operator wallets and
//! messaging balances. An alias without a configured URL resolves to `default`, so a
//! single-database deployment needs no extra configuration.
//!
//! `DbRouter` implements `Deref<Target = PgPool>` on the default pool, so `&state.db`
//! keeps working wherever only the default database is involved.
//!
//! ```ignore
//! let mut conn = state.db.wallets().acquire().await?;
//! let balance = MessagingBalances::new(&mut conn).get(service_id).await?;
//! ```

pub mod metrics;

use std::{ops::Deref, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::info;

use crate::config::{DatabaseConfig, PoolSettings};
use crate::errors::Error;

pub use metrics::{LabeledPool, PoolMetricsConfig, run_pool_metrics_sampler};

pub const DEFAULT_DB: &str = "default";
pub const UMBRELLA_DB: &str = "umbrella";
pub const WALLETS_DB: &str = "wallets";

#[derive(Debug)]
struct RouterInner {
    default: PgPool,
    pools: DashMap<String, PgPool>,
    settings: PoolSettings,
}

/// Named connection pools, cheap to clone.
#[derive(Clone, Debug)]
pub struct DbRouter {
    inner: Arc<RouterInner>,
}

fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    let mut options = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs));
    if settings.idle_timeout_secs > 0 {
        options = options.idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
    }
    if settings.max_lifetime_secs > 0 {
        options = options.max_lifetime(Duration::from_secs(settings.max_lifetime_secs));
    }
    options
}

impl DbRouter {
    /// A router where every alias resolves to `default`.
    pub fn new(default: PgPool) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                default,
                pools: DashMap::new(),
                settings: PoolSettings::default(),
            }),
        }
    }

    /// Connect the default database eagerly and every configured alias lazily.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, Error> {
        let default = pool_options(&config.pool)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Internal {
                operation: format!("connect to the default database: {e}"),
            })?;
        let router = Self {
            inner: Arc::new(RouterInner {
                default,
                pools: DashMap::new(),
                settings: config.pool.clone(),
            }),
        };
        for (alias, url) in &config.aliases {
            router.register(alias, url)?;
        }
        Ok(router)
    }

    fn register(&self, alias: &str, url: &str) -> Result<(), Error> {
        if alias == DEFAULT_DB {
            return Err(Error::BadRequest {
                message: "the default database cannot be registered as an alias".to_string(),
            });
        }
        let options: PgConnectOptions = url.parse().map_err(|e| Error::BadRequest {
            message: format!("invalid URL for database '{alias}': {e}"),
        })?;
        match self.inner.pools.entry(alias.to_string()) {
            Entry::Occupied(_) => Err(Error::Conflict {
                message: format!("database '{alias}' is already registered"),
            }),
            Entry::Vacant(slot) => {
                slot.insert(pool_options(&self.inner.settings).connect_lazy_with(options));
                info!(alias, "Registered database");
                Ok(())
            }
        }
    }

    /// Register a tenant database on the same server as `default`. The pool connects on first use.
    pub fn add_database(&self, name: &str) -> Result<(), Error> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::BadRequest {
                message: format!("invalid database name '{name}'"),
            });
        }
        let options = self.inner.default.connect_options().as_ref().clone().database(name);
        match self.inner.pools.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::Conflict {
                message: format!("database '{name}' is already registered"),
            }),
            Entry::Vacant(slot) => {
                slot.insert(pool_options(&self.inner.settings).connect_lazy_with(options));
                info!(database = name, "Added tenant database");
                Ok(())
            }
        }
    }

    pub fn contains(&self, alias: &str) -> bool {
        alias == DEFAULT_DB || self.inner.pools.contains_key(alias)
    }

    /// Pool of `alias`, falling back to `default` for unknown aliases.
    pub fn using(&self, alias: &str) -> PgPool {
        self.inner
            .pools
            .get(alias)
            .map(|pool| pool.clone())
            .unwrap_or_else(|| self.inner.default.clone())
    }

    pub fn default_pool(&self) -> &PgPool {
        &self.inner.default
    }

    pub fn umbrella(&self) -> PgPool {
        self.using(UMBRELLA_DB)
    }

    pub fn wallets(&self) -> PgPool {
        self.using(WALLETS_DB)
    }

    /// Every distinct pool with its alias, for metrics
    pub fn labeled_pools(&self) -> Vec<LabeledPool> {
        let mut pools = vec![LabeledPool {
            name: DEFAULT_DB.to_string(),
            pool: self.inner.default.clone(),
        }];
        pools.extend(self.inner.pools.iter().map(|entry| LabeledPool {
            name: entry.key().clone(),
            pool: entry.value().clone(),
        }));
        pools
    }

    /// Close every connection of every pool.
    pub async fn close(&self) {
        self.inner.default.close().await;
        let pools: Vec<PgPool> = self.inner.pools.iter().map(|entry| entry.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

impl Deref for DbRouter {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.inner.default
    }
}
