//! Database pool metrics sampling.
//!
//! A background task periodically samples the state of every routed pool and records gauges.

use std::time::Duration;

use metrics::gauge;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PoolMetricsConfig {
    pub sample_interval: Duration,
}

impl Default for PoolMetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
        }
    }
}

/// A pool with the alias used as metric label
pub struct LabeledPool {
    pub name: String,
    pub pool: PgPool,
}

/// Sample `ikwen_db_pool_connections_{total,idle,in_use,max}` labeled by `pool` until shutdown.
pub async fn run_pool_metrics_sampler(pools: Vec<LabeledPool>, config: PoolMetricsConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    info!(
        "Starting pool metrics sampler for {} pools with {:?} interval",
        pools.len(),
        config.sample_interval
    );

    for labeled in &pools {
        let max = labeled.pool.options().get_max_connections();
        gauge!("ikwen_db_pool_connections_max", "pool" => labeled.name.clone()).set(max as f64);
    }

    let mut interval = tokio::time::interval(config.sample_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Pool metrics sampler shutting down");
                break;
            }
            _ = interval.tick() => {
                for labeled in &pools {
                    let size = labeled.pool.size();
                    let idle = labeled.pool.num_idle();
                    let in_use = (size as usize).saturating_sub(idle);

                    gauge!("ikwen_db_pool_connections_total", "pool" => labeled.name.clone()).set(size as f64);
                    gauge!("ikwen_db_pool_connections_idle", "pool" => labeled.name.clone()).set(idle as f64);
                    gauge!("ikwen_db_pool_connections_in_use", "pool" => labeled.name.clone()).set(in_use as f64);

                    debug!(pool = %labeled.name, size, idle, in_use, "Sampled pool metrics");
                }
            }
        }
    }

    Ok(())
}
