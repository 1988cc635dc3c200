use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Background task for leader election
/// Runs periodically to maintain leadership or attempt to acquire it
///
/// Only the leader runs the scheduled jobs: daily invoicing, revival passes and the resumed
/// mobile money status checks. Replicas keep serving HTTP traffic.
///
/// PostgreSQL advisory locks are session-based, so we need to maintain a dedicated connection
/// for the entire duration we want to hold the lock.
#[instrument(skip(pool, is_leader, shutdown, on_gain_leadership, on_lose_leadership))]
pub async fn leader_election_task<F1, F2, Fut1, Fut2>(
    pool: PgPool,
    is_leader: Arc<AtomicBool>,
    lock_id: i64,
    check_interval: Duration,
    shutdown: CancellationToken,
    on_gain_leadership: F1,
    on_lose_leadership: F2,
) where
    F1: Fn() -> Fut1 + Send + 'static,
    F2: Fn() -> Fut2 + Send + 'static,
    Fut1: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    Fut2: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    let mut interval = tokio::time::interval(check_interval);
    let mut leader_conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        if !is_leader.load(Ordering::Relaxed) {
            match pool.acquire().await {
                Ok(mut conn) => {
                    match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                        .bind(lock_id)
                        .fetch_one(&mut *conn)
                        .await
                    {
                        Ok(true) => {
                            info!("Gained leadership");
                            is_leader.store(true, Ordering::Relaxed);
                            // The lock lives as long as this connection
                            leader_conn = Some(conn);

                            if let Err(e) = on_gain_leadership().await {
                                tracing::error!("Failed to execute on_gain_leadership callback: {}", e);
                            }
                        }
                        Ok(false) => {
                            debug!("Following - will retry");
                        }
                        Err(e) => {
                            tracing::error!("Failed to check leader lock: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to acquire connection for leader election: {}", e);
                }
            }
        } else if let Some(ref mut conn) = leader_conn {
            if let Err(e) = sqlx::query("SELECT 1").execute(&mut **conn).await {
                // A dead connection releases the advisory lock
                tracing::warn!("Lost leadership (connection died): {}", e);
                is_leader.store(false, Ordering::Relaxed);
                leader_conn = None;

                if let Err(e) = on_lose_leadership().await {
                    tracing::error!("Failed to execute on_lose_leadership callback: {}", e);
                }
            } else {
                debug!("Leadership renewed (connection alive)");
            }
        } else {
            tracing::error!("Inconsistent state: is_leader=true but no connection");
            is_leader.store(false, Ordering::Relaxed);
        }
    }

    if let Some(mut conn) = leader_conn.take() {
        let _ = sqlx::query("SELECT pg_advisory_unlock($1)").bind(lock_id).execute(&mut *conn).await;
        is_leader.store(false, Ordering::Relaxed);
        if let Err(e) = on_lose_leadership().await {
            tracing::error!("Failed to execute on_lose_leadership callback: {}", e);
        }
        info!("Released leadership on shutdown");
    }
}
