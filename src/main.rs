use std::future::IntoFuture;
use std::sync::Arc;

use clap::Parser;
use payments_api::account::AccountStore;
use payments_api::audit::AuditLog;
use payments_api::cache::BalanceCache;
use payments_api::config::Config;
use payments_api::consumer::{Pipeline, TransactionConsumer};
use payments_api::db;
use payments_api::mq::{self, Conn};
use payments_api::web;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Cache(#[from] redis::RedisError),
    #[error(transparent)]
    Mq(#[from] mq::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::parse();

    let pool = db::connect(&cfg).await?;
    let cache = BalanceCache::connect(&cfg).await?;
    let conn = Conn::connect(&cfg).await?;
    conn.declare_queues().await?;

    // one shutdown switch for the server, the consumer session and signals
    let (shutdown_tx, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);

    let store = AccountStore::new(pool.clone());
    let pipeline = Pipeline::new(store.clone(), AuditLog::new(pool.clone()), cache.clone());
    let consumer = TransactionConsumer::new(pipeline, cfg.mq_concurrency, cfg.mq_max_reconnect);
    let supervisor = tokio::spawn(consumer.supervise(cfg.clone(), conn, shutdown.clone()));

    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;
    let signals = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = signals.send(true);
    });

    let app = web::App { store, cache };
    let listener = TcpListener::bind(("0.0.0.0", cfg.http_port)).await?;
    info!("server started, listening on :{}", cfg.http_port);

    let mut stop = shutdown.subscribe();
    let serve = axum::serve(listener, web::router(app, &cfg))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stop| *stop).await;
        })
        .into_future();

    tokio::pin!(serve);
    let mut began = shutdown.subscribe();
    tokio::select! {
        served = &mut serve => served?,
        _ = async {
            let _ = began.wait_for(|stop| *stop).await;
            time::sleep(cfg.shutdown_timeout).await;
        } => {
            warn!(
                "graceful shutdown did not complete in {:?}, closing connections",
                cfg.shutdown_timeout
            );
        }
    }

    if time::timeout(cfg.shutdown_timeout, supervisor).await.is_err() {
        warn!("consumer did not drain in {:?}", cfg.shutdown_timeout);
    }
    pool.close().await;

    Ok(())
}
