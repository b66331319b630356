//! Consumer-pipeline tests: decode -> store -> cache -> audit against real
//! PostgreSQL and redis. Run with `cargo test --features integration` and
//! the services from docker-compose.yml up. The broker round-trip at the
//! bottom additionally needs rabbitmq and is ignored by default.
#![cfg(feature = "integration")]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use payments_api::account::AccountStore;
use payments_api::audit::{AuditLog, TxKind};
use payments_api::cache::BalanceCache;
use payments_api::config::Config;
use payments_api::consumer::{Disposition, Pipeline, TransactionConsumer};
use payments_api::customer;
use payments_api::message::BalanceMessage;
use payments_api::money::{Currency, Money};
use payments_api::mq::Conn;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

fn var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

// Only the cache and mq sections matter here; sqlx::test owns the database.
fn test_config() -> Config {
    Config {
        db_user: var("APP_DB_USER", "postgres"),
        db_password: var("APP_DB_PASSWORD", "postgres"),
        db_name: var("APP_DB_NAME", "payments"),
        db_host: var("APP_DB_HOST", "localhost"),
        db_port: 5432,
        mq_user: var("APP_MQ_USER", "guest"),
        mq_password: var("APP_MQ_PASSWORD", "guest"),
        mq_host: var("APP_MQ_HOST", "localhost"),
        mq_port: 5672,
        mq_concurrency: 2,
        mq_max_reconnect: 5,
        cache_host: var("APP_CACHE_HOST", "localhost"),
        cache_password: var("APP_CACHE_PASSWORD", ""),
        cache_port: 6379,
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(5),
        http_port: 8080,
    }
}

async fn pipeline(pool: &PgPool) -> (Pipeline, AccountStore, BalanceCache, AuditLog) {
    let store = AccountStore::new(pool.clone());
    let audit = AuditLog::new(pool.clone());
    let cache = BalanceCache::connect(&test_config()).await.unwrap();
    (
        Pipeline::new(store.clone(), audit.clone(), cache.clone()),
        store,
        cache,
        audit,
    )
}

// Explicit ids keep concurrently-running tests (and leftover redis keys from
// earlier runs) out of each other's way.
fn fresh_id() -> i64 {
    let bytes: [u8; 8] = Uuid::new_v4().as_bytes()[..8].try_into().unwrap();
    i64::from_le_bytes(bytes) & i64::MAX
}

async fn seed_account(pool: &PgPool, balance: i64, currency: Currency) -> i64 {
    let customer = customer::create(
        pool,
        &payments_api::account::CreationRequest {
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            email: format!("{}@example.com", Uuid::new_v4()),
            initial_balance: balance,
            currency: currency.code().into(),
        },
    )
    .await
    .unwrap();

    let id = fresh_id();
    sqlx::query(
        "INSERT INTO accounts(id, customer_id, balance_in_decimal, currency, created_at, modified_at, frozen) \
         VALUES($1,$2,$3,$4,now(),now(),FALSE)",
    )
    .bind(id)
    .bind(customer.id)
    .bind(balance)
    .bind(currency)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn audit_rows(pool: &PgPool, id: i64) -> Vec<(i64, i64, String, bool)> {
    sqlx::query_as(
        "SELECT from_id, to_id, transaction_type, ack FROM transactions \
         WHERE from_id = $1 OR to_id = $1 ORDER BY id",
    )
    .bind(id)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[sqlx::test]
async fn test_deposit_happy_path(pool: PgPool) {
    let (pipeline, store, cache, _) = pipeline(&pool).await;
    let id = seed_account(&pool, 15540, Currency::Gbp).await;

    let body = format!(r#"{{"id":{id},"amount":10}}"#);
    let result = pipeline.handle(TxKind::Deposit, body.as_bytes()).await;
    assert_eq!(Disposition::of(&result), Disposition::Ack);
    assert!(result.unwrap().is_some());

    assert_eq!(store.select_by_id(id).await.unwrap().balance_minor, 15550);
    assert_eq!(cache.get(id).await, Some(Money::new(15550, Currency::Gbp)));
    assert_eq!(
        audit_rows(&pool, id).await,
        vec![(id, 0, "deposit".to_owned(), true)]
    );
}

#[sqlx::test]
async fn test_withdraw_insufficient_funds_is_dead_lettered(pool: PgPool) {
    let (pipeline, store, cache, _) = pipeline(&pool).await;
    let id = seed_account(&pool, 23240, Currency::Gbp).await;

    let body = format!(r#"{{"id":{id},"amount":100000}}"#);
    let result = pipeline.handle(TxKind::Withdraw, body.as_bytes()).await;
    assert_eq!(Disposition::of(&result), Disposition::DeadLetter);

    // store untouched, no cache write, no audit row
    assert_eq!(store.select_by_id(id).await.unwrap().balance_minor, 23240);
    assert_eq!(cache.get(id).await, None);
    assert!(audit_rows(&pool, id).await.is_empty());
}

#[sqlx::test]
async fn test_transfer_updates_both_sides(pool: PgPool) {
    let (pipeline, store, cache, _) = pipeline(&pool).await;
    let from = seed_account(&pool, 23050, Currency::Gbp).await;
    let to = seed_account(&pool, 1560, Currency::Gbp).await;

    let body = format!(r#"{{"from":{from},"to":{to},"amount":500}}"#);
    let result = pipeline.handle(TxKind::Transfer, body.as_bytes()).await;
    assert_eq!(Disposition::of(&result), Disposition::Ack);

    let from_row = store.select_by_id(from).await.unwrap();
    let to_row = store.select_by_id(to).await.unwrap();
    assert_eq!(from_row.balance_minor, 22550);
    assert_eq!(to_row.balance_minor, 2060);
    assert_eq!(from_row.modified_at, to_row.modified_at);

    assert_eq!(cache.get(from).await, Some(Money::new(22550, Currency::Gbp)));
    assert_eq!(cache.get(to).await, Some(Money::new(2060, Currency::Gbp)));
    assert_eq!(
        audit_rows(&pool, from).await,
        vec![(from, to, "transfer".to_owned(), true)]
    );
}

#[sqlx::test]
async fn test_transfer_to_missing_account_is_dead_lettered(pool: PgPool) {
    let (pipeline, store, _, _) = pipeline(&pool).await;
    let from = seed_account(&pool, 2405, Currency::Gbp).await;
    let to = fresh_id();

    let body = format!(r#"{{"from":{from},"to":{to},"amount":500}}"#);
    let result = pipeline.handle(TxKind::Transfer, body.as_bytes()).await;
    assert_eq!(Disposition::of(&result), Disposition::DeadLetter);

    assert_eq!(store.select_by_id(from).await.unwrap().balance_minor, 2405);
    assert!(audit_rows(&pool, from).await.is_empty());
}

#[sqlx::test]
async fn test_malformed_payload_is_dead_lettered(pool: PgPool) {
    let (pipeline, _, _, _) = pipeline(&pool).await;
    let result = pipeline.handle(TxKind::Deposit, b"{ not json").await;
    assert_eq!(Disposition::of(&result), Disposition::DeadLetter);

    let result = pipeline
        .handle(TxKind::Withdraw, br#"{"id":1,"amount":-5}"#)
        .await;
    assert_eq!(Disposition::of(&result), Disposition::DeadLetter);
}

#[sqlx::test]
async fn test_replayed_message_id_is_applied_once(pool: PgPool) {
    let (pipeline, store, _, audit) = pipeline(&pool).await;
    let id = seed_account(&pool, 1000, Currency::Eur).await;
    let msg_id = Uuid::new_v4();

    let body = serde_json::to_vec(&BalanceMessage {
        account_id: id,
        amount: 250,
        msg_id: Some(msg_id),
    })
    .unwrap();

    let first = pipeline.handle(TxKind::Deposit, &body).await;
    assert!(first.unwrap().is_some());

    // the broker redelivers after a crash between commit and ack
    let second = pipeline.handle(TxKind::Deposit, &body).await;
    assert_eq!(Disposition::of(&second), Disposition::Ack);
    assert!(second.unwrap().is_none());

    assert_eq!(store.select_by_id(id).await.unwrap().balance_minor, 1250);
    assert!(audit.seen(msg_id).await.unwrap());
    assert_eq!(audit_rows(&pool, id).await.len(), 1);
}

#[sqlx::test]
#[ignore = "needs a running rabbitmq broker"]
async fn test_end_to_end_deposit_over_the_broker(pool: PgPool) {
    let cfg = test_config();
    let (pipeline, store, cache, _) = pipeline(&pool).await;
    let id = seed_account(&pool, 15540, Currency::Gbp).await;

    let conn = Conn::connect(&cfg).await.unwrap();
    conn.declare_queues().await.unwrap();

    let (shutdown_tx, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);
    let consumer = TransactionConsumer::new(pipeline, cfg.mq_concurrency, cfg.mq_max_reconnect);
    let supervisor = tokio::spawn(consumer.supervise(cfg.clone(), conn, shutdown.clone()));

    let producer = Conn::connect(&cfg).await.unwrap();
    producer
        .publish_deposit(&BalanceMessage {
            account_id: id,
            amount: 10,
            msg_id: Some(Uuid::new_v4()),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.select_by_id(id).await.unwrap().balance_minor, 15550);
    assert_eq!(cache.get(id).await, Some(Money::new(15550, Currency::Gbp)));
    assert_eq!(
        audit_rows(&pool, id).await,
        vec![(id, 0, "deposit".to_owned(), true)]
    );

    // a shutdown request drains the session and the supervisor exits
    let _ = shutdown.send(true);
    supervisor.await.unwrap();
    producer.close().await;
}
