//! Durable work-queue consumer: three worker pools (one per queue) that
//! drive the account store, refresh the balance cache, append audit records
//! and emit notifications, plus the supervisor owning the broker session.
//!
//! A session moves through
//! `Dialing -> Declaring -> Consuming -> (Reconnecting -> Dialing | Draining -> Exited)`:
//! an abnormal close is answered with bounded redials, a normal close or a
//! shutdown request drains in-flight deliveries and exits.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::{self, AccountStore};
use crate::audit::{AuditLog, TxKind, TxRecord};
use crate::cache::BalanceCache;
use crate::config::Config;
use crate::message::{self, BalanceMessage, TransferMessage};
use crate::money::Money;
use crate::mq::{self, Conn};
use crate::notification;

/// Attempts at attaching a queue consumer before giving up.
const ATTACH_ATTEMPTS: u32 = 10;
const ATTACH_BACKOFF: Duration = Duration::from_secs(3);
/// Cadence of redial attempts after an abnormal close.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

const KINDS: [TxKind; 3] = [TxKind::Deposit, TxKind::Withdraw, TxKind::Transfer];

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Message(#[from] message::Error),
    #[error(transparent)]
    Store(#[from] account::Error),
    #[error(transparent)]
    Mq(#[from] mq::Error),
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Error::Mq(err.into())
    }
}

/// What the broker should do with a delivery once we are done with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack without requeue: the message is logically invalid and a retry
    /// cannot change the outcome.
    DeadLetter,
    /// Nack with requeue: transient infrastructure failure, eligible for
    /// redelivery.
    Requeue,
}

impl Disposition {
    pub fn of<T>(result: &Result<T, Error>) -> Disposition {
        match result {
            Ok(_) => Disposition::Ack,
            Err(Error::Message(_)) => Disposition::DeadLetter,
            Err(Error::Store(err)) if err.is_domain() => Disposition::DeadLetter,
            Err(_) => Disposition::Requeue,
        }
    }
}

/// The per-message processing path, shared by all workers. Store success is
/// the commit point; cache and audit writes after it are best-effort.
#[derive(Clone)]
pub struct Pipeline {
    store: AccountStore,
    audit: AuditLog,
    cache: BalanceCache,
}

impl Pipeline {
    pub fn new(store: AccountStore, audit: AuditLog, cache: BalanceCache) -> Self {
        Self {
            store,
            audit,
            cache,
        }
    }

    /// Decode, validate and apply one delivery body. `Ok(Some)` carries the
    /// audit record for notification; `Ok(None)` means the work was already
    /// applied (dedup) or auditing failed.
    pub async fn handle(&self, kind: TxKind, body: &[u8]) -> Result<Option<TxRecord>, Error> {
        match kind {
            TxKind::Deposit => self.deposit(body).await,
            TxKind::Withdraw => self.withdraw(body).await,
            TxKind::Transfer => self.transfer(body).await,
        }
    }

    async fn deposit(&self, body: &[u8]) -> Result<Option<TxRecord>, Error> {
        let msg: BalanceMessage = message::decode(body)?;
        msg.validate()?;
        if self.already_applied(msg.msg_id).await {
            return Ok(None);
        }

        let account = self.store.deposit(msg.account_id, msg.amount).await?;
        info!(
            "successfully deposited amount {} to account {}",
            msg.amount, account.id
        );

        self.cache
            .set(account.id, Money::new(account.balance_minor, account.currency))
            .await;
        Ok(self
            .append_audit(TxKind::Deposit, account.id, 0, msg.msg_id)
            .await)
    }

    async fn withdraw(&self, body: &[u8]) -> Result<Option<TxRecord>, Error> {
        let msg: BalanceMessage = message::decode(body)?;
        msg.validate()?;
        if self.already_applied(msg.msg_id).await {
            return Ok(None);
        }

        let account = self.store.withdraw(msg.account_id, msg.amount).await?;
        info!(
            "successfully withdrew amount {} from account {}",
            msg.amount, account.id
        );

        self.cache
            .set(account.id, Money::new(account.balance_minor, account.currency))
            .await;
        Ok(self
            .append_audit(TxKind::Withdraw, account.id, 0, msg.msg_id)
            .await)
    }

    async fn transfer(&self, body: &[u8]) -> Result<Option<TxRecord>, Error> {
        let msg: TransferMessage = message::decode(body)?;
        msg.validate()?;
        if self.already_applied(msg.msg_id).await {
            return Ok(None);
        }

        let (from, to) = self
            .store
            .transfer(msg.from_id, msg.to_id, msg.amount)
            .await?;
        info!(
            "successfully transferred amount {} from account {} to account {}",
            msg.amount, from.id, to.id
        );

        self.cache
            .set(from.id, Money::new(from.balance_minor, from.currency))
            .await;
        self.cache
            .set(to.id, Money::new(to.balance_minor, to.currency))
            .await;
        Ok(self
            .append_audit(TxKind::Transfer, from.id, to.id, msg.msg_id)
            .await)
    }

    // Best-effort dedup for redeliveries of already-committed work. Errors
    // fall back to applying the message; at-least-once still holds.
    async fn already_applied(&self, msg_id: Option<Uuid>) -> bool {
        let Some(id) = msg_id else {
            return false;
        };
        match self.audit.seen(id).await {
            Ok(true) => {
                debug!("message {id} was already applied, acknowledging replay");
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!("dedup lookup for message {id} failed: {err}");
                false
            }
        }
    }

    // A failed audit append never undoes the payment; it is logged and the
    // delivery is still acknowledged.
    async fn append_audit(
        &self,
        kind: TxKind,
        from_id: i64,
        to_id: i64,
        message_id: Option<Uuid>,
    ) -> Option<TxRecord> {
        match self
            .audit
            .append(from_id, to_id, kind, true, message_id)
            .await
        {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("audit record creation for account id {from_id} failed: {err}");
                None
            }
        }
    }
}

/// Worker pools over the three durable queues plus the session supervisor.
pub struct TransactionConsumer {
    pipeline: Pipeline,
    concurrency: u16,
    max_reconnect: u32,
}

impl TransactionConsumer {
    pub fn new(pipeline: Pipeline, concurrency: u16, max_reconnect: u32) -> Self {
        Self {
            pipeline,
            concurrency,
            max_reconnect,
        }
    }

    /// Attach all worker pools on an open connection. Each worker owns its
    /// own delivery stream and processes it serially; the pools share one
    /// channel with prefetch bounded to 4x the pool size.
    pub async fn start(
        &self,
        conn: &Conn,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinSet<()>, Error> {
        conn.channel
            .basic_qos(4 * self.concurrency, BasicQosOptions::default())
            .await?;

        let mut workers = JoinSet::new();
        for kind in KINDS {
            for worker in 0..self.concurrency {
                let consumer = attach(&conn.channel, kind, worker).await?;
                workers.spawn(worker_loop(
                    self.pipeline.clone(),
                    conn.channel.clone(),
                    consumer,
                    kind,
                    shutdown.clone(),
                ));
            }
        }
        Ok(workers)
    }

    /// Long-lived session supervisor. Consumes until the connection closes;
    /// an abnormal close is retried with bounded redials, a normal close or
    /// a shutdown request drains and exits. Announces its own exit through
    /// `shutdown` so the rest of the process can follow.
    pub async fn supervise(self, cfg: Config, conn: Conn, shutdown: Arc<watch::Sender<bool>>) {
        let mut live = match self.start(&conn, shutdown.subscribe()).await {
            Ok(workers) => Some(Live { conn, workers }),
            Err(err) => {
                error!("error starting consumers: {err}");
                drop(conn);
                None
            }
        };
        let mut phase = match live {
            Some(_) => Phase::Consuming,
            None => Phase::Reconnecting { attempt: 0 },
        };

        loop {
            let event = match phase {
                Phase::Consuming => {
                    let event = match live.as_mut() {
                        Some(session) => session.next_event(&shutdown).await,
                        None => Event::AbnormalClose,
                    };
                    if event == Event::AbnormalClose {
                        // the dead connection takes the old workers down
                        // with it once their streams end
                        if let Some(Live { conn, workers }) = live.take() {
                            drop(conn);
                            drain(workers).await;
                        }
                    }
                    event
                }
                Phase::Reconnecting { attempt } => {
                    self.reconnect_event(&cfg, attempt, &shutdown, &mut live)
                        .await
                }
                Phase::Draining => {
                    if let Some(Live { conn, workers }) = live.take() {
                        drain(workers).await;
                        conn.close().await;
                    }
                    Event::Drained
                }
                Phase::Exited => break,
            };
            phase = phase.step(event, self.max_reconnect);
        }

        // Whatever path led here, the pipeline is gone; tell the process.
        let _ = shutdown.send(true);
    }

    /// One redial, preceded by its delay. A shutdown request during the
    /// wait wins over another dial.
    async fn reconnect_event(
        &self,
        cfg: &Config,
        attempt: u32,
        shutdown: &watch::Sender<bool>,
        live: &mut Option<Live>,
    ) -> Event {
        let mut watching = shutdown.subscribe();
        tokio::select! {
            biased;
            _ = watching.wait_for(|stop| *stop) => return Event::ShutdownRequested,
            _ = time::sleep(RECONNECT_DELAY) => {}
        }

        info!("attempting to reconnect to mq");
        match self.redial(cfg, shutdown.subscribe()).await {
            Ok(session) => {
                info!("reconnected to mq");
                *live = Some(session);
                Event::RedialSucceeded
            }
            Err(err) => {
                warn!("reconnect attempt {} failed: {err}", attempt + 1);
                if attempt + 1 >= self.max_reconnect {
                    error!("reached max attempts, unable to reconnect to mq");
                }
                Event::RedialFailed
            }
        }
    }

    async fn redial(&self, cfg: &Config, shutdown: watch::Receiver<bool>) -> Result<Live, Error> {
        let conn = Conn::connect(cfg).await?;
        conn.declare_queues().await?;
        let workers = self.start(&conn, shutdown).await?;
        Ok(Live { conn, workers })
    }
}

/// An established session: the connection and the worker pools on it.
struct Live {
    conn: Conn,
    workers: JoinSet<()>,
}

impl Live {
    /// Wait for whatever ends the consuming phase.
    async fn next_event(&mut self, shutdown: &watch::Sender<bool>) -> Event {
        let mut watching = shutdown.subscribe();
        tokio::select! {
            // poll order matters: a pending close event must win over the
            // worker exits it caused
            biased;
            _ = watching.wait_for(|stop| *stop) => Event::ShutdownRequested,
            closed = self.conn.closed() => match closed {
                Some(err) => {
                    error!("closed mq connection: {err}");
                    Event::AbnormalClose
                }
                None => {
                    info!("mq connection closed normally, will not reconnect");
                    Event::NormalClose
                }
            },
            // delivery streams ended without a close event
            _ = self.workers.join_next() => {
                info!("mq connection closed normally, will not reconnect");
                Event::NormalClose
            }
        }
    }
}

/// Control skeleton of a consumer session, kept apart from the connection
/// and worker handles so the transitions can be exercised on their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Consuming,
    Reconnecting { attempt: u32 },
    Draining,
    Exited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    ShutdownRequested,
    AbnormalClose,
    NormalClose,
    RedialSucceeded,
    RedialFailed,
    Drained,
}

impl Phase {
    fn step(self, event: Event, max_reconnect: u32) -> Phase {
        match (self, event) {
            (Phase::Consuming, Event::ShutdownRequested | Event::NormalClose) => Phase::Draining,
            (Phase::Consuming, Event::AbnormalClose) => Phase::reconnect(0, max_reconnect),
            (Phase::Reconnecting { .. }, Event::RedialSucceeded) => Phase::Consuming,
            (Phase::Reconnecting { .. }, Event::ShutdownRequested) => Phase::Exited,
            (Phase::Reconnecting { attempt }, Event::RedialFailed) => {
                Phase::reconnect(attempt + 1, max_reconnect)
            }
            (Phase::Draining, Event::Drained) => Phase::Exited,
            (phase, _) => phase,
        }
    }

    // Another redial happens only under the attempt bound.
    fn reconnect(attempt: u32, max_reconnect: u32) -> Phase {
        if attempt >= max_reconnect {
            Phase::Exited
        } else {
            Phase::Reconnecting { attempt }
        }
    }
}

async fn drain(mut workers: JoinSet<()>) {
    while workers.join_next().await.is_some() {}
}

async fn attach(
    channel: &Channel,
    kind: TxKind,
    worker: u16,
) -> Result<lapin::Consumer, lapin::Error> {
    let tag = format!("{}-consumer-{worker}", kind.as_str());
    let mut attempt = 0;
    loop {
        match channel
            .basic_consume(
                kind.queue(),
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => return Ok(consumer),
            Err(err) if attempt + 1 < ATTACH_ATTEMPTS => {
                warn!("failed to attach {tag} (attempt {}): {err}", attempt + 1);
                attempt += 1;
                time::sleep(ATTACH_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Serial loop over one delivery stream. A shutdown request stops reading
/// but lets the delivery in hand finish and settle first; a closed stream
/// (broker tear-down) ends the loop.
async fn worker_loop(
    pipeline: Pipeline,
    channel: Channel,
    mut consumer: lapin::Consumer,
    kind: TxKind,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    warn!("{} delivery stream failed: {err}", kind.as_str());
                    break;
                }
                None => break,
            },
            _ = shutdown.wait_for(|stop| *stop) => break,
        };

        let result = pipeline.handle(kind, &delivery.data).await;
        if let Ok(Some(record)) = &result {
            notification::publish(&channel, record).await;
        }
        settle(&delivery, kind, result).await;
    }
}

async fn settle(delivery: &Delivery, kind: TxKind, result: Result<Option<TxRecord>, Error>) {
    let disposition = Disposition::of(&result);
    if let Err(err) = &result {
        match disposition {
            Disposition::DeadLetter => {
                warn!("dead-lettering {} message: {err}", kind.as_str())
            }
            _ => warn!("requeueing {} message: {err}", kind.as_str()),
        }
    }

    let settled = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::DeadLetter => {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        }
        Disposition::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(err) = settled {
        warn!("failed to settle {} delivery: {err}", kind.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_acked() {
        assert_eq!(Disposition::of(&Ok(())), Disposition::Ack);
    }

    #[test]
    fn test_invalid_payloads_are_dead_lettered() {
        assert_eq!(
            Disposition::of::<()>(&Err(message::Error::Payload.into())),
            Disposition::DeadLetter
        );
        assert_eq!(
            Disposition::of::<()>(&Err(message::Error::NegativeAmount.into())),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn test_domain_errors_are_dead_lettered() {
        for err in [
            account::Error::NotFound(1),
            account::Error::InsufficientFunds { balance: 100 },
            account::Error::InvalidAccounts,
            account::Error::InvalidTransfer { missing: 2 },
            account::Error::Frozen(1),
            account::Error::CurrencyMismatch,
        ] {
            assert_eq!(
                Disposition::of::<()>(&Err(err.into())),
                Disposition::DeadLetter
            );
        }
    }

    #[test]
    fn test_transient_errors_are_requeued() {
        assert_eq!(
            Disposition::of::<()>(&Err(account::Error::Deadline.into())),
            Disposition::Requeue
        );
        assert_eq!(
            Disposition::of::<()>(&Err(account::Error::Db(sqlx::Error::PoolClosed).into())),
            Disposition::Requeue
        );
        assert_eq!(
            Disposition::of::<()>(&Err(lapin::Error::ChannelsLimitReached.into())),
            Disposition::Requeue
        );
    }

    #[test]
    fn test_abnormal_close_starts_redialing() {
        assert_eq!(
            Phase::Consuming.step(Event::AbnormalClose, 5),
            Phase::Reconnecting { attempt: 0 }
        );
    }

    #[test]
    fn test_redial_failures_count_up_to_the_bound() {
        let mut phase = Phase::Consuming.step(Event::AbnormalClose, 3);
        let mut dials = 0;
        while let Phase::Reconnecting { .. } = phase {
            dials += 1;
            phase = phase.step(Event::RedialFailed, 3);
        }
        assert_eq!(dials, 3);
        assert_eq!(phase, Phase::Exited);
    }

    #[test]
    fn test_successful_redial_resumes_consuming() {
        let mut phase = Phase::Consuming.step(Event::AbnormalClose, 5);
        phase = phase.step(Event::RedialFailed, 5);
        assert_eq!(phase, Phase::Reconnecting { attempt: 1 });
        phase = phase.step(Event::RedialSucceeded, 5);
        assert_eq!(phase, Phase::Consuming);
        // the attempt counter starts over on the next outage
        assert_eq!(
            phase.step(Event::AbnormalClose, 5),
            Phase::Reconnecting { attempt: 0 }
        );
    }

    #[test]
    fn test_shutdown_and_normal_close_drain_then_exit() {
        for event in [Event::ShutdownRequested, Event::NormalClose] {
            let phase = Phase::Consuming.step(event, 5);
            assert_eq!(phase, Phase::Draining);
            assert_eq!(phase.step(Event::Drained, 5), Phase::Exited);
        }
    }

    #[test]
    fn test_shutdown_interrupts_redialing() {
        assert_eq!(
            Phase::Reconnecting { attempt: 2 }.step(Event::ShutdownRequested, 5),
            Phase::Exited
        );
    }

    #[test]
    fn test_zero_reconnect_bound_exits_without_redialing() {
        assert_eq!(Phase::Consuming.step(Event::AbnormalClose, 0), Phase::Exited);
    }
}
