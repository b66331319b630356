use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::audit::TxKind;
use crate::config::Config;
use crate::message::{BalanceMessage, TransferMessage};

pub const EXCHANGE: &str = "payments";

pub const QUEUE_DEPOSITS: &str = "deposits";
pub const QUEUE_WITHDRAWS: &str = "withdraws";
pub const QUEUE_TRANSFERS: &str = "transfers";

pub const KEY_DEPOSIT: &str = "dep";
pub const KEY_WITHDRAW: &str = "wit";
pub const KEY_TRANSFER: &str = "trnsfr";

impl TxKind {
    pub fn queue(self) -> &'static str {
        match self {
            TxKind::Deposit => QUEUE_DEPOSITS,
            TxKind::Withdraw => QUEUE_WITHDRAWS,
            TxKind::Transfer => QUEUE_TRANSFERS,
        }
    }

    pub fn routing_key(self) -> &'static str {
        match self {
            TxKind::Deposit => KEY_DEPOSIT,
            TxKind::Withdraw => KEY_WITHDRAW,
            TxKind::Transfer => KEY_TRANSFER,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// One broker connection and one channel per process. Publishes and consumes
/// interleave on the channel; lapin guarantees its own thread safety.
pub struct Conn {
    connection: Connection,
    pub channel: Channel,
    closed: mpsc::UnboundedReceiver<lapin::Error>,
}

impl Conn {
    pub async fn connect(cfg: &Config) -> Result<Self, Error> {
        info!("connecting to mq");

        let uri = format!(
            "amqp://{}:{}@{}:{}/%2f",
            cfg.mq_user, cfg.mq_password, cfg.mq_host, cfg.mq_port
        );
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(&uri, options).await?;

        // Abnormal closes land here; the supervisor reads them to decide on
        // reconnection. A close we initiated does not fire the callback.
        let (tx, closed) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = tx.send(err);
        });

        let channel = connection.create_channel().await?;
        info!("verified mq connection");

        Ok(Self {
            connection,
            channel,
            closed,
        })
    }

    /// Declare the topic exchange and the three durable work queues, and
    /// bind them by routing key. Safe to repeat on reconnect.
    pub async fn declare_queues(&self) -> Result<(), Error> {
        self.channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for kind in [TxKind::Deposit, TxKind::Withdraw, TxKind::Transfer] {
            self.channel
                .queue_declare(
                    kind.queue(),
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            self.channel
                .queue_bind(
                    kind.queue(),
                    EXCHANGE,
                    kind.routing_key(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(())
    }

    /// Next abnormal-close event, if any. Resolves to `None` once the
    /// connection object is gone.
    pub async fn closed(&mut self) -> Option<lapin::Error> {
        self.closed.recv().await
    }

    pub async fn close(&self) {
        let _ = self.connection.close(200, "shutting down").await;
    }

    pub async fn publish_deposit(&self, msg: &BalanceMessage) -> Result<(), Error> {
        self.publish(KEY_DEPOSIT, msg).await
    }

    pub async fn publish_withdraw(&self, msg: &BalanceMessage) -> Result<(), Error> {
        self.publish(KEY_WITHDRAW, msg).await
    }

    pub async fn publish_transfer(&self, msg: &TransferMessage) -> Result<(), Error> {
        self.publish(KEY_TRANSFER, msg).await
    }

    // Payment messages are persistent; losing one across a broker restart
    // would lose a payment.
    async fn publish<T: Serialize>(&self, routing_key: &str, msg: &T) -> Result<(), Error> {
        let body = serde_json::to_vec(msg)?;
        self.channel
            .basic_publish(
                EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_message_id(Uuid::new_v4().to_string().into())
                    .with_delivery_mode(2),
            )
            .await?;
        Ok(())
    }
}
