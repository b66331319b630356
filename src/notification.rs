use std::time::Duration;

use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use serde::Serialize;
use tokio::time;
use tracing::{error, warn};
use uuid::Uuid;

use crate::audit::TxRecord;

const EXCHANGE: &str = "balance-notifications";
const ROUTING_KEY: &str = "notif";

const PUBLISH_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// What downstream listeners get to see of a completed transaction.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub tx_id: i64,
    /// The debited account for transfers.
    pub account_id: i64,
    pub created_at: DateTime<Utc>,
    pub ack: bool,
}

impl From<&TxRecord> for Notification {
    fn from(record: &TxRecord) -> Self {
        Self {
            tx_id: record.id,
            account_id: record.from_id,
            created_at: record.created_at,
            ack: record.ack,
        }
    }
}

/// Fire-and-forget publication of a successful transaction. Retries a few
/// times, then logs and gives up; notifications never block the pipeline.
pub async fn publish(channel: &Channel, record: &TxRecord) {
    let notification = Notification::from(record);
    let body = match serde_json::to_vec(&notification) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to encode notification for tx {}: {err}", record.id);
            return;
        }
    };

    for attempt in 1..=PUBLISH_ATTEMPTS {
        match try_publish(channel, &body).await {
            Ok(()) => return,
            Err(err) if attempt < PUBLISH_ATTEMPTS => {
                warn!("failed to send notification for tx {} (attempt {attempt}): {err}", record.id);
                time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                error!("giving up on notification for tx {}: {err}", record.id);
            }
        }
    }
}

async fn try_publish(channel: &Channel, body: &[u8]) -> Result<(), lapin::Error> {
    channel
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

    channel
        .basic_publish(
            EXCHANGE,
            ROUTING_KEY,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default()
                .with_content_type("application/json".into())
                .with_message_id(Uuid::new_v4().to_string().into())
                // transient on purpose, a lost notification is acceptable
                .with_delivery_mode(1),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TxKind;

    #[test]
    fn test_notification_shape() {
        let record = TxRecord {
            id: 42,
            from_id: 1,
            to_id: 2,
            kind: TxKind::Transfer,
            ack: true,
            created_at: Utc::now(),
            message_id: None,
        };
        let rendered = serde_json::to_value(Notification::from(&record)).unwrap();
        assert_eq!(rendered["txId"], 42);
        assert_eq!(rendered["accountId"], 1);
        assert_eq!(rendered["ack"], true);
        assert!(rendered.get("createdAt").is_some());
    }
}
