use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Queue payloads for the three balance operations. Amounts are minor units;
/// `msgId` is an optional producer-supplied dedup id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceMessage {
    #[serde(rename = "id")]
    pub account_id: i64,
    pub amount: i64,
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<Uuid>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferMessage {
    #[serde(rename = "from")]
    pub from_id: i64,
    #[serde(rename = "to")]
    pub to_id: i64,
    pub amount: i64,
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<Uuid>,
}

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid message payload, unable to parse")]
    Payload,
    #[error("balance operation amount can't be negative")]
    NegativeAmount,
}

/// Decode a delivery body. The concrete decode failure is irrelevant to the
/// caller; a body we cannot parse is irrecoverable either way.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|_| Error::Payload)
}

fn validate_amount(amount: i64) -> Result<(), Error> {
    if amount < 0 {
        return Err(Error::NegativeAmount);
    }
    Ok(())
}

impl BalanceMessage {
    pub fn validate(&self) -> Result<(), Error> {
        validate_amount(self.amount)
    }
}

impl TransferMessage {
    pub fn validate(&self) -> Result<(), Error> {
        validate_amount(self.amount)
    }
}
