use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// What kind of mutation an audit row describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum TxKind {
    Deposit,
    Withdraw,
    Transfer,
}

impl TxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdraw => "withdraw",
            TxKind::Transfer => "transfer",
        }
    }
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of a completed mutation. Never updated, never deleted.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub id: i64,
    pub from_id: i64,
    /// Zero for single-account operations.
    pub to_id: i64,
    #[sqlx(rename = "transaction_type")]
    #[serde(rename = "transactionType")]
    pub kind: TxKind,
    pub ack: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

const INSERT: &str = "INSERT INTO transactions(from_id, to_id, transaction_type, ack, created_at, message_id) \
     VALUES($1,$2,$3,$4,$5,$6) \
     RETURNING id, from_id, to_id, transaction_type, ack, created_at, message_id";
const SEEN: &str = "SELECT count(1) FROM transactions WHERE message_id = $1";

#[derive(Clone)]
pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write one audit row in its own transaction. Runs after the mutation
    /// has committed; callers log and swallow failures so a committed
    /// payment stays committed.
    pub async fn append(
        &self,
        from_id: i64,
        to_id: i64,
        kind: TxKind,
        ack: bool,
        message_id: Option<Uuid>,
    ) -> Result<TxRecord, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, TxRecord>(INSERT)
            .bind(from_id)
            .bind(to_id)
            .bind(kind)
            .bind(ack)
            .bind(Utc::now())
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Whether a client-supplied message id was already recorded, i.e. the
    /// delivery is a replay of an applied mutation.
    pub async fn seen(&self, message_id: Uuid) -> Result<bool, sqlx::Error> {
        let count: i64 = sqlx::query_scalar(SEEN)
            .bind(message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}
