use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::time;

use crate::money::{Currency, UnsupportedCurrency};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub customer_id: i64,
    #[sqlx(rename = "balance_in_decimal")]
    #[serde(rename = "balance")]
    pub balance_minor: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub frozen: bool,
}

/// The slice of an account a transfer needs to lock and rewrite.
#[derive(Clone, Copy, Debug, PartialEq, sqlx::FromRow)]
pub struct AccountBalance {
    pub id: i64,
    #[sqlx(rename = "balance_in_decimal")]
    pub balance_minor: i64,
    pub currency: Currency,
    pub frozen: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationRequest {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "balance", default)]
    pub initial_balance: i64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("firstname and lastname are required fields")]
    MissingName,
    #[error("initial deposit can't be negative")]
    NegativeInitialBalance,
    #[error(transparent)]
    Currency(#[from] UnsupportedCurrency),
}

impl CreationRequest {
    /// Field-level validation, done before anything touches the store.
    pub fn validate(&self) -> Result<Currency, ValidationError> {
        if self.first_name.is_empty() || self.last_name.is_empty() {
            return Err(ValidationError::MissingName);
        }
        if self.initial_balance < 0 {
            return Err(ValidationError::NegativeInitialBalance);
        }
        Ok(self.currency.parse()?)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("account id {0} is not found")]
    NotFound(i64),
    #[error("insufficient funds, current balance is {balance}")]
    InsufficientFunds { balance: i64 },
    #[error("transfer references two unknown accounts")]
    InvalidAccounts,
    #[error("transfer references missing account id {missing}")]
    InvalidTransfer { missing: i64 },
    #[error("account id {0} is frozen")]
    Frozen(i64),
    #[error("transfer currencies do not match")]
    CurrencyMismatch,
    #[error("balance overflow")]
    Overflow,
    #[error("operation exceeded its deadline")]
    Deadline,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl Error {
    /// Domain errors describe a logically invalid request; retrying the same
    /// input cannot succeed. Everything else is transient infrastructure.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Error::Db(_) | Error::Deadline)
    }
}

const SELECT_ALL: &str = "SELECT id, customer_id, balance_in_decimal, currency, created_at, modified_at, frozen \
     FROM accounts ORDER BY id";
const SELECT_BY_ID: &str = "SELECT id, customer_id, balance_in_decimal, currency, created_at, modified_at, frozen \
     FROM accounts WHERE id = $1";
const SELECT_FOR_UPDATE: &str = "SELECT id, customer_id, balance_in_decimal, currency, created_at, modified_at, frozen \
     FROM accounts WHERE id = $1 FOR UPDATE";
const SELECT_TWO_FOR_UPDATE: &str =
    "SELECT id, balance_in_decimal, currency, frozen FROM accounts WHERE id = $1 OR id = $2 FOR UPDATE";
const INSERT: &str = "INSERT INTO accounts(customer_id, balance_in_decimal, currency, created_at, modified_at, frozen) \
     VALUES($1,$2,$3,$4,$4,FALSE) \
     RETURNING id, customer_id, balance_in_decimal, currency, created_at, modified_at, frozen";
const DELETE_BY_ID: &str = "DELETE FROM accounts WHERE id = $1";
const FREEZE_BY_ID: &str = "UPDATE accounts SET frozen = TRUE, modified_at = $1 WHERE id = $2";
const UPDATE_BALANCE: &str =
    "UPDATE accounts SET balance_in_decimal = $1, modified_at = $2 WHERE id = $3";
// Both legs of a transfer change in one statement, under one snapshot, with
// an identical modified_at.
const UPDATE_BALANCES: &str = "UPDATE accounts AS a \
     SET balance_in_decimal = a2.balance_in_decimal, modified_at = a2.modified_at \
     FROM (VALUES ($1::bigint, $2::bigint, $3::timestamptz), ($4::bigint, $5::bigint, $6::timestamptz)) \
     AS a2(id, balance_in_decimal, modified_at) \
     WHERE a2.id = a.id";

const REPEATABLE_READ: &str = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ";

/// Wall-clock limit on a single mutation, expiry rolls back.
const OP_DEADLINE: Duration = Duration::from_secs(1);

/// ACID persistence of accounts. Balance safety rests entirely on row locks
/// under repeatable read; no in-process locking anywhere.
#[derive(Clone)]
pub struct AccountStore {
    pool: PgPool,
}

impl AccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn select_all(&self) -> Result<Vec<Account>, Error> {
        Ok(sqlx::query_as::<_, Account>(SELECT_ALL)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn select_by_id(&self, id: i64) -> Result<Account, Error> {
        sqlx::query_as::<_, Account>(SELECT_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound(id))
    }

    pub async fn create(
        &self,
        customer_id: i64,
        initial_balance: i64,
        currency: Currency,
    ) -> Result<Account, Error> {
        time::timeout(
            OP_DEADLINE,
            self.create_tx(customer_id, initial_balance, currency),
        )
        .await
        .map_err(|_| Error::Deadline)?
    }

    async fn create_tx(
        &self,
        customer_id: i64,
        initial_balance: i64,
        currency: Currency,
    ) -> Result<Account, Error> {
        let mut tx = self.pool.begin().await?;
        let account = sqlx::query_as::<_, Account>(INSERT)
            .bind(customer_id)
            .bind(initial_balance)
            .bind(currency)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(account)
    }

    pub async fn delete(&self, id: i64) -> Result<(), Error> {
        time::timeout(OP_DEADLINE, self.delete_tx(id))
            .await
            .map_err(|_| Error::Deadline)?
    }

    async fn delete_tx(&self, id: i64) -> Result<(), Error> {
        self.select_by_id(id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(DELETE_BY_ID).bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// One-way transition; freezing an already-frozen account is a no-op
    /// reported as success.
    pub async fn freeze(&self, id: i64) -> Result<Account, Error> {
        time::timeout(OP_DEADLINE, self.freeze_tx(id))
            .await
            .map_err(|_| Error::Deadline)?
    }

    async fn freeze_tx(&self, id: i64) -> Result<Account, Error> {
        let mut tx = self.pool.begin().await?;
        let account = sqlx::query_as::<_, Account>(SELECT_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;
        if account.frozen {
            return Ok(account);
        }
        let now = Utc::now();
        sqlx::query(FREEZE_BY_ID)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Account {
            frozen: true,
            modified_at: now,
            ..account
        })
    }

    pub async fn deposit(&self, id: i64, amount: i64) -> Result<Account, Error> {
        time::timeout(OP_DEADLINE, self.balance_op(id, amount, BalanceOp::Deposit))
            .await
            .map_err(|_| Error::Deadline)?
    }

    pub async fn withdraw(&self, id: i64, amount: i64) -> Result<Account, Error> {
        time::timeout(OP_DEADLINE, self.balance_op(id, amount, BalanceOp::Withdraw))
            .await
            .map_err(|_| Error::Deadline)?
    }

    async fn balance_op(&self, id: i64, amount: i64, op: BalanceOp) -> Result<Account, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(REPEATABLE_READ).execute(&mut *tx).await?;

        let account = sqlx::query_as::<_, Account>(SELECT_FOR_UPDATE)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::NotFound(id))?;
        if account.frozen {
            return Err(Error::Frozen(id));
        }

        let new_balance = op.apply(account.balance_minor, amount)?;
        let now = Utc::now();
        sqlx::query(UPDATE_BALANCE)
            .bind(new_balance)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Account {
            balance_minor: new_balance,
            modified_at: now,
            ..account
        })
    }

    pub async fn transfer(
        &self,
        from_id: i64,
        to_id: i64,
        amount: i64,
    ) -> Result<(AccountBalance, AccountBalance), Error> {
        time::timeout(OP_DEADLINE, self.transfer_tx(from_id, to_id, amount))
            .await
            .map_err(|_| Error::Deadline)?
    }

    async fn transfer_tx(
        &self,
        from_id: i64,
        to_id: i64,
        amount: i64,
    ) -> Result<(AccountBalance, AccountBalance), Error> {
        if from_id == to_id {
            return self.self_transfer(from_id, amount).await;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(REPEATABLE_READ).execute(&mut *tx).await?;

        let rows = sqlx::query_as::<_, AccountBalance>(SELECT_TWO_FOR_UPDATE)
            .bind(from_id)
            .bind(to_id)
            .fetch_all(&mut *tx)
            .await?;
        let (from, to) = match rows.as_slice() {
            [] => return Err(Error::InvalidAccounts),
            [only] => {
                let missing = if only.id == from_id { to_id } else { from_id };
                return Err(Error::InvalidTransfer { missing });
            }
            [a, b] if a.id == from_id => (*a, *b),
            [a, b] => (*b, *a),
            _ => return Err(Error::InvalidAccounts),
        };

        if from.frozen {
            return Err(Error::Frozen(from.id));
        }
        if to.frozen {
            return Err(Error::Frozen(to.id));
        }
        if from.currency != to.currency {
            return Err(Error::CurrencyMismatch);
        }
        if from.balance_minor < amount {
            return Err(Error::InsufficientFunds {
                balance: from.balance_minor,
            });
        }

        let new_from = from.balance_minor - amount;
        let new_to = to
            .balance_minor
            .checked_add(amount)
            .ok_or(Error::Overflow)?;
        let now = Utc::now();

        sqlx::query(UPDATE_BALANCES)
            .bind(from.id)
            .bind(new_from)
            .bind(now)
            .bind(to.id)
            .bind(new_to)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((
            AccountBalance {
                balance_minor: new_from,
                ..from
            },
            AccountBalance {
                balance_minor: new_to,
                ..to
            },
        ))
    }

    // A transfer between an account and itself only makes sense as a no-op;
    // anything with a nonzero amount is rejected as naming invalid endpoints.
    async fn self_transfer(
        &self,
        id: i64,
        amount: i64,
    ) -> Result<(AccountBalance, AccountBalance), Error> {
        if amount != 0 {
            return Err(Error::InvalidAccounts);
        }
        let account = self.select_by_id(id).await.map_err(|err| match err {
            Error::NotFound(_) => Error::InvalidAccounts,
            other => other,
        })?;
        if account.frozen {
            return Err(Error::Frozen(id));
        }
        let balance = AccountBalance {
            id: account.id,
            balance_minor: account.balance_minor,
            currency: account.currency,
            frozen: account.frozen,
        };
        Ok((balance, balance))
    }
}

#[derive(Clone, Copy, Debug)]
enum BalanceOp {
    Deposit,
    Withdraw,
}

impl BalanceOp {
    fn apply(self, balance: i64, amount: i64) -> Result<i64, Error> {
        match self {
            BalanceOp::Deposit => balance.checked_add(amount).ok_or(Error::Overflow),
            BalanceOp::Withdraw => {
                if balance < amount {
                    Err(Error::InsufficientFunds { balance })
                } else {
                    Ok(balance - amount)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(first: &str, last: &str, balance: i64, currency: &str) -> CreationRequest {
        CreationRequest {
            first_name: first.into(),
            last_name: last.into(),
            email: "first@last.com".into(),
            initial_balance: balance,
            currency: currency.into(),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_request() {
        assert_eq!(
            request("Jane", "Doe", 1500, "GBP").validate(),
            Ok(Currency::Gbp)
        );
        assert_eq!(
            request("Jane", "Doe", 0, "EUR").validate(),
            Ok(Currency::Eur)
        );
    }

    #[test]
    fn test_validate_requires_names() {
        assert_eq!(
            request("", "Doe", 100, "GBP").validate(),
            Err(ValidationError::MissingName)
        );
        assert_eq!(
            request("Jane", "", 100, "GBP").validate(),
            Err(ValidationError::MissingName)
        );
    }

    #[test]
    fn test_validate_rejects_negative_initial_balance() {
        assert_eq!(
            request("Jane", "Doe", -1, "GBP").validate(),
            Err(ValidationError::NegativeInitialBalance)
        );
    }

    #[test]
    fn test_validate_rejects_unknown_currency() {
        assert!(matches!(
            request("Jane", "Doe", 100, "CHF").validate(),
            Err(ValidationError::Currency(_))
        ));
    }

    #[test]
    fn test_withdraw_boundaries() {
        // draining the account exactly is fine, one more minor unit is not
        assert_eq!(BalanceOp::Withdraw.apply(100, 100).unwrap(), 0);
        assert!(matches!(
            BalanceOp::Withdraw.apply(100, 101),
            Err(Error::InsufficientFunds { balance: 100 })
        ));
    }

    #[test]
    fn test_deposit_overflow() {
        assert!(matches!(
            BalanceOp::Deposit.apply(i64::MAX, 1),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn test_deposit_then_withdraw_restores_balance() {
        let after = BalanceOp::Deposit.apply(15540, 10).unwrap();
        assert_eq!(after, 15550);
        assert_eq!(BalanceOp::Withdraw.apply(after, 10).unwrap(), 15540);
    }

    #[test]
    fn test_domain_errors_are_distinguished_from_transient() {
        assert!(Error::NotFound(1).is_domain());
        assert!(Error::InsufficientFunds { balance: 0 }.is_domain());
        assert!(Error::InvalidAccounts.is_domain());
        assert!(Error::InvalidTransfer { missing: 2 }.is_domain());
        assert!(Error::Frozen(1).is_domain());
        assert!(Error::CurrencyMismatch.is_domain());
        assert!(!Error::Deadline.is_domain());
        assert!(!Error::Db(sqlx::Error::PoolClosed).is_domain());
    }
}
