use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::account::CreationRequest;

#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is taken, specify another one")]
    EmailTaken(String),
    #[error(transparent)]
    Db(sqlx::Error),
}

const INSERT: &str = "INSERT INTO customers(first_name, last_name, email, created_at, modified_at) \
     VALUES($1,$2,$3,$4,$4) \
     RETURNING id, first_name, last_name, email, created_at, modified_at";

/// Insert the customer behind an account-creation request. Email uniqueness
/// is enforced by the store and surfaces as a distinct error.
pub async fn create(pool: &PgPool, req: &CreationRequest) -> Result<Customer, Error> {
    let customer = sqlx::query_as::<_, Customer>(INSERT)
        .bind(&req.first_name)
        .bind(&req.last_name)
        .bind(&req.email)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::EmailTaken(req.email.clone())
            }
            _ => Error::Db(err),
        })?;

    info!(
        "successfully created customer with email {} and id {}",
        customer.email, customer.id
    );
    Ok(customer)
}
