use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::info;

use crate::config::Config;

const MAX_CONNECTIONS: u32 = 10;

/// Open the shared connection pool and verify the database answers before
/// anything else starts.
pub async fn connect(cfg: &Config) -> Result<PgPool, sqlx::Error> {
    info!("connecting to database");

    let options = PgConnectOptions::new()
        .host(&cfg.db_host)
        .port(cfg.db_port)
        .username(&cfg.db_user)
        .password(&cfg.db_password)
        .database(&cfg.db_name)
        .ssl_mode(PgSslMode::Disable);

    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("verified postgres connection");

    Ok(pool)
}
