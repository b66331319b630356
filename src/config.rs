use std::time::Duration;

use clap::Parser;

/// Environment-sourced service configuration, all `APP_` prefixed. Flags
/// exist mostly for local runs; deployments set the environment.
#[derive(Parser, Clone, Debug)]
#[command(name = "payments-api", about = "transactional core of the payments service")]
pub struct Config {
    #[arg(long, env = "APP_DB_USER")]
    pub db_user: String,
    #[arg(long, env = "APP_DB_PASSWORD")]
    pub db_password: String,
    #[arg(long, env = "APP_DB_NAME")]
    pub db_name: String,
    #[arg(long, env = "APP_DB_HOST")]
    pub db_host: String,
    #[arg(long, env = "APP_DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    #[arg(long, env = "APP_MQ_USER")]
    pub mq_user: String,
    #[arg(long, env = "APP_MQ_PASSWORD")]
    pub mq_password: String,
    #[arg(long, env = "APP_MQ_HOST")]
    pub mq_host: String,
    #[arg(long, env = "APP_MQ_PORT", default_value_t = 5672)]
    pub mq_port: u16,
    /// Parallel workers per queue.
    #[arg(long, env = "APP_MQ_CONCURRENCY", default_value_t = 5)]
    pub mq_concurrency: u16,
    /// Redial attempts after an abnormal broker close.
    #[arg(long, env = "APP_MQ_MAXRECONNECT", default_value_t = 5)]
    pub mq_max_reconnect: u32,

    #[arg(long, env = "APP_CACHE_HOST")]
    pub cache_host: String,
    #[arg(long, env = "APP_CACHE_PASSWORD", default_value = "")]
    pub cache_password: String,
    #[arg(long, env = "APP_CACHE_PORT", default_value_t = 6379)]
    pub cache_port: u16,

    #[arg(long, env = "APP_READ_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub read_timeout: Duration,
    #[arg(long, env = "APP_WRITE_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub write_timeout: Duration,
    #[arg(long, env = "APP_SHUTDOWN_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,

    #[arg(long, env = "APP_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,
}

/// Accepts `5s`, `500ms` and bare seconds (`5`).
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        _ => Err(format!("invalid duration unit {unit:?}, use s or ms")),
    }
}
