use chrono::{SecondsFormat, Utc};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    migrate::Migrator,
    AnyPool, Row,
};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::types::{Conversation, ConversationStatus, Customer, Direction, Message};

static POSTGRES_MIGRATIONS: Migrator = sqlx::migrate!("./migrations/postgres");
static SQLITE_MIGRATIONS: Migrator = sqlx::migrate!("./migrations/sqlite");

/// RFC 3339 UTC with fixed precision, so text ordering is time ordering.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn is_sqlite_url(url: &str) -> bool {
    url.starts_with("sqlite:")
}

/// SQLite takes one writer at a time and fails a deferred transaction that
/// cannot upgrade its lock, so a SQLite pool is held to a single connection
/// and ledger transactions queue on the pool instead.
pub fn pool_size(config: &AppConfig) -> u32 {
    if is_sqlite_url(&config.database_url) {
        1
    } else {
        config.max_connections
    }
}

pub async fn connect(config: &AppConfig) -> Result<AnyPool, AppError> {
    sqlx::any::install_default_drivers();
    let max_connections = pool_size(config);
    if max_connections < config.max_connections {
        warn!(
            requested = config.max_connections,
            "sqlite database, pool limited to one connection"
        );
    }
    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(&config.database_url)
        .await?;
    migrate(&pool, &config.database_url).await?;
    Ok(pool)
}

pub async fn migrate(pool: &AnyPool, database_url: &str) -> Result<(), AppError> {
    let (migrator, backend) = if is_sqlite_url(database_url) {
        (&SQLITE_MIGRATIONS, "sqlite")
    } else {
        (&POSTGRES_MIGRATIONS, "postgres")
    };
    migrator.run(pool).await?;
    info!(backend, "database migrations applied");
    Ok(())
}

pub async fn ping(pool: &AnyPool) -> Result<(), AppError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// `synced` is projected as an integer: SQLite hands booleans back as INTEGER.
pub const CUSTOMER_COLUMNS: &str = "id, name, phone, email, address, customer_type, category, \
     status, CAST(CASE WHEN synced THEN 1 ELSE 0 END AS BIGINT) AS synced, created_at";

pub const CONVERSATION_COLUMNS: &str = "id, customer_id, phone, display_name, status, \
     last_message, last_message_direction, last_message_at, tag, created_at, updated_at";

pub const MESSAGE_COLUMNS: &str = "id, conversation_id, phone, body, direction, origin, \
     provider_message_id, attachment_url, created_at";

pub fn parse_customer_row(row: &AnyRow) -> Result<Customer, sqlx::Error> {
    Ok(Customer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
        address: row.try_get("address")?,
        customer_type: row.try_get("customer_type")?,
        category: row.try_get("category")?,
        status: row.try_get("status")?,
        synced: row.try_get::<i64, _>("synced")? != 0,
        created_at: row.try_get("created_at")?,
    })
}

pub fn parse_conversation_row(row: &AnyRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        phone: row.try_get("phone")?,
        display_name: row.try_get("display_name")?,
        status: ConversationStatus::from(row.try_get::<String, _>("status")?),
        last_message: row.try_get("last_message")?,
        last_message_direction: row
            .try_get::<Option<String>, _>("last_message_direction")?
            .as_deref()
            .and_then(Direction::parse),
        last_message_at: row.try_get("last_message_at")?,
        tag: row.try_get("tag")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub fn parse_message_row(row: &AnyRow) -> Result<Message, sqlx::Error> {
    let direction: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "direction".to_string(),
        source: format!("unknown message direction {direction:?}").into(),
    })?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        phone: row.try_get("phone")?,
        body: row.try_get("body")?,
        direction,
        origin: row.try_get("origin")?,
        provider_message_id: row.try_get("provider_message_id")?,
        attachment_url: row.try_get("attachment_url")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Single-connection in-memory SQLite with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    let url = "sqlite::memory:";
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(url)
        .await
        .expect("open in-memory sqlite");
    migrate(&pool, url).await.expect("apply sqlite migrations");
    pool
}
