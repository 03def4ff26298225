//! Customer / Conversation / Message ledger.
//!
//! Both write operations run in one transaction. Rows are found by canonical
//! phone first; when absent they are inserted with `ON CONFLICT (phone) DO
//! NOTHING RETURNING`, and an insert that lost a race to a concurrent first
//! contact falls back to reading the winner's row in the same transaction.
//! A `Transaction` dropped on an error path rolls back, so no partial write
//! is ever visible.

use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::{debug, info};

use crate::db::{
    now_iso, parse_conversation_row, parse_customer_row, parse_message_row, CONVERSATION_COLUMNS,
    CUSTOMER_COLUMNS, MESSAGE_COLUMNS,
};
use crate::error::AppError;
use crate::phone::normalize_phone;
use crate::types::{
    Conversation, ConversationStatus, Customer, CustomerMessage, Direction, LedgerReceipt,
    Message, NormalizedMessage, OutboundRequest,
};

type Tx = Transaction<'static, Any>;

pub const WHATSAPP_ORIGIN: &str = "whatsapp";
pub const APP_ORIGIN: &str = "crm_app";
pub const INBOUND_PLACEHOLDER_NAME: &str = "WhatsApp customer";
pub const OUTBOUND_PLACEHOLDER_NAME: &str = "CRM customer";

const DEFAULT_CUSTOMER_TYPE: &str = "CRM";
const DEFAULT_CUSTOMER_CATEGORY: &str = "WHATSAPP";
const DEFAULT_CUSTOMER_STATUS: &str = "NEW";

#[derive(Debug, Clone)]
struct CustomerRef {
    id: i64,
    name: String,
    phone: String,
}

struct NewConversation<'a> {
    customer_id: i64,
    phone: &'a str,
    display_name: &'a str,
    status: ConversationStatus,
    body: &'a str,
    direction: Direction,
    at: &'a str,
}

struct NewMessage<'a> {
    conversation_id: i64,
    phone: &'a str,
    body: &'a str,
    direction: Direction,
    origin: &'a str,
    provider_message_id: Option<&'a str>,
    attachment_url: Option<&'a str>,
    at: &'a str,
}

#[derive(Clone)]
pub struct Ledger {
    pool: AnyPool,
}

impl Ledger {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn record_inbound(&self, msg: &NormalizedMessage) -> Result<LedgerReceipt, AppError> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;

        let name = msg
            .display_name
            .as_deref()
            .unwrap_or(INBOUND_PLACEHOLDER_NAME);
        let (customer, customer_created) =
            find_or_create_customer(&mut tx, &msg.phone, name, &now).await?;

        let (conversation_id, conversation_created) = find_or_create_conversation(
            &mut tx,
            NewConversation {
                customer_id: customer.id,
                phone: &msg.phone,
                display_name: &customer.name,
                status: ConversationStatus::New,
                body: &msg.body,
                direction: Direction::In,
                at: &now,
            },
        )
        .await?;
        if !conversation_created {
            touch_last_message(&mut tx, conversation_id, &msg.body, Direction::In, &now).await?;
        }

        let message = insert_message(
            &mut tx,
            NewMessage {
                conversation_id,
                phone: &msg.phone,
                body: &msg.body,
                direction: Direction::In,
                origin: WHATSAPP_ORIGIN,
                provider_message_id: msg.provider_message_id.as_deref(),
                attachment_url: msg.attachment_url.as_deref(),
                at: &now,
            },
        )
        .await?;

        tx.commit().await?;
        info!(
            phone = %msg.phone,
            customer_id = customer.id,
            conversation_id,
            message_id = message.id,
            customer_created,
            conversation_created,
            "inbound message recorded"
        );

        Ok(LedgerReceipt {
            message,
            customer_id: customer.id,
            customer_name: customer.name,
            conversation_id,
            phone: msg.phone.clone(),
            customer_created,
            conversation_created,
        })
    }

    pub async fn record_outbound(&self, req: &OutboundRequest) -> Result<LedgerReceipt, AppError> {
        let body = req.body.as_str();
        if body.trim().is_empty() {
            return Err(AppError::Validation("body is required".to_string()));
        }
        let raw_phone = req.phone.as_deref().map(str::trim).filter(|p| !p.is_empty());
        if req.customer_id.is_none() && req.conversation_id.is_none() && raw_phone.is_none() {
            return Err(AppError::Validation(
                "one of customerId, conversationId or phone is required".to_string(),
            ));
        }
        let phone = match raw_phone {
            Some(raw) => Some(normalize_phone(raw).ok_or_else(|| {
                AppError::Validation(format!("phone {raw:?} contains no digits"))
            })?),
            None => None,
        };
        let origin = req
            .origin
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or(APP_ORIGIN);

        let now = now_iso();
        let mut tx = self.pool.begin().await?;

        let mut known_conversation = None;
        let mut customer_created = false;
        let customer = if let Some(conversation_id) = req.conversation_id {
            let conversation = find_conversation_by_id(&mut tx, conversation_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("conversation {conversation_id} not found"))
                })?;
            let owner = find_customer_by_id(&mut tx, conversation.customer_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("customer {} not found", conversation.customer_id))
                })?;
            known_conversation = Some(conversation.id);
            CustomerRef {
                phone: conversation.phone,
                ..owner
            }
        } else {
            match (req.customer_id, phone.as_deref()) {
                (Some(id), phone) => match (find_customer_by_id(&mut tx, id).await?, phone) {
                    (Some(found), Some(phone)) => {
                        ensure_phone_belongs_to(&mut tx, found.id, phone).await?;
                        CustomerRef {
                            phone: phone.to_string(),
                            ..found
                        }
                    }
                    (Some(found), None) => found,
                    (None, Some(phone)) => {
                        let (customer, created) = find_or_create_customer(
                            &mut tx,
                            phone,
                            OUTBOUND_PLACEHOLDER_NAME,
                            &now,
                        )
                        .await?;
                        customer_created = created;
                        customer
                    }
                    (None, None) => {
                        return Err(AppError::NotFound(format!("customer {id} not found")));
                    }
                },
                (None, Some(phone)) => {
                    let (customer, created) =
                        find_or_create_customer(&mut tx, phone, OUTBOUND_PLACEHOLDER_NAME, &now)
                            .await?;
                    customer_created = created;
                    customer
                }
                (None, None) => {
                    return Err(AppError::Validation(
                        "one of customerId, conversationId or phone is required".to_string(),
                    ));
                }
            }
        };

        let (conversation_id, conversation_created) = match known_conversation {
            Some(id) => (id, false),
            None => {
                find_or_create_conversation(
                    &mut tx,
                    NewConversation {
                        customer_id: customer.id,
                        phone: &customer.phone,
                        display_name: &customer.name,
                        status: ConversationStatus::InProgress,
                        body,
                        direction: Direction::Out,
                        at: &now,
                    },
                )
                .await?
            }
        };

        let message = insert_message(
            &mut tx,
            NewMessage {
                conversation_id,
                phone: &customer.phone,
                body,
                direction: Direction::Out,
                origin,
                provider_message_id: None,
                attachment_url: None,
                at: &now,
            },
        )
        .await?;
        touch_last_message(&mut tx, conversation_id, body, Direction::Out, &now).await?;

        tx.commit().await?;
        info!(
            phone = %customer.phone,
            customer_id = customer.id,
            conversation_id,
            message_id = message.id,
            origin,
            "outbound message recorded"
        );

        Ok(LedgerReceipt {
            message,
            customer_id: customer.id,
            customer_name: customer.name,
            conversation_id,
            phone: customer.phone,
            customer_created,
            conversation_created,
        })
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             ORDER BY last_message_at DESC NULLS LAST, created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let conversations = rows
            .iter()
            .map(parse_conversation_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    pub async fn conversation_messages(&self, conversation_id: i64) -> Result<Vec<Message>, AppError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        let messages = rows
            .iter()
            .map(parse_message_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub async fn customer_messages(&self, customer_id: i64) -> Result<Vec<CustomerMessage>, AppError> {
        let rows = sqlx::query(
            "SELECT c.customer_id, m.id, m.conversation_id, m.phone, m.body, m.direction, m.origin, \
                    m.provider_message_id, m.attachment_url, m.created_at \
             FROM messages m \
             JOIN conversations c ON c.id = m.conversation_id \
             WHERE c.customer_id = $1 \
             ORDER BY m.created_at ASC, m.id ASC",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            messages.push(CustomerMessage {
                customer_id: row.try_get("customer_id")?,
                message: parse_message_row(row)?,
            });
        }
        Ok(messages)
    }

    pub async fn list_customers(&self) -> Result<Vec<Customer>, AppError> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers ORDER BY created_at DESC, id DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let customers = rows
            .iter()
            .map(parse_customer_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(customers)
    }
}

async fn find_customer_by_phone(tx: &mut Tx, phone: &str) -> Result<Option<CustomerRef>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, phone FROM customers WHERE phone = $1 LIMIT 1")
        .bind(phone)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(|row| customer_ref(&row)).transpose()
}

async fn find_customer_by_id(tx: &mut Tx, id: i64) -> Result<Option<CustomerRef>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, phone FROM customers WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(|row| customer_ref(&row)).transpose()
}

fn customer_ref(row: &sqlx::any::AnyRow) -> Result<CustomerRef, sqlx::Error> {
    Ok(CustomerRef {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        phone: row.try_get("phone")?,
    })
}

async fn find_or_create_customer(
    tx: &mut Tx,
    phone: &str,
    name: &str,
    now: &str,
) -> Result<(CustomerRef, bool), sqlx::Error> {
    if let Some(existing) = find_customer_by_phone(tx, phone).await? {
        return Ok((existing, false));
    }
    let inserted = sqlx::query(
        "INSERT INTO customers (name, phone, customer_type, category, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (phone) DO NOTHING \
         RETURNING id, name, phone",
    )
    .bind(name)
    .bind(phone)
    .bind(DEFAULT_CUSTOMER_TYPE)
    .bind(DEFAULT_CUSTOMER_CATEGORY)
    .bind(DEFAULT_CUSTOMER_STATUS)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(row) = inserted {
        let customer = customer_ref(&row)?;
        debug!(customer_id = customer.id, phone, "customer created");
        return Ok((customer, true));
    }
    debug!(phone, "customer insert lost a race, attaching to existing row");
    let existing = find_customer_by_phone(tx, phone)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    Ok((existing, false))
}

async fn find_conversation_id(tx: &mut Tx, phone: &str) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM conversations WHERE phone = $1 LIMIT 1")
        .bind(phone)
        .fetch_optional(&mut **tx)
        .await
}

async fn find_conversation_by_id(tx: &mut Tx, id: i64) -> Result<Option<Conversation>, sqlx::Error> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut **tx).await?;
    row.map(|row| parse_conversation_row(&row)).transpose()
}

async fn find_conversation_owner(tx: &mut Tx, phone: &str) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT customer_id FROM conversations WHERE phone = $1 LIMIT 1")
        .bind(phone)
        .fetch_optional(&mut **tx)
        .await
}

/// A phone already registered to, or chatting with, another customer cannot
/// be borrowed by `customer_id`.
async fn ensure_phone_belongs_to(tx: &mut Tx, customer_id: i64, phone: &str) -> Result<(), AppError> {
    if let Some(other) = find_customer_by_phone(tx, phone).await? {
        if other.id != customer_id {
            return Err(AppError::Validation(format!(
                "phone {phone} belongs to customer {}",
                other.id
            )));
        }
    }
    if let Some(owner) = find_conversation_owner(tx, phone).await? {
        if owner != customer_id {
            return Err(AppError::Validation(format!(
                "phone {phone} belongs to a conversation of customer {owner}"
            )));
        }
    }
    Ok(())
}

async fn find_or_create_conversation(
    tx: &mut Tx,
    new: NewConversation<'_>,
) -> Result<(i64, bool), sqlx::Error> {
    if let Some(id) = find_conversation_id(tx, new.phone).await? {
        return Ok((id, false));
    }
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO conversations \
         (customer_id, phone, display_name, status, last_message, last_message_direction, \
          last_message_at, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (phone) DO NOTHING \
         RETURNING id",
    )
    .bind(new.customer_id)
    .bind(new.phone)
    .bind(new.display_name)
    .bind(new.status.as_str())
    .bind(new.body)
    .bind(new.direction.as_str())
    .bind(new.at)
    .bind(new.at)
    .bind(new.at)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(id) = inserted {
        debug!(conversation_id = id, phone = new.phone, "conversation created");
        return Ok((id, true));
    }
    debug!(phone = new.phone, "conversation insert lost a race, attaching to existing row");
    let id = find_conversation_id(tx, new.phone)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    Ok((id, false))
}

/// Move the conversation's last-message snapshot forward. A snapshot newer
/// than `at` is left alone.
async fn touch_last_message(
    tx: &mut Tx,
    conversation_id: i64,
    body: &str,
    direction: Direction,
    at: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE conversations \
         SET last_message = $1, last_message_direction = $2, last_message_at = $3, updated_at = $4 \
         WHERE id = $5 AND (last_message_at IS NULL OR last_message_at <= $6)",
    )
    .bind(body)
    .bind(direction.as_str())
    .bind(at)
    .bind(at)
    .bind(conversation_id)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_message(tx: &mut Tx, new: NewMessage<'_>) -> Result<Message, sqlx::Error> {
    let sql = format!(
        "INSERT INTO messages \
         (conversation_id, phone, body, direction, origin, provider_message_id, attachment_url, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {MESSAGE_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(new.conversation_id)
        .bind(new.phone)
        .bind(new.body)
        .bind(new.direction.as_str())
        .bind(new.origin)
        .bind(new.provider_message_id)
        .bind(new.attachment_url)
        .bind(new.at)
        .fetch_one(&mut **tx)
        .await?;
    parse_message_row(&row)
}
