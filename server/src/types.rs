use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "IN" => Some(Direction::In),
            "OUT" => Some(Direction::Out),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation workflow state. Only the two states the ledger assigns are
/// named; anything else written by other tools round-trips untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConversationStatus {
    New,
    InProgress,
    Other(String),
}

impl ConversationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ConversationStatus::New => "NEW",
            ConversationStatus::InProgress => "IN_PROGRESS",
            ConversationStatus::Other(value) => value,
        }
    }
}

impl From<String> for ConversationStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "NEW" => ConversationStatus::New,
            "IN_PROGRESS" => ConversationStatus::InProgress,
            _ => ConversationStatus::Other(value),
        }
    }
}

impl From<ConversationStatus> for String {
    fn from(value: ConversationStatus) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub customer_type: String,
    pub category: String,
    pub status: String,
    pub synced: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub customer_id: i64,
    pub phone: String,
    pub display_name: String,
    pub status: ConversationStatus,
    pub last_message: Option<String>,
    pub last_message_direction: Option<Direction>,
    pub last_message_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub phone: String,
    pub body: String,
    pub direction: Direction,
    pub origin: String,
    pub provider_message_id: Option<String>,
    pub attachment_url: Option<String>,
    pub created_at: String,
}

/// A message row joined with the customer that owns its conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerMessage {
    pub customer_id: i64,
    #[serde(flatten)]
    pub message: Message,
}

/// Canonical tuple produced from a webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    pub phone: String,
    pub body: String,
    pub attachment_url: Option<String>,
    pub provider_message_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NonChatEvent,
    GroupOrBroadcast,
    MissingPhone,
    OutgoingEcho,
    StatusUpdate,
    Reaction,
    NoMessageObject,
    MissingBody,
    MissingPhoneOrMessage,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IgnoreReason::NonChatEvent => "non_chat_event",
            IgnoreReason::GroupOrBroadcast => "group_or_broadcast",
            IgnoreReason::MissingPhone => "missing_phone",
            IgnoreReason::OutgoingEcho => "outgoing_echo",
            IgnoreReason::StatusUpdate => "status_update",
            IgnoreReason::Reaction => "reaction",
            IgnoreReason::NoMessageObject => "no_message_object",
            IgnoreReason::MissingBody => "missing_body",
            IgnoreReason::MissingPhoneOrMessage => "missing_phone_or_message",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running the extractor over one webhook body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Message(NormalizedMessage),
    Ignored(IgnoreReason),
}

/// Send request accepted by the application-initiated path.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    #[serde(default)]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub origin: Option<String>,
}

/// Everything the ledger resolved and wrote for one recorded message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub message: Message,
    pub customer_id: i64,
    pub customer_name: String,
    pub conversation_id: i64,
    pub phone: String,
    pub customer_created: bool,
    pub conversation_created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeEventKind {
    Inbound,
    Outbound,
}

impl RealtimeEventKind {
    pub fn event_name(self) -> &'static str {
        match self {
            RealtimeEventKind::Inbound => "message:inbound",
            RealtimeEventKind::Outbound => "message:outbound",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    #[serde(skip)]
    pub kind: RealtimeEventKind,
    pub direction: Direction,
    pub phone: String,
    pub customer_id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    pub body: String,
    pub timestamp: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl RealtimeEvent {
    pub fn from_receipt(
        kind: RealtimeEventKind,
        receipt: &LedgerReceipt,
        display_name: Option<String>,
    ) -> Self {
        Self {
            kind,
            direction: receipt.message.direction,
            phone: receipt.phone.clone(),
            customer_id: receipt.customer_id,
            conversation_id: receipt.conversation_id,
            message_id: receipt.message.id,
            body: receipt.message.body.clone(),
            timestamp: receipt.message.created_at.clone(),
            origin: receipt.message.origin.clone(),
            display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_status_keeps_unknown_values() {
        let status: ConversationStatus = serde_json::from_value(json!("CLOSED")).unwrap();
        assert_eq!(status, ConversationStatus::Other("CLOSED".to_string()));
        assert_eq!(serde_json::to_value(&status).unwrap(), json!("CLOSED"));
        assert_eq!(
            serde_json::to_value(ConversationStatus::InProgress).unwrap(),
            json!("IN_PROGRESS")
        );
    }

    #[test]
    fn outbound_request_accepts_partial_addressing() {
        let req: OutboundRequest =
            serde_json::from_value(json!({ "phone": "8295319442", "body": "hi" })).unwrap();
        assert_eq!(req.phone.as_deref(), Some("8295319442"));
        assert!(req.customer_id.is_none());
        assert!(req.origin.is_none());
    }

    #[test]
    fn ignore_reason_serializes_as_wire_code() {
        assert_eq!(
            serde_json::to_value(IgnoreReason::GroupOrBroadcast).unwrap(),
            json!("group_or_broadcast")
        );
        assert_eq!(IgnoreReason::MissingPhoneOrMessage.to_string(), "missing_phone_or_message");
    }
}
