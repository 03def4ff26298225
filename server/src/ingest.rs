use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::AppError;
use crate::extract::extract;
use crate::ledger::Ledger;
use crate::realtime::EventPublisher;
use crate::types::{
    Extraction, IgnoreReason, LedgerReceipt, OutboundRequest, RealtimeEvent, RealtimeEventKind,
};

#[derive(Debug)]
pub enum IngestOutcome {
    Ignored(IgnoreReason),
    Stored(LedgerReceipt),
}

#[derive(Clone)]
pub struct Ingestion {
    ledger: Ledger,
    publisher: Arc<dyn EventPublisher>,
}

impl Ingestion {
    pub fn new(ledger: Ledger, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { ledger, publisher }
    }

    /// Ignorable payloads never reach the ledger. Stored messages are
    /// published only after their transaction commits.
    pub async fn ingest_webhook(&self, raw: &Value) -> Result<IngestOutcome, AppError> {
        let message = match extract(raw) {
            Extraction::Message(message) => message,
            Extraction::Ignored(reason) => {
                debug!(%reason, "webhook payload ignored");
                return Ok(IngestOutcome::Ignored(reason));
            }
        };

        let receipt = self.ledger.record_inbound(&message).await.map_err(|err| {
            error!(phone = %message.phone, error = %err, "failed to record inbound message");
            err
        })?;

        let display_name = message
            .display_name
            .clone()
            .or_else(|| Some(receipt.customer_name.clone()));
        self.publisher.publish(RealtimeEvent::from_receipt(
            RealtimeEventKind::Inbound,
            &receipt,
            display_name,
        ));
        Ok(IngestOutcome::Stored(receipt))
    }

    pub async fn send_message(&self, request: &OutboundRequest) -> Result<LedgerReceipt, AppError> {
        let receipt = self.ledger.record_outbound(request).await?;
        self.publisher.publish(RealtimeEvent::from_receipt(
            RealtimeEventKind::Outbound,
            &receipt,
            Some(receipt.customer_name.clone()),
        ));
        info!(
            conversation_id = receipt.conversation_id,
            message_id = receipt.message.id,
            "outbound message published"
        );
        Ok(receipt)
    }
}
