//! Webhook payload normalization.
//!
//! The relay wraps Baileys-style message objects in several envelope shapes:
//! `{ event, data: {...} }`, `{ result: { event, data }, sender }`, or a
//! `data.messages[]` batch of which only the first entry is read. Every lookup
//! below is a fixed, priority-ordered list of optional fields; the first
//! non-blank value wins.

use serde_json::Value;

use crate::phone::{normalize_phone, AddressKind};
use crate::types::{Extraction, IgnoreReason, NormalizedMessage};

const NEW_MESSAGE_EVENT: &str = "messages.upsert";

struct Envelope<'a> {
    raw: &'a Value,
    wrapper: &'a Value,
    data: &'a Value,
    entry: &'a Value,
    message: Option<&'a Value>,
}

impl<'a> Envelope<'a> {
    fn open(raw: &'a Value) -> Self {
        let wrapper = raw.get("result").filter(|v| v.is_object()).unwrap_or(raw);
        let data = wrapper.get("data").filter(|v| v.is_object()).unwrap_or(wrapper);
        let entry = data
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .filter(|v| v.is_object())
            .unwrap_or(data);
        let message = entry.get("message").filter(|v| v.is_object());
        Self {
            raw,
            wrapper,
            data,
            entry,
            message,
        }
    }

    fn event_type(&self) -> Option<String> {
        text_at(self.wrapper, &["event"])
            .or_else(|| text_at(self.raw, &["event"]))
            .map(|event| event.to_ascii_lowercase().replace('_', "."))
    }

    fn chat_address(&self) -> Option<&'a str> {
        text_at(self.entry, &["key", "remoteJid"])
            .or_else(|| text_at(self.data, &["remoteJid"]))
            .or_else(|| text_at(self.data, &["remoteJID"]))
            .or_else(|| text_at(self.data, &["from"]))
            .or_else(|| text_at(self.entry, &["participant"]))
            .or_else(|| text_at(self.entry, &["key", "participant"]))
            .or_else(|| text_at(self.wrapper, &["sender"]))
            .or_else(|| text_at(self.raw, &["sender"]))
    }

    fn explicit_phone(&self) -> Option<String> {
        text_at(self.data, &["phone"])
            .or_else(|| text_at(self.data, &["telefono"]))
            .and_then(normalize_phone)
    }

    fn from_me(&self) -> bool {
        self.entry
            .get("key")
            .and_then(|key| key.get("fromMe"))
            .or_else(|| self.data.get("fromMe"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn message_type(&self) -> Option<&'a str> {
        text_at(self.entry, &["messageType"]).or_else(|| text_at(self.data, &["messageType"]))
    }

    fn flat_text(&self) -> Option<&'a str> {
        verbatim_text_at(self.data, &["text"])
            .or_else(|| verbatim_text_at(self.data, &["body"]))
            .or_else(|| verbatim_text_at(self.data, &["data", "text"]))
    }

    fn is_status_update(&self) -> bool {
        if self.message_type() == Some("protocolMessage") {
            return true;
        }
        if let Some(message) = self.message {
            return message.get("protocolMessage").is_some();
        }
        self.flat_text().is_none()
            && (self.data.get("ack").is_some() || self.data.get("status").is_some())
    }

    fn is_reaction(&self) -> bool {
        self.message_type() == Some("reactionMessage")
            || self
                .message
                .is_some_and(|message| message.get("reactionMessage").is_some())
    }

    fn body(&self) -> Result<String, IgnoreReason> {
        let direct = self
            .message
            .and_then(|message| verbatim_text_at(message, &["conversation"]))
            .or_else(|| self.flat_text());
        if let Some(text) = direct {
            return Ok(text.to_string());
        }
        let Some(message) = self.message else {
            return Err(IgnoreReason::NoMessageObject);
        };
        let extended = verbatim_text_at(message, &["extendedTextMessage", "text"])
            .or_else(|| verbatim_text_at(message, &["imageMessage", "caption"]))
            .or_else(|| verbatim_text_at(message, &["videoMessage", "caption"]))
            .or_else(|| verbatim_text_at(message, &["documentMessage", "caption"]));
        if let Some(text) = extended {
            return Ok(text.to_string());
        }
        match first_media(message) {
            Some((kind, media)) => Ok(kind.placeholder(media)),
            None => Err(IgnoreReason::MissingBody),
        }
    }

    fn attachment_url(&self) -> Option<String> {
        let (_, media) = first_media(self.message?)?;
        text_at(media, &["url"]).map(str::to_string)
    }

    fn provider_message_id(&self) -> Option<String> {
        text_at(self.entry, &["key", "id"])
            .or_else(|| text_at(self.data, &["messageId"]))
            .or_else(|| text_at(self.data, &["id"]))
            .map(str::to_string)
    }

    fn display_name(&self) -> Option<String> {
        text_at(self.entry, &["pushName"])
            .or_else(|| text_at(self.data, &["pushName"]))
            .or_else(|| text_at(self.data, &["notifyName"]))
            .or_else(|| text_at(self.data, &["name"]))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Image,
    Video,
    Document,
    Audio,
    Sticker,
    Location,
    Contact,
}

impl MediaKind {
    const ALL: [MediaKind; 7] = [
        MediaKind::Image,
        MediaKind::Video,
        MediaKind::Document,
        MediaKind::Audio,
        MediaKind::Sticker,
        MediaKind::Location,
        MediaKind::Contact,
    ];

    fn field(self) -> &'static str {
        match self {
            MediaKind::Image => "imageMessage",
            MediaKind::Video => "videoMessage",
            MediaKind::Document => "documentMessage",
            MediaKind::Audio => "audioMessage",
            MediaKind::Sticker => "stickerMessage",
            MediaKind::Location => "locationMessage",
            MediaKind::Contact => "contactMessage",
        }
    }

    fn placeholder(self, media: &Value) -> String {
        let label = match self {
            MediaKind::Image => "[Image]",
            MediaKind::Video => "[Video]",
            MediaKind::Document => {
                return match text_at(media, &["fileName"]) {
                    Some(name) => format!("[Document: {name}]"),
                    None => "[Document]".to_string(),
                };
            }
            MediaKind::Audio => "[Audio]",
            MediaKind::Sticker => "[Sticker]",
            MediaKind::Location => "[Location]",
            MediaKind::Contact => "[Contact]",
        };
        label.to_string()
    }
}

fn first_media(message: &Value) -> Option<(MediaKind, &Value)> {
    MediaKind::ALL.into_iter().find_map(|kind| {
        message
            .get(kind.field())
            .filter(|v| v.is_object())
            .map(|media| (kind, media))
    })
}

/// Non-blank string at `path`, as sent. Message bodies keep their whitespace.
fn verbatim_text_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.trim().is_empty())
}

fn text_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    verbatim_text_at(value, path).map(str::trim)
}

/// Reduce an arbitrary webhook body to a storable message, or say why not.
pub fn extract(raw: &Value) -> Extraction {
    let env = Envelope::open(raw);

    if let Some(event) = env.event_type() {
        if event != NEW_MESSAGE_EVENT {
            return Extraction::Ignored(IgnoreReason::NonChatEvent);
        }
    }

    let address = env.chat_address();
    if address.is_some_and(|address| !AddressKind::of(address).is_one_to_one()) {
        return Extraction::Ignored(IgnoreReason::GroupOrBroadcast);
    }

    let phone = address
        .and_then(normalize_phone)
        .or_else(|| env.explicit_phone());
    if phone.is_none() {
        return Extraction::Ignored(IgnoreReason::MissingPhone);
    }

    if env.from_me() {
        return Extraction::Ignored(IgnoreReason::OutgoingEcho);
    }
    if env.is_status_update() {
        return Extraction::Ignored(IgnoreReason::StatusUpdate);
    }
    if env.is_reaction() {
        return Extraction::Ignored(IgnoreReason::Reaction);
    }

    let body = match env.body() {
        Ok(body) => Some(body),
        Err(reason) => return Extraction::Ignored(reason),
    };

    match (phone, body.filter(|b| !b.trim().is_empty())) {
        (Some(phone), Some(body)) => Extraction::Message(NormalizedMessage {
            phone,
            body,
            attachment_url: env.attachment_url(),
            provider_message_id: env.provider_message_id(),
            display_name: env.display_name(),
        }),
        _ => Extraction::Ignored(IgnoreReason::MissingPhoneOrMessage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(extraction: Extraction) -> NormalizedMessage {
        match extraction {
            Extraction::Message(msg) => msg,
            Extraction::Ignored(reason) => panic!("expected message, ignored: {reason}"),
        }
    }

    fn ignored(extraction: Extraction) -> IgnoreReason {
        match extraction {
            Extraction::Ignored(reason) => reason,
            Extraction::Message(msg) => panic!("expected ignore, got {msg:?}"),
        }
    }

    #[test]
    fn plain_conversation_text() {
        let msg = message(extract(&json!({
            "event": "messages.upsert",
            "instance": "fullpos",
            "data": {
                "key": { "remoteJid": "18295319442@s.whatsapp.net", "fromMe": false, "id": "3EB0C767D26A" },
                "pushName": "Maria",
                "message": { "conversation": "Hola" },
                "messageType": "conversation"
            },
            "sender": "18090000000@s.whatsapp.net"
        })));
        assert_eq!(msg.phone, "8295319442");
        assert_eq!(msg.body, "Hola");
        assert_eq!(msg.provider_message_id.as_deref(), Some("3EB0C767D26A"));
        assert_eq!(msg.display_name.as_deref(), Some("Maria"));
        assert_eq!(msg.attachment_url, None);
    }

    #[test]
    fn result_wrapper_and_uppercase_event() {
        let msg = message(extract(&json!({
            "result": {
                "event": "MESSAGES_UPSERT",
                "data": {
                    "key": { "remoteJid": "8295319442@c.us" },
                    "message": { "extendedTextMessage": { "text": "  precio?  " } }
                }
            }
        })));
        assert_eq!(msg.phone, "8295319442");
        assert_eq!(msg.body, "  precio?  ");
    }

    #[test]
    fn messages_array_entry() {
        let msg = message(extract(&json!({
            "data": {
                "messages": [{
                    "key": { "remoteJid": "18095551234@s.whatsapp.net", "id": "ABC" },
                    "pushName": "Luis",
                    "message": { "conversation": "buenas" }
                }]
            }
        })));
        assert_eq!(msg.phone, "8095551234");
        assert_eq!(msg.body, "buenas");
        assert_eq!(msg.provider_message_id.as_deref(), Some("ABC"));
        assert_eq!(msg.display_name.as_deref(), Some("Luis"));
    }

    #[test]
    fn flat_relay_fields() {
        let msg = message(extract(&json!({
            "from": "8295319442@c.us",
            "body": "texto plano",
            "messageId": "wamid.1",
            "name": "Ana"
        })));
        assert_eq!(msg.phone, "8295319442");
        assert_eq!(msg.body, "texto plano");
        assert_eq!(msg.provider_message_id.as_deref(), Some("wamid.1"));
        assert_eq!(msg.display_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn explicit_phone_field_when_no_address() {
        let msg = message(extract(&json!({ "data": { "telefono": "1-829-531-9442", "text": "ok" } })));
        assert_eq!(msg.phone, "8295319442");
    }

    #[test]
    fn image_caption_and_url() {
        let msg = message(extract(&json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": {
                    "imageMessage": {
                        "url": "https://mmg.whatsapp.net/o1/v/t62.7118-24/abc.enc",
                        "caption": "mira esto",
                        "mimetype": "image/jpeg"
                    }
                }
            }
        })));
        assert_eq!(msg.body, "mira esto");
        assert_eq!(
            msg.attachment_url.as_deref(),
            Some("https://mmg.whatsapp.net/o1/v/t62.7118-24/abc.enc")
        );
    }

    #[test]
    fn media_placeholders_without_caption() {
        let audio = message(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": { "audioMessage": { "url": "https://cdn/a.ogg", "seconds": 7 } }
            }
        })));
        assert_eq!(audio.body, "[Audio]");
        assert_eq!(audio.attachment_url.as_deref(), Some("https://cdn/a.ogg"));

        let doc = message(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": { "documentMessage": { "url": "https://cdn/f.pdf", "fileName": "factura.pdf" } }
            }
        })));
        assert_eq!(doc.body, "[Document: factura.pdf]");

        let sticker = message(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": { "stickerMessage": {} }
            }
        })));
        assert_eq!(sticker.body, "[Sticker]");
        assert_eq!(sticker.attachment_url, None);
    }

    #[test]
    fn text_wins_over_caption_but_attachment_is_kept() {
        let msg = message(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": {
                    "conversation": "primero",
                    "videoMessage": { "url": "https://cdn/v.mp4", "caption": "segundo" }
                }
            }
        })));
        assert_eq!(msg.body, "primero");
        assert_eq!(msg.attachment_url.as_deref(), Some("https://cdn/v.mp4"));
    }

    #[test]
    fn key_address_beats_sender() {
        let msg = message(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": { "conversation": "x" }
            },
            "sender": "18090000000@s.whatsapp.net"
        })));
        assert_eq!(msg.phone, "8295319442");
    }

    #[test]
    fn non_chat_event_is_ignored() {
        let reason = ignored(extract(&json!({
            "event": "connection.update",
            "data": { "state": "open" }
        })));
        assert_eq!(reason, IgnoreReason::NonChatEvent);

        let reason = ignored(extract(&json!({
            "event": "messages.update",
            "data": { "key": { "remoteJid": "8295319442@s.whatsapp.net" }, "status": "READ" }
        })));
        assert_eq!(reason, IgnoreReason::NonChatEvent);
    }

    #[test]
    fn group_and_broadcast_are_ignored() {
        let group = ignored(extract(&json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "120363025246125486@g.us", "participant": "8295319442@s.whatsapp.net" },
                "message": { "conversation": "hola grupo" }
            }
        })));
        assert_eq!(group, IgnoreReason::GroupOrBroadcast);

        let status = ignored(extract(&json!({
            "data": {
                "key": { "remoteJid": "status@broadcast" },
                "message": { "imageMessage": { "url": "https://cdn/s.jpg" } }
            }
        })));
        assert_eq!(status, IgnoreReason::GroupOrBroadcast);
    }

    #[test]
    fn missing_phone() {
        let reason = ignored(extract(&json!({ "data": { "message": { "conversation": "hola" } } })));
        assert_eq!(reason, IgnoreReason::MissingPhone);
    }

    #[test]
    fn own_messages_are_echoes() {
        let reason = ignored(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net", "fromMe": true },
                "message": { "conversation": "respuesta" }
            }
        })));
        assert_eq!(reason, IgnoreReason::OutgoingEcho);
    }

    #[test]
    fn status_and_reaction_never_become_messages() {
        let ack = ignored(extract(&json!({
            "data": { "remoteJid": "8295319442@s.whatsapp.net", "ack": 3, "id": "X" }
        })));
        assert_eq!(ack, IgnoreReason::StatusUpdate);

        let protocol = ignored(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": { "protocolMessage": { "type": 0 } }
            }
        })));
        assert_eq!(protocol, IgnoreReason::StatusUpdate);

        let reaction = ignored(extract(&json!({
            "event": "messages.upsert",
            "data": {
                "key": { "remoteJid": "8295319442@s.whatsapp.net" },
                "message": { "reactionMessage": { "text": "👍", "key": { "id": "Y" } } },
                "messageType": "reactionMessage"
            }
        })));
        assert_eq!(reaction, IgnoreReason::Reaction);
    }

    #[test]
    fn missing_message_object_and_body() {
        let none = ignored(extract(&json!({ "data": { "remoteJid": "8295319442@c.us" } })));
        assert_eq!(none, IgnoreReason::NoMessageObject);

        let unusable = ignored(extract(&json!({
            "data": {
                "key": { "remoteJid": "8295319442@c.us" },
                "message": { "pollCreationMessage": { "name": "?" }, "conversation": "   " }
            }
        })));
        assert_eq!(unusable, IgnoreReason::MissingBody);
    }

    #[test]
    fn non_object_body_is_ignored() {
        assert_eq!(ignored(extract(&json!({}))), IgnoreReason::MissingPhone);
        assert_eq!(ignored(extract(&json!("hola"))), IgnoreReason::MissingPhone);
    }
}
