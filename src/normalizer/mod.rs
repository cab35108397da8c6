use crate::transport::{MediaMessage, RawMessage};
use serde::{Deserialize, Serialize};

pub const STATUS_BROADCAST_JID: &str = "status@broadcast";

/// Stable inbound representation handed to the pipeline and serialized into
/// `events.normalized_json` / webhook payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedInboundMessage {
    pub kind: String,
    pub message_id: String,
    /// Canonical reply address.
    pub from: String,
    /// Same as `from`, kept explicit for test vectors.
    pub reply_to_jid: String,
    /// Original chat id.
    pub remote_jid: String,
    /// Phone-form address if the transport provided one.
    pub sender_pn: Option<String>,
    /// This device's own address, when known.
    pub to: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<i64>,
    pub content: NormalizedContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
    pub media: Option<MediaInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub kind: String,
    pub mimetype: Option<String>,
    pub file_length: Option<String>,
    pub file_name: Option<String>,
}

/// Everything before the `@`.
pub fn user_part(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

pub fn is_broadcast_jid(jid: &str) -> bool {
    jid.ends_with("@broadcast")
}

/// Strip device/resource suffixes from the local part: `123:4@d` and
/// `123.0@d` both normalize to `123@d`.
pub fn normalize_user_jid(jid: &str) -> String {
    match jid.split_once('@') {
        Some((local, domain)) => {
            let bare = local
                .split(|c| c == ':' || c == '.')
                .next()
                .unwrap_or(local);
            format!("{}@{}", bare, domain)
        }
        None => jid.to_string(),
    }
}

/// Convert one raw envelope into the stable inbound shape. Pure; returns None
/// only when the envelope carries no key.
///
/// The upstream transport may surface either a phone-form or a linked-id form
/// for the same contact. We commit to the phone form for 1:1 chats and to the
/// group/broadcast id otherwise, so downstream replies land in the same
/// conversation.
pub fn normalize(raw: &RawMessage, own_jid: Option<&str>) -> Option<NormalizedInboundMessage> {
    let key = raw.key.as_ref()?;

    let text = extract_text(raw);
    let media = extract_media(raw);

    let has_stub_fields =
        raw.message_stub_type.is_some() || raw.message_stub_parameters.is_some();

    let content = if has_stub_fields && text.is_none() && media.is_none() {
        let stub_text = raw
            .message_stub_parameters
            .as_ref()
            .map(|params| params.join(" ").trim().to_string())
            .filter(|s| !s.is_empty());
        NormalizedContent {
            content_type: "stub".to_string(),
            text: stub_text,
            media: None,
        }
    } else if let Some(text) = text {
        NormalizedContent {
            content_type: "text".to_string(),
            text: Some(text),
            media: None,
        }
    } else if let Some(media) = media {
        NormalizedContent {
            content_type: "media".to_string(),
            text: None,
            media: Some(media),
        }
    } else {
        NormalizedContent {
            content_type: "unknown".to_string(),
            text: None,
            media: None,
        }
    };

    let from = resolve_reply_jid(&key.remote_jid, key.sender_pn.as_deref());

    Some(NormalizedInboundMessage {
        kind: "inbound_message".to_string(),
        message_id: key.id.clone(),
        reply_to_jid: from.clone(),
        from,
        remote_jid: key.remote_jid.clone(),
        sender_pn: key.sender_pn.clone(),
        to: own_jid.map(normalize_user_jid),
        timestamp: raw.message_timestamp,
        content,
    })
}

/// Group and broadcast chats reply to the chat id as-is; 1:1 chats prefer the
/// phone form over a linked-id form.
fn resolve_reply_jid(remote_jid: &str, sender_pn: Option<&str>) -> String {
    if is_group_jid(remote_jid) || is_broadcast_jid(remote_jid) {
        return remote_jid.to_string();
    }
    match sender_pn {
        Some(pn) => normalize_user_jid(pn),
        None => normalize_user_jid(remote_jid),
    }
}

fn extract_text(raw: &RawMessage) -> Option<String> {
    let message = raw.message.as_ref()?;

    message
        .conversation
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            message
                .extended_text_message
                .as_ref()
                .and_then(|m| m.text.clone())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| {
            message
                .image_message
                .as_ref()
                .and_then(|m| m.caption.clone())
                .filter(|s| !s.is_empty())
        })
        .or_else(|| {
            message
                .video_message
                .as_ref()
                .and_then(|m| m.caption.clone())
                .filter(|s| !s.is_empty())
        })
}

fn extract_media(raw: &RawMessage) -> Option<MediaInfo> {
    let message = raw.message.as_ref()?;

    let (kind, descriptor) = if let Some(m) = &message.image_message {
        ("image", m)
    } else if let Some(m) = &message.video_message {
        ("video", m)
    } else if let Some(m) = &message.audio_message {
        ("audio", m)
    } else if let Some(m) = &message.document_message {
        ("document", m)
    } else {
        return None;
    };

    Some(media_info(kind, descriptor))
}

fn media_info(kind: &str, descriptor: &MediaMessage) -> MediaInfo {
    MediaInfo {
        kind: kind.to_string(),
        mimetype: descriptor.mimetype.clone(),
        // File sizes travel as strings so 64-bit values survive JSON consumers.
        file_length: descriptor.file_length.map(|len| len.to_string()),
        file_name: descriptor.file_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExtendedTextMessage, MessageContent, MessageKey};

    fn key(remote_jid: &str) -> MessageKey {
        MessageKey {
            id: "ABCDEF".to_string(),
            remote_jid: remote_jid.to_string(),
            from_me: false,
            participant: None,
            sender_pn: None,
        }
    }

    fn text_raw(remote_jid: &str, text: &str) -> RawMessage {
        RawMessage {
            key: Some(key(remote_jid)),
            message: Some(MessageContent {
                conversation: Some(text.to_string()),
                ..Default::default()
            }),
            message_stub_type: None,
            message_stub_parameters: None,
            message_timestamp: Some(1_736_900_000),
        }
    }

    #[test]
    fn plain_text_is_classified_as_text() {
        let raw = text_raw("5491122223333@s.whatsapp.net", "hola");
        let normalized = normalize(&raw, Some("me@s.whatsapp.net")).unwrap();

        assert_eq!(normalized.kind, "inbound_message");
        assert_eq!(normalized.content.content_type, "text");
        assert_eq!(normalized.content.text.as_deref(), Some("hola"));
        assert!(normalized.content.media.is_none());
        assert_eq!(normalized.from, "5491122223333@s.whatsapp.net");
        assert_eq!(normalized.reply_to_jid, normalized.from);
        assert_eq!(normalized.timestamp, Some(1_736_900_000));
        assert_eq!(normalized.to.as_deref(), Some("me@s.whatsapp.net"));
    }

    #[test]
    fn extended_text_wins_when_conversation_is_absent() {
        let mut raw = text_raw("1@s.whatsapp.net", "x");
        raw.message = Some(MessageContent {
            extended_text_message: Some(ExtendedTextMessage {
                text: Some("quoted reply".to_string()),
            }),
            ..Default::default()
        });
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.content.content_type, "text");
        assert_eq!(normalized.content.text.as_deref(), Some("quoted reply"));
    }

    #[test]
    fn captioned_image_is_text_with_the_caption() {
        let mut raw = text_raw("1@s.whatsapp.net", "x");
        raw.message = Some(MessageContent {
            image_message: Some(MediaMessage {
                caption: Some("look at this".to_string()),
                mimetype: Some("image/jpeg".to_string()),
                file_length: Some(12345),
                file_name: None,
            }),
            ..Default::default()
        });
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.content.content_type, "text");
        assert_eq!(normalized.content.text.as_deref(), Some("look at this"));
    }

    #[test]
    fn captionless_media_carries_a_stringified_size() {
        let mut raw = text_raw("1@s.whatsapp.net", "x");
        raw.message = Some(MessageContent {
            document_message: Some(MediaMessage {
                caption: None,
                mimetype: Some("application/pdf".to_string()),
                file_length: Some(7_000_000_000),
                file_name: Some("contract.pdf".to_string()),
            }),
            ..Default::default()
        });
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.content.content_type, "media");
        let media = normalized.content.media.unwrap();
        assert_eq!(media.kind, "document");
        assert_eq!(media.file_length.as_deref(), Some("7000000000"));
        assert_eq!(media.file_name.as_deref(), Some("contract.pdf"));
    }

    #[test]
    fn stub_parameters_join_into_the_stub_text() {
        let raw = RawMessage {
            key: Some(key("67229240574002@lid")),
            message: None,
            message_stub_type: Some(2),
            message_stub_parameters: Some(vec![
                "No matching sessions found for message".to_string(),
            ]),
            message_timestamp: Some(1_736_900_000),
        };
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.content.content_type, "stub");
        assert_eq!(
            normalized.content.text.as_deref(),
            Some("No matching sessions found for message")
        );
    }

    #[test]
    fn stub_with_empty_parameters_has_null_text() {
        let raw = RawMessage {
            key: Some(key("1@s.whatsapp.net")),
            message: None,
            message_stub_type: Some(1),
            message_stub_parameters: Some(vec![]),
            message_timestamp: None,
        };
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.content.content_type, "stub");
        assert!(normalized.content.text.is_none());
    }

    #[test]
    fn envelope_with_nothing_decoded_is_unknown() {
        let raw = RawMessage {
            key: Some(key("1@s.whatsapp.net")),
            message: Some(MessageContent::default()),
            message_stub_type: None,
            message_stub_parameters: None,
            message_timestamp: None,
        };
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.content.content_type, "unknown");
    }

    #[test]
    fn group_chat_replies_to_the_group_id_as_is() {
        let mut raw = text_raw("12036304@g.us", "hello group");
        raw.key.as_mut().unwrap().sender_pn = Some("5491122223333@s.whatsapp.net".to_string());
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.from, "12036304@g.us");
    }

    #[test]
    fn one_to_one_prefers_the_phone_form_over_a_linked_id() {
        let mut raw = text_raw("67229240574002@lid", "hi");
        raw.key.as_mut().unwrap().sender_pn = Some("5491122223333:12@s.whatsapp.net".to_string());
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.from, "5491122223333@s.whatsapp.net");
        assert_eq!(
            normalized.sender_pn.as_deref(),
            Some("5491122223333:12@s.whatsapp.net")
        );
        assert_eq!(normalized.remote_jid, "67229240574002@lid");
    }

    #[test]
    fn one_to_one_without_phone_form_falls_back_to_the_chat_id() {
        let raw = text_raw("5491122223333:3@s.whatsapp.net", "hi");
        let normalized = normalize(&raw, None).unwrap();
        assert_eq!(normalized.from, "5491122223333@s.whatsapp.net");
    }

    #[test]
    fn keyless_envelope_is_rejected() {
        let raw = RawMessage {
            key: None,
            message: None,
            message_stub_type: None,
            message_stub_parameters: None,
            message_timestamp: None,
        };
        assert!(normalize(&raw, None).is_none());
    }

    #[test]
    fn normalized_json_uses_the_wire_field_names() {
        let raw = text_raw("5491122223333@s.whatsapp.net", "hola");
        let normalized = normalize(&raw, None).unwrap();
        let json = serde_json::to_value(&normalized).unwrap();

        assert_eq!(json["kind"], "inbound_message");
        assert_eq!(json["messageId"], "ABCDEF");
        assert_eq!(json["replyToJid"], "5491122223333@s.whatsapp.net");
        assert_eq!(json["content"]["type"], "text");
        assert!(json["content"]["media"].is_null());
        assert!(json["to"].is_null());
    }

    #[test]
    fn jid_helpers() {
        assert_eq!(user_part("123:4@s.whatsapp.net"), "123:4");
        assert!(is_group_jid("1203@g.us"));
        assert!(is_broadcast_jid(STATUS_BROADCAST_JID));
        assert_eq!(
            normalize_user_jid("123.0@s.whatsapp.net"),
            "123@s.whatsapp.net"
        );
        assert_eq!(normalize_user_jid("no-at-sign"), "no-at-sign");
    }
}
