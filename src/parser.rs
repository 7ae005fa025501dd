use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::gmail::types::{Message, MessagePart};

/// Canonical in-memory form of one email, decoded from the Gmail API JSON
/// representation. This is what the archive writer and every export format
/// consume.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedMessage {
    pub id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
    pub snippet: String,
    pub size_estimate: u64,
    /// Lower-cased header name -> raw value; on duplicates the last
    /// occurrence wins, matching provider behavior.
    pub headers: BTreeMap<String, String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub body: MessageBody,
    pub attachments: Vec<AttachmentInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageBody {
    pub text: String,
    pub html: String,
}

/// Attachment metadata only; the bytes are never materialized here.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentInfo {
    pub attachment_id: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug)]
pub enum ParseError {
    /// The provider message carried no id. This fails the one message, not
    /// the batch.
    MissingId,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingId => write!(f, "message has no id"),
        }
    }
}

/// The two shapes Gmail delivers message content in, resolved once at
/// decode entry instead of probing fields throughout the walk.
enum Payload<'a> {
    Raw(&'a str),
    Structured(&'a MessagePart),
    Empty,
}

/// Decode a Gmail API message into a [`ParsedMessage`].
///
/// A missing id is the only hard failure. Malformed headers, bodies, or
/// dates all degrade to best-effort values rather than erroring.
pub fn decode(message: &Message) -> Result<ParsedMessage, ParseError> {
    if message.id.is_empty() {
        return Err(ParseError::MissingId);
    }

    let mut parsed = ParsedMessage {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        label_ids: message.label_ids.clone(),
        snippet: message.snippet.clone(),
        size_estimate: message.size_estimate,
        ..ParsedMessage::default()
    };

    if let Some(payload) = &message.payload {
        for header in &payload.headers {
            parsed
                .headers
                .insert(header.name.to_lowercase(), header.value.clone());
        }
    }

    parsed.from = parsed.headers.get("from").cloned().unwrap_or_default();
    parsed.to = parsed.headers.get("to").cloned().unwrap_or_default();
    parsed.subject = decode_header_value(parsed.headers.get("subject").map(String::as_str));
    parsed.date = parsed
        .headers
        .get("date")
        .and_then(|value| parse_date(value));

    let payload = match (&message.raw, &message.payload) {
        (Some(raw), _) => Payload::Raw(raw),
        (None, Some(part)) => Payload::Structured(part),
        (None, None) => Payload::Empty,
    };

    let (body, attachments) = match payload {
        Payload::Raw(raw) => decode_raw(raw),
        Payload::Structured(part) => decode_structured(part),
        Payload::Empty => (MessageBody::default(), Vec::new()),
    };
    parsed.body = body;
    parsed.attachments = attachments;

    Ok(parsed)
}

/// Raw mode: the provider returned a base64url RFC 822 blob. Parse the MIME
/// tree and classify each leaf.
fn decode_raw(raw: &str) -> (MessageBody, Vec<AttachmentInfo>) {
    let bytes = decode_base64url(raw);
    let mut body = MessageBody::default();
    let mut attachments = Vec::new();

    let parser = MessageParser::default();
    let Some(parsed) = parser.parse(&bytes) else {
        return (body, attachments);
    };

    for part in &parsed.parts {
        let is_attachment = part
            .content_disposition()
            .map(|d| d.ctype().eq_ignore_ascii_case("attachment"))
            .unwrap_or(false);

        if is_attachment {
            if let Some(name) = part.attachment_name() {
                attachments.push(AttachmentInfo {
                    attachment_id: None,
                    filename: name.to_string(),
                    mime_type: part_content_type(part),
                    size: part.contents().len() as u64,
                });
            }
            continue;
        }

        // Last writer wins per type; well-formed messages carry at most one
        // alternative of each.
        match &part.body {
            PartType::Text(text) => body.text = text.as_ref().to_string(),
            PartType::Html(html) => body.html = html.as_ref().to_string(),
            _ => {}
        }
    }

    (body, attachments)
}

fn part_content_type(part: &mail_parser::MessagePart<'_>) -> String {
    part.content_type()
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Structured mode: walk the Gmail parts tree. Attachment parts contribute
/// metadata only; inline parts are base64url-decoded and classified.
fn decode_structured(payload: &MessagePart) -> (MessageBody, Vec<AttachmentInfo>) {
    let mut body = MessageBody::default();
    let mut attachments = Vec::new();

    if payload.parts.is_empty() {
        if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
            let decoded = decode_base64url_text(data);
            if payload.mime_type.contains("text/html") {
                body.html = decoded;
            } else {
                // Unknown types on a single-part message are treated as
                // plain text.
                body.text = decoded;
            }
        }
    } else {
        for part in &payload.parts {
            walk_part(part, &mut body, &mut attachments);
        }
    }

    (body, attachments)
}

fn walk_part(part: &MessagePart, body: &mut MessageBody, attachments: &mut Vec<AttachmentInfo>) {
    let attachment_id = part.body.as_ref().and_then(|b| b.attachment_id.clone());
    if attachment_id.is_some() || !part.filename.is_empty() {
        attachments.push(AttachmentInfo {
            attachment_id,
            filename: part.filename.clone(),
            mime_type: part.mime_type.clone(),
            size: part.body.as_ref().map(|b| b.size).unwrap_or(0),
        });
        return;
    }

    if !part.parts.is_empty() {
        for child in &part.parts {
            walk_part(child, body, attachments);
        }
        return;
    }

    if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
        let decoded = decode_base64url_text(data);
        if part.mime_type.contains("text/plain") {
            body.text = decoded;
        } else if part.mime_type.contains("text/html") {
            body.html = decoded;
        }
    }
}

/// Decode base64url data, correcting missing `=` padding first. Returns an
/// empty vec on garbage input; never errors.
fn decode_base64url(data: &str) -> Vec<u8> {
    let mut padded = data.trim().to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    base64::engine::general_purpose::URL_SAFE
        .decode(padded.as_bytes())
        .unwrap_or_default()
}

fn decode_base64url_text(data: &str) -> String {
    String::from_utf8_lossy(&decode_base64url(data)).into_owned()
}

/// Decode RFC 2047 encoded-words in a header value. Falls back to the raw
/// value when nothing decodes.
fn decode_header_value(value: Option<&str>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    if !value.contains("=?") {
        return value.to_string();
    }

    // Wrap the value in a minimal message so mail-parser's header decoder
    // can be reused.
    let synthetic = format!("Subject: {}\n\n", value);
    let parser = MessageParser::default();
    parser
        .parse(synthetic.as_bytes())
        .and_then(|m| m.subject().map(|s| s.to_string()))
        .unwrap_or_else(|| value.to_string())
}

/// Best-effort date header parsing: RFC 2822, then RFC 3339, then a few
/// permissive formats, then mail-parser as a last resort. Unparseable input
/// yields `None`, never an error.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let no_dow = strip_day_of_week(trimmed);
    let formats = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in &formats {
        if let Ok(dt) = DateTime::parse_from_str(&no_dow, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&no_dow, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    // Last resort: mail-parser's own date parser via a synthetic header.
    let synthetic = format!("Date: {}\n\n", trimmed);
    let parser = MessageParser::default();
    let rfc3339 = parser.parse(synthetic.as_bytes())?.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&rfc3339)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn strip_day_of_week(s: &str) -> String {
    let days = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in days {
        if let Some(rest) = s.strip_prefix(day) {
            return rest.trim_start_matches(',').trim_start().to_string();
        }
    }
    s.to_string()
}

/// Encode a [`ParsedMessage`] back into RFC 822 bytes.
///
/// Headers are emitted verbatim (content-framing ones regenerated); when
/// both renditions exist the body becomes multipart/alternative with html
/// as the preferred part. The contract is a mail-client-readable message
/// semantically equal to the source, not byte identity with it.
pub fn to_rfc822(message: &ParsedMessage) -> Vec<u8> {
    let mut out = String::new();

    for (name, value) in &message.headers {
        if matches!(
            name.as_str(),
            "content-type" | "mime-version" | "content-transfer-encoding"
        ) {
            continue;
        }
        out.push_str(&canonical_header_name(name));
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push_str("MIME-Version: 1.0\n");

    let body = &message.body;
    if !body.html.is_empty() && !body.text.is_empty() {
        let boundary = format!("----=_gmback_{}", sanitize_boundary(&message.id));
        out.push_str(&format!(
            "Content-Type: multipart/alternative; boundary=\"{}\"\n\n",
            boundary
        ));
        push_alternative_part(&mut out, &boundary, "text/plain", &body.text);
        push_alternative_part(&mut out, &boundary, "text/html", &body.html);
        out.push_str(&format!("--{}--\n", boundary));
    } else if !body.html.is_empty() {
        out.push_str("Content-Type: text/html; charset=\"utf-8\"\n");
        out.push_str("Content-Transfer-Encoding: 8bit\n\n");
        out.push_str(&body.html);
    } else {
        out.push_str("Content-Type: text/plain; charset=\"utf-8\"\n");
        out.push_str("Content-Transfer-Encoding: 8bit\n\n");
        out.push_str(&body.text);
    }

    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.into_bytes()
}

fn push_alternative_part(out: &mut String, boundary: &str, mime_type: &str, content: &str) {
    out.push_str(&format!("--{}\n", boundary));
    out.push_str(&format!("Content-Type: {}; charset=\"utf-8\"\n", mime_type));
    out.push_str("Content-Transfer-Encoding: 8bit\n\n");
    out.push_str(content);
    if !content.ends_with('\n') {
        out.push('\n');
    }
}

fn sanitize_boundary(id: &str) -> String {
    let cleaned: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        "part".to_string()
    } else {
        cleaned
    }
}

/// "message-id" -> "Message-Id"
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::types::Message;
    use serde_json::json;

    fn message_from_json(value: serde_json::Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    fn b64url(data: &[u8]) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
    }

    #[test]
    fn test_decode_missing_id_is_hard_failure() {
        let message = message_from_json(json!({ "threadId": "t1" }));
        assert!(matches!(decode(&message), Err(ParseError::MissingId)));
    }

    #[test]
    fn test_decode_structured_multipart() {
        let message = message_from_json(json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX"],
            "snippet": "hi there",
            "sizeEstimate": 512,
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    { "name": "From", "value": "Alice <alice@example.com>" },
                    { "name": "To", "value": "bob@example.com" },
                    { "name": "Subject", "value": "Greetings" },
                    { "name": "Date", "value": "Mon, 01 Jan 2024 12:00:00 +0000" }
                ],
                "parts": [
                    { "mimeType": "text/plain", "filename": "",
                      "body": { "size": 8, "data": b64url(b"hi there") } },
                    { "mimeType": "text/html", "filename": "",
                      "body": { "size": 20, "data": b64url(b"<p>hi there</p>") } },
                    { "mimeType": "application/pdf", "filename": "doc.pdf",
                      "body": { "attachmentId": "att-1", "size": 1024 } }
                ]
            }
        }));

        let parsed = decode(&message).unwrap();
        assert_eq!(parsed.id, "m1");
        assert_eq!(parsed.from, "Alice <alice@example.com>");
        assert_eq!(parsed.to, "bob@example.com");
        assert_eq!(parsed.subject, "Greetings");
        assert_eq!(
            parsed.date.unwrap().to_rfc3339(),
            "2024-01-01T12:00:00+00:00"
        );
        assert_eq!(parsed.body.text, "hi there");
        assert_eq!(parsed.body.html, "<p>hi there</p>");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "doc.pdf");
        assert_eq!(parsed.attachments[0].attachment_id.as_deref(), Some("att-1"));
        assert_eq!(parsed.attachments[0].size, 1024);
    }

    #[test]
    fn test_decode_structured_nested_parts() {
        // multipart/mixed wrapping a multipart/alternative
        let message = message_from_json(json!({
            "id": "m1",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [],
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "filename": "",
                        "parts": [
                            { "mimeType": "text/plain", "filename": "",
                              "body": { "size": 5, "data": b64url(b"plain") } },
                            { "mimeType": "text/html", "filename": "",
                              "body": { "size": 11, "data": b64url(b"<b>html</b>") } }
                        ]
                    },
                    { "mimeType": "image/png", "filename": "pic.png",
                      "body": { "attachmentId": "att-2", "size": 99 } }
                ]
            }
        }));

        let parsed = decode(&message).unwrap();
        assert_eq!(parsed.body.text, "plain");
        assert_eq!(parsed.body.html, "<b>html</b>");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "pic.png");
    }

    #[test]
    fn test_decode_single_part_unknown_type_treated_as_text() {
        let message = message_from_json(json!({
            "id": "m1",
            "payload": {
                "mimeType": "application/x-custom",
                "headers": [],
                "body": { "size": 5, "data": b64url(b"weird") }
            }
        }));
        let parsed = decode(&message).unwrap();
        assert_eq!(parsed.body.text, "weird");
        assert!(parsed.body.html.is_empty());
    }

    #[test]
    fn test_decode_duplicate_headers_last_wins() {
        let message = message_from_json(json!({
            "id": "m1",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    { "name": "X-Tag", "value": "first" },
                    { "name": "x-tag", "value": "second" }
                ],
                "body": { "size": 0 }
            }
        }));
        let parsed = decode(&message).unwrap();
        assert_eq!(parsed.headers.get("x-tag").map(String::as_str), Some("second"));
    }

    #[test]
    fn test_decode_raw_mode() {
        let raw = b"From: alice@example.com\r\n\
            To: bob@example.com\r\n\
            Subject: raw test\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            raw body here\r\n";
        let message = message_from_json(json!({
            "id": "m1",
            "raw": b64url(raw)
        }));
        let parsed = decode(&message).unwrap();
        assert_eq!(parsed.body.text.trim_end(), "raw body here");
        assert!(parsed.body.html.is_empty());
    }

    #[test]
    fn test_decode_raw_mode_garbage_degrades_to_empty_body() {
        let message = message_from_json(json!({
            "id": "m1",
            "raw": "!!!not-base64!!!"
        }));
        let parsed = decode(&message).unwrap();
        assert!(parsed.body.text.is_empty());
        assert!(parsed.body.html.is_empty());
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn test_base64url_padding_correction() {
        // "hello world" encodes to 15 chars without padding
        assert_eq!(decode_base64url("aGVsbG8gd29ybGQ"), b"hello world");
        assert_eq!(decode_base64url("aGVsbG8gd29ybGQ="), b"hello world");
    }

    #[test]
    fn test_decode_header_value_encoded_word() {
        let decoded = decode_header_value(Some("=?utf-8?q?hello_world?="));
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn test_decode_header_value_plain_passthrough() {
        assert_eq!(decode_header_value(Some("Just a subject")), "Just a subject");
        assert_eq!(decode_header_value(None), "");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(
            parse_date("Mon, 01 Jan 2024 12:00:00 +0000")
                .unwrap()
                .to_rfc3339(),
            "2024-01-01T12:00:00+00:00"
        );
        assert_eq!(
            parse_date("2024-01-01T12:00:00Z").unwrap().to_rfc3339(),
            "2024-01-01T12:00:00+00:00"
        );
        assert!(parse_date("1 Jan 2024 12:00:00").is_some());
        assert!(parse_date("").is_none());
        assert!(parse_date("definitely not a date").is_none());
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("subject"), "Subject");
        assert_eq!(canonical_header_name("message-id"), "Message-Id");
        assert_eq!(canonical_header_name("x-custom-tag"), "X-Custom-Tag");
    }

    #[test]
    fn test_to_rfc822_text_only() {
        let mut message = ParsedMessage {
            id: "m1".to_string(),
            ..ParsedMessage::default()
        };
        message
            .headers
            .insert("from".to_string(), "alice@example.com".to_string());
        message
            .headers
            .insert("subject".to_string(), "Hello".to_string());
        message.body.text = "plain body".to_string();

        let bytes = to_rfc822(&message);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("From: alice@example.com\n"));
        assert!(text.contains("Subject: Hello\n"));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_roundtrip_preserves_subject_from_to_and_bodies() {
        let mut message = ParsedMessage {
            id: "roundtrip1".to_string(),
            ..ParsedMessage::default()
        };
        message
            .headers
            .insert("from".to_string(), "Alice <alice@example.com>".to_string());
        message
            .headers
            .insert("to".to_string(), "bob@example.com".to_string());
        message
            .headers
            .insert("subject".to_string(), "Round trip".to_string());
        message.body.text = "the plain rendition".to_string();
        message.body.html = "<p>the html rendition</p>".to_string();

        let bytes = to_rfc822(&message);
        let parser = MessageParser::default();
        let reparsed = parser.parse(&bytes).expect("reparse encoded message");

        assert_eq!(reparsed.subject(), Some("Round trip"));
        let from = reparsed
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .unwrap();
        assert_eq!(from, "alice@example.com");
        let to = reparsed
            .to()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .unwrap();
        assert_eq!(to, "bob@example.com");
        assert_eq!(
            reparsed.body_text(0).unwrap().trim_end(),
            "the plain rendition"
        );
        assert_eq!(
            reparsed.body_html(0).unwrap().trim_end(),
            "<p>the html rendition</p>"
        );
    }
}
