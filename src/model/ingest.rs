//! Adapter from raw RFC 822 bytes to the injector's message model.
//!
//! Parsing proper is `mailparse`'s job; this module only maps its output
//! onto `Message`/`Bodypart` and normalizes what PostgreSQL cannot store
//! (NUL bytes). The injector itself never sees raw bytes.

use crate::model::{Address, Bodypart, ContentType, Header, Message};
use mailparse::{parse_mail, MailAddr, MailHeader, ParsedMail};
use thiserror::Error;

/// Errors raised while building a `Message` from raw bytes.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to parse MIME structure: {0}")]
    MimeParse(#[from] mailparse::MailParseError),
}

/// Sanitize text by removing NUL bytes that PostgreSQL cannot store.
fn sanitize_text(text: &str) -> String {
    if text.contains('\0') {
        text.replace('\0', "")
    } else {
        text.to_string()
    }
}

/// Build a `Message` from raw RFC 822 bytes.
pub fn message_from_bytes(raw: &[u8]) -> Result<Message, IngestError> {
    let parsed = parse_mail(raw)?;
    let header = build_header(&parsed.headers);
    let children = build_children(&parsed)?;

    Ok(Message {
        header,
        children,
        internal_date: None,
        rfc822_size: raw.len() as i64,
        error: None,
    })
}

fn build_header(headers: &[MailHeader<'_>]) -> Header {
    let mut header = Header::new();
    for raw in headers {
        let name = raw.get_key();
        let value = sanitize_text(raw.get_value().trim());
        let field_type = crate::model::FieldType::from_name(&name);
        if field_type.is_address() {
            header.add_addresses(&name, &value, parse_addresses(&value));
        } else {
            header.add(&name, &value);
        }
    }
    header
}

fn parse_addresses(value: &str) -> Vec<Address> {
    match mailparse::addrparse(value) {
        Ok(list) => {
            let mut out = Vec::new();
            for addr in list.iter() {
                match addr {
                    MailAddr::Single(info) => {
                        if let Some(a) = split_addr(info.display_name.as_deref(), &info.addr) {
                            out.push(a);
                        }
                    }
                    MailAddr::Group(group) => {
                        for info in &group.addrs {
                            if let Some(a) = split_addr(info.display_name.as_deref(), &info.addr) {
                                out.push(a);
                            }
                        }
                    }
                }
            }
            out
        }
        // Tolerate malformed address lists; a best-effort single parse is
        // better than dropping the field.
        Err(_) => Address::parse(value).into_iter().collect(),
    }
}

fn split_addr(display_name: Option<&str>, addr: &str) -> Option<Address> {
    let at = addr.rfind('@')?;
    if at == 0 || at + 1 == addr.len() {
        return None;
    }
    Some(Address::new(
        &sanitize_text(display_name.unwrap_or("")),
        &addr[..at],
        &addr[at + 1..],
    ))
}

fn build_children(parsed: &ParsedMail<'_>) -> Result<Vec<Bodypart>, IngestError> {
    if parsed.ctype.mimetype.starts_with("multipart/") {
        parsed.subparts.iter().map(build_part).collect()
    } else {
        // A single-part message still has one body part, numbered "1". Its
        // header block is shared with the 822 header, so the part keeps
        // only the MIME fields.
        let mut part = build_part(parsed)?;
        part.header = mime_header(&parsed.headers);
        Ok(vec![part])
    }
}

fn mime_header(headers: &[MailHeader<'_>]) -> Header {
    let mut header = Header::new();
    for raw in headers {
        let name = raw.get_key();
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("content-") || lower == "mime-version" {
            header.add(&name, &sanitize_text(raw.get_value().trim()));
        }
    }
    header
}

fn build_part(parsed: &ParsedMail<'_>) -> Result<Bodypart, IngestError> {
    let content_type = ContentType::parse(&parsed.ctype.mimetype);
    let mut part = Bodypart {
        content_type: content_type.clone(),
        header: build_header(&parsed.headers),
        ..Default::default()
    };

    match content_type {
        Some(ct) if ct.is_multipart() => {
            part.children = parsed.subparts.iter().map(build_part).collect::<Result<_, _>>()?;
        }
        Some(ct) if ct.is_rfc822() => {
            let raw = parsed.get_body_raw()?;
            let nested = message_from_bytes(&raw)?;
            part.data = raw;
            part.nested = Some(Box::new(nested));
        }
        Some(ct) if ct.main == "text" => {
            let text = sanitize_text(&parsed.get_body()?);
            if ct.sub == "html" {
                part.data = parsed.get_body_raw()?;
            }
            part.text = Some(text);
        }
        _ => {
            part.data = parsed.get_body_raw()?;
        }
    }

    let raw_body = parsed.get_body_raw()?;
    part.encoded_bytes = raw_body.len() as i32;
    part.encoded_lines = raw_body.iter().filter(|&&b| b == b'\n').count() as i32;
    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    #[test]
    fn single_part_text() {
        let raw = b"From: Ann <a@x.example>\r\n\
                    To: b@y.example\r\n\
                    Subject: hello\r\n\
                    Date: Mon, 5 Jan 2026 10:00:00 +0000\r\n\
                    \r\n\
                    hi\r\n";
        let msg = message_from_bytes(raw).unwrap();
        assert!(msg.valid());
        assert!(!msg.is_multipart());
        assert_eq!(msg.children.len(), 1);
        assert_eq!(msg.children[0].text.as_deref(), Some("hi\r\n"));

        let from = msg.header.field(FieldType::From).unwrap();
        assert_eq!(from.addresses.len(), 1);
        assert_eq!(from.addresses[0].localpart, "a");
        assert_eq!(from.addresses[0].name, "Ann");
    }

    #[test]
    fn multipart_two_parts() {
        let raw = b"From: a@x.example\r\n\
                    Content-Type: multipart/mixed; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    first\r\n\
                    --b\r\n\
                    Content-Type: application/octet-stream\r\n\
                    \r\n\
                    second\r\n\
                    --b--\r\n";
        let msg = message_from_bytes(raw).unwrap();
        assert!(msg.is_multipart());
        assert_eq!(msg.children.len(), 2);
        assert!(msg.children[0].text.is_some());
        assert!(msg.children[1].text.is_none());
        assert!(!msg.children[1].data.is_empty());
    }

    #[test]
    fn strips_nul_bytes() {
        assert_eq!(sanitize_text("a\0b"), "ab");
    }
}
