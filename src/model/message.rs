//! The parsed-message tree consumed by the injector.
//!
//! A `Message` is a root header plus an ordered tree of body parts, each
//! addressable by a dotted part number (`""` is the whole message, `"1.2"`
//! the second child of the first part, `"2.rfc822"` the message nested
//! inside part 2). The injector never parses; it consumes this model as
//! built by `model::ingest` or by hand in tests.

use crate::model::Address;
use chrono::{DateTime, Utc};

/// Reserved `field_names` id written when a field name cannot be resolved.
/// Kept distinct from every `FieldType` discriminant so typed-field ids are
/// never aliased by unknown fields.
pub const UNKNOWN_FIELD: i32 = 0;

/// Closed set of header-field types.
///
/// Discriminants are stable: they match the ids of the well-known
/// `field_names` rows seeded by the baseline migration, and everything up to
/// and including `ResentBcc` is an address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FieldType {
    From = 1,
    ResentFrom = 2,
    Sender = 3,
    ResentSender = 4,
    ReturnPath = 5,
    ReplyTo = 6,
    To = 7,
    Cc = 8,
    Bcc = 9,
    ResentTo = 10,
    ResentCc = 11,
    ResentBcc = 12,
    Date = 13,
    OrigDate = 14,
    MessageId = 15,
    ResentMessageId = 16,
    InReplyTo = 17,
    References = 18,
    Subject = 19,
    Comments = 20,
    Keywords = 21,
    ContentType = 22,
    ContentTransferEncoding = 23,
    ContentDisposition = 24,
    ContentDescription = 25,
    ContentLanguage = 26,
    ContentLocation = 27,
    ContentMd5 = 28,
    ContentId = 29,
    MimeVersion = 30,
    Received = 31,
    Other = 32,
}

impl FieldType {
    /// Classify a header-field name.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "from" => Self::From,
            "resent-from" => Self::ResentFrom,
            "sender" => Self::Sender,
            "resent-sender" => Self::ResentSender,
            "return-path" => Self::ReturnPath,
            "reply-to" => Self::ReplyTo,
            "to" => Self::To,
            "cc" => Self::Cc,
            "bcc" => Self::Bcc,
            "resent-to" => Self::ResentTo,
            "resent-cc" => Self::ResentCc,
            "resent-bcc" => Self::ResentBcc,
            "date" => Self::Date,
            "orig-date" => Self::OrigDate,
            "message-id" => Self::MessageId,
            "resent-message-id" => Self::ResentMessageId,
            "in-reply-to" => Self::InReplyTo,
            "references" => Self::References,
            "subject" => Self::Subject,
            "comments" => Self::Comments,
            "keywords" => Self::Keywords,
            "content-type" => Self::ContentType,
            "content-transfer-encoding" => Self::ContentTransferEncoding,
            "content-disposition" => Self::ContentDisposition,
            "content-description" => Self::ContentDescription,
            "content-language" => Self::ContentLanguage,
            "content-location" => Self::ContentLocation,
            "content-md5" => Self::ContentMd5,
            "content-id" => Self::ContentId,
            "mime-version" => Self::MimeVersion,
            "received" => Self::Received,
            _ => Self::Other,
        }
    }

    /// Address fields come first in the enum; everything through
    /// `ResentBcc` carries a list of addresses.
    pub fn is_address(self) -> bool {
        (self as i32) <= (Self::ResentBcc as i32)
    }

    pub fn id(self) -> i32 {
        self as i32
    }
}

/// One field within a header, in insertion order.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    /// Canonicalized field body.
    pub value: String,
    pub field_type: FieldType,
    /// 1-based insertion order within the owning header.
    pub position: i32,
    /// Parsed addresses, for address fields only.
    pub addresses: Vec<Address>,
}

/// An ordered sequence of header fields.
#[derive(Debug, Clone, Default)]
pub struct Header {
    fields: Vec<HeaderField>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a non-address field.
    pub fn add(&mut self, name: &str, value: &str) {
        let position = self.fields.len() as i32 + 1;
        self.fields.push(HeaderField {
            name: name.to_string(),
            value: value.to_string(),
            field_type: FieldType::from_name(name),
            position,
            addresses: Vec::new(),
        });
    }

    /// Append an address field with its parsed address list.
    pub fn add_addresses(&mut self, name: &str, value: &str, addresses: Vec<Address>) {
        let position = self.fields.len() as i32 + 1;
        self.fields.push(HeaderField {
            name: name.to_string(),
            value: value.to_string(),
            field_type: FieldType::from_name(name),
            position,
            addresses,
        });
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn field(&self, field_type: FieldType) -> Option<&HeaderField> {
        self.fields.iter().find(|f| f.field_type == field_type)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.field(FieldType::MessageId).map(|f| f.value.as_str())
    }
}

/// Parsed `Content-Type` main type and subtype, both lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub main: String,
    pub sub: String,
}

impl ContentType {
    pub fn new(main: &str, sub: &str) -> Self {
        Self {
            main: main.to_ascii_lowercase(),
            sub: sub.to_ascii_lowercase(),
        }
    }

    /// Parse from a `type/subtype` string, ignoring parameters.
    pub fn parse(value: &str) -> Option<Self> {
        let base = value.split(';').next()?.trim();
        let (main, sub) = base.split_once('/')?;
        Some(Self::new(main.trim(), sub.trim()))
    }

    pub fn is_multipart(&self) -> bool {
        self.main == "multipart"
    }

    pub fn is_rfc822(&self) -> bool {
        self.main == "message" && self.sub == "rfc822"
    }
}

/// One MIME body part.
#[derive(Debug, Clone, Default)]
pub struct Bodypart {
    pub content_type: Option<ContentType>,
    pub header: Header,
    /// Decoded text form, for `text/*` parts.
    pub text: Option<String>,
    /// Decoded bytes, for everything that is not pure text.
    pub data: Vec<u8>,
    /// Size and line count of the transfer-encoded form, as reported to
    /// IMAP clients.
    pub encoded_bytes: i32,
    pub encoded_lines: i32,
    /// The contained message, for `message/rfc822` parts.
    pub nested: Option<Box<Message>>,
    /// Child parts, for `multipart/*`.
    pub children: Vec<Bodypart>,
}

impl Bodypart {
    /// The decoded payload size, which is what the `bodyparts.bytes`
    /// column records.
    pub fn decoded_len(&self) -> i32 {
        match &self.text {
            Some(text) => text.len() as i32,
            None => self.data.len() as i32,
        }
    }
}

/// A parsed message: root header plus the body-part tree.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub header: Header,
    pub children: Vec<Bodypart>,
    /// IMAP internal date, when known at ingestion (e.g. from an mbox
    /// envelope); otherwise the injector derives one.
    pub internal_date: Option<DateTime<Utc>>,
    /// Size of the RFC 822 serialization.
    pub rfc822_size: i64,
    /// Parse error carried by a message that failed validation. The
    /// injector refuses such messages before touching the database.
    pub error: Option<String>,
}

impl Message {
    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_multipart(&self) -> bool {
        self.header
            .field(FieldType::ContentType)
            .and_then(|f| ContentType::parse(&f.value))
            .map(|ct| ct.is_multipart())
            .unwrap_or(false)
    }

    /// Every body part in the tree, depth first, paired with its dotted
    /// part number. A `message/rfc822` part contributes its own number and
    /// the nested message's parts below it; the nested header itself is
    /// addressed with the `.rfc822` suffix by the link builder.
    pub fn all_parts(&self) -> Vec<(String, &Bodypart)> {
        let mut out = Vec::new();
        collect_parts(&self.children, "", &mut out);
        out
    }
}

fn collect_parts<'a>(
    children: &'a [Bodypart],
    prefix: &str,
    out: &mut Vec<(String, &'a Bodypart)>,
) {
    for (index, part) in children.iter().enumerate() {
        let number = if prefix.is_empty() {
            format!("{}", index + 1)
        } else {
            format!("{}.{}", prefix, index + 1)
        };
        out.push((number.clone(), part));
        if let Some(nested) = &part.nested {
            collect_parts(&nested.children, &number, out);
        }
        collect_parts(&part.children, &number, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_part(body: &str) -> Bodypart {
        Bodypart {
            content_type: Some(ContentType::new("text", "plain")),
            text: Some(body.to_string()),
            encoded_bytes: body.len() as i32,
            encoded_lines: body.lines().count() as i32,
            ..Default::default()
        }
    }

    #[test]
    fn field_type_classification() {
        assert_eq!(FieldType::from_name("From"), FieldType::From);
        assert_eq!(FieldType::from_name("RECEIVED"), FieldType::Received);
        assert_eq!(FieldType::from_name("X-Spam-Score"), FieldType::Other);
        assert!(FieldType::Bcc.is_address());
        assert!(!FieldType::Date.is_address());
        assert_ne!(UNKNOWN_FIELD, FieldType::Other.id());
    }

    #[test]
    fn part_numbers_flat() {
        let msg = Message {
            children: vec![text_part("a"), text_part("b")],
            ..Default::default()
        };
        let numbers: Vec<String> = msg.all_parts().into_iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec!["1", "2"]);
    }

    #[test]
    fn part_numbers_nested_multipart() {
        let inner = Bodypart {
            content_type: Some(ContentType::new("multipart", "mixed")),
            children: vec![text_part("x"), text_part("y")],
            ..Default::default()
        };
        let msg = Message {
            children: vec![text_part("a"), inner],
            ..Default::default()
        };
        let numbers: Vec<String> = msg.all_parts().into_iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec!["1", "2", "2.1", "2.2"]);
    }

    #[test]
    fn part_numbers_rfc822() {
        let nested = Message {
            children: vec![text_part("inner")],
            ..Default::default()
        };
        let wrapper = Bodypart {
            content_type: Some(ContentType::new("message", "rfc822")),
            nested: Some(Box::new(nested)),
            ..Default::default()
        };
        let msg = Message {
            children: vec![text_part("a"), wrapper],
            ..Default::default()
        };
        let numbers: Vec<String> = msg.all_parts().into_iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec!["1", "2", "2.1"]);
    }

    #[test]
    fn header_positions_are_insertion_order() {
        let mut header = Header::new();
        header.add("Subject", "one");
        header.add("Received", "two");
        assert_eq!(header.fields()[0].position, 1);
        assert_eq!(header.fields()[1].position, 2);
    }
}
