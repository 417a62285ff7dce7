//! Header link extraction.
//!
//! One walk over the message tree produces everything the header tables
//! need: `FieldLink`s for `header_fields`, `AddressLink`s for
//! `address_fields`, `DateLink`s for `date_fields`, and the list of
//! nonstandard field names that must be interned.

use crate::model::{Address, FieldType, Header, Message};
use chrono::{DateTime, Utc};

/// One `header_fields` row in waiting.
#[derive(Debug, Clone)]
pub(crate) struct FieldLink {
    pub name: String,
    pub value: String,
    pub field_type: FieldType,
    pub part: String,
    pub position: i32,
}

/// One `address_fields` row in waiting. `number` is the 0-based index of
/// the address within its field.
#[derive(Debug, Clone)]
pub(crate) struct AddressLink {
    pub address: Address,
    pub field_type: FieldType,
    pub part: String,
    pub position: i32,
    pub number: i32,
}

/// One `date_fields` row in waiting (top-level `Date` only).
#[derive(Debug, Clone)]
pub(crate) struct DateLink {
    pub value: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct Links {
    pub fields: Vec<FieldLink>,
    pub addresses: Vec<AddressLink>,
    pub dates: Vec<DateLink>,
    /// Nonstandard field names, in order of first appearance.
    pub other_fields: Vec<String>,
}

/// Walk the message and collect all header links.
///
/// The root header is part `""`. For a message that is not `multipart/*`,
/// the first body part's MIME fields are physically colocated with the 822
/// header and are skipped. A `message/rfc822` part additionally contributes
/// its nested message's header under the `.rfc822` suffix.
pub(crate) fn build(message: &Message) -> Links {
    let mut links = Links::default();
    collect_header(&mut links, &message.header, "");

    let mut skip = !message.is_multipart();
    for (part_number, part) in message.all_parts() {
        if skip {
            skip = false;
        } else {
            collect_header(&mut links, &part.header, &part_number);
        }

        if let Some(nested) = &part.nested {
            collect_header(&mut links, &nested.header, &format!("{}.rfc822", part_number));
        }
    }

    links
}

fn collect_header(links: &mut Links, header: &Header, part: &str) {
    for field in header.fields() {
        if field.field_type == FieldType::Other {
            links.other_fields.push(field.name.clone());
        }

        if field.field_type.is_address() {
            for (number, address) in field.addresses.iter().enumerate() {
                links.addresses.push(AddressLink {
                    address: address.clone(),
                    field_type: field.field_type,
                    part: part.to_string(),
                    position: field.position,
                    number: number as i32,
                });
            }
        } else if field.field_type == FieldType::Date && part.is_empty() {
            if let Some(value) = parse_date(&field.value) {
                links.dates.push(DateLink { value });
            }
        } else {
            links.fields.push(FieldLink {
                name: field.name.clone(),
                value: field.value.clone(),
                field_type: field.field_type,
                part: part.to_string(),
                position: field.position,
            });
        }
    }
}

/// Parse an RFC 2822 date field body.
pub(crate) fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bodypart, ContentType};

    fn text_part(body: &str) -> Bodypart {
        Bodypart {
            content_type: Some(ContentType::new("text", "plain")),
            text: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn simple_message() -> Message {
        let mut msg = Message::default();
        msg.header.add_addresses(
            "From",
            "a@x.example",
            vec![Address::new("", "a", "x.example")],
        );
        msg.header.add_addresses(
            "To",
            "b@y.example, c@z.example",
            vec![
                Address::new("", "b", "y.example"),
                Address::new("", "c", "z.example"),
            ],
        );
        msg.header.add("Date", "Mon, 5 Jan 2026 10:00:00 +0000");
        msg.header.add("X-Loop", "1");
        msg.children = vec![text_part("hi")];
        msg
    }

    #[test]
    fn address_links_numbered_within_field() {
        let links = build(&simple_message());
        assert_eq!(links.addresses.len(), 3);
        let to: Vec<_> = links
            .addresses
            .iter()
            .filter(|l| l.field_type == FieldType::To)
            .collect();
        assert_eq!(to[0].number, 0);
        assert_eq!(to[1].number, 1);
        assert_eq!(to[0].position, to[1].position);
    }

    #[test]
    fn root_date_goes_to_date_links_only() {
        let links = build(&simple_message());
        assert_eq!(links.dates.len(), 1);
        assert!(links.fields.iter().all(|f| f.field_type != FieldType::Date));
    }

    #[test]
    fn other_fields_collected_for_interning() {
        let links = build(&simple_message());
        assert_eq!(links.other_fields, vec!["X-Loop".to_string()]);
        assert!(links
            .fields
            .iter()
            .any(|f| f.name == "X-Loop" && f.part.is_empty()));
    }

    #[test]
    fn single_part_mime_header_is_skipped() {
        let mut msg = simple_message();
        msg.children[0]
            .header
            .add("Content-Type", "text/plain; charset=utf-8");
        let links = build(&msg);
        // The part's Content-Type is colocated with the root header and
        // must not be linked again under part "1".
        assert!(links.fields.iter().all(|f| f.part != "1"));
    }

    #[test]
    fn multipart_part_headers_are_linked() {
        let mut msg = Message::default();
        msg.header.add("Content-Type", "multipart/mixed");
        let mut part = text_part("hi");
        part.header.add("Content-Type", "text/plain");
        msg.children = vec![part, text_part("there")];
        let links = build(&msg);
        assert!(links.fields.iter().any(|f| f.part == "1"));
    }

    #[test]
    fn rfc822_part_recurses_with_suffix() {
        let mut nested = Message::default();
        nested.header.add("Subject", "inner");
        nested.children = vec![text_part("inner body")];
        let mut msg = Message::default();
        msg.header.add("Content-Type", "multipart/mixed");
        let wrapper = Bodypart {
            content_type: Some(ContentType::new("message", "rfc822")),
            nested: Some(Box::new(nested)),
            ..Default::default()
        };
        msg.children = vec![text_part("cover"), wrapper];
        let links = build(&msg);
        assert!(links
            .fields
            .iter()
            .any(|f| f.part == "2.rfc822" && f.name == "Subject"));
    }
}
