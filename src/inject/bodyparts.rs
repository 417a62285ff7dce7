//! Content-addressed body-part storage.
//!
//! Body parts dedup by the MD5 of their normalized payload: two messages
//! sharing an attachment share one `bodyparts` row. What gets stored
//! depends on the content type:
//!
//! - `text/plain` (and untyped parts): `text` only
//! - `text/html`: stripped text in `text`, the HTML source in `data`
//! - `multipart/signed`: `data` (signature-preserving); other `multipart/*`
//!   and `message/rfc822`: nothing (their children are stored instead)
//! - everything else: `data`
//!
//! Each part inserts under its own savepoint; a `bodyparts_hash_key`
//! violation means another injector won the race and the follow-up select
//! finds the winner's row. Savepoints are serialized across parts.

use crate::error::is_unique_race;
use crate::inject::intern::Savepoints;
use crate::model::{Bodypart, Message};
use sqlx::{Postgres, Transaction};

const INTO_BODYPARTS: &str =
    "INSERT INTO bodyparts (hash, bytes, text, data) VALUES ($1, $2, $3, $4)";
const ID_BODYPART: &str = "SELECT id FROM bodyparts WHERE hash=$1";

/// What a body part stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Storage {
    Neither,
    TextOnly,
    DataOnly,
    TextAndData,
}

pub(crate) fn storage_for(part: &Bodypart) -> Storage {
    match &part.content_type {
        None => Storage::TextOnly,
        Some(ct) if ct.main == "text" => {
            if ct.sub == "html" {
                Storage::TextAndData
            } else {
                Storage::TextOnly
            }
        }
        Some(ct) if ct.is_multipart() => {
            if ct.sub == "signed" {
                Storage::DataOnly
            } else {
                Storage::Neither
            }
        }
        Some(ct) if ct.is_rfc822() => Storage::Neither,
        Some(_) => Storage::DataOnly,
    }
}

/// The payload bound for one stored body part.
#[derive(Debug, Clone)]
pub(crate) struct StorePayload {
    pub hash: String,
    /// Decoded payload size, recorded in `bodyparts.bytes`.
    pub bytes: i32,
    pub text: Option<String>,
    pub data: Option<Vec<u8>>,
}

/// One body part's injection plan: its part number, IMAP size metadata,
/// optional storage payload, and the row id once resolved.
#[derive(Debug, Clone)]
pub(crate) struct PartPlan {
    pub part_number: String,
    pub encoded_bytes: i32,
    pub encoded_lines: i32,
    pub has_nested: bool,
    pub store: Option<StorePayload>,
    pub id: Option<i32>,
}

/// Build the storage plan for every part in the tree.
pub(crate) fn plan(message: &Message) -> Vec<PartPlan> {
    message
        .all_parts()
        .into_iter()
        .map(|(part_number, part)| PartPlan {
            part_number,
            encoded_bytes: part.encoded_bytes,
            encoded_lines: part.encoded_lines,
            has_nested: part.nested.is_some(),
            store: payload_for(part),
            id: None,
        })
        .collect()
}

fn payload_for(part: &Bodypart) -> Option<StorePayload> {
    let storage = storage_for(part);
    match storage {
        Storage::Neither => None,
        Storage::TextOnly => {
            let text = part.text.clone().unwrap_or_default();
            Some(StorePayload {
                hash: format!("{:x}", md5::compute(text.as_bytes())),
                bytes: part.decoded_len(),
                text: Some(text),
                data: None,
            })
        }
        Storage::TextAndData => {
            // The hash and the data column both cover the HTML source; the
            // text column carries the stripped form for search and fetch.
            let html = part.text.clone().unwrap_or_default();
            Some(StorePayload {
                hash: format!("{:x}", md5::compute(html.as_bytes())),
                bytes: part.decoded_len(),
                text: Some(html_to_text(&html)),
                data: Some(html.into_bytes()),
            })
        }
        Storage::DataOnly => Some(StorePayload {
            hash: format!("{:x}", md5::compute(&part.data)),
            bytes: part.decoded_len(),
            text: None,
            data: Some(part.data.clone()),
        }),
    }
}

/// Insert-or-find every storable part, serially, filling in `PartPlan::id`.
///
/// Returns the first error as a string; the caller records it as the
/// bodypart error for `Injector::error()` priority.
pub(crate) async fn store(
    tx: &mut Transaction<'_, Postgres>,
    savepoints: &mut Savepoints,
    plans: &mut [PartPlan],
) -> Result<(), sqlx::Error> {
    for plan in plans.iter_mut() {
        let Some(payload) = &plan.store else {
            continue;
        };

        let savepoint = savepoints.next();
        sqlx::query(&format!("SAVEPOINT {}", savepoint))
            .execute(&mut **tx)
            .await?;

        let insert = sqlx::query(INTO_BODYPARTS)
            .bind(&payload.hash)
            .bind(payload.bytes)
            .bind(payload.text.as_deref())
            .bind(payload.data.as_deref())
            .execute(&mut **tx)
            .await;

        match insert {
            Ok(_) => {}
            Err(err) if is_unique_race(&err, "bodyparts_hash_key") => {
                // Another injector inserted the same part; its row is the
                // answer.
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", savepoint))
                    .execute(&mut **tx)
                    .await?;
            }
            Err(err) => return Err(err),
        }

        let id: Option<i32> = sqlx::query_scalar(ID_BODYPART)
            .bind(&payload.hash)
            .fetch_optional(&mut **tx)
            .await?;

        match id {
            Some(id) => plan.id = Some(id),
            None => return Err(sqlx::Error::RowNotFound),
        }
    }

    Ok(())
}

/// Strip HTML down to its text content: tags removed, common entities
/// decoded, whitespace collapsed.
pub(crate) fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.chars().peekable();
    let mut in_tag = false;

    while let Some(c) = chars.next() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                if !out.ends_with(' ') && !out.is_empty() {
                    out.push(' ');
                }
            }
            '&' if !in_tag => {
                let mut entity = String::new();
                while let Some(&next) = chars.peek() {
                    if next == ';' {
                        chars.next();
                        break;
                    }
                    if entity.len() > 8 || next == '&' || next == '<' {
                        break;
                    }
                    entity.push(next);
                    chars.next();
                }
                match entity.as_str() {
                    "amp" => out.push('&'),
                    "lt" => out.push('<'),
                    "gt" => out.push('>'),
                    "quot" => out.push('"'),
                    "apos" => out.push('\''),
                    "nbsp" => out.push(' '),
                    _ => {}
                }
            }
            _ if in_tag => {}
            _ => out.push(c),
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentType;

    fn part(main: &str, sub: &str) -> Bodypart {
        Bodypart {
            content_type: Some(ContentType::new(main, sub)),
            ..Default::default()
        }
    }

    #[test]
    fn storage_policy() {
        assert_eq!(storage_for(&part("text", "plain")), Storage::TextOnly);
        assert_eq!(storage_for(&part("text", "html")), Storage::TextAndData);
        assert_eq!(storage_for(&part("multipart", "mixed")), Storage::Neither);
        assert_eq!(storage_for(&part("multipart", "signed")), Storage::DataOnly);
        assert_eq!(storage_for(&part("message", "rfc822")), Storage::Neither);
        assert_eq!(storage_for(&part("image", "jpeg")), Storage::DataOnly);
        assert_eq!(storage_for(&Bodypart::default()), Storage::TextOnly);
    }

    #[test]
    fn identical_payloads_share_a_hash() {
        let mut a = part("image", "jpeg");
        a.data = vec![1, 2, 3];
        let mut b = part("image", "jpeg");
        b.data = vec![1, 2, 3];
        let pa = payload_for(&a).unwrap();
        let pb = payload_for(&b).unwrap();
        assert_eq!(pa.hash, pb.hash);
        assert_eq!(pa.hash.len(), 32);
    }

    #[test]
    fn html_payload_keeps_source_and_strips_text() {
        let mut p = part("text", "html");
        p.text = Some("<p>Hello &amp; <b>world</b></p>".to_string());
        let payload = payload_for(&p).unwrap();
        assert_eq!(payload.text.as_deref(), Some("Hello & world"));
        assert_eq!(
            payload.data.as_deref(),
            Some("<p>Hello &amp; <b>world</b></p>".as_bytes())
        );
    }

    #[test]
    fn html_to_text_handles_entities_and_whitespace() {
        assert_eq!(html_to_text("a&nbsp;&lt;b&gt;"), "a <b>");
        assert_eq!(html_to_text("<div>\n  one\n  two\n</div>"), "one two");
        assert_eq!(html_to_text("x &unknown; y"), "x y");
    }
}
