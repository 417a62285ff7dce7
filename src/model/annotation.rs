//! IMAP message annotations (RFC 5257 entries).

/// One annotation to attach to the injected message in every target
/// mailbox. `owner` is `None` for shared annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub entry_name: String,
    pub value: String,
    pub owner: Option<i32>,
}

impl Annotation {
    pub fn new(entry_name: &str, value: &str, owner: Option<i32>) -> Self {
        Self {
            entry_name: entry_name.to_string(),
            value: value.to_string(),
            owner,
        }
    }
}
