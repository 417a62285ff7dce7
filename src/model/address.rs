//! Email addresses as stored in the `addresses` intern table.

/// A mail address split into its stored components.
///
/// The intern key is the composite `(name, localpart, lower(domain))`;
/// two addresses that differ only in domain case share one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Display name (may be empty).
    pub name: String,
    pub localpart: String,
    pub domain: String,
}

impl Address {
    pub fn new(name: &str, localpart: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            localpart: localpart.to_string(),
            domain: domain.to_string(),
        }
    }

    /// Parse `localpart@domain`, with an optional `Name <addr>` form.
    /// Returns `None` when there is no `@`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let (name, bare) = match (trimmed.rfind('<'), trimmed.rfind('>')) {
            (Some(start), Some(end)) if end > start => {
                let name = trimmed[..start].trim().trim_matches('"').trim();
                (name, trimmed[start + 1..end].trim())
            }
            _ => ("", trimmed),
        };
        let at = bare.rfind('@')?;
        if at == 0 || at + 1 == bare.len() {
            return None;
        }
        Some(Self::new(name, &bare[..at], &bare[at + 1..]))
    }

    /// Composite intern key: display name, localpart, and lowercased domain,
    /// NUL-separated so the components cannot collide.
    pub fn key(&self) -> String {
        let mut key = String::with_capacity(
            self.name.len() + self.localpart.len() + self.domain.len() + 2,
        );
        key.push_str(&self.name);
        key.push('\0');
        key.push_str(&self.localpart);
        key.push('\0');
        key.push_str(&self.domain.to_lowercase());
        key
    }

    /// The bare `localpart@lower(domain)` key, used when folding delivery
    /// recipients and the envelope sender into the header addresses.
    pub fn naked(&self) -> String {
        format!("{}@{}", self.localpart, self.domain.to_lowercase())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}@{}", self.localpart, self.domain)
        } else {
            write!(f, "{} <{}@{}>", self.name, self.localpart, self.domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare() {
        let a = Address::parse("a@x.example").unwrap();
        assert_eq!(a.name, "");
        assert_eq!(a.localpart, "a");
        assert_eq!(a.domain, "x.example");
    }

    #[test]
    fn parse_named() {
        let a = Address::parse("Ann Example <ann@X.example>").unwrap();
        assert_eq!(a.name, "Ann Example");
        assert_eq!(a.localpart, "ann");
        assert_eq!(a.domain, "X.example");
    }

    #[test]
    fn parse_rejects_addressless() {
        assert!(Address::parse("not an address").is_none());
        assert!(Address::parse("@x").is_none());
        assert!(Address::parse("a@").is_none());
    }

    #[test]
    fn key_lowercases_domain_only() {
        let a = Address::new("Ann", "Ann", "EXAMPLE.org");
        let b = Address::new("Ann", "Ann", "example.ORG");
        assert_eq!(a.key(), b.key());
        assert!(a.key().contains("Ann\0Ann\0example.org"));
    }

    #[test]
    fn naked_drops_display_name() {
        let a = Address::new("Ann", "ann", "Example.org");
        assert_eq!(a.naked(), "ann@example.org");
    }
}
