//! Process-wide name caches.
//!
//! Flag names, annotation entry names, and header field names are interned
//! into small id tables. The in-process caches are additive and never
//! invalidated: ids are stable for the lifetime of the database, so a cached
//! entry can only be missing, never wrong. Address ids are deliberately not
//! cached here; they are transient per injection.

use dashmap::DashMap;
use sqlx::PgPool;

/// An additive name→id cache backed by one of the intern tables.
///
/// Keys are stored as the resolvers normalize them (flag names lowercased,
/// field and annotation names verbatim).
pub struct NameCache {
    table: &'static str,
    map: DashMap<String, i32>,
}

impl NameCache {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            map: DashMap::new(),
        }
    }

    pub fn translate(&self, key: &str) -> Option<i32> {
        self.map.get(key).map(|entry| *entry.value())
    }

    pub fn insert(&self, key: String, id: i32) {
        self.map.insert(key, id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Warm the cache with every row currently in the table. Run once at
    /// startup; the resolvers keep it current afterwards.
    pub async fn preload(&self, pool: &PgPool, lowercase: bool) -> Result<usize, sqlx::Error> {
        let sql = format!("SELECT id, name FROM {}", self.table);
        let rows: Vec<(i32, String)> = sqlx::query_as(&sql).fetch_all(pool).await?;
        let count = rows.len();
        for (id, name) in rows {
            let key = if lowercase { name.to_lowercase() } else { name };
            self.map.insert(key, id);
        }
        log::debug!("preloaded {} names from {}", count, self.table);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_after_insert() {
        let cache = NameCache::new("flag_names");
        assert_eq!(cache.translate("\\seen"), None);
        cache.insert("\\seen".to_string(), 3);
        assert_eq!(cache.translate("\\seen"), Some(3));
        assert_eq!(cache.len(), 1);
    }
}
