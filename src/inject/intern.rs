//! Intern-or-create resolution for the shared name tables.
//!
//! Concurrent injectors race to create the same rows; a unique-constraint
//! violation here is the normal case, not an exception. Each insert round
//! runs under a savepoint so a losing race rolls back just the insert and
//! re-selects, leaving the enclosing transaction intact. Inserts stream
//! through binary COPY.
//!
//! The loop terminates because every successful insert, and every row
//! learned from a re-select, monotonically shrinks the pending set.

use crate::cache::NameCache;
use crate::db::copy::CopyWriter;
use crate::error::is_unique_race;
use crate::model::Address;
use sqlx::{Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};

/// Addresses are resolved in rounds of at most this many keys, to keep the
/// select disjunction bounded.
const ADDRESS_BATCH: usize = 1024;

/// Per-injection savepoint name source. A transaction can only have one
/// live savepoint per name, so every use takes a fresh one.
#[derive(Debug, Default)]
pub(crate) struct Savepoints {
    next: u32,
}

impl Savepoints {
    pub(crate) fn next(&mut self) -> String {
        let name = format!("sp_{}", self.next);
        self.next += 1;
        name
    }
}

/// Stream one binary COPY statement's tuples into the transaction.
pub(crate) async fn stream_copy(
    tx: &mut Transaction<'_, Postgres>,
    statement: &str,
    writer: CopyWriter,
) -> Result<u64, sqlx::Error> {
    let mut copy = (&mut **tx).copy_in_raw(statement).await?;
    if let Err(err) = copy.send(writer.finish()).await {
        // End the COPY sub-protocol so the connection is usable again; the
        // interesting error is the one from send.
        let _ = copy.abort("aborted after send failure").await;
        return Err(err);
    }
    copy.finish().await
}

/// A name table the generic resolver can operate on.
pub(crate) struct NameTable {
    pub table: &'static str,
    /// Unique-constraint token that identifies a benign insertion race.
    pub constraint: &'static str,
    /// Whether matching and caching are case-insensitive.
    pub lowercase: bool,
}

pub(crate) const FLAG_NAMES: NameTable = NameTable {
    table: "flag_names",
    constraint: "fn_uname",
    lowercase: true,
};

pub(crate) const ANNOTATION_NAMES: NameTable = NameTable {
    table: "annotation_names",
    constraint: "annotation_names_name_key",
    lowercase: false,
};

pub(crate) const FIELD_NAMES: NameTable = NameTable {
    table: "field_names",
    constraint: "field_names_name_key",
    lowercase: false,
};

impl NameTable {
    fn normalize(&self, name: &str) -> String {
        if self.lowercase {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }
}

/// Resolve every name in `names` to a row id, creating missing rows, and
/// record the ids in `cache`. After this returns Ok, `cache.translate`
/// succeeds for the normalized form of every input name.
pub(crate) async fn resolve_names(
    tx: &mut Transaction<'_, Postgres>,
    savepoints: &mut Savepoints,
    table: &NameTable,
    names: &[String],
    cache: &NameCache,
) -> Result<(), sqlx::Error> {
    let mut pending: BTreeSet<String> = names
        .iter()
        .map(|n| table.normalize(n))
        .filter(|n| cache.translate(n).is_none())
        .collect();

    while !pending.is_empty() {
        // Select pass: one round trip for every pending key.
        let mut sql = format!("SELECT id, name FROM {} WHERE ", table.table);
        for i in 0..pending.len() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            if table.lowercase {
                sql.push_str(&format!("lower(name)=${}", i + 1));
            } else {
                sql.push_str(&format!("name=${}", i + 1));
            }
        }

        let mut query = sqlx::query_as::<_, (i32, String)>(&sql);
        for name in &pending {
            query = query.bind(name.clone());
        }
        let rows = query.fetch_all(&mut **tx).await?;

        for (id, name) in rows {
            let key = table.normalize(&name);
            cache.insert(key.clone(), id);
            pending.remove(&key);
        }

        if pending.is_empty() {
            break;
        }

        // Insert pass under a savepoint; a constraint race rolls back the
        // insert and the next select pass picks up the winner's rows.
        let savepoint = savepoints.next();
        sqlx::query(&format!("SAVEPOINT {}", savepoint))
            .execute(&mut **tx)
            .await?;

        let mut writer = CopyWriter::new(1);
        for name in &pending {
            writer.begin_row();
            writer.text(name);
            writer.end_row();
        }

        let statement = format!("COPY {} (name) FROM STDIN WITH BINARY", table.table);
        match stream_copy(tx, &statement, writer).await {
            Ok(_) => {}
            Err(err) if is_unique_race(&err, table.constraint) => {
                log::debug!(
                    "insert race on {}, retrying after rollback to {}",
                    table.table,
                    savepoint
                );
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", savepoint))
                    .execute(&mut **tx)
                    .await?;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Resolve a batch of addresses to `addresses` row ids.
///
/// Returns a map from the composite address key to the id. Address ids are
/// transaction-scoped state, so unlike the name tables there is no
/// process-wide cache to update.
pub(crate) async fn resolve_addresses(
    tx: &mut Transaction<'_, Postgres>,
    savepoints: &mut Savepoints,
    addresses: &[Address],
) -> Result<HashMap<String, i32>, sqlx::Error> {
    let mut unided: HashMap<String, Address> = HashMap::new();
    for address in addresses {
        unided.entry(address.key()).or_insert_with(|| address.clone());
    }

    let mut ids: HashMap<String, i32> = HashMap::new();

    loop {
        let mut round: Vec<&Address> = unided
            .iter()
            .filter(|(key, _)| !ids.contains_key(*key))
            .map(|(_, a)| a)
            .collect();
        if round.is_empty() {
            break;
        }
        round.truncate(ADDRESS_BATCH);

        // Select pass over the composite natural key.
        let mut sql = String::from("SELECT id, name, localpart, domain FROM addresses WHERE ");
        for i in 0..round.len() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            let n = 3 * i + 1;
            sql.push_str(&format!(
                "(name=${} AND localpart=${} AND lower(domain)=${})",
                n,
                n + 1,
                n + 2
            ));
        }

        let mut query = sqlx::query_as::<_, (i32, String, String, String)>(&sql);
        for address in &round {
            query = query
                .bind(address.name.clone())
                .bind(address.localpart.clone())
                .bind(address.domain.to_lowercase());
        }
        let rows = query.fetch_all(&mut **tx).await?;

        for (id, name, localpart, domain) in rows {
            ids.insert(Address::new(&name, &localpart, &domain).key(), id);
        }

        let missing: Vec<&&Address> = round
            .iter()
            .filter(|a| !ids.contains_key(&a.key()))
            .collect();
        if missing.is_empty() {
            continue;
        }

        let savepoint = savepoints.next();
        sqlx::query(&format!("SAVEPOINT {}", savepoint))
            .execute(&mut **tx)
            .await?;

        let mut writer = CopyWriter::new(3);
        for address in &missing {
            writer.begin_row();
            writer.text(&address.name);
            writer.text(&address.localpart);
            writer.text(&address.domain);
            writer.end_row();
        }

        match stream_copy(
            tx,
            "COPY addresses (name, localpart, domain) FROM STDIN WITH BINARY",
            writer,
        )
        .await
        {
            Ok(_) => {}
            Err(err) if is_unique_race(&err, "addresses_nld_key") => {
                log::debug!("address insert race, retrying after rollback to {}", savepoint);
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", savepoint))
                    .execute(&mut **tx)
                    .await?;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_names_increment() {
        let mut sp = Savepoints::default();
        assert_eq!(sp.next(), "sp_0");
        assert_eq!(sp.next(), "sp_1");
    }

    #[test]
    fn flag_names_normalize_case() {
        assert_eq!(FLAG_NAMES.normalize("\\Seen"), "\\seen");
        assert_eq!(FIELD_NAMES.normalize("X-Loop"), "X-Loop");
    }
}
