//! Reference entity persistence: upsert, lookup and stale pruning.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;
use tracing::debug;

use pcemirror_common::{EntityKind, Resource, Result};

use crate::schema::extra_columns;
use crate::{db, decode_time, encode_time, Store};

/// Effect of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Identifier was absent.
    Inserted,
    /// Identifier existed and the content changed.
    Updated,
    /// Identifier existed with identical content; only `last_seen` moved.
    Unchanged,
}

/// Aggregated effect of an upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl BatchOutcome {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Number of records written.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// A stored entity with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub resource: Resource,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Store {
    /// Insert or overwrite one entity.
    ///
    /// `first_seen` survives updates; `last_seen` always moves to now.
    pub fn upsert(&self, resource: &Resource) -> Result<UpsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let outcome = upsert_in(&tx, resource, &Utc::now())?;
        tx.commit().map_err(db)?;
        Ok(outcome)
    }

    /// Upsert a page of entities in one transaction, in order.
    pub fn upsert_batch(&self, resources: &[Resource]) -> Result<BatchOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let now = Utc::now();

        let mut outcome = BatchOutcome::default();
        for resource in resources {
            outcome.record(upsert_in(&tx, resource, &now)?);
        }

        tx.commit().map_err(db)?;
        debug!(
            "Upserted batch of {}: {} new, {} changed, {} unchanged",
            resources.len(),
            outcome.inserted,
            outcome.updated,
            outcome.unchanged
        );
        Ok(outcome)
    }

    /// Look up one entity by identifier.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT payload, first_seen, last_seen FROM {} WHERE id = ?1",
                kind.as_str()
            ))
            .map_err(db)?;

        let row = stmt.query_row([id], |row| {
            let payload: String = row.get(0)?;
            let first_seen: String = row.get(1)?;
            let last_seen: String = row.get(2)?;
            Ok((payload, decode_time(&first_seen)?, decode_time(&last_seen)?))
        });

        match row {
            Ok((payload, first_seen, last_seen)) => Ok(Some(StoredEntity {
                resource: serde_json::from_str(&payload)?,
                first_seen,
                last_seen,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db(e)),
        }
    }

    /// All stored entities of one type, ordered by identifier.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<Resource>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT payload FROM {} ORDER BY id", kind.as_str()))
            .map_err(db)?;

        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;

        payloads
            .iter()
            .map(|payload| Ok(serde_json::from_str(payload)?))
            .collect()
    }

    /// Number of stored entities of one type.
    pub fn count(&self, kind: EntityKind) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", kind.as_str()), [], |row| {
                row.get(0)
            })
            .map_err(db)?;
        Ok(count as u64)
    }

    /// Delete every entity of `kind` whose identifier is not in `seen_ids`.
    ///
    /// Rows are first all marked stale, the observed ones unmarked, and the
    /// remainder deleted; all of it in one transaction. Returns the number of
    /// rows deleted.
    pub fn prune_stale(&self, kind: EntityKind, seen_ids: &HashSet<String>) -> Result<usize> {
        let table = kind.as_str();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        tx.execute(&format!("UPDATE {table} SET stale = 1"), [])
            .map_err(db)?;
        {
            let mut unmark = tx
                .prepare(&format!("UPDATE {table} SET stale = 0 WHERE id = ?1"))
                .map_err(db)?;
            for id in seen_ids {
                unmark.execute(params![id]).map_err(db)?;
            }
        }
        let deleted = tx
            .execute(&format!("DELETE FROM {table} WHERE stale = 1"), [])
            .map_err(db)?;

        tx.commit().map_err(db)?;
        debug!("Pruned {} stale {}", deleted, table);
        Ok(deleted)
    }
}

fn upsert_in(conn: &Connection, resource: &Resource, now: &DateTime<Utc>) -> Result<UpsertOutcome> {
    let kind = resource.kind();
    let table = kind.as_str();
    let payload = serde_json::to_string(resource)?;

    let existing = conn.query_row(
        &format!("SELECT payload FROM {table} WHERE id = ?1"),
        [resource.id()],
        |row| row.get::<_, String>(0),
    );
    let outcome = match existing {
        Ok(previous) if previous == payload => UpsertOutcome::Unchanged,
        Ok(_) => UpsertOutcome::Updated,
        Err(rusqlite::Error::QueryReturnedNoRows) => UpsertOutcome::Inserted,
        Err(e) => return Err(db(e)),
    };

    let columns = extra_columns(kind);
    let mut values = vec![
        Value::Text(resource.id().to_string()),
        opt_text(resource.display_name()),
    ];
    values.extend(extra_values(resource));
    values.push(Value::Text(payload));
    values.push(Value::Text(encode_time(now)));

    let time_param = values.len();
    let column_list: String = columns.iter().map(|c| format!("{c}, ")).collect();
    let placeholders: String = (3..3 + columns.len()).map(|i| format!("?{i}, ")).collect();
    let updates: String = columns
        .iter()
        .map(|c| format!("{c} = excluded.{c}, "))
        .collect();

    let sql = format!(
        r#"
        INSERT INTO {table} (id, name, {column_list}payload, first_seen, last_seen, stale)
        VALUES (?1, ?2, {placeholders}?{payload_param}, ?{time_param}, ?{time_param}, 0)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            {updates}payload = excluded.payload,
            last_seen = excluded.last_seen,
            stale = 0
        "#,
        payload_param = time_param - 1,
    );
    conn.execute(&sql, params_from_iter(values)).map_err(db)?;

    Ok(outcome)
}

/// Values for [`extra_columns`], in the same order.
fn extra_values(resource: &Resource) -> Vec<Value> {
    match resource {
        Resource::Workload(w) => vec![
            opt_text(w.hostname.as_deref()),
            opt_text(w.public_ip.as_deref()),
            Value::Integer(w.online as i64),
            opt_text(w.enforcement_mode.as_deref()),
        ],
        Resource::Label(l) => vec![Value::Text(l.key.clone()), Value::Text(l.value.clone())],
        Resource::IpList(i) => vec![opt_text(i.description.as_deref())],
        Resource::Service(s) => vec![opt_text(s.description.as_deref())],
        Resource::LabelGroup(g) => vec![
            opt_text(g.key.as_deref()),
            opt_text(g.description.as_deref()),
        ],
    }
}

fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}
