//! Schema creation.

use rusqlite::Connection;

use pcemirror_common::{EntityKind, Result};

use crate::db;

/// Typed columns each entity table carries in addition to the common ones.
pub(crate) fn extra_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Workload => &["hostname", "public_ip", "online", "enforcement_mode"],
        EntityKind::Label => &["label_key", "label_value"],
        EntityKind::IpList => &["description"],
        EntityKind::Service => &["description"],
        EntityKind::LabelGroup => &["label_key", "description"],
    }
}

pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db)?;

    for kind in EntityKind::ALL {
        let extra: String = extra_columns(kind)
            .iter()
            .map(|column| format!("{column},\n"))
            .collect();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                name TEXT,
                {extra}
                payload TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                stale INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_name ON {table}(name);
            "#,
            table = kind.as_str(),
        ))
        .map_err(db)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS traffic_queries (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            max_results INTEGER NOT NULL,
            filter TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS async_operations (
            id TEXT PRIMARY KEY,
            query_id TEXT NOT NULL REFERENCES traffic_queries(id),
            job_handle TEXT NOT NULL,
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            last_polled_at TEXT,
            poll_attempts INTEGER NOT NULL DEFAULT 0,
            error_detail TEXT,
            finished_at TEXT,
            results_fetched_at TEXT
        );

        CREATE TABLE IF NOT EXISTS traffic_flows (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id TEXT NOT NULL REFERENCES async_operations(id),
            seq INTEGER NOT NULL,
            src_ip TEXT,
            src_workload_id TEXT,
            dst_ip TEXT,
            dst_workload_id TEXT,
            service_name TEXT,
            port INTEGER,
            proto INTEGER,
            policy_decision TEXT NOT NULL,
            flow_direction TEXT,
            num_connections INTEGER NOT NULL,
            bytes_in INTEGER,
            bytes_out INTEGER,
            first_detected TEXT,
            last_detected TEXT,
            rule_href TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_operations_status ON async_operations(status);
        CREATE INDEX IF NOT EXISTS idx_flows_operation ON traffic_flows(operation_id, seq);
        "#,
    )
    .map_err(db)?;

    Ok(())
}
