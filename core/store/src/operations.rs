//! Traffic queries, async operations and their result flows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::{debug, info};

use pcemirror_common::{
    AsyncOperation, Error, JobHandle, OperationId, OperationStatus, PolicyDecision, Result,
    TrafficFlow, TrafficQuery,
};

use crate::{conversion_error, db, decode_date, decode_opt_time, decode_time, encode_time, Store};

/// Result of [`Store::bulk_insert_flows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowInsert {
    /// Rows were written by this call.
    Inserted(usize),
    /// Results had been materialized before; nothing was written. Carries the
    /// number of rows already stored.
    AlreadyMaterialized(usize),
}

impl FlowInsert {
    /// Number of rows stored for the operation after the call.
    pub fn rows(&self) -> usize {
        match self {
            Self::Inserted(n) | Self::AlreadyMaterialized(n) => *n,
        }
    }
}

const OPERATION_COLUMNS: &str = "id, query_id, job_handle, status, submitted_at, last_polled_at, \
     poll_attempts, error_detail, finished_at, results_fetched_at";

const FLOW_COLUMNS: &str = "src_ip, src_workload_id, dst_ip, dst_workload_id, service_name, \
     port, proto, policy_decision, flow_direction, num_connections, bytes_in, bytes_out, \
     first_detected, last_detected, rule_href";

impl Store {
    /// Persist a submitted query together with its `pending` operation.
    pub fn create_operation(&self, query: &TrafficQuery, operation: &AsyncOperation) -> Result<()> {
        let filter = query
            .filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        tx.execute(
            r#"
            INSERT INTO traffic_queries
            (id, name, start_date, end_date, max_results, filter, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                query.id,
                query.name,
                query.start_date.to_string(),
                query.end_date.to_string(),
                query.max_results,
                filter,
                encode_time(&query.created_at),
            ],
        )
        .map_err(db)?;

        tx.execute(
            r#"
            INSERT INTO async_operations
            (id, query_id, job_handle, status, submitted_at, last_polled_at,
             poll_attempts, error_detail, finished_at, results_fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                operation.id.as_str(),
                operation.query_id,
                operation.job_handle.as_str(),
                operation.status.as_str(),
                encode_time(&operation.submitted_at),
                operation.last_polled_at.as_ref().map(encode_time),
                operation.poll_attempts,
                operation.error_detail,
                operation.finished_at.as_ref().map(encode_time),
                operation.results_fetched_at.as_ref().map(encode_time),
            ],
        )
        .map_err(db)?;

        tx.commit().map_err(db)?;
        info!("Recorded operation {} for query '{}'", operation.id, query.name);
        Ok(())
    }

    /// Load a stored query.
    pub fn get_query(&self, query_id: &str) -> Result<TrafficQuery> {
        let conn = self.lock()?;
        let row = conn.query_row(
            r#"
            SELECT id, name, start_date, end_date, max_results, filter, created_at
            FROM traffic_queries WHERE id = ?1
            "#,
            [query_id],
            |row| {
                let start: String = row.get(2)?;
                let end: String = row.get(3)?;
                let created: String = row.get(6)?;
                Ok((
                    TrafficQuery {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        start_date: decode_date(&start)?,
                        end_date: decode_date(&end)?,
                        max_results: row.get(4)?,
                        filter: None,
                        created_at: decode_time(&created)?,
                    },
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        );

        match row {
            Ok((mut query, filter)) => {
                query.filter = filter.as_deref().map(serde_json::from_str).transpose()?;
                Ok(query)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::NotFound(format!("Query {query_id}")))
            }
            Err(e) => Err(db(e)),
        }
    }

    /// Load one operation.
    pub fn get_operation(&self, id: &OperationId) -> Result<AsyncOperation> {
        let conn = self.lock()?;
        load_operation(&conn, id)
    }

    /// All operations, newest first, optionally restricted to one status.
    pub fn list_operations(&self, status: Option<OperationStatus>) -> Result<Vec<AsyncOperation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM async_operations
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY submitted_at DESC, id"
            ))
            .map_err(db)?;

        let operations = stmt
            .query_map([status.map(|s| s.as_str())], map_operation)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(operations)
    }

    /// Move an operation to `status`.
    ///
    /// The transition is checked against the current stored status inside
    /// the same transaction. Entering a terminal state stamps `finished_at`.
    ///
    /// # Errors
    /// - `InvalidTransition` if `status` is not reachable from the current one
    /// - `NotFound` if the operation does not exist
    pub fn update_operation_status(
        &self,
        id: &OperationId,
        status: OperationStatus,
        detail: Option<&str>,
    ) -> Result<AsyncOperation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let current = load_operation(&tx, id)?;
        current.status.check_transition(status)?;

        let finished_at = status.is_terminal().then(|| encode_time(&Utc::now()));
        tx.execute(
            r#"
            UPDATE async_operations
            SET status = ?2,
                error_detail = COALESCE(?3, error_detail),
                finished_at = COALESCE(?4, finished_at)
            WHERE id = ?1
            "#,
            params![id.as_str(), status.as_str(), detail, finished_at],
        )
        .map_err(db)?;

        let updated = load_operation(&tx, id)?;
        tx.commit().map_err(db)?;

        debug!("Operation {}: {} -> {}", id, current.status, status);
        Ok(updated)
    }

    /// Count one status check against a non-terminal operation.
    ///
    /// Terminal operations are returned untouched.
    pub fn record_poll(&self, id: &OperationId) -> Result<AsyncOperation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let current = load_operation(&tx, id)?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        tx.execute(
            r#"
            UPDATE async_operations
            SET poll_attempts = poll_attempts + 1, last_polled_at = ?2
            WHERE id = ?1
            "#,
            params![id.as_str(), encode_time(&Utc::now())],
        )
        .map_err(db)?;

        let updated = load_operation(&tx, id)?;
        tx.commit().map_err(db)?;
        Ok(updated)
    }

    /// Materialize the result set of a completed operation.
    ///
    /// All rows are written in one transaction together with the
    /// materialization marker. A second call for the same operation writes
    /// nothing and reports the rows already stored.
    ///
    /// # Errors
    /// - `InvalidTransition` if the operation is not `completed`
    pub fn bulk_insert_flows(&self, id: &OperationId, flows: &[TrafficFlow]) -> Result<FlowInsert> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let operation = load_operation(&tx, id)?;
        if operation.status != OperationStatus::Completed {
            return Err(Error::InvalidTransition {
                from: operation.status,
                to: OperationStatus::Completed,
            });
        }
        if operation.results_fetched_at.is_some() {
            let stored = count_flows(&tx, id)?;
            return Ok(FlowInsert::AlreadyMaterialized(stored as usize));
        }

        {
            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO traffic_flows (operation_id, seq, {FLOW_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ))
                .map_err(db)?;

            for (seq, flow) in flows.iter().enumerate() {
                let num_connections = to_sql_int(flow.num_connections, "num_connections")?;
                let bytes_in = flow
                    .bytes_in
                    .map(|b| to_sql_int(b, "bytes_in"))
                    .transpose()?;
                let bytes_out = flow
                    .bytes_out
                    .map(|b| to_sql_int(b, "bytes_out"))
                    .transpose()?;
                insert
                    .execute(params![
                        id.as_str(),
                        seq as i64,
                        flow.src_ip,
                        flow.src_workload_id,
                        flow.dst_ip,
                        flow.dst_workload_id,
                        flow.service_name,
                        flow.port,
                        flow.proto,
                        flow.policy_decision.as_str(),
                        flow.flow_direction,
                        num_connections,
                        bytes_in,
                        bytes_out,
                        flow.first_detected.as_ref().map(encode_time),
                        flow.last_detected.as_ref().map(encode_time),
                        flow.rule_href,
                    ])
                    .map_err(db)?;
            }
        }

        tx.execute(
            "UPDATE async_operations SET results_fetched_at = ?2 WHERE id = ?1",
            params![id.as_str(), encode_time(&Utc::now())],
        )
        .map_err(db)?;

        tx.commit().map_err(db)?;
        info!("Stored {} flows for operation {}", flows.len(), id);
        Ok(FlowInsert::Inserted(flows.len()))
    }

    /// Stored flows of an operation, in result order.
    pub fn list_flows(&self, id: &OperationId) -> Result<Vec<TrafficFlow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {FLOW_COLUMNS} FROM traffic_flows WHERE operation_id = ?1 ORDER BY seq"
            ))
            .map_err(db)?;

        let flows = stmt
            .query_map([id.as_str()], map_flow)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(flows)
    }

    /// Number of stored flows of an operation.
    pub fn flow_count(&self, id: &OperationId) -> Result<u64> {
        let conn = self.lock()?;
        count_flows(&conn, id)
    }

    /// Delete terminal operations that finished before `older_than`, along
    /// with their queries and flows. Returns the number of operations removed.
    pub fn purge_operations(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let expired: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare(
                    r#"
                    SELECT id, query_id FROM async_operations
                    WHERE status NOT IN ('pending', 'running')
                      AND finished_at IS NOT NULL
                      AND finished_at < ?1
                    "#,
                )
                .map_err(db)?;
            let rows = stmt
                .query_map([encode_time(&older_than)], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            rows
        };

        for (operation_id, query_id) in &expired {
            tx.execute(
                "DELETE FROM traffic_flows WHERE operation_id = ?1",
                params![operation_id],
            )
            .map_err(db)?;
            tx.execute(
                "DELETE FROM async_operations WHERE id = ?1",
                params![operation_id],
            )
            .map_err(db)?;
            tx.execute("DELETE FROM traffic_queries WHERE id = ?1", params![query_id])
                .map_err(db)?;
        }

        tx.commit().map_err(db)?;
        info!("Purged {} operations finished before {}", expired.len(), older_than);
        Ok(expired.len())
    }
}

fn load_operation(conn: &Connection, id: &OperationId) -> Result<AsyncOperation> {
    let row = conn.query_row(
        &format!("SELECT {OPERATION_COLUMNS} FROM async_operations WHERE id = ?1"),
        [id.as_str()],
        map_operation,
    );

    match row {
        Ok(operation) => Ok(operation),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::NotFound(format!("Operation {id}"))),
        Err(e) => Err(db(e)),
    }
}

fn count_flows(conn: &Connection, id: &OperationId) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM traffic_flows WHERE operation_id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .map_err(db)?;
    Ok(count as u64)
}

/// SQLite integers are signed; counters above `i64::MAX` cannot be stored.
fn to_sql_int(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::Persistence(format!("{column} value {value} exceeds the storable range")))
}

fn from_sql_int(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|e| conversion_error(&value.to_string(), e))
}

fn map_operation(row: &Row<'_>) -> rusqlite::Result<AsyncOperation> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let submitted_at: String = row.get(4)?;

    Ok(AsyncOperation {
        id: OperationId::new(id.clone()).map_err(|e| conversion_error(&id, e))?,
        query_id: row.get(1)?,
        job_handle: JobHandle::new(row.get::<_, String>(2)?),
        status: status
            .parse::<OperationStatus>()
            .map_err(|e| conversion_error(&status, e))?,
        submitted_at: decode_time(&submitted_at)?,
        last_polled_at: decode_opt_time(row.get(5)?)?,
        poll_attempts: row.get(6)?,
        error_detail: row.get(7)?,
        finished_at: decode_opt_time(row.get(8)?)?,
        results_fetched_at: decode_opt_time(row.get(9)?)?,
    })
}

fn map_flow(row: &Row<'_>) -> rusqlite::Result<TrafficFlow> {
    let decision: String = row.get(7)?;

    Ok(TrafficFlow {
        src_ip: row.get(0)?,
        src_workload_id: row.get(1)?,
        dst_ip: row.get(2)?,
        dst_workload_id: row.get(3)?,
        service_name: row.get(4)?,
        port: row.get(5)?,
        proto: row.get(6)?,
        policy_decision: decision.parse().unwrap_or(PolicyDecision::Unknown),
        flow_direction: row.get(8)?,
        num_connections: from_sql_int(row.get(9)?)?,
        bytes_in: row.get::<_, Option<i64>>(10)?.map(from_sql_int).transpose()?,
        bytes_out: row.get::<_, Option<i64>>(11)?.map(from_sql_int).transpose()?,
        first_detected: decode_opt_time(row.get(12)?)?,
        last_detected: decode_opt_time(row.get(13)?)?,
        rule_href: row.get(14)?,
    })
}
