//! The `pending_operations` queue.
//!
//! Rows are ordered by an autoincrement sequence, so reading them back in
//! `seq` order gives enqueue (FIFO) order.  The operation id is unique:
//! enqueueing an id that is already present does nothing.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use courier_shared::{Payload, PendingOperation};

use crate::database::{datetime_from_millis, parse_column, Database};
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str = "SELECT id, op_type, payload, enqueued_at, attempts FROM pending_operations";

impl Database {
    /// Append an operation.  Returns `false` when the id is already queued.
    pub fn enqueue_operation(&self, op: &PendingOperation) -> Result<bool> {
        let payload = serde_json::to_string(&op.payload)?;
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO pending_operations (id, op_type, payload, enqueued_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                op.id,
                op.op_type.as_str(),
                payload,
                op.enqueued_at.timestamp_millis(),
                op.attempts,
            ],
        )?;
        Ok(affected > 0)
    }

    /// All queued operations in enqueue order.
    pub fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))?;
        let rows = stmt.query_map([], row_to_operation)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// The oldest queued operation.
    pub fn head_operation(&self) -> Result<Option<PendingOperation>> {
        let op = self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY seq ASC LIMIT 1"),
                [],
                row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    pub fn remove_operation(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM pending_operations WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Count a failed replay attempt and return the new attempt total.
    pub fn record_failed_attempt(&self, id: &str, error: &str) -> Result<u32> {
        self.conn()
            .query_row(
                "UPDATE pending_operations SET attempts = attempts + 1, last_error = ?2
                 WHERE id = ?1
                 RETURNING attempts",
                params![id, error],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn pending_operation_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM pending_operations", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Point every queued operation addressed to chat `from` at chat `to`.
/// Operation ids are left alone.  Returns the number of rows rewritten.
pub(crate) fn retarget_operations(conn: &Connection, from: &str, to: &str) -> Result<usize> {
    let rows: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT id, payload FROM pending_operations ORDER BY seq ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut rewritten = 0;
    for (id, payload_json) in rows {
        let mut payload: Payload = serde_json::from_str(&payload_json)?;
        if payload.get("chatId").and_then(Value::as_str) != Some(from) {
            continue;
        }
        payload.insert("chatId".to_string(), Value::from(to));
        conn.execute(
            "UPDATE pending_operations SET payload = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(&payload)?],
        )?;
        rewritten += 1;
    }
    Ok(rewritten)
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
    let op_type: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let payload: Payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PendingOperation {
        id: row.get(0)?,
        op_type: parse_column(1, &op_type)?,
        payload,
        enqueued_at: datetime_from_millis(3, row.get(3)?)?,
        attempts: row.get(4)?,
    })
}
