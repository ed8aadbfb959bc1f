// SQLite QueueRepository Implementation

use async_trait::async_trait;
use pipeq_core::domain::{MsgId, PipeDescriptor, PipeId, PipeStatus, QueueDescriptor, QueueMessage};
use pipeq_core::error::{AppError, Result};
use pipeq_core::port::QueueRepository;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

const STATE_WAITING: &str = "WAITING";
const STATE_DELIVERED: &str = "DELIVERED";

// Helper to convert sqlx::Error to AppError with structured information
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => AppError::Storage(format!(
                        "Unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "5" => AppError::Storage(format!(
                        "Database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => AppError::Storage(format!("Database full: {}", db_err.message())),
                    _ => AppError::Storage(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                AppError::Storage(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => AppError::Storage("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Storage(format!("Column not found: {}", col))
        }
        // Connection, pool, protocol errors
        _ => AppError::Storage(err.to_string()),
    }
}

/// Count one more push into `pipe`, only while it is still PUSH_ACTIVE
async fn bump_push_count(conn: &mut SqliteConnection, pipe: &PipeDescriptor) -> Result<()> {
    let bumped = sqlx::query(
        r#"
        UPDATE pipe_descriptors SET push_count = push_count + 1
        WHERE queue_name = ? AND pipe_id = ? AND status = ?
        "#,
    )
    .bind(&pipe.queue_name)
    .bind(&pipe.pipe_id)
    .bind(PipeStatus::PushActive.as_str())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    if bumped.rows_affected() == 1 {
        return Ok(());
    }

    let status: Option<String> = sqlx::query_scalar(
        "SELECT status FROM pipe_descriptors WHERE queue_name = ? AND pipe_id = ?",
    )
    .bind(&pipe.queue_name)
    .bind(&pipe.pipe_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    match status {
        Some(status) => Err(AppError::InvalidState(format!(
            "pipe {} is {}, not accepting pushes",
            pipe.pipe_id, status
        ))),
        None => Err(AppError::NotFound(format!("pipe {}", pipe.pipe_id))),
    }
}

pub struct SqliteQueueRepository {
    pool: SqlitePool,
}

impl SqliteQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn oldest_message(
        &self,
        pipe: &PipeDescriptor,
        state: &str,
    ) -> Result<Option<QueueMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT msg_id, pipe_id, payload FROM messages
            WHERE pipe_id = ? AND state = ?
            ORDER BY msg_id ASC
            LIMIT 1
            "#,
        )
        .bind(&pipe.pipe_id)
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(MessageRow::into_message))
    }

    async fn list_messages(
        &self,
        pipe: &PipeDescriptor,
        state: &str,
        limit: usize,
    ) -> Result<Vec<QueueMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT msg_id, pipe_id, payload FROM messages
            WHERE pipe_id = ? AND state = ?
            ORDER BY msg_id ASC
            LIMIT ?
            "#,
        )
        .bind(&pipe.pipe_id)
        .bind(state)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(MessageRow::into_message).collect())
    }
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn create_queue_descriptor(&self, desc: &QueueDescriptor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_descriptors (
                name, max_pop_width, max_pushes_per_pipe,
                max_push_time_of_pipe_ms, pop_pipe_refresh_delay_ms
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                max_pop_width = excluded.max_pop_width,
                max_pushes_per_pipe = excluded.max_pushes_per_pipe,
                max_push_time_of_pipe_ms = excluded.max_push_time_of_pipe_ms,
                pop_pipe_refresh_delay_ms = excluded.pop_pipe_refresh_delay_ms
            "#,
        )
        .bind(&desc.name)
        .bind(desc.max_pop_width)
        .bind(desc.max_pushes_per_pipe)
        .bind(desc.max_push_time_of_pipe_ms)
        .bind(desc.pop_pipe_refresh_delay_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn get_queue_descriptor(&self, name: &str) -> Result<Option<QueueDescriptor>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT name, max_pop_width, max_pushes_per_pipe,
                   max_push_time_of_pipe_ms, pop_pipe_refresh_delay_ms
            FROM queue_descriptors WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(QueueRow::into_descriptor))
    }

    async fn create_pipe_descriptor(
        &self,
        queue_name: &str,
        pipe_id: &PipeId,
        status: PipeStatus,
        push_start_timestamp: i64,
    ) -> Result<PipeDescriptor> {
        sqlx::query(
            r#"
            INSERT INTO pipe_descriptors (queue_name, pipe_id, status, push_count, push_start_timestamp)
            VALUES (?, ?, ?, 0, ?)
            "#,
        )
        .bind(queue_name)
        .bind(pipe_id)
        .bind(status.as_str())
        .bind(push_start_timestamp)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut pipe = PipeDescriptor::new(pipe_id.clone(), queue_name, push_start_timestamp);
        pipe.status = status;
        Ok(pipe)
    }

    async fn get_pipe_descriptor(
        &self,
        queue_name: &str,
        pipe_id: &PipeId,
    ) -> Result<Option<PipeDescriptor>> {
        let row = sqlx::query_as::<_, PipeRow>(
            r#"
            SELECT queue_name, pipe_id, status, push_count, push_start_timestamp
            FROM pipe_descriptors
            WHERE queue_name = ? AND pipe_id = ?
            "#,
        )
        .bind(queue_name)
        .bind(pipe_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(PipeRow::into_descriptor).transpose()
    }

    async fn update_pipe_status(&self, pipe: &PipeDescriptor, status: PipeStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE pipe_descriptors SET status = ? WHERE queue_name = ? AND pipe_id = ?",
        )
        .bind(status.as_str())
        .bind(&pipe.queue_name)
        .bind(&pipe.pipe_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("pipe {}", pipe.pipe_id)));
        }
        Ok(())
    }

    async fn insert_message(
        &self,
        pipe: &PipeDescriptor,
        msg_id: &MsgId,
        payload: &[u8],
    ) -> Result<QueueMessage> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Write first so the transaction takes the write lock up front
        bump_push_count(&mut tx, pipe).await?;

        sqlx::query("INSERT INTO messages (msg_id, pipe_id, state, payload) VALUES (?, ?, ?, ?)")
            .bind(msg_id)
            .bind(&pipe.pipe_id)
            .bind(STATE_WAITING)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(QueueMessage::new(
            msg_id.clone(),
            pipe.pipe_id.clone(),
            payload.to_vec(),
        ))
    }

    async fn get_oldest_non_empty_pipes(
        &self,
        queue_name: &str,
        limit: usize,
    ) -> Result<Vec<PipeDescriptor>> {
        let rows = sqlx::query_as::<_, PipeRow>(
            r#"
            SELECT queue_name, pipe_id, status, push_count, push_start_timestamp
            FROM pipe_descriptors
            WHERE queue_name = ? AND status != ?
            ORDER BY pipe_id ASC
            LIMIT ?
            "#,
        )
        .bind(queue_name)
        .bind(PipeStatus::FinishedAndEmpty.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(PipeRow::into_descriptor).collect()
    }

    async fn get_oldest_waiting_message(
        &self,
        pipe: &PipeDescriptor,
    ) -> Result<Option<QueueMessage>> {
        self.oldest_message(pipe, STATE_WAITING).await
    }

    async fn get_oldest_delivered_message(
        &self,
        pipe: &PipeDescriptor,
    ) -> Result<Option<QueueMessage>> {
        self.oldest_message(pipe, STATE_DELIVERED).await
    }

    async fn list_waiting_messages(
        &self,
        pipe: &PipeDescriptor,
        limit: usize,
    ) -> Result<Vec<QueueMessage>> {
        self.list_messages(pipe, STATE_WAITING, limit).await
    }

    async fn list_delivered_messages(
        &self,
        pipe: &PipeDescriptor,
        limit: usize,
    ) -> Result<Vec<QueueMessage>> {
        self.list_messages(pipe, STATE_DELIVERED, limit).await
    }

    async fn move_waiting_to_delivered(&self, msg: &QueueMessage) -> Result<bool> {
        // Conditional update: exactly one popper wins the row
        let result = sqlx::query(
            "UPDATE messages SET state = ? WHERE msg_id = ? AND pipe_id = ? AND state = ?",
        )
        .bind(STATE_DELIVERED)
        .bind(&msg.msg_id)
        .bind(&msg.pipe_id)
        .bind(STATE_WAITING)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_delivered_message(&self, msg: &QueueMessage) -> Result<()> {
        let result = sqlx::query("DELETE FROM messages WHERE msg_id = ? AND pipe_id = ? AND state = ?")
            .bind(&msg.msg_id)
            .bind(&msg.pipe_id)
            .bind(STATE_DELIVERED)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            debug!(msg_id = %msg.msg_id, "no delivered message to delete");
        }
        Ok(())
    }

    async fn delete_and_reinsert_as_waiting(
        &self,
        msg: &QueueMessage,
        target: &PipeDescriptor,
        new_msg_id: &MsgId,
    ) -> Result<QueueMessage> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Dropping `tx` on an early return rolls both writes back
        let deleted = sqlx::query("DELETE FROM messages WHERE msg_id = ? AND pipe_id = ? AND state = ?")
            .bind(&msg.msg_id)
            .bind(&msg.pipe_id)
            .bind(STATE_DELIVERED)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if deleted.rows_affected() != 1 {
            return Err(AppError::NotFound(format!(
                "delivered message {}",
                msg.msg_id
            )));
        }

        bump_push_count(&mut tx, target).await?;

        sqlx::query("INSERT INTO messages (msg_id, pipe_id, state, payload) VALUES (?, ?, ?, ?)")
            .bind(new_msg_id)
            .bind(&target.pipe_id)
            .bind(STATE_WAITING)
            .bind(&msg.payload)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(QueueMessage::new(
            new_msg_id.clone(),
            target.pipe_id.clone(),
            msg.payload.clone(),
        ))
    }
}

/// SQLite row representation of a queue descriptor
#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    name: String,
    max_pop_width: i64,
    max_pushes_per_pipe: i64,
    max_push_time_of_pipe_ms: i64,
    pop_pipe_refresh_delay_ms: i64,
}

impl QueueRow {
    fn into_descriptor(self) -> QueueDescriptor {
        QueueDescriptor {
            name: self.name,
            max_pop_width: self.max_pop_width,
            max_pushes_per_pipe: self.max_pushes_per_pipe,
            max_push_time_of_pipe_ms: self.max_push_time_of_pipe_ms,
            pop_pipe_refresh_delay_ms: self.pop_pipe_refresh_delay_ms,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PipeRow {
    queue_name: String,
    pipe_id: String,
    status: String,
    push_count: i64,
    push_start_timestamp: i64,
}

impl PipeRow {
    fn into_descriptor(self) -> Result<PipeDescriptor> {
        Ok(PipeDescriptor {
            pipe_id: self.pipe_id,
            queue_name: self.queue_name,
            status: self.status.parse::<PipeStatus>()?,
            push_count: self.push_count,
            push_start_timestamp: self.push_start_timestamp,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    msg_id: String,
    pipe_id: String,
    payload: Vec<u8>,
}

impl MessageRow {
    fn into_message(self) -> QueueMessage {
        QueueMessage::new(self.msg_id, self.pipe_id, self.payload)
    }
}
