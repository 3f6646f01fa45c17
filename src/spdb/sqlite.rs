//! SQLite implementation of [`SpDb`]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use super::{
    join_hex, split_hex, year_month_of, BucketQuota, BucketTraffic, IntegrityMeta, ReadRecord,
    SpDb, TaskState, UploadObjectMeta, SCHEMA,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::metrics;

#[derive(Clone)]
pub struct SqliteSpDb {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteSpDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSpDb").finish_non_exhaustive()
    }
}

impl SqliteSpDb {
    /// Opens the database at `url` and applies the schema.
    ///
    /// In-memory databases live as long as their connection, so they are
    /// pinned to a single connection that never expires.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let pool = pool_options.connect_with(options).await?;

        let db = Self::from_pool(pool);
        db.migrate().await?;
        info!(url, in_memory, "sp db opened");
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.clock.now_micros()).unwrap_or_else(Utc::now)
    }

    /// Quota decision and record insert, inside the caller's transaction.
    async fn apply_read(
        &self,
        conn: &mut SqliteConnection,
        record: &ReadRecord,
        quota: &BucketQuota,
        year_month: &str,
    ) -> Result<()> {
        let now = self.now();

        // Writing first takes SQLite's write lock for the rest of the transaction.
        sqlx::query(
            "INSERT OR IGNORE INTO bucket_traffic
                (bucket_id, month, bucket_name, read_consumed_size, free_quota_consumed_size,
                 free_quota_size, charged_quota_size, modified_time)
             VALUES (?, ?, ?, 0, 0, ?, ?, ?)",
        )
        .bind(record.bucket_id as i64)
        .bind(year_month)
        .bind(&record.bucket_name)
        .bind(quota.free_quota_size as i64)
        .bind(quota.charged_quota_size as i64)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT * FROM bucket_traffic WHERE bucket_id = ? AND month = ?")
            .bind(record.bucket_id as i64)
            .bind(year_month)
            .fetch_one(&mut *conn)
            .await?;
        let mut traffic = traffic_from_row(&row)?;

        if traffic.charged_quota_size != quota.charged_quota_size {
            debug!(
                bucket_id = record.bucket_id,
                from = traffic.charged_quota_size,
                to = quota.charged_quota_size,
                "charged quota changed"
            );
            traffic.charged_quota_size = quota.charged_quota_size;
        }

        traffic.consume(record.read_size)?;

        sqlx::query(
            "UPDATE bucket_traffic
             SET read_consumed_size = ?, free_quota_consumed_size = ?, charged_quota_size = ?,
                 modified_time = ?
             WHERE bucket_id = ? AND month = ?",
        )
        .bind(traffic.read_consumed_size as i64)
        .bind(traffic.free_quota_consumed_size as i64)
        .bind(traffic.charged_quota_size as i64)
        .bind(now)
        .bind(record.bucket_id as i64)
        .bind(year_month)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO read_record
                (bucket_id, object_id, user_address, bucket_name, object_name, read_size,
                 read_timestamp_us)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.bucket_id as i64)
        .bind(record.object_id as i64)
        .bind(&record.user_address)
        .bind(&record.bucket_name)
        .bind(&record.object_name)
        .bind(record.read_size as i64)
        .bind(record.read_timestamp_us)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn upload_metas_in(
        &self,
        states: [TaskState; 2],
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>> {
        let since = self.clock.now_secs().saturating_sub(timeout_secs);
        let rows = sqlx::query(
            "SELECT * FROM upload_object_progress
             WHERE task_state IN (?, ?) AND update_timestamp_second >= ?
             ORDER BY update_timestamp_second DESC
             LIMIT ?",
        )
        .bind(states[0].as_i32())
        .bind(states[1].as_i32())
        .bind(since)
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_duplicate(err: sqlx::Error, what: String) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Duplicate(what),
        _ => Error::from(err),
    }
}

fn integrity_from_row(row: &SqliteRow) -> Result<IntegrityMeta> {
    Ok(IntegrityMeta {
        object_id: row.try_get::<i64, _>("object_id")? as u64,
        redundancy_index: row.try_get("redundancy_index")?,
        integrity_checksum: hex::decode(row.try_get::<String, _>("integrity_checksum")?)?,
        piece_checksum_list: split_hex(&row.try_get::<String, _>("piece_checksum_list")?)?,
        signature: hex::decode(row.try_get::<String, _>("signature")?)?,
    })
}

fn traffic_from_row(row: &SqliteRow) -> Result<BucketTraffic> {
    Ok(BucketTraffic {
        bucket_id: row.try_get::<i64, _>("bucket_id")? as u64,
        year_month: row.try_get("month")?,
        bucket_name: row.try_get("bucket_name")?,
        read_consumed_size: row.try_get::<i64, _>("read_consumed_size")? as u64,
        free_quota_consumed_size: row.try_get::<i64, _>("free_quota_consumed_size")? as u64,
        free_quota_size: row.try_get::<i64, _>("free_quota_size")? as u64,
        charged_quota_size: row.try_get::<i64, _>("charged_quota_size")? as u64,
        modified_time: row.try_get("modified_time")?,
    })
}

fn read_record_from_row(row: &SqliteRow) -> Result<ReadRecord> {
    Ok(ReadRecord {
        bucket_id: row.try_get::<i64, _>("bucket_id")? as u64,
        object_id: row.try_get::<i64, _>("object_id")? as u64,
        user_address: row.try_get("user_address")?,
        bucket_name: row.try_get("bucket_name")?,
        object_name: row.try_get("object_name")?,
        read_size: row.try_get::<i64, _>("read_size")? as u64,
        read_timestamp_us: row.try_get("read_timestamp_us")?,
    })
}

fn upload_from_row(row: &SqliteRow) -> Result<UploadObjectMeta> {
    let endpoints: String = row.try_get("secondary_endpoints")?;
    Ok(UploadObjectMeta {
        object_id: row.try_get::<i64, _>("object_id")? as u64,
        task_state: TaskState::from_i32(row.try_get("task_state")?)?,
        global_virtual_group_id: row.try_get::<i64, _>("global_virtual_group_id")? as u32,
        secondary_endpoints: if endpoints.is_empty() {
            Vec::new()
        } else {
            endpoints.split(',').map(str::to_string).collect()
        },
        secondary_signatures: split_hex(&row.try_get::<String, _>("secondary_signatures")?)?,
        error_description: row.try_get("error_description")?,
        create_timestamp_second: row.try_get("create_timestamp_second")?,
        update_timestamp_second: row.try_get("update_timestamp_second")?,
    })
}

#[async_trait]
impl SpDb for SqliteSpDb {
    async fn set_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_idx: u32,
        checksum: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO piece_hash (object_id, redundancy_index, segment_index, piece_checksum)
             VALUES (?, ?, ?, ?)",
        )
        .bind(object_id as i64)
        .bind(redundancy_idx)
        .bind(i64::from(piece_idx))
        .bind(hex::encode(checksum))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_duplicate(
                e,
                format!(
                    "piece checksum object {} replica {} piece {}",
                    object_id, redundancy_idx, piece_idx
                ),
            )
        })?;
        Ok(())
    }

    async fn get_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_idx: u32,
    ) -> Result<Vec<u8>> {
        let checksum: Option<String> = sqlx::query_scalar(
            "SELECT piece_checksum FROM piece_hash
             WHERE object_id = ? AND redundancy_index = ? AND segment_index = ?",
        )
        .bind(object_id as i64)
        .bind(redundancy_idx)
        .bind(i64::from(piece_idx))
        .fetch_optional(&self.pool)
        .await?;
        let checksum = checksum.ok_or_else(|| {
            Error::NotFound(format!(
                "piece checksum object {} replica {} piece {}",
                object_id, redundancy_idx, piece_idx
            ))
        })?;
        Ok(hex::decode(checksum)?)
    }

    async fn get_all_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_count: u32,
    ) -> Result<Vec<Vec<u8>>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT piece_checksum FROM piece_hash
             WHERE object_id = ? AND redundancy_index = ? AND segment_index < ?
             ORDER BY segment_index ASC",
        )
        .bind(object_id as i64)
        .bind(redundancy_idx)
        .bind(i64::from(piece_count))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|c| hex::decode(c).map_err(Error::from))
            .collect()
    }

    async fn delete_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_idx: u32,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM piece_hash
             WHERE object_id = ? AND redundancy_index = ? AND segment_index = ?",
        )
        .bind(object_id as i64)
        .bind(redundancy_idx)
        .bind(i64::from(piece_idx))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_all_replicate_piece_checksum(
        &self,
        object_id: u64,
        redundancy_idx: i32,
        piece_count: u32,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM piece_hash
             WHERE object_id = ? AND redundancy_index = ? AND segment_index < ?",
        )
        .bind(object_id as i64)
        .bind(redundancy_idx)
        .bind(i64::from(piece_count))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, meta), fields(object_id = meta.object_id, replica = meta.redundancy_index))]
    async fn set_object_integrity(&self, meta: &IntegrityMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO integrity_meta
                (object_id, redundancy_index, integrity_checksum, piece_checksum_list, signature)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (object_id, redundancy_index) DO UPDATE SET
                integrity_checksum = excluded.integrity_checksum,
                piece_checksum_list = excluded.piece_checksum_list,
                signature = excluded.signature",
        )
        .bind(meta.object_id as i64)
        .bind(meta.redundancy_index)
        .bind(hex::encode(&meta.integrity_checksum))
        .bind(join_hex(&meta.piece_checksum_list))
        .bind(hex::encode(&meta.signature))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_object_integrity(
        &self,
        object_id: u64,
        redundancy_idx: i32,
    ) -> Result<IntegrityMeta> {
        let row = sqlx::query(
            "SELECT * FROM integrity_meta WHERE object_id = ? AND redundancy_index = ?",
        )
        .bind(object_id as i64)
        .bind(redundancy_idx)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "integrity of object {} replica {}",
                object_id, redundancy_idx
            ))
        })?;
        integrity_from_row(&row)
    }

    async fn delete_object_integrity(&self, object_id: u64, redundancy_idx: i32) -> Result<()> {
        sqlx::query("DELETE FROM integrity_meta WHERE object_id = ? AND redundancy_index = ?")
            .bind(object_id as i64)
            .bind(redundancy_idx)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, record, quota), fields(bucket_id = record.bucket_id, read_size = record.read_size))]
    async fn check_quota_and_add_read_record(
        &self,
        record: &ReadRecord,
        quota: &BucketQuota,
    ) -> Result<()> {
        let year_month = year_month_of(record.read_timestamp_us)?;
        let mut tx = self.pool.begin().await?;
        match self.apply_read(&mut tx, record, quota, &year_month).await {
            Ok(()) => {
                tx.commit().await?;
                metrics::inc_quota_check("admitted");
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "failed to roll back quota transaction");
                }
                let outcome = match err {
                    Error::QuotaExceeded { .. } => "exceeded",
                    _ => "error",
                };
                metrics::inc_quota_check(outcome);
                debug!(error = %err, "read rejected");
                Err(err)
            }
        }
    }

    async fn init_bucket_traffic(&self, record: &ReadRecord, quota: &BucketQuota) -> Result<()> {
        let year_month = year_month_of(record.read_timestamp_us)?;
        sqlx::query(
            "INSERT OR IGNORE INTO bucket_traffic
                (bucket_id, month, bucket_name, read_consumed_size, free_quota_consumed_size,
                 free_quota_size, charged_quota_size, modified_time)
             VALUES (?, ?, ?, 0, 0, ?, ?, ?)",
        )
        .bind(record.bucket_id as i64)
        .bind(&year_month)
        .bind(&record.bucket_name)
        .bind(quota.free_quota_size as i64)
        .bind(quota.charged_quota_size as i64)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_bucket_traffic(&self, bucket_id: u64, year_month: &str) -> Result<BucketTraffic> {
        let row = sqlx::query("SELECT * FROM bucket_traffic WHERE bucket_id = ? AND month = ?")
            .bind(bucket_id as i64)
            .bind(year_month)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("traffic of bucket {} in {}", bucket_id, year_month))
            })?;
        traffic_from_row(&row)
    }

    async fn get_bucket_read_records(
        &self,
        bucket_id: u64,
        start_us: i64,
        end_us: i64,
        limit: usize,
    ) -> Result<Vec<ReadRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM read_record
             WHERE bucket_id = ? AND read_timestamp_us >= ? AND read_timestamp_us < ?
             ORDER BY read_timestamp_us ASC, read_record_id ASC
             LIMIT ?",
        )
        .bind(bucket_id as i64)
        .bind(start_us)
        .bind(end_us)
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(read_record_from_row).collect()
    }

    async fn get_object_read_records(
        &self,
        object_id: u64,
        start_us: i64,
        end_us: i64,
        limit: usize,
    ) -> Result<Vec<ReadRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM read_record
             WHERE object_id = ? AND read_timestamp_us >= ? AND read_timestamp_us < ?
             ORDER BY read_timestamp_us ASC, read_record_id ASC
             LIMIT ?",
        )
        .bind(object_id as i64)
        .bind(start_us)
        .bind(end_us)
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(read_record_from_row).collect()
    }

    async fn insert_upload_progress(&self, object_id: u64) -> Result<()> {
        let now = self.clock.now_secs();
        sqlx::query(
            "INSERT INTO upload_object_progress
                (object_id, task_state, create_timestamp_second, update_timestamp_second)
             VALUES (?, ?, ?, ?)",
        )
        .bind(object_id as i64)
        .bind(TaskState::Init.as_i32())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_duplicate(e, format!("upload progress of object {}", object_id)))?;
        Ok(())
    }

    async fn update_upload_progress(&self, meta: &UploadObjectMeta) -> Result<()> {
        let result = sqlx::query(
            "UPDATE upload_object_progress
             SET task_state = ?, global_virtual_group_id = ?, secondary_endpoints = ?,
                 secondary_signatures = ?, error_description = ?, update_timestamp_second = ?
             WHERE object_id = ?",
        )
        .bind(meta.task_state.as_i32())
        .bind(i64::from(meta.global_virtual_group_id))
        .bind(meta.secondary_endpoints.join(","))
        .bind(join_hex(&meta.secondary_signatures))
        .bind(&meta.error_description)
        .bind(self.clock.now_secs())
        .bind(meta.object_id as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "upload progress of object {}",
                meta.object_id
            )));
        }
        Ok(())
    }

    async fn get_upload_state(&self, object_id: u64) -> Result<(TaskState, String)> {
        let meta = self.get_upload_meta(object_id).await?;
        Ok((meta.task_state, meta.error_description))
    }

    async fn get_upload_meta(&self, object_id: u64) -> Result<UploadObjectMeta> {
        let row = sqlx::query("SELECT * FROM upload_object_progress WHERE object_id = ?")
            .bind(object_id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("upload progress of object {}", object_id)))?;
        upload_from_row(&row)
    }

    async fn get_upload_metas_to_replicate(
        &self,
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>> {
        self.upload_metas_in(
            [TaskState::Uploaded, TaskState::Replicating],
            limit,
            timeout_secs,
        )
        .await
    }

    async fn get_upload_metas_to_seal(
        &self,
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>> {
        self.upload_metas_in([TaskState::Replicated, TaskState::Sealing], limit, timeout_secs)
            .await
    }

    async fn get_timed_out_upload_metas(
        &self,
        states: &[TaskState],
        limit: usize,
        timeout_secs: i64,
    ) -> Result<Vec<UploadObjectMeta>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let before = self.clock.now_secs().saturating_sub(timeout_secs);
        let sql = format!(
            "SELECT * FROM upload_object_progress
             WHERE task_state IN ({}) AND update_timestamp_second < ?
             ORDER BY update_timestamp_second ASC
             LIMIT ?",
            vec!["?"; states.len()].join(", ")
        );
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.as_i32());
        }
        let rows = query
            .bind(before)
            .bind(limit_to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(upload_from_row).collect()
    }

    async fn delete_upload_progress(&self, object_id: u64) -> Result<()> {
        sqlx::query("DELETE FROM upload_object_progress WHERE object_id = ?")
            .bind(object_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
