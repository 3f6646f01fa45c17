//! Embedded SQLite schema
//!
//! 64-bit unsigned values are stored bit-cast into SQLite's signed INTEGER.
//! Checksum lists and signatures are comma-joined lowercase hex.

pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS integrity_meta (
        object_id INTEGER NOT NULL,
        redundancy_index INTEGER NOT NULL,
        integrity_checksum TEXT NOT NULL,
        piece_checksum_list TEXT NOT NULL,
        signature TEXT NOT NULL,
        PRIMARY KEY (object_id, redundancy_index)
    )",
    "CREATE TABLE IF NOT EXISTS piece_hash (
        object_id INTEGER NOT NULL,
        redundancy_index INTEGER NOT NULL,
        segment_index INTEGER NOT NULL,
        piece_checksum TEXT NOT NULL,
        PRIMARY KEY (object_id, redundancy_index, segment_index)
    )",
    "CREATE TABLE IF NOT EXISTS bucket_traffic (
        bucket_id INTEGER NOT NULL,
        month TEXT NOT NULL,
        bucket_name TEXT NOT NULL,
        read_consumed_size INTEGER NOT NULL DEFAULT 0,
        free_quota_consumed_size INTEGER NOT NULL DEFAULT 0,
        free_quota_size INTEGER NOT NULL DEFAULT 0,
        charged_quota_size INTEGER NOT NULL DEFAULT 0,
        modified_time TEXT NOT NULL,
        PRIMARY KEY (bucket_id, month)
    )",
    "CREATE TABLE IF NOT EXISTS read_record (
        read_record_id INTEGER PRIMARY KEY AUTOINCREMENT,
        bucket_id INTEGER NOT NULL,
        object_id INTEGER NOT NULL,
        user_address TEXT NOT NULL,
        bucket_name TEXT NOT NULL,
        object_name TEXT NOT NULL,
        read_size INTEGER NOT NULL,
        read_timestamp_us INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_read_record_bucket
        ON read_record (bucket_id, read_timestamp_us)",
    "CREATE INDEX IF NOT EXISTS idx_read_record_object
        ON read_record (object_id, read_timestamp_us)",
    "CREATE TABLE IF NOT EXISTS upload_object_progress (
        object_id INTEGER PRIMARY KEY,
        task_state INTEGER NOT NULL,
        global_virtual_group_id INTEGER NOT NULL DEFAULT 0,
        secondary_endpoints TEXT NOT NULL DEFAULT '',
        secondary_signatures TEXT NOT NULL DEFAULT '',
        error_description TEXT NOT NULL DEFAULT '',
        create_timestamp_second INTEGER NOT NULL,
        update_timestamp_second INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_upload_state_update
        ON upload_object_progress (task_state, update_timestamp_second)",
];
