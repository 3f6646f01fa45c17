//! Task keys
//!
//! A key is the task type prefix followed by `-`-joined fields, e.g.
//! `CreateBucketApproval-bucket:photos-account:0xabc-fingerprint:0d1f...`.
//! Keys are used for deduplication and substring queries.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DELIMITER: &str = "-";
pub const KEY_PREFIX_CREATE_BUCKET_APPROVAL: &str = "CreateBucketApproval";
pub const KEY_PREFIX_CREATE_OBJECT_APPROVAL: &str = "CreateObjectApproval";
pub const KEY_PREFIX_MIGRATE_BUCKET_APPROVAL: &str = "MigrateBucketApproval";
pub const KEY_PREFIX_UPLOAD_OBJECT: &str = "Uploading";
pub const KEY_PREFIX_REPLICATE_PIECE: &str = "Uploading";
pub const KEY_PREFIX_SEAL_OBJECT: &str = "Uploading";
pub const KEY_PREFIX_RECEIVE_PIECE: &str = "ReceivePiece";
pub const KEY_PREFIX_GC_OBJECT: &str = "GCObject";
pub const KEY_PREFIX_GC_ZOMBIE_PIECE: &str = "GCZombiePiece";
pub const KEY_PREFIX_GC_META: &str = "GCMeta";
pub const KEY_PREFIX_RECOVER_PIECE: &str = "Recovering";
pub const KEY_PREFIX_CHALLENGE_PIECE: &str = "ChallengePiece";

/// Unique identity of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TKey(String);

impl TKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, sub: &str) -> bool {
        self.0.contains(sub)
    }
}

impl fmt::Display for TKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Joins fields, each preceded by the delimiter.
pub fn combine_key<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    fields.into_iter().fold(String::new(), |mut key, field| {
        key.push_str(DELIMITER);
        key.push_str(field.as_ref());
        key
    })
}

fn prefixed(prefix: &str, fields: &[String]) -> TKey {
    TKey(format!("{}{}", prefix, combine_key(fields)))
}

pub fn create_bucket_approval_key(bucket: &str, account: &str, fingerprint: &[u8]) -> TKey {
    prefixed(
        KEY_PREFIX_CREATE_BUCKET_APPROVAL,
        &[
            format!("bucket:{}", bucket),
            format!("account:{}", account),
            format!("fingerprint:{}", hex::encode(fingerprint)),
        ],
    )
}

pub fn create_object_approval_key(
    bucket: &str,
    object: &str,
    account: &str,
    fingerprint: &[u8],
) -> TKey {
    prefixed(
        KEY_PREFIX_CREATE_OBJECT_APPROVAL,
        &[
            format!("bucket:{}", bucket),
            format!("object:{}", object),
            format!("account:{}", account),
            format!("fingerprint:{}", hex::encode(fingerprint)),
        ],
    )
}

pub fn migrate_bucket_approval_key(bucket: &str, fingerprint: &[u8]) -> TKey {
    prefixed(
        KEY_PREFIX_MIGRATE_BUCKET_APPROVAL,
        &[
            format!("bucket:{}", bucket),
            format!("hash:{}", hex::encode(fingerprint)),
        ],
    )
}

pub fn upload_object_key(bucket: &str, object: &str, id: u64) -> TKey {
    prefixed(KEY_PREFIX_UPLOAD_OBJECT, &object_fields(bucket, object, id))
}

pub fn replicate_piece_key(bucket: &str, object: &str, id: u64) -> TKey {
    prefixed(KEY_PREFIX_REPLICATE_PIECE, &object_fields(bucket, object, id))
}

pub fn seal_object_key(bucket: &str, object: &str, id: u64) -> TKey {
    prefixed(KEY_PREFIX_SEAL_OBJECT, &object_fields(bucket, object, id))
}

pub fn receive_piece_key(
    bucket: &str,
    object: &str,
    id: u64,
    segment_idx: u32,
    redundancy_idx: i32,
) -> TKey {
    let mut fields = object_fields(bucket, object, id);
    fields.push(format!("segmentIdx:{}", segment_idx));
    fields.push(format!("redundancyIdx:{}", redundancy_idx));
    prefixed(KEY_PREFIX_RECEIVE_PIECE, &fields)
}

pub fn recover_piece_key(
    bucket: &str,
    object: &str,
    id: u64,
    segment_idx: u32,
    ec_idx: i32,
    time: i64,
) -> TKey {
    let mut fields = object_fields(bucket, object, id);
    fields.push(format!("segIdx:{}", segment_idx));
    if ec_idx >= 0 {
        fields.push(format!("ecIdx:{}", ec_idx));
    }
    fields.push(format!("time{}", time));
    prefixed(KEY_PREFIX_RECOVER_PIECE, &fields)
}

pub fn challenge_piece_key(
    bucket: &str,
    object: &str,
    id: u64,
    segment_idx: u32,
    redundancy_idx: i32,
    user: &str,
) -> TKey {
    let mut fields = object_fields(bucket, object, id);
    fields.push(format!("sIdx:{}", segment_idx));
    fields.push(format!("rIdx:{}", redundancy_idx));
    fields.push(user.to_string());
    prefixed(KEY_PREFIX_CHALLENGE_PIECE, &fields)
}

pub fn gc_object_key(start: u64, end: u64, time: i64) -> TKey {
    prefixed(
        KEY_PREFIX_GC_OBJECT,
        &[
            format!("start{}", start),
            format!("end{}", end),
            format!("time{}", time),
        ],
    )
}

pub fn gc_zombie_piece_key(time: i64) -> TKey {
    prefixed(KEY_PREFIX_GC_ZOMBIE_PIECE, &[format!("time{}", time)])
}

pub fn gc_meta_key(time: i64) -> TKey {
    prefixed(KEY_PREFIX_GC_META, &[format!("time{}", time)])
}

fn object_fields(bucket: &str, object: &str, id: u64) -> Vec<String> {
    vec![
        format!("bucket:{}", bucket),
        format!("object:{}", object),
        format!("id:{}", id),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_key() {
        assert_eq!(combine_key(["a", "b"]), "-a-b");
        assert_eq!(combine_key(Vec::<String>::new()), "");
    }

    #[test]
    fn test_approval_keys() {
        let key = create_bucket_approval_key("photos", "0xabc", &[0x0d, 0x1f]);
        assert_eq!(
            key.as_str(),
            "CreateBucketApproval-bucket:photos-account:0xabc-fingerprint:0d1f"
        );
        let key = create_object_approval_key("photos", "cat.jpg", "0xabc", &[1]);
        assert!(key.contains("object:cat.jpg"));
        assert!(migrate_bucket_approval_key("photos", &[2]).contains("hash:02"));
    }

    #[test]
    fn test_receive_key_fields() {
        let key = receive_piece_key("b", "o", 9, 2, 1);
        assert_eq!(
            key.as_str(),
            "ReceivePiece-bucket:b-object:o-id:9-segmentIdx:2-redundancyIdx:1"
        );
    }

    #[test]
    fn test_recover_key_omits_negative_ec_index() {
        assert!(!recover_piece_key("b", "o", 1, 0, -1, 5).contains("ecIdx"));
        assert!(recover_piece_key("b", "o", 1, 0, 3, 5).contains("ecIdx:3"));
    }

    #[test]
    fn test_upload_pipeline_shares_prefix() {
        assert_eq!(upload_object_key("b", "o", 1), seal_object_key("b", "o", 1));
        assert!(replicate_piece_key("b", "o", 1).as_str().starts_with("Uploading-"));
        assert_eq!(gc_meta_key(7).as_str(), "GCMeta-time7");
    }
}
