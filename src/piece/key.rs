//! Piece key formatting and parsing
//!
//! ```text
//! SegmentKey   := "s" u64 "_s" u32 ( "_v" i64 )?
//! ECKey        := "e" u64 "_s" u32 "_p" u32 ( "_v" i64 )?
//! ChallengeKey := SegmentKey | ECKey
//! ```
//!
//! The version suffix is only emitted for non-zero versions, so `s1_s0` and
//! `s1_s0_v0` name different pieces. A negative version keeps its sign
//! (`s1_s0_v-3`) and parses back.

use crate::error::{Error, Result};

const SEGMENT_PREFIX: char = 's';
const EC_PREFIX: char = 'e';
const REDUNDANCY_PREFIX: char = 'p';
const VERSION_PREFIX: char = 'v';

/// Key of a whole segment stored by the primary SP.
pub fn segment_piece_key(object_id: u64, segment_idx: u32, version: i64) -> String {
    if version == 0 {
        format!("s{}_s{}", object_id, segment_idx)
    } else {
        format!("s{}_s{}_v{}", object_id, segment_idx, version)
    }
}

/// Key of an erasure-coded piece stored by a secondary SP.
pub fn ec_piece_key(object_id: u64, segment_idx: u32, redundancy_idx: u32, version: i64) -> String {
    if version == 0 {
        format!("e{}_s{}_p{}", object_id, segment_idx, redundancy_idx)
    } else {
        format!(
            "e{}_s{}_p{}_v{}",
            object_id, segment_idx, redundancy_idx, version
        )
    }
}

/// A negative redundancy index addresses the segment itself.
pub fn challenge_piece_key(
    object_id: u64,
    segment_idx: u32,
    redundancy_idx: i32,
    version: i64,
) -> String {
    match u32::try_from(redundancy_idx) {
        Ok(r) => ec_piece_key(object_id, segment_idx, r, version),
        Err(_) => segment_piece_key(object_id, segment_idx, version),
    }
}

/// Returns the segment index of a segment key.
pub fn parse_segment_idx(key: &str) -> Result<u32> {
    let parts: Vec<&str> = key.split('_').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid(key, "segment key needs 2 or 3 tokens"));
    }
    parse_number::<u64>(key, parts[0], SEGMENT_PREFIX)?;
    let segment_idx = parse_number::<u32>(key, parts[1], SEGMENT_PREFIX)?;
    if let Some(version) = parts.get(2) {
        parse_version(key, version)?;
    }
    Ok(segment_idx)
}

/// Returns `(segment_idx, redundancy_idx)` of an EC piece key.
pub fn parse_ec_piece_key_idx(key: &str) -> Result<(u32, i32)> {
    let parts: Vec<&str> = key.split('_').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(invalid(key, "ec piece key needs 3 or 4 tokens"));
    }
    parse_number::<u64>(key, parts[0], EC_PREFIX)?;
    let segment_idx = parse_number::<u32>(key, parts[1], SEGMENT_PREFIX)?;
    let redundancy_idx = parse_number::<u32>(key, parts[2], REDUNDANCY_PREFIX)?;
    let redundancy_idx = i32::try_from(redundancy_idx)
        .map_err(|_| invalid(key, "redundancy index overflows i32"))?;
    if let Some(version) = parts.get(3) {
        parse_version(key, version)?;
    }
    Ok((segment_idx, redundancy_idx))
}

/// Returns `(segment_idx, redundancy_idx)`; segment keys yield `-1`.
pub fn parse_challenge_idx(key: &str) -> Result<(u32, i32)> {
    match key.chars().next() {
        Some(EC_PREFIX) => parse_ec_piece_key_idx(key),
        Some(SEGMENT_PREFIX) => parse_segment_idx(key).map(|s| (s, -1)),
        _ => Err(invalid(key, "unknown key prefix")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, token: &str, prefix: char) -> Result<T> {
    let digits = token
        .strip_prefix(prefix)
        .ok_or_else(|| invalid(key, &format!("token {:?} lacks prefix {:?}", token, prefix)))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(key, &format!("token {:?} is not decimal", token)));
    }
    digits
        .parse::<T>()
        .map_err(|_| invalid(key, &format!("token {:?} overflows", token)))
}

/// The only signed token: `v` followed by an optional `-` and digits.
fn parse_version(key: &str, token: &str) -> Result<i64> {
    match token.strip_prefix("v-") {
        Some(magnitude) => {
            let unsigned = format!("{}{}", VERSION_PREFIX, magnitude);
            let magnitude = parse_number::<u64>(key, &unsigned, VERSION_PREFIX)?;
            0i64.checked_sub_unsigned(magnitude)
                .ok_or_else(|| invalid(key, &format!("token {:?} overflows", token)))
        }
        None => parse_number::<i64>(key, token, VERSION_PREFIX),
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidKeyFormat(format!("{}: {}", key, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_segment_key_format() {
        assert_eq!(segment_piece_key(42, 7, 0), "s42_s7");
        assert_eq!(segment_piece_key(42, 7, 3), "s42_s7_v3");
    }

    #[test]
    fn test_ec_key_format() {
        assert_eq!(ec_piece_key(42, 7, 3, 0), "e42_s7_p3");
        assert_eq!(ec_piece_key(42, 7, 3, 5), "e42_s7_p3_v5");
    }

    #[test]
    fn test_challenge_key_delegates_on_sign() {
        assert_eq!(challenge_piece_key(1, 2, -1, 0), "s1_s2");
        assert_eq!(challenge_piece_key(1, 2, 0, 0), "e1_s2_p0");
        assert_eq!(challenge_piece_key(1, 2, 4, 9), "e1_s2_p4_v9");
    }

    #[test]
    fn test_parse_segment_idx() {
        assert_eq!(parse_segment_idx("s42_s7").unwrap(), 7);
        assert_eq!(parse_segment_idx("s42_s7_v2").unwrap(), 7);
    }

    #[test]
    fn test_parse_ec_key() {
        assert_eq!(parse_ec_piece_key_idx("e42_s7_p3_v5").unwrap(), (7, 3));
        assert_eq!(parse_ec_piece_key_idx("e42_s7_p3").unwrap(), (7, 3));
    }

    #[test]
    fn test_parse_challenge_key() {
        assert_eq!(parse_challenge_idx("s42_s7").unwrap(), (7, -1));
        assert_eq!(parse_challenge_idx("e42_s7_p3").unwrap(), (7, 3));
        assert_matches!(parse_challenge_idx("x42_s7"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_challenge_idx(""), Err(Error::InvalidKeyFormat(_)));
    }

    #[test]
    fn test_parse_rejects_bad_token_count() {
        assert_matches!(parse_segment_idx("s42"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_segment_idx("s42_s7_v1_x"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_ec_piece_key_idx("e42_s7"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(
            parse_ec_piece_key_idx("e42_s7_p1_v1_x"),
            Err(Error::InvalidKeyFormat(_))
        );
    }

    #[test]
    fn test_parse_rejects_overflow() {
        assert_matches!(parse_segment_idx("s1_s4294967296"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(
            parse_ec_piece_key_idx("e1_s0_p2147483648"),
            Err(Error::InvalidKeyFormat(_))
        );
        assert_eq!(
            parse_ec_piece_key_idx("e1_s0_p2147483647").unwrap(),
            (0, i32::MAX)
        );
    }

    #[test]
    fn test_negative_version_round_trips() {
        assert_eq!(segment_piece_key(1, 2, -3), "s1_s2_v-3");
        assert_eq!(parse_segment_idx(&segment_piece_key(1, 2, -3)).unwrap(), 2);
        assert_eq!(ec_piece_key(1, 2, 4, -9), "e1_s2_p4_v-9");
        assert_eq!(parse_ec_piece_key_idx(&ec_piece_key(1, 2, 4, -9)).unwrap(), (2, 4));
        let oldest = segment_piece_key(1, 2, i64::MIN);
        assert_eq!(parse_segment_idx(&oldest).unwrap(), 2);
        assert_ne!(segment_piece_key(1, 2, -3), segment_piece_key(1, 2, 3));
    }

    #[test]
    fn test_parse_rejects_malformed_version() {
        assert_matches!(parse_segment_idx("s1_s2_v-"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_segment_idx("s1_s2_v--3"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_segment_idx("s1_s2_v+3"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(
            parse_segment_idx("s1_s2_v-9223372036854775809"),
            Err(Error::InvalidKeyFormat(_))
        );
    }

    #[test]
    fn test_parse_rejects_sign_and_prefix() {
        assert_matches!(parse_segment_idx("s1_s+7"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_segment_idx("s1_s-7"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_segment_idx("s1_p7"), Err(Error::InvalidKeyFormat(_)));
        assert_matches!(parse_ec_piece_key_idx("e1_s7_s3"), Err(Error::InvalidKeyFormat(_)));
    }
}
