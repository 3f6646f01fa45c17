//! Segment and EC piece size arithmetic

/// Size of the largest segment: `min(payload, max_segment)`.
///
/// Returns a signed width because callers mix it with signed offsets. The
/// payload must be below `2^63`; larger values saturate at `i64::MAX`.
pub fn max_segment_piece_size(payload_size: u64, max_segment_size: u64) -> i64 {
    to_i64(payload_size.min(max_segment_size))
}

/// Number of segments: `ceil(payload / max_segment)`.
pub fn segment_piece_count(payload_size: u64, max_segment_size: u64) -> u32 {
    if max_segment_size == 0 {
        return 0;
    }
    let count = payload_size.div_ceil(max_segment_size);
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Size of segment `segment_idx`. Indices past the end are treated as the last segment.
pub fn segment_piece_size(payload_size: u64, segment_idx: u32, max_segment_size: u64) -> i64 {
    let count = segment_piece_count(payload_size, max_segment_size);
    match count {
        0 => 0,
        1 => to_i64(payload_size),
        _ if segment_idx >= count - 1 => {
            to_i64(payload_size - u64::from(count - 1) * max_segment_size)
        }
        _ => to_i64(max_segment_size),
    }
}

/// Size of one EC piece of segment `segment_idx`: `ceil(segment / data_chunk_num)`.
pub fn ec_piece_size(
    payload_size: u64,
    segment_idx: u32,
    max_segment_size: u64,
    data_chunk_num: u32,
) -> i64 {
    if data_chunk_num == 0 {
        return 0;
    }
    let segment_size = segment_piece_size(payload_size, segment_idx, max_segment_size);
    let chunks = i64::from(data_chunk_num);
    let mut size = segment_size / chunks;
    if segment_size > 0 && segment_size % chunks != 0 {
        size += 1;
    }
    size
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_segment_sizes_fifteen_by_six() {
        assert_eq!(segment_piece_count(15, 6), 3);
        let sizes: Vec<i64> = (0..3).map(|i| segment_piece_size(15, i, 6)).collect();
        assert_eq!(sizes, vec![6, 6, 3]);
        let ec: Vec<i64> = (0..3).map(|i| ec_piece_size(15, i, 6, 4)).collect();
        assert_eq!(ec, vec![2, 2, 1]);
    }

    #[test]
    fn test_zero_payload() {
        assert_eq!(segment_piece_count(0, 16), 0);
        assert_eq!(segment_piece_size(0, 0, 16), 0);
        assert_eq!(ec_piece_size(0, 0, 16, 4), 0);
        assert_eq!(max_segment_piece_size(0, 16), 0);
    }

    #[test]
    fn test_single_segment() {
        assert_eq!(segment_piece_count(5, 16), 1);
        assert_eq!(segment_piece_size(5, 0, 16), 5);
        assert_eq!(max_segment_piece_size(5, 16), 5);
        assert_eq!(max_segment_piece_size(50, 16), 16);
    }

    #[test]
    fn test_index_past_end_is_last_segment() {
        assert_eq!(segment_piece_size(15, 9, 6), 3);
    }

    #[test]
    fn test_max_segment_saturates() {
        assert_eq!(max_segment_piece_size(u64::MAX, u64::MAX), i64::MAX);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_segment_count_bounds(p in 0u64..1 << 40, m in 1u64..1 << 24) {
            let c = u64::from(segment_piece_count(p, m));
            prop_assert!(c * m >= p);
            prop_assert!(c == 0 || (c - 1) * m < p);
        }

        #[test]
        fn prop_segment_sizes_sum_to_payload(p in 0u64..1 << 30, m in 1u64..1 << 16) {
            let c = segment_piece_count(p, m);
            let sum: i64 = (0..c).map(|i| segment_piece_size(p, i, m)).sum();
            prop_assert_eq!(sum, p as i64);
        }

        #[test]
        fn prop_ec_piece_covers_segment(
            p in 1u64..1 << 30,
            m in 1u64..1 << 16,
            d in 1u32..16,
            i in 0u32..64,
        ) {
            let ec = ec_piece_size(p, i, m, d);
            prop_assert!(ec >= 0);
            prop_assert!(ec * i64::from(d) >= segment_piece_size(p, i, m));
        }
    }
}
