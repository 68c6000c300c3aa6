//! `Range:` header parsing. Only the single-range `bytes=N-` and
//! `bytes=N-M` forms thttpd supports are accepted; a comma (multiple
//! ranges requested) disables ranging entirely and the request is served
//! as a normal 200.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Parses a `Range` header value against a resource of `file_size` bytes.
/// Returns `None` if ranging doesn't apply (header absent, malformed,
/// multi-range, or out of bounds) — callers fall back to a full 200.
pub fn parse_range(header_value: &str, file_size: u64) -> Option<ByteRange> {
    let spec = header_value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    if file_size == 0 {
        return None;
    }
    let start: u64 = start_s.trim().parse().ok()?;
    let end: u64 = if end_s.trim().is_empty() {
        file_size - 1
    } else {
        end_s.trim().parse().ok()?
    };
    if start > end || end >= file_size {
        return None;
    }
    Some(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_ended() {
        assert_eq!(parse_range("bytes=10-", 100), Some(ByteRange { start: 10, end: 99 }));
    }

    #[test]
    fn bounded() {
        assert_eq!(parse_range("bytes=10-19", 100), Some(ByteRange { start: 10, end: 19 }));
    }

    #[test]
    fn multi_range_disables() {
        assert_eq!(parse_range("bytes=0-10,20-30", 100), None);
    }

    #[test]
    fn out_of_bounds() {
        assert_eq!(parse_range("bytes=200-300", 100), None);
        assert_eq!(parse_range("bytes=50-10", 100), None);
    }

    #[test]
    fn missing_prefix() {
        assert_eq!(parse_range("10-20", 100), None);
    }
}
