//! Tolerant HTTP date parsing. Accepts the three RFC-recognized forms thttpd
//! accepted: RFC 1123 (`Sun, 06 Nov 1994 08:49:37 GMT`), RFC 850
//! (`Sunday, 06-Nov-94 08:49:37 GMT`), and asctime
//! (`Sun Nov  6 08:49:37 1994`). Anything else yields the sentinel `-1`
//! rather than an error, matching thttpd's `tdate_parse`.

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Returns seconds since the Unix epoch, or `-1` if `s` doesn't match any
/// recognized form.
pub fn parse_http_date(s: &str) -> i64 {
    let s = s.trim();
    parse_rfc1123(s)
        .or_else(|| parse_rfc850(s))
        .or_else(|| parse_asctime(s))
        .unwrap_or(-1)
}

fn month_index(name: &str) -> Option<i64> {
    MONTHS.iter().position(|m| m.eq_ignore_ascii_case(name)).map(|i| i as i64)
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    // Howard Hinnant's days-from-civil algorithm (proleptic Gregorian).
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn to_epoch(year: i64, month: i64, day: i64, hour: i64, min: i64, sec: i64) -> i64 {
    days_from_civil(year, month, day) * 86400 + hour * 3600 + min * 60 + sec
}

fn parse_rfc1123(s: &str) -> Option<i64> {
    // "Sun, 06 Nov 1994 08:49:37 GMT"
    let rest = s.split_once(',')?.1.trim();
    let mut it = rest.split_whitespace();
    let day: i64 = it.next()?.parse().ok()?;
    let month = month_index(it.next()?)?;
    let year: i64 = it.next()?.parse().ok()?;
    let time = it.next()?;
    let (h, m, sec) = parse_hms(time)?;
    Some(to_epoch(year, month + 1, day, h, m, sec))
}

fn parse_rfc850(s: &str) -> Option<i64> {
    // "Sunday, 06-Nov-94 08:49:37 GMT"
    let rest = s.split_once(',')?.1.trim();
    let mut it = rest.split_whitespace();
    let dmy = it.next()?;
    let time = it.next()?;
    let mut parts = dmy.split('-');
    let day: i64 = parts.next()?.parse().ok()?;
    let month = month_index(parts.next()?)?;
    let year_2d: i64 = parts.next()?.parse().ok()?;
    let year = if year_2d < 70 { 2000 + year_2d } else { 1900 + year_2d };
    let (h, m, sec) = parse_hms(time)?;
    Some(to_epoch(year, month + 1, day, h, m, sec))
}

fn parse_asctime(s: &str) -> Option<i64> {
    // "Sun Nov  6 08:49:37 1994"
    let mut it = s.split_whitespace();
    let _weekday = it.next()?;
    let month = month_index(it.next()?)?;
    let day: i64 = it.next()?.parse().ok()?;
    let time = it.next()?;
    let year: i64 = it.next()?.parse().ok()?;
    let (h, m, sec) = parse_hms(time)?;
    Some(to_epoch(year, month + 1, day, h, m, sec))
}

fn parse_hms(s: &str) -> Option<(i64, i64, i64)> {
    let mut it = s.split(':');
    let h: i64 = it.next()?.parse().ok()?;
    let m: i64 = it.next()?.parse().ok()?;
    let sec: i64 = it.next()?.parse().ok()?;
    Some((h, m, sec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1123() {
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), 784111777);
    }

    #[test]
    fn rfc850() {
        assert_eq!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), 784111777);
    }

    #[test]
    fn asctime() {
        assert_eq!(parse_http_date("Sun Nov  6 08:49:37 1994"), 784111777);
    }

    #[test]
    fn garbage_is_sentinel() {
        assert_eq!(parse_http_date("not a date"), -1);
    }
}
