use chrono::{DateTime, Utc};
use url::Url;

/// 32-bit rolling hash (`h = h * 31 + unit` over UTF-16 code units), rendered
/// as the base-36 magnitude. Stable across runs so fallback ids stay put.
pub fn hash_string(input: &str) -> String {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32);
    }
    to_base36((hash as i64).unsigned_abs())
}

pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Placeholder id that stays the same for every call within one minute.
pub fn minute_bucket_id(now: DateTime<Utc>) -> String {
    let minutes = now.timestamp_millis().max(0) as u64 / 60_000;
    format!("temp-{}", to_base36(minutes))
}

/// Value of query parameter `name` in `url`, if present and non-empty.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hash_matches_known_values() {
        assert_eq!(hash_string(""), "0");
        // "a" -> 97
        assert_eq!(hash_string("a"), "2p");
        // "ab" -> 97 * 31 + 98 = 3105
        assert_eq!(hash_string("ab"), "2e9");
    }

    #[test]
    fn hash_is_deterministic() {
        let a = hash_string("Song-Artist");
        let b = hash_string("Song-Artist");
        assert_eq!(a, b);
        assert_ne!(a, hash_string("Song-Other"));
    }

    #[test]
    fn minute_bucket_is_stable_within_a_minute() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 55).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 31, 0).unwrap();
        assert_eq!(minute_bucket_id(t1), minute_bucket_id(t2));
        assert_ne!(minute_bucket_id(t1), minute_bucket_id(t3));
        assert!(minute_bucket_id(t1).starts_with("temp-"));
    }

    #[test]
    fn query_param_reads_values() {
        let url = "https://music.youtube.com/watch?v=abc123&list=PL9";
        assert_eq!(query_param(url, "v").as_deref(), Some("abc123"));
        assert_eq!(query_param(url, "list").as_deref(), Some("PL9"));
        assert_eq!(query_param(url, "t"), None);
        assert_eq!(query_param("not a url", "v"), None);
    }
}
